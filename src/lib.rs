//! Library for indexing DVB transport stream metadata into a relational store.
//!
//! The demultiplexing core reads a file once and feeds two consumers from the
//! same byte sequence: a container prober enumerating audio/video streams and
//! a bank of PID-filtered PSI section decoders. Decoded PAT/PMT/SDT/NIT
//! tables are deduplicated by version and written as parent/child rows to a
//! SQLite database.
//!
//! # Usage
//! ```sh
//! tsindex [-v VERBOSITY] index.db recordings/
//! ```

#![allow(unused)]
#![deny(unsafe_code)]

use crc::{Crc, Digest, CRC_32_MPEG_2};
use modular_bitfield_msb::prelude::*;
use std::fmt::{Debug, Formatter};
use std::result;
use thiserror::Error;

mod slice_reader;
pub use slice_reader::SliceReader;

mod framer;
pub use framer::PacketFramer;

pub mod psi;
pub use psi::{Section, SectionAssembler, SectionHeader, TableSyntax};

pub mod descriptors;
pub mod tables;
pub use tables::{NitTable, PatTable, PmtTable, SdtTable};

pub mod demux;
pub use demux::{PsiDecoderBank, PsiEvent};

pub mod dvbtext;
pub mod ingest;
pub mod logging;
pub mod probe;
pub mod reader;
pub mod store;

/// Size of one transport stream packet in bytes.
pub const TS_PACKET_SIZE: usize = 188;

/// Sync byte expected at the start of every TS packet.
pub const SYNC_BYTE: u8 = 0x47;

/// PID carrying null (stuffing) packets; never dispatched.
pub const NULL_PID: u16 = 0x1fff;

/// PID carrying the service description table.
pub const SDT_PID: u16 = 0x11;

/// Default PID for the network information table, used when the PAT does not
/// designate one via program number 0.
pub const NIT_PID: u16 = 0x10;

/// Table id of the SDT describing the actual (current) transport stream.
pub const SDT_CURRENT_TABLE_ID: u8 = 0x42;

/// Table id of the NIT describing the actual network.
pub const NIT_CURRENT_TABLE_ID: u8 = 0x40;

pub(crate) const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);
pub(crate) type CrcDigest = Digest<'static, u32>;

/// Errors that may be encountered while parsing transport stream packets and
/// PSI sections. Malformed input is dropped (and logged) by the decoder that
/// spots it; these values never cross a file boundary.
#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    /// Encountered when a [`SliceReader`] reads out of bounds.
    /// The [`usize`] parameter is the length of the offending read.
    PacketOverrun(usize),
    /// TS packet headers must contain a sync byte of 0x47.
    LostSync,
    /// Encountered for inconsistent adaptation field parses.
    BadAdaptationHeader,
    /// Encountered for inconsistent PSI section header parses.
    BadSectionHeader,
    /// Encountered when a reassembled section fails its CRC check.
    SectionCrcMismatch,
}

/// Parse error carrying the byte location within the offending packet.
#[derive(Debug)]
pub struct Error {
    /// Byte index within the packet that the error was encountered.
    pub location: usize,
    /// Information about the error.
    pub details: ErrorDetails,
}

impl Error {
    pub(crate) fn new(location: usize, details: ErrorDetails) -> Self {
        Self { location, details }
    }
}

/// [`std::result::Result`] alias that uses [`Error`].
pub type Result<T> = result::Result<T, Error>;

/// Application-level error for opening, probing, and indexing files.
///
/// [`IndexError::Store`] and [`IndexError::ForeignDatabase`] are fatal;
/// everything else is logged and the walk continues with the next file.
#[derive(Error, Debug)]
pub enum IndexError {
    /// I/O failure on the input file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure reported by the SQLite store.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// The database file carries another application's id.
    #[error("database application id mismatch (found {found:#x})")]
    ForeignDatabase {
        /// Application id found in the store.
        found: i64,
    },

    /// The prober found no transport stream packets.
    #[error("not an MPEG transport stream")]
    NotATransportStream,
}

impl IndexError {
    /// True for errors that must terminate the whole run rather than skip the
    /// current file.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IndexError::Store(_) | IndexError::ForeignDatabase { .. }
        )
    }
}

/// TSC information used in a packet's payload.
#[repr(u8)]
#[derive(Debug, BitfieldSpecifier)]
#[bits = 2]
pub enum TransportScramblingControl {
    /// Not scrambled.
    NotScrambled,
    /// Do not use.
    Reserved,
    /// Scrambled with even key.
    ScrambledEvenKey,
    /// Scrambled with odd key.
    ScrambledOddKey,
}

/// Link-layer header found at the start of every 188-byte TS packet.
#[bitfield]
#[derive(Debug)]
pub struct PacketHeader {
    pub sync_byte: B8,
    pub tei: bool,
    pub pusi: bool,
    pub priority: bool,
    pub pid: B13,
    pub tsc: TransportScramblingControl,
    pub has_adaptation_field: bool,
    pub has_payload: bool,
    pub continuity_counter: B4,
}

/// Packets may carry adaptation meta data before the payload. Only the length
/// matters here; the PSI layer skips the field wholesale.
#[bitfield]
#[derive(Debug)]
pub struct AdaptationFieldHeader {
    pub length: B8,
    pub discontinuity: bool,
    pub random_access: bool,
    pub priority: bool,
    pub has_pcr: bool,
    pub has_opcr: bool,
    pub has_splice_countdown: bool,
    pub has_transport_private_data: bool,
    pub has_adaptation_field_extension: bool,
}

/// Extract the 13-bit PID from a raw packet without a full header parse.
pub(crate) fn packet_pid(packet: &[u8; TS_PACKET_SIZE]) -> u16 {
    u16::from_be_bytes([packet[1], packet[2]]) & 0x1fff
}
