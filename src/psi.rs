use super::{CrcDigest, Error, ErrorDetails, Result, SliceReader, CRC};
use crate::read_bitfield;
use log::{debug, warn};
use modular_bitfield_msb::prelude::*;
use std::convert::TryInto;

/// Leading three bytes of every PSI section.
#[bitfield]
#[derive(Debug, Clone)]
pub struct SectionHeader {
    pub table_id: B8,
    pub section_syntax_indicator: bool,
    pub private_indicator: bool,
    pub reserved_bits: B2,
    #[skip]
    pub unused_bits: B2,
    pub section_length: B10,
}

/// Table syntax bytes present when the syntax indicator is set.
#[bitfield]
#[derive(Debug, Clone)]
pub struct TableSyntax {
    pub table_id_extension: B16,
    pub reserved_bits: B2,
    pub version: B5,
    pub current_next_indicator: bool,
    pub section_num: B8,
    pub last_section_num: B8,
}

/// One reassembled, CRC-validated PSI section.
///
/// `payload` holds the bytes between the table syntax and the trailing CRC.
#[derive(Debug, Clone)]
pub struct Section {
    pub header: SectionHeader,
    pub syntax: TableSyntax,
    pub payload: Vec<u8>,
}

impl Section {
    pub fn table_id(&self) -> u8 {
        self.header.table_id()
    }

    pub fn extension(&self) -> u16 {
        self.syntax.table_id_extension()
    }

    pub fn version(&self) -> u8 {
        self.syntax.version()
    }

    pub fn current_next(&self) -> bool {
        self.syntax.current_next_indicator()
    }

    pub fn section_num(&self) -> u8 {
        self.syntax.section_num()
    }

    pub fn last_section_num(&self) -> u8 {
        self.syntax.last_section_num()
    }
}

struct PartialSection {
    header: SectionHeader,
    syntax: TableSyntax,
    /* payload and CRC bytes collected so far */
    data: Vec<u8>,
    remaining: usize,
    hasher: CrcDigest,
}

impl PartialSection {
    fn append(&mut self, reader: &mut SliceReader) -> Result<bool> {
        if reader.remaining_len() < self.remaining {
            self.remaining -= reader.remaining_len();
            self.data.extend_from_slice(reader.read_to_end()?);
            Ok(false)
        } else {
            let wanted = self.remaining;
            self.data.extend_from_slice(reader.read(wanted)?);
            self.remaining = 0;
            Ok(true)
        }
    }

    fn finish(mut self) -> Result<Section> {
        /* Validate using CRC32 */
        let len_minus_crc = self.data.len() - 4;
        self.hasher.update(&self.data[..len_minus_crc]);
        let actual_hash = self.hasher.finalize();
        let expected_hash = u32::from_be_bytes(
            self.data[len_minus_crc..]
                .try_into()
                .expect("four CRC bytes"),
        );
        if expected_hash != actual_hash {
            return Err(Error::new(0, ErrorDetails::SectionCrcMismatch));
        }
        self.data.truncate(len_minus_crc);
        Ok(Section {
            header: self.header,
            syntax: self.syntax,
            payload: self.data,
        })
    }
}

/// Incremental PSI section reassembler for one PID.
///
/// Fed the payload of each packet on its PID, it handles the pointer field,
/// sections spanning packets, and several sections packed into one packet,
/// emitting only sections whose CRC checks out.
#[derive(Default)]
pub struct SectionAssembler {
    partial: Option<PartialSection>,
}

impl SectionAssembler {
    pub fn new() -> Self {
        Self { partial: None }
    }

    /// Drop any partially assembled section.
    pub fn reset(&mut self) {
        self.partial = None;
    }

    /// Feed the PSI payload of one packet. Completed sections are pushed to
    /// `out` in stream order.
    pub fn feed(&mut self, pusi: bool, payload: &[u8], out: &mut Vec<Section>) {
        let mut reader = SliceReader::new(payload);
        if let Err(e) = self.feed_inner(pusi, &mut reader, out) {
            match e.details {
                ErrorDetails::SectionCrcMismatch => {
                    warn!("section CRC mismatch, dropping section")
                }
                _ => warn!("malformed section data at byte {}: {:?}", e.location, e.details),
            }
            self.partial = None;
        }
    }

    fn feed_inner(
        &mut self,
        pusi: bool,
        reader: &mut SliceReader,
        out: &mut Vec<Section>,
    ) -> Result<()> {
        if !pusi {
            /* continuation only; a section may not start without a pointer */
            if let Some(partial) = self.partial.as_mut() {
                if partial.append(reader)? {
                    let partial = self.partial.take().expect("partial just appended");
                    out.push(partial.finish()?);
                }
            }
            return Ok(());
        }

        let pointer = reader.read_u8()? as usize;
        match self.partial.take() {
            Some(mut partial) if partial.remaining <= pointer => {
                let mut tail = reader.new_sub_reader(pointer)?;
                if partial.append(&mut tail)? {
                    out.push(partial.finish()?);
                }
            }
            Some(_) => {
                /* the new unit start preempts an unfinished section */
                debug!("discarding unfinished section at unit start");
                reader.skip(pointer)?;
            }
            None => reader.skip(pointer)?,
        }

        while reader.remaining_len() > 0 && reader.peek(1)?[0] != 0xff {
            if !self.start_section(reader, out)? {
                break;
            }
        }
        Ok(())
    }

    /// Parse one section header at the reader and collect as much of its body
    /// as the packet holds. Returns whether the section completed within this
    /// packet (allowing another to follow).
    fn start_section(&mut self, reader: &mut SliceReader, out: &mut Vec<Section>) -> Result<bool> {
        if reader.remaining_len() < 3 {
            warn!("short read of section header");
            return Err(reader.make_error(ErrorDetails::BadSectionHeader));
        }
        let mut hasher = CRC.digest();
        let header_bytes = reader.read_array_ref::<3>()?;
        hasher.update(header_bytes);
        let header = SectionHeader::from_bytes(*header_bytes);
        let section_length = header.section_length() as usize;

        if !header.section_syntax_indicator() {
            /* short-form private sections carry nothing we decode */
            debug!("skipping section without table syntax");
            let skip = section_length.min(reader.remaining_len());
            reader.skip(skip)?;
            return Ok(skip == section_length);
        }
        if section_length < 5 + 4 {
            /* must cover the table syntax and the CRC32 */
            warn!("insufficient section length {}", section_length);
            return Err(reader.make_error(ErrorDetails::BadSectionHeader));
        }
        if reader.remaining_len() < 5 {
            warn!("short read of table syntax");
            return Err(reader.make_error(ErrorDetails::BadSectionHeader));
        }
        let syntax_bytes = reader.read_array_ref::<5>()?;
        hasher.update(syntax_bytes);
        let syntax = TableSyntax::from_bytes(*syntax_bytes);

        let body_length = section_length - 5;
        let mut partial = PartialSection {
            header,
            syntax,
            data: Vec::with_capacity(body_length),
            remaining: body_length,
            hasher,
        };
        if partial.append(reader)? {
            out.push(partial.finish()?);
            Ok(true)
        } else {
            self.partial = Some(partial);
            Ok(false)
        }
    }
}
