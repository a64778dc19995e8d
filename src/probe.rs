//! Lightweight container prober enumerating audio/video elementary streams.
//!
//! The indexing pipeline treats the prober as a black box driving its own
//! reads and seeks through [`ProbeIo`]; the reader behind that trait feeds
//! every byte the prober touches to the PSI bank as a side effect. This
//! prober scans a window of packets from the start of the file, scrapes PAT
//! and PMT payloads for stream types, and falls back to PES start codes for
//! streams no PMT announces. It decodes no audio or video payload.

use crate::{packet_pid, NULL_PID, SYNC_BYTE, TS_PACKET_SIZE};
use log::{debug, info};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::collections::{HashMap, HashSet};
use std::io;

/// Origins for [`ProbeIo::seek`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Whence {
    Start,
    Current,
    End,
    /// Report the file size without moving.
    QuerySize,
}

/// The I/O surface the prober drives on its own schedule.
pub trait ProbeIo {
    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn seek(&mut self, offset: i64, whence: Whence) -> io::Result<u64>;
}

/// Probe failure modes.
#[derive(Debug)]
pub enum ProbeError {
    /// No transport stream packets within the probe window.
    NotATransportStream,
    /// The underlying reads failed.
    Io(io::Error),
}

impl From<io::Error> for ProbeError {
    fn from(e: io::Error) -> Self {
        ProbeError::Io(e)
    }
}

/// ISO 13818-1 / ATSC stream type assignments the prober can name.
#[derive(Debug, Copy, Clone, PartialEq, FromPrimitive)]
pub enum StreamType {
    Mpeg1Video = 0x01,
    Mpeg2Video = 0x02,
    Mpeg1Audio = 0x03,
    Mpeg2Audio = 0x04,
    AdtsAac = 0x0f,
    Mpeg4Video = 0x10,
    LatmAac = 0x11,
    H264 = 0x1b,
    Hevc = 0x24,
    Ac3 = 0x81,
    Eac3 = 0x87,
    Vc1 = 0xea,
}

impl StreamType {
    fn kind(self) -> StreamKind {
        match self {
            StreamType::Mpeg1Video
            | StreamType::Mpeg2Video
            | StreamType::Mpeg4Video
            | StreamType::H264
            | StreamType::Hevc
            | StreamType::Vc1 => StreamKind::Video,
            StreamType::Mpeg1Audio
            | StreamType::Mpeg2Audio
            | StreamType::AdtsAac
            | StreamType::LatmAac
            | StreamType::Ac3
            | StreamType::Eac3 => StreamKind::Audio,
        }
    }

    fn codec_name(self) -> &'static str {
        match self {
            StreamType::Mpeg1Video => "mpeg1video",
            StreamType::Mpeg2Video => "mpeg2video",
            StreamType::Mpeg1Audio | StreamType::Mpeg2Audio => "mp3",
            StreamType::AdtsAac => "aac",
            StreamType::Mpeg4Video => "mpeg4",
            StreamType::LatmAac => "aac_latm",
            StreamType::H264 => "h264",
            StreamType::Hevc => "hevc",
            StreamType::Ac3 => "ac3",
            StreamType::Eac3 => "eac3",
            StreamType::Vc1 => "vc1",
        }
    }
}

/// Audio/video classification of a probed stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamKind {
    Video,
    Audio,
}

/// One elementary stream as observed by the prober. `id` is the id as
/// reported by the prober, which for this prober is the TS PID.
#[derive(Debug)]
pub struct ProbedStream {
    pub id: u16,
    pub kind: StreamKind,
    pub codec: Option<&'static str>,
}

/// Everything the prober learned about a file.
#[derive(Debug, Default)]
pub struct ProbeSummary {
    pub streams: Vec<ProbedStream>,
}

fn is_pes_start(b: &[u8]) -> bool {
    b.len() >= 4 && b[0] == 0 && b[1] == 0 && b[2] == 1
}

/// A container prober drives [`ProbeIo`] on its own schedule and reports
/// the elementary streams it saw.
pub trait ContainerProber {
    fn probe(&self, io: &mut dyn ProbeIo) -> Result<ProbeSummary, ProbeError>;
}

/// Built-in MPEG-TS prober.
pub struct MpegTsProber {
    /// Upper bound of packets inspected from the start of the file.
    probe_window: usize,
}

impl Default for MpegTsProber {
    fn default() -> Self {
        Self { probe_window: 2048 }
    }
}

struct ScanState {
    pmt_pids: HashMap<u16, u16>,
    es_types: HashMap<u16, u8>,
    pes_kinds: HashMap<u16, StreamKind>,
    /// PMT pids whose section has actually been scraped; a repeating PMT
    /// must not satisfy the scan for programs still unseen.
    pmts_scraped: HashSet<u16>,
}

impl MpegTsProber {
    pub fn new(probe_window: usize) -> Self {
        Self { probe_window }
    }

    /// Drive `io` through the probe window and summarize the streams found.
    pub fn probe(&self, io: &mut dyn ProbeIo) -> Result<ProbeSummary, ProbeError> {
        let size = io.seek(0, Whence::QuerySize)?;
        if size < TS_PACKET_SIZE as u64 {
            return Err(ProbeError::NotATransportStream);
        }
        io.seek(0, Whence::Start)?;

        let mut state = ScanState {
            pmt_pids: HashMap::new(),
            es_types: HashMap::new(),
            pes_kinds: HashMap::new(),
            pmts_scraped: HashSet::new(),
        };
        let total_packets = (size / TS_PACKET_SIZE as u64) as usize;
        let window = total_packets.min(self.probe_window);
        let mut synced = 0_usize;
        let mut packet = [0_u8; TS_PACKET_SIZE];
        for _ in 0..window {
            if !read_full(io, &mut packet)? {
                break;
            }
            if packet[0] != SYNC_BYTE {
                continue;
            }
            synced += 1;
            self.scan_packet(&packet, &mut state);
            if state.scan_complete() {
                debug!("probe window satisfied after {} packets", synced);
                break;
            }
        }
        if synced == 0 {
            return Err(ProbeError::NotATransportStream);
        }

        let mut summary = ProbeSummary::default();
        for (&pid, &stream_type) in &state.es_types {
            match StreamType::from_u8(stream_type) {
                Some(st) => summary.streams.push(ProbedStream {
                    id: pid,
                    kind: st.kind(),
                    codec: Some(st.codec_name()),
                }),
                None => {
                    /* unnamed stream type: keep it if a PES start code told
                     * us what it carries */
                    if let Some(&kind) = state.pes_kinds.get(&pid) {
                        summary.streams.push(ProbedStream {
                            id: pid,
                            kind,
                            codec: None,
                        });
                    } else {
                        debug!("ignoring stream type {:#04x} on PID {:#x}", stream_type, pid);
                    }
                }
            }
        }
        for (&pid, &kind) in &state.pes_kinds {
            if !state.es_types.contains_key(&pid) {
                summary.streams.push(ProbedStream {
                    id: pid,
                    kind,
                    codec: None,
                });
            }
        }
        summary.streams.sort_by_key(|s| s.id);
        info!("probed {} elementary streams", summary.streams.len());
        Ok(summary)
    }

    fn scan_packet(&self, packet: &[u8; TS_PACKET_SIZE], state: &mut ScanState) {
        let pid = packet_pid(packet);
        if pid == NULL_PID {
            return;
        }
        let pusi = packet[1] & 0x40 != 0;
        let afc = (packet[3] >> 4) & 0x3;
        if afc & 0x1 == 0 {
            return; /* no payload */
        }
        let mut offset = 4;
        if afc & 0x2 != 0 {
            offset += 1 + packet[4] as usize;
        }
        if offset >= TS_PACKET_SIZE || !pusi {
            return;
        }
        let payload = &packet[offset..];

        if pid == 0 {
            Self::scrape_pat(payload, state);
        } else if state.pmt_pids.contains_key(&pid) {
            if Self::scrape_pmt(payload, state) {
                state.pmts_scraped.insert(pid);
            }
        } else if is_pes_start(payload) {
            let stream_id = payload[3];
            let kind = match stream_id {
                0xc0..=0xdf => Some(StreamKind::Audio),
                0xe0..=0xef => Some(StreamKind::Video),
                _ => None,
            };
            if let Some(kind) = kind {
                state.pes_kinds.entry(pid).or_insert(kind);
            }
        }
    }

    /// Best-effort PAT scrape; section integrity is the PSI bank's concern,
    /// not the prober's.
    fn scrape_pat(payload: &[u8], state: &mut ScanState) {
        let Some(section) = skip_pointer(payload) else {
            return;
        };
        if section.len() < 8 || section[0] != 0x00 {
            return;
        }
        let section_length = (u16::from_be_bytes([section[1], section[2]]) & 0x3ff) as usize;
        let end = (3 + section_length).min(section.len());
        /* program loop sits between the table syntax and the CRC */
        let mut pos = 8;
        while pos + 4 <= end.saturating_sub(4) {
            let program = u16::from_be_bytes([section[pos], section[pos + 1]]);
            let pmt_pid = u16::from_be_bytes([section[pos + 2], section[pos + 3]]) & 0x1fff;
            if program != 0 {
                state.pmt_pids.insert(pmt_pid, program);
            }
            pos += 4;
        }
    }

    fn scrape_pmt(payload: &[u8], state: &mut ScanState) -> bool {
        let Some(section) = skip_pointer(payload) else {
            return false;
        };
        if section.len() < 12 || section[0] != 0x02 {
            return false;
        }
        let section_length = (u16::from_be_bytes([section[1], section[2]]) & 0x3ff) as usize;
        let end = (3 + section_length).min(section.len()).saturating_sub(4);
        let program_info_length =
            (u16::from_be_bytes([section[10], section[11]]) & 0x3ff) as usize;
        let mut pos = 12 + program_info_length;
        while pos + 5 <= end {
            let stream_type = section[pos];
            let es_pid = u16::from_be_bytes([section[pos + 1], section[pos + 2]]) & 0x1fff;
            let es_info_length =
                (u16::from_be_bytes([section[pos + 3], section[pos + 4]]) & 0x3ff) as usize;
            state.es_types.insert(es_pid, stream_type);
            pos += 5 + es_info_length;
        }
        true
    }
}

impl ContainerProber for MpegTsProber {
    fn probe(&self, io: &mut dyn ProbeIo) -> Result<ProbeSummary, ProbeError> {
        MpegTsProber::probe(self, io)
    }
}

impl ScanState {
    fn scan_complete(&self) -> bool {
        !self.pmt_pids.is_empty() && self.pmts_scraped.len() >= self.pmt_pids.len()
    }
}

fn skip_pointer(payload: &[u8]) -> Option<&[u8]> {
    let pointer = *payload.first()? as usize;
    payload.get(1 + pointer..)
}

fn read_full(io: &mut dyn ProbeIo, buf: &mut [u8]) -> Result<bool, ProbeError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = io.read_into(&mut buf[filled..])?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}
