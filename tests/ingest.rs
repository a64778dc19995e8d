//! End-to-end: a synthetic transport stream on disk goes through the full
//! pipeline (prober, dual-feed reader, PSI bank, state machine) into an
//! in-memory index.

use crc::{Crc, CRC_32_MPEG_2};
use std::fs;
use std::path::PathBuf;
use tsindex::probe::MpegTsProber;
use tsindex::reader::process_file;
use tsindex::store::Store;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);
const TS_PACKET_SIZE: usize = 188;

/// Serialize a complete single-part PSI section.
fn make_section(table_id: u8, extension: u16, version: u8, payload: &[u8]) -> Vec<u8> {
    let section_length = (5 + payload.len() + 4) as u16;
    let mut out = Vec::new();
    out.push(table_id);
    out.push(0xb0 | ((section_length >> 8) as u8));
    out.push(section_length as u8);
    out.extend_from_slice(&extension.to_be_bytes());
    out.push(0xc1 | (version << 1));
    out.push(0x00); /* section 0 */
    out.push(0x00); /* of 0 */
    out.extend_from_slice(payload);
    let crc = CRC32.checksum(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}

fn psi_packet(pid: u16, section: &[u8]) -> [u8; TS_PACKET_SIZE] {
    assert!(section.len() + 5 <= TS_PACKET_SIZE);
    let mut packet = [0xff_u8; TS_PACKET_SIZE];
    packet[0] = 0x47;
    packet[1] = 0x40 | ((pid >> 8) as u8);
    packet[2] = pid as u8;
    packet[3] = 0x10;
    packet[4] = 0x00; /* pointer field */
    packet[5..5 + section.len()].copy_from_slice(section);
    packet
}

fn pes_packet(pid: u16, stream_id: u8) -> [u8; TS_PACKET_SIZE] {
    let mut packet = [0xff_u8; TS_PACKET_SIZE];
    packet[0] = 0x47;
    packet[1] = 0x40 | ((pid >> 8) as u8);
    packet[2] = pid as u8;
    packet[3] = 0x10;
    packet[4..10].copy_from_slice(&[0x00, 0x00, 0x01, stream_id, 0x00, 0x00]);
    packet
}

/// PAT ts_id 1: program 1 -> PID 0x100.
fn pat_section() -> Vec<u8> {
    make_section(0x00, 1, 0, &[0x00, 0x01, 0xe1, 0x00])
}

/// PMT program 1: h264 video on 0x101, aac audio on 0x102 with a language
/// descriptor.
fn pmt_section() -> Vec<u8> {
    let mut payload = vec![0xe1, 0x01, 0xf0, 0x00];
    payload.extend_from_slice(&[0x1b, 0xe1, 0x01, 0xf0, 0x00]);
    payload.extend_from_slice(&[0x0f, 0xe1, 0x02, 0xf0, 0x06]);
    payload.extend_from_slice(&[0x0a, 0x04, b'e', b'n', b'g', 0x00]);
    make_section(0x02, 1, 0, &payload)
}

/// SDT for ts 1 on network 9 with one service named through a 0x48
/// descriptor (ISO 8859-5 selector on the name).
fn sdt_section() -> Vec<u8> {
    let mut payload = vec![0x00, 0x09, 0xff];
    payload.extend_from_slice(&[0x00, 0x65, 0xfc, 0x80, 0x0f]);
    payload.extend_from_slice(&[0x48, 0x0d, 0x01]);
    payload.extend_from_slice(&[0x04, b'p', b'r', b'o', b'v']);
    payload.extend_from_slice(&[0x06, 0x01, 0xba, 0xb8, 0xbd, 0xbe, 0x21]);
    make_section(0x42, 1, 0, &payload)
}

fn build_stream(duplicate_pats: usize) -> Vec<u8> {
    let mut data = Vec::new();
    for _ in 0..duplicate_pats {
        data.extend_from_slice(&psi_packet(0, &pat_section()));
    }
    data.extend_from_slice(&psi_packet(0x100, &pmt_section()));
    data.extend_from_slice(&pes_packet(0x101, 0xe0));
    data.extend_from_slice(&pes_packet(0x102, 0xc0));
    data.extend_from_slice(&psi_packet(0x11, &sdt_section()));
    data.extend_from_slice(&psi_packet(0, &pat_section()));
    data
}

struct TempStream {
    path: PathBuf,
}

impl TempStream {
    fn new(name: &str, contents: &[u8]) -> TempStream {
        let path = std::env::temp_dir().join(format!("tsindex-{}-{}", std::process::id(), name));
        fs::write(&path, contents).expect("temp stream written");
        TempStream { path }
    }
}

impl Drop for TempStream {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn store() -> Store {
    let store = Store::open_in_memory().expect("in-memory store");
    store.ensure_schema().expect("schema");
    store
}

#[test]
fn full_pipeline_indexes_psi_and_streams() {
    let stream = TempStream::new("full.ts", &build_stream(1));
    let store = store();
    let prober = MpegTsProber::default();
    process_file(&store, &prober, &stream.path).expect("file indexes");

    assert_eq!(store.count_rows("files").unwrap(), 1);
    assert_eq!(store.count_rows("pats").unwrap(), 1);
    assert_eq!(store.count_rows("pmts").unwrap(), 1);
    assert_eq!(store.count_rows("elem_streams").unwrap(), 2);
    assert_eq!(store.count_rows("lang_specs").unwrap(), 1);
    assert_eq!(store.count_rows("sdts").unwrap(), 1);
    assert_eq!(store.count_rows("services").unwrap(), 1);
    assert_eq!(store.count_rows("vid_streams").unwrap(), 1);
    assert_eq!(store.count_rows("aud_streams").unwrap(), 1);
}

#[test]
fn duplicate_pats_collapse_to_one_row() {
    let stream = TempStream::new("dup.ts", &build_stream(10));
    let store = store();
    let prober = MpegTsProber::default();
    process_file(&store, &prober, &stream.path).expect("file indexes");
    assert_eq!(store.count_rows("pats").unwrap(), 1);
}

#[test]
fn reindexing_same_file_inserts_nothing() {
    let stream = TempStream::new("again.ts", &build_stream(1));
    let store = store();
    let prober = MpegTsProber::default();
    process_file(&store, &prober, &stream.path).expect("first pass");
    process_file(&store, &prober, &stream.path).expect("second pass");
    assert_eq!(store.count_rows("files").unwrap(), 1);
    assert_eq!(store.count_rows("pats").unwrap(), 1);
    assert_eq!(store.count_rows("vid_streams").unwrap(), 1);
}

#[test]
fn garbage_file_is_not_a_transport_stream() {
    let stream = TempStream::new("garbage.ts", &vec![0x5a_u8; TS_PACKET_SIZE * 8]);
    let store = store();
    let prober = MpegTsProber::default();
    let err = process_file(&store, &prober, &stream.path).unwrap_err();
    assert!(matches!(err, tsindex::IndexError::NotATransportStream));
    assert_eq!(store.count_rows("files").unwrap(), 0);
}
