use super::descriptors::Descriptor;
use super::psi::Section;
use super::{Result, SliceReader};
use crate::read_bitfield;
use log::warn;
use modular_bitfield_msb::prelude::*;
use smallvec::SmallVec;

#[bitfield]
#[derive(Debug)]
pub struct PatEntry {
    pub program_num: B16,
    pub reserved: B3,
    pub program_map_pid: B13,
}

#[bitfield]
#[derive(Debug)]
pub struct PmtHeader {
    pub reserved: B3,
    pub pcr_pid: B13,
    pub reserved2: B4,
    #[skip]
    pub unused_bits: B2,
    pub program_info_length: B10,
}

#[bitfield]
#[derive(Debug)]
pub struct EsInfoHeader {
    pub stream_type: B8,
    pub reserved: B3,
    pub elementary_pid: B13,
    pub reserved2: B4,
    #[skip]
    pub unused_bits: B2,
    pub es_info_length: B10,
}

#[bitfield]
#[derive(Debug)]
pub struct SdtServiceHeader {
    pub service_id: B16,
    pub reserved: B6,
    pub eit_schedule: bool,
    pub eit_present_following: bool,
    pub running_status: B3,
    pub free_ca_mode: bool,
    pub descriptors_loop_length: B12,
}

#[bitfield]
#[derive(Debug)]
struct NitLoopHeader {
    reserved: B4,
    descriptors_length: B12,
}

#[bitfield]
#[derive(Debug)]
struct NitTsHeader {
    ts_id: B16,
    original_network_id: B16,
    reserved: B4,
    descriptors_length: B12,
}

/// One program association from the PAT.
#[derive(Debug, Clone, PartialEq)]
pub struct PatProgram {
    pub number: u16,
    pub pmt_pid: u16,
}

/// Program association table. Program number 0, when present, designates the
/// network information PID rather than a program.
#[derive(Debug, Clone)]
pub struct PatTable {
    pub ts_id: u16,
    pub version: u8,
    pub current_next: bool,
    pub programs: Vec<PatProgram>,
}

impl PatTable {
    /// Two PAT instances are the same broadcast iff all three identity
    /// fields match.
    pub fn same_instance(&self, other: &PatTable) -> bool {
        self.ts_id == other.ts_id
            && self.version == other.version
            && self.current_next == other.current_next
    }

    /// PID designated for the NIT via program number 0.
    pub fn nit_pid(&self) -> Option<u16> {
        self.programs
            .iter()
            .find(|p| p.number == 0)
            .map(|p| p.pmt_pid)
    }

    /// Real programs, excluding the program-0 NIT designation.
    pub fn real_programs(&self) -> impl Iterator<Item = &PatProgram> {
        self.programs.iter().filter(|p| p.number != 0)
    }

    pub(crate) fn parse(sections: &[Section]) -> Result<PatTable> {
        let first = &sections[0];
        let mut programs = Vec::new();
        for section in sections {
            let mut reader = SliceReader::new(&section.payload);
            while reader.remaining_len() >= 4 {
                let entry = read_bitfield!(reader, PatEntry);
                programs.push(PatProgram {
                    number: entry.program_num(),
                    pmt_pid: entry.program_map_pid(),
                });
            }
        }
        Ok(PatTable {
            ts_id: first.extension(),
            version: first.version(),
            current_next: first.current_next(),
            programs,
        })
    }
}

/// One elementary stream from a PMT.
#[derive(Debug, Clone)]
pub struct EsInfo {
    pub stream_type: u8,
    pub pid: u16,
    pub descriptors: SmallVec<[Descriptor; 4]>,
}

/// Program map table for one program.
#[derive(Debug, Clone)]
pub struct PmtTable {
    pub program_number: u16,
    pub version: u8,
    pub current_next: bool,
    pub pcr_pid: u16,
    pub descriptors: Vec<Descriptor>,
    pub streams: Vec<EsInfo>,
}

impl PmtTable {
    /// Replacement rule: the stored copy stands while version and
    /// current_next both match.
    pub fn should_discard(&self, incoming: &PmtTable) -> bool {
        self.version == incoming.version && self.current_next == incoming.current_next
    }

    pub(crate) fn parse(sections: &[Section]) -> Result<PmtTable> {
        let mut pcr_pid = 0;
        let mut descriptors = Vec::new();
        let mut streams = Vec::new();
        for (i, section) in sections.iter().enumerate() {
            let mut reader = SliceReader::new(&section.payload);
            let header = read_bitfield!(reader, PmtHeader);
            let mut info_reader = reader.new_sub_reader(header.program_info_length() as usize)?;
            if i == 0 {
                pcr_pid = header.pcr_pid();
                descriptors = Descriptor::read_loop(&mut info_reader)?;
            }
            while reader.remaining_len() > 0 {
                let es_header = read_bitfield!(reader, EsInfoHeader);
                let mut es_reader = reader.new_sub_reader(es_header.es_info_length() as usize)?;
                let mut es_info = EsInfo {
                    stream_type: es_header.stream_type(),
                    pid: es_header.elementary_pid(),
                    descriptors: SmallVec::new(),
                };
                while es_reader.remaining_len() > 0 {
                    es_info
                        .descriptors
                        .push(Descriptor::new_from_reader(&mut es_reader)?);
                }
                streams.push(es_info);
            }
        }
        let first = &sections[0];
        Ok(PmtTable {
            program_number: first.extension(),
            version: first.version(),
            current_next: first.current_next(),
            pcr_pid,
            descriptors,
            streams,
        })
    }
}

/// One service announcement from an SDT.
#[derive(Debug, Clone)]
pub struct SdtService {
    pub service_id: u16,
    pub running_status: u8,
    pub free_ca: bool,
    pub descriptors: Vec<Descriptor>,
}

/// Service description table for the transport stream named by `ts_id`.
#[derive(Debug, Clone)]
pub struct SdtTable {
    pub ts_id: u16,
    pub network_id: u16,
    pub version: u8,
    pub current_next: bool,
    pub services: Vec<SdtService>,
}

impl SdtTable {
    pub fn should_discard(&self, incoming: &SdtTable) -> bool {
        self.version == incoming.version && self.current_next == incoming.current_next
    }

    pub(crate) fn parse(sections: &[Section]) -> Result<SdtTable> {
        let first = &sections[0];
        let mut network_id = 0;
        let mut services = Vec::new();
        for (i, section) in sections.iter().enumerate() {
            let mut reader = SliceReader::new(&section.payload);
            let onid = reader.read_be_u16()?;
            reader.skip(1)?; /* reserved_future_use */
            if i == 0 {
                network_id = onid;
            }
            while reader.remaining_len() > 0 {
                let header = read_bitfield!(reader, SdtServiceHeader);
                let mut dr_reader =
                    reader.new_sub_reader(header.descriptors_loop_length() as usize)?;
                services.push(SdtService {
                    service_id: header.service_id(),
                    running_status: header.running_status(),
                    free_ca: header.free_ca_mode(),
                    descriptors: Descriptor::read_loop(&mut dr_reader)?,
                });
            }
        }
        Ok(SdtTable {
            ts_id: first.extension(),
            network_id,
            version: first.version(),
            current_next: first.current_next(),
            services,
        })
    }
}

/// One transport stream entry from a NIT.
#[derive(Debug, Clone)]
pub struct NitTransport {
    pub ts_id: u16,
    pub original_network_id: u16,
    pub descriptors: Vec<Descriptor>,
}

/// Network information table.
#[derive(Debug, Clone)]
pub struct NitTable {
    pub network_id: u16,
    pub version: u8,
    pub current_next: bool,
    pub descriptors: Vec<Descriptor>,
    pub transports: Vec<NitTransport>,
}

impl NitTable {
    pub fn should_discard(&self, incoming: &NitTable) -> bool {
        self.version == incoming.version && self.current_next == incoming.current_next
    }

    pub(crate) fn parse(sections: &[Section]) -> Result<NitTable> {
        let first = &sections[0];
        let mut descriptors = Vec::new();
        let mut transports = Vec::new();
        for (i, section) in sections.iter().enumerate() {
            let mut reader = SliceReader::new(&section.payload);
            let network_loop = read_bitfield!(reader, NitLoopHeader);
            let mut dr_reader = reader.new_sub_reader(network_loop.descriptors_length() as usize)?;
            let network_descriptors = Descriptor::read_loop(&mut dr_reader)?;
            if i == 0 {
                descriptors = network_descriptors;
            }
            let ts_loop = read_bitfield!(reader, NitLoopHeader);
            let mut ts_reader = reader.new_sub_reader(ts_loop.descriptors_length() as usize)?;
            while ts_reader.remaining_len() > 0 {
                let ts_header = read_bitfield!(ts_reader, NitTsHeader);
                let mut ts_dr_reader =
                    ts_reader.new_sub_reader(ts_header.descriptors_length() as usize)?;
                transports.push(NitTransport {
                    ts_id: ts_header.ts_id(),
                    original_network_id: ts_header.original_network_id(),
                    descriptors: Descriptor::read_loop(&mut ts_dr_reader)?,
                });
            }
        }
        Ok(NitTable {
            network_id: first.extension(),
            version: first.version(),
            current_next: first.current_next(),
            descriptors,
            transports,
        })
    }
}

/// Gathers the sections of one table version until the set 0..=last is
/// complete, then hands the set out for parsing.
///
/// A complete set resets the builder, so a table repeated in the stream is
/// handed out again each time; deduplication against the stored copy happens
/// downstream. A version change throws away any partial set.
pub struct TableBuilder {
    version: Option<u8>,
    current_next: bool,
    sections: Vec<Option<Section>>,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self {
            version: None,
            current_next: false,
            sections: Vec::new(),
        }
    }

    pub fn push(&mut self, section: Section) -> Option<Vec<Section>> {
        let last = section.last_section_num() as usize;
        let num = section.section_num() as usize;
        if num > last {
            warn!(
                "section number {} beyond last {} for table {:#x}",
                num,
                last,
                section.table_id()
            );
            return None;
        }
        let restart = self.version != Some(section.version())
            || self.current_next != section.current_next()
            || self.sections.len() != last + 1;
        if restart {
            self.version = Some(section.version());
            self.current_next = section.current_next();
            self.sections.clear();
            self.sections.resize_with(last + 1, || None);
        }
        self.sections[num] = Some(section);
        if self.sections.iter().all(Option::is_some) {
            let complete = self
                .sections
                .drain(..)
                .map(|s| s.expect("all sections present"))
                .collect();
            self.version = None;
            Some(complete)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::testing::{make_section, make_section_part};
    use crate::psi::SectionAssembler;

    fn assemble(table_id: u8, extension: u16, version: u8, payload: &[u8]) -> Section {
        let bytes = make_section(table_id, extension, version, payload);
        let mut feed = vec![0_u8];
        feed.extend_from_slice(&bytes);
        let mut out = Vec::new();
        SectionAssembler::new().feed(true, &feed, &mut out);
        out.pop().expect("section assembles")
    }

    #[test]
    fn pat_parse_splits_nit_designation() {
        /* program 0 -> PID 0x10, program 1 -> PID 0x100 */
        let payload = [0x00, 0x00, 0xe0, 0x10, 0x00, 0x01, 0xe1, 0x00];
        let section = assemble(0x00, 1, 0, &payload);
        let pat = PatTable::parse(&[section]).unwrap();
        assert_eq!(pat.ts_id, 1);
        assert_eq!(pat.programs.len(), 2);
        assert_eq!(pat.nit_pid(), Some(0x10));
        let real: Vec<_> = pat.real_programs().collect();
        assert_eq!(real.len(), 1);
        assert_eq!(real[0].pmt_pid, 0x100);
    }

    #[test]
    fn pmt_parse_streams_and_descriptors() {
        let mut payload = vec![0xe1, 0xff, 0xf0, 0x00]; /* pcr 0x1ff, no program info */
        /* one video stream with an ISO 639 descriptor */
        payload.extend_from_slice(&[0x02, 0xe0, 0x65, 0xf0, 0x06]);
        payload.extend_from_slice(&[0x0a, 0x04, b'e', b'n', b'g', 0x00]);
        let section = assemble(0x02, 42, 5, &payload);
        let pmt = PmtTable::parse(&[section]).unwrap();
        assert_eq!(pmt.program_number, 42);
        assert_eq!(pmt.version, 5);
        assert_eq!(pmt.pcr_pid, 0x1ff);
        assert_eq!(pmt.streams.len(), 1);
        assert_eq!(pmt.streams[0].stream_type, 0x02);
        assert_eq!(pmt.streams[0].pid, 0x65);
        assert_eq!(pmt.streams[0].descriptors.len(), 1);
    }

    #[test]
    fn sdt_parse_services() {
        let mut payload = vec![0x00, 0x05, 0xff]; /* onid 5 */
        /* service 0x111, running 4, free_ca set, one empty service descriptor */
        payload.extend_from_slice(&[0x01, 0x11, 0xfc, 0x90, 0x04]);
        payload.extend_from_slice(&[0x48, 0x02, 0x01, 0x00]);
        let section = assemble(0x42, 9, 2, &payload);
        let sdt = SdtTable::parse(&[section]).unwrap();
        assert_eq!(sdt.ts_id, 9);
        assert_eq!(sdt.network_id, 5);
        assert_eq!(sdt.services.len(), 1);
        assert_eq!(sdt.services[0].service_id, 0x111);
        assert_eq!(sdt.services[0].running_status, 4);
        assert!(sdt.services[0].free_ca);
    }

    #[test]
    fn nit_parse_transports() {
        let mut payload = Vec::new();
        /* network descriptor loop: network name "N" */
        payload.extend_from_slice(&[0xf0, 0x03, 0x40, 0x01, b'N']);
        /* ts loop: one entry with a service list descriptor */
        payload.extend_from_slice(&[0xf0, 0x0b]);
        payload.extend_from_slice(&[0x00, 0x07, 0x00, 0x05, 0xf0, 0x05]);
        payload.extend_from_slice(&[0x41, 0x03, 0x00, 0x65, 0x01]);
        let section = assemble(0x40, 3, 1, &payload);
        let nit = NitTable::parse(&[section]).unwrap();
        assert_eq!(nit.network_id, 3);
        assert_eq!(nit.descriptors.len(), 1);
        assert_eq!(nit.transports.len(), 1);
        assert_eq!(nit.transports[0].ts_id, 7);
        assert_eq!(nit.transports[0].original_network_id, 5);
        assert_eq!(nit.transports[0].descriptors.len(), 1);
    }

    #[test]
    fn builder_waits_for_all_parts() {
        let mut builder = TableBuilder::new();
        let make = |num, last| {
            let bytes = make_section_part(0x42, 1, 0, num, last, &[num, 0xff, 0xff]);
            let mut feed = vec![0_u8];
            feed.extend_from_slice(&bytes);
            let mut out = Vec::new();
            SectionAssembler::new().feed(true, &feed, &mut out);
            out.pop().unwrap()
        };
        assert!(builder.push(make(1, 1)).is_none());
        let complete = builder.push(make(0, 1)).expect("both parts present");
        assert_eq!(complete.len(), 2);
        assert_eq!(complete[0].section_num(), 0);
        /* repeats re-accumulate from scratch */
        assert!(builder.push(make(0, 1)).is_none());
        assert!(builder.push(make(1, 1)).is_some());
    }

    #[test]
    fn builder_version_change_discards_partial() {
        let mut builder = TableBuilder::new();
        let make = |version, num, last| {
            let bytes = make_section_part(0x42, 1, version, num, last, &[0xaa]);
            let mut feed = vec![0_u8];
            feed.extend_from_slice(&bytes);
            let mut out = Vec::new();
            SectionAssembler::new().feed(true, &feed, &mut out);
            out.pop().unwrap()
        };
        assert!(builder.push(make(0, 0, 1)).is_none());
        assert!(builder.push(make(1, 1, 1)).is_none());
        /* version 1 part 0 now completes version 1, not version 0 */
        assert!(builder.push(make(1, 0, 1)).is_some());
    }
}
