use super::psi::{Section, SectionAssembler};
use super::tables::{NitTable, PatTable, PmtTable, SdtTable, TableBuilder};
use super::{
    AdaptationFieldHeader, ErrorDetails, PacketHeader, Result, SliceReader, NULL_PID, SYNC_BYTE,
    TS_PACKET_SIZE,
};
use crate::read_bitfield;
use enum_dispatch::enum_dispatch;
use log::{debug, warn};
use std::collections::HashMap;

/// Table id of the program association table.
pub const PAT_TABLE_ID: u8 = 0x00;
/// Table id of the program map table.
pub const PMT_TABLE_ID: u8 = 0x02;

/// Outcome of dispatching packets through the bank. Events are drained after
/// each [`PsiDecoderBank::push`], so filter-set mutations they trigger take
/// effect between packets and a newly attached filter never observes the
/// packet that caused its attachment.
#[derive(Debug)]
pub enum PsiEvent {
    /// A complete program association table.
    Pat(PatTable),
    /// A complete program map table.
    Pmt(PmtTable),
    /// A complete service description table.
    Sdt(SdtTable),
    /// A complete network information table.
    Nit(NitTable),
    /// A demultiplexed PID produced a section for a subtable nobody is
    /// attached to. The section rides along so an attaching consumer can
    /// process it via [`PsiDecoderBank::offer_section`].
    NewSubtable {
        pid: u16,
        table_id: u8,
        extension: u16,
        section: Section,
    },
}

#[enum_dispatch]
pub(crate) trait FilterState {
    fn pid(&self) -> u16;
    fn feed(&mut self, pusi: bool, payload: &[u8], events: &mut Vec<PsiEvent>);
}

#[enum_dispatch(FilterState)]
pub(crate) enum PsiFilter {
    Pat(PatFilter),
    Pmt(PmtFilter),
    Demux(DemuxFilter),
}

/// Fixed filter on PID 0 decoding the PAT.
pub(crate) struct PatFilter {
    assembler: SectionAssembler,
    builder: TableBuilder,
}

impl PatFilter {
    fn new() -> Self {
        Self {
            assembler: SectionAssembler::new(),
            builder: TableBuilder::new(),
        }
    }
}

impl FilterState for PatFilter {
    fn pid(&self) -> u16 {
        0
    }

    fn feed(&mut self, pusi: bool, payload: &[u8], events: &mut Vec<PsiEvent>) {
        let mut sections = Vec::new();
        self.assembler.feed(pusi, payload, &mut sections);
        for section in sections {
            if section.table_id() != PAT_TABLE_ID {
                continue;
            }
            if let Some(complete) = self.builder.push(section) {
                match PatTable::parse(&complete) {
                    Ok(pat) => events.push(PsiEvent::Pat(pat)),
                    Err(e) => warn!("dropping malformed PAT: {:?}", e.details),
                }
            }
        }
    }
}

/// Filter on a PAT-announced PID decoding the PMT of one program.
pub(crate) struct PmtFilter {
    pid: u16,
    program_number: u16,
    assembler: SectionAssembler,
    builder: TableBuilder,
}

impl PmtFilter {
    fn new(pid: u16, program_number: u16) -> Self {
        Self {
            pid,
            program_number,
            assembler: SectionAssembler::new(),
            builder: TableBuilder::new(),
        }
    }
}

impl FilterState for PmtFilter {
    fn pid(&self) -> u16 {
        self.pid
    }

    fn feed(&mut self, pusi: bool, payload: &[u8], events: &mut Vec<PsiEvent>) {
        let mut sections = Vec::new();
        self.assembler.feed(pusi, payload, &mut sections);
        for section in sections {
            if section.table_id() != PMT_TABLE_ID || section.extension() != self.program_number {
                continue;
            }
            if let Some(complete) = self.builder.push(section) {
                match PmtTable::parse(&complete) {
                    Ok(pmt) => events.push(PsiEvent::Pmt(pmt)),
                    Err(e) => warn!("dropping malformed PMT: {:?}", e.details),
                }
            }
        }
    }
}

/// Filter for PIDs multiplexing several subtables (SDT, NIT). Sections of
/// unattached (table_id, extension) pairs surface as
/// [`PsiEvent::NewSubtable`]; attached pairs are accumulated and decoded.
pub(crate) struct DemuxFilter {
    pid: u16,
    assembler: SectionAssembler,
    attached: Vec<(u8, u16)>,
    builders: HashMap<(u8, u16), TableBuilder>,
}

impl DemuxFilter {
    fn new(pid: u16) -> Self {
        Self {
            pid,
            assembler: SectionAssembler::new(),
            attached: Vec::new(),
            builders: HashMap::new(),
        }
    }

    fn attach_subtable(&mut self, table_id: u8, extension: u16) -> bool {
        let key = (table_id, extension);
        if self.attached.contains(&key) {
            return false;
        }
        self.attached.push(key);
        self.builders.insert(key, TableBuilder::new());
        true
    }

    fn detach_subtable(&mut self, table_id: u8, extension: u16) {
        let key = (table_id, extension);
        self.attached.retain(|k| *k != key);
        self.builders.remove(&key);
    }

    fn process_section(&mut self, section: Section, events: &mut Vec<PsiEvent>) {
        let key = (section.table_id(), section.extension());
        if !self.attached.contains(&key) {
            events.push(PsiEvent::NewSubtable {
                pid: self.pid,
                table_id: key.0,
                extension: key.1,
                section,
            });
            return;
        }
        let builder = self.builders.entry(key).or_insert_with(TableBuilder::new);
        if let Some(complete) = builder.push(section) {
            match key.0 {
                super::SDT_CURRENT_TABLE_ID => match SdtTable::parse(&complete) {
                    Ok(sdt) => events.push(PsiEvent::Sdt(sdt)),
                    Err(e) => warn!("dropping malformed SDT: {:?}", e.details),
                },
                super::NIT_CURRENT_TABLE_ID => match NitTable::parse(&complete) {
                    Ok(nit) => events.push(PsiEvent::Nit(nit)),
                    Err(e) => warn!("dropping malformed NIT: {:?}", e.details),
                },
                other => debug!("no decoder for attached table id {:#x}", other),
            }
        }
    }
}

impl FilterState for DemuxFilter {
    fn pid(&self) -> u16 {
        self.pid
    }

    fn feed(&mut self, pusi: bool, payload: &[u8], events: &mut Vec<PsiEvent>) {
        let mut sections = Vec::new();
        self.assembler.feed(pusi, payload, &mut sections);
        for section in sections {
            self.process_section(section, events);
        }
    }
}

/// Pool of PID-filtered PSI decoders.
///
/// `push` considers every filter whose PID matches the packet; completed
/// tables come back as [`PsiEvent`]s rather than nested callbacks, so the
/// consumer is free to attach and detach filters between packets.
#[derive(Default)]
pub struct PsiDecoderBank {
    filters: Vec<PsiFilter>,
}

impl PsiDecoderBank {
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
        }
    }

    /// Attach the PAT filter on PID 0. Idempotent.
    pub fn attach_pat(&mut self) {
        let exists = self
            .filters
            .iter()
            .any(|f| matches!(f, PsiFilter::Pat(_)));
        if !exists {
            self.filters.push(PatFilter::new().into());
        }
    }

    /// Attach a PMT filter for `program_number` on `pid`. Idempotent on the
    /// (pid, program) pair.
    pub fn attach_pmt(&mut self, pid: u16, program_number: u16) {
        let exists = self.filters.iter().any(|f| match f {
            PsiFilter::Pmt(p) => p.pid == pid && p.program_number == program_number,
            _ => false,
        });
        if !exists {
            self.filters.push(PmtFilter::new(pid, program_number).into());
        }
    }

    /// Attach a demultiplexing filter on `pid`. Idempotent.
    pub fn attach_demux(&mut self, pid: u16) {
        let exists = self.filters.iter().any(|f| match f {
            PsiFilter::Demux(d) => d.pid == pid,
            _ => false,
        });
        if !exists {
            self.filters.push(DemuxFilter::new(pid).into());
        }
    }

    /// Attach a subtable decoder within the demux filter on `pid`. Returns
    /// false when no demux filter covers the PID or the (table_id,
    /// extension) pair is already attached.
    pub fn attach_subtable(&mut self, pid: u16, table_id: u8, extension: u16) -> bool {
        for filter in &mut self.filters {
            if let PsiFilter::Demux(d) = filter {
                if d.pid == pid {
                    return d.attach_subtable(table_id, extension);
                }
            }
        }
        false
    }

    /// Tear down one demultiplexed subtable decoder; the demux filter itself
    /// stays attached.
    pub fn detach_subtable(&mut self, pid: u16, table_id: u8, extension: u16) {
        for filter in &mut self.filters {
            if let PsiFilter::Demux(d) = filter {
                if d.pid == pid {
                    d.detach_subtable(table_id, extension);
                }
            }
        }
    }

    /// Tear down the demultiplexing filter on `pid` along with every
    /// subtable attached within it.
    pub fn detach_demux(&mut self, pid: u16) {
        self.filters.retain(|f| match f {
            PsiFilter::Demux(d) => d.pid != pid,
            _ => true,
        });
    }

    /// Hand a ready-made section to the demux filter on `pid`, typically the
    /// one that rode along in a [`PsiEvent::NewSubtable`] just acted upon.
    pub fn offer_section(&mut self, pid: u16, section: Section, events: &mut Vec<PsiEvent>) {
        for filter in &mut self.filters {
            if let PsiFilter::Demux(d) = filter {
                if d.pid == pid {
                    d.process_section(section, events);
                    return;
                }
            }
        }
    }

    /// Tear down every PMT filter; their decoder state is destroyed and no
    /// further PMT events can originate from them.
    pub fn detach_pmt_filters(&mut self) {
        self.filters.retain(|f| !matches!(f, PsiFilter::Pmt(_)));
    }

    /// Tear down every filter and demultiplexed subtable.
    pub fn detach_all(&mut self) {
        self.filters.clear();
    }

    #[cfg(test)]
    pub(crate) fn filter_count(&self) -> usize {
        self.filters.len()
    }

    /// Dispatch one framed packet to every filter whose PID matches.
    ///
    /// Packets without the sync byte and null packets are dropped here; the
    /// framer upstream does framing only.
    pub fn push(&mut self, packet: &[u8; TS_PACKET_SIZE], events: &mut Vec<PsiEvent>) {
        match Self::packet_payload(packet) {
            Ok(Some((pid, pusi, payload))) => {
                /* indexed iteration tolerates appends while dispatching */
                for i in 0..self.filters.len() {
                    if self.filters[i].pid() == pid {
                        self.filters[i].feed(pusi, payload, events);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => match e.details {
                ErrorDetails::LostSync => debug!("skipping packet without sync byte"),
                details => warn!("dropping undecodable packet: {:?}", details),
            },
        }
    }

    fn packet_payload(packet: &[u8; TS_PACKET_SIZE]) -> Result<Option<(u16, bool, &[u8])>> {
        let mut reader = SliceReader::new(&packet[..]);
        let header = read_bitfield!(reader, PacketHeader);
        if header.sync_byte() != SYNC_BYTE {
            return Err(reader.make_error(ErrorDetails::LostSync));
        }
        let pid = header.pid();

        /* Discard null packets early */
        if pid == NULL_PID {
            return Ok(None);
        }

        if header.has_adaptation_field() {
            let adaptation = read_bitfield!(reader, AdaptationFieldHeader);
            let adaptation_field_length = adaptation.length() as usize;
            if !(1..=183).contains(&adaptation_field_length) {
                warn!("bad adaptation field length");
                return Err(reader.make_error(ErrorDetails::BadAdaptationHeader));
            }
            reader.skip(adaptation_field_length - 1)?;
        }

        if !header.has_payload() {
            return Ok(None);
        }
        Ok(Some((pid, header.pusi(), reader.read_to_end()?)))
    }
}
