//! Per-file table state: deduplication, filter mutation, and row fan-out.
//!
//! One [`TableStateMachine`] exists per open file. It owns the decoder bank,
//! keeps the PSI tables retained for deduplication, and turns accepted
//! tables into parent/child rows on the store. All of that state dies with
//! the file.

use crate::demux::{PsiDecoderBank, PsiEvent};
use crate::descriptors;
use crate::dvbtext;
use crate::store::Store;
use crate::tables::{NitTable, PatTable, PmtTable, SdtTable};
use crate::{
    IndexError, NIT_CURRENT_TABLE_ID, NIT_PID, SDT_CURRENT_TABLE_ID, SDT_PID, TS_PACKET_SIZE,
};
use log::debug;

/// Decode a DVB text field, NULLing the column on failure.
fn decode_text(bytes: &[u8]) -> Option<String> {
    match dvbtext::decode(bytes) {
        Ok(text) => Some(text),
        Err(e) => {
            debug!("text field not decodable: {}", e);
            None
        }
    }
}

fn language_str(language: &[u8; 3]) -> String {
    String::from_utf8_lossy(language).into_owned()
}

/// State machine collecting the PSI tables of one file.
///
/// `Empty` until the first PAT is accepted, then `HavePat` until the file
/// closes; an accepted replacement PAT tears down all per-program decoding
/// state first.
pub struct TableStateMachine<'db> {
    store: &'db Store,
    file_name: String,
    file_size: u64,
    file_rowid: Option<i64>,
    pat_rowid: i64,
    current_pat: Option<PatTable>,
    current_pmts: Vec<PmtTable>,
    current_sdts: Vec<SdtTable>,
    current_nits: Vec<NitTable>,
    bank: PsiDecoderBank,
}

impl<'db> TableStateMachine<'db> {
    pub fn new(store: &'db Store, file_name: &str, file_size: u64) -> Self {
        let mut bank = PsiDecoderBank::new();
        bank.attach_pat();
        Self {
            store,
            file_name: file_name.to_owned(),
            file_size,
            file_rowid: None,
            pat_rowid: 0,
            current_pat: None,
            current_pmts: Vec::new(),
            current_sdts: Vec::new(),
            current_nits: Vec::new(),
            bank,
        }
    }

    /// Dispatch one framed packet through the bank and act on whatever
    /// tables completed. Store failures abort the file.
    pub fn feed_packet(&mut self, packet: &[u8; TS_PACKET_SIZE]) -> Result<(), IndexError> {
        let mut events = Vec::new();
        self.bank.push(packet, &mut events);
        for event in events {
            self.handle_event(event)?;
        }
        Ok(())
    }

    /// Row id of this file, registering the file on first demand.
    pub fn file_rowid(&mut self) -> Result<i64, IndexError> {
        match self.file_rowid {
            Some(rowid) => Ok(rowid),
            None => {
                let rowid = self.store.insert_file(&self.file_name, self.file_size)?;
                self.file_rowid = Some(rowid);
                Ok(rowid)
            }
        }
    }

    /// Whether any PSI table forced the file row into existence yet.
    pub fn has_file_row(&self) -> bool {
        self.file_rowid.is_some()
    }

    pub fn current_pat(&self) -> Option<&PatTable> {
        self.current_pat.as_ref()
    }

    fn handle_event(&mut self, event: PsiEvent) -> Result<(), IndexError> {
        match event {
            PsiEvent::Pat(pat) => self.on_pat(pat),
            PsiEvent::Pmt(pmt) => self.on_pmt(pmt),
            PsiEvent::Sdt(sdt) => self.on_sdt(sdt),
            PsiEvent::Nit(nit) => self.on_nit(nit),
            PsiEvent::NewSubtable {
                pid,
                table_id,
                extension,
                section,
            } => self.on_new_subtable(pid, table_id, extension, section),
        }
    }

    fn on_pat(&mut self, pat: PatTable) -> Result<(), IndexError> {
        if let Some(current) = &self.current_pat {
            if current.same_instance(&pat) {
                return Ok(());
            }
        }

        /* tear down everything derived from the previous PAT */
        self.bank.detach_pmt_filters();
        if let Some(previous) = &self.current_pat {
            self.bank
                .detach_subtable(SDT_PID, SDT_CURRENT_TABLE_ID, previous.ts_id);
            let old_nit_pid = previous.nit_pid().unwrap_or(NIT_PID);
            if old_nit_pid != pat.nit_pid().unwrap_or(NIT_PID) {
                self.bank.detach_demux(old_nit_pid);
            }
        }
        self.current_pmts.clear();
        self.current_sdts.clear();

        let file_rowid = self.file_rowid()?;
        self.pat_rowid = self.store.insert_pat(file_rowid, pat.ts_id, pat.version)?;

        for program in pat.real_programs() {
            self.bank.attach_pmt(program.pmt_pid, program.number);
        }
        self.bank.attach_demux(SDT_PID);
        self.bank.attach_demux(pat.nit_pid().unwrap_or(NIT_PID));
        self.current_pat = Some(pat);
        Ok(())
    }

    fn on_pmt(&mut self, pmt: PmtTable) -> Result<(), IndexError> {
        let stored = self
            .current_pmts
            .iter()
            .position(|p| p.program_number == pmt.program_number);
        if let Some(idx) = stored {
            if self.current_pmts[idx].should_discard(&pmt) {
                return Ok(());
            }
        }
        self.transact(|sm| sm.export_pmt_rows(&pmt))?;
        match stored {
            Some(idx) => self.current_pmts[idx] = pmt,
            None => self.current_pmts.push(pmt),
        }
        Ok(())
    }

    fn export_pmt_rows(&self, pmt: &PmtTable) -> Result<(), IndexError> {
        let pmt_rowid =
            self.store
                .insert_pmt(self.pat_rowid, pmt.program_number, pmt.version, pmt.pcr_pid)?;
        for es in &pmt.streams {
            let es_rowid = self
                .store
                .insert_elem_stream(pmt_rowid, es.stream_type, es.pid)?;
            for descriptor in &es.descriptors {
                match descriptor.tag {
                    descriptors::TAG_ISO639_LANGUAGE => {
                        for entry in descriptors::parse_iso639(descriptor).unwrap_or_default() {
                            self.store.insert_lang_spec(
                                es_rowid,
                                &language_str(&entry.language),
                                entry.audio_type,
                            )?;
                        }
                    }
                    descriptors::TAG_VBI_TELETEXT | descriptors::TAG_TELETEXT => {
                        for page in descriptors::parse_teletext(descriptor).unwrap_or_default() {
                            self.store.insert_ttx_page(
                                es_rowid,
                                &language_str(&page.language),
                                page.teletext_type,
                                page.magazine_number,
                                page.page_number,
                            )?;
                        }
                    }
                    descriptors::TAG_SUBTITLING => {
                        for entry in descriptors::parse_subtitling(descriptor).unwrap_or_default()
                        {
                            self.store.insert_subtitle_content(
                                es_rowid,
                                &language_str(&entry.language),
                                entry.subtitling_type,
                                entry.composition_page_id,
                                entry.ancillary_page_id,
                            )?;
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn on_new_subtable(
        &mut self,
        pid: u16,
        table_id: u8,
        extension: u16,
        section: crate::psi::Section,
    ) -> Result<(), IndexError> {
        let wanted = match table_id {
            SDT_CURRENT_TABLE_ID => match &self.current_pat {
                Some(pat) => pid == SDT_PID && extension == pat.ts_id,
                None => false,
            },
            NIT_CURRENT_TABLE_ID => pid != SDT_PID,
            _ => false,
        };
        if !wanted {
            return Ok(());
        }
        if self.bank.attach_subtable(pid, table_id, extension) {
            /* the attachment-triggering section still belongs to the new
             * decoder */
            let mut events = Vec::new();
            self.bank.offer_section(pid, section, &mut events);
            for event in events {
                self.handle_event(event)?;
            }
        }
        Ok(())
    }

    fn on_sdt(&mut self, sdt: SdtTable) -> Result<(), IndexError> {
        let stored = self
            .current_sdts
            .iter()
            .position(|s| s.network_id == sdt.network_id);
        if let Some(idx) = stored {
            if self.current_sdts[idx].should_discard(&sdt) {
                return Ok(());
            }
        }
        self.transact(|sm| sm.export_sdt_rows(&sdt))?;
        match stored {
            Some(idx) => self.current_sdts[idx] = sdt,
            None => self.current_sdts.push(sdt),
        }
        Ok(())
    }

    fn export_sdt_rows(&self, sdt: &SdtTable) -> Result<(), IndexError> {
        let sdt_rowid = self
            .store
            .insert_sdt(self.pat_rowid, sdt.version, sdt.network_id)?;
        for service in &sdt.services {
            let mut name = None;
            let mut provider_name = None;
            for descriptor in &service.descriptors {
                if descriptor.tag == descriptors::TAG_SERVICE {
                    if let Some(info) = descriptors::parse_service(descriptor) {
                        name = decode_text(&info.service_name);
                        provider_name = decode_text(&info.provider_name);
                    }
                }
            }
            self.store.insert_service(
                sdt_rowid,
                service.service_id,
                service.running_status,
                service.free_ca,
                name.as_deref(),
                provider_name.as_deref(),
            )?;
        }
        Ok(())
    }

    fn on_nit(&mut self, nit: NitTable) -> Result<(), IndexError> {
        let stored = self
            .current_nits
            .iter()
            .position(|n| n.network_id == nit.network_id);
        if let Some(idx) = stored {
            if self.current_nits[idx].should_discard(&nit) {
                return Ok(());
            }
        }
        let file_rowid = self.file_rowid()?;
        self.transact(|sm| sm.export_nit_rows(file_rowid, &nit))?;
        match stored {
            Some(idx) => self.current_nits[idx] = nit,
            None => self.current_nits.push(nit),
        }
        Ok(())
    }

    fn export_nit_rows(&self, file_rowid: i64, nit: &NitTable) -> Result<(), IndexError> {
        let mut network_name = None;
        for descriptor in &nit.descriptors {
            if descriptor.tag == descriptors::TAG_NETWORK_NAME {
                network_name = decode_text(descriptors::parse_network_name(descriptor));
            }
        }
        let network_rowid =
            self.store
                .insert_network(file_rowid, nit.network_id, network_name.as_deref())?;
        for transport in &nit.transports {
            let ts_rowid = self.store.insert_transport_stream(
                network_rowid,
                transport.ts_id,
                transport.original_network_id,
            )?;
            for descriptor in &transport.descriptors {
                if descriptor.tag != descriptors::TAG_SERVICE_LIST {
                    continue;
                }
                for entry in descriptors::parse_service_list(descriptor).unwrap_or_default() {
                    self.store
                        .insert_ts_service(ts_rowid, entry.service_id, entry.service_type)?;
                }
            }
        }
        Ok(())
    }

    fn transact(
        &self,
        body: impl FnOnce(&Self) -> Result<(), IndexError>,
    ) -> Result<(), IndexError> {
        self.store.begin()?;
        match body(self) {
            Ok(()) => {
                self.store.end()?;
                Ok(())
            }
            Err(e) => {
                let _ = self.store.rollback();
                Err(e)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn stored_pmts(&self) -> &[PmtTable] {
        &self.current_pmts
    }

    #[cfg(test)]
    pub(crate) fn bank_filter_count(&self) -> usize {
        self.bank.filter_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::testing::psi_packet;
    use crate::demux::{PAT_TABLE_ID, PMT_TABLE_ID};
    use crate::psi::testing::make_section;

    fn machine(store: &Store) -> TableStateMachine<'_> {
        TableStateMachine::new(store, "unit.ts", 188)
    }

    fn store() -> Store {
        let store = Store::open_in_memory().unwrap();
        store.ensure_schema().unwrap();
        store
    }

    /// PAT with ts_id 1 and one program (1 -> PID 0x100).
    fn pat_packet(version: u8) -> [u8; TS_PACKET_SIZE] {
        let section = make_section(PAT_TABLE_ID, 1, version, &[0x00, 0x01, 0xe1, 0x00]);
        psi_packet(0, &section)
    }

    fn pmt_packet(pid: u16, program: u16, version: u8, es_pid: u16) -> [u8; TS_PACKET_SIZE] {
        let mut payload = vec![0xe0 | ((es_pid >> 8) as u8), es_pid as u8, 0xf0, 0x00];
        payload.extend_from_slice(&[0x1b, 0xe0 | ((es_pid >> 8) as u8), es_pid as u8, 0xf0, 0x00]);
        let section = make_section(PMT_TABLE_ID, program, version, &payload);
        psi_packet(pid, &section)
    }

    #[test]
    fn minimal_pat_registers_file_and_filters() {
        let store = store();
        let mut sm = machine(&store);
        assert!(!sm.has_file_row());
        sm.feed_packet(&pat_packet(0)).unwrap();
        assert!(sm.has_file_row());
        assert_eq!(store.count_rows("files").unwrap(), 1);
        assert_eq!(store.count_rows("pats").unwrap(), 1);
        /* the PMT filter announced by the PAT is live */
        sm.feed_packet(&pmt_packet(0x100, 1, 0, 0x101)).unwrap();
        assert_eq!(store.count_rows("pmts").unwrap(), 1);
        assert_eq!(store.count_rows("elem_streams").unwrap(), 1);
    }

    #[test]
    fn duplicate_pat_emits_one_row() {
        let store = store();
        let mut sm = machine(&store);
        for _ in 0..10 {
            sm.feed_packet(&pat_packet(0)).unwrap();
        }
        assert_eq!(store.count_rows("pats").unwrap(), 1);
    }

    #[test]
    fn pmt_replacement_keeps_latest_in_memory() {
        let store = store();
        let mut sm = machine(&store);
        sm.feed_packet(&pat_packet(0)).unwrap();
        sm.feed_packet(&pmt_packet(0x100, 1, 0, 0x101)).unwrap();
        /* repeat of the same version is dropped */
        sm.feed_packet(&pmt_packet(0x100, 1, 0, 0x101)).unwrap();
        assert_eq!(store.count_rows("pmts").unwrap(), 1);
        sm.feed_packet(&pmt_packet(0x100, 1, 1, 0x102)).unwrap();
        assert_eq!(store.count_rows("pmts").unwrap(), 2);
        assert_eq!(sm.stored_pmts().len(), 1);
        assert_eq!(sm.stored_pmts()[0].version, 1);
    }

    #[test]
    fn pat_version_bump_detaches_old_pmt_filters() {
        let store = store();
        let mut sm = machine(&store);
        sm.feed_packet(&pat_packet(0)).unwrap();
        sm.feed_packet(&pmt_packet(0x100, 1, 0, 0x101)).unwrap();
        assert_eq!(sm.stored_pmts().len(), 1);

        /* new PAT version: program 1 moves to PID 0x200 */
        let section = make_section(PAT_TABLE_ID, 1, 1, &[0x00, 0x01, 0xe2, 0x00]);
        sm.feed_packet(&psi_packet(0, &section)).unwrap();
        assert_eq!(store.count_rows("pats").unwrap(), 2);
        assert!(sm.stored_pmts().is_empty());

        /* the old PID no longer decodes */
        sm.feed_packet(&pmt_packet(0x100, 1, 2, 0x101)).unwrap();
        assert_eq!(store.count_rows("pmts").unwrap(), 1);
        /* the new one does */
        sm.feed_packet(&pmt_packet(0x200, 1, 2, 0x101)).unwrap();
        assert_eq!(store.count_rows("pmts").unwrap(), 2);
    }

    #[test]
    fn pat_nit_pid_change_detaches_old_demux() {
        let store = store();
        let mut sm = machine(&store);
        /* PAT v0: NIT designated on 0x20, program 1 -> 0x100 */
        let v0 = make_section(
            PAT_TABLE_ID,
            1,
            0,
            &[0x00, 0x00, 0xe0, 0x20, 0x00, 0x01, 0xe1, 0x00],
        );
        sm.feed_packet(&psi_packet(0, &v0)).unwrap();
        /* PAT v1 moves the NIT to 0x30 */
        let v1 = make_section(
            PAT_TABLE_ID,
            1,
            1,
            &[0x00, 0x00, 0xe0, 0x30, 0x00, 0x01, 0xe1, 0x00],
        );
        sm.feed_packet(&psi_packet(0, &v1)).unwrap();

        let nit_payload = [0xf0, 0x00, 0xf0, 0x00];
        let nit = make_section(NIT_CURRENT_TABLE_ID, 3, 0, &nit_payload);
        /* the abandoned NIT PID no longer decodes */
        sm.feed_packet(&psi_packet(0x20, &nit)).unwrap();
        assert_eq!(store.count_rows("networks").unwrap(), 0);
        /* the new one does */
        sm.feed_packet(&psi_packet(0x30, &nit)).unwrap();
        assert_eq!(store.count_rows("networks").unwrap(), 1);
    }

    #[test]
    fn repeated_pat_bumps_do_not_grow_the_bank() {
        let store = store();
        let mut sm = machine(&store);
        let pat = |version: u8, nit_pid: u16| {
            let payload = [
                0x00,
                0x00,
                0xe0 | ((nit_pid >> 8) as u8),
                nit_pid as u8,
                0x00,
                0x01,
                0xe1,
                0x00,
            ];
            psi_packet(0, &make_section(PAT_TABLE_ID, 1, version, &payload))
        };
        sm.feed_packet(&pat(0, 0x20)).unwrap();
        let baseline = sm.bank_filter_count();
        /* the NIT PID flips back and forth across version bumps */
        for version in 1..=10_u8 {
            let nit_pid = if version % 2 == 0 { 0x20 } else { 0x30 };
            sm.feed_packet(&pat(version, nit_pid)).unwrap();
            assert_eq!(sm.bank_filter_count(), baseline);
        }
    }

    #[test]
    fn sdt_subtable_for_old_ts_is_dropped_after_pat_change() {
        let store = store();
        let mut sm = machine(&store);
        sm.feed_packet(&pat_packet(0)).unwrap(); /* ts_id 1 */
        let sdt1 = make_section(SDT_CURRENT_TABLE_ID, 1, 0, &[0x00, 0x05, 0xff]);
        sm.feed_packet(&psi_packet(SDT_PID, &sdt1)).unwrap();
        assert_eq!(store.count_rows("sdts").unwrap(), 1);

        /* the transport stream id changes with the new PAT */
        let pat2 = make_section(PAT_TABLE_ID, 2, 0, &[0x00, 0x01, 0xe1, 0x00]);
        sm.feed_packet(&psi_packet(0, &pat2)).unwrap();

        /* a version bump for the old ts would emit if its subtable decoder
         * were still attached */
        let sdt1v1 = make_section(SDT_CURRENT_TABLE_ID, 1, 1, &[0x00, 0x05, 0xff]);
        sm.feed_packet(&psi_packet(SDT_PID, &sdt1v1)).unwrap();
        assert_eq!(store.count_rows("sdts").unwrap(), 1);

        /* the new transport stream's SDT decodes */
        let sdt2 = make_section(SDT_CURRENT_TABLE_ID, 2, 0, &[0x00, 0x06, 0xff]);
        sm.feed_packet(&psi_packet(SDT_PID, &sdt2)).unwrap();
        assert_eq!(store.count_rows("sdts").unwrap(), 2);
    }

    #[test]
    fn no_psi_means_no_file_row() {
        let store = store();
        let mut sm = machine(&store);
        let section = make_section(PMT_TABLE_ID, 1, 0, &[0xe1, 0x00, 0xf0, 0x00]);
        sm.feed_packet(&psi_packet(0x300, &section)).unwrap();
        assert!(!sm.has_file_row());
        assert_eq!(store.count_rows("files").unwrap(), 0);
    }

    #[test]
    fn sdt_for_current_ts_emits_services() {
        let store = store();
        let mut sm = machine(&store);
        sm.feed_packet(&pat_packet(0)).unwrap();

        /* SDT for ts 1: onid 5, one service with a named 0x48 descriptor */
        let mut payload = vec![0x00, 0x05, 0xff];
        payload.extend_from_slice(&[0x00, 0x65, 0xfc, 0x80, 0x0d]);
        payload.extend_from_slice(&[0x48, 0x0b, 0x01, 0x04, b'p', b'r', b'o', b'v']);
        payload.extend_from_slice(&[0x04, b'n', b'a', b'm', b'e']);
        let section = make_section(SDT_CURRENT_TABLE_ID, 1, 0, &payload);
        sm.feed_packet(&psi_packet(SDT_PID, &section)).unwrap();

        assert_eq!(store.count_rows("sdts").unwrap(), 1);
        assert_eq!(store.count_rows("services").unwrap(), 1);

        /* repeating it changes nothing */
        sm.feed_packet(&psi_packet(SDT_PID, &section)).unwrap();
        assert_eq!(store.count_rows("sdts").unwrap(), 1);
    }

    #[test]
    fn sdt_for_other_ts_is_ignored() {
        let store = store();
        let mut sm = machine(&store);
        sm.feed_packet(&pat_packet(0)).unwrap();
        let payload = vec![0x00, 0x05, 0xff];
        let section = make_section(SDT_CURRENT_TABLE_ID, 99, 0, &payload);
        sm.feed_packet(&psi_packet(SDT_PID, &section)).unwrap();
        assert_eq!(store.count_rows("sdts").unwrap(), 0);
    }

    #[test]
    fn nit_emits_network_tree() {
        let store = store();
        let mut sm = machine(&store);
        sm.feed_packet(&pat_packet(0)).unwrap();

        let mut payload = Vec::new();
        payload.extend_from_slice(&[0xf0, 0x04, 0x40, 0x02, b'T', b'V']);
        payload.extend_from_slice(&[0xf0, 0x0b]);
        payload.extend_from_slice(&[0x00, 0x01, 0x00, 0x05, 0xf0, 0x05]);
        payload.extend_from_slice(&[0x41, 0x03, 0x00, 0x65, 0x01]);
        let section = make_section(NIT_CURRENT_TABLE_ID, 3, 0, &payload);
        sm.feed_packet(&psi_packet(NIT_PID, &section)).unwrap();

        assert_eq!(store.count_rows("networks").unwrap(), 1);
        assert_eq!(store.count_rows("transport_streams").unwrap(), 1);
        assert_eq!(store.count_rows("ts_services").unwrap(), 1);
    }

    #[test]
    fn teletext_and_subtitle_rows_from_pmt() {
        let store = store();
        let mut sm = machine(&store);
        sm.feed_packet(&pat_packet(0)).unwrap();

        let mut payload = vec![0xe1, 0x01, 0xf0, 0x00];
        /* one private stream carrying teletext and subtitling descriptors */
        payload.extend_from_slice(&[0x06, 0xe0, 0x65, 0xf0, 0x11]);
        payload.extend_from_slice(&[0x56, 0x05, b'd', b'e', b'u', 0x09, 0x88]);
        payload.extend_from_slice(&[
            0x59, 0x08, b'd', b'e', b'u', 0x10, 0x00, 0x01, 0x00, 0x02,
        ]);
        let section = make_section(PMT_TABLE_ID, 1, 0, &payload);
        sm.feed_packet(&psi_packet(0x100, &section)).unwrap();

        assert_eq!(store.count_rows("elem_streams").unwrap(), 1);
        assert_eq!(store.count_rows("ttx_pages").unwrap(), 1);
        assert_eq!(store.count_rows("subtitle_contents").unwrap(), 1);
    }
}
