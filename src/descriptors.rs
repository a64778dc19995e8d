use super::{Result, SliceReader};
use crate::read_bitfield;
use log::warn;
use modular_bitfield_msb::prelude::*;
use smallvec::SmallVec;

/// Descriptor tags consumed by the indexer. Unknown tags are carried around
/// untouched and ignored at row-emission time.
pub const TAG_ISO639_LANGUAGE: u8 = 0x0a;
pub const TAG_NETWORK_NAME: u8 = 0x40;
pub const TAG_SERVICE_LIST: u8 = 0x41;
pub const TAG_VBI_TELETEXT: u8 = 0x46;
pub const TAG_SERVICE: u8 = 0x48;
pub const TAG_TELETEXT: u8 = 0x56;
pub const TAG_SUBTITLING: u8 = 0x59;

/// Raw tagged descriptor as found in PSI descriptor loops.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub tag: u8,
    pub data: SmallVec<[u8; 8]>,
}

impl Descriptor {
    pub fn new_from_reader(reader: &mut SliceReader) -> Result<Self> {
        let tag_len = reader.read_array_ref::<2>()?;
        let mut data = SmallVec::<[u8; 8]>::new();
        data.extend_from_slice(reader.read(tag_len[1] as usize)?);
        Ok(Self {
            tag: tag_len[0],
            data,
        })
    }

    /// Drain a whole descriptor loop from `reader`.
    pub fn read_loop(reader: &mut SliceReader) -> Result<Vec<Descriptor>> {
        let mut out = Vec::new();
        while reader.remaining_len() > 0 {
            out.push(Descriptor::new_from_reader(reader)?);
        }
        Ok(out)
    }
}

/// One language entry of an ISO 639 language descriptor (0x0A).
#[derive(Debug, PartialEq)]
pub struct Iso639Entry {
    pub language: [u8; 3],
    pub audio_type: u8,
}

/// Decode descriptor 0x0A into its language entries.
///
/// Returns `None` (after logging) when the payload is not a whole number of
/// four-byte entries, matching the drop-and-continue treatment of malformed
/// descriptors elsewhere.
pub fn parse_iso639(descriptor: &Descriptor) -> Option<Vec<Iso639Entry>> {
    if descriptor.data.len() % 4 != 0 {
        warn!("ISO 639 descriptor with truncated entry");
        return None;
    }
    Some(
        descriptor
            .data
            .chunks_exact(4)
            .map(|chunk| Iso639Entry {
                language: [chunk[0], chunk[1], chunk[2]],
                audio_type: chunk[3],
            })
            .collect(),
    )
}

#[bitfield]
#[derive(Debug)]
struct TeletextPageBits {
    teletext_type: B5,
    magazine_number: B3,
    page_number: B8,
}

/// One page entry of a teletext descriptor (0x46 and 0x56 share the layout).
#[derive(Debug, PartialEq)]
pub struct TeletextPage {
    pub language: [u8; 3],
    pub teletext_type: u8,
    pub magazine_number: u8,
    pub page_number: u8,
}

/// Decode descriptors 0x46/0x56 into their page entries.
pub fn parse_teletext(descriptor: &Descriptor) -> Option<Vec<TeletextPage>> {
    if descriptor.data.len() % 5 != 0 {
        warn!("teletext descriptor with truncated page entry");
        return None;
    }
    Some(
        descriptor
            .data
            .chunks_exact(5)
            .map(|chunk| {
                let bits = TeletextPageBits::from_bytes([chunk[3], chunk[4]]);
                TeletextPage {
                    language: [chunk[0], chunk[1], chunk[2]],
                    teletext_type: bits.teletext_type(),
                    magazine_number: bits.magazine_number(),
                    page_number: bits.page_number(),
                }
            })
            .collect(),
    )
}

/// One entry of a subtitling descriptor (0x59).
#[derive(Debug, PartialEq)]
pub struct SubtitlingEntry {
    pub language: [u8; 3],
    pub subtitling_type: u8,
    pub composition_page_id: u16,
    pub ancillary_page_id: u16,
}

/// Decode descriptor 0x59 into its subtitle entries.
pub fn parse_subtitling(descriptor: &Descriptor) -> Option<Vec<SubtitlingEntry>> {
    if descriptor.data.len() % 8 != 0 {
        warn!("subtitling descriptor with truncated entry");
        return None;
    }
    Some(
        descriptor
            .data
            .chunks_exact(8)
            .map(|chunk| SubtitlingEntry {
                language: [chunk[0], chunk[1], chunk[2]],
                subtitling_type: chunk[3],
                composition_page_id: u16::from_be_bytes([chunk[4], chunk[5]]),
                ancillary_page_id: u16::from_be_bytes([chunk[6], chunk[7]]),
            })
            .collect(),
    )
}

/// Service descriptor (0x48): service type plus provider and service names
/// as raw DVB-encoded byte strings. Text decoding happens at row-emission
/// time so a bad name only NULLs its own column.
#[derive(Debug, PartialEq)]
pub struct ServiceInfo {
    pub service_type: u8,
    pub provider_name: Vec<u8>,
    pub service_name: Vec<u8>,
}

/// Decode descriptor 0x48.
pub fn parse_service(descriptor: &Descriptor) -> Option<ServiceInfo> {
    let mut reader = SliceReader::new(&descriptor.data);
    let parse = |reader: &mut SliceReader| -> Result<ServiceInfo> {
        let service_type = reader.read_u8()?;
        let provider_len = reader.read_u8()? as usize;
        let provider_name = reader.read(provider_len)?.to_vec();
        let name_len = reader.read_u8()? as usize;
        let service_name = reader.read(name_len)?.to_vec();
        Ok(ServiceInfo {
            service_type,
            provider_name,
            service_name,
        })
    };
    match parse(&mut reader) {
        Ok(info) => Some(info),
        Err(_) => {
            warn!("malformed service descriptor");
            None
        }
    }
}

/// Decode descriptor 0x40 (network name) into its raw DVB-encoded bytes.
pub fn parse_network_name(descriptor: &Descriptor) -> &[u8] {
    &descriptor.data
}

/// One entry of a service list descriptor (0x41).
#[derive(Debug, PartialEq)]
pub struct ServiceListEntry {
    pub service_id: u16,
    pub service_type: u8,
}

/// Decode descriptor 0x41 into its service entries.
pub fn parse_service_list(descriptor: &Descriptor) -> Option<Vec<ServiceListEntry>> {
    if descriptor.data.len() % 3 != 0 {
        warn!("service list descriptor with truncated entry");
        return None;
    }
    Some(
        descriptor
            .data
            .chunks_exact(3)
            .map(|chunk| ServiceListEntry {
                service_id: u16::from_be_bytes([chunk[0], chunk[1]]),
                service_type: chunk[2],
            })
            .collect(),
    )
}
