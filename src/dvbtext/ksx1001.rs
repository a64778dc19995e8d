//! KS X 1001 (Korean) decoding. Characters are 16-bit big-endian values
//! looked up by binary search in a sorted code-point table. The table is
//! materialized once from the 94x94 EUC-KR plane and cached for the rest of
//! the process.

use super::DecodeError;
use std::sync::OnceLock;

static CODE_POINTS: OnceLock<Vec<(u16, u16)>> = OnceLock::new();

fn code_point_table() -> &'static [(u16, u16)] {
    CODE_POINTS.get_or_init(|| {
        let mut table = Vec::with_capacity(94 * 94);
        for row in 0xa1..=0xfe_u16 {
            for cell in 0xa1..=0xfe_u16 {
                let pair = [row as u8, cell as u8];
                let (text, _, had_errors) = encoding_rs::EUC_KR.decode(&pair);
                if had_errors {
                    continue;
                }
                let mut chars = text.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) if (c as u32) <= 0xffff => {
                        table.push((row << 8 | cell, c as u32 as u16));
                    }
                    _ => {}
                }
            }
        }
        table.sort_unstable_by_key(|entry| entry.0);
        table
    })
}

fn code_point(ksx_char: u16) -> Option<u16> {
    let table = code_point_table();
    table
        .binary_search_by_key(&ksx_char, |entry| entry.0)
        .ok()
        .map(|idx| table[idx].1)
}

pub(super) fn decode(bytes: &[u8]) -> Result<String, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::IncompleteSequence);
    }
    let mut out = String::with_capacity(bytes.len() / 2 * 3);
    for pair in bytes.chunks_exact(2) {
        let code = u16::from_be_bytes([pair[0], pair[1]]);
        let cp = code_point(code).ok_or(DecodeError::IllegalSequence)?;
        let c = char::from_u32(cp as u32).ok_or(DecodeError::IllegalSequence)?;
        out.push(c);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_sorted_and_populated() {
        let table = code_point_table();
        assert!(table.len() > 2000);
        assert!(table.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn hangul_and_hanja_lookups() {
        /* 한 */
        assert_eq!(decode(&[0xc7, 0xd1]).unwrap(), "한");
        /* ideographic space, first row */
        assert_eq!(decode(&[0xa1, 0xa1]).unwrap(), "\u{3000}");
    }

    #[test]
    fn multi_character_run() {
        /* 한국 */
        assert_eq!(decode(&[0xc7, 0xd1, 0xb1, 0xb9]).unwrap(), "한국");
    }

    #[test]
    fn empty_field_decodes_to_empty_string() {
        assert_eq!(decode(&[]).unwrap(), "");
    }
}
