//! Decoding of DVB-encoded text fields (EN 300 468 annex A) to UTF-8.
//!
//! The first byte of a text field selects the character encoding; anything
//! at or above 0x20 means the whole field is ISO 6937 with the DVB
//! additions. A failed decode NULLs only the column the field feeds, so
//! errors here are values, never logs.

use encoding_rs::{
    Encoding, BIG5, GB18030, ISO_8859_10, ISO_8859_13, ISO_8859_14, ISO_8859_15, ISO_8859_2,
    ISO_8859_3, ISO_8859_4, ISO_8859_5, ISO_8859_6, ISO_8859_7, ISO_8859_8, UTF_16BE,
    WINDOWS_1254, WINDOWS_874,
};
use thiserror::Error;

mod iso6937;
mod ksx1001;

/// Reasons a DVB text field cannot be represented in UTF-8.
#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
    /// The text field carries no bytes at all.
    #[error("empty text field")]
    Empty,
    /// The selector byte names a reserved or private encoding.
    #[error("unsupported encoding selector {0:#04x}")]
    UnsupportedEncoding(u8),
    /// A multi-byte sequence was cut short at the end of the field.
    #[error("incomplete multi-byte sequence")]
    IncompleteSequence,
    /// A byte sequence has no mapping in the selected encoding.
    #[error("illegal byte sequence")]
    IllegalSequence,
    /// The payload violates the selected encoding's structure.
    #[error("malformed text payload")]
    Malformed,
}

/// Decode one DVB text field to UTF-8.
///
/// ```
/// use tsindex::dvbtext::decode;
/// assert_eq!(decode(&[0x15, b'o', b'k']).unwrap(), "ok");
/// ```
pub fn decode(bytes: &[u8]) -> Result<String, DecodeError> {
    let b0 = *bytes.first().ok_or(DecodeError::Empty)?;
    if b0 >= 0x20 {
        return iso6937::decode(bytes);
    }
    match b0 {
        0x01..=0x0b => decode_8859(b0 + 4, &bytes[1..]),
        0x10 => {
            if bytes.len() < 3 {
                /* 0x10 must be followed by a two-byte table selector */
                return Err(DecodeError::Malformed);
            }
            if bytes[1] != 0 {
                return Err(DecodeError::UnsupportedEncoding(b0));
            }
            match bytes[2] {
                part @ 0x01..=0x0f => decode_8859(part, &bytes[3..]),
                _ => Err(DecodeError::UnsupportedEncoding(b0)),
            }
        }
        0x11 => decode_with(UTF_16BE, &bytes[1..]),
        0x12 => ksx1001::decode(&bytes[1..]),
        0x13 => decode_with(GB18030, &bytes[1..]),
        0x14 => decode_with(BIG5, &bytes[1..]),
        0x15 => std::str::from_utf8(&bytes[1..])
            .map(str::to_owned)
            .map_err(|_| DecodeError::IllegalSequence),
        other => Err(DecodeError::UnsupportedEncoding(other)),
    }
}

/// Decode an ISO 8859 part selected in-band. Part 1 maps bytes to code
/// points directly; parts 9 and 11 use the windows supersets that differ
/// only in the C1 range EN 300 468 reserves for control codes.
fn decode_8859(part: u8, payload: &[u8]) -> Result<String, DecodeError> {
    let encoding: &'static Encoding = match part {
        1 => return Ok(payload.iter().map(|&b| b as char).collect()),
        2 => ISO_8859_2,
        3 => ISO_8859_3,
        4 => ISO_8859_4,
        5 => ISO_8859_5,
        6 => ISO_8859_6,
        7 => ISO_8859_7,
        8 => ISO_8859_8,
        9 => WINDOWS_1254,
        10 => ISO_8859_10,
        11 => WINDOWS_874,
        /* part 12 is reserved by EN 300 468 */
        13 => ISO_8859_13,
        14 => ISO_8859_14,
        15 => ISO_8859_15,
        _ => return Err(DecodeError::UnsupportedEncoding(part)),
    };
    decode_with(encoding, payload)
}

fn decode_with(encoding: &'static Encoding, payload: &[u8]) -> Result<String, DecodeError> {
    let (text, _, had_errors) = encoding.decode(payload);
    if had_errors {
        Err(DecodeError::Malformed)
    } else {
        Ok(text.into_owned())
    }
}
