//! Body decoder: transfer-encoding and charset decoding of a raw MIME leaf.
//!
//! Decoding never fails. A body that does not decode under its declared
//! encoding is passed on as-is so one malformed part cannot block ingestion.

use mail_parser::decoders::base64::base64_decode;
use mail_parser::decoders::quoted_printable::quoted_printable_decode;
use tracing::{debug, warn};

use crate::model::mime::TransferEncoding;

/// Undo the transfer encoding, returning raw bytes.
pub fn decode_bytes(raw: &[u8], encoding: &TransferEncoding) -> Vec<u8> {
    let decoded = match encoding {
        TransferEncoding::Base64 => base64_decode(raw),
        TransferEncoding::QuotedPrintable => quoted_printable_decode(raw),
        _ => return raw.to_vec(),
    };
    match decoded {
        Some(bytes) => bytes,
        None => {
            debug!(?encoding, len = raw.len(), "Body did not decode, keeping raw bytes");
            raw.to_vec()
        }
    }
}

/// Decode a body to text with no declared charset.
pub fn decode(raw: &[u8], encoding: &TransferEncoding) -> String {
    decode_with_charset(raw, encoding, None)
}

/// Decode a body to text, converting from `charset` when given.
///
/// Without a charset, UTF-8 is tried first, then Windows-1252 (which accepts
/// every byte).
pub fn decode_with_charset(raw: &[u8], encoding: &TransferEncoding, charset: Option<&str>) -> String {
    let bytes = decode_bytes(raw, encoding);
    bytes_to_text(&bytes, charset)
}

pub(crate) fn bytes_to_text(bytes: &[u8], charset: Option<&str>) -> String {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);

    match charset.map(|c| c.trim().to_ascii_lowercase()) {
        Some(label) if label != "utf-8" && label != "utf8" && label != "us-ascii" => {
            match encoding_rs::Encoding::for_label(label.as_bytes()) {
                Some(enc) => enc.decode(bytes).0.into_owned(),
                None => {
                    warn!(charset = %label, "Unknown charset, falling back to UTF-8 lossy");
                    String::from_utf8_lossy(bytes).into_owned()
                }
            }
        }
        Some(_) => String::from_utf8_lossy(bytes).into_owned(),
        None => match std::str::from_utf8(bytes) {
            Ok(s) => s.to_string(),
            Err(_) => encoding_rs::WINDOWS_1252.decode(bytes).0.into_owned(),
        },
    }
}
