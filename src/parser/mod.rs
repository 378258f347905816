//! Bounce parsing: MIME navigation, body decoding, DSN text parsing, and field mapping.

pub mod decode;
pub mod dsn;
pub mod header;
pub mod mapper;
pub mod mime;

use crate::model::bounce::DsnFields;
use crate::model::dsn::ParsedDsn;
use mime::DsnPart;

/// Everything derived from one raw message.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub part: DsnPart,
    pub parsed: ParsedDsn,
    pub fields: DsnFields,
}

/// Run the whole pipeline on a raw message: locate, decode, parse, map.
///
/// `None` when the message carries no recognizable delivery report.
pub fn extract(raw: &[u8], options: &mapper::MapperOptions) -> Option<Extraction> {
    let part = mime::extract_dsn(raw)?;
    let parsed = dsn::parse(&part.text);
    let fields = mapper::map(&parsed, options);
    Some(Extraction {
        part,
        parsed,
        fields,
    })
}
