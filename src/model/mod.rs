//! Core data model types: MIME structure, parsed DSNs, and bounce records.

pub mod bounce;
pub mod dsn;
pub mod mime;
