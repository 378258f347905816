//! Export of the bounce table.

pub mod csv;
