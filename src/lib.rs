//! `bouncewatch`: watch an IMAP mailbox for bounce notifications and record
//! who bounced, from what sender, and when.
//!
//! The core is the delivery report pipeline in [`parser`]: locate the DSN part
//! of a message, decode it, parse its per-message and per-recipient blocks,
//! and map them to the stored fields. [`ingest`] drives it against a live
//! mailbox, persisting results through a [`store::BounceStore`].

pub mod config;
pub mod error;
pub mod export;
pub mod imap;
pub mod ingest;
pub mod lock;
pub mod model;
pub mod parser;
pub mod store;
pub mod upstream;
