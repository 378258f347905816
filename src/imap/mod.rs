//! Read-only IMAP access to the bounce mailbox.

pub mod client;
pub mod connect;
pub mod response;
pub mod session;

pub use client::ImapConnector;
pub use connect::{ConnectionPlan, ConnectionSpec, TlsMode};
pub use session::{open_session, Connector, MailSession, MessageOverview, SessionGuard};
