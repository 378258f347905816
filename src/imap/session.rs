//! The mailbox session seam between the ingestion runtime and IMAP.

use std::ops::{Deref, DerefMut};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{BounceError, Result};
use crate::imap::connect::{ConnectionPlan, ConnectionSpec};

/// Overview metadata of one message, fetched without its body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageOverview {
    pub msgno: u32,
    pub uid: u32,
    pub seen: bool,
    /// `Message-ID` without angle brackets.
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    /// `Date:` header.
    pub date: Option<DateTime<Utc>>,
    pub size: Option<u32>,
}

/// A read-only session on one selected mailbox.
pub trait MailSession {
    /// UIDs of unseen messages; `subject` filters on an exact substring
    /// unless empty.
    fn search_unseen(&mut self, subject: &str) -> Result<Vec<u32>>;

    /// Overview of each UID still present, in server order.
    fn fetch_overviews(&mut self, uids: &[u32]) -> Result<Vec<MessageOverview>>;

    /// Current sequence number of `uid`, or `None` when it is gone.
    fn resolve_uid(&mut self, uid: u32) -> Result<Option<u32>>;

    /// Complete raw message by sequence number, without setting `\Seen`.
    fn fetch_message(&mut self, msgno: u32) -> Result<Vec<u8>>;

    fn logout(&mut self) -> Result<()>;
}

/// Opens sessions.
pub trait Connector {
    fn open(&self, spec: &ConnectionSpec) -> Result<Box<dyn MailSession>>;
}

/// Session that logs out when dropped.
pub struct SessionGuard {
    session: Box<dyn MailSession>,
}

impl SessionGuard {
    pub fn new(session: Box<dyn MailSession>) -> Self {
        Self { session }
    }
}

impl Deref for SessionGuard {
    type Target = dyn MailSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(e) = self.session.logout() {
            debug!(error = %e, "Logout failed");
        }
    }
}

/// Try each candidate of `plan` in order and return the first open session.
///
/// When every attempt fails, the last error is returned as a
/// [`BounceError::Connection`] with credentials scrubbed.
pub fn open_session(connector: &dyn Connector, plan: &ConnectionPlan) -> Result<SessionGuard> {
    let mut last_error = None;
    for spec in &plan.candidates {
        match connector.open(spec) {
            Ok(session) => {
                info!(mailbox = %spec.mailbox_string(), "IMAP session open");
                return Ok(SessionGuard::new(session));
            }
            Err(e) => {
                let text = match &e {
                    BounceError::Connection(m) => m.clone(),
                    other => other.to_string(),
                };
                let message = plan.redact(&text);
                warn!(mailbox = %spec.mailbox_string(), error = %message, "IMAP open failed");
                last_error = Some(message);
            }
        }
    }
    Err(BounceError::Connection(
        last_error.unwrap_or_else(|| "Unknown connection error".to_string()),
    ))
}
