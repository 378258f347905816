//! Bounce records as persisted by the record store.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Overview-level metadata of one matching message, written at ingestion time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BounceOverview {
    /// `Message-ID` without angle brackets.
    pub message_id: Option<String>,
    pub uid: Option<u32>,
    pub mailbox: String,
    pub subject: Option<String>,
    pub from_email: Option<String>,
    pub to_email: Option<String>,
    /// `Date:` header of the bounce itself.
    pub imap_date: Option<DateTime<Utc>>,
    pub unseen: bool,
    pub source_host: Option<String>,
    pub source_user: Option<String>,
}

impl BounceOverview {
    /// Content hash identifying this message: `message-id|uid|mailbox`.
    pub fn hash(&self) -> String {
        record_hash(self.message_id.as_deref(), self.uid, &self.mailbox)
    }
}

/// Lowercase hex SHA-256 of `message_id|uid|mailbox` (absent parts are empty).
pub fn record_hash(message_id: Option<&str>, uid: Option<u32>, mailbox: &str) -> String {
    let uid = uid.map(|u| u.to_string()).unwrap_or_default();
    let input = format!("{}|{}|{}", message_id.unwrap_or(""), uid, mailbox);
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// The three business fields derived from a DSN.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DsnFields {
    /// Original sender; empty when the report does not name one.
    pub sender: String,
    /// Failed recipient; empty when the report does not name one.
    pub final_recipient: String,
    /// Arrival instant in the site timezone.
    pub arrival: Option<DateTime<FixedOffset>>,
}

/// One row of the bounce table.
///
/// Created unparsed at ingestion and updated in place once its parse job
/// succeeds. Rows are only removed by an explicit truncate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BounceRecord {
    pub id: u64,
    pub hash: String,
    pub message_id: Option<String>,
    pub uid: Option<u32>,
    pub mailbox: String,
    pub subject: Option<String>,
    pub from_email: Option<String>,
    pub to_email: Option<String>,
    pub imap_date: Option<DateTime<Utc>>,
    pub unseen: bool,
    pub parsed: bool,
    pub dr_sender_email: Option<String>,
    pub dr_final_recipient: Option<String>,
    pub dr_arrival_date: Option<DateTime<FixedOffset>>,
    pub source_host: Option<String>,
    pub source_user: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BounceRecord {
    /// A fresh unparsed row for `overview`.
    pub fn from_overview(id: u64, overview: &BounceOverview, now: DateTime<Utc>) -> Self {
        Self {
            id,
            hash: overview.hash(),
            message_id: overview.message_id.clone(),
            uid: overview.uid,
            mailbox: overview.mailbox.clone(),
            subject: overview.subject.clone(),
            from_email: overview.from_email.clone(),
            to_email: overview.to_email.clone(),
            imap_date: overview.imap_date,
            unseen: overview.unseen,
            parsed: false,
            dr_sender_email: None,
            dr_final_recipient: None,
            dr_arrival_date: None,
            source_host: overview.source_host.clone(),
            source_user: overview.source_user.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Refresh the overview columns from a re-ingested message. Sender and
    /// recipient are only replaced when the overview carries them.
    pub fn refresh_overview(&mut self, overview: &BounceOverview, now: DateTime<Utc>) {
        self.subject = overview.subject.clone();
        self.from_email = overview.from_email.clone().or(self.from_email.take());
        self.to_email = overview.to_email.clone().or(self.to_email.take());
        self.imap_date = overview.imap_date;
        self.unseen = overview.unseen;
        self.updated_at = now;
    }

    /// Write parsed DSN fields, mirroring them into the overview columns.
    pub fn apply_dsn_fields(&mut self, fields: &DsnFields, now: DateTime<Utc>) {
        self.dr_sender_email = Some(fields.sender.clone());
        self.dr_final_recipient = Some(fields.final_recipient.clone());
        self.dr_arrival_date = fields.arrival;
        self.from_email = Some(fields.sender.clone());
        self.to_email = Some(fields.final_recipient.clone());
        self.imap_date = fields.arrival.map(|a| a.with_timezone(&Utc));
        self.parsed = true;
        self.updated_at = now;
    }
}
