//! The ingestion runtime: checks for new bounces, parse jobs, re-scans, and
//! the debug parse, all sharing one view of configuration and collaborators.

pub mod debug;
pub mod driver;
pub mod job;
pub mod queue;
pub mod rescan;
pub mod status;

use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::error::Result;
use crate::imap::{ConnectionPlan, Connector};
use crate::lock::{RunLock, RUN_LOCK_NAME};
use crate::parser::mapper::MapperOptions;
use crate::upstream::{CredentialDecryptor, UpstreamOptions};

use queue::JobQueue;
use status::StatusFile;

/// Configuration and collaborators for runs and jobs.
pub struct Runtime<'a> {
    pub config: &'a Config,
    pub upstream: UpstreamOptions,
    pub decryptor: &'a dyn CredentialDecryptor,
    pub connector: &'a dyn Connector,
    /// Directory holding the lock, status, and job queue.
    pub data_dir: PathBuf,
}

impl<'a> Runtime<'a> {
    /// Configured mailbox.
    pub fn mailbox(&self) -> &str {
        &self.config.watcher.mailbox
    }

    /// Validated connection plan for `mailbox`.
    ///
    /// Fails with a configuration error, before any network activity, when
    /// the mail plugin is inactive or not on SMTP, or settings are missing.
    pub fn plan(&self, mailbox: &str) -> Result<ConnectionPlan> {
        self.upstream.status().require_smtp()?;
        let smtp = self.upstream.smtp_config(self.decryptor);
        let port = self.config.watcher.effective_port(smtp.port);
        ConnectionPlan::new(&smtp, port, mailbox, &self.config.timeouts)
    }

    pub fn mapper_options(&self) -> MapperOptions {
        MapperOptions::new(&self.config.mapper, self.config.site_timezone())
    }

    pub fn run_lock(&self) -> RunLock {
        RunLock::new(
            &self.data_dir,
            RUN_LOCK_NAME,
            Duration::from_secs(self.config.schedule.lock_ttl_secs),
        )
    }

    pub fn status_file(&self) -> StatusFile {
        StatusFile::in_dir(&self.data_dir)
    }

    pub fn queue(&self) -> Result<JobQueue> {
        JobQueue::in_dir(&self.data_dir)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted mailbox shared by the runtime tests.

    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    use chrono::{DateTime, Utc};

    use crate::error::{BounceError, Result};
    use crate::imap::{ConnectionSpec, Connector, MailSession, MessageOverview};
    use crate::upstream::{PlainCredentials, UpstreamOptions};

    pub const OPTIONS: &str = r#"{
        "mail": {"mailer": "smtp"},
        "smtp": {"host": "mail.example.org", "port": 993, "encryption": "ssl",
                 "auth": true, "autotls": true,
                 "user": "bounces@example.org", "pass": "s3cret"}
    }"#;

    pub static PLAIN: PlainCredentials = PlainCredentials;

    pub fn upstream() -> UpstreamOptions {
        UpstreamOptions::from_json(OPTIONS).unwrap()
    }

    /// One message in the fake mailbox.
    #[derive(Debug, Clone)]
    pub struct FakeMessage {
        pub subject: String,
        pub seen: bool,
        pub date: Option<DateTime<Utc>>,
        pub raw: Vec<u8>,
    }

    #[derive(Debug, Default)]
    pub struct Mailbox {
        /// UID → message, in UID order; sequence numbers follow that order.
        pub messages: BTreeMap<u32, FakeMessage>,
        pub opens: u32,
        pub logouts: u32,
        pub fail_open: Option<String>,
        pub fail_search: Option<String>,
    }

    impl Mailbox {
        pub fn add(&mut self, uid: u32, subject: &str, raw: &[u8]) {
            self.messages.insert(
                uid,
                FakeMessage {
                    subject: subject.to_string(),
                    seen: false,
                    date: Some(Utc::now()),
                    raw: raw.to_vec(),
                },
            );
        }

        fn msgno(&self, uid: u32) -> Option<u32> {
            self.messages
                .keys()
                .position(|u| *u == uid)
                .map(|p| p as u32 + 1)
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct FakeConnector {
        pub mailbox: Rc<RefCell<Mailbox>>,
    }

    struct FakeSession {
        mailbox: Rc<RefCell<Mailbox>>,
    }

    impl Connector for FakeConnector {
        fn open(&self, _spec: &ConnectionSpec) -> Result<Box<dyn MailSession>> {
            let mut mailbox = self.mailbox.borrow_mut();
            mailbox.opens += 1;
            if let Some(message) = &mailbox.fail_open {
                return Err(BounceError::Connection(message.clone()));
            }
            Ok(Box::new(FakeSession {
                mailbox: Rc::clone(&self.mailbox),
            }))
        }
    }

    impl MailSession for FakeSession {
        fn search_unseen(&mut self, subject: &str) -> Result<Vec<u32>> {
            let mailbox = self.mailbox.borrow();
            if let Some(message) = &mailbox.fail_search {
                return Err(BounceError::Protocol(message.clone()));
            }
            Ok(mailbox
                .messages
                .iter()
                .filter(|(_, m)| !m.seen && (subject.is_empty() || m.subject.contains(subject)))
                .map(|(uid, _)| *uid)
                .collect())
        }

        fn fetch_overviews(&mut self, uids: &[u32]) -> Result<Vec<MessageOverview>> {
            let mailbox = self.mailbox.borrow();
            Ok(uids
                .iter()
                .filter_map(|uid| {
                    let message = mailbox.messages.get(uid)?;
                    Some(MessageOverview {
                        msgno: mailbox.msgno(*uid)?,
                        uid: *uid,
                        seen: message.seen,
                        message_id: Some(format!("{uid}@mx.example.org")),
                        subject: Some(message.subject.clone()),
                        from: Some("MAILER-DAEMON@mx.example.org".into()),
                        to: Some("noreply@site.org".into()),
                        date: message.date,
                        size: Some(message.raw.len() as u32),
                    })
                })
                .collect())
        }

        fn resolve_uid(&mut self, uid: u32) -> Result<Option<u32>> {
            Ok(self.mailbox.borrow().msgno(uid))
        }

        fn fetch_message(&mut self, msgno: u32) -> Result<Vec<u8>> {
            let mailbox = self.mailbox.borrow();
            mailbox
                .messages
                .values()
                .nth(msgno as usize - 1)
                .map(|m| m.raw.clone())
                .ok_or_else(|| BounceError::Protocol(format!("no message {msgno}")))
        }

        fn logout(&mut self) -> Result<()> {
            self.mailbox.borrow_mut().logouts += 1;
            Ok(())
        }
    }

    /// A Postfix bounce with a `message/delivery-status` part.
    pub fn postfix_bounce(recipient: &str) -> Vec<u8> {
        format!(
            "From: MAILER-DAEMON@mx.example.org\r\n\
Subject: Undelivered Mail Returned to Sender\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/report; report-type=delivery-status; boundary=\"B1\"\r\n\
\r\n\
--B1\r\n\
Content-Type: text/plain; charset=us-ascii\r\n\
\r\n\
I'm sorry to have to inform you that your message could not be delivered.\r\n\
--B1\r\n\
Content-Type: message/delivery-status\r\n\
\r\n\
Reporting-MTA: dns; mx.example.org\r\n\
X-Postfix-Sender: rfc822; noreply@site.org\r\n\
Arrival-Date: Mon, 1 Jan 2024 10:00:00 +0000\r\n\
\r\n\
Final-Recipient: rfc822; {recipient}\r\n\
Action: failed\r\n\
Status: 5.1.1\r\n\
Diagnostic-Code: smtp; 550 5.1.1 user unknown\r\n\
--B1--\r\n"
        )
        .into_bytes()
    }

    /// A message carrying nothing but a PDF.
    pub fn pdf_only() -> Vec<u8> {
        b"From: MAILER-DAEMON@mx.example.org\r\n\
Subject: Undelivered Mail Returned to Sender\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"P\"\r\n\
\r\n\
--P\r\n\
Content-Type: application/pdf; name=\"invoice.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQK\r\n\
--P--\r\n"
            .to_vec()
    }
}
