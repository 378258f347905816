//! Debug parse: run the extraction pipeline on one message and show every
//! intermediate result.

use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::error::{BounceError, Result};
use crate::imap::open_session;
use crate::ingest::Runtime;
use crate::model::bounce::DsnFields;
use crate::model::dsn::ParsedDsn;
use crate::parser::{dsn, mapper, mapper::MapperOptions, mime};

/// Characters of the decoded report kept in [`DebugReport::raw`].
pub const RAW_PREVIEW_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugReport {
    pub uid: Option<u32>,
    /// Mailbox name, or the file path for offline inspection.
    pub mailbox: String,
    /// Address of the selected part, e.g. `2`.
    pub part: Option<String>,
    pub mime_type: Option<String>,
    /// Start of the decoded report text.
    pub raw: String,
    pub parsed: Option<ParsedDsn>,
    pub fields: Option<DsnFields>,
}

/// Build the report for one raw message.
pub fn report_for_message(
    raw: &[u8],
    uid: Option<u32>,
    mailbox: &str,
    options: &MapperOptions,
) -> DebugReport {
    let Some(part) = mime::extract_dsn(raw) else {
        return DebugReport {
            uid,
            mailbox: mailbox.to_string(),
            part: None,
            mime_type: None,
            raw: String::new(),
            parsed: None,
            fields: None,
        };
    };
    let parsed = dsn::parse(&part.text);
    let fields = mapper::map(&parsed, options);
    DebugReport {
        uid,
        mailbox: mailbox.to_string(),
        part: Some(part.address.to_string()),
        mime_type: Some(part.mime_type),
        raw: part.text.chars().take(RAW_PREVIEW_CHARS).collect(),
        parsed: Some(parsed),
        fields: Some(fields),
    }
}

/// Debug-parse the newest unseen matching message in the configured mailbox.
pub fn debug_parse(rt: &Runtime<'_>) -> Result<DebugReport> {
    let mailbox = rt.mailbox();
    let plan = rt.plan(mailbox)?;
    let mut session = open_session(rt.connector, &plan)?;

    let uids = session.search_unseen(&rt.config.watcher.subject)?;
    let Some(uid) = uids.into_iter().max() else {
        return Err(BounceError::NotFound(
            "No unseen bounce found for debug".into(),
        ));
    };
    let msgno = session
        .resolve_uid(uid)?
        .ok_or_else(|| BounceError::NotFound(format!("UID {uid} vanished")))?;
    let raw = session.fetch_message(msgno)?;
    info!(uid, msgno, mailbox, bytes = raw.len(), "Debug parse");

    Ok(report_for_message(&raw, Some(uid), mailbox, &rt.mapper_options()))
}

/// Offline variant of [`debug_parse`] for a stored `.eml` file.
pub fn inspect_file(path: &Path, options: &MapperOptions) -> Result<DebugReport> {
    let raw = std::fs::read(path).map_err(|e| BounceError::io(path, e))?;
    Ok(report_for_message(
        &raw,
        None,
        &path.display().to_string(),
        options,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ingest::testing::{self, FakeConnector};

    #[test]
    fn test_debug_parse_picks_newest_unseen() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let connector = FakeConnector::default();
        {
            let mut mailbox = connector.mailbox.borrow_mut();
            mailbox.add(8, "Undelivered Mail Returned to Sender", &testing::postfix_bounce("old@b.com"));
            mailbox.add(9, "Undelivered Mail Returned to Sender", &testing::postfix_bounce("new@b.com"));
        }
        let rt = Runtime {
            config: &config,
            upstream: testing::upstream(),
            decryptor: &testing::PLAIN,
            connector: &connector,
            data_dir: dir.path().to_path_buf(),
        };

        let report = debug_parse(&rt).unwrap();
        assert_eq!(report.uid, Some(9));
        assert_eq!(report.mailbox, "INBOX");
        assert_eq!(report.part.as_deref(), Some("2"));
        assert_eq!(report.mime_type.as_deref(), Some("message/delivery-status"));
        assert!(report.raw.starts_with("Reporting-MTA: dns; mx.example.org"));
        let parsed = report.parsed.unwrap();
        assert_eq!(parsed.per_recipient.len(), 1);
        assert_eq!(report.fields.unwrap().final_recipient, "new@b.com");
    }

    #[test]
    fn test_debug_parse_with_nothing_unseen() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let connector = FakeConnector::default();
        let rt = Runtime {
            config: &config,
            upstream: testing::upstream(),
            decryptor: &testing::PLAIN,
            connector: &connector,
            data_dir: dir.path().to_path_buf(),
        };
        assert!(matches!(debug_parse(&rt), Err(BounceError::NotFound(_))));
    }

    #[test]
    fn test_report_without_dsn() {
        let report = report_for_message(&testing::pdf_only(), Some(1), "INBOX", &MapperOptions::default());
        assert_eq!(report.part, None);
        assert_eq!(report.raw, "");
        assert!(report.parsed.is_none());
    }

    #[test]
    fn test_raw_preview_is_capped() {
        let mut body = String::from("Reporting-MTA: dns; mx.example.org\r\n\r\n");
        body.push_str(&"X-Filler: é\r\n".repeat(400));
        let message = format!(
            "Content-Type: message/delivery-status\r\n\r\n{body}"
        );
        let report = report_for_message(message.as_bytes(), None, "x.eml", &MapperOptions::default());
        assert_eq!(report.raw.chars().count(), RAW_PREVIEW_CHARS);
    }

    #[test]
    fn test_inspect_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bounce.eml");
        std::fs::write(&path, testing::postfix_bounce("a@b.com")).unwrap();
        let report = inspect_file(&path, &MapperOptions::default()).unwrap();
        assert_eq!(report.uid, None);
        assert_eq!(report.fields.unwrap().sender, "noreply@site.org");
    }
}
