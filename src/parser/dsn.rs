//! DSN text parser: turns a decoded `message/delivery-status` body (or a
//! plain-text delivery report) into per-message and per-recipient fields.
//!
//! The text is a sequence of header-like paragraphs separated by blank lines.
//! The first paragraph describes the message, every following one describes
//! a single recipient.

use crate::model::dsn::{DsnBlock, ParsedDsn, RecipientReport};
use crate::parser::header::{split_field, unfold_lines};

/// Parse DSN text into its structured form.
///
/// Paragraphs that contain no `key: value` line at all are ignored, so stray
/// prose around the fields does not shift the per-message block.
pub fn parse(text: &str) -> ParsedDsn {
    let normalized = normalize_line_endings(text);

    let mut blocks = split_blocks(&normalized)
        .into_iter()
        .map(|raw| parse_block(&raw))
        .filter(|block| !block.is_empty());

    let per_message = blocks.next().unwrap_or_default();
    let recipient_blocks: Vec<DsnBlock> = blocks.collect();

    let per_recipient = recipient_blocks
        .iter()
        .map(RecipientReport::from_block)
        .collect();

    let mut flat = per_message.clone();
    if let Some(first) = recipient_blocks.first() {
        flat.overlay(first);
    }

    ParsedDsn {
        per_message,
        per_recipient,
        flat,
    }
}

/// Parse one paragraph: unfold continuations, then read `key: value` lines.
pub fn parse_block(block: &str) -> DsnBlock {
    let mut fields = DsnBlock::new();
    for line in unfold_lines(block) {
        if let Some((key, value)) = split_field(&line) {
            fields.insert(key, value);
        }
    }
    fields
}

/// `\r\n` and lone `\r` become `\n`.
fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Split on runs of blank (empty or whitespace-only) lines.
fn split_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current = String::new();

    for line in text.split('\n') {
        if line.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.is_empty() {
        blocks.push(current);
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    const POSTFIX_DSN: &str = "Reporting-MTA: dns; mail.example.org\n\
X-Postfix-Queue-ID: 4B2C81A0F3\n\
X-Postfix-Sender: rfc822; noreply@example.org\n\
Arrival-Date: Mon, 1 Jan 2024 10:00:00 +0000\n\
\n\
Final-Recipient: rfc822; a@b.com\n\
Original-Recipient: rfc822;a@b.com\n\
Action: failed\n\
Status: 5.1.1\n\
Remote-MTA: dns; mx.b.com\n\
Diagnostic-Code: smtp; 550 5.1.1 <a@b.com>: Recipient address rejected:\n\
    User unknown in virtual mailbox table\n";

    #[test]
    fn test_parse_postfix_report() {
        let parsed = parse(POSTFIX_DSN);
        assert_eq!(parsed.per_message.len(), 4);
        assert_eq!(
            parsed.per_message.get("Arrival-Date"),
            Some("Mon, 1 Jan 2024 10:00:00 +0000")
        );
        assert_eq!(parsed.per_recipient.len(), 1);

        let rcpt = &parsed.per_recipient[0];
        assert_eq!(rcpt.final_recipient.kind.as_deref(), Some("rfc822"));
        assert_eq!(rcpt.final_recipient.address(), Some("a@b.com"));
        assert_eq!(rcpt.original_recipient.address(), Some("a@b.com"));
        assert_eq!(rcpt.action.as_deref(), Some("failed"));
        assert_eq!(rcpt.status.as_deref(), Some("5.1.1"));
        assert!(rcpt.status_code().unwrap().is_permanent());
        assert_eq!(rcpt.diagnostic_code.kind.as_deref(), Some("smtp"));
        assert_eq!(
            rcpt.diagnostic_code.value.as_deref(),
            Some(
                "550 5.1.1 <a@b.com>: Recipient address rejected: \
User unknown in virtual mailbox table"
            )
        );
    }

    #[test]
    fn test_flat_prefers_recipient_fields() {
        let text = "Status: 2.0.0\nArrival-Date: x\n\nStatus: 5.0.0\nAction: failed\n";
        let parsed = parse(text);
        assert_eq!(parsed.flat.get("Status"), Some("5.0.0"));
        assert_eq!(parsed.flat.get("Arrival-Date"), Some("x"));
        assert_eq!(parsed.flat.get("Action"), Some("failed"));
        assert_eq!(parsed.per_message.get("Status"), Some("2.0.0"));
    }

    #[test]
    fn test_zero_recipient_blocks() {
        let parsed = parse("Reporting-MTA: dns; a\nArrival-Date: b\n");
        assert!(parsed.per_recipient.is_empty());
        assert_eq!(parsed.flat, parsed.per_message);
    }

    #[test]
    fn test_continuation_is_unfolded() {
        let parsed = parse("Reporting-MTA: dns; x\n\nFinal-Recipient: rfc822;\n foo@bar.com");
        let rcpt = &parsed.per_recipient[0];
        assert_eq!(rcpt.fields.get("Final-Recipient"), Some("rfc822; foo@bar.com"));
        assert_eq!(rcpt.fields.len(), 1);
        assert_eq!(rcpt.final_recipient.address(), Some("foo@bar.com"));
    }

    #[test]
    fn test_keys_are_normalized() {
        let parsed = parse("REPORTING-MTA: dns; x\n\nfinal-recipient: RFC822; A@B.COM\nACTION: failed");
        assert_eq!(parsed.per_message.iter().next(), Some(("Reporting-Mta", "dns; x")));
        assert_eq!(
            parsed.per_recipient[0].fields.iter().collect::<Vec<_>>(),
            vec![("Action", "failed"), ("Final-Recipient", "RFC822; A@B.COM")]
        );
    }

    #[test]
    fn test_value_keeps_later_colons() {
        let parsed = parse("Arrival-Date: Mon, 1 Jan 2024 10:00:00 +0000");
        assert_eq!(
            parsed.per_message.get("arrival-date"),
            Some("Mon, 1 Jan 2024 10:00:00 +0000")
        );
    }

    #[test]
    fn test_crlf_and_multiple_blank_lines() {
        let text = "Reporting-MTA: dns; x\r\n\r\n\r\n  \r\nFinal-Recipient: rfc822; a@b.com\r\n\r\nFinal-Recipient: rfc822; c@d.com\r\n";
        let parsed = parse(text);
        assert_eq!(parsed.per_recipient.len(), 2);
        assert_eq!(parsed.per_recipient[1].final_recipient.address(), Some("c@d.com"));
    }

    #[test]
    fn test_lines_without_colon_are_skipped() {
        let parsed = parse("Reporting-MTA: dns; x\nthis line has no separator\n: empty key\n");
        assert_eq!(parsed.per_message.len(), 1);
    }

    #[test]
    fn test_missing_fields_yield_empty_type_value() {
        let parsed = parse("Reporting-MTA: dns; x\n\nAction: failed\n");
        let rcpt = &parsed.per_recipient[0];
        assert!(rcpt.final_recipient.is_absent());
        assert!(rcpt.diagnostic_code.is_absent());
        assert_eq!(rcpt.status, None);
    }

    #[test]
    fn test_empty_input() {
        let parsed = parse("");
        assert!(parsed.per_message.is_empty());
        assert!(parsed.per_recipient.is_empty());
        assert!(parsed.flat.is_empty());
    }
}
