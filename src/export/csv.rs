//! Export bounce records to CSV.
//!
//! Output is UTF-8 with BOM for Excel compatibility.

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, TimeZone};

use crate::error::{BounceError, Result};
use crate::model::bounce::BounceRecord;

/// Column names, in output order.
pub const COLUMNS: [&str; 12] = [
    "Id",
    "Uid",
    "Mailbox",
    "Subject",
    "Parsed",
    "Sender",
    "Final_Recipient",
    "Arrival_Date",
    "Imap_Date",
    "Unseen",
    "Message_ID",
    "Updated_At",
];

/// Write `records` as CSV to `out`.
pub fn write_csv<W: Write>(records: &[BounceRecord], out: &mut W) -> std::io::Result<()> {
    // UTF-8 BOM for Excel
    out.write_all(&[0xEF, 0xBB, 0xBF])?;
    writeln!(out, "{}", COLUMNS.join(","))?;

    for r in records {
        let row = [
            r.id.to_string(),
            r.uid.map(|u| u.to_string()).unwrap_or_default(),
            csv_escape(&r.mailbox),
            csv_escape(r.subject.as_deref().unwrap_or("")),
            u8::from(r.parsed).to_string(),
            csv_escape(r.dr_sender_email.as_deref().unwrap_or("")),
            csv_escape(r.dr_final_recipient.as_deref().unwrap_or("")),
            format_date(r.dr_arrival_date.as_ref()),
            format_date(r.imap_date.as_ref()),
            u8::from(r.unseen).to_string(),
            csv_escape(r.message_id.as_deref().unwrap_or("")),
            format_date(Some(&r.updated_at)),
        ];
        writeln!(out, "{}", row.join(","))?;
    }
    Ok(())
}

/// Export `records` to a CSV file at `output_path`.
pub fn export_csv(records: &[BounceRecord], output_path: &Path) -> Result<()> {
    let mut file =
        std::fs::File::create(output_path).map_err(|e| BounceError::io(output_path, e))?;
    write_csv(records, &mut file).map_err(|e| BounceError::io(output_path, e))?;
    file.flush().map_err(|e| BounceError::io(output_path, e))
}

fn format_date<Tz: TimeZone>(date: Option<&DateTime<Tz>>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    date.map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

/// Escape a value for CSV (RFC 4180).
///
/// Wraps in double quotes if the value contains commas, quotes, or newlines.
fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::bounce::{BounceOverview, DsnFields};
    use chrono::Utc;

    #[test]
    fn test_csv_escape() {
        assert_eq!(csv_escape("hello"), "hello");
        assert_eq!(csv_escape("hello, world"), "\"hello, world\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_escape("line1\nline2"), "\"line1\nline2\"");
    }

    #[test]
    fn test_write_csv_rows() {
        let now = Utc::now();
        let overview = BounceOverview {
            message_id: Some("m1@mx".into()),
            uid: Some(12),
            mailbox: "INBOX".into(),
            subject: Some("Undelivered Mail, again".into()),
            unseen: true,
            ..Default::default()
        };
        let mut parsed = BounceRecord::from_overview(1, &overview, now);
        parsed.apply_dsn_fields(
            &DsnFields {
                sender: "noreply@site.org".into(),
                final_recipient: "a@b.com".into(),
                arrival: Some(chrono::DateTime::parse_from_rfc3339("2024-01-01T11:00:00+01:00").unwrap()),
            },
            now,
        );
        let unparsed = BounceRecord::from_overview(2, &BounceOverview::default(), now);

        let mut out = Vec::new();
        write_csv(&[parsed, unparsed], &mut out).unwrap();
        let text = String::from_utf8(out[3..].to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Id,Uid,Mailbox,Subject,Parsed"));
        assert!(lines[1].starts_with(
            "1,12,INBOX,\"Undelivered Mail, again\",1,noreply@site.org,a@b.com,2024-01-01 11:00:00,2024-01-01 10:00:00,1,m1@mx,"
        ));
        assert!(lines[2].starts_with("2,,,,0,,,,,0,,"));
    }
}
