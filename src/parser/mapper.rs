//! Field mapper: derives the persisted sender / recipient / arrival fields
//! from a parsed DSN.

use crate::config::{MapperConfig, SiteTimezone};
use crate::model::bounce::DsnFields;
use crate::model::dsn::ParsedDsn;
use crate::parser::header::parse_date;

/// Mapping settings. Pure data; mapping has no other inputs.
#[derive(Debug, Clone)]
pub struct MapperOptions {
    /// Per-message fields naming the original sender, tried in order.
    pub sender_keys: Vec<String>,
    /// Timezone arrival dates are expressed in.
    pub timezone: SiteTimezone,
}

impl Default for MapperOptions {
    fn default() -> Self {
        Self::new(&MapperConfig::default(), SiteTimezone::Local)
    }
}

impl MapperOptions {
    pub fn new(config: &MapperConfig, timezone: SiteTimezone) -> Self {
        Self {
            sender_keys: config.sender_keys.clone(),
            timezone,
        }
    }
}

/// Map a parsed DSN to its business fields.
pub fn map(parsed: &ParsedDsn, options: &MapperOptions) -> DsnFields {
    DsnFields {
        sender: sender(parsed, &options.sender_keys),
        final_recipient: final_recipient(parsed),
        arrival: parsed
            .per_message
            .get("Arrival-Date")
            .or_else(|| parsed.flat.get("Arrival-Date"))
            .and_then(parse_date)
            .map(|dt| options.timezone.convert(&dt)),
    }
}

fn sender(parsed: &ParsedDsn, keys: &[String]) -> String {
    keys.iter()
        .find_map(|key| {
            parsed
                .per_message
                .get(key)
                .or_else(|| parsed.flat.get(key))
        })
        .map(strip_rfc822)
        .unwrap_or_default()
}

fn final_recipient(parsed: &ParsedDsn) -> String {
    if let Some(address) = parsed
        .first_recipient()
        .and_then(|r| r.final_recipient.address())
    {
        return address.to_string();
    }
    parsed
        .flat
        .get("Final-Recipient")
        .map(strip_rfc822)
        .unwrap_or_default()
}

/// Strip a leading `rfc822;` address-type prefix (any case) and whitespace.
pub fn strip_rfc822(value: &str) -> String {
    let trimmed = value.trim();
    let prefix_len = "rfc822".len();
    let stripped = trimmed
        .get(..prefix_len)
        .filter(|head| head.eq_ignore_ascii_case("rfc822"))
        .and_then(|_| trimmed[prefix_len..].trim_start().strip_prefix(';'));
    match stripped {
        Some(rest) => rest.trim().to_string(),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::dsn;
    use chrono::FixedOffset;

    fn utc_options() -> MapperOptions {
        MapperOptions {
            timezone: SiteTimezone::Fixed(FixedOffset::east_opt(0).unwrap()),
            ..MapperOptions::default()
        }
    }

    #[test]
    fn test_strip_rfc822() {
        assert_eq!(strip_rfc822("rfc822; a@b.com"), "a@b.com");
        assert_eq!(strip_rfc822("RFC822 ;a@b.com "), "a@b.com");
        assert_eq!(strip_rfc822(" a@b.com "), "a@b.com");
        assert_eq!(strip_rfc822("x-local; a@b"), "x-local; a@b");
    }

    #[test]
    fn test_map_postfix_report() {
        let parsed = dsn::parse(
            "X-Postfix-Sender: rfc822; noreply@site.org\n\
Arrival-Date: Mon, 1 Jan 2024 10:00:00 +0000\n\n\
Final-Recipient: rfc822; a@b.com\nAction: failed\n",
        );
        let fields = map(&parsed, &utc_options());
        assert_eq!(fields.sender, "noreply@site.org");
        assert_eq!(fields.final_recipient, "a@b.com");
        assert_eq!(
            fields.arrival.unwrap().to_rfc3339(),
            "2024-01-01T10:00:00+00:00"
        );
    }

    #[test]
    fn test_arrival_converted_to_site_timezone() {
        let parsed = dsn::parse("Arrival-Date: Mon, 1 Jan 2024 10:00:00 +0000\n");
        let options = MapperOptions {
            timezone: SiteTimezone::parse("+01:00").unwrap(),
            ..MapperOptions::default()
        };
        let arrival = map(&parsed, &options).arrival.unwrap();
        assert_eq!(arrival.to_rfc3339(), "2024-01-01T11:00:00+01:00");
    }

    #[test]
    fn test_missing_and_unparseable_fields() {
        let parsed = dsn::parse("Reporting-MTA: dns; x\nArrival-Date: yesterday-ish\n");
        let fields = map(&parsed, &utc_options());
        assert_eq!(fields, DsnFields::default());
    }

    #[test]
    fn test_final_recipient_falls_back_to_flat() {
        // Single block carrying the recipient: no recipient blocks at all.
        let parsed = dsn::parse("Final-Recipient: RFC822; c@d.com\n");
        assert!(parsed.per_recipient.is_empty());
        assert_eq!(map(&parsed, &utc_options()).final_recipient, "c@d.com");
    }

    #[test]
    fn test_configured_sender_keys() {
        let parsed = dsn::parse("X-Original-Sender: rfc822; me@site.org\n");
        let options = MapperOptions {
            sender_keys: vec!["X-Postfix-Sender".into(), "x-original-sender".into()],
            ..utc_options()
        };
        assert_eq!(map(&parsed, &options).sender, "me@site.org");
        assert_eq!(map(&parsed, &utc_options()).sender, "");
    }

    #[test]
    fn test_map_is_idempotent() {
        let parsed = dsn::parse(
            "X-Postfix-Sender: rfc822; s@x.org\nArrival-Date: Tue, 2 Jan 2024 08:15:00 +0100\n\n\
Final-Recipient: rfc822; r@y.org\n",
        );
        let options = utc_options();
        assert_eq!(map(&parsed, &options), map(&parsed, &options));
    }
}
