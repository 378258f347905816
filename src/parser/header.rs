//! Header-style text helpers: continuation unfolding, encoded-words (RFC 2047),
//! addresses, and lenient date parsing.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use mail_parser::decoders::base64::base64_decode;
use tracing::debug;

use crate::parser::decode;

/// Join continuation lines (starting with space or tab) onto the previous line.
///
/// The continuation's leading whitespace is replaced by a single space.
/// Empty lines are dropped. A continuation with nothing before it starts a
/// line of its own.
pub fn unfold_lines(text: &str) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let is_continuation = line.starts_with(' ') || line.starts_with('\t');
        match result.last_mut() {
            Some(last) if is_continuation => {
                last.push(' ');
                last.push_str(line.trim());
            }
            _ => result.push(line.trim_end().to_string()),
        }
    }

    result
}

/// Split `key: value` on the first colon. Returns `None` without a colon or
/// with an empty key.
pub fn split_field(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, value.trim()))
}

/// Strip surrounding whitespace and angle brackets from a Message-ID.
pub fn strip_angle_brackets(s: &str) -> String {
    s.trim_matches(|c: char| c == '<' || c == '>' || c.is_whitespace())
        .to_string()
}

/// Unfolded `(lowercase_name, raw_value)` pairs of a raw header block.
///
/// Bytes are read as UTF-8, falling back to Windows-1252.
pub fn header_fields(raw: &[u8]) -> Vec<(String, String)> {
    let text = decode::bytes_to_text(raw, None);
    unfold_lines(&text)
        .iter()
        .filter_map(|line| split_field(line))
        .map(|(name, value)| (name.to_lowercase(), value.to_string()))
        .collect()
}

/// First value of header `name` (lowercase).
pub fn get_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// Bare address of the first mailbox in an address header.
///
/// `"Mail Delivery System <MAILER-DAEMON@mx.example.org>"` gives
/// `MAILER-DAEMON@mx.example.org`; `None` when nothing is left.
pub fn first_address(raw: &str) -> Option<String> {
    let mut in_quotes = false;
    let mut end = raw.len();
    for (i, ch) in raw.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                end = i;
                break;
            }
            _ => {}
        }
    }
    let first = raw[..end].trim();

    let address = match (first.rfind('<'), first.rfind('>')) {
        (Some(open), Some(close)) if close > open => first[open + 1..close].trim(),
        _ => first,
    };
    (!address.is_empty()).then(|| address.to_string())
}

/// Decode RFC 2047 encoded-words in a header value.
///
/// Example: `"=?UTF-8?B?SG9sYQ==?= =?UTF-8?B?IG11bmRv?="` → `"Hola mundo"`
///
/// If decoding fails for any token, the original text is preserved.
pub fn decode_encoded_words(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut remaining = input;
    let mut last_was_encoded = false;

    while let Some(start) = remaining.find("=?") {
        let before = &remaining[..start];
        // Whitespace between two encoded words is dropped (RFC 2047 §6.2)
        if !last_was_encoded || !before.trim().is_empty() {
            result.push_str(before);
        }

        let after_start = &remaining[start + 2..];
        match decode_one_word(after_start) {
            Some((text, consumed)) => {
                result.push_str(&text);
                remaining = &after_start[consumed..];
                last_was_encoded = true;
            }
            None => {
                result.push_str("=?");
                remaining = after_start;
                last_was_encoded = false;
            }
        }
    }

    result.push_str(remaining);
    result
}

/// Decode `charset?encoding?text?=`; returns the text and bytes consumed.
fn decode_one_word(s: &str) -> Option<(String, usize)> {
    let (charset, rest) = s.split_once('?')?;
    let (encoding, rest) = rest.split_once('?')?;
    let end = rest.find("?=")?;
    let encoded = &rest[..end];
    if charset.is_empty() || charset.contains(char::is_whitespace) {
        return None;
    }

    let bytes = match encoding.to_ascii_uppercase().as_str() {
        "B" => base64_decode(encoded.as_bytes())?,
        "Q" => decode_q_encoding(encoded),
        _ => return None,
    };
    // RFC 2231 language suffix: `utf-8*en`
    let charset = charset.split('*').next().unwrap_or(charset);
    let consumed = charset_len(s) + 1 + encoding.len() + 1 + end + 2;
    Some((decode::bytes_to_text(&bytes, Some(charset)), consumed))
}

fn charset_len(s: &str) -> usize {
    s.find('?').unwrap_or(s.len())
}

/// Q-encoding (RFC 2047): underscores → spaces, `=XX` → byte.
fn decode_q_encoding(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                result.push(b' ');
                i += 1;
            }
            b'=' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(byte) => {
                        result.push(byte);
                        i += 3;
                    }
                    None => {
                        result.push(b'=');
                        i += 1;
                    }
                }
            }
            b => {
                result.push(b);
                i += 1;
            }
        }
    }
    result
}

/// Parse an email date string in various common formats, keeping its offset.
///
/// Supports RFC 2822, ISO 8601, IMAP `INTERNALDATE`, and broken real-world
/// variants (named zones, missing day-of-week, missing zone = UTC).
pub fn parse_date(date_str: &str) -> Option<DateTime<FixedOffset>> {
    let trimmed = strip_comment(date_str.trim());
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt);
    }

    let no_dow = strip_day_of_week(trimmed);
    let imap_normalized = normalize_imap_date(&no_dow);

    let formats = [
        "%d %b %Y %H:%M:%S %z",
        "%d %b %Y %H:%M %z",
        "%d %b %Y %H:%M:%S",
        "%b %d %H:%M:%S %Y",
        "%Y-%m-%dT%H:%M:%S%z",
        "%Y-%m-%d %H:%M:%S %z",
        "%Y-%m-%d %H:%M:%S",
    ];

    for candidate in [no_dow.clone(), imap_normalized.clone(), replace_named_tz(&no_dow)] {
        for fmt in &formats {
            if let Ok(dt) = DateTime::parse_from_str(&candidate, fmt) {
                return Some(dt);
            }
            if let Ok(ndt) = NaiveDateTime::parse_from_str(&candidate, fmt) {
                return Some(Utc.from_utc_datetime(&ndt).fixed_offset());
            }
        }
    }

    if let Some(dt) = mail_parser_date(trimmed) {
        return Some(dt);
    }

    debug!(date = trimmed, "Could not parse date");
    None
}

/// Drop a trailing RFC 5322 comment such as `(CET)`.
fn strip_comment(s: &str) -> &str {
    match s.find('(') {
        Some(pos) if s.ends_with(')') => s[..pos].trim_end(),
        _ => s,
    }
}

/// Last resort: let `mail-parser` read a synthetic `Date:` header.
fn mail_parser_date(input: &str) -> Option<DateTime<FixedOffset>> {
    use mail_parser::MessageParser;

    let fake_msg = format!("Date: {input}\n\n");
    let parsed = MessageParser::default().parse(fake_msg.as_bytes())?;
    let rfc3339 = parsed.date()?.to_rfc3339();
    DateTime::parse_from_rfc3339(&rfc3339).ok()
}

/// `"16-JUL-2025 03:01:03 +0000"` → `"16 Jul 2025 03:01:03 +0000"`.
fn normalize_imap_date(s: &str) -> String {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    let lower = s.to_ascii_lowercase();
    for month in MONTHS {
        let pattern = format!("-{}-", month.to_ascii_lowercase());
        if let Some(pos) = lower.find(&pattern) {
            let mut result = String::with_capacity(s.len());
            result.push_str(s[..pos].trim_start());
            result.push(' ');
            result.push_str(month);
            result.push(' ');
            result.push_str(&s[pos + pattern.len()..]);
            return result;
        }
    }
    s.to_string()
}

fn strip_day_of_week(s: &str) -> String {
    const DAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
    for day in DAYS {
        if let Some(rest) = s.strip_prefix(day) {
            return rest.trim_start_matches(',').trim().to_string();
        }
    }
    s.to_string()
}

/// Replace a trailing well-known zone abbreviation with a numeric offset.
fn replace_named_tz(s: &str) -> String {
    const ZONES: [(&str, &str); 13] = [
        ("EST", "-0500"),
        ("EDT", "-0400"),
        ("CST", "-0600"),
        ("CDT", "-0500"),
        ("MST", "-0700"),
        ("MDT", "-0600"),
        ("PST", "-0800"),
        ("PDT", "-0700"),
        ("GMT", "+0000"),
        ("UTC", "+0000"),
        ("CEST", "+0200"),
        ("CET", "+0100"),
        ("JST", "+0900"),
    ];
    for (name, offset) in ZONES {
        if let Some(head) = s.strip_suffix(name) {
            return format!("{head}{offset}");
        }
    }
    s.to_string()
}
