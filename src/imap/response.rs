//! IMAP response reading and the few response shapes we need to understand.
//!
//! A response line may carry literals (`{N}` followed by N raw bytes). They
//! are read in full and kept beside the line text, which retains the `{N}`
//! markers.

use std::io::{self, BufRead};

/// Largest literal accepted from the server (256 MB).
pub const MAX_LITERAL: usize = 256 * 1024 * 1024;

/// Status word of a tagged or untagged status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
    PreAuth,
    Bye,
}

/// One logical response line with its literals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseLine {
    pub text: String,
    pub literals: Vec<Vec<u8>>,
}

impl ResponseLine {
    pub fn is_untagged(&self) -> bool {
        self.text.starts_with('*')
    }

    pub fn is_continuation(&self) -> bool {
        self.text.starts_with('+')
    }

    /// Tag of a tagged response.
    pub fn tag(&self) -> Option<&str> {
        if self.is_untagged() || self.is_continuation() {
            return None;
        }
        self.text.split(' ').next().filter(|t| !t.is_empty())
    }

    /// Status word following the tag or `*`, if this is a status response.
    pub fn status(&self) -> Option<Status> {
        let word = self.text.split_whitespace().nth(1)?;
        match word.to_ascii_uppercase().as_str() {
            "OK" => Some(Status::Ok),
            "NO" => Some(Status::No),
            "BAD" => Some(Status::Bad),
            "PREAUTH" => Some(Status::PreAuth),
            "BYE" => Some(Status::Bye),
            _ => None,
        }
    }
}

/// Read one CRLF-terminated line (without the terminator).
fn read_raw_line<R: BufRead>(reader: &mut R) -> io::Result<String> {
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"));
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Size announced by a trailing `{N}` (or `{N+}`) literal marker.
pub fn literal_size(line: &str) -> Option<usize> {
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

/// Read a complete response line, including any literals it announces.
pub fn read_response<R: BufRead>(reader: &mut R) -> io::Result<ResponseLine> {
    let mut response = ResponseLine::default();
    loop {
        let line = read_raw_line(reader)?;
        let size = literal_size(&line);
        response.text.push_str(&line);

        let Some(size) = size else {
            return Ok(response);
        };
        if size > MAX_LITERAL {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("literal of {size} bytes exceeds limit"),
            ));
        }
        let mut literal = vec![0u8; size];
        reader.read_exact(&mut literal)?;
        response.literals.push(literal);
    }
}

/// Parse `* CAPABILITY ...` or a `[CAPABILITY ...]` response code.
pub fn parse_capabilities(line: &str) -> Vec<String> {
    let list = line
        .strip_prefix("* CAPABILITY ")
        .or_else(|| {
            line.find("[CAPABILITY ")
                .map(|i| &line[i + "[CAPABILITY ".len()..])
                .and_then(|t| t.split(']').next())
        })
        .unwrap_or("");
    list.split_whitespace().map(str::to_uppercase).collect()
}

/// Numbers of every `* SEARCH` line.
pub fn parse_search(lines: &[ResponseLine]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|l| {
            let rest = l.text.strip_prefix("* ")?;
            let (word, numbers) = rest.split_once(' ').unwrap_or((rest, ""));
            word.eq_ignore_ascii_case("SEARCH").then_some(numbers)
        })
        .flat_map(|numbers| numbers.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect()
}

/// Data items of one `* N FETCH (...)` response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchItem {
    /// Message sequence number.
    pub seq: u32,
    pub uid: Option<u32>,
    pub flags: Vec<String>,
    pub internal_date: Option<String>,
    pub size: Option<u32>,
    /// First literal of the response (header fields or the full message).
    pub body: Option<Vec<u8>>,
}

impl FetchItem {
    pub fn is_seen(&self) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case("\\Seen"))
    }
}

/// Value following the data item `name` (case-insensitive), as a token.
fn item_value<'a>(items: &'a str, name: &str) -> Option<&'a str> {
    let upper = items.to_ascii_uppercase();
    let needle = format!("{name} ");
    let mut from = 0;
    while let Some(pos) = upper[from..].find(&needle) {
        let start = from + pos;
        let boundary = start == 0 || matches!(upper.as_bytes()[start - 1], b'(' | b' ');
        if boundary {
            return Some(&items[start + needle.len()..]);
        }
        from = start + needle.len();
    }
    None
}

fn number_token(rest: &str) -> Option<u32> {
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// Parse a FETCH response line; `None` for anything else.
pub fn parse_fetch(line: &ResponseLine) -> Option<FetchItem> {
    let rest = line.text.strip_prefix("* ")?;
    let (seq, rest) = rest.split_once(' ')?;
    let seq: u32 = seq.parse().ok()?;
    let items = rest
        .strip_prefix("FETCH ")
        .or_else(|| rest.strip_prefix("fetch "))?;

    let flags = item_value(items, "FLAGS")
        .and_then(|v| v.strip_prefix('('))
        .and_then(|v| v.split(')').next())
        .map(|v| v.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    let internal_date = item_value(items, "INTERNALDATE")
        .and_then(|v| v.strip_prefix('"'))
        .and_then(|v| v.split('"').next())
        .map(str::to_string);

    Some(FetchItem {
        seq,
        uid: item_value(items, "UID").and_then(number_token),
        flags,
        internal_date,
        size: item_value(items, "RFC822.SIZE").and_then(number_token),
        body: line.literals.first().cloned(),
    })
}

/// Quote a string argument, escaping `\` and `"`.
pub fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Strings that cannot travel as a quoted string must be sent as a literal.
pub fn needs_literal(s: &str) -> bool {
    s.bytes().any(|b| !b.is_ascii() || b == b'\r' || b == b'\n' || b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all(input: &[u8]) -> Vec<ResponseLine> {
        let mut cursor = Cursor::new(input.to_vec());
        let mut out = Vec::new();
        while let Ok(line) = read_response(&mut cursor) {
            out.push(line);
        }
        out
    }

    #[test]
    fn test_status_and_tag() {
        let lines = read_all(b"* OK [CAPABILITY IMAP4rev1 STARTTLS] ready\r\nA0001 NO [AUTHENTICATIONFAILED] bad\r\n+ go ahead\r\n");
        assert!(lines[0].is_untagged());
        assert_eq!(lines[0].status(), Some(Status::Ok));
        assert_eq!(parse_capabilities(&lines[0].text), vec!["IMAP4REV1", "STARTTLS"]);
        assert_eq!(lines[1].tag(), Some("A0001"));
        assert_eq!(lines[1].status(), Some(Status::No));
        assert!(lines[2].is_continuation());
        assert_eq!(lines[2].tag(), None);
    }

    #[test]
    fn test_literal_is_read_in_full() {
        let input = b"* 3 FETCH (UID 42 BODY[] {10}\r\nhello\r\nbye)\r\nA1 OK done\r\n";
        let lines = read_all(input);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].literals, vec![b"hello\r\nbye".to_vec()]);
        assert_eq!(lines[0].text, "* 3 FETCH (UID 42 BODY[] {10})");
        let item = parse_fetch(&lines[0]).unwrap();
        assert_eq!(item.seq, 3);
        assert_eq!(item.uid, Some(42));
        assert_eq!(item.body.as_deref(), Some(&b"hello\r\nbye"[..]));
    }

    #[test]
    fn test_parse_overview_fetch() {
        let input = b"* 7 FETCH (UID 1207 FLAGS (\\Recent) INTERNALDATE \"16-Jul-2025 03:01:03 +0000\" RFC822.SIZE 4711 BODY[HEADER.FIELDS (SUBJECT FROM TO DATE MESSAGE-ID)] {10}\r\nSubject:\r\n)\r\n";
        let lines = read_all(input);
        let item = parse_fetch(&lines[0]).unwrap();
        assert_eq!(item.seq, 7);
        assert_eq!(item.uid, Some(1207));
        assert_eq!(item.flags, vec!["\\Recent"]);
        assert!(!item.is_seen());
        assert_eq!(item.internal_date.as_deref(), Some("16-Jul-2025 03:01:03 +0000"));
        assert_eq!(item.size, Some(4711));
        assert_eq!(item.body.as_deref(), Some(&b"Subject:\r\n"[..]));
    }

    #[test]
    fn test_parse_search() {
        let lines = read_all(b"* SEARCH 4 9 15\r\n* SEARCH\r\n* 2 EXISTS\r\n");
        assert_eq!(parse_search(&lines), vec![4, 9, 15]);
    }

    #[test]
    fn test_literal_size() {
        assert_eq!(literal_size("BODY[] {342}"), Some(342));
        assert_eq!(literal_size("SUBJECT {5+}"), Some(5));
        assert_eq!(literal_size("* OK done"), None);
        assert_eq!(literal_size("{abc}"), None);
    }

    #[test]
    fn test_oversized_literal_is_rejected() {
        let mut cursor = Cursor::new(b"* 1 FETCH (BODY[] {999999999999})\r\n".to_vec());
        // The marker is not at the end of the line, so it is plain text.
        assert!(read_response(&mut cursor).unwrap().literals.is_empty());

        let mut cursor = Cursor::new(b"* 1 FETCH (BODY[] {999999999999}\r\n".to_vec());
        assert!(read_response(&mut cursor).is_err());
    }

    #[test]
    fn test_quote_and_literal_need() {
        assert_eq!(quote(r#"say "hi" \o/"#), r#""say \"hi\" \\o/""#);
        assert!(!needs_literal("Undelivered Mail Returned to Sender"));
        assert!(needs_literal("Onbestelbaar: één bericht"));
    }
}
