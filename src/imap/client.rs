//! Blocking IMAP4rev1 client: plain TCP, STARTTLS, or implicit TLS.
//!
//! Only the read-only subset needed here is implemented: LOGIN, EXAMINE,
//! UID SEARCH, FETCH, LOGOUT.

use std::io::{self, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;

use chrono::Utc;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use tracing::{debug, trace};

use crate::error::{BounceError, Result};
use crate::imap::connect::{ConnectionSpec, TlsMode};
use crate::imap::response::{
    self, needs_literal, parse_capabilities, parse_fetch, parse_search, quote, ResponseLine,
    Status,
};
use crate::imap::session::{Connector, MailSession, MessageOverview};
use crate::parser::header::{
    decode_encoded_words, first_address, get_header, header_fields, parse_date,
    strip_angle_brackets,
};

/// Header fields fetched for overviews.
const OVERVIEW_FIELDS: &str = "SUBJECT FROM TO DATE MESSAGE-ID";

/// Byte stream under the IMAP session.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

/// One command argument.
enum Arg<'a> {
    /// Sent verbatim.
    Atom(&'a str),
    /// Sent quoted, or as a synchronizing literal when it cannot be quoted.
    Str(&'a str),
}

/// An IMAP connection. Tags are `A0001`, `A0002`, ...
pub struct ImapClient<S: Read + Write> {
    stream: BufReader<S>,
    tag: u32,
    capabilities: Vec<String>,
}

impl<S: Read + Write> ImapClient<S> {
    /// Wrap `stream` and read the server greeting.
    pub fn new(stream: S) -> Result<Self> {
        let mut client = Self {
            stream: BufReader::new(stream),
            tag: 0,
            capabilities: Vec::new(),
        };
        let greeting = client.read_line()?;
        match greeting.status() {
            Some(Status::Ok | Status::PreAuth) => {
                client.capabilities = parse_capabilities(&greeting.text);
                Ok(client)
            }
            _ => Err(BounceError::Protocol(format!(
                "unexpected greeting: {}",
                greeting.text
            ))),
        }
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.eq_ignore_ascii_case(name))
    }

    fn next_tag(&mut self) -> String {
        self.tag = self.tag % 9999 + 1;
        format!("A{:04}", self.tag)
    }

    fn read_line(&mut self) -> Result<ResponseLine> {
        let line = response::read_response(&mut self.stream)?;
        trace!(line = %line.text, "S:");
        Ok(line)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.stream.get_mut();
        stream.write_all(bytes)?;
        stream.flush()?;
        Ok(())
    }

    /// Send a command and collect its untagged responses.
    ///
    /// A tagged NO or BAD becomes [`BounceError::Protocol`] carrying the
    /// server's text.
    fn command(&mut self, args: &[Arg<'_>]) -> Result<Vec<ResponseLine>> {
        let tag = self.next_tag();
        let mut pending = tag.clone();

        for arg in args {
            pending.push(' ');
            match arg {
                Arg::Atom(atom) => pending.push_str(atom),
                Arg::Str(s) if !needs_literal(s) => pending.push_str(&quote(s)),
                Arg::Str(s) => {
                    pending.push_str(&format!("{{{}}}\r\n", s.len()));
                    self.write_all(pending.as_bytes())?;
                    pending.clear();
                    let reply = self.read_line()?;
                    if !reply.is_continuation() {
                        return Err(BounceError::Protocol(format!(
                            "literal refused: {}",
                            reply.text
                        )));
                    }
                    pending.push_str(s);
                }
            }
        }
        pending.push_str("\r\n");
        self.write_all(pending.as_bytes())?;

        let mut untagged = Vec::new();
        loop {
            let line = self.read_line()?;
            if line.tag() == Some(tag.as_str()) {
                return match line.status() {
                    Some(Status::Ok) => Ok(untagged),
                    _ => Err(BounceError::Protocol(line.text)),
                };
            }
            if line.is_untagged() && line.status() == Some(Status::Bye) {
                return Err(BounceError::Protocol(line.text));
            }
            let caps = parse_capabilities(&line.text);
            if !caps.is_empty() {
                self.capabilities = caps;
            }
            untagged.push(line);
        }
    }

    fn refresh_capabilities(&mut self) -> Result<()> {
        self.command(&[Arg::Atom("CAPABILITY")])?;
        Ok(())
    }

    pub fn login(&mut self, user: &str, password: &str) -> Result<()> {
        self.command(&[Arg::Atom("LOGIN"), Arg::Str(user), Arg::Str(password)])?;
        Ok(())
    }

    /// Select `mailbox` read-only.
    pub fn examine(&mut self, mailbox: &str) -> Result<()> {
        self.command(&[Arg::Atom("EXAMINE"), Arg::Str(mailbox)])?;
        Ok(())
    }

    pub fn uid_search_unseen(&mut self, subject: &str) -> Result<Vec<u32>> {
        let lines = if subject.is_empty() {
            self.command(&[Arg::Atom("UID SEARCH UNSEEN")])?
        } else if needs_literal(subject) {
            self.command(&[
                Arg::Atom("UID SEARCH CHARSET UTF-8 UNSEEN SUBJECT"),
                Arg::Str(subject),
            ])?
        } else {
            self.command(&[Arg::Atom("UID SEARCH UNSEEN SUBJECT"), Arg::Str(subject)])?
        };
        Ok(parse_search(&lines))
    }

    pub fn uid_fetch_overviews(&mut self, uids: &[u32]) -> Result<Vec<MessageOverview>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let items = format!(
            "(UID FLAGS INTERNALDATE RFC822.SIZE BODY.PEEK[HEADER.FIELDS ({OVERVIEW_FIELDS})])"
        );
        let lines = self.command(&[Arg::Atom("UID FETCH"), Arg::Atom(&set), Arg::Atom(&items)])?;

        Ok(lines
            .iter()
            .filter_map(parse_fetch)
            .filter_map(|item| {
                let mut overview = item
                    .body
                    .as_deref()
                    .map(overview_from_headers)
                    .unwrap_or_default();
                overview.msgno = item.seq;
                overview.uid = item.uid?;
                overview.seen = item.is_seen();
                overview.size = item.size;
                Some(overview)
            })
            .collect())
    }

    pub fn resolve_uid(&mut self, uid: u32) -> Result<Option<u32>> {
        let uid_text = uid.to_string();
        let lines = self.command(&[Arg::Atom("UID FETCH"), Arg::Atom(&uid_text), Arg::Atom("(UID)")])?;
        Ok(lines
            .iter()
            .filter_map(parse_fetch)
            .find(|item| item.uid == Some(uid))
            .map(|item| item.seq))
    }

    pub fn fetch_message(&mut self, msgno: u32) -> Result<Vec<u8>> {
        let seq = msgno.to_string();
        let lines = self.command(&[Arg::Atom("FETCH"), Arg::Atom(&seq), Arg::Atom("BODY.PEEK[]")])?;
        lines
            .iter()
            .filter_map(parse_fetch)
            .find(|item| item.seq == msgno)
            .and_then(|item| item.body)
            .ok_or_else(|| BounceError::Protocol(format!("FETCH {msgno} returned no body")))
    }

    pub fn logout(&mut self) -> Result<()> {
        // The server may close the connection before the tagged OK.
        match self.command(&[Arg::Atom("LOGOUT")]) {
            Ok(_) | Err(BounceError::Protocol(_)) | Err(BounceError::Network(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

/// Overview fields from a block of fetched header lines.
fn overview_from_headers(raw: &[u8]) -> MessageOverview {
    let headers = header_fields(raw);
    let address = |name: &str| {
        get_header(&headers, name)
            .map(decode_encoded_words)
            .and_then(|v| first_address(&v))
    };
    MessageOverview {
        message_id: get_header(&headers, "message-id")
            .map(strip_angle_brackets)
            .filter(|id| !id.is_empty()),
        subject: get_header(&headers, "subject").map(decode_encoded_words),
        from: address("from"),
        to: address("to"),
        date: get_header(&headers, "date")
            .and_then(parse_date)
            .map(|d| d.with_timezone(&Utc)),
        ..Default::default()
    }
}

/// TLS client configuration with the Mozilla root store.
fn tls_config() -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| BounceError::Connection(format!("TLS setup: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn wrap_tls(host: &str, tcp: TcpStream) -> Result<Transport> {
    let name = ServerName::try_from(host.to_string())
        .map_err(|e| BounceError::Connection(format!("invalid server name '{host}': {e}")))?;
    let conn = ClientConnection::new(tls_config()?, name)
        .map_err(|e| BounceError::Connection(format!("TLS setup: {e}")))?;
    Ok(Transport::Tls(Box::new(StreamOwned::new(conn, tcp))))
}

fn connect_tcp(spec: &ConnectionSpec) -> Result<TcpStream> {
    let addrs = (spec.host.as_str(), spec.port)
        .to_socket_addrs()
        .map_err(|e| BounceError::Connection(format!("{}: {e}", spec.host)))?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, spec.open_timeout) {
            Ok(tcp) => {
                tcp.set_read_timeout(Some(spec.read_timeout))?;
                tcp.set_write_timeout(Some(spec.write_timeout))?;
                return Ok(tcp);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(BounceError::Connection(match last_error {
        Some(e) => format!("{}:{}: {e}", spec.host, spec.port),
        None => format!("{}: no address", spec.host),
    }))
}

/// Open a connection per `spec`, log in, and select its mailbox read-only.
pub fn open(spec: &ConnectionSpec) -> Result<ImapClient<Transport>> {
    let tcp = connect_tcp(spec)?;
    let mut client = match spec.mode {
        TlsMode::Ssl => ImapClient::new(wrap_tls(&spec.host, tcp)?)?,
        TlsMode::NoTls => ImapClient::new(Transport::Plain(tcp))?,
        TlsMode::StartTls => {
            let mut plain = ImapClient::new(Transport::Plain(tcp))?;
            if plain.capabilities().is_empty() {
                plain.refresh_capabilities()?;
            }
            if !plain.has_capability("STARTTLS") {
                return Err(BounceError::Connection(
                    "server does not offer STARTTLS".into(),
                ));
            }
            plain.command(&[Arg::Atom("STARTTLS")])?;
            let tag = plain.tag;
            let Transport::Plain(tcp) = plain.into_inner() else {
                return Err(BounceError::Connection("STARTTLS on a TLS stream".into()));
            };
            let mut upgraded = ImapClient {
                stream: BufReader::new(wrap_tls(&spec.host, tcp)?),
                tag,
                capabilities: Vec::new(),
            };
            upgraded.refresh_capabilities()?;
            upgraded
        }
    };

    if let Some(creds) = &spec.credentials {
        client
            .login(&creds.user, &creds.password)
            .map_err(|e| BounceError::Connection(format!("login failed: {e}")))?;
    }
    client.examine(&spec.mailbox)?;
    debug!(mailbox = %spec.mailbox_string(), "Mailbox selected read-only");
    Ok(client)
}

impl<S: Read + Write> MailSession for ImapClient<S> {
    fn search_unseen(&mut self, subject: &str) -> Result<Vec<u32>> {
        self.uid_search_unseen(subject)
    }

    fn fetch_overviews(&mut self, uids: &[u32]) -> Result<Vec<MessageOverview>> {
        self.uid_fetch_overviews(uids)
    }

    fn resolve_uid(&mut self, uid: u32) -> Result<Option<u32>> {
        ImapClient::resolve_uid(self, uid)
    }

    fn fetch_message(&mut self, msgno: u32) -> Result<Vec<u8>> {
        ImapClient::fetch_message(self, msgno)
    }

    fn logout(&mut self) -> Result<()> {
        ImapClient::logout(self)
    }
}

/// Connector opening real IMAP sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImapConnector;

impl Connector for ImapConnector {
    fn open(&self, spec: &ConnectionSpec) -> Result<Box<dyn MailSession>> {
        Ok(Box::new(open(spec)?))
    }
}
