//! Connection planning: which IMAP endpoints to try, with which credentials,
//! and how connection errors are scrubbed before they are stored.

use std::fmt;
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::config::TimeoutConfig;
use crate::error::{BounceError, Result};
use crate::upstream::{Encryption, SmtpConfig};

/// Characters left as-is by RFC 3986 percent-encoding (`-`, `.`, `_`, `~`
/// and alphanumerics).
const URL_UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Transport security of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Implicit TLS from the first byte (`/ssl`).
    Ssl,
    /// Plain connection upgraded with STARTTLS, which must succeed (`/tls`).
    StartTls,
    /// Plain connection, never upgraded (`/notls`).
    NoTls,
}

impl TlsMode {
    pub fn flag(&self) -> &'static str {
        match self {
            Self::Ssl => "/ssl",
            Self::StartTls => "/tls",
            Self::NoTls => "/notls",
        }
    }
}

/// Login credentials; absent when the account does not authenticate.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Everything needed to open one IMAP session.
#[derive(Debug, Clone)]
pub struct ConnectionSpec {
    pub host: String,
    pub port: u16,
    pub mode: TlsMode,
    pub mailbox: String,
    pub credentials: Option<Credentials>,
    pub open_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl ConnectionSpec {
    /// `{host:port/imap/flags}mailbox`, for logs and error messages.
    pub fn mailbox_string(&self) -> String {
        format!(
            "{{{}:{}/imap{}}}{}",
            self.host,
            self.port,
            self.mode.flag(),
            self.mailbox
        )
    }
}

/// Settings validated before any connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectionPlan {
    pub candidates: Vec<ConnectionSpec>,
    /// Username as configured, kept for redaction even when auth is off.
    pub user: String,
}

impl ConnectionPlan {
    /// Validate the SMTP settings and build the ordered connection attempts.
    ///
    /// Fails without touching the network when the host or port is missing,
    /// or when authentication is on without both username and password.
    pub fn new(smtp: &SmtpConfig, port: u16, mailbox: &str, timeouts: &TimeoutConfig) -> Result<Self> {
        if smtp.host.is_empty() || port == 0 {
            return Err(BounceError::Config(
                "Missing host/port. Check the mail plugin and/or the IMAP port override.".into(),
            ));
        }
        let credentials = if smtp.auth {
            if smtp.user.is_empty() || smtp.password.is_empty() {
                return Err(BounceError::Config(
                    "Authentication is enabled in the mail plugin, but user/pass are missing.".into(),
                ));
            }
            Some(Credentials {
                user: smtp.user.clone(),
                password: smtp.password.clone(),
            })
        } else {
            None
        };

        let candidates = candidate_modes(smtp.encryption, smtp.autotls)
            .into_iter()
            .map(|mode| ConnectionSpec {
                host: smtp.host.clone(),
                port,
                mode,
                mailbox: mailbox.to_string(),
                credentials: credentials.clone(),
                open_timeout: timeouts.open(),
                read_timeout: timeouts.read(),
                write_timeout: timeouts.write(),
            })
            .collect();

        Ok(Self {
            candidates,
            user: smtp.user.clone(),
        })
    }

    /// Server host shared by every candidate.
    pub fn host(&self) -> &str {
        self.candidates.first().map_or("", |c| c.host.as_str())
    }

    /// Password in use, for redaction.
    pub fn password(&self) -> &str {
        self.candidates
            .first()
            .and_then(|c| c.credentials.as_ref())
            .map_or("", |c| c.password.as_str())
    }

    /// Scrub this plan's credentials from an error message.
    pub fn redact(&self, message: &str) -> String {
        redact_credentials(message, &self.user, self.password())
    }
}

/// Connection attempts in order.
///
/// With no encryption configured and auto-TLS on, STARTTLS is tried first
/// and a plain connection is the fallback.
pub fn candidate_modes(encryption: Encryption, autotls: bool) -> Vec<TlsMode> {
    match (encryption, autotls) {
        (Encryption::Ssl, _) => vec![TlsMode::Ssl],
        (Encryption::Tls, true) => vec![TlsMode::StartTls],
        (Encryption::Tls, false) => vec![TlsMode::NoTls],
        (Encryption::None, true) => vec![TlsMode::StartTls, TlsMode::NoTls],
        (Encryption::None, false) => vec![TlsMode::NoTls],
    }
}

/// Replace the username and password (plain and percent-encoded) in `message`.
///
/// Replacement is a single left-to-right pass; at each position the longest
/// matching needle wins and replaced text is never scanned again.
pub fn redact_credentials(message: &str, user: &str, password: &str) -> String {
    let mut needles: Vec<(String, &str)> = Vec::new();
    for (value, label) in [(user, "[redacted-username]"), (password, "[redacted-password]")] {
        if !value.is_empty() && !needles.iter().any(|(n, _)| n == value) {
            needles.push((value.to_string(), label));
        }
    }
    for value in [user, password] {
        if value.is_empty() {
            continue;
        }
        let encoded = utf8_percent_encode(value, URL_UNRESERVED).to_string();
        if !needles.iter().any(|(n, _)| *n == encoded) {
            needles.push((encoded, "[redacted]"));
        }
    }
    if needles.is_empty() {
        return message.to_string();
    }
    needles.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    'scan: while let Some(ch) = rest.chars().next() {
        for (needle, label) in &needles {
            if let Some(after) = rest.strip_prefix(needle.as_str()) {
                out.push_str(label);
                rest = after;
                continue 'scan;
            }
        }
        out.push(ch);
        rest = &rest[ch.len_utf8()..];
    }
    out
}
