//! Adapter over the external mail plugin's option export.
//!
//! The plugin stores its settings as a loosely typed document. This module is
//! the only place that tolerates missing or oddly typed keys; everything past
//! it works with [`SmtpConfig`].

use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{BounceError, Result};

/// Transport security configured for the SMTP account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Encryption {
    #[default]
    None,
    Ssl,
    Tls,
}

impl Encryption {
    /// Anything other than `ssl` / `tls` (any case) means none.
    pub fn from_option(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "ssl" => Self::Ssl,
            "tls" => Self::Tls,
            _ => Self::None,
        }
    }
}

/// SMTP account settings borrowed for the IMAP login.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SmtpConfig {
    pub host: String,
    /// SMTP port; 0 when unset.
    pub port: u16,
    pub encryption: Encryption,
    pub auth: bool,
    pub autotls: bool,
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("encryption", &self.encryption)
            .field("auth", &self.auth)
            .field("autotls", &self.autotls)
            .field("user", &self.user)
            .field("password", &"<hidden>")
            .finish()
    }
}

/// Whether the plugin is usable at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpstreamStatus {
    pub has_plugin: bool,
    pub is_smtp: bool,
}

impl UpstreamStatus {
    /// Fail with the matching configuration error unless the plugin is active
    /// and uses the SMTP mailer.
    pub fn require_smtp(&self) -> Result<()> {
        if !self.has_plugin {
            return Err(BounceError::UpstreamInactive);
        }
        if !self.is_smtp {
            return Err(BounceError::UpstreamNotSmtp);
        }
        Ok(())
    }
}

/// Turns the stored password into the plain one.
pub trait CredentialDecryptor {
    /// `None` when the value cannot be decrypted.
    fn decrypt(&self, stored: &str) -> Option<String>;
}

/// Decryptor for exports that already hold plain passwords.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCredentials;

impl CredentialDecryptor for PlainCredentials {
    fn decrypt(&self, stored: &str) -> Option<String> {
        Some(stored.to_string())
    }
}

/// Snapshot of the plugin's options.
#[derive(Debug, Clone, Default)]
pub struct UpstreamOptions {
    present: bool,
    doc: Value,
}

impl UpstreamOptions {
    /// Load the export at `path`. A missing file (or no path at all) means
    /// the plugin is not installed; that is a status, not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            debug!("No upstream options file configured");
            return Ok(Self::default());
        };
        if !path.exists() {
            warn!(path = %path.display(), "Upstream options file not found");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| BounceError::io(path, e))?;
        Self::from_json(&text).map_err(|e| {
            BounceError::Config(format!("Upstream options '{}': {e}", path.display()))
        })
    }

    /// Parse an export document.
    pub fn from_json(text: &str) -> Result<Self> {
        let doc: Value = serde_json::from_str(text)?;
        if !doc.is_object() {
            return Err(BounceError::Config("options export is not an object".into()));
        }
        Ok(Self { present: true, doc })
    }

    pub fn status(&self) -> UpstreamStatus {
        let active = self.doc.get("active").and_then(flag).unwrap_or(true);
        let mailer = self
            .doc
            .pointer("/mail/mailer")
            .and_then(Value::as_str)
            .unwrap_or_default();
        UpstreamStatus {
            has_plugin: self.present && active,
            is_smtp: mailer.eq_ignore_ascii_case("smtp"),
        }
    }

    /// The typed SMTP settings. Missing `auth` and `autotls` default to on.
    ///
    /// A password that fails to decrypt is passed on as stored; the IMAP
    /// login will then report the authentication failure.
    pub fn smtp_config(&self, decryptor: &dyn CredentialDecryptor) -> SmtpConfig {
        let smtp = self.doc.get("smtp");
        let get = |key: &str| smtp.and_then(|s| s.get(key));
        let text = |key: &str| get(key).map(text_value).unwrap_or_default();

        let stored_password = text("pass");
        let password = if stored_password.is_empty() {
            String::new()
        } else {
            match decryptor.decrypt(&stored_password) {
                Some(plain) if !plain.is_empty() => plain,
                _ => {
                    warn!("Could not decrypt SMTP password, using stored value");
                    stored_password
                }
            }
        };

        SmtpConfig {
            host: text("host").trim().to_string(),
            port: get("port").and_then(port_value).unwrap_or(0),
            encryption: Encryption::from_option(&text("encryption")),
            auth: get("auth").and_then(flag).unwrap_or(true),
            autotls: get("autotls").and_then(flag).unwrap_or(true),
            user: text("user"),
            password,
        }
    }
}

/// Loose truthiness: booleans, numbers, and `"0"` / `""` strings.
fn flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64().is_some_and(|f| f != 0.0)),
        Value::String(s) => Some(!(s.is_empty() || s == "0")),
        Value::Null => Some(false),
        _ => None,
    }
}

fn text_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn port_value(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
