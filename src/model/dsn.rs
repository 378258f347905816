//! Parsed Delivery Status Notification structures (RFC 3464 shaped).

use std::collections::BTreeMap;

use serde::Serialize;

/// Normalize a header-style field name to per-word capitalized form.
///
/// `final-recipient` and `FINAL-RECIPIENT` both become `Final-Recipient`;
/// `reporting-mta` becomes `Reporting-Mta`. Only the first letter of each
/// hyphen-separated word is uppercased, the rest is lowercased.
pub fn normalize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut word_start = true;
    for ch in key.trim().chars() {
        if word_start {
            out.extend(ch.to_uppercase());
        } else {
            out.extend(ch.to_lowercase());
        }
        word_start = ch == '-';
    }
    out
}

/// Fields of one paragraph of DSN text, keyed by normalized name.
///
/// A repeated field keeps its last value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DsnBlock(BTreeMap<String, String>);

impl DsnBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field; the key is normalized first.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(normalize_key(key), value.into());
    }

    /// Look up a field by name in any case.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&normalize_key(key)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copy every field of `other` over this block; `other` wins on collision.
    pub fn overlay(&mut self, other: &DsnBlock) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for DsnBlock {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut block = DsnBlock::new();
        for (k, v) in iter {
            block.insert(k.as_ref(), v);
        }
        block
    }
}

/// A `type; value` field such as `rfc822; user@example.com`.
///
/// An absent field is represented with every member `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeValueField {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub value: Option<String>,
    pub raw: Option<String>,
}

impl TypeValueField {
    /// Split on the first semicolon. Both halves are trimmed; an empty type
    /// becomes `None`, a missing semicolon leaves `value` as `None`.
    pub fn split(raw: Option<&str>) -> Self {
        let Some(raw) = raw.filter(|r| !r.is_empty()) else {
            return Self::default();
        };
        let (kind, value) = match raw.split_once(';') {
            Some((kind, value)) => (kind.trim(), Some(value.trim().to_string())),
            None => (raw.trim(), None),
        };
        Self {
            kind: (!kind.is_empty()).then(|| kind.to_string()),
            value,
            raw: Some(raw.to_string()),
        }
    }

    /// The value half when it is non-empty; for recipient fields this is the address.
    pub fn address(&self) -> Option<&str> {
        self.value.as_deref().filter(|v| !v.is_empty())
    }

    pub fn is_absent(&self) -> bool {
        self.raw.is_none()
    }
}

/// Enhanced mail system status code (RFC 3463), e.g. `5.1.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DsnStatus {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

impl DsnStatus {
    /// Parse the leading `class.subject.detail` token; trailing comments are ignored.
    pub fn parse(input: &str) -> Option<Self> {
        let token = input.split_whitespace().next()?;
        let mut parts = token.split('.');
        let class = parts.next()?.parse().ok()?;
        let subject = parts.next()?.parse().ok()?;
        let detail = parts.next()?.parse().ok()?;
        if parts.next().is_some() || !(2..=5).contains(&class) {
            return None;
        }
        Some(Self {
            class,
            subject,
            detail,
        })
    }

    /// Class 5: the delivery failed permanently.
    pub fn is_permanent(&self) -> bool {
        self.class == 5
    }
}

/// One per-recipient block of a DSN.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecipientReport {
    #[serde(rename = "Final-Recipient")]
    pub final_recipient: TypeValueField,
    #[serde(rename = "Original-Recipient")]
    pub original_recipient: TypeValueField,
    #[serde(rename = "Action")]
    pub action: Option<String>,
    #[serde(rename = "Status")]
    pub status: Option<String>,
    #[serde(rename = "Diagnostic-Code")]
    pub diagnostic_code: TypeValueField,
    /// Every field of the block, including the ones decomposed above.
    #[serde(skip)]
    pub fields: DsnBlock,
}

impl RecipientReport {
    /// Build the structured view of one recipient block.
    pub fn from_block(block: &DsnBlock) -> Self {
        Self {
            final_recipient: TypeValueField::split(block.get("Final-Recipient")),
            original_recipient: TypeValueField::split(block.get("Original-Recipient")),
            action: block.get("Action").map(str::to_string),
            status: block.get("Status").map(str::to_string),
            diagnostic_code: TypeValueField::split(block.get("Diagnostic-Code")),
            fields: block.clone(),
        }
    }

    /// `Status` parsed as an enhanced status code, when well formed.
    pub fn status_code(&self) -> Option<DsnStatus> {
        self.status.as_deref().and_then(DsnStatus::parse)
    }
}

/// Output of the DSN text parser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedDsn {
    /// First block: reporting agent, arrival date, original sender.
    pub per_message: DsnBlock,
    pub per_recipient: Vec<RecipientReport>,
    /// `per_message` overlaid with the first recipient block's raw fields.
    pub flat: DsnBlock,
}

impl ParsedDsn {
    pub fn first_recipient(&self) -> Option<&RecipientReport> {
        self.per_recipient.first()
    }
}
