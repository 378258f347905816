//! MIME structure types: the part tree of a fetched message and part addresses.

use std::collections::BTreeMap;
use std::fmt;

/// Top-level media type of a MIME part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    Text,
    Multipart,
    Message,
    Application,
    Audio,
    Image,
    Video,
    Other(String),
}

impl MediaType {
    /// Map a `Content-Type` top-level type (any case) to a [`MediaType`].
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "text" => Self::Text,
            "multipart" => Self::Multipart,
            "message" => Self::Message,
            "application" => Self::Application,
            "audio" => Self::Audio,
            "image" => Self::Image,
            "video" => Self::Video,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Text => "text",
            Self::Multipart => "multipart",
            Self::Message => "message",
            Self::Application => "application",
            Self::Audio => "audio",
            Self::Image => "image",
            Self::Video => "video",
            Self::Other(name) => name,
        }
    }
}

/// Declared `Content-Transfer-Encoding` of a leaf.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransferEncoding {
    #[default]
    SevenBit,
    EightBit,
    Binary,
    Base64,
    QuotedPrintable,
    /// Anything else; decoded as identity.
    Other(String),
}

impl TransferEncoding {
    /// Parse a header value; an absent header means 7bit.
    pub fn from_header(value: Option<&str>) -> Self {
        let Some(value) = value else {
            return Self::SevenBit;
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "7bit" => Self::SevenBit,
            "8bit" => Self::EightBit,
            "binary" => Self::Binary,
            "base64" => Self::Base64,
            "quoted-printable" => Self::QuotedPrintable,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One node of a message's MIME tree.
///
/// Built fresh for every fetched message and dropped after navigation.
/// Only leaves (nodes without children) are ever fetched as bodies.
#[derive(Debug, Clone, PartialEq)]
pub struct MimeNode {
    pub media_type: MediaType,
    /// Lowercased subtype, e.g. `plain`, `delivery-status`, `mixed`.
    pub subtype: String,
    pub encoding: TransferEncoding,
    /// `Content-Type` parameters, keys lowercased.
    pub parameters: BTreeMap<String, String>,
    /// `Content-Disposition` parameters, keys lowercased.
    pub disposition_parameters: BTreeMap<String, String>,
    pub children: Vec<MimeNode>,
}

impl MimeNode {
    /// A leaf of the given type with no parameters.
    pub fn leaf(media_type: MediaType, subtype: &str) -> Self {
        Self {
            media_type,
            subtype: subtype.to_ascii_lowercase(),
            encoding: TransferEncoding::SevenBit,
            parameters: BTreeMap::new(),
            disposition_parameters: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    /// A multipart node holding `children`.
    pub fn multipart(subtype: &str, children: Vec<MimeNode>) -> Self {
        Self {
            children,
            ..Self::leaf(MediaType::Multipart, subtype)
        }
    }

    pub fn with_encoding(mut self, encoding: TransferEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_parameter(mut self, name: &str, value: &str) -> Self {
        self.parameters
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_filename(mut self, filename: &str) -> Self {
        self.disposition_parameters
            .insert("filename".to_string(), filename.to_string());
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_type(&self, media_type: &MediaType, subtype: &str) -> bool {
        &self.media_type == media_type && self.subtype.eq_ignore_ascii_case(subtype)
    }

    /// The `filename` disposition parameter, if non-empty.
    pub fn filename(&self) -> Option<&str> {
        self.disposition_parameters
            .get("filename")
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    /// The `name` content-type parameter, if non-empty.
    pub fn name(&self) -> Option<&str> {
        self.parameters
            .get("name")
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn charset(&self) -> Option<&str> {
        self.parameters.get("charset").map(String::as_str)
    }

    /// `type/subtype`, for logging.
    pub fn mime_type(&self) -> String {
        format!("{}/{}", self.media_type.as_str(), self.subtype)
    }
}

/// Dotted 1-based path of a part inside the tree, e.g. `2.1`.
///
/// A non-multipart message has a single part addressed `1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartAddress(Vec<u32>);

impl PartAddress {
    pub fn new(segments: Vec<u32>) -> Self {
        Self(segments)
    }

    pub fn segments(&self) -> &[u32] {
        &self.0
    }

    /// Address of the `index`-th (1-based) child of this part.
    pub fn child(&self, index: u32) -> Self {
        let mut segments = self.0.clone();
        segments.push(index);
        Self(segments)
    }

    /// Parse `"2.1"`; rejects empty input and zero segments.
    pub fn parse(input: &str) -> Option<Self> {
        let segments = input
            .trim()
            .split('.')
            .map(|s| s.parse::<u32>().ok().filter(|n| *n > 0))
            .collect::<Option<Vec<_>>>()?;
        if segments.is_empty() {
            None
        } else {
            Some(Self(segments))
        }
    }
}

impl fmt::Display for PartAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self
            .0
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(".");
        f.write_str(&text)
    }
}

impl serde::Serialize for PartAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}
