//! MIME structure: builds the part tree of a raw message and locates the part
//! carrying the delivery report.

use std::collections::HashMap;
use std::ops::Range;

use mail_parser::{Message, MessageParser, MimeHeaders, PartType};
use tracing::{debug, warn};

use crate::model::mime::{MediaType, MimeNode, PartAddress, TransferEncoding};
use crate::parser::decode;

/// Maximum depth for recursive multipart parsing (to prevent stack overflow on adversarial input).
const MAX_DEPTH: usize = 10;

/// Content-Type parameters carried into the tree.
const CONTENT_PARAMETERS: [&str; 3] = ["charset", "name", "report-type"];

/// Gives access to the raw (still transfer-encoded) body of a leaf.
pub trait MessageAccessor {
    fn fetch_part(&self, address: &PartAddress) -> Option<Vec<u8>>;
}

/// A raw message together with its parsed part tree and leaf body ranges.
pub struct RawMessage<'a> {
    raw: &'a [u8],
    root: Option<MimeNode>,
    bodies: HashMap<PartAddress, Range<usize>>,
}

impl<'a> RawMessage<'a> {
    /// Parse the MIME structure of `raw`. A message `mail-parser` cannot read
    /// has no structure.
    pub fn parse(raw: &'a [u8]) -> Self {
        let mut bodies = HashMap::new();
        let root = MessageParser::default()
            .parse(raw)
            .and_then(|msg| build_node(&msg, 0, PartAddress::new(Vec::new()), 0, &mut bodies));

        Self { raw, root, bodies }
    }

    pub fn structure(&self) -> Option<&MimeNode> {
        self.root.as_ref()
    }
}

impl MessageAccessor for RawMessage<'_> {
    fn fetch_part(&self, address: &PartAddress) -> Option<Vec<u8>> {
        let range = self.bodies.get(address)?;
        self.raw.get(range.clone()).map(<[u8]>::to_vec)
    }
}

/// Leaves are addressed by their path; a single-part message's body is `1`.
fn leaf_address(address: &PartAddress) -> PartAddress {
    if address.segments().is_empty() {
        PartAddress::new(vec![1])
    } else {
        address.clone()
    }
}

fn build_node(
    msg: &Message<'_>,
    part_id: usize,
    address: PartAddress,
    depth: usize,
    bodies: &mut HashMap<PartAddress, Range<usize>>,
) -> Option<MimeNode> {
    let part = msg.parts.get(part_id)?;

    let (media_type, subtype) = match part.content_type() {
        Some(ct) => (
            MediaType::from_name(ct.ctype()),
            ct.subtype().unwrap_or_default().to_ascii_lowercase(),
        ),
        None => (MediaType::Text, "plain".to_string()),
    };

    let mut node = MimeNode::leaf(media_type, &subtype)
        .with_encoding(TransferEncoding::from_header(part.content_transfer_encoding()));
    if let Some(ct) = part.content_type() {
        for name in CONTENT_PARAMETERS {
            if let Some(value) = ct.attribute(name) {
                node = node.with_parameter(name, value);
            }
        }
    }
    if let Some(filename) = part.content_disposition().and_then(|cd| cd.attribute("filename")) {
        node = node.with_filename(filename);
    }

    match &part.body {
        PartType::Multipart(children) => {
            // A multipart node never carries a body of its own.
            node.media_type = MediaType::Multipart;
            if depth >= MAX_DEPTH {
                warn!(part = %address, "MIME nesting too deep, ignoring children");
                return Some(node);
            }
            for (index, child_id) in children.iter().enumerate() {
                let child_address = address.child(index as u32 + 1);
                if let Some(child) = build_node(msg, *child_id as usize, child_address, depth + 1, bodies) {
                    node.children.push(child);
                }
            }
        }
        _ => {
            bodies.insert(
                leaf_address(&address),
                part.raw_body_offset()..part.raw_end_offset(),
            );
        }
    }

    Some(node)
}

/// The located delivery report: where it was and its decoded text.
#[derive(Debug, Clone, PartialEq)]
pub struct DsnPart {
    pub address: PartAddress,
    /// `type/subtype` of the selected leaf.
    pub mime_type: String,
    pub text: String,
}

/// True when `name` ends in a file extension (`.` followed by 1+ alphanumerics).
pub fn has_extension(name: &str) -> bool {
    match name.rfind('.') {
        Some(pos) => {
            let ext = &name[pos + 1..];
            !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

/// Leaves named like a real file are attachments, never the report.
fn is_excluded(node: &MimeNode) -> bool {
    node.filename().is_some_and(has_extension) || node.name().is_some_and(has_extension)
}

fn is_report_fallback(node: &MimeNode) -> bool {
    if !node.is_type(&MediaType::Text, "plain") {
        return false;
    }
    let names_report = |s: &str| s.to_lowercase().contains("delivery report");
    let unnamed = node.filename().is_none() && node.name().is_none();
    unnamed || node.filename().is_some_and(names_report) || node.name().is_some_and(names_report)
}

/// Pick the leaf holding the DSN payload.
///
/// A `message/delivery-status` leaf anywhere in the tree wins; otherwise the
/// first unnamed (or "delivery report" named) `text/plain` leaf is used.
/// Leaves named with a file extension are never selected.
pub fn select_dsn_leaf(root: &MimeNode) -> Option<(PartAddress, &MimeNode)> {
    let mut fallback = None;
    let found = walk(root, PartAddress::new(Vec::new()), &mut fallback);
    found.or(fallback)
}

fn walk<'a>(
    node: &'a MimeNode,
    address: PartAddress,
    fallback: &mut Option<(PartAddress, &'a MimeNode)>,
) -> Option<(PartAddress, &'a MimeNode)> {
    if !node.is_leaf() {
        for (index, child) in node.children.iter().enumerate() {
            if let Some(found) = walk(child, address.child(index as u32 + 1), fallback) {
                return Some(found);
            }
        }
        return None;
    }

    if node.media_type == MediaType::Multipart || is_excluded(node) {
        return None;
    }
    let address = leaf_address(&address);
    if node.is_type(&MediaType::Message, "delivery-status") {
        return Some((address, node));
    }
    if fallback.is_none() && is_report_fallback(node) {
        *fallback = Some((address, node));
    }
    None
}

/// Locate, fetch, and decode the delivery report of a message.
///
/// Returns `None` when no leaf qualifies or its body cannot be fetched; most
/// subject matches that are not real DSNs end up here.
pub fn find_dsn_part(root: &MimeNode, accessor: &dyn MessageAccessor) -> Option<DsnPart> {
    let (address, node) = select_dsn_leaf(root)?;

    let Some(raw) = accessor.fetch_part(&address) else {
        warn!(part = %address, "Selected DSN part could not be fetched");
        return None;
    };
    debug!(part = %address, mime = %node.mime_type(), len = raw.len(), "Found DSN part");

    Some(DsnPart {
        mime_type: node.mime_type(),
        text: decode::decode_with_charset(&raw, &node.encoding, node.charset()),
        address,
    })
}

/// Parse `raw` and locate its delivery report in one step.
pub fn extract_dsn(raw: &[u8]) -> Option<DsnPart> {
    let message = RawMessage::parse(raw);
    let root = message.structure()?;
    find_dsn_part(root, &message)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MapAccessor(HashMap<String, Vec<u8>>);

    impl MessageAccessor for MapAccessor {
        fn fetch_part(&self, address: &PartAddress) -> Option<Vec<u8>> {
            self.0.get(&address.to_string()).cloned()
        }
    }

    fn accessor(parts: &[(&str, &[u8])]) -> MapAccessor {
        MapAccessor(
            parts
                .iter()
                .map(|(addr, body)| (addr.to_string(), body.to_vec()))
                .collect(),
        )
    }

    fn text_plain() -> MimeNode {
        MimeNode::leaf(MediaType::Text, "plain")
    }

    fn delivery_status() -> MimeNode {
        MimeNode::leaf(MediaType::Message, "delivery-status")
    }

    #[test]
    fn test_has_extension() {
        assert!(has_extension("report.txt"));
        assert!(has_extension("SCAN.PDF"));
        assert!(!has_extension("delivery report"));
        assert!(!has_extension("trailing."));
        assert!(!has_extension("odd.tar-gz"));
    }

    #[test]
    fn test_delivery_status_preferred_over_text() {
        let root = MimeNode::multipart(
            "report",
            vec![text_plain(), delivery_status(), MimeNode::leaf(MediaType::Message, "rfc822")],
        );
        let acc = accessor(&[("1", b"human summary"), ("2", b"Action: failed\n")]);
        let found = find_dsn_part(&root, &acc).unwrap();
        assert_eq!(found.address.to_string(), "2");
        assert_eq!(found.mime_type, "message/delivery-status");
        assert_eq!(found.text, "Action: failed\n");
    }

    #[test]
    fn test_nested_delivery_status_wins_over_earlier_text() {
        let root = MimeNode::multipart(
            "mixed",
            vec![
                text_plain(),
                MimeNode::multipart("report", vec![text_plain(), delivery_status()]),
            ],
        );
        let (address, _) = select_dsn_leaf(&root).unwrap();
        assert_eq!(address.to_string(), "2.2");
    }

    #[test]
    fn test_text_fallback_when_no_delivery_status() {
        let root = MimeNode::multipart(
            "mixed",
            vec![
                MimeNode::leaf(MediaType::Text, "html"),
                text_plain().with_parameter("name", "Delivery report"),
            ],
        );
        let (address, _) = select_dsn_leaf(&root).unwrap();
        assert_eq!(address.to_string(), "2");
    }

    #[test]
    fn test_named_text_plain_is_not_a_fallback() {
        let root = MimeNode::multipart("mixed", vec![text_plain().with_parameter("name", "notes")]);
        assert!(select_dsn_leaf(&root).is_none());
    }

    #[test]
    fn test_extension_excludes_only_text_plain() {
        let root = MimeNode::multipart("mixed", vec![text_plain().with_filename("report.txt")]);
        let acc = accessor(&[("1", b"Final-Recipient: rfc822; a@b.com")]);
        assert!(find_dsn_part(&root, &acc).is_none());
    }

    #[test]
    fn test_extension_excludes_delivery_status() {
        let root = MimeNode::multipart(
            "report",
            vec![delivery_status().with_filename("status.dsn"), text_plain()],
        );
        let (address, node) = select_dsn_leaf(&root).unwrap();
        assert_eq!(address.to_string(), "2");
        assert!(node.is_type(&MediaType::Text, "plain"));
    }

    #[test]
    fn test_pdf_only_message_has_no_dsn() {
        let root = MimeNode::multipart(
            "mixed",
            vec![MimeNode::leaf(MediaType::Application, "pdf").with_filename("invoice.pdf")],
        );
        assert!(find_dsn_part(&root, &accessor(&[])).is_none());
    }

    #[test]
    fn test_single_part_message_is_addressed_one() {
        let acc = accessor(&[("1", b"Status: 5.1.1")]);
        let found = find_dsn_part(&text_plain(), &acc).unwrap();
        assert_eq!(found.address.to_string(), "1");
        assert_eq!(found.text, "Status: 5.1.1");
    }

    #[test]
    fn test_decodes_with_declared_encoding() {
        let root = MimeNode::multipart(
            "report",
            vec![delivery_status().with_encoding(TransferEncoding::Base64)],
        );
        let acc = accessor(&[("1", b"U3RhdHVzOiA1LjEuMQ==")]);
        assert_eq!(find_dsn_part(&root, &acc).unwrap().text, "Status: 5.1.1");
    }

    #[test]
    fn test_unfetchable_part() {
        let root = MimeNode::multipart("report", vec![delivery_status()]);
        assert!(find_dsn_part(&root, &accessor(&[])).is_none());
    }

    #[test]
    fn test_raw_message_structure() {
        let raw = b"From: MAILER-DAEMON@example.org\r\n\
Subject: Undelivered Mail Returned to Sender\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/report; report-type=delivery-status; boundary=\"BND\"\r\n\
\r\n\
--BND\r\n\
Content-Type: text/plain; charset=us-ascii\r\n\
\r\n\
I'm sorry to have to inform you that your message could not be delivered.\r\n\
--BND\r\n\
Content-Type: message/delivery-status\r\n\
\r\n\
Arrival-Date: Mon, 1 Jan 2024 10:00:00 +0000\r\n\
\r\n\
Final-Recipient: rfc822; a@b.com\r\n\
Action: failed\r\n\
--BND--\r\n";

        let message = RawMessage::parse(raw);
        let root = message.structure().unwrap();
        assert_eq!(root.mime_type(), "multipart/report");
        assert_eq!(root.children.len(), 2);
        assert_eq!(root.children[0].charset(), Some("us-ascii"));
        assert!(root.children[1].is_type(&MediaType::Message, "delivery-status"));

        let found = find_dsn_part(root, &message).unwrap();
        assert_eq!(found.address.to_string(), "2");
        assert!(found.text.starts_with("Arrival-Date: Mon, 1 Jan 2024 10:00:00 +0000"));
        assert!(found.text.contains("Final-Recipient: rfc822; a@b.com"));
        assert!(!found.text.contains("--BND"));
    }
}
