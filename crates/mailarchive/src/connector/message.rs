//! RFC 5322 parsing shared by every connector: raw bytes in, `EmailObject`
//! out, with message identity and thread id resolved consistently.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use mail_parser::{Address, Message, MessageParser, MimeHeaders};
use sha2::{Digest, Sha256};

use super::{ConnectorError, EmailAddress, EmailAttachment, EmailObject, Result};

/// Placeholder sender for messages without a usable `From` header.
pub const NO_SENDER: &str = "No Sender";

/// Provider-side facts that the raw message does not carry.
#[derive(Debug, Clone, Default)]
pub struct RawContext {
    pub id: String,
    pub native_thread_id: Option<String>,
    pub path: Option<String>,
    pub tags: Vec<String>,
}

impl RawContext {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn thread(mut self, thread_id: Option<String>) -> Self {
        self.native_thread_id = thread_id.filter(|t| !t.is_empty());
        self
    }

    pub fn path(mut self, path: Option<String>) -> Self {
        self.path = path.filter(|p| !p.is_empty());
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Parses a raw message into an [`EmailObject`].
pub fn parse_raw_email(raw: &[u8], ctx: RawContext) -> Result<EmailObject> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| ConnectorError::Parse(format!("message {} is not valid RFC 5322", ctx.id)))?;

    let message_id = message_identity(&message, raw);
    let thread_id = resolve_thread_id(ctx.native_thread_id, &message);
    if thread_id.is_none() {
        warn!("No thread id could be derived for message {}", ctx.id);
    }

    let attachments = message
        .attachments()
        .map(|part| {
            let filename = part.attachment_name().unwrap_or("attachment").to_string();
            // Parts without a Content-Type fall back to the filename extension.
            let content_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| {
                    mime_guess::from_path(&filename)
                        .first_or_octet_stream()
                        .essence_str()
                        .to_string()
                });
            let content = part.contents().to_vec();
            EmailAttachment {
                filename,
                content_type,
                size: content.len(),
                content,
            }
        })
        .collect::<Vec<_>>();

    debug!(
        "Parsed message {} ({} bytes, {} attachments)",
        ctx.id,
        raw.len(),
        attachments.len()
    );

    let mut from = addresses(message.from());
    if from.is_empty() {
        from.push(EmailAddress {
            name: Some(NO_SENDER.to_string()),
            address: NO_SENDER.to_string(),
        });
    }

    Ok(EmailObject {
        id: ctx.id,
        message_id,
        from,
        to: addresses(message.to()),
        cc: addresses(message.cc()),
        bcc: addresses(message.bcc()),
        subject: message.subject().unwrap_or_default().to_string(),
        body: message.body_text(0).map(|b| b.into_owned()).unwrap_or_default(),
        html: message.body_html(0).map(|b| b.into_owned()).unwrap_or_default(),
        headers: header_map(&message, raw),
        attachments,
        received_at: message
            .date()
            .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
            .unwrap_or_else(Utc::now),
        eml: raw.to_vec(),
        thread_id,
        path: ctx.path,
        tags: ctx.tags,
    })
}

/// The `Message-ID` header, or a content hash when the header is missing.
fn message_identity(message: &Message<'_>, raw: &[u8]) -> String {
    match message.message_id().map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => id.to_string(),
        None => format!("generated-{}", sha256_hex(raw)),
    }
}

/// Thread id precedence: provider-native id, first `References` entry,
/// `In-Reply-To`, `Conversation-Id`, then the message's own id.
fn resolve_thread_id(native: Option<String>, message: &Message<'_>) -> Option<String> {
    native
        .or_else(|| message.header_raw("References").and_then(first_msg_id))
        .or_else(|| message.header_raw("In-Reply-To").and_then(first_msg_id))
        .or_else(|| {
            message
                .header_raw("Conversation-Id")
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        })
        .or_else(|| {
            message
                .message_id()
                .filter(|id| !id.is_empty())
                .map(str::to_string)
        })
}

/// First `<id>` token of a header value, without the angle brackets.
fn first_msg_id(value: &str) -> Option<String> {
    value
        .split_whitespace()
        .next()
        .map(|token| token.trim_matches(|c| c == '<' || c == '>' || c == ','))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

fn addresses(address: Option<&Address<'_>>) -> Vec<EmailAddress> {
    let Some(address) = address else {
        return Vec::new();
    };
    address
        .iter()
        .filter_map(|addr| {
            addr.address().map(|email| EmailAddress {
                name: addr.name().map(str::to_string),
                address: email.to_string(),
            })
        })
        .collect()
}

fn header_map(message: &Message<'_>, raw: &[u8]) -> BTreeMap<String, Vec<String>> {
    let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for header in message.headers() {
        let value = raw
            .get(header.offset_start as usize..header.offset_end as usize)
            .map(|bytes| String::from_utf8_lossy(bytes).trim().to_string())
            .unwrap_or_default();
        headers
            .entry(header.name().to_ascii_lowercase())
            .or_default()
            .push(value);
    }
    headers
}

/// Sanitizes an attachment filename for use as a storage key segment.
pub fn sanitize_filename(filename: &str) -> String {
    let filename = filename
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();

    let filename = filename.trim_matches(|c| c == '.' || c == '_');

    if filename.is_empty() {
        return "attachment".to_string();
    }
    if filename.chars().count() > 200 {
        let ext = filename
            .rfind('.')
            .map(|i| &filename[i..])
            .filter(|ext| ext.len() <= 16)
            .unwrap_or("");
        let base: String = filename.chars().take(200 - ext.chars().count()).collect();
        return format!("{}{}", base, ext);
    }
    filename.to_string()
}
