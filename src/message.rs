//! Building the MIME message sent to each recipient.
//!
//! Building is pure: the same inputs always give the same bytes. MIME
//! boundaries are derived from a digest of the inputs rather than from the
//! clock or a random source.

use std::{fmt::Write, path::Path};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::BuildError;

/// Plain-text part used when only an HTML body was supplied.
pub const HTML_FALLBACK_NOTICE: &str =
    "This message contains HTML content. Please view in an HTML-capable client.";

/// Content type for attachments whose type cannot be told from the name.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Suffixes naming a content encoding (compression) rather than a type.
const ENCODING_SUFFIXES: &[&str] = &[
    "gz", "z", "bz2", "xz", "br", "tgz", "taz", "tz", "tbz2", "txz",
];

/// Longest line allowed in a 7bit body (RFC 5322 section 2.1.1).
const MAX_LINE_OCTETS: usize = 998;

/// Base64 output is wrapped at this many characters.
const BASE64_LINE: usize = 76;

/// A file attached to every message of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// The filename to use in the MIME header.
    pub filename: String,
    /// The MIME content type (e.g., "application/pdf").
    pub content_type: String,
    /// The attachment data.
    pub data: Vec<u8>,
}

impl Attachment {
    /// Creates an attachment, inferring its type from `filename`.
    #[must_use]
    pub fn new(filename: impl Into<String>, data: Vec<u8>) -> Self {
        let filename = filename.into();
        Self {
            content_type: guess_content_type(&filename),
            filename,
            data,
        }
    }

    /// Reads an attachment from the filesystem.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned());

        let data = tokio::fs::read(path).await?;
        Ok(Self::new(filename, data))
    }
}

/// Guesses the MIME content type from a file name.
///
/// Compressed files (`.gz`, `.bz2`, `.xz`, …) and unknown extensions are
/// `application/octet-stream`.
#[must_use]
pub fn guess_content_type(filename: &str) -> String {
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    if extension.is_some_and(|e| ENCODING_SUFFIXES.contains(&e.as_str())) {
        return OCTET_STREAM.to_string();
    }

    mime_guess::from_path(filename)
        .first_raw()
        .unwrap_or(OCTET_STREAM)
        .to_string()
}

/// The content shared by every message of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSpec {
    pub sender: String,
    pub subject: String,
    /// Plain-text body, possibly empty.
    #[serde(default)]
    pub text: String,
    /// HTML body. Empty counts as absent.
    #[serde(default)]
    pub html: Option<String>,
}

impl MessageSpec {
    #[must_use]
    pub fn new(sender: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            subject: subject.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    #[must_use]
    pub fn html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    fn html_body(&self) -> Option<&str> {
        self.html.as_deref().filter(|html| !html.is_empty())
    }
}

/// The body of a message, without attachments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Plain(String),
    /// Plain text first, HTML as the preferred alternative.
    Alternative { text: String, html: String },
}

/// One recipient's message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<'a> {
    headers: Vec<(&'static str, String)>,
    body: Body,
    attachments: &'a [Attachment],
    boundary: String,
}

/// Builds the message for one recipient.
///
/// `From`, `To` and `Subject` are copied verbatim; a non-ASCII subject is
/// carried as RFC 2047 encoded words.
///
/// # Errors
///
/// Returns [`BuildError::HeaderInjection`] if a header value or attachment
/// name contains a line break.
pub fn build_message<'a>(
    spec: &MessageSpec,
    recipient: &str,
    attachments: &'a [Attachment],
) -> Result<Message<'a>, BuildError> {
    check_header("From", &spec.sender)?;
    check_header("To", recipient)?;
    check_header("Subject", &spec.subject)?;
    for attachment in attachments {
        check_header("filename", &attachment.filename)?;
    }

    let body = match spec.html_body() {
        Some(html) => Body::Alternative {
            text: if spec.text.is_empty() {
                HTML_FALLBACK_NOTICE.to_string()
            } else {
                spec.text.clone()
            },
            html: html.to_string(),
        },
        None => Body::Plain(spec.text.clone()),
    };

    let headers = vec![
        ("From", spec.sender.clone()),
        ("To", recipient.to_string()),
        ("Subject", encode_header(&spec.subject)),
        ("MIME-Version", "1.0".to_string()),
    ];

    let boundary = boundary_seed(&headers, &body, attachments);

    Ok(Message {
        headers,
        body,
        attachments,
        boundary,
    })
}

impl Message<'_> {
    /// The first header called `name`, as it will be written.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    #[must_use]
    pub const fn body(&self) -> &Body {
        &self.body
    }

    /// 1 for plain text, 2 when an HTML alternative is present.
    #[must_use]
    pub const fn body_parts(&self) -> usize {
        match self.body {
            Body::Plain(_) => 1,
            Body::Alternative { .. } => 2,
        }
    }

    #[must_use]
    pub const fn attachments(&self) -> &[Attachment] {
        self.attachments
    }

    /// The message in wire format, with CRLF line endings.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(
            1024 + self.attachments.iter().map(|a| a.data.len() * 4 / 3 + 256).sum::<usize>(),
        );

        for (name, value) in &self.headers {
            let _ = write!(out, "{name}: {value}\r\n");
        }

        if self.attachments.is_empty() {
            self.write_body(&mut out);
            return out.into_bytes();
        }

        let mixed = format!("{}_mixed", self.boundary);
        let _ = write!(
            out,
            "Content-Type: multipart/mixed; boundary=\"{mixed}\"\r\n\r\n"
        );

        let _ = write!(out, "--{mixed}\r\n");
        self.write_body(&mut out);

        for attachment in self.attachments {
            let _ = write!(out, "\r\n--{mixed}\r\n");
            write_attachment(&mut out, attachment);
        }

        let _ = write!(out, "\r\n--{mixed}--\r\n");
        out.into_bytes()
    }

    fn write_body(&self, out: &mut String) {
        match &self.body {
            Body::Plain(text) => write_text(out, "plain", text),
            Body::Alternative { text, html } => {
                let alternative = format!("{}_alt", self.boundary);
                let _ = write!(
                    out,
                    "Content-Type: multipart/alternative; boundary=\"{alternative}\"\r\n\r\n"
                );
                let _ = write!(out, "--{alternative}\r\n");
                write_text(out, "plain", text);
                let _ = write!(out, "\r\n--{alternative}\r\n");
                write_text(out, "html", html);
                let _ = write!(out, "\r\n--{alternative}--\r\n");
            }
        }
    }
}

fn check_header(name: &'static str, value: &str) -> Result<(), BuildError> {
    if value.contains(['\r', '\n']) {
        return Err(BuildError::HeaderInjection {
            name,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Hashes everything that ends up in the message so that identical inputs
/// share boundaries and different inputs practically never collide.
fn boundary_seed(headers: &[(&'static str, String)], body: &Body, attachments: &[Attachment]) -> String {
    let mut hasher = Sha256::new();

    for (name, value) in headers {
        hasher.update(name.as_bytes());
        hasher.update(b"\0");
        hasher.update(value.as_bytes());
        hasher.update(b"\0");
    }

    match body {
        Body::Plain(text) => hasher.update(text.as_bytes()),
        Body::Alternative { text, html } => {
            hasher.update(text.as_bytes());
            hasher.update(b"\0");
            hasher.update(html.as_bytes());
        }
    }

    for attachment in attachments {
        hasher.update(b"\0");
        hasher.update(attachment.filename.as_bytes());
        hasher.update(b"\0");
        hasher.update(attachment.content_type.as_bytes());
        hasher.update(b"\0");
        hasher.update(&attachment.data);
    }

    // `=_` never occurs in base64 output.
    format!("=_{}", hex::encode(&hasher.finalize()[..12]))
}

fn write_text(out: &mut String, subtype: &str, text: &str) {
    let _ = write!(out, "Content-Type: text/{subtype}; charset=\"utf-8\"\r\n");

    if is_7bit(text) {
        let _ = write!(out, "Content-Transfer-Encoding: 7bit\r\n\r\n");
        for line in text.lines() {
            let _ = write!(out, "{line}\r\n");
        }
    } else {
        let _ = write!(out, "Content-Transfer-Encoding: base64\r\n\r\n");
        write_base64(out, text.as_bytes());
    }
}

fn write_attachment(out: &mut String, attachment: &Attachment) {
    let _ = write!(
        out,
        "Content-Type: {}\r\nContent-Transfer-Encoding: base64\r\nContent-Disposition: attachment; {}\r\n\r\n",
        attachment.content_type,
        filename_param(&attachment.filename),
    );
    write_base64(out, &attachment.data);
}

fn write_base64(out: &mut String, data: &[u8]) {
    let encoded = BASE64.encode(data);
    // Base64 is ASCII, so every byte offset is a char boundary.
    let mut rest = encoded.as_str();
    while !rest.is_empty() {
        let (line, tail) = rest.split_at(rest.len().min(BASE64_LINE));
        out.push_str(line);
        out.push_str("\r\n");
        rest = tail;
    }
}

fn is_7bit(text: &str) -> bool {
    text.is_ascii()
        && !text.contains('\0')
        && text.lines().all(|line| line.len() <= MAX_LINE_OCTETS)
}

/// Encodes a header value as RFC 2047 encoded words when it is not ASCII.
fn encode_header(value: &str) -> String {
    if value.is_ascii() {
        return value.to_string();
    }

    // 45 input bytes give 60 base64 characters, keeping each word under 75.
    const CHUNK: usize = 45;

    let mut words = Vec::new();
    let mut start = 0;
    let mut end = 0;
    for (index, c) in value.char_indices() {
        if index + c.len_utf8() - start > CHUNK {
            words.push(&value[start..end]);
            start = index;
        }
        end = index + c.len_utf8();
    }
    words.push(&value[start..end]);

    words
        .iter()
        .map(|word| format!("=?utf-8?b?{}?=", BASE64.encode(word.as_bytes())))
        .collect::<Vec<_>>()
        .join("\r\n ")
}

/// The `filename` parameter of Content-Disposition.
///
/// ASCII names are quoted, anything else uses the RFC 2231 extended form.
fn filename_param(filename: &str) -> String {
    if filename.is_ascii() {
        let escaped = filename.replace('\\', "\\\\").replace('"', "\\\"");
        return format!("filename=\"{escaped}\"");
    }

    let mut encoded = String::with_capacity(filename.len() * 3);
    for byte in filename.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(char::from(byte));
        } else {
            let _ = write!(encoded, "%{byte:02X}");
        }
    }
    format!("filename*=utf-8''{encoded}")
}
