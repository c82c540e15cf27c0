//! Charset sniffing and resolution for response bodies.
//!
//! When a response is decoded as text, its encoding is resolved in priority
//! order: an explicit `charset` parameter on the `Content-Type` header
//! ("protocol"), an encoding declaration embedded in the document itself
//! ("content": XML prolog or HTML meta tag), or the UTF-8 default for
//! text-like types ("implicit"). Sniffing looks at a bounded preview of the
//! body; the same bytes are re-delivered to the real decode pass by the
//! executor.
//!
//! Background on the embedded-declaration mess:
//! <https://en.wikipedia.org/wiki/Character_encodings_in_HTML>

use std::sync::OnceLock;

use encoding_rs::{Encoding, UTF_8};
use regex::Regex;

use crate::content_type;

/// Number of body bytes inspected for an embedded encoding declaration.
pub const PREVIEW_SIZE: usize = 1024;

/// Where a resolved charset came from, as reported in the debug map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharsetSource {
    /// Explicit `charset` parameter on the response `Content-Type` header.
    Protocol,
    /// Declaration embedded in the document body (XML prolog or HTML meta).
    Content,
    /// Text-like content type with no declaration; UTF-8 assumed.
    Implicit,
}

impl CharsetSource {
    /// Debug-map string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Protocol => "protocol",
            Self::Content => "content",
            Self::Implicit => "implicit",
        }
    }
}

/// Outcome of charset resolution for one response body.
#[derive(Debug, Clone)]
pub struct CharsetResolution {
    /// The encoding the body will be decoded with.
    pub encoding: &'static Encoding,
    /// Which resolution step produced it.
    pub source: CharsetSource,
    /// The charset name as written in the header or document, when one was
    /// found. May name an unsupported encoding even though `encoding` fell
    /// back to UTF-8.
    pub declared: Option<String>,
}

/// Looks up an encoding by its IANA-style label.
///
/// Returns `None` for labels `encoding_rs` does not know, which is the
/// engine's definition of an unsupported charset.
#[must_use]
pub fn supported_encoding(label: &str) -> Option<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
}

fn xml_prolog_encoding() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(r#"(?i)<\?xml\b[^>]*\bencoding=['"]([a-zA-Z0-9_\-]+)['"]"#)
            .expect("static regex must compile")
    })
}

fn html_meta_charset() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(r#"(?i)<meta\b[^>]*\bcharset=['"]([a-zA-Z0-9_\-]+)['"][^>]*>"#)
            .expect("static regex must compile")
    })
}

fn html_meta_http_equiv() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(r#"(?i)<meta\b[^>]*\bhttp-equiv=['"]content-type['"][^>]*>"#)
            .expect("static regex must compile")
    })
}

fn charset_attribute() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(r"(?i)\bcharset=([a-zA-Z0-9_\-]+)\b").expect("static regex must compile")
    })
}

/// Finds an encoding declaration embedded in a body preview.
///
/// For XML content the prolog's `encoding="..."` attribute is checked first;
/// for HTML content a `<meta charset="...">` tag, then a
/// `<meta http-equiv="Content-Type" content="...;charset=...">` tag.
/// `application/xhtml*` is both, and the XML declaration wins when present.
///
/// Returns the declared name unvalidated; the caller decides what to do
/// with unsupported labels.
#[must_use]
pub fn sniff_embedded(content_type: &str, preview: &str) -> Option<String> {
    if content_type::is_xml(content_type)
        && let Some(captures) = xml_prolog_encoding().captures(preview)
    {
        return Some(captures[1].to_string());
    }

    if content_type::is_html(content_type) {
        if let Some(captures) = html_meta_charset().captures(preview) {
            return Some(captures[1].to_string());
        }

        // The meta http-equiv attributes may come in any order, so locate the
        // whole tag first and scan it for the charset attribute.
        if let Some(tag) = html_meta_http_equiv().find(preview)
            && let Some(captures) = charset_attribute().captures(tag.as_str())
        {
            return Some(captures[1].to_string());
        }
    }

    None
}

/// Resolves the charset for a response body.
///
/// Returns `None` when the content type is not text-like and carries no
/// usable charset parameter; such bodies are handled as binary. Error
/// bodies are always treated as text — callers fall back to UTF-8 when this
/// returns `None` (see the executor).
#[must_use]
pub fn resolve(content_type: &str, preview: &[u8]) -> Option<CharsetResolution> {
    // 1. Explicit charset parameter on the Content-Type header.
    if let Some(label) = content_type::charset_parameter(content_type) {
        if let Some(encoding) = supported_encoding(&label) {
            return Some(CharsetResolution {
                encoding,
                source: CharsetSource::Protocol,
                declared: Some(label),
            });
        }
        tracing::debug!(
            charset = %label,
            "unsupported charset in Content-Type header, falling through to sniffing"
        );
    }

    if !content_type::is_text(content_type) {
        return None;
    }

    // 2. Declaration embedded in the content itself. The preview is markup,
    // so an ASCII-compatible lossy view is enough to find it.
    let preview_text = String::from_utf8_lossy(preview);
    if let Some(label) = sniff_embedded(content_type, &preview_text) {
        let resolution = match supported_encoding(&label) {
            Some(encoding) => CharsetResolution {
                encoding,
                source: CharsetSource::Content,
                declared: Some(label),
            },
            None => {
                tracing::debug!(
                    charset = %label,
                    "unsupported charset declared in content, decoding as UTF-8"
                );
                CharsetResolution {
                    encoding: UTF_8,
                    source: CharsetSource::Content,
                    declared: Some(label),
                }
            }
        };
        return Some(resolution);
    }

    // 3. Text-like type with no declaration anywhere. Most text types imply
    // UTF-8, and the US-ASCII holdouts decode fine with it too.
    Some(CharsetResolution {
        encoding: UTF_8,
        source: CharsetSource::Implicit,
        declared: None,
    })
}

/// Decodes bytes with the given encoding, replacing malformed sequences.
#[must_use]
pub fn decode(bytes: &[u8], encoding: &'static Encoding) -> String {
    let (text, _, _) = encoding.decode(bytes);
    text.into_owned()
}

/// Encodes text with the given encoding, replacing unmappable characters.
#[must_use]
pub fn encode(text: &str, encoding: &'static Encoding) -> Vec<u8> {
    let (bytes, _, _) = encoding.encode(text);
    bytes.into_owned()
}
