//! Content-Type classification helpers.
//!
//! Pure functions that classify a MIME type as XML, HTML, some other text
//! type, or binary, and extract an explicit `charset` parameter from a
//! `Content-Type` header value. Charset resolution for a response builds on
//! these (see [`crate::charset`]).

use std::sync::OnceLock;

use regex::Regex;

/// Matches structured XML application types such as `application/rss+xml`.
fn application_plus_xml() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(r"^application/\w+\+xml").expect("static regex must compile")
    })
}

/// Returns true if the content type is an XML type.
///
/// Covers `text/xml`, `application/xml`, `application/xhtml*`, and the
/// `application/*+xml` family (RSS, Atom, and many others).
#[must_use]
pub fn is_xml(content_type: &str) -> bool {
    content_type.starts_with("text/xml")
        || content_type.starts_with("application/xml")
        || content_type.starts_with("application/xhtml")
        || application_plus_xml().is_match(content_type)
}

/// Returns true if the content type is an HTML type.
///
/// `application/xhtml*` is both XML and HTML; the sniffer prefers the XML
/// declaration and falls back to the HTML meta tags.
#[must_use]
pub fn is_html(content_type: &str) -> bool {
    content_type.starts_with("text/html") || content_type.starts_with("application/xhtml")
}

/// Returns true if the content type implies text.
///
/// Text types are decoded with UTF-8 when no other encoding is found.
#[must_use]
pub fn is_text(content_type: &str) -> bool {
    is_xml(content_type)
        || is_html(content_type)
        || content_type.starts_with("text/")
        || content_type.starts_with("application/json")
        || content_type.starts_with("application/javascript")
        || content_type.starts_with("application/x-javascript")
        || content_type.starts_with("application/ecmascript")
        || content_type.starts_with("application/x-www-form-urlencoded")
}

/// Extracts the `charset` parameter from a `Content-Type` header value.
///
/// Returns the raw charset name, unvalidated. Parameters are matched
/// case-insensitively on the `charset=` key; the last occurrence wins, as
/// in a parameter-by-parameter scan.
///
/// ```
/// use netreq::content_type::charset_parameter;
///
/// assert_eq!(
///     charset_parameter("text/html; charset=iso-8859-1"),
///     Some("iso-8859-1".to_string())
/// );
/// assert_eq!(charset_parameter("application/octet-stream"), None);
/// ```
#[must_use]
pub fn charset_parameter(content_type: &str) -> Option<String> {
    let mut charset = None;
    for part in content_type.split(';') {
        // Split on '=' rather than byte-slicing: header values come off the
        // wire and parameter names may put a multibyte character anywhere.
        if let Some((key, value)) = part.split_once('=')
            && key.trim().eq_ignore_ascii_case("charset")
        {
            charset = Some(value.trim().trim_matches('"').to_string());
        }
    }
    charset
}
