//! Caller input and its validation into an immutable request spec.
//!
//! [`RequestParams`] mirrors the loosely-typed parameter table a host
//! binding hands over (header values may be strings, numbers, or booleans;
//! bodies may be text, bytes, or a file descriptor). [`RequestSpec::validate`]
//! applies the full rule set in order and either produces a fully defaulted,
//! immutable [`RequestSpec`] or a [`ValidationError`] — no executor is ever
//! spawned from invalid input.

use std::time::Duration;

use encoding_rs::{Encoding, UTF_8};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::cancel::CancellationToken;
use crate::collab::PathResolver;
use crate::content_type;
use crate::error::ValidationError;
use crate::state::FileSpec;

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: f64 = 30.0;

/// Which transfer leg progress snapshots are requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressDirection {
    /// No byte-level progress; the terminal snapshot still carries totals.
    #[default]
    None,
    /// Report the request-body upload leg.
    Upload,
    /// Report the response-body download leg.
    Download,
}

/// A file location as named by the caller, before resolution.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTarget {
    /// Logical filename.
    pub filename: String,
    /// Optional logical base-directory token.
    #[serde(default)]
    pub base_directory: Option<String>,
}

/// Raw request body input.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BodyInput {
    /// A string, interpreted per `bodyType` (text or binary).
    Text(String),
    /// Raw bytes; always binary.
    Bytes(Vec<u8>),
    /// A body file, resolved through the path collaborator; always binary.
    File(FileTarget),
}

/// The optional parameter table of a request submission.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RequestParams {
    /// Request headers; values are coerced from string/number/boolean.
    #[serde(default)]
    pub headers: Option<serde_json::Map<String, Value>>,
    /// Request body.
    #[serde(default)]
    pub body: Option<BodyInput>,
    /// "text" (default) or "binary".
    #[serde(default)]
    pub body_type: Option<String>,
    /// "upload" or "download"; absent means no progress snapshots.
    #[serde(default)]
    pub progress: Option<String>,
    /// Destination file for the response body.
    #[serde(default)]
    pub response: Option<FileTarget>,
    /// Timeout in seconds; default 30.
    #[serde(default)]
    pub timeout: Option<f64>,
    /// Whether to carry a debug map on the request state.
    #[serde(default)]
    pub debug: Option<bool>,
    /// Whether the engine follows redirects; default true.
    #[serde(default)]
    pub handle_redirects: Option<bool>,
    /// Opaque descriptor handed to the notification collaborator after a
    /// successful, non-cancelled 2xx response.
    #[serde(default)]
    pub success_notification: Option<Value>,
}

/// Validated request body.
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// Text, encoded with the charset established by the Content-Type
    /// header (UTF-8 when the header named none).
    Text {
        /// The body text.
        content: String,
        /// Encoding the text is sent in.
        encoding: &'static Encoding,
    },
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// A resolved body file, streamed from disk.
    File(FileSpec),
}

/// Where the response body goes.
#[derive(Debug, Clone, Default)]
pub enum ResponseDestination {
    /// Accumulate in memory (string or bytes).
    #[default]
    Memory,
    /// Stream into the resolved file via temp-file staging.
    File(FileSpec),
}

/// Immutable, validated description of one request.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    /// Target URL.
    pub url: Url,
    /// HTTP method (GET when the caller named none).
    pub method: Method,
    /// Case-insensitively deduplicated headers, `Content-Length` removed.
    pub headers: Vec<(String, String)>,
    /// Request body, if any.
    pub body: Option<RequestBody>,
    /// Progress-reporting direction.
    pub progress: ProgressDirection,
    /// Response destination.
    pub response: ResponseDestination,
    /// Request timeout.
    pub timeout: Duration,
    /// Whether the request state carries a debug map.
    pub is_debug: bool,
    /// Whether redirects are followed by the engine.
    pub handle_redirects: bool,
    /// Opaque success-notification descriptor.
    pub success_notification: Option<Value>,
    /// The request's cancellation token; also the caller's handle.
    pub token: CancellationToken,
}

impl RequestSpec {
    /// Validates raw caller input into a request spec.
    ///
    /// Rules are applied in order; the first failure wins and is returned
    /// without side effects. File locations are resolved through `paths`.
    ///
    /// # Errors
    ///
    /// Returns the corresponding [`ValidationError`] for a malformed URL,
    /// invalid method token, unsupported header charset, bad `bodyType` or
    /// `progress` value, body without an established `Content-Type`,
    /// unresolvable or unwritable file locations, or a non-positive timeout.
    pub fn validate(
        url: &str,
        method: Option<&str>,
        params: RequestParams,
        paths: &dyn PathResolver,
    ) -> Result<Self, ValidationError> {
        // 1. The URL must parse as a well-formed absolute URL.
        let url = Url::parse(url).map_err(|_| ValidationError::MalformedUrl {
            url: url.to_string(),
        })?;

        // 2. Method defaults to GET.
        let method_str = method.unwrap_or("GET").to_ascii_uppercase();
        let method =
            Method::from_bytes(method_str.as_bytes()).map_err(|_| {
                ValidationError::InvalidMethod {
                    value: method_str.clone(),
                }
            })?;

        // 4. Header table: case-insensitive dedup, Content-Length dropped,
        // values coerced to strings, Content-Type charset validated.
        let headers_supplied = params.headers.is_some();
        let mut headers = HeaderSet::default();
        if let Some(table) = params.headers {
            for (name, value) in table {
                if name.eq_ignore_ascii_case("Content-Length") {
                    // Computed from the body later; caller values are dropped.
                    continue;
                }
                let Some(value) = coerce_header_value(&value) else {
                    continue;
                };
                if name.eq_ignore_ascii_case("Content-Type")
                    && let Some(charset) = content_type::charset_parameter(&value)
                    && crate::charset::supported_encoding(&charset).is_none()
                {
                    return Err(ValidationError::UnsupportedCharset { charset });
                }
                debug!(header = %name, value = %value, "request header");
                headers.insert(name, value);
            }
        }

        // 5. POST without any caller headers gets the conventional form
        // Content-Type. A POST that supplied headers but no Content-Type
        // must name one itself if it carries a body (rule 8).
        if method == Method::POST && !headers_supplied && headers.content_type().is_none() {
            headers.insert(
                "Content-Type".to_string(),
                "application/x-www-form-urlencoded; charset=UTF-8".to_string(),
            );
        }

        // 7. bodyType defaults to "text".
        let body_is_text = match params.body_type.as_deref() {
            None | Some("text") => true,
            Some("binary") => false,
            Some(other) => {
                return Err(ValidationError::InvalidBodyType {
                    value: other.to_string(),
                });
            }
        };

        // 8. Body: string (per bodyType), bytes, or a resolved file.
        let body = match params.body {
            None => None,
            Some(BodyInput::Text(content)) if body_is_text => {
                let encoding = headers
                    .content_type()
                    .and_then(content_type::charset_parameter)
                    .and_then(|label| crate::charset::supported_encoding(&label))
                    .unwrap_or(UTF_8);
                Some(RequestBody::Text { content, encoding })
            }
            Some(BodyInput::Text(content)) => Some(RequestBody::Bytes(content.into_bytes())),
            Some(BodyInput::Bytes(bytes)) => Some(RequestBody::Bytes(bytes)),
            Some(BodyInput::File(target)) => {
                // Body from a file is always binary.
                Some(RequestBody::File(resolve_file(paths, "body", &target)?))
            }
        };
        if body.is_some() && headers.content_type().is_none() {
            return Err(ValidationError::MissingContentType);
        }

        // 9. Progress direction.
        let progress = match params.progress.as_deref() {
            None => ProgressDirection::None,
            Some(value) if value.eq_ignore_ascii_case("upload") => ProgressDirection::Upload,
            Some(value) if value.eq_ignore_ascii_case("download") => ProgressDirection::Download,
            Some(other) => {
                return Err(ValidationError::InvalidProgress {
                    value: other.to_string(),
                });
            }
        };

        // 10. Response destination: resolved, never a bundled resource, and
        // writable per the host's externally-enforced permissions.
        let response = match params.response {
            None => ResponseDestination::Memory,
            Some(target) => {
                let spec = resolve_file(paths, "response", &target)?;
                if spec.is_resource_file {
                    return Err(ValidationError::ReadOnlyDestination {
                        path: spec.full_path,
                    });
                }
                paths.ensure_writable(&spec.full_path).map_err(|message| {
                    ValidationError::WritePermission {
                        path: spec.full_path.clone(),
                        message,
                    }
                })?;
                ResponseDestination::File(spec)
            }
        };

        // 11. Timeout defaults to 30 seconds.
        let timeout_secs = params.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if !timeout_secs.is_finite() || timeout_secs <= 0.0 {
            return Err(ValidationError::InvalidTimeout {
                value: timeout_secs,
            });
        }

        Ok(Self {
            url,
            method,
            headers: headers.into_vec(),
            body,
            progress,
            response,
            timeout: Duration::from_secs_f64(timeout_secs),
            // 12. / 13.
            is_debug: params.debug.unwrap_or(false),
            handle_redirects: params.handle_redirects.unwrap_or(true),
            success_notification: params.success_notification,
            token: CancellationToken::new(),
        })
    }

    /// Returns the established `Content-Type` header value, if any.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("Content-Type"))
            .map(|(_, value)| value.as_str())
    }
}

/// Header collection with case-insensitive replacement semantics.
#[derive(Debug, Default)]
struct HeaderSet {
    entries: Vec<(String, String)>,
}

impl HeaderSet {
    fn insert(&mut self, name: String, value: String) {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            existing.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    fn content_type(&self) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("Content-Type"))
            .map(|(_, value)| value.as_str())
    }

    fn into_vec(self) -> Vec<(String, String)> {
        self.entries
    }
}

/// Coerces a header value from its loosely-typed form to a string.
///
/// Integral numbers render without a fractional part; other JSON types are
/// skipped entirely.
fn coerce_header_value(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => {
            if let Some(integer) = number.as_i64() {
                Some(integer.to_string())
            } else {
                number.as_f64().map(|float| {
                    if float.fract() == 0.0 && float.abs() < 9.0e15 {
                        format!("{}", float as i64)
                    } else {
                        float.to_string()
                    }
                })
            }
        }
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn resolve_file(
    paths: &dyn PathResolver,
    field: &'static str,
    target: &FileTarget,
) -> Result<FileSpec, ValidationError> {
    if target.filename.is_empty() {
        return Err(ValidationError::MissingFilename { field });
    }
    let resolved = paths
        .resolve_path(&target.filename, target.base_directory.as_deref())
        .map_err(|message| ValidationError::PathResolution {
            field,
            filename: target.filename.clone(),
            message,
        })?;
    Ok(FileSpec {
        filename: target.filename.clone(),
        base_directory: target.base_directory.clone(),
        full_path: resolved.full_path,
        is_resource_file: resolved.is_resource_file,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestResolver;
    use serde_json::json;
    use std::path::PathBuf;

    fn resolver() -> TestResolver {
        TestResolver::new("/sandbox")
    }

    fn headers(pairs: &[(&str, Value)]) -> Option<serde_json::Map<String, Value>> {
        let mut map = serde_json::Map::new();
        for (name, value) in pairs {
            map.insert((*name).to_string(), value.clone());
        }
        Some(map)
    }

    #[test]
    fn test_malformed_url_rejected() {
        let result = RequestSpec::validate(
            "not a url",
            None,
            RequestParams::default(),
            &resolver(),
        );
        assert!(matches!(result, Err(ValidationError::MalformedUrl { .. })));
    }

    #[test]
    fn test_defaults() {
        let spec = RequestSpec::validate(
            "https://example.com/",
            None,
            RequestParams::default(),
            &resolver(),
        )
        .unwrap();
        assert_eq!(spec.method, Method::GET);
        assert_eq!(spec.timeout, Duration::from_secs(30));
        assert!(spec.handle_redirects);
        assert!(!spec.is_debug);
        assert_eq!(spec.progress, ProgressDirection::None);
        assert!(matches!(spec.response, ResponseDestination::Memory));
        assert!(spec.body.is_none());
        assert!(!spec.token.is_cancelled());
    }

    #[test]
    fn test_method_uppercased_and_validated() {
        let spec = RequestSpec::validate(
            "https://example.com/",
            Some("post"),
            RequestParams::default(),
            &resolver(),
        )
        .unwrap();
        assert_eq!(spec.method, Method::POST);

        let result = RequestSpec::validate(
            "https://example.com/",
            Some("GE T"),
            RequestParams::default(),
            &resolver(),
        );
        assert!(matches!(result, Err(ValidationError::InvalidMethod { .. })));
    }

    #[test]
    fn test_content_length_dropped_and_values_coerced() {
        let params = RequestParams {
            headers: headers(&[
                ("Content-Length", json!(999)),
                ("X-Retries", json!(3)),
                ("X-Ratio", json!(1.5)),
                ("X-Flag", json!(true)),
                ("X-Skip", json!({"not": "a scalar"})),
            ]),
            ..RequestParams::default()
        };
        let spec =
            RequestSpec::validate("https://example.com/", None, params, &resolver()).unwrap();

        let find = |name: &str| {
            spec.headers
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        };
        assert!(find("Content-Length").is_none());
        assert_eq!(find("X-Retries"), Some("3"));
        assert_eq!(find("X-Ratio"), Some("1.5"));
        assert_eq!(find("X-Flag"), Some("true"));
        assert!(find("X-Skip").is_none());
    }

    #[test]
    fn test_header_names_deduplicated_case_insensitively() {
        let params = RequestParams {
            headers: headers(&[
                ("x-token", json!("first")),
                ("X-Token", json!("second")),
            ]),
            ..RequestParams::default()
        };
        let spec =
            RequestSpec::validate("https://example.com/", None, params, &resolver()).unwrap();
        let matching: Vec<_> = spec
            .headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("x-token"))
            .collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].1, "second");
    }

    #[test]
    fn test_unsupported_header_charset_rejected() {
        let params = RequestParams {
            headers: headers(&[("Content-Type", json!("text/plain; charset=klingon-7"))]),
            ..RequestParams::default()
        };
        let result = RequestSpec::validate("https://example.com/", None, params, &resolver());
        assert!(matches!(
            result,
            Err(ValidationError::UnsupportedCharset { charset }) if charset == "klingon-7"
        ));
    }

    #[test]
    fn test_post_without_headers_synthesizes_content_type() {
        let spec = RequestSpec::validate(
            "https://example.com/",
            Some("POST"),
            RequestParams::default(),
            &resolver(),
        )
        .unwrap();
        assert_eq!(
            spec.content_type(),
            Some("application/x-www-form-urlencoded; charset=UTF-8")
        );
    }

    #[test]
    fn test_post_with_headers_but_no_content_type_rejects_body() {
        let params = RequestParams {
            headers: headers(&[("X-Whatever", json!("1"))]),
            body: Some(BodyInput::Text("a=1".to_string())),
            ..RequestParams::default()
        };
        let result =
            RequestSpec::validate("https://example.com/", Some("POST"), params, &resolver());
        assert!(matches!(result, Err(ValidationError::MissingContentType)));
    }

    #[test]
    fn test_invalid_body_type_rejected() {
        let params = RequestParams {
            body_type: Some("tekst".to_string()),
            ..RequestParams::default()
        };
        let result = RequestSpec::validate("https://example.com/", None, params, &resolver());
        assert!(matches!(
            result,
            Err(ValidationError::InvalidBodyType { value }) if value == "tekst"
        ));
    }

    #[test]
    fn test_text_body_uses_content_type_charset() {
        let params = RequestParams {
            headers: headers(&[("Content-Type", json!("text/plain; charset=iso-8859-1"))]),
            body: Some(BodyInput::Text("café".to_string())),
            ..RequestParams::default()
        };
        let spec =
            RequestSpec::validate("https://example.com/", Some("POST"), params, &resolver())
                .unwrap();
        match spec.body {
            Some(RequestBody::Text { encoding, .. }) => {
                assert_eq!(encoding.name(), "windows-1252");
            }
            other => panic!("expected text body, got {other:?}"),
        }
    }

    #[test]
    fn test_binary_body_type_turns_string_into_bytes() {
        let params = RequestParams {
            headers: headers(&[("Content-Type", json!("application/octet-stream"))]),
            body: Some(BodyInput::Text("raw".to_string())),
            body_type: Some("binary".to_string()),
            ..RequestParams::default()
        };
        let spec =
            RequestSpec::validate("https://example.com/", Some("POST"), params, &resolver())
                .unwrap();
        assert!(matches!(spec.body, Some(RequestBody::Bytes(ref bytes)) if bytes == b"raw"));
    }

    #[test]
    fn test_file_body_resolved_and_forced_binary() {
        let params = RequestParams {
            headers: headers(&[("Content-Type", json!("application/octet-stream"))]),
            body: Some(BodyInput::File(FileTarget {
                filename: "payload.bin".to_string(),
                base_directory: Some("uploads".to_string()),
            })),
            ..RequestParams::default()
        };
        let spec =
            RequestSpec::validate("https://example.com/", Some("POST"), params, &resolver())
                .unwrap();
        match spec.body {
            Some(RequestBody::File(ref file)) => {
                assert_eq!(file.full_path, PathBuf::from("/sandbox/uploads/payload.bin"));
            }
            other => panic!("expected file body, got {other:?}"),
        }
    }

    #[test]
    fn test_body_file_requires_filename() {
        let params = RequestParams {
            headers: headers(&[("Content-Type", json!("application/octet-stream"))]),
            body: Some(BodyInput::File(FileTarget {
                filename: String::new(),
                base_directory: None,
            })),
            ..RequestParams::default()
        };
        let result =
            RequestSpec::validate("https://example.com/", Some("POST"), params, &resolver());
        assert!(matches!(
            result,
            Err(ValidationError::MissingFilename { field: "body" })
        ));
    }

    #[test]
    fn test_invalid_progress_rejected() {
        let params = RequestParams {
            progress: Some("sideways".to_string()),
            ..RequestParams::default()
        };
        let result = RequestSpec::validate("https://example.com/", None, params, &resolver());
        assert!(matches!(
            result,
            Err(ValidationError::InvalidProgress { value }) if value == "sideways"
        ));
    }

    #[test]
    fn test_progress_directions_parse() {
        for (input, expected) in [
            ("upload", ProgressDirection::Upload),
            ("download", ProgressDirection::Download),
        ] {
            let params = RequestParams {
                progress: Some(input.to_string()),
                ..RequestParams::default()
            };
            let spec =
                RequestSpec::validate("https://example.com/", None, params, &resolver()).unwrap();
            assert_eq!(spec.progress, expected);
        }
    }

    #[test]
    fn test_response_resource_file_rejected() {
        let mut paths = resolver();
        paths.resource_files = true;
        let params = RequestParams {
            response: Some(FileTarget {
                filename: "out.bin".to_string(),
                base_directory: None,
            }),
            ..RequestParams::default()
        };
        let result = RequestSpec::validate("https://example.com/", None, params, &paths);
        assert!(matches!(
            result,
            Err(ValidationError::ReadOnlyDestination { .. })
        ));
    }

    #[test]
    fn test_response_write_permission_enforced() {
        let mut paths = resolver();
        paths.deny_write = true;
        let params = RequestParams {
            response: Some(FileTarget {
                filename: "out.bin".to_string(),
                base_directory: None,
            }),
            ..RequestParams::default()
        };
        let result = RequestSpec::validate("https://example.com/", None, params, &paths);
        assert!(matches!(
            result,
            Err(ValidationError::WritePermission { .. })
        ));
    }

    #[test]
    fn test_timeout_must_be_positive() {
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let params = RequestParams {
                timeout: Some(bad),
                ..RequestParams::default()
            };
            let result = RequestSpec::validate("https://example.com/", None, params, &resolver());
            assert!(
                matches!(result, Err(ValidationError::InvalidTimeout { .. })),
                "timeout {bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_params_deserialize_from_host_shape() {
        let params: RequestParams = serde_json::from_value(json!({
            "headers": {"X-Token": "abc", "Content-Type": "application/json"},
            "body": "{\"a\":1}",
            "bodyType": "text",
            "progress": "download",
            "response": {"filename": "out.json", "baseDirectory": "cache"},
            "timeout": 5,
            "debug": true,
            "handleRedirects": false,
            "successNotification": {"alert": "done"}
        }))
        .unwrap();

        let spec = RequestSpec::validate("https://example.com/", Some("POST"), params, &resolver())
            .unwrap();
        assert_eq!(spec.progress, ProgressDirection::Download);
        assert!(!spec.handle_redirects);
        assert!(spec.is_debug);
        assert_eq!(spec.timeout, Duration::from_secs(5));
        assert!(matches!(spec.response, ResponseDestination::File(_)));
        assert!(spec.success_notification.is_some());
    }
}
