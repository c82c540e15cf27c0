//! Per-request lifecycle state and the snapshots delivered to listeners.
//!
//! A [`RequestState`] is owned exclusively by the executing task and mutated
//! as the transfer progresses. Listeners never see it directly: each accepted
//! delivery carries a [`RequestEvent`], a deep, independent copy taken at
//! that moment, so the executor can keep mutating the live object while the
//! delivery context runs the listener.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::cancel::CancellationToken;

/// Synthetic response-header key holding the status line (which has no field
/// name of its own).
pub const STATUS_LINE_HEADER: &str = "HTTP-STATUS-LINE";

/// Coarse lifecycle stage of a request as reported to listeners.
///
/// Phases are emitted in non-decreasing order and `Ended` is reached exactly
/// once per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Transfer is about to start (sent once per reported direction).
    Began,
    /// Bytes are moving; repeated, throttled.
    Progress,
    /// Terminal; exactly one per request.
    Ended,
}

impl Phase {
    /// String form used in events and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Began => "began",
            Self::Progress => "progress",
            Self::Ended => "ended",
        }
    }
}

/// Whether the response payload is decoded text or raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    /// Payload was decoded with a resolved charset.
    Text,
    /// Payload is raw bytes (or was streamed verbatim to a file).
    Binary,
}

/// A resolved file location provided by the host's path collaborator.
///
/// `is_resource_file` marks read-only bundled resources; such sources can be
/// read as request bodies but never written to.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSpec {
    /// Logical filename as the caller named it.
    pub filename: String,
    /// Logical base-directory token, when the caller supplied one.
    pub base_directory: Option<String>,
    /// Resolved absolute path.
    pub full_path: PathBuf,
    /// True when the path is a read-only bundled resource.
    #[serde(skip)]
    pub is_resource_file: bool,
}

/// Response payload variants: decoded text, raw bytes, or the destination
/// file the body was streamed into.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    /// Decoded text (also used for error messages and the empty default).
    Text(String),
    /// Raw bytes accumulated in memory.
    Bytes(Vec<u8>),
    /// The committed destination file.
    File(FileSpec),
}

impl ResponsePayload {
    /// Returns the text content, if this payload is text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the raw bytes, if this payload is an in-memory buffer.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns the file spec, if the body was streamed to a file.
    #[must_use]
    pub fn as_file(&self) -> Option<&FileSpec> {
        match self {
            Self::File(spec) => Some(spec),
            _ => None,
        }
    }
}

/// Mutable state of one executing request.
///
/// Thread-confined to the executor; exposed to the rest of the world only
/// through [`RequestState::snapshot`].
#[derive(Debug, Clone)]
pub struct RequestState {
    /// Set when a runtime error was converted into the terminal outcome.
    pub is_error: bool,
    /// Current lifecycle phase.
    pub phase: Phase,
    /// HTTP status code; -1 until a response line has been read.
    pub status: i32,
    /// The original request URL (not updated across redirects).
    pub url: String,
    /// Response headers, repeated values comma-joined per field, with the
    /// status line under [`STATUS_LINE_HEADER`].
    pub response_headers: Option<HashMap<String, String>>,
    /// Whether the payload is text or binary.
    pub response_type: ResponseKind,
    /// Response payload; populated by `Ended` (empty text when an error or
    /// cancellation prevented a real body).
    pub response: Option<ResponsePayload>,
    /// Bytes moved on the reported leg; monotonically non-decreasing.
    pub bytes_transferred: u64,
    /// Expected total for the reported leg; `None` when the transport did
    /// not report one.
    pub bytes_estimated: Option<u64>,
    /// Debug key/value map, present only when the request asked for it.
    pub debug: Option<HashMap<String, String>>,
}

impl RequestState {
    /// Creates the initial state for a request.
    #[must_use]
    pub fn new(url: impl Into<String>, is_debug: bool) -> Self {
        let debug = is_debug.then(|| {
            let mut map = HashMap::new();
            map.insert("isDebug".to_string(), "true".to_string());
            map
        });
        Self {
            is_error: false,
            phase: Phase::Began,
            status: -1,
            url: url.into(),
            response_headers: None,
            response_type: ResponseKind::Text,
            response: None,
            bytes_transferred: 0,
            bytes_estimated: None,
            debug,
        }
    }

    /// Records a debug value; no-op unless the request runs in debug mode.
    pub fn set_debug(&mut self, key: &str, value: impl Into<String>) {
        if let Some(debug) = self.debug.as_mut() {
            debug.insert(key.to_string(), value.into());
        }
    }

    /// Takes a deep, independent snapshot for delivery to a listener.
    #[must_use]
    pub fn snapshot(&self, request_id: &CancellationToken) -> RequestEvent {
        RequestEvent {
            is_error: self.is_error,
            phase: self.phase,
            status: self.status,
            url: self.url.clone(),
            request_id: request_id.clone(),
            response_headers: self.response_headers.clone(),
            response_type: self.response.is_some().then_some(self.response_type),
            response: self.response.clone(),
            bytes_transferred: self.bytes_transferred,
            bytes_estimated: self.bytes_estimated,
            debug: self.debug.clone(),
        }
    }
}

/// One delivered request-state snapshot.
///
/// Serializes to the host-facing event shape (camelCase keys); the request
/// handle itself is opaque and skipped.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEvent {
    /// Whether the request ended in a handled error.
    pub is_error: bool,
    /// Lifecycle phase at snapshot time.
    pub phase: Phase,
    /// HTTP status code; -1 until known.
    pub status: i32,
    /// The original request URL.
    pub url: String,
    /// The caller's handle to this request; also its cancellation token.
    #[serde(skip)]
    pub request_id: CancellationToken,
    /// Response headers, when a response has been read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<HashMap<String, String>>,
    /// Present only when a payload is present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_type: Option<ResponseKind>,
    /// The payload, when populated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponsePayload>,
    /// Bytes moved on the reported leg.
    pub bytes_transferred: u64,
    /// Advisory expected total; absent when unknown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_estimated: Option<u64>,
    /// Debug map, when the request ran in debug mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<HashMap<String, String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_defaults() {
        let state = RequestState::new("https://example.com/", false);
        assert!(!state.is_error);
        assert_eq!(state.phase, Phase::Began);
        assert_eq!(state.status, -1);
        assert!(state.response.is_none());
        assert!(state.debug.is_none());
        assert_eq!(state.bytes_transferred, 0);
        assert!(state.bytes_estimated.is_none());
    }

    #[test]
    fn test_debug_map_only_in_debug_mode() {
        let mut silent = RequestState::new("https://example.com/", false);
        silent.set_debug("charset", "utf-8");
        assert!(silent.debug.is_none());

        let mut verbose = RequestState::new("https://example.com/", true);
        assert_eq!(
            verbose.debug.as_ref().unwrap().get("isDebug"),
            Some(&"true".to_string())
        );
        verbose.set_debug("charset", "utf-8");
        assert_eq!(
            verbose.debug.as_ref().unwrap().get("charset"),
            Some(&"utf-8".to_string())
        );
    }

    #[test]
    fn test_snapshot_is_independent() {
        let token = CancellationToken::new();
        let mut state = RequestState::new("https://example.com/", false);
        state.phase = Phase::Progress;
        state.bytes_transferred = 10;

        let snapshot = state.snapshot(&token);

        // The live object keeps mutating; the snapshot must not follow.
        state.bytes_transferred = 999;
        state.phase = Phase::Ended;
        state.response = Some(ResponsePayload::Text("late".to_string()));

        assert_eq!(snapshot.phase, Phase::Progress);
        assert_eq!(snapshot.bytes_transferred, 10);
        assert!(snapshot.response.is_none());
        assert!(snapshot.response_type.is_none());
        assert!(snapshot.request_id.same_token(&token));
    }

    #[test]
    fn test_snapshot_response_type_tracks_payload() {
        let token = CancellationToken::new();
        let mut state = RequestState::new("https://example.com/", false);
        state.response = Some(ResponsePayload::Bytes(vec![1, 2, 3]));
        state.response_type = ResponseKind::Binary;

        let snapshot = state.snapshot(&token);
        assert_eq!(snapshot.response_type, Some(ResponseKind::Binary));
        assert_eq!(snapshot.response.unwrap().as_bytes(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_event_serializes_to_host_shape() {
        let token = CancellationToken::new();
        let mut state = RequestState::new("https://example.com/", false);
        state.phase = Phase::Ended;
        state.status = 200;
        state.response = Some(ResponsePayload::Text("ok".to_string()));
        state.bytes_transferred = 2;
        state.bytes_estimated = Some(2);

        let event = state.snapshot(&token);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["isError"], false);
        assert_eq!(json["phase"], "ended");
        assert_eq!(json["status"], 200);
        assert_eq!(json["responseType"], "text");
        assert_eq!(json["response"], "ok");
        assert_eq!(json["bytesTransferred"], 2);
        assert_eq!(json["bytesEstimated"], 2);
        assert!(json.get("debug").is_none());
    }
}
