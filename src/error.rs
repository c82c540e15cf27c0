//! Error types for request validation and execution.
//!
//! Two tiers. [`ValidationError`] is detected before any executor starts and
//! results in no request being created. [`RequestError`] is raised inside an
//! executor, caught at the top of its run loop, and converted into the
//! terminal event (`is_error = true`, message as payload) — it never
//! propagates to the caller's thread.

use std::path::PathBuf;

use thiserror::Error;

/// Rejections produced while turning caller input into a request spec.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The target URL does not parse as an absolute URL.
    #[error("malformed URL: {url}")]
    MalformedUrl {
        /// The offending URL string.
        url: String,
    },

    /// A `Content-Type` header named a charset the engine cannot encode.
    #[error("Content-Type header contained an unsupported character encoding: {charset}")]
    UnsupportedCharset {
        /// The unsupported charset label.
        charset: String,
    },

    /// `bodyType` was something other than "text" or "binary".
    #[error(r#"'bodyType' must be either "text" or "binary", but was: "{value}""#)]
    InvalidBodyType {
        /// The invalid value.
        value: String,
    },

    /// `progress` was something other than "upload" or "download".
    #[error(r#"'progress' must be either "upload" or "download", but was: "{value}""#)]
    InvalidProgress {
        /// The invalid value.
        value: String,
    },

    /// A body was supplied without an established `Content-Type` header.
    #[error("a Content-Type header is required when a request body is specified")]
    MissingContentType,

    /// A body or response file table lacked its required filename.
    #[error("{field} 'filename' value is required and must be a string value")]
    MissingFilename {
        /// Which parameter table was incomplete ("body" or "response").
        field: &'static str,
    },

    /// The path collaborator could not resolve a file location.
    #[error("unable to resolve {field} file '{filename}': {message}")]
    PathResolution {
        /// Which parameter the file belongs to.
        field: &'static str,
        /// The logical filename.
        filename: String,
        /// Collaborator-provided detail.
        message: String,
    },

    /// The response destination is a read-only bundled resource.
    #[error("response destination {path} is a read-only resource and cannot be written")]
    ReadOnlyDestination {
        /// The resolved destination path.
        path: PathBuf,
    },

    /// The host denied write permission for the response destination.
    #[error("no write permission for response destination {path}: {message}")]
    WritePermission {
        /// The resolved destination path.
        path: PathBuf,
        /// Collaborator-provided detail.
        message: String,
    },

    /// `timeout` was not a positive, finite number of seconds.
    #[error("'timeout' must be a positive number of seconds, but was: {value}")]
    InvalidTimeout {
        /// The invalid value.
        value: f64,
    },

    /// The HTTP method is not a valid method token.
    #[error("invalid HTTP method: {value}")]
    InvalidMethod {
        /// The invalid method string.
        value: String,
    },
}

/// Failures raised during request execution.
///
/// Display output doubles as the human-readable payload of the terminal
/// event, so messages carry the URL or paths involved.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Transport-level failure (DNS, connect, TLS, broken stream, etc.)
    #[error("network error: {source}: {url}")]
    Network {
        /// The URL being transferred.
        url: String,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// The request exceeded its configured timeout.
    #[error("request timed out: {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// A redirect response arrived without a `Location` header.
    #[error("no Location: header in {status} redirect response from {url}")]
    MissingLocation {
        /// The redirect status code.
        status: u16,
        /// The URL that produced the redirect.
        url: String,
    },

    /// A `Location` header did not resolve against the prior URL.
    #[error("malformed redirect target '{location}' from {url}")]
    MalformedRedirect {
        /// The unusable Location header value.
        location: String,
        /// The URL that produced the redirect.
        url: String,
    },

    /// Too many redirect hops.
    #[error("more than maximum number of redirects attempted ({limit}) ({from} -> {to})")]
    RedirectLimit {
        /// The hop limit that was exceeded.
        limit: u32,
        /// The URL whose response was the final straw.
        from: String,
        /// Where it wanted to go next.
        to: String,
    },

    /// Reading the request body file failed.
    #[error("error reading request body file {path}: {source}")]
    BodyFile {
        /// The body file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Filesystem error while staging or writing the response.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Committing the finished temp file onto the destination failed.
    #[error("failed to rename temporary download file at path {from} to final file at path {to}: {source}")]
    Rename {
        /// The temp file path.
        from: PathBuf,
        /// The destination path.
        to: PathBuf,
        /// The underlying rename error.
        #[source]
        source: std::io::Error,
    },
}

impl RequestError {
    /// Creates a network error, promoting reqwest timeouts to [`RequestError::Timeout`].
    pub fn from_reqwest(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network { url, source }
        }
    }

    /// Creates an I/O error for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
