//! Per-request state machine: upload, redirects, download, finalization.
//!
//! One executor runs per submitted request, on its own tokio task. It owns
//! the request's [`RequestState`] exclusively and pushes snapshots through
//! the [`CallbackChannel`]; nothing here ever blocks on the listener. All
//! runtime failures are converted into the terminal snapshot (`is_error`,
//! message as payload) at the top of [`RequestExecutor::run`] — an executor
//! never propagates errors to the submitting thread.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use reqwest::{Body, Client, Method, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, warn};

use crate::callback::CallbackChannel;
use crate::cancel::CancellationToken;
use crate::charset::{self, CharsetResolution, CharsetSource, PREVIEW_SIZE};
use crate::collab::NotificationSink;
use crate::engine::EngineConfig;
use crate::error::RequestError;
use crate::params::{ProgressDirection, RequestBody, RequestSpec, ResponseDestination};
use crate::state::{
    FileSpec, Phase, RequestState, ResponseKind, ResponsePayload, STATUS_LINE_HEADER,
};

/// Transfer chunk size; cancellation is observed at these boundaries.
pub(crate) const CHUNK_SIZE: usize = 1024;

/// Redirect responses the engine follows.
const REDIRECT_STATUSES: [u16; 4] = [301, 302, 303, 307];

/// Maximum redirect hops before the chain is abandoned.
const MAX_REDIRECTS: u32 = 10;

/// Executes one validated request to completion.
pub(crate) struct RequestExecutor {
    client: Client,
    config: Arc<EngineConfig>,
    spec: RequestSpec,
    channel: Arc<CallbackChannel>,
    notifications: Arc<dyn NotificationSink>,
    state: RequestState,
    downloaded: u64,
    download_estimate: Option<u64>,
}

impl RequestExecutor {
    pub(crate) fn new(
        client: Client,
        config: Arc<EngineConfig>,
        spec: RequestSpec,
        channel: Arc<CallbackChannel>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        let state = RequestState::new(spec.url.as_str(), spec.is_debug);
        Self {
            client,
            config,
            spec,
            channel,
            notifications,
            state,
            downloaded: 0,
            download_estimate: None,
        }
    }

    /// Runs the request to its terminal snapshot.
    pub(crate) async fn run(mut self) {
        debug!(
            url = %self.state.url,
            method = %self.spec.method,
            "starting request"
        );
        let result = self.transfer().await;
        self.finish(result);
    }

    async fn transfer(&mut self) -> Result<(), RequestError> {
        if self.spec.token.is_cancelled() {
            return Ok(());
        }

        let mut url = self.spec.url.clone();
        let mut headers = self.effective_headers();

        // Credentials in the URL become a preemptive Basic Authorization
        // header and are stripped from the URL actually sent.
        if !url.username().is_empty() {
            let credentials = format!("{}:{}", url.username(), url.password().unwrap_or(""));
            headers.push((
                "Authorization".to_string(),
                format!("Basic {}", BASE64.encode(credentials)),
            ));
            let _ = url.set_username("");
            let _ = url.set_password(None);
        }

        let mut method = self.spec.method.clone();
        if method == Method::PATCH && self.config.patch_via_post_override {
            headers.push(("X-HTTP-Method-Override".to_string(), "PATCH".to_string()));
            method = Method::POST;
        }
        if method == Method::HEAD && self.config.head_forces_identity_encoding {
            headers.push(("Accept-Encoding".to_string(), "identity".to_string()));
        }

        let prepared = self.prepare_body().await?;
        let body_length = prepared.as_ref().map(PreparedBody::length);

        if self.spec.progress == ProgressDirection::Upload {
            self.state.bytes_estimated = Some(body_length.unwrap_or(0));
            self.state.phase = Phase::Began;
            self.channel.deliver(&self.state, false);
            self.state.phase = Phase::Progress;
        }

        let sent = Arc::new(AtomicU64::new(0));
        let mut builder = self
            .client
            .request(method, url.clone())
            .timeout(self.spec.timeout);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(prepared) = prepared {
            let progress = UploadProgress {
                channel: Arc::clone(&self.channel),
                token: self.spec.token.clone(),
                state: self.state.clone(),
                sent: Arc::clone(&sent),
                report: self.spec.progress == ProgressDirection::Upload,
            };
            builder = builder
                .header(CONTENT_LENGTH, prepared.length())
                .body(prepared.into_body(progress));
        }

        let mut response = match builder.send().await {
            Ok(response) => response,
            Err(_) if self.spec.token.is_cancelled() => return Ok(()),
            Err(source) => return Err(RequestError::from_reqwest(self.state.url.clone(), source)),
        };
        if self.spec.progress == ProgressDirection::Upload {
            self.state.bytes_transferred = sent.load(Ordering::Relaxed);
        }

        let mut current = url;
        let mut hops: u32 = 0;
        while self.spec.handle_redirects
            && REDIRECT_STATUSES.contains(&response.status().as_u16())
        {
            if self.spec.token.is_cancelled() {
                return Ok(());
            }
            let status = response.status().as_u16();
            let location = match response.headers().get(LOCATION) {
                Some(value) => String::from_utf8_lossy(value.as_bytes()).into_owned(),
                None => {
                    return Err(RequestError::MissingLocation {
                        status,
                        url: current.to_string(),
                    });
                }
            };
            let target =
                current
                    .join(&location)
                    .map_err(|_| RequestError::MalformedRedirect {
                        location: location.clone(),
                        url: current.to_string(),
                    })?;
            hops += 1;
            if hops >= MAX_REDIRECTS {
                return Err(RequestError::RedirectLimit {
                    limit: MAX_REDIRECTS,
                    from: current.to_string(),
                    to: target.to_string(),
                });
            }
            if current.scheme() == "https" && target.scheme() == "http" {
                warn!(from = %current, to = %target, "redirect downgrades https to http");
            }
            debug!(status, from = %current, to = %target, "following redirect");

            // The hop is a plain GET; only cookies from the prior response
            // are carried forward, stripped to their name=value pairs.
            let cookies = forwarded_cookies(&response);
            let mut hop = self.client.get(target.clone()).timeout(self.spec.timeout);
            if !cookies.is_empty() {
                hop = hop.header(COOKIE, cookies.as_str());
            }
            response = match hop.send().await {
                Ok(response) => response,
                Err(_) if self.spec.token.is_cancelled() => return Ok(()),
                Err(source) => {
                    return Err(RequestError::from_reqwest(self.state.url.clone(), source));
                }
            };
            current = target;
        }

        self.read_response(response).await
    }

    /// Headers actually sent: the validated set, with the body charset made
    /// explicit on a `Content-Type` that lacks one.
    fn effective_headers(&self) -> Vec<(String, String)> {
        let mut headers = self.spec.headers.clone();
        if matches!(self.spec.body, Some(RequestBody::Text { .. })) {
            for (name, value) in &mut headers {
                if name.eq_ignore_ascii_case("Content-Type")
                    && crate::content_type::charset_parameter(value).is_none()
                {
                    value.push_str("; charset=UTF-8");
                }
            }
        }
        headers
    }

    /// Loads the request body source and its length.
    async fn prepare_body(&mut self) -> Result<Option<PreparedBody>, RequestError> {
        match self.spec.body.take() {
            None => Ok(None),
            Some(RequestBody::Text { content, encoding }) => {
                Ok(Some(PreparedBody::Memory(charset::encode(
                    &content, encoding,
                ))))
            }
            Some(RequestBody::Bytes(bytes)) => Ok(Some(PreparedBody::Memory(bytes))),
            Some(RequestBody::File(file_spec)) => {
                let path = file_spec.full_path.clone();
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|source| RequestError::BodyFile {
                        path: path.clone(),
                        source,
                    })?;
                let length = file
                    .metadata()
                    .await
                    .map_err(|source| RequestError::BodyFile {
                        path: path.clone(),
                        source,
                    })?
                    .len();
                Ok(Some(PreparedBody::File { file, length, path }))
            }
        }
    }

    /// Captures the response line and headers, then streams the body to its
    /// destination.
    async fn read_response(&mut self, response: Response) -> Result<(), RequestError> {
        let status = response.status();
        self.state.status = i32::from(status.as_u16());

        let status_line = format!(
            "{:?} {} {}",
            response.version(),
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        );
        let mut header_map = HashMap::new();
        header_map.insert(
            STATUS_LINE_HEADER.to_string(),
            status_line.trim_end().to_string(),
        );
        for name in response.headers().keys() {
            let joined = response
                .headers()
                .get_all(name)
                .iter()
                .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
                .collect::<Vec<_>>()
                .join(",");
            header_map.insert(name.as_str().to_string(), joined);
        }
        self.state.response_headers = Some(header_map);

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .unwrap_or_default();
        let success = status.is_success();
        self.download_estimate = response.content_length();

        if self.spec.progress == ProgressDirection::Download {
            self.state.bytes_transferred = 0;
            self.state.bytes_estimated = self.download_estimate;
            self.state.phase = Phase::Began;
            self.channel.deliver(&self.state, false);
            self.state.phase = Phase::Progress;
        }

        let mut body = response.bytes_stream();

        // Zero readable bytes means no body at all; empty chunks alone do
        // not count as one.
        let mut first = None;
        while let Some(chunk) = body.next().await {
            if self.spec.token.is_cancelled() {
                return Ok(());
            }
            let chunk = chunk
                .map_err(|source| RequestError::from_reqwest(self.state.url.clone(), source))?;
            if !chunk.is_empty() {
                first = Some(chunk);
                break;
            }
        }
        let Some(first) = first else {
            debug!(url = %self.state.url, "response carried no body");
            return Ok(());
        };

        // Error bodies are never written to the destination file; they are
        // decoded as text so the message reaches the listener.
        if success && let ResponseDestination::File(destination) = self.spec.response.clone() {
            self.stream_to_file(first, body, destination).await
        } else {
            self.stream_to_memory(first, body, &content_type, success)
                .await
        }
    }

    async fn stream_to_memory<S>(
        &mut self,
        first: Bytes,
        mut body: S,
        content_type: &str,
        success: bool,
    ) -> Result<(), RequestError>
    where
        S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
    {
        let mut buffer: Vec<u8> = Vec::new();
        let mut chunk = Some(first);
        while let Some(data) = chunk {
            for piece in data.chunks(CHUNK_SIZE) {
                if self.spec.token.is_cancelled() {
                    return Ok(());
                }
                buffer.extend_from_slice(piece);
                self.note_downloaded(piece.len() as u64);
            }
            chunk = match body.next().await {
                Some(Ok(data)) => Some(data),
                Some(Err(source)) => {
                    return Err(RequestError::from_reqwest(self.state.url.clone(), source));
                }
                None => None,
            };
        }

        let preview = &buffer[..buffer.len().min(PREVIEW_SIZE)];
        let resolution = charset::resolve(content_type, preview);
        if success {
            match resolution {
                Some(resolution) => {
                    self.note_charset(&resolution);
                    self.state.response_type = ResponseKind::Text;
                    self.state.response = Some(ResponsePayload::Text(charset::decode(
                        &buffer,
                        resolution.encoding,
                    )));
                }
                None => {
                    self.state.response_type = ResponseKind::Binary;
                    self.state.response = Some(ResponsePayload::Bytes(buffer));
                }
            }
        } else {
            // Non-2xx bodies always decode as text.
            let resolution = resolution.unwrap_or(CharsetResolution {
                encoding: encoding_rs::UTF_8,
                source: CharsetSource::Implicit,
                declared: None,
            });
            self.note_charset(&resolution);
            self.state.response_type = ResponseKind::Text;
            self.state.response = Some(ResponsePayload::Text(charset::decode(
                &buffer,
                resolution.encoding,
            )));
        }
        Ok(())
    }

    async fn stream_to_file<S>(
        &mut self,
        first: Bytes,
        mut body: S,
        destination: FileSpec,
    ) -> Result<(), RequestError>
    where
        S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
    {
        let parent = destination
            .full_path
            .parent()
            .map_or_else(|| PathBuf::from("."), PathBuf::from);
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|source| RequestError::io(&parent, source))?;

        // Staged in the destination directory so the final commit is a
        // same-filesystem rename. The temp path cleans itself up unless it
        // is persisted.
        let temp_path = tempfile::Builder::new()
            .prefix(".netreq-")
            .suffix(".part")
            .tempfile_in(&parent)
            .map_err(|source| RequestError::io(&parent, source))?
            .into_temp_path();
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|source| RequestError::io(temp_path.to_path_buf(), source))?;

        let mut chunk = Some(first);
        while let Some(data) = chunk {
            for piece in data.chunks(CHUNK_SIZE) {
                if self.spec.token.is_cancelled() {
                    debug!(url = %self.state.url, "download cancelled, discarding partial file");
                    return Ok(());
                }
                file.write_all(piece)
                    .await
                    .map_err(|source| RequestError::io(temp_path.to_path_buf(), source))?;
                self.note_downloaded(piece.len() as u64);
            }
            chunk = match body.next().await {
                Some(Ok(data)) => Some(data),
                Some(Err(source)) => {
                    return Err(RequestError::from_reqwest(self.state.url.clone(), source));
                }
                None => None,
            };
        }
        file.flush()
            .await
            .map_err(|source| RequestError::io(temp_path.to_path_buf(), source))?;
        drop(file);

        if let Err(source) = tokio::fs::remove_file(&destination.full_path).await
            && source.kind() != io::ErrorKind::NotFound
        {
            return Err(RequestError::io(&destination.full_path, source));
        }
        temp_path
            .persist(&destination.full_path)
            .map_err(|persist| RequestError::Rename {
                from: persist.path.to_path_buf(),
                to: destination.full_path.clone(),
                source: persist.error,
            })?;
        debug!(path = %destination.full_path.display(), "response committed to file");

        self.state.response_type = ResponseKind::Binary;
        self.state.response = Some(ResponsePayload::File(destination));
        Ok(())
    }

    fn note_downloaded(&mut self, bytes: u64) {
        self.downloaded += bytes;
        if self.spec.progress == ProgressDirection::Download {
            self.state.bytes_transferred = self.downloaded;
            self.channel.deliver(&self.state, false);
        }
    }

    fn note_charset(&mut self, resolution: &CharsetResolution) {
        let label = resolution
            .declared
            .clone()
            .unwrap_or_else(|| resolution.encoding.name().to_string());
        self.state.set_debug("charset", label);
        self.state
            .set_debug("charsetSource", resolution.source.as_str());
    }

    fn quiet_url(&self) -> bool {
        self.config
            .quiet_error_url_prefixes
            .iter()
            .any(|prefix| self.state.url.starts_with(prefix))
    }

    /// Converts the outcome into the terminal snapshot and delivers it.
    fn finish(&mut self, result: Result<(), RequestError>) {
        if let Err(error) = result {
            let message = error.to_string();
            if self.quiet_url() {
                debug!(url = %self.state.url, error = %message, "request failed");
            } else {
                error!(url = %self.state.url, error = %message, "request failed");
            }
            self.state.is_error = true;
            self.state.response_type = ResponseKind::Text;
            self.state.response = Some(ResponsePayload::Text(message.clone()));
            self.state.set_debug("errorMessage", message);
        }

        if self.spec.progress == ProgressDirection::None {
            self.state.bytes_transferred = self.downloaded;
            self.state.bytes_estimated = self.download_estimate.or(Some(self.downloaded));
        }

        if self.state.response.is_none() {
            self.state.response_type = ResponseKind::Text;
            self.state.response = Some(ResponsePayload::Text(String::new()));
        }
        self.state.phase = Phase::Ended;

        if !self.spec.token.is_cancelled()
            && !self.state.is_error
            && (200..300).contains(&self.state.status)
            && let Some(descriptor) = self.spec.success_notification.take()
        {
            self.notifications.post(&descriptor);
        }

        self.channel.deliver(&self.state, true);
        debug!(
            url = %self.state.url,
            status = self.state.status,
            is_error = self.state.is_error,
            "request finished"
        );
    }
}

/// A request body loaded and measured, before it becomes a stream.
enum PreparedBody {
    Memory(Vec<u8>),
    File {
        file: tokio::fs::File,
        length: u64,
        path: PathBuf,
    },
}

impl PreparedBody {
    fn length(&self) -> u64 {
        match self {
            Self::Memory(bytes) => bytes.len() as u64,
            Self::File { length, .. } => *length,
        }
    }

    fn into_body(self, progress: UploadProgress) -> Body {
        match self {
            Self::Memory(bytes) => Body::wrap_stream(memory_stream(bytes, progress)),
            Self::File { file, path, .. } => Body::wrap_stream(file_stream(file, path, progress)),
        }
    }
}

/// Upload-side accounting shared with the body stream.
struct UploadProgress {
    channel: Arc<CallbackChannel>,
    token: CancellationToken,
    state: RequestState,
    sent: Arc<AtomicU64>,
    report: bool,
}

impl UploadProgress {
    fn record(&mut self, bytes: u64) {
        let total = self.sent.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if self.report {
            self.state.bytes_transferred = total;
            self.channel.deliver(&self.state, false);
        }
    }
}

/// Streams an in-memory body in fixed chunks, observing cancellation at each
/// boundary. A cancelled token surfaces as a stream error, which aborts the
/// transfer.
fn memory_stream(
    bytes: Vec<u8>,
    progress: UploadProgress,
) -> impl Stream<Item = Result<Vec<u8>, io::Error>> + Send {
    stream::unfold(
        (bytes, 0usize, progress),
        |(bytes, offset, mut progress)| async move {
            if offset >= bytes.len() {
                return None;
            }
            if progress.token.is_cancelled() {
                return Some((
                    Err(io::Error::other("request cancelled")),
                    (bytes, usize::MAX, progress),
                ));
            }
            let end = (offset + CHUNK_SIZE).min(bytes.len());
            let chunk = bytes[offset..end].to_vec();
            progress.record(chunk.len() as u64);
            Some((Ok(chunk), (bytes, end, progress)))
        },
    )
}

/// Streams a body file from disk in fixed chunks.
fn file_stream(
    file: tokio::fs::File,
    path: PathBuf,
    progress: UploadProgress,
) -> impl Stream<Item = Result<Vec<u8>, io::Error>> + Send {
    stream::unfold(
        (file, path, progress, false),
        |(mut file, path, mut progress, done)| async move {
            if done {
                return None;
            }
            if progress.token.is_cancelled() {
                return Some((
                    Err(io::Error::other("request cancelled")),
                    (file, path, progress, true),
                ));
            }
            let mut buffer = vec![0u8; CHUNK_SIZE];
            match file.read(&mut buffer).await {
                Ok(0) => None,
                Ok(read) => {
                    buffer.truncate(read);
                    progress.record(read as u64);
                    Some((Ok(buffer), (file, path, progress, false)))
                }
                Err(source) => {
                    warn!(path = %path.display(), error = %source, "request body file read failed");
                    Some((Err(source), (file, path, progress, true)))
                }
            }
        },
    )
}

/// Collapses the prior response's `Set-Cookie` values into a `Cookie` header
/// value for the next hop.
fn forwarded_cookies(response: &Response) -> String {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(';').next())
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .collect::<Vec<_>>()
        .join("; ")
}
