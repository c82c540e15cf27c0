//! The engine facade: request submission, cancellation, connectivity.
//!
//! A [`NetworkEngine`] is the single long-lived object a host embeds. It
//! validates submissions, spawns one executor task per request, and tracks
//! the open set for cancellation. Redirect handling is engine policy, so the
//! shared transport client is built with redirect following disabled.

use std::sync::{Arc, Mutex, PoisonError};

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::callback::{CallbackChannel, RequestListener};
use crate::cancel::CancellationToken;
use crate::collab::{
    AlwaysOnline, ConnectionStatus, ConnectivityProbe, DeliveryContext, NoopNotifications,
    NotificationSink, PathResolver,
};
use crate::executor::RequestExecutor;
use crate::params::{RequestParams, RequestSpec};
use crate::registry::OpenRequestRegistry;

/// Engine-wide configuration, loadable from host configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// User-Agent sent with every request.
    pub user_agent: String,
    /// Send PATCH as POST with an `X-HTTP-Method-Override: PATCH` header,
    /// for transports and servers that mishandle PATCH.
    pub patch_via_post_override: bool,
    /// Force `Accept-Encoding: identity` on HEAD requests, for servers that
    /// answer compressed HEAD with misleading lengths.
    pub head_forces_identity_encoding: bool,
    /// URL prefixes whose request failures are logged at debug instead of
    /// error. Meant for first-party telemetry endpoints whose outages would
    /// otherwise flood the log.
    pub quiet_error_url_prefixes: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("netreq/{}", env!("CARGO_PKG_VERSION")),
            patch_via_post_override: false,
            head_forces_identity_encoding: false,
            quiet_error_url_prefixes: Vec::new(),
        }
    }
}

/// Asynchronous HTTP request engine.
pub struct NetworkEngine {
    client: Client,
    config: Arc<EngineConfig>,
    registry: Arc<OpenRequestRegistry>,
    paths: Arc<dyn PathResolver>,
    notifications: Arc<dyn NotificationSink>,
    connectivity: Arc<dyn ConnectivityProbe>,
    last_context: Mutex<Option<Arc<dyn DeliveryContext>>>,
}

impl NetworkEngine {
    /// Creates an engine with the given configuration and path collaborator.
    ///
    /// # Errors
    ///
    /// Returns the transport error when the underlying HTTP client cannot be
    /// constructed.
    pub fn new(
        config: EngineConfig,
        paths: Arc<dyn PathResolver>,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            config: Arc::new(config),
            registry: Arc::new(OpenRequestRegistry::new()),
            paths,
            notifications: Arc::new(NoopNotifications),
            connectivity: Arc::new(AlwaysOnline),
            last_context: Mutex::new(None),
        })
    }

    /// Replaces the success-notification sink.
    #[must_use]
    pub fn with_notifications(mut self, notifications: Arc<dyn NotificationSink>) -> Self {
        self.notifications = notifications;
        self
    }

    /// Replaces the connectivity probe.
    #[must_use]
    pub fn with_connectivity(mut self, connectivity: Arc<dyn ConnectivityProbe>) -> Self {
        self.connectivity = connectivity;
        self
    }

    /// Submits a request for asynchronous execution.
    ///
    /// Returns the request handle, which doubles as its cancellation token,
    /// or `None` when validation rejected the input (the failure is logged;
    /// no listener is ever invoked for a rejected submission). Must be
    /// called within a tokio runtime.
    pub fn submit(
        &self,
        url: &str,
        method: Option<&str>,
        listener: Option<Box<dyn RequestListener>>,
        context: Option<Arc<dyn DeliveryContext>>,
        params: RequestParams,
    ) -> Option<CancellationToken> {
        let spec = match RequestSpec::validate(url, method, params, self.paths.as_ref()) {
            Ok(spec) => spec,
            Err(reason) => {
                error!(url, error = %reason, "request validation failed");
                return None;
            }
        };
        let token = spec.token.clone();

        let context = self.select_context(context);
        let channel = Arc::new(CallbackChannel::new(listener, context, token.clone()));

        let id = self.registry.add(token.clone());
        let registry = Arc::clone(&self.registry);
        let executor = RequestExecutor::new(
            self.client.clone(),
            Arc::clone(&self.config),
            spec,
            channel,
            Arc::clone(&self.notifications),
        );
        tokio::spawn(async move {
            executor.run().await;
            registry.remove(id);
        });

        Some(token)
    }

    /// Picks the delivery context for a submission, falling back to the most
    /// recently seen live context when the caller's is gone.
    fn select_context(
        &self,
        context: Option<Arc<dyn DeliveryContext>>,
    ) -> Option<Arc<dyn DeliveryContext>> {
        let mut last = self
            .last_context
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match context {
            Some(context) if context.is_alive() => {
                *last = Some(Arc::clone(&context));
                Some(context)
            }
            _ => {
                let fallback = last.clone().filter(|context| context.is_alive());
                if fallback.is_none() {
                    warn!("no live delivery context, request will run without callbacks");
                }
                fallback
            }
        }
    }

    /// Cancels a request. Returns true when this call was the one that set
    /// the flag; the executor unwinds at its next chunk boundary.
    pub fn cancel(&self, handle: &CancellationToken) -> bool {
        let first = handle.cancel();
        if first {
            debug!("request cancelled");
        }
        first
    }

    /// Cancels every open request.
    pub fn abort_all(&self) {
        let open = self.registry.len();
        if open > 0 {
            info!(open, "aborting all open requests");
        }
        self.registry.abort_all();
    }

    /// Number of requests currently in flight.
    #[must_use]
    pub fn open_requests(&self) -> usize {
        self.registry.len()
    }

    /// Current connectivity status, as reported by the host's probe.
    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        self.connectivity.status()
    }
}
