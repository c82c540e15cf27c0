//! Asynchronous HTTP Request Engine
//!
//! This library embeds a declarative HTTP request engine in a larger host
//! application: requests are described as data, executed off the caller's
//! thread, and reported back through throttled event snapshots on a
//! host-owned delivery context.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`engine`] - submission surface, open-request tracking, configuration
//! - [`params`] - caller input and its validation into immutable specs
//! - [`callback`] - throttled, cancellation-aware event delivery
//! - [`charset`] - text-encoding resolution for response bodies
//! - [`collab`] - traits the embedding host implements (paths,
//!   notifications, connectivity, delivery context)
//! - [`state`] - request lifecycle state and listener-facing snapshots
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use netreq::{DirectoryResolver, EngineConfig, NetworkEngine, RequestParams};
//!
//! # async fn example() -> Result<(), reqwest::Error> {
//! let engine = NetworkEngine::new(
//!     EngineConfig::default(),
//!     Arc::new(DirectoryResolver::new("/tmp")),
//! )?;
//! let _handle = engine.submit(
//!     "https://example.com/",
//!     Some("GET"),
//!     Some(Box::new(|event: netreq::RequestEvent| {
//!         println!("phase {:?} status {}", event.phase, event.status);
//!     })),
//!     None,
//!     RequestParams::default(),
//! );
//! # Ok(())
//! # }
//! ```

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod callback;
pub mod cancel;
pub mod charset;
pub mod collab;
pub mod content_type;
pub mod engine;
pub mod error;
mod executor;
pub mod params;
pub mod registry;
pub mod state;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use callback::{CallbackChannel, RequestListener, THROTTLE_WINDOW};
pub use cancel::CancellationToken;
pub use collab::{
    ConnectionStatus, ConnectivityProbe, DeliveryContext, DeliveryTask, DirectoryResolver,
    NotificationSink, PathResolver, ResolvedPath,
};
pub use engine::{EngineConfig, NetworkEngine};
pub use error::{RequestError, ValidationError};
pub use params::{
    BodyInput, FileTarget, ProgressDirection, RequestBody, RequestParams, RequestSpec,
    ResponseDestination,
};
pub use state::{FileSpec, Phase, RequestEvent, RequestState, ResponseKind, ResponsePayload};
