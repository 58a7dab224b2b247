//! Server-sent events transport for `suitestream-core`.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use suitestream_core::{RunContext, StreamConnection};
//! use suitestream_sse::{SseClientConfig, SseTransport};
//!
//! # async fn demo() -> Result<(), suitestream_core::ConfigError> {
//! let transport = SseTransport::new(SseClientConfig::new("http://localhost:8787"))?;
//! let connection = StreamConnection::new(Arc::new(transport));
//! let context = RunContext::new("run-42");
//! context.connect(&connection).join().await;
//! # Ok(())
//! # }
//! ```

/// Client configuration.
pub mod config;
/// Incremental `text/event-stream` frame decoder.
pub mod decoder;
/// reqwest-backed `PushTransport`.
pub mod transport;

pub use config::SseClientConfig;
pub use decoder::{DEFAULT_MAX_FRAME_BYTES, FrameTooLarge, SseDecoder, SseFrame};
pub use transport::SseTransport;
