//! Worker process support for mediashrink.
//!
//! Reencoding runs in a separate process so an unrecoverable codec failure,
//! or a codec that hangs on stop, can be dealt with by killing the process
//! without taking the host application down.
//!
//! - [`serve`]: child side. A host binary provides the platform
//!   [`MediaBackend`](mediashrink_core::MediaBackend) and calls
//!   [`serve_stdio`] from `main`.
//! - [`ProcessBinder`]: parent side. Plugs into
//!   [`ShrinkQueue`](mediashrink_core::ShrinkQueue) and spawns the worker
//!   executable per binding.
//!
//! # Example
//!
//! ```rust,ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     mediashrink_worker::init_logging();
//!     let backend = Arc::new(PlatformBackend::new()?);
//!     mediashrink_worker::serve_stdio(backend, PumpConfig::default()).await
//! }
//! ```

pub mod logging;
pub mod process;
pub mod serve;

pub use logging::{init_json_logging, init_logging, LOG_ENV};
pub use process::ProcessBinder;
pub use serve::{serve, serve_stdio};
