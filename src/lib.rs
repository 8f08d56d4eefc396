//! # Syncpulse
//!
//! Relays project update webhooks into a documentation workspace.
//!
//! Syncpulse receives signed "project update" events from a
//! project-management service (Linear), appends each update to a per-team,
//! per-day page in a documentation workspace (Notion), and periodically rolls
//! a trailing window of those pages into a single aggregate document.
//!
//! ## Pipeline
//!
//! ```text
//! inbound event -> signature verify -> event handler -> document registry -> block append
//! scheduler (timer) -> rollup job -> source database (read) -> aggregate page
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use syncpulse::{EventHandler, SyncConfig};
//!
//! let config = SyncConfig::load()?;
//! let handler = EventHandler::new(directory, workspace, settings);
//! let result = handler.handle(raw_body, signature_header).await;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
// multiple_crate_versions is inherently crate-level (detects duplicate transitive dependencies).
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod config;
pub mod event;
pub mod handler;
pub mod linear;
pub mod notion;
pub mod rollup;
pub mod scheduler;
pub mod server;
pub mod signature;

// Re-exports for convenience
pub use config::{RollupSettings, SyncConfig};
pub use event::{ParsedEvent, UpdateAction, UpdateEvent};
pub use handler::{EventHandler, HandlerResult};
pub use linear::{LinearClient, TeamDirectory};
pub use notion::{NotionClient, PageRef, Workspace};
pub use rollup::{JobOutcome, RollupRunner};
pub use scheduler::Scheduler;

/// Error type for syncpulse operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Missing configuration, malformed identifiers |
/// | `UpstreamLookupFailed` | Team name lookup fails (non-fatal, degraded labeling) |
/// | `DocumentResolutionFailed` | Daily page cannot be found or created |
/// | `PartialAppend` | A later append chunk failed after an earlier one landed |
/// | `Transient` | Network errors, rate limits, 5xx responses (retried) |
/// | `Fatal` | Invalid database id, other 4xx responses (not retried) |
/// | `OperationFailed` | Everything else (serialization, I/O) |
///
/// Signature rejection and rollup overlap are request outcomes rather than
/// errors; they surface as [`HandlerResult::Unauthorized`] and
/// [`JobOutcome::AlreadyRunning`].
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The upstream metadata lookup failed.
    ///
    /// Non-fatal: the handler falls back to a placeholder team label.
    #[error("upstream lookup failed: {0}")]
    UpstreamLookupFailed(String),

    /// The daily document could not be resolved or created.
    #[error("document resolution failed: {0}")]
    DocumentResolutionFailed(String),

    /// A later append chunk failed after an earlier chunk succeeded.
    ///
    /// Surfaced distinctly so operators can detect partial writes.
    #[error("partial append on page {page_id}: {cause}")]
    PartialAppend {
        /// The page that now holds an incomplete update.
        page_id: String,
        /// The underlying failure.
        cause: String,
    },

    /// A transient failure (network, rate limit, 5xx). Safe to retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A non-transient failure (invalid database id, 4xx). Not retried.
    #[error("fatal failure: {0}")]
    Fatal(String),

    /// An operation failed.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

/// Result type alias for syncpulse operations.
pub type Result<T> = std::result::Result<T, Error>;
