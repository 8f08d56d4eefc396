//! Time-windowed aggregation job.
//!
//! Rolls every daily document created inside a trailing window into one
//! fresh aggregate page in the destination database. Runs are gated by
//! day-of-week, guarded against overlap by a single in-flight flag, and
//! wrapped in an explicit retry loop with exponential backoff. A run that
//! exhausts its retries is reported and logged; it never takes the host
//! process down, and the next scheduled tick attempts a fresh run.

use crate::config::RollupSettings;
use crate::notion::Workspace;
use crate::{Error, Result};
use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Block types carried over from source pages into the aggregate.
const CARRIED_BLOCK_TYPES: &[&str] = &[
    "paragraph",
    "heading_1",
    "heading_2",
    "heading_3",
    "bulleted_list_item",
    "numbered_list_item",
    "divider",
    "embed",
    "quote",
    "callout",
    "to_do",
];

/// Terminal report of one rollup invocation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    /// The aggregate page was created.
    Succeeded {
        /// Number of source documents aggregated.
        aggregated: usize,
        /// Id of the aggregate page.
        page_id: String,
        /// Attempts used, including the successful one.
        attempts: u32,
    },
    /// The day gate kept the run from executing. No network calls made.
    Skipped,
    /// Another run is in progress; this invocation did not execute.
    AlreadyRunning,
    /// All attempts failed, or a fatal error stopped the run early.
    Failed {
        /// Attempts made before giving up.
        attempts: u32,
        /// The final error.
        error: String,
    },
}

/// Retryable-error predicate for the rollup retry loop.
///
/// Only transient failures (network, rate limit, 5xx) are retried; fatal
/// failures such as an invalid destination database fail immediately.
#[must_use]
pub const fn is_retryable(error: &Error) -> bool {
    matches!(error, Error::Transient(_))
}

/// Runs the aggregation job with a single-flight guard.
///
/// Shared between the scheduler and the manual-trigger endpoint; both paths
/// observe the same guard, so at most one run is ever active.
pub struct RollupRunner<W> {
    workspace: Arc<W>,
    source_database_id: String,
    rollup_database_id: String,
    settings: RollupSettings,
    in_flight: AtomicBool,
}

impl<W: Workspace> RollupRunner<W> {
    /// Creates a runner reading from `source_database_id` and writing
    /// aggregates into `rollup_database_id`.
    pub fn new(
        workspace: Arc<W>,
        source_database_id: String,
        rollup_database_id: String,
        settings: RollupSettings,
    ) -> Self {
        Self {
            workspace,
            source_database_id,
            rollup_database_id,
            settings,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Runs the job once, anchored at `now`.
    ///
    /// Re-entrant only after a terminal state: a call arriving while a run
    /// is active reports [`JobOutcome::AlreadyRunning`] without executing.
    pub async fn run(&self, now: DateTime<Utc>) -> JobOutcome {
        if !self.settings.runs_on(now.weekday()) {
            tracing::info!(weekday = %now.weekday(), "rollup gated off for this weekday");
            return JobOutcome::Skipped;
        }

        let Some(_guard) = InFlightGuard::try_acquire(&self.in_flight) else {
            tracing::warn!("rollup requested while a run is in progress");
            return JobOutcome::AlreadyRunning;
        };

        let outcome = self.run_with_retry(now).await;
        let status = match &outcome {
            JobOutcome::Succeeded { .. } => "succeeded",
            JobOutcome::Skipped => "skipped",
            JobOutcome::AlreadyRunning => "already_running",
            JobOutcome::Failed { .. } => "failed",
        };
        metrics::counter!("syncpulse_rollup_runs_total", "status" => status).increment(1);
        outcome
    }

    /// Explicit retry loop with attempt counter and computed delay.
    async fn run_with_retry(&self, now: DateTime<Utc>) -> JobOutcome {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.run_once(now).await {
                Ok((aggregated, page_id)) => {
                    tracing::info!(aggregated, page_id = %page_id, attempts = attempt, "rollup succeeded");
                    return JobOutcome::Succeeded {
                        aggregated,
                        page_id,
                        attempts: attempt,
                    };
                },
                Err(e) if is_retryable(&e) && attempt < self.settings.max_attempts => {
                    let delay = self.settings.delay_for_attempt(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "transient rollup failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(e) => {
                    tracing::error!(attempts = attempt, error = %e, "rollup failed");
                    return JobOutcome::Failed {
                        attempts: attempt,
                        error: e.to_string(),
                    };
                },
            }
        }
    }

    /// One aggregation pass: query the window, merge content, create the
    /// aggregate page.
    async fn run_once(&self, now: DateTime<Utc>) -> Result<(usize, String)> {
        let start = now - chrono::Duration::days(self.settings.window_days);
        let sources = self
            .workspace
            .pages_created_between(&self.source_database_id, start, now)
            .await?;
        tracing::debug!(count = sources.len(), "source documents in window");

        let mut blocks = Vec::new();
        for source in &sources {
            // Separator identifying the originating team/date document.
            blocks.push(json!({
                "object": "block",
                "type": "heading_1",
                "heading_1": { "rich_text": [ {
                    "type": "text",
                    "text": { "content": source.title },
                } ] },
            }));

            let children = self.workspace.list_children(&source.id).await?;
            blocks.extend(children.iter().filter_map(carried_block));
        }

        let title = rollup_title(start, now);
        let page_id = self
            .workspace
            .create_page(&self.rollup_database_id, &title, None)
            .await?;

        for chunk in blocks.chunks(crate::notion::MAX_CHILDREN_PER_APPEND) {
            self.workspace.append_children(&page_id, chunk).await?;
        }

        Ok((sources.len(), page_id))
    }
}

/// Title of the aggregate page, encoding the window bounds.
fn rollup_title(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!(
        "Weekly Rollup {} to {}",
        start.date_naive().format("%Y-%m-%d"),
        end.date_naive().format("%Y-%m-%d")
    )
}

/// Re-buildable copy of a source block, stripped of read-only fields.
///
/// Internal bookkeeping paragraphs (update id markers) are left behind.
fn carried_block(block: &Value) -> Option<Value> {
    let kind = block.get("type").and_then(Value::as_str)?;
    if !CARRIED_BLOCK_TYPES.contains(&kind) {
        return None;
    }
    if crate::notion::is_marker_block(block) {
        return None;
    }

    let payload = block.get(kind).cloned().unwrap_or_else(|| json!({}));
    Some(json!({ "object": "block", "type": kind, kind: payload }))
}

/// RAII guard over the in-flight flag; released on drop.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
