//! Per-event orchestration: verify, classify, resolve, append.
//!
//! The handler is synchronous per event and holds no state beyond its
//! collaborators. Failures never cross event boundaries: each event maps to
//! one [`HandlerResult`] that the HTTP layer turns into a status code, and
//! the upstream sender retries on non-2xx.

use crate::event::{ParsedEvent, UpdateEvent};
use crate::linear::{TeamDirectory, UNKNOWN_TEAM};
use crate::notion::{DocumentRegistry, Workspace, append_update, daily_title};
use crate::signature;
use chrono::Utc;
use secrecy::SecretString;
use std::sync::Arc;

/// Outcome of handling a single webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerResult {
    /// The update was appended (or was a tolerated duplicate).
    Success,
    /// The payload was valid but not a recognized update event. Not an
    /// error; unrelated event types are expected traffic.
    Ignored,
    /// Signature or replay verification failed.
    Unauthorized,
    /// Processing failed after authentication. Maps to a non-2xx status so
    /// the sender retries.
    Failed(String),
}

/// Orchestrates the per-event pipeline.
pub struct EventHandler<D, W> {
    directory: Arc<D>,
    workspace: Arc<W>,
    registry: DocumentRegistry<W>,
    webhook_secret: SecretString,
}

impl<D: TeamDirectory, W: Workspace> EventHandler<D, W> {
    /// Creates a handler writing daily documents into `source_database_id`.
    pub fn new(
        directory: Arc<D>,
        workspace: Arc<W>,
        source_database_id: String,
        webhook_secret: SecretString,
    ) -> Self {
        let registry = DocumentRegistry::new(Arc::clone(&workspace), source_database_id);
        Self {
            directory,
            workspace,
            registry,
            webhook_secret,
        }
    }

    /// Handles one raw webhook delivery.
    pub async fn handle(&self, raw_body: &[u8], signature_header: Option<&str>) -> HandlerResult {
        let result = self.handle_inner(raw_body, signature_header).await;
        let outcome = match &result {
            HandlerResult::Success => "success",
            HandlerResult::Ignored => "ignored",
            HandlerResult::Unauthorized => "unauthorized",
            HandlerResult::Failed(_) => "failed",
        };
        metrics::counter!("syncpulse_events_total", "outcome" => outcome).increment(1);
        result
    }

    async fn handle_inner(
        &self,
        raw_body: &[u8],
        signature_header: Option<&str>,
    ) -> HandlerResult {
        // Verification runs against the raw bytes, before any parsing.
        if !signature::verify(raw_body, signature_header, &self.webhook_secret) {
            tracing::warn!("webhook signature verification failed");
            return HandlerResult::Unauthorized;
        }

        let event = match ParsedEvent::from_slice(raw_body) {
            ParsedEvent::Update(event) => event,
            ParsedEvent::Unrecognized { kind } => {
                tracing::debug!(kind = %kind, "ignoring unrecognized event");
                return HandlerResult::Ignored;
            },
            ParsedEvent::Malformed { reason } => {
                tracing::warn!(reason = %reason, "ignoring malformed payload");
                return HandlerResult::Ignored;
            },
        };

        let now = Utc::now();
        if !signature::fresh_timestamp(event.webhook_timestamp_ms, now) {
            return HandlerResult::Unauthorized;
        }

        let team = self.team_label(&event).await;
        let title = daily_title(&team, now.date_naive());
        tracing::info!(
            team = %team,
            project = %event.project_name,
            title = %title,
            "processing project update"
        );

        let page_id = match self.registry.resolve_or_create(&title, now.date_naive()).await {
            Ok(page_id) => page_id,
            Err(e) => {
                tracing::error!(error = %e, title = %title, "document resolution failed");
                return HandlerResult::Failed(e.to_string());
            },
        };

        match append_update(self.workspace.as_ref(), &page_id, &event).await {
            Ok(outcome) => {
                tracing::info!(page_id = %page_id, outcome = ?outcome, "update appended");
                HandlerResult::Success
            },
            Err(e) => {
                tracing::error!(error = %e, page_id = %page_id, "append failed");
                HandlerResult::Failed(e.to_string())
            },
        }
    }

    /// Resolves the team label for the daily document title.
    ///
    /// Lookup failure is non-fatal: losing an update is worse than
    /// mislabeling it, so this degrades to the project name or a
    /// placeholder.
    async fn team_label(&self, event: &UpdateEvent) -> String {
        if let Some(name) = &event.team_name {
            return name.clone();
        }

        if let Some(team_id) = &event.team_id {
            match self.directory.team_name(team_id).await {
                Ok(name) => return name,
                Err(e) => {
                    tracing::warn!(
                        team_id = %team_id,
                        error = %e,
                        "team lookup failed, using fallback label"
                    );
                },
            }
        }

        if event.project_name != "Unknown Project" {
            event.project_name.clone()
        } else {
            UNKNOWN_TEAM.to_string()
        }
    }
}
