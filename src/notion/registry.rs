//! Document registry: resolves a daily document to a page id, creating it
//! when absent.
//!
//! Lookup is an exact title match within the target database. There is no
//! transactional create-if-absent primitive upstream, so two concurrent
//! resolves for the same key can both observe "absent" and create duplicate
//! pages. That race is tolerated: later resolves return the earliest-created
//! match deterministically and log the anomaly.

use super::Workspace;
use crate::{Error, Result};
use chrono::{Datelike, NaiveDate};
use std::sync::Arc;

/// Resolves daily documents within a single source database.
pub struct DocumentRegistry<W> {
    workspace: Arc<W>,
    database_id: String,
}

impl<W: Workspace> DocumentRegistry<W> {
    /// Creates a registry for the given database.
    pub fn new(workspace: Arc<W>, database_id: String) -> Self {
        Self {
            workspace,
            database_id,
        }
    }

    /// Finds an existing page by exact title, if any.
    ///
    /// Multiple matches resolve to the earliest-created page.
    pub async fn find_existing(&self, title: &str) -> Result<Option<String>> {
        let pages = self
            .workspace
            .find_pages_by_title(&self.database_id, title)
            .await
            .map_err(resolution_error)?;

        if pages.len() > 1 {
            tracing::warn!(
                title = %title,
                count = pages.len(),
                "duplicate daily documents found, using earliest"
            );
            metrics::counter!("syncpulse_duplicate_documents_total").increment(1);
        }

        Ok(pages.into_iter().next().map(|p| p.id))
    }

    /// Resolves the page for `title`, creating it when absent.
    ///
    /// On resolve of an existing page the `Week ending on` property is
    /// refreshed; a refresh failure is non-fatal.
    pub async fn resolve_or_create(&self, title: &str, today: NaiveDate) -> Result<String> {
        let week_ending = last_friday(today);

        if let Some(page_id) = self.find_existing(title).await? {
            tracing::debug!(page_id = %page_id, title = %title, "using existing daily document");
            if let Err(e) = self.workspace.set_week_ending(&page_id, week_ending).await {
                tracing::warn!(page_id = %page_id, error = %e, "could not refresh week ending");
            }
            return Ok(page_id);
        }

        tracing::info!(title = %title, "creating daily document");
        let page_id = self
            .workspace
            .create_page(&self.database_id, title, Some(week_ending))
            .await
            .map_err(resolution_error)?;

        Ok(page_id)
    }
}

fn resolution_error(error: Error) -> Error {
    Error::DocumentResolutionFailed(error.to_string())
}

/// Title of the daily document for a team and date.
#[must_use]
pub fn daily_title(team: &str, date: NaiveDate) -> String {
    format!("{team} Update @{}", date.format("%Y-%m-%d"))
}

/// The Friday ending the week that contains `today`.
///
/// Monday through Friday map to the upcoming (or current) Friday; Saturday
/// and Sunday map back to the Friday just passed.
#[must_use]
pub fn last_friday(today: NaiveDate) -> NaiveDate {
    let weekday = i64::from(today.weekday().num_days_from_monday());
    if weekday <= 4 {
        today + chrono::Duration::days(4 - weekday)
    } else {
        today - chrono::Duration::days(weekday - 4)
    }
}
