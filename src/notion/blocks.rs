//! Block building and appending for project updates.
//!
//! Each update becomes an ordered block sequence appended to its daily
//! document: a divider (range start marker), a heading with the project
//! name, an optional health line, the body with URLs rendered as inline
//! links, and a gray `linear-update-id:` marker paragraph that makes
//! appends idempotent.
//!
//! Block order is insertion order, which is event arrival order. Nothing
//! here reorders by project or time.

use super::Workspace;
use crate::event::{UpdateAction, UpdateEvent};
use crate::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};

/// Maximum children accepted by a single batched append request.
pub const MAX_CHILDREN_PER_APPEND: usize = 100;

/// Prefix of the idempotency marker paragraph terminating each update.
const MARKER_PREFIX: &str = "linear-update-id:";

/// Trailing punctuation stripped from detected URLs.
const URL_TRAILING_PUNCT: &[char] = &['.', ',', ';', ':', '!', '?', ')'];

static URL_RE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"https?://[^\s\)\]\}]+").unwrap()
});

/// Result of appending an update to a daily document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The block sequence was appended.
    Appended {
        /// Number of blocks written.
        blocks: usize,
    },
    /// The update was already present and the event was a create; skipped.
    SkippedDuplicate,
}

/// Appends an update's block sequence to a page, idempotently.
///
/// When the event carries an update id, the page is scanned for a prior
/// append of the same update: a duplicate `create` is skipped, a duplicate
/// `update` replaces the prior block range.
///
/// # Errors
///
/// Returns [`Error::PartialAppend`] if a later chunk of a long sequence
/// fails after an earlier chunk landed.
pub async fn append_update<W: Workspace>(
    workspace: &W,
    page_id: &str,
    event: &UpdateEvent,
) -> Result<AppendOutcome> {
    if let Some(update_id) = &event.update_id {
        let children = workspace.list_children(page_id).await?;
        if let Some(prior_block_ids) = find_update_range(&children, update_id) {
            match event.action {
                UpdateAction::Create => {
                    tracing::info!(update_id = %update_id, "skipping duplicate create");
                    metrics::counter!("syncpulse_duplicate_updates_total").increment(1);
                    return Ok(AppendOutcome::SkippedDuplicate);
                },
                UpdateAction::Update => {
                    tracing::info!(
                        update_id = %update_id,
                        blocks = prior_block_ids.len(),
                        "replacing prior update blocks"
                    );
                    for block_id in &prior_block_ids {
                        workspace.delete_block(block_id).await?;
                    }
                },
            }
        }
    }

    let blocks = build_update_blocks(event);
    append_in_chunks(workspace, page_id, &blocks).await?;
    Ok(AppendOutcome::Appended {
        blocks: blocks.len(),
    })
}

/// Appends blocks in batches of [`MAX_CHILDREN_PER_APPEND`].
///
/// A failure on a later chunk after the first succeeded is a partial write
/// and is surfaced distinctly as [`Error::PartialAppend`].
pub(crate) async fn append_in_chunks<W: Workspace>(
    workspace: &W,
    page_id: &str,
    blocks: &[Value],
) -> Result<()> {
    for (index, chunk) in blocks.chunks(MAX_CHILDREN_PER_APPEND).enumerate() {
        if let Err(e) = workspace.append_children(page_id, chunk).await {
            if index > 0 {
                return Err(Error::PartialAppend {
                    page_id: page_id.to_string(),
                    cause: e.to_string(),
                });
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Builds the ordered block sequence for an update event.
#[must_use]
pub fn build_update_blocks(event: &UpdateEvent) -> Vec<Value> {
    let mut blocks = Vec::new();

    // The divider is the range start marker for later replacement.
    if event.update_id.is_some() {
        blocks.push(json!({ "object": "block", "type": "divider", "divider": {} }));
    }

    let mut heading = json!({
        "type": "text",
        "text": { "content": event.project_name },
    });
    if let (Some(url), Some(text)) = (&event.project_url, heading.pointer_mut("/text")) {
        if let Some(obj) = text.as_object_mut() {
            obj.insert("link".to_string(), json!({ "url": url }));
        }
    }
    blocks.push(json!({
        "object": "block",
        "type": "heading_2",
        "heading_2": { "rich_text": [ heading ] },
    }));

    if let Some(health) = &event.health {
        blocks.push(health_paragraph(health));
    }

    let body_rich_text = if event.body.is_empty() {
        Vec::new()
    } else {
        rich_text_with_links(&event.body)
    };
    blocks.push(json!({
        "object": "block",
        "type": "paragraph",
        "paragraph": { "rich_text": body_rich_text },
    }));

    if let Some(update_id) = &event.update_id {
        blocks.push(json!({
            "object": "block",
            "type": "paragraph",
            "paragraph": { "rich_text": [ {
                "type": "text",
                "text": { "content": format!("{MARKER_PREFIX}{update_id}") },
                "annotations": { "color": "gray" },
            } ] },
        }));
    }

    blocks
}

/// Splits text into rich-text runs, rendering URLs as inline links.
///
/// Trailing punctuation is not considered part of a URL.
#[must_use]
pub fn rich_text_with_links(text: &str) -> Vec<Value> {
    let mut runs = Vec::new();
    let mut last_end = 0;

    for found in URL_RE.find_iter(text) {
        let url = found.as_str().trim_end_matches(URL_TRAILING_PUNCT);
        let start = found.start();
        let end = start + url.len();

        if start > last_end {
            runs.push(json!({
                "type": "text",
                "text": { "content": &text[last_end..start] },
            }));
        }
        runs.push(json!({
            "type": "text",
            "text": { "content": url, "link": { "url": url } },
        }));
        last_end = end;
    }

    if last_end < text.len() {
        runs.push(json!({
            "type": "text",
            "text": { "content": &text[last_end..] },
        }));
    }

    runs
}

/// Builds the health line shown under the heading.
fn health_paragraph(health: &str) -> Value {
    let color = health_color(health);
    json!({
        "object": "block",
        "type": "paragraph",
        "paragraph": { "rich_text": [ {
            "type": "text",
            "text": { "content": format!("{} {}", health_emoji(health), health_label(health)) },
            "annotations": { "color": color },
        } ] },
    })
}

fn health_emoji(health: &str) -> &'static str {
    match health.to_lowercase().as_str() {
        "ontrack" | "on_track" => "\u{1f7e2}",
        "atrisk" | "at_risk" => "\u{1f7e1}",
        "offtrack" | "off_track" => "\u{1f534}",
        _ => "\u{26aa}",
    }
}

fn health_label(health: &str) -> String {
    match health.to_lowercase().as_str() {
        "ontrack" | "on_track" => "on track".to_string(),
        "atrisk" | "at_risk" => "at risk".to_string(),
        "offtrack" | "off_track" => "off track".to_string(),
        other => other.to_string(),
    }
}

fn health_color(health: &str) -> &'static str {
    match health.to_lowercase().as_str() {
        "ontrack" | "on_track" => "green",
        "atrisk" | "at_risk" => "yellow",
        "offtrack" | "off_track" => "red",
        _ => "gray",
    }
}

/// Whether a block is an idempotency marker paragraph.
///
/// Markers are internal bookkeeping and are excluded when page content is
/// carried into an aggregate.
pub(crate) fn is_marker_block(block: &Value) -> bool {
    block.get("type").and_then(Value::as_str) == Some("paragraph")
        && block_text(block).starts_with(MARKER_PREFIX)
}

/// Finds the block range of a previously appended update.
///
/// The range runs from the divider that starts the update through the
/// `linear-update-id:` marker paragraph, inclusive. Returns the block ids
/// to delete, or `None` when the update is not present (a marker without a
/// matching divider is treated as absent, matching the writer's layout).
fn find_update_range(children: &[Value], update_id: &str) -> Option<Vec<String>> {
    let marker = format!("{MARKER_PREFIX}{update_id}");

    let end_index = children.iter().position(|block| {
        block.get("type").and_then(Value::as_str) == Some("paragraph")
            && block_text(block).contains(&marker)
    })?;

    // Search backwards for the divider immediately preceding this update's
    // heading.
    let start_index = (0..end_index).rev().find(|&i| {
        children[i].get("type").and_then(Value::as_str) == Some("divider")
            && children
                .get(i + 1)
                .and_then(|b| b.get("type"))
                .and_then(Value::as_str)
                == Some("heading_2")
    })?;

    let ids: Vec<String> = children[start_index..=end_index]
        .iter()
        .filter_map(|block| block.get("id").and_then(Value::as_str))
        .map(ToString::to_string)
        .collect();

    Some(ids)
}

/// Concatenated plain text content of a block's rich text, if any.
fn block_text(block: &Value) -> String {
    let Some(kind) = block.get("type").and_then(Value::as_str) else {
        return String::new();
    };

    block
        .get(kind)
        .and_then(|payload| payload.get("rich_text"))
        .and_then(Value::as_array)
        .map(|runs| {
            runs.iter()
                .filter_map(|run| {
                    run.pointer("/text/content")
                        .or_else(|| run.get("plain_text"))
                        .and_then(Value::as_str)
                })
                .collect::<String>()
        })
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::super::mock::MockWorkspace;
    use super::*;

    fn event(action: UpdateAction, update_id: Option<&str>) -> UpdateEvent {
        UpdateEvent {
            action,
            update_id: update_id.map(ToString::to_string),
            team_id: None,
            team_name: Some("Platform".to_string()),
            project_name: "Importer".to_string(),
            project_url: Some("https://linear.app/acme/project/importer".to_string()),
            body: "Shipped the importer".to_string(),
            health: Some("onTrack".to_string()),
            webhook_timestamp_ms: None,
        }
    }

    #[test]
    fn test_block_sequence_order() {
        let blocks = build_update_blocks(&event(UpdateAction::Create, Some("upd-1")));

        let kinds: Vec<&str> = blocks
            .iter()
            .map(|b| b.get("type").and_then(Value::as_str).unwrap())
            .collect();
        assert_eq!(
            kinds,
            vec!["divider", "heading_2", "paragraph", "paragraph", "paragraph"]
        );

        // Heading carries the project name with a link back to the project.
        assert_eq!(
            blocks[1].pointer("/heading_2/rich_text/0/text/content"),
            Some(&json!("Importer"))
        );
        assert_eq!(
            blocks[1].pointer("/heading_2/rich_text/0/text/link/url"),
            Some(&json!("https://linear.app/acme/project/importer"))
        );

        // The marker paragraph closes the sequence.
        assert_eq!(
            blocks[4].pointer("/paragraph/rich_text/0/text/content"),
            Some(&json!("linear-update-id:upd-1"))
        );
    }

    #[test]
    fn test_no_marker_blocks_without_update_id() {
        let blocks = build_update_blocks(&event(UpdateAction::Create, None));
        let kinds: Vec<&str> = blocks
            .iter()
            .map(|b| b.get("type").and_then(Value::as_str).unwrap())
            .collect();
        assert_eq!(kinds, vec!["heading_2", "paragraph", "paragraph"]);
    }

    #[test]
    fn test_rich_text_with_links_splits_urls() {
        let runs = rich_text_with_links("See https://loom.com/v/abc123. More text");

        assert_eq!(runs.len(), 3);
        assert_eq!(
            runs[0].pointer("/text/content"),
            Some(&json!("See "))
        );
        // Trailing period is not part of the link.
        assert_eq!(
            runs[1].pointer("/text/link/url"),
            Some(&json!("https://loom.com/v/abc123"))
        );
        assert_eq!(
            runs[2].pointer("/text/content"),
            Some(&json!(". More text"))
        );
    }

    #[test]
    fn test_rich_text_without_urls_is_single_run() {
        let runs = rich_text_with_links("plain text only");
        assert_eq!(runs.len(), 1);
        assert!(runs[0].pointer("/text/link").is_none());
    }

    #[test]
    fn test_health_rendering() {
        assert_eq!(health_label("onTrack"), "on track");
        assert_eq!(health_label("atRisk"), "at risk");
        assert_eq!(health_label("off_track"), "off track");
        assert_eq!(health_color("offTrack"), "red");
        assert_eq!(health_color("unknown"), "gray");
        assert_eq!(health_emoji("onTrack"), "\u{1f7e2}");
    }

    #[tokio::test]
    async fn test_append_then_duplicate_create_skips() {
        let workspace = MockWorkspace::new();
        let page_id = workspace.seed_page("db", "T Update @2026-08-26", chrono::Utc::now(), vec![]);
        let event = event(UpdateAction::Create, Some("upd-1"));

        let first = append_update(&workspace, &page_id, &event).await.unwrap();
        assert!(matches!(first, AppendOutcome::Appended { blocks: 5 }));
        let writes_after_first = workspace.write_count();

        let second = append_update(&workspace, &page_id, &event).await.unwrap();
        assert_eq!(second, AppendOutcome::SkippedDuplicate);
        assert_eq!(workspace.write_count(), writes_after_first);
    }

    #[tokio::test]
    async fn test_update_action_replaces_prior_blocks() {
        let workspace = MockWorkspace::new();
        // Seed a page holding a prior append of upd-1, with block ids the
        // way the live API returns them.
        let prior = vec![
            json!({ "id": "b0", "type": "divider", "divider": {} }),
            json!({ "id": "b1", "type": "heading_2",
                    "heading_2": { "rich_text": [ { "text": { "content": "Importer" } } ] } }),
            json!({ "id": "b2", "type": "paragraph",
                    "paragraph": { "rich_text": [ { "text": { "content": "old body" } } ] } }),
            json!({ "id": "b3", "type": "paragraph",
                    "paragraph": { "rich_text": [ { "text": { "content": "linear-update-id:upd-1" } } ] } }),
        ];
        let page_id = workspace.seed_page("db", "T Update @2026-08-26", chrono::Utc::now(), prior);

        let mut edited = event(UpdateAction::Update, Some("upd-1"));
        edited.body = "new body".to_string();
        let outcome = append_update(&workspace, &page_id, &edited).await.unwrap();
        assert!(matches!(outcome, AppendOutcome::Appended { .. }));

        let page = workspace.page(&page_id).unwrap();
        // Old blocks deleted, new sequence appended.
        assert!(!page.children.iter().any(|c| block_text(c) == "old body"));
        assert!(page.children.iter().any(|c| block_text(c) == "new body"));
    }

    #[tokio::test]
    async fn test_partial_append_is_distinct() {
        let workspace = MockWorkspace::new();
        let page_id = workspace.seed_page("db", "T", chrono::Utc::now(), vec![]);

        let blocks: Vec<Value> = (0..150)
            .map(|i| json!({ "object": "block", "type": "paragraph",
                "paragraph": { "rich_text": [ { "text": { "content": format!("p{i}") } } ] } }))
            .collect();

        // First chunk lands, second chunk fails.
        workspace.queue_ok();
        workspace.queue_failure(Error::Transient("rate limited".to_string()));

        let err = append_in_chunks(&workspace, &page_id, &blocks).await.unwrap_err();
        assert!(matches!(err, Error::PartialAppend { .. }));
    }

    #[tokio::test]
    async fn test_first_chunk_failure_is_not_partial() {
        let workspace = MockWorkspace::new();
        let page_id = workspace.seed_page("db", "T", chrono::Utc::now(), vec![]);
        workspace.queue_failure(Error::Transient("down".to_string()));

        let blocks = vec![json!({ "object": "block", "type": "paragraph",
            "paragraph": { "rich_text": [] } })];
        let err = append_in_chunks(&workspace, &page_id, &blocks).await.unwrap_err();
        assert!(matches!(err, Error::Transient(_)));
    }

    #[test]
    fn test_marker_without_divider_is_absent() {
        let children = vec![json!({ "id": "b0", "type": "paragraph",
            "paragraph": { "rich_text": [ { "text": { "content": "linear-update-id:upd-9" } } ] } })];
        assert!(find_update_range(&children, "upd-9").is_none());
    }
}
