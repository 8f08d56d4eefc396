//! End-to-end pipeline tests: signed webhook in, daily document out, and a
//! rollup over the accumulated documents.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use secrecy::SecretString;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use syncpulse::rollup::JobOutcome;
use syncpulse::signature::compute_signature;
use syncpulse::{
    EventHandler, HandlerResult, PageRef, Result, RollupRunner, RollupSettings, TeamDirectory,
    Workspace,
};

const SECRET: &str = "pipeline-secret";

struct FixedDirectory;

impl TeamDirectory for FixedDirectory {
    async fn team_name(&self, team_id: &str) -> Result<String> {
        Ok(match team_id {
            "team-platform" => "Platform".to_string(),
            other => format!("Team {other}"),
        })
    }
}

#[derive(Clone)]
struct Page {
    id: String,
    database_id: String,
    title: String,
    created_time: DateTime<Utc>,
    children: Vec<Value>,
    week_ending: Option<NaiveDate>,
}

/// Minimal in-memory workspace for exercising the public API surface.
#[derive(Default)]
struct MemoryWorkspace {
    pages: Mutex<Vec<Page>>,
}

impl MemoryWorkspace {
    fn page_by_title(&self, title: &str) -> Option<Page> {
        self.pages
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.title == title)
            .cloned()
    }

    fn pages_in(&self, database_id: &str) -> Vec<Page> {
        self.pages
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.database_id == database_id)
            .cloned()
            .collect()
    }

    fn seed(&self, database_id: &str, title: &str, created_time: DateTime<Utc>, children: Vec<Value>) {
        let mut pages = self.pages.lock().unwrap();
        let id = format!("page-{}", pages.len());
        pages.push(Page {
            id,
            database_id: database_id.to_string(),
            title: title.to_string(),
            created_time,
            children,
            week_ending: None,
        });
    }
}

impl Workspace for MemoryWorkspace {
    async fn find_pages_by_title(&self, database_id: &str, title: &str) -> Result<Vec<PageRef>> {
        let mut refs: Vec<PageRef> = self
            .pages
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.database_id == database_id && p.title == title)
            .map(|p| PageRef {
                id: p.id.clone(),
                title: p.title.clone(),
                created_time: p.created_time,
            })
            .collect();
        refs.sort_by_key(|p| p.created_time);
        Ok(refs)
    }

    async fn create_page(
        &self,
        database_id: &str,
        title: &str,
        week_ending: Option<NaiveDate>,
    ) -> Result<String> {
        let mut pages = self.pages.lock().unwrap();
        let id = format!("page-{}", pages.len());
        pages.push(Page {
            id: id.clone(),
            database_id: database_id.to_string(),
            title: title.to_string(),
            created_time: Utc::now(),
            children: Vec::new(),
            week_ending,
        });
        Ok(id)
    }

    async fn set_week_ending(&self, page_id: &str, week_ending: NaiveDate) -> Result<()> {
        let mut pages = self.pages.lock().unwrap();
        if let Some(page) = pages.iter_mut().find(|p| p.id == page_id) {
            page.week_ending = Some(week_ending);
        }
        Ok(())
    }

    async fn append_children(&self, page_id: &str, blocks: &[Value]) -> Result<()> {
        let mut pages = self.pages.lock().unwrap();
        let page = pages
            .iter_mut()
            .find(|p| p.id == page_id)
            .ok_or_else(|| syncpulse::Error::Fatal(format!("no page {page_id}")))?;
        page.children.extend(blocks.iter().cloned());
        Ok(())
    }

    async fn list_children(&self, page_id: &str) -> Result<Vec<Value>> {
        Ok(self
            .pages
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.id == page_id)
            .map(|p| p.children.clone())
            .unwrap_or_default())
    }

    async fn delete_block(&self, block_id: &str) -> Result<()> {
        let mut pages = self.pages.lock().unwrap();
        for page in pages.iter_mut() {
            page.children
                .retain(|c| c.get("id").and_then(Value::as_str) != Some(block_id));
        }
        Ok(())
    }

    async fn pages_created_between(
        &self,
        database_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PageRef>> {
        let mut refs: Vec<PageRef> = self
            .pages
            .lock()
            .unwrap()
            .iter()
            .filter(|p| {
                p.database_id == database_id && p.created_time >= start && p.created_time <= end
            })
            .map(|p| PageRef {
                id: p.id.clone(),
                title: p.title.clone(),
                created_time: p.created_time,
            })
            .collect();
        refs.sort_by_key(|p| p.created_time);
        Ok(refs)
    }

    async fn database_reachable(&self, _database_id: &str) -> Result<()> {
        Ok(())
    }
}

fn handler(
    workspace: &Arc<MemoryWorkspace>,
) -> EventHandler<FixedDirectory, MemoryWorkspace> {
    EventHandler::new(
        Arc::new(FixedDirectory),
        Arc::clone(workspace),
        "db-daily".to_string(),
        SecretString::from(SECRET.to_string()),
    )
}

fn update_event(update_id: &str, project: &str, body: &str) -> Vec<u8> {
    json!({
        "action": "create",
        "type": "ProjectUpdate",
        "webhookTimestamp": Utc::now().timestamp_millis(),
        "data": {
            "id": update_id,
            "body": body,
            "health": "onTrack",
            "project": {
                "name": project,
                "url": format!("https://linear.app/acme/project/{project}"),
                "teams": { "nodes": [ { "name": "Platform" } ] }
            }
        }
    })
    .to_string()
    .into_bytes()
}

async fn deliver(
    handler: &EventHandler<FixedDirectory, MemoryWorkspace>,
    payload: &[u8],
) -> HandlerResult {
    let signature = compute_signature(SECRET, payload);
    handler.handle(payload, Some(&signature)).await
}

#[tokio::test]
async fn webhook_creates_daily_document_and_appends() {
    let workspace = Arc::new(MemoryWorkspace::default());
    let handler = handler(&workspace);

    let result = deliver(&handler, &update_event("upd-1", "Importer", "Shipped")).await;
    assert_eq!(result, HandlerResult::Success);

    let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
    let page = workspace
        .page_by_title(&format!("Platform Update @{today}"))
        .expect("daily document should exist");
    assert_eq!(page.database_id, "db-daily");
    // Week-ending property points at the upcoming (or current) Friday.
    let week_ending = page.week_ending.expect("week ending should be set");
    assert_eq!(week_ending.format("%u").to_string(), "5");

    // A second update for the same team lands on the same page.
    let result = deliver(&handler, &update_event("upd-2", "Billing", "Started")).await;
    assert_eq!(result, HandlerResult::Success);

    let pages = workspace.pages_in("db-daily");
    assert_eq!(pages.len(), 1);

    let headings: Vec<&str> = pages[0]
        .children
        .iter()
        .filter_map(|c| c.pointer("/heading_2/rich_text/0/text/content"))
        .filter_map(Value::as_str)
        .collect();
    assert_eq!(headings, vec!["Importer", "Billing"]);
}

#[tokio::test]
async fn duplicate_delivery_is_idempotent() {
    let workspace = Arc::new(MemoryWorkspace::default());
    let handler = handler(&workspace);
    let payload = update_event("upd-1", "Importer", "Shipped");

    assert_eq!(deliver(&handler, &payload).await, HandlerResult::Success);
    let blocks_after_first = workspace.pages_in("db-daily")[0].children.len();

    assert_eq!(deliver(&handler, &payload).await, HandlerResult::Success);
    assert_eq!(
        workspace.pages_in("db-daily")[0].children.len(),
        blocks_after_first
    );
}

#[tokio::test]
async fn tampered_payload_is_rejected() {
    let workspace = Arc::new(MemoryWorkspace::default());
    let handler = handler(&workspace);

    let payload = update_event("upd-1", "Importer", "Shipped");
    let signature = compute_signature(SECRET, &payload);
    let mut tampered = payload.clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;

    let result = handler.handle(&tampered, Some(&signature)).await;
    assert_eq!(result, HandlerResult::Unauthorized);
    assert!(workspace.pages_in("db-daily").is_empty());
}

#[tokio::test]
async fn rollup_aggregates_window_into_destination() {
    let workspace = Arc::new(MemoryWorkspace::default());
    let now = Utc.with_ymd_and_hms(2026, 8, 28, 15, 0, 0).unwrap();

    workspace.seed(
        "db-daily",
        "Platform Update @2026-08-25",
        now - chrono::Duration::days(3),
        vec![json!({ "id": "b1", "type": "paragraph",
            "paragraph": { "rich_text": [ { "text": { "content": "Tuesday news" } } ] } })],
    );
    workspace.seed(
        "db-daily",
        "Web Update @2026-08-27",
        now - chrono::Duration::days(1),
        vec![json!({ "id": "b2", "type": "paragraph",
            "paragraph": { "rich_text": [ { "text": { "content": "Thursday news" } } ] } })],
    );
    workspace.seed(
        "db-daily",
        "Stale Update @2026-08-10",
        now - chrono::Duration::days(18),
        vec![json!({ "id": "b3", "type": "paragraph",
            "paragraph": { "rich_text": [ { "text": { "content": "old" } } ] } })],
    );

    let runner = RollupRunner::new(
        Arc::clone(&workspace),
        "db-daily".to_string(),
        "db-weekly".to_string(),
        RollupSettings::default(),
    );

    let outcome = runner.run(now).await;
    let JobOutcome::Succeeded { aggregated, .. } = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(aggregated, 2);

    let weekly = workspace.pages_in("db-weekly");
    assert_eq!(weekly.len(), 1);
    assert_eq!(weekly[0].title, "Weekly Rollup 2026-08-21 to 2026-08-28");

    let texts: Vec<&str> = weekly[0]
        .children
        .iter()
        .filter_map(|c| {
            c.pointer("/paragraph/rich_text/0/text/content")
                .or_else(|| c.pointer("/heading_1/rich_text/0/text/content"))
        })
        .filter_map(Value::as_str)
        .collect();
    assert_eq!(
        texts,
        vec![
            "Platform Update @2026-08-25",
            "Tuesday news",
            "Web Update @2026-08-27",
            "Thursday news",
        ]
    );
    assert!(!texts.contains(&"old"));
}
