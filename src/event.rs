//! Inbound webhook payload schema.
//!
//! Payload parsing is a strict classification step: every raw body becomes
//! one of three tagged variants before it can reach business logic. Only
//! `ParsedEvent::Update` carries data onward; unrecognized and malformed
//! payloads are expected traffic and never errors.
//!
//! Linear delivers project updates in two shapes, with the update fields
//! either nested under `data.projectUpdate` or flat on `data`. Team
//! information may be embedded (`project.teams.nodes`, `project.team`) or
//! only referenced by id, in which case the handler resolves it through the
//! upstream client.

use serde::Deserialize;
use serde_json::Value;

/// Webhook event type recognized by the relay.
pub const PROJECT_UPDATE_TYPE: &str = "ProjectUpdate";

/// Action carried by a recognized project update event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    /// A new update was posted.
    Create,
    /// An existing update was edited.
    Update,
}

impl UpdateAction {
    fn parse(action: &str) -> Option<Self> {
        match action {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            _ => None,
        }
    }
}

/// A recognized project update event, extracted from a webhook payload.
///
/// Transient: lives for the duration of one request.
#[derive(Debug, Clone)]
pub struct UpdateEvent {
    /// Whether this is a new update or an edit of an existing one.
    pub action: UpdateAction,
    /// Upstream update identifier, used for idempotent appends.
    pub update_id: Option<String>,
    /// Team identifier for metadata lookup when no name is embedded.
    pub team_id: Option<String>,
    /// Team display name(s), when embedded in the payload.
    pub team_name: Option<String>,
    /// Project display name.
    pub project_name: String,
    /// Link back to the project in the upstream service.
    pub project_url: Option<String>,
    /// Update body text.
    pub body: String,
    /// Update health (`onTrack`, `atRisk`, `offTrack`).
    pub health: Option<String>,
    /// Delivery timestamp in epoch milliseconds, for replay detection.
    pub webhook_timestamp_ms: Option<i64>,
}

/// Result of classifying a raw webhook body.
#[derive(Debug)]
pub enum ParsedEvent {
    /// A recognized project update event.
    Update(UpdateEvent),
    /// A well-formed payload for an event type or action the relay ignores.
    Unrecognized {
        /// The payload's `type` and `action`, for logging.
        kind: String,
    },
    /// A body that is not valid JSON or lacks the envelope fields.
    Malformed {
        /// Why classification failed, for logging.
        reason: String,
    },
}

/// Webhook envelope, common to all event types.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    action: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(rename = "webhookTimestamp")]
    webhook_timestamp: Option<i64>,
}

impl ParsedEvent {
    /// Classifies a raw webhook body.
    ///
    /// Never errors: malformed input yields [`ParsedEvent::Malformed`].
    #[must_use]
    pub fn from_slice(raw: &[u8]) -> Self {
        let envelope: Envelope = match serde_json::from_slice(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                return Self::Malformed {
                    reason: format!("invalid JSON: {e}"),
                };
            },
        };

        let Some(kind) = envelope.kind else {
            return Self::Malformed {
                reason: "missing 'type' field".to_string(),
            };
        };

        if kind != PROJECT_UPDATE_TYPE {
            return Self::Unrecognized { kind };
        }

        let Some(action) = envelope
            .action
            .as_deref()
            .and_then(UpdateAction::parse)
        else {
            return Self::Unrecognized {
                kind: format!(
                    "{kind}/{}",
                    envelope.action.as_deref().unwrap_or("<none>")
                ),
            };
        };

        // The update fields are either nested under data.projectUpdate or
        // flat on data itself.
        let data = &envelope.data;
        let update = data.get("projectUpdate").unwrap_or(data);
        if !update.is_object() {
            return Self::Malformed {
                reason: "'data' is not an object".to_string(),
            };
        }

        let project = update.get("project").filter(|p| p.is_object());

        Self::Update(UpdateEvent {
            action,
            update_id: string_field(update, "id").or_else(|| string_field(update, "slugId")),
            team_id: team_id_of(update, project),
            team_name: team_name_of(update, project),
            project_name: project
                .and_then(|p| string_field(p, "name"))
                .unwrap_or_else(|| "Unknown Project".to_string()),
            project_url: project
                .and_then(|p| string_field(p, "url").or_else(|| string_field(p, "webUrl")))
                .or_else(|| string_field(update, "url")),
            body: string_field(update, "body").unwrap_or_default(),
            health: string_field(update, "health"),
            webhook_timestamp_ms: envelope.webhook_timestamp,
        })
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Extracts embedded team name(s), joining multiple teams with `" & "`.
fn team_name_of(update: &Value, project: Option<&Value>) -> Option<String> {
    if let Some(project) = project {
        let names: Vec<String> = project
            .get("teams")
            .and_then(|t| t.get("nodes"))
            .and_then(Value::as_array)
            .map(|nodes| nodes.iter().filter_map(|n| string_field(n, "name")).collect())
            .unwrap_or_default();
        if !names.is_empty() {
            return Some(names.join(" & "));
        }

        if let Some(name) = project.get("team").and_then(|t| string_field(t, "name")) {
            return Some(name);
        }
    }

    update.get("team").and_then(|t| string_field(t, "name"))
}

/// Extracts a team id for the upstream lookup fallback.
fn team_id_of(update: &Value, project: Option<&Value>) -> Option<String> {
    project
        .and_then(|p| string_field(p, "teamId"))
        .or_else(|| string_field(update, "teamId"))
        .or_else(|| {
            // `team` may be a bare id string rather than an object.
            update
                .get("team")
                .or_else(|| project.and_then(|p| p.get("team")))
                .and_then(Value::as_str)
                .map(ToString::to_string)
        })
}
