//! Persisted and wire-level data models for the listener engine.
//!
//! All persisted types serialize with camelCase keys to match the document
//! store schema consumed by the rest of the platform: listener registrations
//! live in their own collection, and target documents carry a
//! `metadata.listeners.<listenerId>` processing record per listener.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Change kinds a listener can react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
}

/// Predicate restricting which change events qualify for a listener.
///
/// An empty filter matches every event. `updated_fields` qualifies an event
/// when any touched field path equals or sits under one of the listed
/// prefixes; `equals` matches dotted paths in the full document against
/// expected values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<Map<String, Value>>,
}

impl ChangeFilter {
    /// Whether this filter matches the given change event.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if let Some(prefixes) = &self.updated_fields {
            // Inserts carry no update description; only updates can qualify
            // on touched fields.
            let touched = event.updated_fields.iter().any(|field| {
                prefixes
                    .iter()
                    .any(|p| field == p || field.starts_with(&format!("{p}.")))
            });
            if event.operation_type == OperationType::Update && !touched {
                return false;
            }
        }
        if let Some(expected) = &self.equals {
            let Some(doc) = &event.full_document else {
                return false;
            };
            for (path, want) in expected {
                if path_value(doc, path) != Some(want) {
                    return false;
                }
            }
        }
        true
    }
}

/// Ownership of a listener by a specific running instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// Opaque instance identifier, generated at process start.
    pub owner_id: String,
    /// Refreshed on a fixed interval while owned.
    pub last_heartbeat: DateTime<Utc>,
}

impl Lease {
    /// A lease is live only while its heartbeat is younger than the
    /// staleness threshold; once stale any instance may reclaim it.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let age = now.signed_duration_since(self.last_heartbeat);
        age.num_milliseconds() > threshold.as_millis() as i64
    }

    /// Whether the lease is currently held by `owner_id`.
    pub fn is_held_by(&self, owner_id: &str) -> bool {
        self.owner_id == owner_id
    }
}

/// Open attribute bag on a listener: tenant scope, expected object type, and
/// listener-specific parameters forwarded to dispatched jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerMetadata {
    /// Tenant/workspace this listener belongs to.
    pub workspace_id: String,
    /// Logical object type this listener expects; `None` means untyped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    /// Mapped object type aliases this listener also accepts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mapped_object_types: Vec<String>,
    /// Wildcard flag: accept any object type.
    #[serde(default)]
    pub any_object_type: bool,
    /// Listener-specific parameters (rate limits, field lists) passed through
    /// to dispatched jobs.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl ListenerMetadata {
    /// Type applicability per the dispatch contract: the listener applies if
    /// the document's object type equals the configured one, appears in the
    /// mapped alias list, or the wildcard flag is set. A listener with no
    /// configured type accepts everything.
    pub fn accepts_object_type(&self, doc_type: Option<&str>) -> bool {
        if self.any_object_type {
            return true;
        }
        let Some(expected) = self.object_type.as_deref() else {
            return true;
        };
        match doc_type {
            Some(t) => t == expected || self.mapped_object_types.iter().any(|m| m == t),
            None => false,
        }
    }
}

/// Per-listener processing status on a target document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Complete,
}

/// Per-listener processing record stored at
/// `metadata.listeners.<listenerId>` on a target document.
///
/// Written as a field-level merge. `lastRun` and `jobId` are skipped when
/// `None` and leave the stored entry untouched; `status`, `error`, and
/// `lastError` always serialize, so each marker overwrites stale values with
/// explicit nulls instead of letting a failed attempt's error outlive a later
/// success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerRun {
    /// `complete` once a job was dispatched; absent/null while pending or
    /// after a failed submission.
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub last_error: Option<DateTime<Utc>>,
}

impl ListenerRun {
    /// In-progress marker written before job submission. Clears the error
    /// fields left by a previous failed attempt.
    pub fn started(now: DateTime<Utc>) -> Self {
        Self {
            status: None,
            last_run: Some(now),
            ..Default::default()
        }
    }

    /// Completion record written after a successful submission. A complete
    /// entry never keeps an error from an earlier attempt.
    pub fn completed(job_id: Uuid) -> Self {
        Self {
            status: Some(RunStatus::Complete),
            job_id: Some(job_id),
            ..Default::default()
        }
    }

    /// Failure record written after a failed submission; status stays
    /// non-complete so reconciliation revisits the document.
    pub fn failed(error: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            status: None,
            error: Some(error.into()),
            last_error: Some(now),
            ..Default::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == Some(RunStatus::Complete)
    }
}

/// A persistent watch registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub id: Uuid,
    /// Name of the collection to watch.
    pub collection: String,
    /// Change kinds to react to.
    #[serde(rename = "operationType")]
    pub operation_types: Vec<OperationType>,
    /// Predicate restricting which changes qualify.
    #[serde(default)]
    pub filter: ChangeFilter,
    /// Background job type dispatched on a qualifying change.
    pub job_name: String,
    /// Inactive listeners are neither leased nor watched.
    pub is_active: bool,
    pub metadata: ListenerMetadata,
    /// Absent or stale means unowned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
}

impl Listener {
    /// Whether this listener is currently owned by a live lease.
    pub fn has_live_lease(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|l| !l.is_stale(now, threshold))
    }

    /// Fail fast on contract violations at registration time rather than at
    /// watch time.
    pub fn validate(&self) -> Result<()> {
        if self.collection.trim().is_empty() {
            return Err(Error::InvalidListener(format!(
                "listener {} has no target collection",
                self.id
            )));
        }
        if self.job_name.trim().is_empty() {
            return Err(Error::InvalidListener(format!(
                "listener {} has no job name",
                self.id
            )));
        }
        if self.operation_types.is_empty() {
            return Err(Error::InvalidListener(format!(
                "listener {} reacts to no operation types",
                self.id
            )));
        }
        Ok(())
    }
}

/// A single change-feed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub operation_type: OperationType,
    pub collection: String,
    /// Internal identifier of the changed document.
    pub document_id: Uuid,
    /// Present for inserts/updates/replaces; absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Value>,
    /// Dotted field paths touched by an update; empty for other operations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updated_fields: Vec<String>,
}

impl ChangeEvent {
    /// Whether every touched field sits under the `metadata` namespace.
    ///
    /// Such events originate from this subsystem's own bookkeeping writes and
    /// must never re-trigger dispatch (feedback loop).
    pub fn is_metadata_only(&self) -> bool {
        !self.updated_fields.is_empty()
            && self
                .updated_fields
                .iter()
                .all(|f| f == "metadata" || f.starts_with("metadata."))
    }
}

/// A change to the listener registry itself.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Created(Listener),
    Updated(Listener),
    Deleted(Uuid),
}

/// Look up a dotted path inside a JSON document.
pub fn path_value<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// The document's `metadata.objectType`, if any.
pub fn doc_object_type(doc: &Value) -> Option<&str> {
    path_value(doc, "metadata.objectType").and_then(Value::as_str)
}

/// Parse the per-listener processing record off a document, if present.
pub fn doc_listener_run(doc: &Value, listener_id: Uuid) -> Option<ListenerRun> {
    let entry = path_value(doc, "metadata.listeners")?.get(listener_id.to_string())?;
    serde_json::from_value(entry.clone()).ok()
}

/// The document's internal identifier.
pub fn doc_id(doc: &Value) -> Option<Uuid> {
    doc.get("_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn listener_meta(object_type: Option<&str>, mapped: &[&str], any: bool) -> ListenerMetadata {
        ListenerMetadata {
            workspace_id: "ws-1".to_string(),
            object_type: object_type.map(String::from),
            mapped_object_types: mapped.iter().map(|s| s.to_string()).collect(),
            any_object_type: any,
            params: Map::new(),
        }
    }

    #[test]
    fn test_type_matching_exact_and_mapped() {
        let meta = listener_meta(Some("people"), &["contacts"], false);
        assert!(meta.accepts_object_type(Some("people")));
        assert!(meta.accepts_object_type(Some("contacts")));
        assert!(!meta.accepts_object_type(Some("deals")));
        assert!(!meta.accepts_object_type(None));
    }

    #[test]
    fn test_type_matching_wildcard_accepts_everything() {
        let meta = listener_meta(Some("people"), &[], true);
        assert!(meta.accepts_object_type(Some("deals")));
        assert!(meta.accepts_object_type(None));
    }

    #[test]
    fn test_type_matching_untyped_listener_accepts_everything() {
        let meta = listener_meta(None, &[], false);
        assert!(meta.accepts_object_type(Some("anything")));
        assert!(meta.accepts_object_type(None));
    }

    #[test]
    fn test_lease_staleness() {
        let lease = Lease {
            owner_id: "a".to_string(),
            last_heartbeat: Utc::now() - chrono::Duration::seconds(31),
        };
        assert!(lease.is_stale(Utc::now(), Duration::from_secs(30)));

        let fresh = Lease {
            owner_id: "a".to_string(),
            last_heartbeat: Utc::now(),
        };
        assert!(!fresh.is_stale(Utc::now(), Duration::from_secs(30)));
    }

    #[test]
    fn test_metadata_only_change_detection() {
        let event = ChangeEvent {
            operation_type: OperationType::Update,
            collection: "widgets".to_string(),
            document_id: Uuid::new_v4(),
            full_document: None,
            updated_fields: vec![
                "metadata.listeners.abc".to_string(),
                "metadata.objectType".to_string(),
            ],
        };
        assert!(event.is_metadata_only());

        let mixed = ChangeEvent {
            updated_fields: vec!["metadata.listeners.abc".to_string(), "name".to_string()],
            ..event.clone()
        };
        assert!(!mixed.is_metadata_only());

        // Inserts touch no fields and are never metadata-only.
        let insert = ChangeEvent {
            operation_type: OperationType::Insert,
            updated_fields: vec![],
            ..event
        };
        assert!(!insert.is_metadata_only());
    }

    #[test]
    fn test_metadata_prefix_does_not_match_lookalike_field() {
        let event = ChangeEvent {
            operation_type: OperationType::Update,
            collection: "widgets".to_string(),
            document_id: Uuid::new_v4(),
            full_document: None,
            updated_fields: vec!["metadataX".to_string()],
        };
        assert!(!event.is_metadata_only());
    }

    #[test]
    fn test_change_filter_updated_fields() {
        let filter = ChangeFilter {
            updated_fields: Some(vec!["status".to_string()]),
            equals: None,
        };
        let base = ChangeEvent {
            operation_type: OperationType::Update,
            collection: "widgets".to_string(),
            document_id: Uuid::new_v4(),
            full_document: None,
            updated_fields: vec!["status.stage".to_string()],
        };
        assert!(filter.matches(&base));

        let miss = ChangeEvent {
            updated_fields: vec!["name".to_string()],
            ..base.clone()
        };
        assert!(!filter.matches(&miss));

        // Inserts are not constrained by updated-field filters.
        let insert = ChangeEvent {
            operation_type: OperationType::Insert,
            updated_fields: vec![],
            ..base
        };
        assert!(filter.matches(&insert));
    }

    #[test]
    fn test_change_filter_equals() {
        let mut expected = Map::new();
        expected.insert("metadata.objectType".to_string(), json!("widget"));
        let filter = ChangeFilter {
            updated_fields: None,
            equals: Some(expected),
        };

        let event = ChangeEvent {
            operation_type: OperationType::Insert,
            collection: "widgets".to_string(),
            document_id: Uuid::new_v4(),
            full_document: Some(json!({"metadata": {"objectType": "widget"}})),
            updated_fields: vec![],
        };
        assert!(filter.matches(&event));

        let other = ChangeEvent {
            full_document: Some(json!({"metadata": {"objectType": "gadget"}})),
            ..event
        };
        assert!(!filter.matches(&other));
    }

    #[test]
    fn test_listener_validate() {
        let listener = Listener {
            id: Uuid::new_v4(),
            collection: "widgets".to_string(),
            operation_types: vec![OperationType::Insert],
            filter: ChangeFilter::default(),
            job_name: "widget-sync".to_string(),
            is_active: true,
            metadata: listener_meta(Some("widget"), &[], false),
            lease: None,
        };
        assert!(listener.validate().is_ok());

        let no_collection = Listener {
            collection: "  ".to_string(),
            ..listener.clone()
        };
        assert!(matches!(
            no_collection.validate(),
            Err(Error::InvalidListener(_))
        ));

        let no_ops = Listener {
            operation_types: vec![],
            ..listener
        };
        assert!(no_ops.validate().is_err());
    }

    #[test]
    fn test_listener_wire_schema() {
        let listener = Listener {
            id: Uuid::nil(),
            collection: "widgets".to_string(),
            operation_types: vec![OperationType::Insert, OperationType::Update],
            filter: ChangeFilter::default(),
            job_name: "widget-sync".to_string(),
            is_active: true,
            metadata: listener_meta(Some("widget"), &[], false),
            lease: Some(Lease {
                owner_id: "instance-1".to_string(),
                last_heartbeat: Utc::now(),
            }),
        };

        let value = serde_json::to_value(&listener).unwrap();
        assert_eq!(value["operationType"], json!(["insert", "update"]));
        assert_eq!(value["jobName"], json!("widget-sync"));
        assert_eq!(value["isActive"], json!(true));
        assert_eq!(value["lease"]["ownerId"], json!("instance-1"));
        assert_eq!(value["metadata"]["workspaceId"], json!("ws-1"));

        let round: Listener = serde_json::from_value(value).unwrap();
        assert_eq!(round, listener);
    }

    #[test]
    fn test_listener_run_wire_schema() {
        let run = ListenerRun::completed(Uuid::nil());
        let value = serde_json::to_value(&run).unwrap();
        assert_eq!(value["status"], json!("complete"));
        assert_eq!(value["jobId"], json!(Uuid::nil().to_string()));
        assert!(value.get("lastRun").is_none());
        // Explicit nulls, so a merge overwrites an earlier attempt's error.
        assert_eq!(value["error"], Value::Null);
        assert_eq!(value["lastError"], Value::Null);

        // Absent status deserializes as pending.
        let pending: ListenerRun = serde_json::from_value(json!({})).unwrap();
        assert!(!pending.is_complete());

        let null_status: ListenerRun =
            serde_json::from_value(json!({"status": null, "error": "boom"})).unwrap();
        assert!(!null_status.is_complete());
        assert_eq!(null_status.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_doc_helpers() {
        let id = Uuid::new_v4();
        let listener_id = Uuid::new_v4();
        let doc = json!({
            "_id": id.to_string(),
            "name": "Ada",
            "metadata": {
                "objectType": "people",
                "listeners": {
                    (listener_id.to_string()): {"status": "complete"}
                }
            }
        });

        assert_eq!(doc_id(&doc), Some(id));
        assert_eq!(doc_object_type(&doc), Some("people"));
        assert!(doc_listener_run(&doc, listener_id).unwrap().is_complete());
        assert!(doc_listener_run(&doc, Uuid::new_v4()).is_none());
    }
}
