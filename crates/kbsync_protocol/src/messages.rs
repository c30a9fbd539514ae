//! JSON bodies exchanged with the REST backend.
//!
//! Items, change pages, cursors, metadata and lock status travel as their
//! own types; this module holds the envelopes around them.

use crate::item::Item;
use serde::{Deserialize, Serialize};

/// Response to `PUT /api/items/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutItemResponse {
    /// Revision assigned by the backend.
    pub remote_rev: String,
}

/// Body of `POST /api/items/batch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPutRequest {
    /// Items to store.
    pub items: Vec<Item>,
}

/// Per-item entry in a [`BatchPutResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPutResult {
    /// Item id.
    pub id: String,
    /// Revision assigned on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_rev: Option<String>,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response to `POST /api/items/batch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPutResponse {
    /// True if every item was stored.
    pub success: bool,
    /// One entry per submitted item, in order.
    pub results: Vec<BatchPutResult>,
}

/// Body of `POST /api/sync/lock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
    /// Requesting device.
    pub device_id: String,
    /// Lease length in milliseconds.
    pub timeout: i64,
}

/// Response to `POST /api/sync/lock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockResponse {
    /// Whether the lock is now held by the requester.
    pub acquired: bool,
}

/// Body of `DELETE /api/sync/lock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseLockRequest {
    /// Device releasing the lock.
    pub device_id: String,
}

/// Response to `GET /api/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `"ok"` when healthy.
    pub status: String,
    /// Backend protocol version.
    pub version: String,
}

/// Response to `GET /api/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    /// Stored items, including tombstones.
    pub item_count: usize,
    /// Entries in the change log.
    pub change_count: usize,
    /// Stored resources.
    pub resource_count: usize,
    /// Whether an unexpired lock is held.
    pub locked: bool,
}

/// Error body returned with 4xx/5xx statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable message.
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camel_case_keys() {
        let json = serde_json::to_string(&PutItemResponse {
            remote_rev: "7".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"remoteRev":"7"}"#);

        let json = serde_json::to_string(&LockRequest {
            device_id: "d".into(),
            timeout: 300_000,
        })
        .unwrap();
        assert_eq!(json, r#"{"deviceId":"d","timeout":300000}"#);
    }

    #[test]
    fn batch_result_omits_empty_fields() {
        let ok = BatchPutResult {
            id: "a".into(),
            remote_rev: Some("1".into()),
            error: None,
        };
        assert_eq!(
            serde_json::to_string(&ok).unwrap(),
            r#"{"id":"a","remoteRev":"1"}"#
        );
        let decoded: BatchPutResult = serde_json::from_str(r#"{"id":"b","error":"x"}"#).unwrap();
        assert!(decoded.remote_rev.is_none());
    }
}
