//! # Queue Items
//!
//! Durable unit of deferred work held by the [`OfflineQueue`](crate::OfflineQueue).
//!
//! ## State Machine
//!
//! ```text
//! Pending --(fail, retries < max)--> Pending
//! Pending --(fail, retries == max)--> Failed   (terminal)
//! Pending --(success)--> removed from the queue
//! ```
//!
//! Operations are a tagged union: each kind carries its own payload type, and
//! hosts that hand over JSON go through [`QueueOperation::from_json`], which
//! turns shape errors into validation errors.

use crate::error::{QueueError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

/// Unique identifier for a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueItemId(Uuid);

impl QueueItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an item ID from a string
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid UUID
    pub fn from_string(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| QueueError::InvalidItemId(e.to_string()))
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for QueueItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueueItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Discriminant of a [`QueueOperation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    RecordingUpload,
    ServerSwitch,
    LanguageChange,
    SettingsUpdate,
    ConnectivityTest,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RecordingUpload => "recording_upload",
            Self::ServerSwitch => "server_switch",
            Self::LanguageChange => "language_change",
            Self::SettingsUpdate => "settings_update",
            Self::ConnectivityTest => "connectivity_test",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "recording_upload" => Ok(Self::RecordingUpload),
            "server_switch" => Ok(Self::ServerSwitch),
            "language_change" => Ok(Self::LanguageChange),
            "settings_update" => Ok(Self::SettingsUpdate),
            "connectivity_test" => Ok(Self::ConnectivityTest),
            _ => Err(QueueError::Validation(format!(
                "unknown operation kind '{}'",
                s
            ))),
        }
    }
}

/// Where a recording was captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingContext {
    PatientVisit,
    Handover,
    CareConference,
    FreeNote,
}

/// Interface languages the app ships
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Ja,
    En,
}

impl Language {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Ja => "ja",
            Self::En => "en",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingUpload {
    pub recording_id: String,
    /// Host-side reference to the captured audio
    pub audio_uri: String,
    pub duration_secs: f64,
    pub recorded_at: DateTime<Utc>,
    pub context: RecordingContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_ref: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSwitchRequest {
    pub from_server_id: String,
    pub to_server_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageChange {
    pub language: Language,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    pub key: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityTest {
    pub server_id: String,
}

/// Deferred operation with its kind-specific payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum QueueOperation {
    RecordingUpload(RecordingUpload),
    ServerSwitch(ServerSwitchRequest),
    LanguageChange(LanguageChange),
    SettingsUpdate(SettingsUpdate),
    ConnectivityTest(ConnectivityTest),
}

impl QueueOperation {
    /// Build an operation from a kind name and JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Validation`] for unknown kinds, payloads of the
    /// wrong shape, unknown enum variants or values that fail [`validate`](Self::validate).
    pub fn from_json(kind: &str, payload: serde_json::Value) -> Result<Self> {
        let kind: OperationKind = kind.parse()?;

        let tagged = serde_json::json!({ "kind": kind.as_str(), "payload": payload });
        let operation: Self = serde_json::from_value(tagged).map_err(|e| {
            QueueError::Validation(format!("invalid {} payload: {}", kind, e))
        })?;

        operation.validate()?;
        Ok(operation)
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Self::RecordingUpload(_) => OperationKind::RecordingUpload,
            Self::ServerSwitch(_) => OperationKind::ServerSwitch,
            Self::LanguageChange(_) => OperationKind::LanguageChange,
            Self::SettingsUpdate(_) => OperationKind::SettingsUpdate,
            Self::ConnectivityTest(_) => OperationKind::ConnectivityTest,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::RecordingUpload(upload) => {
                require_non_empty("recordingId", &upload.recording_id)?;
                require_non_empty("audioUri", &upload.audio_uri)?;
                if !upload.duration_secs.is_finite() || upload.duration_secs <= 0.0 {
                    return Err(QueueError::Validation(format!(
                        "recording duration must be positive, got {}",
                        upload.duration_secs
                    )));
                }
            }
            Self::ServerSwitch(switch) => {
                require_non_empty("fromServerId", &switch.from_server_id)?;
                require_non_empty("toServerId", &switch.to_server_id)?;
                if switch.from_server_id == switch.to_server_id {
                    return Err(QueueError::Validation(format!(
                        "server switch from '{}' to itself",
                        switch.from_server_id
                    )));
                }
            }
            Self::LanguageChange(_) => {}
            Self::SettingsUpdate(update) => require_non_empty("key", &update.key)?,
            Self::ConnectivityTest(test) => require_non_empty("serverId", &test.server_id)?,
        }
        Ok(())
    }

    /// Identity used to collapse logically identical pending operations
    pub fn dedup_key(&self) -> String {
        match self {
            Self::RecordingUpload(upload) => format!("recording_upload:{}", upload.recording_id),
            Self::ServerSwitch(switch) => format!(
                "server_switch:{}->{}",
                switch.from_server_id, switch.to_server_id
            ),
            Self::LanguageChange(change) => format!("language_change:{}", change.language.code()),
            Self::SettingsUpdate(update) => format!("settings_update:{}", update.key),
            Self::ConnectivityTest(test) => format!("connectivity_test:{}", test.server_id),
        }
    }

    /// When the underlying event happened, if the payload records it
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::RecordingUpload(upload) => Some(upload.recorded_at),
            _ => None,
        }
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(QueueError::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

// ============================================================================
// Queue Item
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    /// Waiting for (another) processing attempt
    Pending,
    /// Retry limit reached; never processed again
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: QueueItemId,
    pub operation: QueueOperation,
    pub created_at: DateTime<Utc>,
    /// Insertion order, breaks `created_at` ties
    pub sequence: u64,
    pub status: QueueItemStatus,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub dedup_key: String,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    pub(crate) fn new(operation: QueueOperation, now: DateTime<Utc>, sequence: u64) -> Self {
        Self {
            id: QueueItemId::new(),
            created_at: operation.occurred_at().unwrap_or(now),
            dedup_key: operation.dedup_key(),
            operation,
            sequence,
            status: QueueItemStatus::Pending,
            retry_count: 0,
            last_error: None,
            updated_at: now,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    pub fn is_pending(&self) -> bool {
        self.status == QueueItemStatus::Pending
    }

    pub fn is_failed(&self) -> bool {
        self.status == QueueItemStatus::Failed
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    /// Evaluated against `now` on every call; never stored
    pub fn is_urgent(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.age(now) > window
    }

    /// Chronological processing order
    pub(crate) fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.sequence)
    }

    /// Record a failed attempt.
    ///
    /// Returns `true` when the item has now reached the retry limit.
    pub(crate) fn record_failure(
        &mut self,
        error: String,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> bool {
        if self.retry_count < max_retries {
            self.retry_count += 1;
        }
        self.last_error = Some(error);
        self.updated_at = now;

        if self.retry_count >= max_retries {
            self.status = QueueItemStatus::Failed;
        }
        self.is_failed()
    }
}
