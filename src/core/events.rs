// src/core/events.rs

//! Names and payload shapes of the events pushed by the surveillance hub.
//!
//! The channel itself treats payloads as opaque JSON and routes them by name;
//! the typed views below exist for consumers that want to decode them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString, IntoStaticStr};

/// The push events the dashboard listens to, with their hub method names.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display, EnumIter, EnumString, IntoStaticStr,
)]
pub enum HubEvent {
    /// A critical broadcast shown globally with sound.
    #[strum(serialize = "ReceiveUrgentAlert")]
    UrgentAlert,
    /// A new sighting location for a subject.
    #[strum(serialize = "ReceiveLocation")]
    NewLocation,
    /// A submitted report moved to a new processing status.
    #[strum(serialize = "ReportStatusChanged")]
    ReportStatusChanged,
}

impl HubEvent {
    /// The hub method name this event arrives under.
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

/// Decodes a raw event payload into a typed view.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(payload: &Value) -> serde_json::Result<T> {
    T::deserialize(payload)
}

/// A reported sighting of a subject, as pushed on `ReceiveLocation`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sighting {
    pub id: i64,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub reported_by: String,
    /// Kept as sent; the hub does not always include a UTC offset.
    pub timestamp: String,
    /// Older hub builds call this field `wantedPersonId`.
    #[serde(alias = "wantedPersonId")]
    pub subject_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
}

/// Processing status of a submitted report.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(try_from = "StatusRepr", into = "u8")]
pub enum ReportStatus {
    Pending,
    Completed,
    Failed,
}

impl ReportStatus {
    /// Whether the status is final, i.e. the report will not change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReportStatus::Completed | ReportStatus::Failed)
    }
}

/// The hub sends the status as its numeric code; some tools send the name.
#[derive(Deserialize)]
#[serde(untagged)]
enum StatusRepr {
    Code(u8),
    Name(String),
}

impl TryFrom<StatusRepr> for ReportStatus {
    type Error = String;

    fn try_from(repr: StatusRepr) -> Result<Self, Self::Error> {
        match repr {
            StatusRepr::Code(0) => Ok(ReportStatus::Pending),
            StatusRepr::Code(1) => Ok(ReportStatus::Completed),
            StatusRepr::Code(2) => Ok(ReportStatus::Failed),
            StatusRepr::Code(other) => Err(format!("unknown report status code {other}")),
            StatusRepr::Name(name) => match name.to_ascii_lowercase().as_str() {
                "pending" => Ok(ReportStatus::Pending),
                "completed" => Ok(ReportStatus::Completed),
                "failed" => Ok(ReportStatus::Failed),
                _ => Err(format!("unknown report status '{name}'")),
            },
        }
    }
}

impl From<ReportStatus> for u8 {
    fn from(status: ReportStatus) -> Self {
        match status {
            ReportStatus::Pending => 0,
            ReportStatus::Completed => 1,
            ReportStatus::Failed => 2,
        }
    }
}

/// Payload of `ReportStatusChanged`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReportStatusUpdate {
    pub report_id: i64,
    pub status: ReportStatus,
}
