use serde::{Deserialize, Serialize};

/// Index of an exhibit in the configured catalog. Stable for the lifetime
/// of the config; used to key queues, caches and stream envelopes.
pub type ExhibitId = usize;

/// One smoothed progress reading for an in-flight clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
  pub progress: f64,
  pub message: String,
}

/// Items a sync worker pushes onto its exhibit queue. Exactly one of
/// `Finished`/`Error` is emitted per job, always last.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
  Waiting { message: String },
  Progress(ProgressUpdate),
  /// Raw output line from the update path (fetch/fast-forward), without a
  /// usable fraction.
  Output { line: String },
  Finished,
  Error { message: String, detail: String },
}

impl ProgressEvent {
  pub fn is_terminal(&self) -> bool {
    matches!(self, ProgressEvent::Finished | ProgressEvent::Error { .. })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
  Waiting,
  Progress,
  Syncing,
  Finished,
  Error,
}

/// Wire envelope for the SSE stream. `progress` events carry the update as
/// a JSON object in `output`; `syncing` carries a raw line; `error` carries
/// the short message plus the formatted error chain in `output`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
  pub phase: Phase,
  pub exhibit_id: ExhibitId,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub output: Option<serde_json::Value>,
}

/// Client-facing exhibit description. Allow-list only: the git URL and any
/// credentials configured for the exhibit are never serialized here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExhibitView {
  pub id: ExhibitId,
  pub title: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub homepage: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub icon: Option<String>,
  pub local_path: String,
  pub is_cloned: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub last_updated: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub updates_available: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExhibitsResponse {
  pub exhibits: Vec<ExhibitView>,
  #[serde(rename = "apiVersion")]
  pub api_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
  pub exhibit_id: ExhibitId,
  #[serde(default)]
  pub branch: Option<String>,
  #[serde(default)]
  pub depth: Option<u32>,
}
