//! Data models for annotations
//!
//! Defines the document key, the annotation payload (strokes and text notes)
//! and the per-document record tracked by the local store.
//!
//! The sync engine treats `AnnotationPayload` as an opaque blob: it is
//! serialized and compressed as a whole, never merged field by field.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier of a document's annotation record
///
/// Derived from the document's storage location. Used as the join key across
/// the local store, the remote store and the sync queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentKey(String);

impl DocumentKey {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    /// Key for a document stored on the local filesystem
    pub fn from_path(path: &Path) -> Self {
        Self(format!("file://{}", path.to_string_lossy()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key as a single URL path segment
    pub fn encoded(&self) -> String {
        urlencoding::encode(&self.0).into_owned()
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DocumentKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Drawing tool used for a stroke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Pen,
    Highlight,
}

impl Tool {
    /// Default stroke width for the tool
    pub fn default_width(&self) -> f32 {
        match self {
            Tool::Pen => 3.0,
            Tool::Highlight => 15.0,
        }
    }
}

/// A freehand stroke drawn over a page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stroke {
    pub tool: Tool,
    pub color: String,
    pub stroke_width: f32,
    /// SVG path data
    pub path: String,
}

impl Stroke {
    pub fn new(tool: Tool, color: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            tool,
            color: color.into(),
            stroke_width: tool.default_width(),
            path: path.into(),
        }
    }
}

/// A text note pinned to a position on a page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextAnnotation {
    pub text: String,
    pub x: f32,
    pub y: f32,
    pub color: String,
}

impl TextAnnotation {
    pub fn new(text: impl Into<String>, x: f32, y: f32) -> Self {
        Self {
            text: text.into(),
            x,
            y,
            color: "#000000".to_string(),
        }
    }
}

/// Everything a user has drawn or written on one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationPayload {
    pub drawings: Vec<Stroke>,
    pub texts: Vec<TextAnnotation>,
    /// When the payload was captured by the viewer
    pub timestamp: DateTime<Utc>,
}

impl AnnotationPayload {
    /// Create an empty payload stamped with the current time
    pub fn new() -> Self {
        Self {
            drawings: Vec::new(),
            texts: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_drawing(mut self, stroke: Stroke) -> Self {
        self.drawings.push(stroke);
        self
    }

    pub fn with_text(mut self, text: TextAnnotation) -> Self {
        self.texts.push(text);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.drawings.is_empty() && self.texts.is_empty()
    }
}

impl Default for AnnotationPayload {
    fn default() -> Self {
        Self::new()
    }
}

/// Synchronization state of a local record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSyncState {
    /// Matches the last state acknowledged by the remote
    Clean,
    /// Saved locally, not yet acknowledged by the remote
    PendingPush,
    /// Reserved for multi-writer support; never produced by last-write-wins
    ConflictUnresolved,
}

impl RecordSyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordSyncState::Clean => "clean",
            RecordSyncState::PendingPush => "pending_push",
            RecordSyncState::ConflictUnresolved => "conflict_unresolved",
        }
    }
}

impl fmt::Display for RecordSyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordSyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clean" => Ok(RecordSyncState::Clean),
            "pending_push" => Ok(RecordSyncState::PendingPush),
            "conflict_unresolved" => Ok(RecordSyncState::ConflictUnresolved),
            other => Err(format!("unknown sync state '{}'", other)),
        }
    }
}

/// The local store's view of one document's annotations
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnotationRecord {
    pub document_key: DocumentKey,
    pub payload: AnnotationPayload,
    pub created_at: DateTime<Utc>,
    /// Last local save, strictly increasing per document
    pub local_updated_at: DateTime<Utc>,
    /// Timestamp of the last write the remote acknowledged
    pub remote_updated_at: Option<DateTime<Utc>>,
    pub sync_state: RecordSyncState,
}
