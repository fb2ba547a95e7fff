//! Core domain types for Folio ingestion jobs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Page number given to files whose name yields no usable digits.
pub const UNPARSEABLE_PAGE: u32 = 9999;

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for ingestion job identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new time-sortable job identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Discovered files
// ---------------------------------------------------------------------------

/// One entry returned by a file source listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Identifier the download stage understands (path, remote id, ...).
    pub id: String,
    /// Display name, used for page-number inference.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl SourceFile {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            mime_type: None,
            size_bytes: None,
        }
    }

    /// Whether the name ends in one of `extensions` (lowercase, with dot).
    pub fn has_extension(&self, extensions: &[String]) -> bool {
        let lower = self.name.to_lowercase();
        extensions.iter().any(|ext| lower.ends_with(ext.as_str()))
    }
}

/// Naming scheme a file name was recognized as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilenameFormat {
    /// `name001 3.png`: group index plus in-group position.
    Grouped,
    /// `12.png`
    Numeric,
    /// `page_12.png`, `p12.png`, `scan-12.png`
    Prefixed,
    /// `ch2_p5.png`
    Named,
    /// `anything 12.png`
    Sequential,
    /// Some digit run was picked heuristically, or none found.
    Unknown,
}

impl std::fmt::Display for FilenameFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Grouped => "grouped",
            Self::Numeric => "numeric",
            Self::Prefixed => "prefixed",
            Self::Named => "named",
            Self::Sequential => "sequential",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A discovered page file with its inferred position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageFile {
    pub file_id: String,
    pub file_name: String,
    pub page_number: u32,
    /// Parse confidence in `[0, 1]`.
    pub confidence: f64,
    pub format: FilenameFormat,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

// ---------------------------------------------------------------------------
// Error records
// ---------------------------------------------------------------------------

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    RateLimit,
    FileAccess,
    StorageService,
    OcrProcessing,
    Persistence,
    Validation,
    Authentication,
    ResourceExhaustion,
    ModelConfiguration,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::RateLimit => "rate_limit",
            Self::FileAccess => "file_access",
            Self::StorageService => "storage_service",
            Self::OcrProcessing => "ocr_processing",
            Self::Persistence => "persistence",
            Self::Validation => "validation",
            Self::Authentication => "authentication",
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::ModelConfiguration => "model_configuration",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How bad a failure is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Structured record of one caught failure. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingError {
    /// Error variant name (`NetworkError`, `OcrError`, ...).
    pub error_kind: String,
    pub message: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Error source chain, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_chain: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
    pub retry_count: u32,
    pub recoverable: bool,
}
