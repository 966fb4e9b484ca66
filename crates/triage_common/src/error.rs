//! Error taxonomy for the triage pipeline.
//!
//! `Backend` and `Timeout` are retryable and handled entirely inside the
//! pipeline (the record lands in `failed`/`timeout` and the sweep picks it
//! up). `Store` and `Config` must stop processing rather than silently skip
//! records.

use crate::record::RecordStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TriageError {
    /// Inference backend unreachable or returned a non-success status.
    #[error("backend error: {0}")]
    Backend(String),

    /// Inference backend exceeded its per-tier deadline.
    #[error("backend timeout: {0}")]
    Timeout(String),

    /// Backend output could not be structured. Normally absorbed into a
    /// degraded result before it reaches a caller.
    #[error("parse error: {0}")]
    Parse(String),

    /// Persistence layer unavailable. Fatal for the in-flight record.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Invalid configuration at startup. Fatal before any worker starts.
    #[error("config error: {0}")]
    Config(String),
}

impl TriageError {
    /// Whether the retry sweep may requeue a record that hit this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TriageError::Backend(_) | TriageError::Timeout(_))
    }

    /// Status a worker stamps on a record when the invocation fails.
    /// None for errors that must abort the worker instead.
    pub fn failure_status(&self) -> Option<RecordStatus> {
        match self {
            TriageError::Timeout(_) => Some(RecordStatus::Timeout),
            TriageError::Backend(_) | TriageError::Parse(_) => Some(RecordStatus::Failed),
            TriageError::Store(_) | TriageError::Config(_) => None,
        }
    }
}
