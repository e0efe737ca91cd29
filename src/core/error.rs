use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::video::frame::Region;

/// 致命错误：任务以 Failed 结束
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to open source video: {0}")]
    SourceOpen(String),
    #[error("No codec could open a video writer (tried: {tried})")]
    SinkCreate { tried: String },
    #[error("Video sink write failed: {0}")]
    SinkWrite(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Worker pool error: {0}")]
    WorkerPool(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("Processing cancelled by stop request")]
    Cancelled,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::SourceOpen(_) => ErrorKind::SourceOpen,
            PipelineError::SinkCreate { .. } => ErrorKind::SinkCreate,
            PipelineError::SinkWrite(_) | PipelineError::Io(_) => ErrorKind::Io,
            PipelineError::WorkerPool(_) => ErrorKind::Internal,
            PipelineError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            PipelineError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// 上报给任务边界的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    SourceOpen,
    SinkCreate,
    Io,
    Internal,
    InvalidConfig,
    Cancelled,
}

/// 任务失败记录，序列化友好
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub error_type: ErrorKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(error_type: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }
}

impl From<&PipelineError> for JobFailure {
    fn from(err: &PipelineError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {}", self.error_type, self.message)
    }
}

#[derive(Debug, Error)]
#[error("Region detection failed: {0}")]
pub struct RegionDetectionError(pub String);

#[derive(Debug, Error)]
#[error("Region encoding failed: {0}")]
pub struct EncodeError(pub String);

#[derive(Debug, Error, PartialEq)]
pub enum CensorApplyError {
    #[error("Region {region:?} has no area inside a {width}x{height} frame")]
    DegenerateRegion {
        region: Region,
        width: u32,
        height: u32,
    },
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Failed to run media tool: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{tool} exited with {status:?}: {stderr}")]
    Failed {
        tool: &'static str,
        status: Option<i32>,
        stderr: String,
    },
    #[error("Probe output is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unusable probe output: {0}")]
    Probe(String),
    #[error("Encoder not available: {0}")]
    EncoderUnavailable(String),
    #[error("No such media: {0:?}")]
    NotFound(PathBuf),
}

#[derive(Debug, Error)]
pub enum RemuxError {
    #[error("Remux tool error: {0}")]
    Media(#[from] MediaError),
    #[error("Remux IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field}: {reason}")]
    OutOfRange { field: &'static str, reason: String },
    #[error("Config JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
