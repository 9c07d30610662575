use crate::snapshot::Domain;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{domain} probe unavailable: {reason}")]
    Unavailable { domain: Domain, reason: String },
    #[error("{domain} probe timed out after {}", humantime::format_duration(*.after))]
    Timeout { domain: Domain, after: Duration },
}

impl ProbeError {
    pub fn unavailable(domain: Domain, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            domain,
            reason: reason.into(),
        }
    }

    pub fn domain(&self) -> Domain {
        match self {
            Self::Unavailable { domain, .. } | Self::Timeout { domain, .. } => *domain,
        }
    }

    /// Stable description of the failure cause, used to log each distinct cause once.
    pub fn cause_key(&self) -> String {
        match self {
            Self::Unavailable { reason, .. } => reason.clone(),
            Self::Timeout { .. } => "timeout".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("settings file {path} is corrupt: {source}")]
    Corrupt {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("failed to write settings file {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to encode settings: {0}")]
    Encode(#[from] serde_yaml::Error),
    #[error("invalid settings: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum DiagnosticError {
    #[error("a diagnostic task is already running")]
    Busy,
    #[error("invalid ping target '{0}'")]
    InvalidTarget(String),
    #[error("disk cleanup is disabled in the service configuration")]
    CleanupDisabled,
    #[error("no cleanup location selected")]
    NothingToClean,
    #[error("diagnostics are shut down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("no samples retained yet")]
    EmptyHistory,
    #[error("report generation failed: {0}")]
    GenerationFailed(String),
}
