use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stage::Stage;

/// The external capability a client call was made against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Search,
    Generation,
    Redaction,
    Delivery,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Search => "search",
            Capability::Generation => "generation",
            Capability::Redaction => "redaction",
            Capability::Delivery => "delivery",
        };
        f.write_str(name)
    }
}

/// Failure reported by a capability client.
#[derive(Debug, Clone, Error)]
pub enum CapabilityError {
    #[error("{capability} request failed: {message}")]
    Request {
        capability: Capability,
        message: String,
    },

    #[error("{capability} returned an unusable response: {message}")]
    InvalidResponse {
        capability: Capability,
        message: String,
    },

    #[error("{0} capability is not configured")]
    NotConfigured(Capability),
}

impl CapabilityError {
    pub fn request(capability: Capability, message: impl Into<String>) -> Self {
        Self::Request {
            capability,
            message: message.into(),
        }
    }

    pub fn invalid(capability: Capability, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            capability,
            message: message.into(),
        }
    }

    pub fn capability(&self) -> Capability {
        match self {
            Self::Request { capability, .. } | Self::InvalidResponse { capability, .. } => {
                *capability
            }
            Self::NotConfigured(capability) => *capability,
        }
    }
}

/// Taxonomy tag carried on the wire for every reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    CapabilityError,
    PartialFailure,
    PipelineFailed,
}

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("Feature extraction failed: {cause}")]
    ExtractionFailed { cause: String },

    #[error("Analysis of article {article_id} failed: {cause}")]
    AnalysisFailed { article_id: String, cause: String },

    #[error("Final synthesis failed: {cause}")]
    SynthesisFailed { cause: String },

    #[error("Pipeline failed while {stage}: {cause}")]
    PipelineFailed { stage: Stage, cause: String },
}

impl PipelineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::Capability(_) => ErrorKind::CapabilityError,
            Self::AnalysisFailed { .. } => ErrorKind::PartialFailure,
            Self::ExtractionFailed { .. }
            | Self::SynthesisFailed { .. }
            | Self::PipelineFailed { .. } => ErrorKind::PipelineFailed,
        }
    }

    /// Wraps a stage-level error into the terminal `PipelineFailed` form.
    pub fn at_stage(self, stage: Stage) -> Self {
        match self {
            Self::PipelineFailed { .. } | Self::Validation(_) => self,
            other => Self::PipelineFailed {
                stage,
                cause: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
