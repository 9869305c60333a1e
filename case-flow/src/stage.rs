use std::fmt;

use serde::{Deserialize, Serialize};

/// A step of the case-analysis pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Redacting,
    Extracting,
    Retrieving,
    Synthesizing,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Redacting => "redacting",
            Stage::Extracting => "extracting",
            Stage::Retrieving => "retrieving",
            Stage::Synthesizing => "synthesizing",
        }
    }

    /// The stage that follows this one on the success path.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Received => Some(Stage::Redacting),
            Stage::Redacting => Some(Stage::Extracting),
            Stage::Extracting => Some(Stage::Retrieving),
            Stage::Retrieving => Some(Stage::Synthesizing),
            Stage::Synthesizing => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request state machine of the orchestrator.
///
/// `Completed` and `Failed` are terminal; once either is reached every further
/// transition is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Active(Stage),
    Completed,
    Failed(Stage),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid pipeline transition from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: PipelineState,
    pub to: PipelineState,
}

impl PipelineState {
    pub fn new() -> Self {
        PipelineState::Active(Stage::Received)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PipelineState::Active(_))
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineState::Active(stage) | PipelineState::Failed(stage) => Some(*stage),
            PipelineState::Completed => None,
        }
    }

    /// Moves to the next stage on the success path, or to `Completed` after synthesis.
    pub fn advance(&mut self) -> Result<PipelineState, InvalidTransition> {
        let to = match self {
            PipelineState::Active(stage) => match stage.next() {
                Some(next) => PipelineState::Active(next),
                None => PipelineState::Completed,
            },
            _ => {
                return Err(InvalidTransition {
                    from: *self,
                    to: *self,
                });
            }
        };
        *self = to;
        Ok(to)
    }

    /// Fails the request at its current stage.
    pub fn fail(&mut self) -> Result<PipelineState, InvalidTransition> {
        match self {
            PipelineState::Active(stage) => {
                let to = PipelineState::Failed(*stage);
                *self = to;
                Ok(to)
            }
            _ => Err(InvalidTransition {
                from: *self,
                to: PipelineState::Failed(self.stage().unwrap_or(Stage::Received)),
            }),
        }
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}
