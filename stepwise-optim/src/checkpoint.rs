use serde::{Deserialize, Serialize};
use stepwise_core::{Result, StepwiseError};

use crate::optimizer_state::OptimizerState;
use crate::options::TrainOptions;

/// Saved controller state: both step counters and the algorithm record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    pub training_step: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decay_step: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizer: Option<OptimizerState>,
}

/// Layout written before the controller tracked two counters: a single
/// internal `_step`, counted from 0, next to the algorithm record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyOptimizer {
    #[serde(rename = "_step")]
    pub step: u64,
    #[serde(default)]
    pub optimizer: Option<OptimizerState>,
}

/// The `optim` entry of a checkpoint, in either layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SavedOptimizer {
    Current(ControllerState),
    Legacy(LegacyOptimizer),
}

impl SavedOptimizer {
    /// Converts either layout into the current one.
    ///
    /// A legacy `_step` becomes both counters, plus one.
    pub fn normalize(self) -> ControllerState {
        match self {
            SavedOptimizer::Current(state) => state,
            SavedOptimizer::Legacy(legacy) => {
                log::info!("Converting legacy optimizer checkpoint at step {}", legacy.step);
                ControllerState {
                    training_step: legacy.step + 1,
                    decay_step: Some(legacy.step + 1),
                    optimizer: legacy.optimizer,
                }
            }
        }
    }
}

impl From<ControllerState> for SavedOptimizer {
    fn from(state: ControllerState) -> Self {
        SavedOptimizer::Current(state)
    }
}

/// The part of a training checkpoint this crate reads and writes: the options
/// the run was started with and the optimizer state, if saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub opt: TrainOptions,
    #[serde(default)]
    pub optim: Option<SavedOptimizer>,
}

impl Checkpoint {
    pub fn new(opt: TrainOptions, optim: Option<ControllerState>) -> Self {
        Checkpoint {
            opt,
            optim: optim.map(SavedOptimizer::from),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| StepwiseError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| StepwiseError::Serialization(e.to_string()))
    }
}
