use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stepwise_core::{read_param, Result, StepwiseError, Tensor};

use crate::adadelta::{AdadeltaHyperParams, AdadeltaParamState};
use crate::adafactor::{AdafactorHyperParams, AdafactorParamState};
use crate::adagrad::{AdagradHyperParams, AdagradParamState};
use crate::adam::{AdamHyperParams, AdamParamState};
use crate::bert_adam::{BertAdamHyperParams, BertAdamParamState};
use crate::param_group::{flat_params, HyperParams, ParamGroup};
use crate::sgd::{SgdHyperParams, SgdParamState};
use crate::sparse_adam::{SparseAdamHyperParams, SparseAdamParamState};

/// Saved hyperparameters of one group and the flat indices of its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord<H> {
    pub options: H,
    pub params: Vec<usize>,
}

/// Everything an algorithm needs to resume: its groups and the accumulators
/// of every parameter that has been updated at least once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "H: Serialize, S: Serialize",
    deserialize = "H: serde::de::DeserializeOwned, S: serde::de::DeserializeOwned"
))]
pub struct StateRecord<H, S> {
    pub param_groups: Vec<GroupRecord<H>>,
    #[serde(with = "indexed_entries")]
    pub state: BTreeMap<usize, S>,
}

/// Encodes the state map as `[[index, state], ...]` so the integer keys
/// survive the buffering done for the tagged `OptimizerState` enum.
mod indexed_entries {
    use std::collections::BTreeMap;

    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, T>(map: &BTreeMap<usize, T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<BTreeMap<usize, T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        let entries = Vec::<(usize, T)>::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}

impl<H: HyperParams, S: Clone> StateRecord<H, S> {
    pub(crate) fn capture(groups: &[ParamGroup<H>], state: &BTreeMap<usize, S>) -> Self {
        let mut next = 0;
        let param_groups = groups
            .iter()
            .map(|g| {
                let params = (next..next + g.len()).collect();
                next += g.len();
                GroupRecord {
                    options: g.options.clone(),
                    params,
                }
            })
            .collect();
        StateRecord {
            param_groups,
            state: state.clone(),
        }
    }
}

/// Serialized state of an optimizer, tagged by algorithm.
///
/// A `Multiple` record holds one child record per wrapped optimizer, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerState {
    Sgd(StateRecord<SgdHyperParams, SgdParamState>),
    Adagrad(StateRecord<AdagradHyperParams, AdagradParamState>),
    Adadelta(StateRecord<AdadeltaHyperParams, AdadeltaParamState>),
    Adafactor(StateRecord<AdafactorHyperParams, AdafactorParamState>),
    Adam(StateRecord<AdamHyperParams, AdamParamState>),
    BertAdam(StateRecord<BertAdamHyperParams, BertAdamParamState>),
    SparseAdam(StateRecord<SparseAdamHyperParams, SparseAdamParamState>),
    Multiple { children: Vec<OptimizerState> },
}

impl OptimizerState {
    pub fn kind(&self) -> &'static str {
        match self {
            OptimizerState::Sgd(_) => "sgd",
            OptimizerState::Adagrad(_) => "adagrad",
            OptimizerState::Adadelta(_) => "adadelta",
            OptimizerState::Adafactor(_) => "adafactor",
            OptimizerState::Adam(_) => "adam",
            OptimizerState::BertAdam(_) => "bert_adam",
            OptimizerState::SparseAdam(_) => "sparse_adam",
            OptimizerState::Multiple { .. } => "multiple",
        }
    }

    pub(crate) fn kind_mismatch(&self, expected: &str) -> StepwiseError {
        StepwiseError::StateDictMismatch(format!(
            "expected {} optimizer state, got {}",
            expected,
            self.kind()
        ))
    }
}

/// Per-parameter accumulators that can be checked against a parameter shape
/// before being loaded.
///
/// `options` are the live hyperparameters of the group that owns the
/// parameter; some layouts depend on them.
pub trait ParamState<H> {
    fn check_shape(&self, shape: &[usize], options: &H) -> Result<()>;
}

/// Requires `buffer` to have exactly `shape`.
pub(crate) fn expect_shape(buffer: &Tensor, shape: &[usize], what: &str) -> Result<()> {
    if buffer.shape() != shape {
        return Err(StepwiseError::StateDictMismatch(format!(
            "{} has shape {:?}, parameter has shape {:?}",
            what,
            buffer.shape(),
            shape
        )));
    }
    Ok(())
}

/// Validates `record` against the live groups and returns the accumulators to
/// install. Hyperparameters stored in the record are ignored.
pub(crate) fn load_record<H: HyperParams, S: ParamState<H> + Clone>(
    name: &str,
    groups: &[ParamGroup<H>],
    record: &StateRecord<H, S>,
) -> Result<BTreeMap<usize, S>> {
    if record.param_groups.len() != groups.len() {
        return Err(StepwiseError::StateDictMismatch(format!(
            "{}: loaded state has {} parameter groups, optimizer has {}",
            name,
            record.param_groups.len(),
            groups.len()
        )));
    }
    for (i, (saved, group)) in record.param_groups.iter().zip(groups).enumerate() {
        if saved.params.len() != group.len() {
            return Err(StepwiseError::StateDictMismatch(format!(
                "{}: group {} has {} saved parameters, optimizer has {}",
                name,
                i,
                saved.params.len(),
                group.len()
            )));
        }
    }
    let shapes = flat_params(groups)
        .map(|(_, options, p)| {
            read_param(p, "load_state_dict").map(|p| (p.shape().to_vec(), options))
        })
        .collect::<Result<Vec<_>>>()?;
    for (&index, state) in &record.state {
        let (shape, options) = shapes.get(index).ok_or_else(|| {
            StepwiseError::StateDictMismatch(format!(
                "{}: saved state for parameter {} but only {} parameters exist",
                name,
                index,
                shapes.len()
            ))
        })?;
        state.check_shape(shape, options).map_err(|e| match e {
            StepwiseError::StateDictMismatch(msg) => {
                StepwiseError::StateDictMismatch(format!("{}: parameter {}: {}", name, index, msg))
            }
            other => other,
        })?;
    }
    log::debug!(
        "{}: loaded accumulators for {} of {} parameters",
        name,
        record.state.len(),
        shapes.len()
    );
    Ok(record.state.clone())
}
