use stepwise_core::{Result, SharedParameter, StepwiseError};

use crate::base::BaseOptimizer;
use crate::optimizer_state::OptimizerState;
use crate::optimizer_trait::Optimizer;

/// Drives several optimizers over disjoint parameter partitions as one.
///
/// Used to pair a dense Adam with a SparseAdam for embedding tables. Every
/// call is forwarded to the children in order.
#[derive(Debug)]
pub struct MultipleOptimizer {
    optimizers: Vec<BaseOptimizer>,
}

impl MultipleOptimizer {
    pub fn new(optimizers: Vec<BaseOptimizer>) -> Self {
        MultipleOptimizer { optimizers }
    }

    pub fn optimizers(&self) -> &[BaseOptimizer] {
        &self.optimizers
    }

    pub fn optimizers_mut(&mut self) -> &mut [BaseOptimizer] {
        &mut self.optimizers
    }
}

impl Optimizer for MultipleOptimizer {
    fn step(&mut self) -> Result<()> {
        self.optimizers.iter_mut().try_for_each(|op| op.step())
    }

    fn zero_grad(&mut self) -> Result<()> {
        self.optimizers.iter_mut().try_for_each(|op| op.zero_grad())
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.optimizers
            .iter_mut()
            .for_each(|op| op.set_learning_rate(lr));
    }

    fn learning_rates(&self) -> Vec<f32> {
        self.optimizers
            .iter()
            .flat_map(|op| op.learning_rates())
            .collect()
    }

    fn group_params(&self) -> Vec<Vec<SharedParameter>> {
        self.optimizers
            .iter()
            .flat_map(|op| op.group_params())
            .collect()
    }

    fn state_dict(&self) -> OptimizerState {
        OptimizerState::Multiple {
            children: self.optimizers.iter().map(|op| op.state_dict()).collect(),
        }
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()> {
        let OptimizerState::Multiple { children } = state else {
            return Err(state.kind_mismatch("multiple"));
        };
        if children.len() != self.optimizers.len() {
            return Err(StepwiseError::StateDictMismatch(format!(
                "loaded {} optimizer states for {} optimizers",
                children.len(),
                self.optimizers.len()
            )));
        }
        // Children loaded before a failing one are put back, so a rejected
        // record leaves every child as it was.
        let previous: Vec<OptimizerState> =
            self.optimizers.iter().map(|op| op.state_dict()).collect();
        for (i, child) in children.iter().enumerate() {
            if let Err(e) = self.optimizers[i].load_state_dict(child) {
                for (op, saved) in self.optimizers[..i].iter_mut().zip(&previous) {
                    op.load_state_dict(saved)?;
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adam::{AdamHyperParams, AdamOptimizer};
    use crate::sparse_adam::{SparseAdamHyperParams, SparseAdamOptimizer};
    use crate::test_utils::{param_with_grad, set_sparse_grad, values};
    use stepwise_core::{Parameter, Tensor};

    fn dense_and_sparse() -> (SharedParameter, SharedParameter, MultipleOptimizer) {
        let dense = param_with_grad(vec![1.0, 1.0], vec![2], vec![0.5, 0.5]);
        let embedding = Parameter::new(Tensor::full(&[2, 2], 1.0), "embeddings").shared();
        set_sparse_grad(&embedding, vec![0], vec![0.5, 0.5]);
        let multiple = MultipleOptimizer::new(vec![
            BaseOptimizer::Adam(
                AdamOptimizer::new(vec![dense.clone()], AdamHyperParams::default()).unwrap(),
            ),
            BaseOptimizer::SparseAdam(
                SparseAdamOptimizer::new(vec![embedding.clone()], SparseAdamHyperParams::default())
                    .unwrap(),
            ),
        ]);
        (dense, embedding, multiple)
    }

    #[test]
    fn test_step_reaches_every_child() -> Result<()> {
        let (dense, embedding, mut multiple) = dense_and_sparse();
        multiple.step()?;
        assert!(values(&dense).iter().all(|&v| v < 1.0));
        let emb = values(&embedding);
        assert!(emb[0] < 1.0 && emb[1] < 1.0);
        assert_eq!(&emb[2..], &[1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_group_view_concatenates_children() {
        let (_, _, mut multiple) = dense_and_sparse();
        multiple.set_learning_rate(0.25);
        assert_eq!(multiple.learning_rates(), vec![0.25, 0.25]);
        assert_eq!(multiple.group_params().len(), 2);
    }

    #[test]
    fn test_load_requires_one_record_per_child() -> Result<()> {
        let (_, _, mut multiple) = dense_and_sparse();
        multiple.step()?;
        let saved = multiple.state_dict();
        multiple.load_state_dict(&saved)?;

        let OptimizerState::Multiple { children } = saved else {
            panic!("composite state must be a list");
        };
        let truncated = OptimizerState::Multiple {
            children: children[..1].to_vec(),
        };
        assert!(matches!(
            multiple.load_state_dict(&truncated),
            Err(StepwiseError::StateDictMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn test_failed_load_leaves_every_child_unchanged() -> Result<()> {
        let (_, _, mut multiple) = dense_and_sparse();
        multiple.step()?;
        let OptimizerState::Multiple { children } = multiple.state_dict() else {
            panic!("composite state must be a list");
        };
        multiple.step()?;
        let current = multiple.state_dict();

        // the first record is valid, the second has the wrong kind
        let mixed = OptimizerState::Multiple {
            children: vec![children[0].clone(), children[0].clone()],
        };
        assert!(multiple.load_state_dict(&mixed).is_err());
        assert_eq!(multiple.state_dict(), current);
        Ok(())
    }
}
