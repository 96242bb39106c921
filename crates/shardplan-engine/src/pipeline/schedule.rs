//! One-forward-one-backward (1F1B) micro-batch schedule
//!
//! Stage `s` of `P` first runs `min(P - s - 1, M)` warmup forwards, then
//! alternates one forward with one backward, then drains the remaining
//! backwards. Within one micro-batch the order is always forward through
//! stages `0..P` followed by backward through `P..0`.

use serde::{Deserialize, Serialize};

/// One unit of pipeline work on a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineOp {
    Forward(usize),
    Backward(usize),
}

/// Ordered operations of `stage` for `num_micro` micro-batches
pub fn one_f_one_b(num_stages: usize, stage: usize, num_micro: usize) -> Vec<PipelineOp> {
    let warmup = num_stages
        .saturating_sub(stage + 1)
        .min(num_micro);
    let mut ops = Vec::with_capacity(2 * num_micro);
    let mut next_forward = 0;
    let mut next_backward = 0;

    for _ in 0..warmup {
        ops.push(PipelineOp::Forward(next_forward));
        next_forward += 1;
    }
    while next_forward < num_micro {
        ops.push(PipelineOp::Forward(next_forward));
        next_forward += 1;
        ops.push(PipelineOp::Backward(next_backward));
        next_backward += 1;
    }
    while next_backward < num_micro {
        ops.push(PipelineOp::Backward(next_backward));
        next_backward += 1;
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineOp::*;

    #[test]
    fn test_single_stage_alternates() {
        assert_eq!(
            one_f_one_b(1, 0, 2),
            vec![Forward(0), Backward(0), Forward(1), Backward(1)]
        );
    }

    #[test]
    fn test_first_stage_warms_up() {
        assert_eq!(
            one_f_one_b(2, 0, 3),
            vec![Forward(0), Forward(1), Backward(0), Forward(2), Backward(1), Backward(2)]
        );
        assert_eq!(
            one_f_one_b(2, 1, 3),
            vec![Forward(0), Backward(0), Forward(1), Backward(1), Forward(2), Backward(2)]
        );
    }

    #[test]
    fn test_warmup_capped_by_micro_batches() {
        assert_eq!(one_f_one_b(4, 0, 1), vec![Forward(0), Backward(0)]);
    }

    #[test]
    fn test_every_micro_batch_runs_once_each_way() {
        for stage in 0..4 {
            let ops = one_f_one_b(4, stage, 6);
            assert_eq!(ops.len(), 12);
            for m in 0..6 {
                let f = ops.iter().position(|op| *op == Forward(m)).unwrap();
                let b = ops.iter().position(|op| *op == Backward(m)).unwrap();
                assert!(f < b);
            }
        }
    }
}
