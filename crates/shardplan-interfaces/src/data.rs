//! Training-loop data boundary

use serde::{Deserialize, Serialize};
use shardplan_types::{Result, ShardplanError};

/// A fixed-shape batch of `(input_ids, labels)` rows, both `[batch_size, seq_len]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub input_ids: Vec<i64>,
    pub labels: Vec<i64>,
    pub batch_size: usize,
    pub seq_len: usize,
}

impl Batch {
    /// Create a batch, checking both tensors have `batch_size * seq_len` elements
    pub fn new(input_ids: Vec<i64>, labels: Vec<i64>, batch_size: usize, seq_len: usize) -> Result<Self> {
        let expected = batch_size * seq_len;
        if input_ids.len() != expected || labels.len() != expected {
            return Err(ShardplanError::execution(format!(
                "batch of shape [{}, {}] needs {} elements, got {} inputs and {} labels",
                batch_size,
                seq_len,
                expected,
                input_ids.len(),
                labels.len()
            )));
        }
        Ok(Self {
            input_ids,
            labels,
            batch_size,
            seq_len,
        })
    }

    /// Copy rows `[start, end)`
    pub fn rows(&self, start: usize, end: usize) -> Result<Self> {
        if start > end || end > self.batch_size {
            return Err(ShardplanError::execution(format!(
                "row range [{}, {}) out of bounds for batch of {}",
                start, end, self.batch_size
            )));
        }
        let (lo, hi) = (start * self.seq_len, end * self.seq_len);
        Ok(Self {
            input_ids: self.input_ids[lo..hi].to_vec(),
            labels: self.labels[lo..hi].to_vec(),
            batch_size: end - start,
            seq_len: self.seq_len,
        })
    }

    /// Number of token positions
    pub fn num_tokens(&self) -> usize {
        self.batch_size * self.seq_len
    }
}

/// Iterator-like source of training batches
pub trait BatchSource: Send {
    /// Next batch, or `None` once the epoch is exhausted
    fn next_batch(&mut self) -> Option<Batch>;

    /// Batches remaining in the current epoch, if known
    fn remaining(&self) -> Option<usize> {
        None
    }
}
