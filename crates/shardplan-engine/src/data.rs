//! Seeded synthetic dataset, batch loader and data-parallel batch sharding

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use shardplan_interfaces::{Batch, BatchSource};
use shardplan_types::{Result, ShardplanError};

/// Fixed-length random token sequences; labels are the inputs shifted by one
#[derive(Debug, Clone)]
pub struct RandomDataset {
    num_samples: usize,
    seq_len: usize,
    vocab_size: usize,
    seed: u64,
}

impl RandomDataset {
    pub fn new(num_samples: usize, seq_len: usize, vocab_size: usize, seed: u64) -> Self {
        Self {
            num_samples,
            seq_len,
            vocab_size: vocab_size.max(1),
            seed,
        }
    }

    pub fn len(&self) -> usize {
        self.num_samples
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples == 0
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// `(input_ids, labels)` of sample `index`, identical on every call
    pub fn sample(&self, index: usize) -> (Vec<i64>, Vec<i64>) {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(index as u64));
        let tokens: Vec<i64> = (0..=self.seq_len)
            .map(|_| rng.gen_range(0..self.vocab_size as i64))
            .collect();
        (tokens[..self.seq_len].to_vec(), tokens[1..].to_vec())
    }
}

/// Batches drawn from a [`RandomDataset`] in (optionally shuffled) order
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: RandomDataset,
    batch_size: usize,
    shuffle_seed: Option<u64>,
    drop_last: bool,
    order: Vec<usize>,
    position: usize,
    epoch: u64,
}

impl DataLoader {
    pub fn new(dataset: RandomDataset, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(ShardplanError::config("batch size must be positive"));
        }
        let order = (0..dataset.len()).collect();
        Ok(Self {
            dataset,
            batch_size,
            shuffle_seed: None,
            drop_last: false,
            order,
            position: 0,
            epoch: 0,
        })
    }

    /// Shuffle sample order each epoch from `seed`
    pub fn shuffle(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self.start_epoch(0);
        self
    }

    /// Skip a trailing partial batch
    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Rewind to the start of `epoch`, reshuffling when enabled
    pub fn start_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
        self.position = 0;
        self.order = (0..self.dataset.len()).collect();
        if let Some(seed) = self.shuffle_seed {
            let mut rng = StdRng::seed_from_u64(seed ^ epoch);
            self.order.shuffle(&mut rng);
        }
    }
}

impl BatchSource for DataLoader {
    fn next_batch(&mut self) -> Option<Batch> {
        let left = self.order.len().saturating_sub(self.position);
        if left == 0 || (self.drop_last && left < self.batch_size) {
            return None;
        }
        let take = left.min(self.batch_size);
        let mut input_ids = Vec::with_capacity(take * self.dataset.seq_len());
        let mut labels = Vec::with_capacity(take * self.dataset.seq_len());
        for &index in &self.order[self.position..self.position + take] {
            let (inputs, targets) = self.dataset.sample(index);
            input_ids.extend(inputs);
            labels.extend(targets);
        }
        self.position += take;
        Batch::new(input_ids, labels, take, self.dataset.seq_len()).ok()
    }

    fn remaining(&self) -> Option<usize> {
        let left = self.order.len().saturating_sub(self.position);
        Some(if self.drop_last {
            left / self.batch_size
        } else {
            (left + self.batch_size - 1) / self.batch_size
        })
    }
}

/// Rows of `batch` owned by data-parallel rank `index` of `parts`
pub fn shard_batch(batch: &Batch, index: usize, parts: usize) -> Result<Batch> {
    if parts == 0 || index >= parts {
        return Err(ShardplanError::config(format!(
            "invalid data-parallel shard {} of {}",
            index, parts
        )));
    }
    if batch.batch_size % parts != 0 {
        return Err(ShardplanError::config(format!(
            "batch of {} rows cannot be split across {} data-parallel ranks",
            batch.batch_size, parts
        )));
    }
    let rows = batch.batch_size / parts;
    batch.rows(index * rows, (index + 1) * rows)
}
