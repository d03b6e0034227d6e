use candle_core::{DType, Device, Tensor};
use futures::future::BoxFuture;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::TrainError;

/// Label value marking a position excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainError>;

/// One raw dataset row before collation. `labels` may be absent, in which
/// case collation falls back to language-modeling labels (the inputs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub input_ids: Vec<i64>,
    #[serde(default)]
    pub labels: Option<Vec<i64>>,
}

/// One collated micro-batch. Consumed by a single forward/backward, never
/// retained.
#[derive(Debug)]
pub struct MicroBatch {
    pub input_ids: Tensor,
    pub labels: Tensor,
}

impl MicroBatch {
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            input_ids: self.input_ids.to_device(device)?,
            labels: self.labels.to_device(device)?,
        })
    }

    /// Number of positions that contribute to the loss, under next-token
    /// alignment: labels shifted left by one, ignore-sentinel excluded.
    pub fn target_token_count(&self) -> Result<usize> {
        let dims = self.labels.dims();
        if dims.len() != 2 {
            return Err(TrainError::compute(
                "micro-batch labels must be [batch, seq]",
            ));
        }
        let seq_len = dims[1];
        if seq_len < 2 {
            return Ok(0);
        }
        let shifted = self.labels.narrow(1, 1, seq_len - 1)?;
        let count = shifted
            .ne(IGNORE_INDEX)?
            .to_dtype(DType::U32)?
            .sum_all()?
            .to_vec0::<u32>()?;
        Ok(count as usize)
    }
}

/// Producer of ordered micro-batches. The implementation may pipeline ahead
/// internally; the loop only relies on the blocking-or-pipelined contract.
pub trait MicroBatchSource: Send {
    /// Raw sample count, fed to the step planner.
    fn num_samples(&self) -> usize;

    /// Restarts the source for an epoch, reshuffling deterministically from
    /// `seed`. The same seed reproduces the same order.
    fn begin_epoch(&mut self, seed: u64) -> Result<()>;

    fn next_micro_batch(&mut self) -> BoxFuture<'_, Result<Option<MicroBatch>>>;
}

/// Blocking adapter around an async-friendly source.
pub struct BlockingLoader<S>
where
    S: MicroBatchSource,
{
    inner: S,
}

impl<S> BlockingLoader<S>
where
    S: MicroBatchSource,
{
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn num_samples(&self) -> usize {
        self.inner.num_samples()
    }

    pub fn begin_epoch(&mut self, seed: u64) -> Result<()> {
        self.inner.begin_epoch(seed)
    }

    pub fn next_micro_batch(&mut self) -> Result<Option<MicroBatch>> {
        futures::executor::block_on(self.inner.next_micro_batch())
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

/// Reference source over an in-memory sample set: deterministic shuffle per
/// epoch, right-padded collation, sentinel-padded labels. Wraps around with a
/// derived reshuffle when a planner epoch requests more micro-batches than one
/// pass provides.
pub struct InMemoryLoader {
    samples: Vec<Sample>,
    device: Device,
    micro_batch_size: usize,
    order: Vec<usize>,
    cursor: usize,
    epoch_seed: u64,
    wraps: u64,
}

impl InMemoryLoader {
    pub fn new(samples: Vec<Sample>, micro_batch_size: usize, device: Device) -> Result<Self> {
        if micro_batch_size == 0 {
            return Err(TrainError::config(
                "micro-batch size must be greater than zero",
            ));
        }
        if samples.is_empty() {
            return Err(TrainError::config("sample set is empty"));
        }
        let order = (0..samples.len()).collect();
        Ok(Self {
            samples,
            device,
            micro_batch_size,
            order,
            cursor: 0,
            epoch_seed: 0,
            wraps: 0,
        })
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    fn reshuffle(&mut self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        self.order.shuffle(&mut rng);
        self.cursor = 0;
    }

    fn next_sample_index(&mut self) -> usize {
        if self.cursor >= self.order.len() {
            self.wraps += 1;
            self.reshuffle(self.epoch_seed.wrapping_add(self.wraps));
        }
        let index = self.order[self.cursor];
        self.cursor += 1;
        index
    }

    fn collate(&mut self) -> Result<MicroBatch> {
        let indices: Vec<usize> = (0..self.micro_batch_size)
            .map(|_| self.next_sample_index())
            .collect();

        let max_len = indices
            .iter()
            .map(|&i| self.samples[i].input_ids.len())
            .max()
            .unwrap_or(1)
            .max(1);

        let mut inputs = Vec::with_capacity(self.micro_batch_size * max_len);
        let mut labels = Vec::with_capacity(self.micro_batch_size * max_len);
        for &i in &indices {
            let sample = &self.samples[i];
            let row_labels = sample.labels.as_ref().unwrap_or(&sample.input_ids);
            for pos in 0..max_len {
                inputs.push(sample.input_ids.get(pos).copied().unwrap_or(0));
                labels.push(row_labels.get(pos).copied().unwrap_or(IGNORE_INDEX));
            }
        }

        let shape = (self.micro_batch_size, max_len);
        Ok(MicroBatch {
            input_ids: Tensor::from_vec(inputs, shape, &self.device)?,
            labels: Tensor::from_vec(labels, shape, &self.device)?,
        })
    }
}

impl MicroBatchSource for InMemoryLoader {
    fn num_samples(&self) -> usize {
        self.samples.len()
    }

    fn begin_epoch(&mut self, seed: u64) -> Result<()> {
        self.epoch_seed = seed;
        self.wraps = 0;
        self.reshuffle(seed);
        Ok(())
    }

    fn next_micro_batch(&mut self) -> BoxFuture<'_, Result<Option<MicroBatch>>> {
        Box::pin(async move { self.collate().map(Some) })
    }
}
