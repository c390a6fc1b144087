use std::fs;
use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

use log::info;
use rand::rngs::StdRng;
use rand::Rng;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tch::{Device, Tensor};
use tokenizer::{CharVocab, TokenizerError};

use crate::error::{Result, TrainError};

/// Fixed-length (input, target) windows over an encoded text. The target of
/// window `i` is its input shifted one position to the right.
#[derive(Debug, Clone)]
pub struct CharDataset {
    data: Arc<Vec<i64>>,
    block_size: usize,
}

impl CharDataset {
    pub fn new(data: Vec<i64>, block_size: usize) -> Self {
        Self {
            data: Arc::new(data),
            block_size,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Identifies the underlying data; clones share it.
    fn id(&self) -> usize {
        Arc::as_ptr(&self.data) as usize
    }

    /// Number of windows; a window needs `block_size + 1` characters.
    pub fn len(&self) -> usize {
        self.data.len().saturating_sub(self.block_size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Panics if `idx >= self.len()`.
    pub fn window(&self, idx: usize) -> (&[i64], &[i64]) {
        let chunk = &self.data[idx..idx + self.block_size + 1];
        (&chunk[..self.block_size], &chunk[1..])
    }

    /// Stacks the windows at `indices` into `[n, block_size]` input and
    /// target tensors on `device`.
    pub fn collate(&self, indices: &[usize], device: Device) -> (Tensor, Tensor) {
        let mut inputs = Vec::with_capacity(indices.len() * self.block_size);
        let mut targets = Vec::with_capacity(indices.len() * self.block_size);
        for &idx in indices {
            let (x, y) = self.window(idx);
            inputs.extend_from_slice(x);
            targets.extend_from_slice(y);
        }
        self.to_tensors(inputs, targets, indices.len(), device)
    }

    fn to_tensors(
        &self,
        inputs: Vec<i64>,
        targets: Vec<i64>,
        rows: usize,
        device: Device,
    ) -> (Tensor, Tensor) {
        let shape = [rows as i64, self.block_size as i64];
        let input_tensor = Tensor::from_slice(&inputs).view(shape).to(device);
        let target_tensor = Tensor::from_slice(&targets).view(shape).to(device);
        (input_tensor, target_tensor)
    }

    /// Every window exactly once, in order, `batch_size` at a time.
    pub fn sequential_batches(
        &self,
        batch_size: usize,
        device: Device,
    ) -> impl Iterator<Item = (Tensor, Tensor)> + '_ {
        let indices: Vec<usize> = (0..self.len()).collect();
        let batches: Vec<Vec<usize>> = indices
            .chunks(batch_size.max(1))
            .map(<[usize]>::to_vec)
            .collect();
        batches
            .into_iter()
            .map(move |chunk| self.collate(&chunk, device))
    }
}

/// Rows of one batch, flattened: (inputs, targets).
type Rows = (Vec<i64>, Vec<i64>);

fn gather(dataset: &CharDataset, indices: &[usize]) -> Rows {
    let rows: Vec<Rows> = indices
        .par_iter()
        .map(|&idx| {
            let (x, y) = dataset.window(idx);
            (x.to_vec(), y.to_vec())
        })
        .collect();
    let (inputs, targets): (Vec<Vec<i64>>, Vec<Vec<i64>>) = rows.into_iter().unzip();
    (inputs.concat(), targets.concat())
}

fn draw_indices(dataset: &CharDataset, batch_size: usize, rng: &mut StdRng) -> Vec<usize> {
    (0..batch_size)
        .map(|_| rng.gen_range(0..dataset.len()))
        .collect()
}

/// A batch being assembled on the pool.
struct Prefetch {
    source: (usize, usize),
    rows: Receiver<Rows>,
}

/// Draws random training batches. Window indices always come from the
/// caller's RNG on the calling thread, in batch order. With workers, the
/// batch after the one returned is assembled on the pool while the caller
/// trains, so batches do not depend on the worker count.
pub struct BatchLoader {
    pool: Option<ThreadPool>,
    device: Device,
    pending: Option<Prefetch>,
}

impl BatchLoader {
    pub fn new(num_workers: usize, device: Device) -> Result<Self> {
        let pool = if num_workers > 0 {
            Some(
                ThreadPoolBuilder::new()
                    .num_threads(num_workers)
                    .thread_name(|i| format!("batch-loader-{i}"))
                    .build()?,
            )
        } else {
            None
        };
        Ok(Self {
            pool,
            device,
            pending: None,
        })
    }

    /// Samples `batch_size` windows uniformly with replacement.
    pub fn sample(
        &mut self,
        dataset: &CharDataset,
        batch_size: usize,
        rng: &mut StdRng,
    ) -> Result<(Tensor, Tensor)> {
        if dataset.is_empty() {
            return Err(TrainError::Data("cannot sample from an empty dataset".to_string()));
        }

        let pool = match &self.pool {
            Some(pool) => pool,
            None => {
                let indices = draw_indices(dataset, batch_size, rng);
                return Ok(dataset.collate(&indices, self.device));
            }
        };

        let source = (dataset.id(), batch_size);
        let (inputs, targets) = match self.pending.take() {
            Some(prefetch) if prefetch.source == source => prefetch
                .rows
                .recv()
                .map_err(|_| TrainError::Data("a batch loader worker exited".to_string()))?,
            _ => {
                let indices = draw_indices(dataset, batch_size, rng);
                pool.install(|| gather(dataset, &indices))
            }
        };

        let indices = draw_indices(dataset, batch_size, rng);
        let next = dataset.clone();
        let (tx, rx) = mpsc::channel();
        pool.spawn(move || {
            let _ = tx.send(gather(&next, &indices));
        });
        self.pending = Some(Prefetch { source, rows: rx });

        Ok(dataset.to_tensors(inputs, targets, batch_size, self.device))
    }
}

/// A text file split into training and validation datasets over the
/// training split's vocabulary.
#[derive(Debug, Clone)]
pub struct Corpus {
    pub vocab: CharVocab,
    pub train: CharDataset,
    pub val: CharDataset,
}

impl Corpus {
    pub fn from_file<P: AsRef<Path>>(path: P, train_ratio: f64, block_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let corpus = Self::from_text(&text, train_ratio, block_size)?;
        info!(
            "loaded {}: vocab size {}, {} training windows, {} validation windows",
            path.display(),
            corpus.vocab.len(),
            corpus.train.len(),
            corpus.val.len()
        );
        Ok(corpus)
    }

    /// The first `train_ratio` of the characters train; the rest validate.
    pub fn from_text(text: &str, train_ratio: f64, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(TrainError::Config("block_size must be positive".to_string()));
        }
        if !(train_ratio > 0.0 && train_ratio < 1.0) {
            return Err(TrainError::Config(format!(
                "train_ratio must be in (0, 1), got {train_ratio}"
            )));
        }

        let chars: Vec<char> = text.chars().collect();
        let split = (chars.len() as f64 * train_ratio) as usize;
        let train_text: String = chars[..split].iter().collect();
        let val_text: String = chars[split..].iter().collect();

        let vocab = CharVocab::from_text(&train_text);
        let train_ids = vocab.encode(&train_text)?;
        let val_ids = vocab.encode(&val_text).map_err(|err| match err {
            TokenizerError::TokenNotFound(c) => TrainError::Data(format!(
                "validation split contains {c:?}, which never occurs in the training split"
            )),
            other => other.into(),
        })?;

        let train = CharDataset::new(train_ids, block_size);
        let val = CharDataset::new(val_ids, block_size);
        if train.is_empty() {
            return Err(TrainError::Data(format!(
                "training split has {} characters, a window needs {}",
                split,
                block_size + 1
            )));
        }
        if val.is_empty() {
            return Err(TrainError::EmptyValidation);
        }

        Ok(Self { vocab, train, val })
    }

    pub fn block_size(&self) -> usize {
        self.train.block_size()
    }
}
