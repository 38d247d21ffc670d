//! Parallel, bounded production of training batches.
//!
//! A dispatcher thread walks the dataset (shuffled per pass when training) and hands
//! image indices to a pool of workers. Each worker owns its RNG and buffers, runs
//! load → augment → encode, and pushes finished samples into a bounded channel, so
//! producers block once `max_queue_size` batches worth of samples are waiting. The
//! consumer restores dispatch order before assembling batches; the dispatcher never
//! runs more than [`BatchGenerator::max_in_flight`] samples ahead of it, so the
//! reorder buffer stays bounded too.

use std::{
    collections::BTreeMap,
    panic::{catch_unwind, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{bounded, Receiver, Sender};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tracing::instrument;

use crate::{
    annotation::{list_images, load_sample, DEFAULT_IGNORE_MARKERS},
    augment::{augment, AugmentOptions},
    encoder::{encode_sample, EncoderOptions},
    error::{Error, Result},
    result::{Batch, SampleStats, TrainingSample},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Shuffled, augmented and endless.
    Train,
    /// Dataset order, resize only, one pass per call to [`BatchGenerator::batches`].
    Validation,
}

pub struct GeneratorBuilder {
    data_path: PathBuf,
    input_size: u32,
    batch_size: usize,
    workers: usize,
    max_queue_size: usize,
    mode: Mode,
    seed: u64,
    quiet: bool,
    augment: Option<AugmentOptions>,
    encoder: EncoderOptions,
    ignore_markers: Vec<String>,
}

impl GeneratorBuilder {
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            input_size: 512,
            batch_size: 16,
            workers: 4,
            max_queue_size: 10,
            mode: Mode::Train,
            seed: 0,
            quiet: true,
            augment: None,
            encoder: EncoderOptions::default(),
            ignore_markers: DEFAULT_IGNORE_MARKERS.iter().map(|it| it.to_string()).collect(),
        }
    }

    pub fn input_size(mut self, input_size: u32) -> Self {
        self.input_size = input_size;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Queue depth in batches.
    pub fn max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Demotes per-sample warnings to debug messages. Skip counts are still reported.
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Overrides the mode's default augmentation. `input_size` always wins over the
    /// value stored in `options`.
    pub fn augment_options(mut self, options: AugmentOptions) -> Self {
        self.augment = Some(options);
        self
    }

    pub fn encoder_options(mut self, options: EncoderOptions) -> Self {
        self.encoder = options;
        self
    }

    pub fn ignore_markers(mut self, markers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ignore_markers = markers.into_iter().map(Into::into).collect();
        self
    }

    #[instrument(skip(self), fields(data_path = %self.data_path.display()))]
    pub fn build(self) -> Result<BatchGenerator> {
        if self.batch_size == 0 || self.workers == 0 || self.max_queue_size == 0 {
            return Err(Error::InvalidConfig(
                "batch size, workers and queue size must be positive".into(),
            ));
        }
        let stride = self.encoder.stride.max(1);
        if self.input_size == 0 || self.input_size % stride != 0 {
            return Err(Error::InvalidConfig(format!(
                "input size {} is not a positive multiple of the stride {stride}",
                self.input_size
            )));
        }
        if !self.data_path.is_dir() {
            return Err(Error::InvalidConfig(format!(
                "{} is not a directory",
                self.data_path.display()
            )));
        }
        let images = list_images(&self.data_path)?;
        if images.is_empty() {
            return Err(Error::EmptyDataset(self.data_path));
        }

        let mut augment = self.augment.unwrap_or_else(|| match self.mode {
            Mode::Train => AugmentOptions::default(),
            Mode::Validation => AugmentOptions::resize_only(self.input_size),
        });
        augment.input_size = self.input_size;

        log::info!(
            "Found {} images in {} ({:?} mode)",
            images.len(),
            self.data_path.display(),
            self.mode
        );

        Ok(BatchGenerator {
            images: Arc::new(images),
            context: Arc::new(WorkerContext {
                augment,
                encoder: self.encoder,
                ignore_markers: self.ignore_markers,
                quiet: self.quiet,
                counters: Counters::default(),
            }),
            batch_size: self.batch_size,
            workers: self.workers,
            max_queue_size: self.max_queue_size,
            mode: self.mode,
            seed: self.seed,
            runs: AtomicU64::new(0),
        })
    }
}

#[derive(Default)]
struct Counters {
    encoded: AtomicUsize,
    missing_annotation: AtomicUsize,
    unreadable: AtomicUsize,
    failed: AtomicUsize,
}

/// Read-only state shared by every worker.
struct WorkerContext {
    augment: AugmentOptions,
    encoder: EncoderOptions,
    ignore_markers: Vec<String>,
    quiet: bool,
    counters: Counters,
}

impl WorkerContext {
    /// Level for per-sample diagnostics.
    fn diagnostic_level(&self) -> log::Level {
        if self.quiet {
            log::Level::Debug
        } else {
            log::Level::Warn
        }
    }

    fn report(&self, message: std::fmt::Arguments) {
        log::log!(self.diagnostic_level(), "{message}");
    }

    #[instrument(level = "debug", skip(self, rng))]
    fn process(&self, path: &Path, rng: &mut StdRng) -> Option<TrainingSample> {
        let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<TrainingSample> {
            let sample = load_sample(path, &self.ignore_markers, self.diagnostic_level())?;
            let augmented = augment(sample, &self.augment, rng);
            Ok(encode_sample(
                &augmented,
                &self.encoder,
                &self.augment.normalization,
            ))
        }));

        let counters = &self.counters;
        match outcome {
            Ok(Ok(sample)) => {
                counters.encoded.fetch_add(1, Ordering::Relaxed);
                Some(sample)
            }
            Ok(Err(err @ Error::MissingAnnotation(_))) => {
                counters.missing_annotation.fetch_add(1, Ordering::Relaxed);
                self.report(format_args!("Skipping sample: {err}"));
                None
            }
            Ok(Err(err @ (Error::Image(_) | Error::Io(_)))) => {
                counters.unreadable.fetch_add(1, Ordering::Relaxed);
                self.report(format_args!("Skipping {}: {err}", path.display()));
                None
            }
            Ok(Err(err)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                self.report(format_args!("Skipping {}: {err}", path.display()));
                None
            }
            Err(_) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                self.report(format_args!("Encoding {} panicked", path.display()));
                None
            }
        }
    }
}

pub struct BatchGenerator {
    images: Arc<Vec<PathBuf>>,
    context: Arc<WorkerContext>,
    batch_size: usize,
    workers: usize,
    max_queue_size: usize,
    mode: Mode,
    seed: u64,
    runs: AtomicU64,
}

impl BatchGenerator {
    pub fn image_paths(&self) -> &[PathBuf] {
        &self.images
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// `ceil(len / batch_size)`: batches in one validation pass.
    pub fn batches_per_pass(&self) -> usize {
        self.images.len().div_ceil(self.batch_size)
    }

    /// Totals over every iterator this generator has spawned.
    pub fn stats(&self) -> SampleStats {
        let counters = &self.context.counters;
        SampleStats {
            encoded: counters.encoded.load(Ordering::Relaxed),
            missing_annotation: counters.missing_annotation.load(Ordering::Relaxed),
            unreadable: counters.unreadable.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Most samples that can be dispatched but not yet handed out by [`Batches`]:
    /// the queue plus one sample in progress per worker.
    pub fn max_in_flight(&self) -> usize {
        self.max_queue_size * self.batch_size + self.workers
    }

    /// Starts the worker pool. In training mode the iterator never ends on its own; in
    /// validation mode it ends after one pass and a new call starts the next one.
    pub fn batches(&self) -> Batches {
        let run = self.runs.fetch_add(1, Ordering::Relaxed);
        let run_seed = self.seed ^ run.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let (job_tx, job_rx) = bounded::<Job>(self.workers * 2);
        let (sample_tx, sample_rx) = bounded::<Processed>(self.max_queue_size * self.batch_size);
        let window = self.max_in_flight();
        let (slot_tx, slot_rx) = bounded::<()>(window);
        for _ in 0..window {
            let _ = slot_tx.try_send(());
        }

        let mut handles = Vec::with_capacity(self.workers + 1);
        let len = self.images.len();
        let mode = self.mode;
        handles.push(thread::spawn(move || {
            dispatch(job_tx, slot_rx, len, mode, run_seed)
        }));

        for worker in 0..self.workers {
            let jobs = job_rx.clone();
            let samples = sample_tx.clone();
            let images = self.images.clone();
            let context = self.context.clone();
            let seed = worker_seed(run_seed, worker);
            handles.push(thread::spawn(move || {
                work(jobs, samples, images, context, seed)
            }));
        }

        Batches {
            receiver: Some(sample_rx),
            slots: Some(slot_tx),
            handles,
            pending: BTreeMap::new(),
            next_seq: 0,
            batch_size: self.batch_size,
            dataset_len: len,
            consecutive_failures: 0,
            pass: PassTally::default(),
        }
    }
}

struct Job {
    seq: u64,
    pass: u64,
    index: usize,
}

struct Processed {
    seq: u64,
    pass: u64,
    sample: Option<TrainingSample>,
}

fn worker_seed(run_seed: u64, worker: usize) -> u64 {
    run_seed.wrapping_add((worker as u64 + 1).wrapping_mul(0xD1B5_4A32_D192_ED03))
}

/// Sends every index once per pass. Each job consumes one slot; [`Batches`] returns a
/// slot whenever it hands a sample out.
fn dispatch(jobs: Sender<Job>, slots: Receiver<()>, len: usize, mode: Mode, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut order = (0..len).collect::<Vec<_>>();
    let mut seq = 0;
    for pass in 0u64.. {
        if mode == Mode::Train {
            order.shuffle(&mut rng);
        }
        for &index in &order {
            if slots.recv().is_err() || jobs.send(Job { seq, pass, index }).is_err() {
                return;
            }
            seq += 1;
        }
        if mode == Mode::Validation {
            return;
        }
    }
}

fn work(
    jobs: Receiver<Job>,
    samples: Sender<Processed>,
    images: Arc<Vec<PathBuf>>,
    context: Arc<WorkerContext>,
    seed: u64,
) {
    let mut rng = StdRng::seed_from_u64(seed);
    for job in jobs.iter() {
        let sample = context.process(&images[job.index], &mut rng);
        let processed = Processed {
            seq: job.seq,
            pass: job.pass,
            sample,
        };
        if samples.send(processed).is_err() {
            return;
        }
    }
}

#[derive(Default)]
struct PassTally {
    pass: u64,
    seen: usize,
    skipped: usize,
}

impl PassTally {
    fn record(&mut self, pass: u64, skipped: bool) {
        if pass != self.pass {
            self.flush();
            self.pass = pass;
        }
        self.seen += 1;
        if skipped {
            self.skipped += 1;
        }
    }

    fn flush(&mut self) {
        if self.skipped > 0 {
            log::warn!(
                "Skipped {} of {} samples in pass {}",
                self.skipped,
                self.seen,
                self.pass
            );
        }
        self.seen = 0;
        self.skipped = 0;
    }
}

/// Pull-based batch stream. Dropping it stops the workers after their current sample.
pub struct Batches {
    receiver: Option<Receiver<Processed>>,
    slots: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
    pending: BTreeMap<u64, Processed>,
    next_seq: u64,
    batch_size: usize,
    dataset_len: usize,
    consecutive_failures: usize,
    pass: PassTally,
}

impl Batches {
    fn next_in_order(&mut self) -> Option<Processed> {
        let processed = self.take_next()?;
        if let Some(slots) = &self.slots {
            let _ = slots.try_send(());
        }
        Some(processed)
    }

    fn take_next(&mut self) -> Option<Processed> {
        loop {
            if let Some(processed) = self.pending.remove(&self.next_seq) {
                self.next_seq += 1;
                return Some(processed);
            }
            let Some(receiver) = &self.receiver else {
                // disconnected with a gap; hand out whatever is left in order
                let (_, processed) = self.pending.pop_first()?;
                self.next_seq = processed.seq + 1;
                return Some(processed);
            };
            match receiver.recv() {
                Ok(processed) => {
                    self.pending.insert(processed.seq, processed);
                }
                Err(_) => {
                    self.receiver = None;
                }
            }
        }
    }

    fn next_sample(&mut self) -> Option<TrainingSample> {
        loop {
            let processed = self.next_in_order()?;
            self.pass.record(processed.pass, processed.sample.is_none());
            match processed.sample {
                Some(sample) => {
                    self.consecutive_failures = 0;
                    return Some(sample);
                }
                None => {
                    self.consecutive_failures += 1;
                    if self.consecutive_failures >= self.dataset_len {
                        log::error!(
                            "{} samples in a row could not be encoded, stopping",
                            self.consecutive_failures
                        );
                        self.shutdown();
                        return None;
                    }
                }
            }
        }
    }

    fn shutdown(&mut self) {
        self.receiver = None;
        self.slots = None;
        self.pending.clear();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("Batch worker panicked");
            }
        }
    }
}

impl Iterator for Batches {
    type Item = Batch;

    #[instrument(level = "trace", skip(self))]
    fn next(&mut self) -> Option<Batch> {
        let mut samples = Vec::with_capacity(self.batch_size);
        while samples.len() < self.batch_size {
            match self.next_sample() {
                Some(sample) => samples.push(sample),
                None => break,
            }
        }
        if samples.is_empty() {
            self.pass.flush();
            return None;
        }
        Some(Batch::from_samples(samples))
    }
}

impl Drop for Batches {
    fn drop(&mut self) {
        self.shutdown();
    }
}
