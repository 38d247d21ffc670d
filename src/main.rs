use std::{path::PathBuf, time::Instant};

use clap::Parser;
use east_gt::{summary::write_batch_summaries, GeneratorBuilder, Mode, PixelNormalization};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// Streams ground-truth batches from an annotated dataset and reports what was encoded.
#[derive(Debug, Parser)]
struct Args {
    /// Directory with training images and their annotation files
    #[arg(long)]
    training_data_path: PathBuf,
    /// Directory with validation images; skipped when not given
    #[arg(long)]
    validation_data_path: Option<PathBuf>,
    #[arg(long, default_value_t = 512)]
    input_size: u32,
    #[arg(long, default_value_t = 16)]
    batch_size: usize,
    #[arg(long, default_value_t = 4)]
    nb_workers: usize,
    /// Queue depth in batches
    #[arg(long, default_value_t = 10)]
    max_queue_size: usize,
    #[arg(long, default_value_t = 10.0)]
    min_text_size: f32,
    #[arg(long, default_value_t = 0.1)]
    min_crop_side_ratio: f32,
    /// Number of training batches to pull
    #[arg(long, default_value_t = 10)]
    batches: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Log every skipped sample at warn level
    #[arg(long)]
    verbose: bool,
    /// Write PNG summaries of the first batch here
    #[arg(long)]
    dump_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 3)]
    dump_samples: usize,
}

fn main() {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let builder = |path: PathBuf, mode: Mode| {
        let mut builder = GeneratorBuilder::new(path)
            .input_size(args.input_size)
            .batch_size(args.batch_size)
            .workers(args.nb_workers)
            .max_queue_size(args.max_queue_size)
            .mode(mode)
            .seed(args.seed)
            .quiet(!args.verbose);
        let mut encoder = east_gt::EncoderOptions::default();
        encoder.min_text_size = args.min_text_size;
        builder = builder.encoder_options(encoder);
        if mode == Mode::Train {
            builder = builder.augment_options(east_gt::AugmentOptions {
                min_crop_side_ratio: args.min_crop_side_ratio,
                ..Default::default()
            });
        }
        builder
    };

    let train = builder(args.training_data_path.clone(), Mode::Train)
        .build()
        .expect("Failed to set up the training generator");
    let start = Instant::now();
    for (i, batch) in train.batches().take(args.batches).enumerate() {
        let positive = batch.score_maps.iter().filter(|it| **it > 0.0).count();
        let suppressed = batch.boundary_masks.iter().filter(|it| **it > 0.0).count();
        log::info!(
            "Training batch {i}: {} samples, {positive} positive pixels, {suppressed} boundary pixels",
            batch.len()
        );
        if let (0, Some(dir)) = (i, &args.dump_dir) {
            write_batch_summaries(
                &batch,
                dir,
                "train",
                args.dump_samples,
                &PixelNormalization::default(),
            )
            .expect("Failed to write summaries");
        }
    }
    log::info!(
        "Pulled {} training batches in {:?}, {:?}",
        args.batches,
        start.elapsed(),
        train.stats()
    );

    if let Some(path) = args.validation_data_path.clone() {
        let validation = builder(path, Mode::Validation)
            .build()
            .expect("Failed to set up the validation generator");
        let start = Instant::now();
        let count = validation.batches().count();
        log::info!(
            "Validation pass: {count} of {} batches in {:?}, {:?}",
            validation.batches_per_pass(),
            start.elapsed(),
            validation.stats()
        );
    }
}
