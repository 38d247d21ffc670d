//! Ground-truth generation for EAST-style scene text detectors.
//!
//! Annotated images are loaded, randomly rescaled and cropped, padded to a square
//! network input and encoded into RBOX targets (score map, five-channel geometry map
//! and two loss masks) at a quarter of the input resolution. [`GeneratorBuilder`]
//! drives the whole pipeline on a worker pool and hands out ready [`Batch`]es.
//!
//! ```no_run
//! use east_gt::{GeneratorBuilder, Mode};
//!
//! let generator = GeneratorBuilder::new("data/icdar2015/train")
//!     .input_size(512)
//!     .batch_size(16)
//!     .workers(4)
//!     .mode(Mode::Train)
//!     .build()?;
//! for batch in generator.batches().take(10) {
//!     println!("{:?}", batch.score_maps.shape());
//! }
//! # Ok::<(), east_gt::Error>(())
//! ```

pub mod annotation;
pub mod augment;
pub mod encoder;
mod error;
mod generator;
pub mod geometry;
pub mod loss;
mod result;
pub mod summary;
pub mod training;
pub mod util;

pub use annotation::{AnnotationRecord, ImageSample};
pub use augment::{AugmentOptions, AugmentedSample, CropKind};
pub use encoder::{EncodedMaps, EncoderOptions, PolygonStats};
pub use error::*;
pub use generator::{BatchGenerator, Batches, GeneratorBuilder, Mode};
pub use geometry::{Quad, RotatedRect};
pub use result::*;
pub use util::PixelNormalization;
