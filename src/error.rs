use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error("annotation file for {0} does not exist")]
    MissingAnnotation(PathBuf),
    #[error("malformed annotation on line {line}: {reason}")]
    MalformedLine { line: usize, reason: String },
    #[error("no images found in {0}")]
    EmptyDataset(PathBuf),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
}

/// Reasons a single polygon can't be used for supervision.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum GeometryError {
    #[error("polygon has fewer than 4 distinct points")]
    TooFewPoints,
    #[error("polygon is degenerate (area {area})")]
    Degenerate { area: f32 },
    #[error("polygon is self-intersecting")]
    SelfIntersecting,
    #[error("polygon vanishes when shrunk")]
    Unshrinkable,
    #[error("failed to fit a rotated rectangle")]
    RectFit,
}
