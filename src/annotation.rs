//! Loading images and their polygon annotations.
//!
//! Every image `name.ext` has a sibling annotation file `name.txt` (or the ICDAR style
//! `gt_name.txt`), one text instance per line:
//!
//! ```text
//! x1,y1,x2,y2,x3,y3,x4,y4,label
//! ```
//!
//! Labels may themselves contain commas. A label equal to one of the ignore markers
//! (`###` by default) marks a region the detector should neither learn nor be
//! penalized for.

use std::{
    fs,
    path::{Path, PathBuf},
};

use image::RgbImage;
use tracing::instrument;

use crate::{
    error::{Error, Result},
    geometry::{validate_quad, Quad},
};

pub const DEFAULT_IGNORE_MARKERS: &[&str] = &["###", "*"];

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationRecord {
    pub quad: Quad,
    pub text: String,
    pub ignored: bool,
}

/// A decoded image with the annotations that still apply to it.
#[derive(Debug, Clone)]
pub struct ImageSample {
    pub path: PathBuf,
    pub image: RgbImage,
    pub records: Vec<AnnotationRecord>,
}

/// Sorted list of the images directly inside `dir`.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|it| it.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|it| it.to_str())
                .is_some_and(|ext| {
                    IMAGE_EXTENSIONS
                        .iter()
                        .any(|known| known.eq_ignore_ascii_case(ext))
                })
        })
        .collect::<Vec<_>>();
    images.sort();
    Ok(images)
}

/// The annotation file belonging to `image_path`, if one exists.
pub fn annotation_path(image_path: &Path) -> Option<PathBuf> {
    let stem = image_path.file_stem()?.to_str()?;
    let dir = image_path.parent().unwrap_or_else(|| Path::new(""));
    [format!("{stem}.txt"), format!("gt_{stem}.txt")]
        .into_iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Parses one annotation line (1-based `line` for diagnostics).
pub fn parse_line(
    line: &str,
    line_number: usize,
    ignore_markers: &[String],
) -> Result<AnnotationRecord> {
    let line = line.trim_start_matches('\u{feff}').trim_end_matches(['\r', '\n']);
    let mut fields = line.splitn(9, ',');
    let mut coords = [0f32; 8];
    for (i, coord) in coords.iter_mut().enumerate() {
        let field = fields.next().ok_or_else(|| Error::MalformedLine {
            line: line_number,
            reason: format!("expected 8 coordinates, found {i}"),
        })?;
        *coord = field.trim().parse().map_err(|_| Error::MalformedLine {
            line: line_number,
            reason: format!("{:?} is not a number", field.trim()),
        })?;
    }
    if coords.iter().any(|it| !it.is_finite()) {
        return Err(Error::MalformedLine {
            line: line_number,
            reason: "non-finite coordinate".into(),
        });
    }
    let text = fields.next().unwrap_or_default().trim().to_string();
    let ignored = ignore_markers.iter().any(|marker| *marker == text);
    Ok(AnnotationRecord {
        quad: Quad::from_flat(coords),
        text,
        ignored,
    })
}

/// Reads every well-formed line of an annotation file. Malformed lines are dropped
/// with a diagnostic logged at `level`; a missing or unreadable file is an error.
#[instrument(level = "debug", skip(ignore_markers))]
pub fn load_annotations(
    path: &Path,
    ignore_markers: &[String],
    level: log::Level,
) -> Result<Vec<AnnotationRecord>> {
    let content = fs::read_to_string(path)?;
    let records = content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().trim_start_matches('\u{feff}').is_empty())
        .filter_map(|(i, line)| match parse_line(line, i + 1, ignore_markers) {
            Ok(record) => Some(record),
            Err(err) => {
                log::log!(level, "{}: {err}", path.display());
                None
            }
        })
        .collect();
    Ok(records)
}

/// Clips every polygon into the image frame and re-validates it, dropping records that
/// end up degenerate. Surviving quads are clockwise and start at the top-left corner.
pub fn check_and_validate(
    records: Vec<AnnotationRecord>,
    width: u32,
    height: u32,
) -> Vec<AnnotationRecord> {
    records
        .into_iter()
        .filter_map(|record| {
            match validate_quad(record.quad.clip(width, height)) {
                Ok(quad) => Some(AnnotationRecord { quad, ..record }),
                Err(err) => {
                    log::debug!("Dropping annotation {:?}: {err}", record.text);
                    None
                }
            }
        })
        .collect()
}

/// Decodes an image and its annotations. Per-line diagnostics are logged at `level`.
#[instrument(level = "debug", skip(ignore_markers))]
pub fn load_sample(
    image_path: &Path,
    ignore_markers: &[String],
    level: log::Level,
) -> Result<ImageSample> {
    let annotation = annotation_path(image_path)
        .ok_or_else(|| Error::MissingAnnotation(image_path.to_path_buf()))?;
    let image = image::open(image_path)?.to_rgb8();
    let records = load_annotations(&annotation, ignore_markers, level)?;
    let records = check_and_validate(records, image.width(), image.height());
    log::trace!(
        "Loaded {} ({}x{}) with {} polygons",
        image_path.display(),
        image.width(),
        image.height(),
        records.len()
    );
    Ok(ImageSample {
        path: image_path.to_path_buf(),
        image,
        records,
    })
}

#[cfg(test)]
mod tests {
    use geo::Coord;

    use super::*;

    fn markers() -> Vec<String> {
        DEFAULT_IGNORE_MARKERS.iter().map(|it| it.to_string()).collect()
    }

    #[test]
    fn parses_label_with_commas_and_bom() {
        let record = parse_line("\u{feff}1,2,3,4,5,6,7,8,Hello, world", 1, &markers()).unwrap();
        assert_eq!(record.text, "Hello, world");
        assert!(!record.ignored);
        assert_eq!(record.quad.points()[3], Coord { x: 7.0, y: 8.0 });
    }

    #[test]
    fn ignore_marker() {
        let record = parse_line("1,2,3,4,5,6,7,8,###", 1, &markers()).unwrap();
        assert!(record.ignored);
        let record = parse_line("1,2,3,4,5,6,7,8,####", 1, &markers()).unwrap();
        assert!(!record.ignored);
    }

    #[test]
    fn malformed_lines() {
        assert!(matches!(
            parse_line("1,2,3,4,5,6,7", 4, &markers()),
            Err(Error::MalformedLine { line: 4, .. })
        ));
        assert!(matches!(
            parse_line("1,2,three,4,5,6,7,8,x", 2, &markers()),
            Err(Error::MalformedLine { line: 2, .. })
        ));
    }

    #[test]
    fn load_skips_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img_1.txt");
        fs::write(
            &path,
            "10,10,50,10,50,30,10,30,STOP\nbroken line\n\n0,0,20,0,20,20,0,20,###\n",
        )
        .unwrap();
        let records = load_annotations(&path, &markers(), log::Level::Warn).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].text, "STOP");
        assert!(records[1].ignored);
    }

    #[test]
    fn validation_clips_and_drops_degenerate() {
        let records = vec![
            AnnotationRecord {
                quad: Quad::from_flat([-5.0, 10.0, 40.0, 10.0, 40.0, 30.0, -5.0, 30.0]),
                text: "edge".into(),
                ignored: false,
            },
            AnnotationRecord {
                quad: Quad::from_flat([1.0, 1.0, 5.0, 5.0, 9.0, 9.0, 13.0, 13.0]),
                text: "line".into(),
                ignored: false,
            },
            AnnotationRecord {
                quad: Quad::from_flat([200.0, 10.0, 300.0, 10.0, 300.0, 30.0, 200.0, 30.0]),
                text: "outside".into(),
                ignored: false,
            },
        ];
        let records = check_and_validate(records, 100, 50);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].quad.points()[0], Coord { x: 0.0, y: 10.0 });
    }

    #[test]
    fn finds_images_and_annotations() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.PNG", "a.jpg", "notes.txt", "c.gif"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        fs::write(dir.path().join("gt_a.txt"), b"").unwrap();
        let images = list_images(dir.path()).unwrap();
        assert_eq!(images, vec![dir.path().join("a.jpg"), dir.path().join("b.PNG")]);
        assert_eq!(annotation_path(&images[0]), Some(dir.path().join("gt_a.txt")));
        assert_eq!(annotation_path(&images[1]), None);
    }

    #[test]
    fn missing_annotation_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("lonely.png");
        RgbImage::new(4, 4).save(&image_path).unwrap();
        assert!(matches!(
            load_sample(&image_path, &markers(), log::Level::Warn),
            Err(Error::MissingAnnotation(_))
        ));
    }
}
