//! Training-set assembly.
//!
//! Walks every stored reference image and pairs its pixel data with its
//! identity label. Rows whose backing file has gone missing are
//! tolerated and skipped (the store may lag the filesystem), as are
//! images in which no face can be detected; both are logged so the
//! gaps stay observable.

use image::DynamicImage;
use std::path::Path;

use rollcall_core::{preprocess, FaceBox, FaceSample};

use crate::store::{Store, StoreError};

/// Counters describing one assembly walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssemblyStats {
    pub total_records: usize,
    pub missing_files: usize,
    pub undecodable: usize,
    pub no_face: usize,
    pub used: usize,
}

/// Collect training samples for every identity with usable reference
/// images. `detect` runs the face detector over a decoded image; only
/// the first detected face of each reference is used (enrollment
/// guarantees one face per reference).
pub fn assemble<F>(
    store: &Store,
    media_dir: &Path,
    mut detect: F,
) -> Result<(Vec<FaceSample>, AssemblyStats), StoreError>
where
    F: FnMut(&DynamicImage) -> Vec<FaceBox>,
{
    let records = store.references_all()?;
    let mut stats = AssemblyStats {
        total_records: records.len(),
        ..Default::default()
    };
    let mut samples = Vec::new();

    for record in records {
        let full_path = media_dir.join(&record.path);
        if !full_path.exists() {
            tracing::warn!(
                identity = %record.identity,
                path = %full_path.display(),
                "reference image file missing; skipping"
            );
            stats.missing_files += 1;
            continue;
        }

        let image = match image::open(&full_path) {
            Ok(img) => img,
            Err(e) => {
                tracing::warn!(
                    identity = %record.identity,
                    path = %full_path.display(),
                    error = %e,
                    "reference image unreadable; skipping"
                );
                stats.undecodable += 1;
                continue;
            }
        };

        let faces = detect(&image);
        let Some(face) = faces.first() else {
            tracing::warn!(
                identity = %record.identity,
                path = %full_path.display(),
                "no face detected in reference image; skipping"
            );
            stats.no_face += 1;
            continue;
        };

        samples.push(FaceSample {
            label: record.identity.clone(),
            tensor: preprocess::extract_face(&image, face),
        });
        stats.used += 1;
    }

    tracing::info!(
        total = stats.total_records,
        used = stats.used,
        missing = stats.missing_files,
        undecodable = stats.undecodable,
        no_face = stats.no_face,
        "training set assembled"
    );
    Ok((samples, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn full_face(image: &DynamicImage) -> Vec<FaceBox> {
        vec![FaceBox {
            x: 0.0,
            y: 0.0,
            width: image.width() as f32,
            height: image.height() as f32,
            confidence: 5.0,
        }]
    }

    fn write_image(dir: &Path, rel: &str, value: u8) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(32, 32, Rgb([value, value, value]))
            .save(&path)
            .unwrap();
    }

    #[test]
    fn test_assembles_existing_references() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();

        write_image(dir.path(), "1/a.png", 100);
        write_image(dir.path(), "2/a.png", 200);
        store.insert_reference("1", "1/a.png").unwrap();
        store.insert_reference("2", "2/a.png").unwrap();

        let (samples, stats) = assemble(&store, dir.path(), full_face).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(stats.used, 2);
        assert_eq!(stats.missing_files, 0);
        let mut labels: Vec<&str> = samples.iter().map(|s| s.label.as_str()).collect();
        labels.sort_unstable();
        assert_eq!(labels, vec!["1", "2"]);
    }

    #[test]
    fn test_dangling_records_silently_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();

        write_image(dir.path(), "1/a.png", 100);
        store.insert_reference("1", "1/a.png").unwrap();
        // Row with no backing file.
        store.insert_reference("2", "2/gone.png").unwrap();

        let (samples, stats) = assemble(&store, dir.path(), full_face).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].label, "1");
        assert_eq!(stats.missing_files, 1);
        assert_eq!(stats.total_records, 2);
    }

    #[test]
    fn test_faceless_images_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();

        write_image(dir.path(), "1/a.png", 100);
        store.insert_reference("1", "1/a.png").unwrap();

        let (samples, stats) = assemble(&store, dir.path(), |_| Vec::new()).unwrap();
        assert!(samples.is_empty());
        assert_eq!(stats.no_face, 1);
    }

    #[test]
    fn test_undecodable_file_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();

        let path = dir.path().join("1/junk.png");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not an image").unwrap();
        store.insert_reference("1", "1/junk.png").unwrap();

        let (samples, stats) = assemble(&store, dir.path(), full_face).unwrap();
        assert!(samples.is_empty());
        assert_eq!(stats.undecodable, 1);
    }
}
