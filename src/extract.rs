use crate::error::ExtractError;
use crate::map::Features;
use akaze::Akaze;
use bitarray::BitArray;
use cv_core::nalgebra::Point2;
use cv_core::KeyPoint;
use image::DynamicImage;
use log::*;
use std::path::Path;

/// Detects keypoints in an image and computes their descriptors.
pub trait FeatureExtractor<D> {
    fn extract(&self, image: &DynamicImage) -> Result<Features<D>, ExtractError>;

    /// Opens an image file and extracts its features.
    fn extract_path(&self, path: &Path) -> Result<Features<D>, ExtractError> {
        self.extract(&image::open(path)?)
    }
}

/// Extracts AKAZE features with 486-bit binary descriptors.
#[derive(Debug, Clone)]
pub struct AkazeExtractor {
    akaze: Akaze,
}

impl AkazeExtractor {
    /// Creates an extractor with the given detector threshold.
    pub fn new(threshold: f64) -> Self {
        Self {
            akaze: Akaze::new(threshold),
        }
    }
}

impl Default for AkazeExtractor {
    fn default() -> Self {
        Self {
            akaze: Akaze::default(),
        }
    }
}

impl FeatureExtractor<BitArray<64>> for AkazeExtractor {
    fn extract(&self, image: &DynamicImage) -> Result<Features<BitArray<64>>, ExtractError> {
        let (keypoints, descriptors) = self.akaze.extract(image);
        if keypoints.len() != descriptors.len() {
            return Err(ExtractError::Misaligned {
                keypoints: keypoints.len(),
                descriptors: descriptors.len(),
            });
        }
        if keypoints.is_empty() {
            return Err(ExtractError::NoFeatures);
        }
        debug!("akaze found {} features", keypoints.len());
        Ok(Features {
            keypoints: keypoints
                .iter()
                .map(|kp| KeyPoint(Point2::new(kp.point.0 as f64, kp.point.1 as f64)))
                .collect(),
            descriptors,
        })
    }
}
