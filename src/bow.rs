//! Bag-of-words encoding of local descriptors with spatial pyramids.
//!
//! Every descriptor of an image is assigned to the nearest center of a trained
//! [`Vocabulary`] and the assignments are accumulated into one histogram per
//! spatial cell. The cells of all pyramid levels are concatenated, so an image
//! produces a vector of length `K × cell_count`.
//!
//! The pyramid levels are laid over a square frame of
//! [`Vocabulary::resized_image_size`] pixels:
//!
//! * level 0 is the whole frame,
//! * level 1 is a 2x2 grid,
//! * level 2 is three horizontal bands that each span the full width.
//!
//! Level 2 is not a 3x3 grid. Trained vocabularies depend on this layout.

use crate::descriptor::{Descriptor, LinearIndex, NeighborIndex};
use crate::error::{ConfigError, ResourceError};
use crate::map::{Features, Map, ViewId};
use cv_core::{ImagePoint, KeyPoint};
use log::*;
use rayon::prelude::*;
use std::collections::HashMap;
use std::str::FromStr;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The deepest supported pyramid level.
pub const MAX_PYRAMID_LEVEL: usize = 3;

/// How each cell histogram is normalized after counting.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum Normalization {
    None,
    L2,
    /// The square root of the L1 normalized histogram.
    L1SquareRoot,
}

impl FromStr for Normalization {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s {
            "NONE" => Ok(Self::None),
            "L2" => Ok(Self::L2),
            "L1" => Ok(Self::L1SquareRoot),
            _ => Err(ConfigError::UnknownNormalization(s.to_owned())),
        }
    }
}

impl Normalization {
    fn apply(self, cell: &mut [f32]) {
        match self {
            Self::None => {}
            Self::L2 => {
                let norm = cell.iter().map(|v| v * v).sum::<f32>().sqrt();
                if norm > 0.0 {
                    cell.iter_mut().for_each(|v| *v /= norm);
                }
            }
            Self::L1SquareRoot => {
                let norm = cell.iter().map(|v| v.abs()).sum::<f32>();
                if norm > 0.0 {
                    cell.iter_mut().for_each(|v| *v = (*v / norm).sqrt());
                }
            }
        }
    }
}

/// A trained visual vocabulary and the spatial layout of its histograms.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Vocabulary {
    centers: Vec<Vec<f32>>,
    resized_image_size: u32,
    normalization: Normalization,
    spatial_pyramid: bool,
    pyramid_level: usize,
}

impl Vocabulary {
    pub fn new(
        centers: Vec<Vec<f32>>,
        resized_image_size: u32,
        normalization: Normalization,
        spatial_pyramid: bool,
        pyramid_level: usize,
    ) -> Result<Self, ConfigError> {
        let vocabulary = Self {
            centers,
            resized_image_size,
            normalization,
            spatial_pyramid,
            pyramid_level,
        };
        vocabulary.validate()?;
        Ok(vocabulary)
    }

    /// Checks the invariants of [`Vocabulary::new`].
    ///
    /// A deserialized vocabulary has not been through `new`, so encoders check again.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let width = self
            .centers
            .first()
            .ok_or(ConfigError::EmptyVocabulary)?
            .len();
        if let Some((index, center)) = self
            .centers
            .iter()
            .enumerate()
            .find(|(_, c)| c.len() != width)
        {
            return Err(ConfigError::CenterWidth {
                index,
                expected: width,
                found: center.len(),
            });
        }
        if self.pyramid_level > MAX_PYRAMID_LEVEL {
            return Err(ConfigError::PyramidLevel(self.pyramid_level));
        }
        Ok(())
    }

    /// The number of visual words `K`.
    pub fn len(&self) -> usize {
        self.centers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centers.is_empty()
    }

    /// The width of the descriptors the vocabulary was trained on.
    pub fn descriptor_width(&self) -> usize {
        self.centers.first().map_or(0, Vec::len)
    }

    pub fn centers(&self) -> &[Vec<f32>] {
        &self.centers
    }

    pub fn resized_image_size(&self) -> u32 {
        self.resized_image_size
    }

    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    /// The number of spatial cells of an encoded image.
    pub fn cell_count(&self) -> usize {
        cell_count(self.pyramid_level, self.spatial_pyramid)
    }

    /// The length of an encoded vector.
    pub fn encoded_len(&self) -> usize {
        self.len() * self.cell_count()
    }

    fn levels(&self) -> usize {
        if self.spatial_pyramid {
            self.pyramid_level.max(1)
        } else {
            1
        }
    }
}

/// The number of cells along each axis of a pyramid level.
///
/// Returns `(columns, rows)`.
fn level_grid(level: usize) -> (usize, usize) {
    match level {
        2 => (1, 3),
        _ => (level + 1, level + 1),
    }
}

/// The number of spatial cells for a pyramid configuration.
pub fn cell_count(pyramid_level: usize, spatial_pyramid: bool) -> usize {
    if !spatial_pyramid {
        return 1;
    }
    (0..pyramid_level.max(1))
        .map(|level| {
            let (columns, rows) = level_grid(level);
            columns * rows
        })
        .sum()
}

/// The cell along one axis containing `coordinate`, if any.
///
/// Cells are `size / len` pixels wide, so pixels in the remainder belong to no cell.
fn axis_cell(coordinate: f64, size: u32, len: usize) -> Option<usize> {
    let step = (size as usize / len) as f64;
    if coordinate < 0.0 || step == 0.0 {
        return None;
    }
    let cell = (coordinate / step) as usize;
    (cell < len).then(|| cell)
}

/// Encodes descriptor sets into bag-of-words vectors.
pub struct BowEncoder<I = LinearIndex<Vec<f32>>> {
    vocabulary: Vocabulary,
    index: I,
}

impl<I> BowEncoder<I>
where
    I: NeighborIndex<Vec<f32>> + Sync,
{
    /// Fails if the vocabulary is invalid.
    pub fn new(vocabulary: Vocabulary) -> Result<Self, ConfigError> {
        vocabulary.validate()?;
        let index = I::build(vocabulary.centers());
        Ok(Self { vocabulary, index })
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// The visual word of each descriptor.
    pub fn assign(&self, descriptors: &[Vec<f32>]) -> Vec<usize> {
        descriptors
            .par_iter()
            .map(|descriptor| {
                self.index
                    .knn(descriptor, 1)
                    .first()
                    .map(|neighbor| neighbor.index)
                    .unwrap_or(0)
            })
            .collect()
    }

    /// Encodes the descriptors of an image of `image_size` pixels.
    ///
    /// `keypoints` must be index-aligned with `descriptors`.
    pub fn encode(
        &self,
        descriptors: &[Vec<f32>],
        keypoints: &[KeyPoint],
        image_size: (u32, u32),
    ) -> Result<Vec<f32>, ResourceError> {
        let k = self.vocabulary.len();
        let width = self.vocabulary.descriptor_width();
        if let Some(descriptor) = descriptors.iter().find(|d| d.len() != width) {
            return Err(ResourceError::DimensionMismatch {
                expected: width,
                found: descriptor.len(),
            });
        }
        if keypoints.len() != descriptors.len() {
            return Err(ResourceError::DimensionMismatch {
                expected: descriptors.len(),
                found: keypoints.len(),
            });
        }

        let words = self.assign(descriptors);
        let size = self.vocabulary.resized_image_size;
        let scale_x = size as f64 / image_size.0.max(1) as f64;
        let scale_y = size as f64 / image_size.1.max(1) as f64;

        let mut histogram = vec![0.0f32; self.vocabulary.encoded_len()];
        let mut counts = vec![0usize; self.vocabulary.cell_count()];
        let mut offset = 0;
        for level in 0..self.vocabulary.levels() {
            let (columns, rows) = level_grid(level);
            for (&word, keypoint) in words.iter().zip(keypoints) {
                let point = keypoint.image_point();
                let cell = axis_cell(point.x * scale_x, size, columns).and_then(|x| {
                    axis_cell(point.y * scale_y, size, rows).map(|y| y * columns + x)
                });
                if let Some(cell) = cell {
                    histogram[(offset + cell) * k + word] += 1.0;
                    counts[offset + cell] += 1;
                }
            }
            offset += columns * rows;
        }

        // Every cell is divided by its own descriptor count, not by the total count of
        // the image. The two only differ under `Normalization::None`.
        let normalization = self.vocabulary.normalization;
        histogram
            .par_chunks_mut(k)
            .zip(counts.par_iter())
            .filter(|(_, count)| **count != 0)
            .for_each(|(cell, &count)| {
                cell.iter_mut().for_each(|v| *v /= count as f32);
                normalization.apply(cell);
            });
        Ok(histogram)
    }
}

/// Reduces the dimensionality of descriptors before encoding.
pub trait Projector: Send + Sync {
    /// The width of descriptors accepted by the projector.
    fn input_dim(&self) -> usize;

    /// The width of projected descriptors.
    fn output_dim(&self) -> usize;

    fn project(&self, descriptor: &[f32]) -> Vec<f32>;

    fn project_all(&self, descriptors: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, ResourceError> {
        if let Some(descriptor) = descriptors.iter().find(|d| d.len() != self.input_dim()) {
            return Err(ResourceError::DimensionMismatch {
                expected: self.input_dim(),
                found: descriptor.len(),
            });
        }
        Ok(descriptors.par_iter().map(|d| self.project(d)).collect())
    }
}

/// Principal component projection with each component scaled by its eigenvalue.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Pca {
    mean: Vec<f32>,
    eigenvectors: Vec<Vec<f32>>,
    eigenvalues: Vec<f32>,
}

impl Pca {
    /// Keeps the first `dim` components of the basis.
    pub fn new(
        dim: usize,
        mean: Vec<f32>,
        mut eigenvectors: Vec<Vec<f32>>,
        mut eigenvalues: Vec<f32>,
    ) -> Result<Self, ResourceError> {
        let available = eigenvectors.len().min(eigenvalues.len());
        if dim > available {
            return Err(ResourceError::DimensionMismatch {
                expected: dim,
                found: available,
            });
        }
        if let Some(vector) = eigenvectors.iter().find(|v| v.len() != mean.len()) {
            return Err(ResourceError::DimensionMismatch {
                expected: mean.len(),
                found: vector.len(),
            });
        }
        eigenvectors.truncate(dim);
        eigenvalues.truncate(dim);
        Ok(Self {
            mean,
            eigenvectors,
            eigenvalues,
        })
    }
}

impl Projector for Pca {
    fn input_dim(&self) -> usize {
        self.mean.len()
    }

    fn output_dim(&self) -> usize {
        self.eigenvectors.len()
    }

    fn project(&self, descriptor: &[f32]) -> Vec<f32> {
        self.eigenvectors
            .iter()
            .zip(&self.eigenvalues)
            .map(|(vector, &value)| {
                let dot: f32 = vector
                    .iter()
                    .zip(descriptor.iter().zip(&self.mean))
                    .map(|(&e, (&x, &m))| e * (x - m))
                    .sum();
                dot / value
            })
            .collect()
    }
}

/// The bag-of-words model of a session and the encoded vectors of the map views.
pub struct BowModel<I = LinearIndex<Vec<f32>>> {
    encoder: BowEncoder<I>,
    projector: Option<Box<dyn Projector>>,
    database: HashMap<ViewId, Vec<f32>>,
}

impl<I> BowModel<I>
where
    I: NeighborIndex<Vec<f32>> + Sync,
{
    pub fn new(vocabulary: Vocabulary) -> Result<Self, ConfigError> {
        Ok(Self {
            encoder: BowEncoder::new(vocabulary)?,
            projector: None,
            database: HashMap::new(),
        })
    }

    pub fn projector(self, projector: impl Projector + 'static) -> Self {
        Self {
            projector: Some(Box::new(projector)),
            ..self
        }
    }

    pub fn encoder(&self) -> &BowEncoder<I> {
        &self.encoder
    }

    /// Projects and encodes the features of an image.
    pub fn encode_features<D: Descriptor>(
        &self,
        features: &Features<D>,
        image_size: (u32, u32),
    ) -> Result<Vec<f32>, ResourceError> {
        let floats: Vec<Vec<f32>> = features.descriptors.iter().map(D::to_floats).collect();
        let floats = match &self.projector {
            Some(projector) => projector.project_all(&floats)?,
            None => floats,
        };
        self.encoder.encode(&floats, &features.keypoints, image_size)
    }

    /// Stores a precomputed vector for a view.
    pub fn insert(&mut self, view: ViewId, vector: Vec<f32>) {
        self.database.insert(view, vector);
    }

    pub fn vector(&self, view: ViewId) -> Option<&Vec<f32>> {
        self.database.get(&view)
    }

    pub fn len(&self) -> usize {
        self.database.len()
    }

    pub fn is_empty(&self) -> bool {
        self.database.is_empty()
    }

    /// Encodes every map view with cached features that is not encoded yet.
    ///
    /// Views whose features cannot be encoded are logged and skipped.
    pub fn encode_views<D: Descriptor>(&mut self, map: &Map<D>) {
        let pending: Vec<_> = map
            .views()
            .filter(|(id, _)| !self.database.contains_key(id))
            .filter_map(|(id, view)| map.features(id).map(|features| (id, view.size, features)))
            .collect();
        info!("encoding {} views", pending.len());
        let encoded: Vec<(ViewId, Result<Vec<f32>, ResourceError>)> = pending
            .par_iter()
            .map(|&(id, size, features)| (id, self.encode_features(features, size)))
            .collect();
        for (id, result) in encoded {
            match result {
                Ok(vector) => {
                    self.database.insert(id, vector);
                }
                Err(e) => warn!("unable to encode view {}: {}", id, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use cv_core::nalgebra::Point2;

    fn vocabulary(normalization: Normalization, spatial_pyramid: bool, level: usize) -> Vocabulary {
        Vocabulary::new(
            vec![vec![0.0, 0.0], vec![10.0, 0.0], vec![0.0, 10.0]],
            90,
            normalization,
            spatial_pyramid,
            level,
        )
        .unwrap()
    }

    fn bow_encoder(
        normalization: Normalization,
        spatial_pyramid: bool,
        level: usize,
    ) -> BowEncoder {
        BowEncoder::new(vocabulary(normalization, spatial_pyramid, level)).unwrap()
    }

    fn kp(x: f64, y: f64) -> KeyPoint {
        KeyPoint(Point2::new(x, y))
    }

    #[test]
    fn cell_counts() {
        assert_eq!(cell_count(0, false), 1);
        assert_eq!(cell_count(3, false), 1);
        assert_eq!(cell_count(0, true), 1);
        assert_eq!(cell_count(1, true), 1);
        assert_eq!(cell_count(2, true), 5);
        assert_eq!(cell_count(3, true), 8);
    }

    #[test]
    fn invalid_vocabularies() {
        assert_eq!(
            Vocabulary::new(vec![], 90, Normalization::L2, true, 2),
            Err(ConfigError::EmptyVocabulary)
        );
        assert_eq!(
            Vocabulary::new(vec![vec![0.0]], 90, Normalization::L2, true, 4),
            Err(ConfigError::PyramidLevel(4))
        );
        assert!(matches!(
            Vocabulary::new(vec![vec![0.0], vec![0.0, 1.0]], 90, Normalization::L2, true, 2),
            Err(ConfigError::CenterWidth { index: 1, .. })
        ));
        let empty = Vocabulary {
            centers: vec![],
            ..vocabulary(Normalization::L2, true, 2)
        };
        assert_eq!(empty.validate(), Err(ConfigError::EmptyVocabulary));
        assert!(matches!(
            BowEncoder::<LinearIndex<Vec<f32>>>::new(empty),
            Err(ConfigError::EmptyVocabulary)
        ));
        let deep = Vocabulary {
            pyramid_level: 7,
            ..vocabulary(Normalization::L2, true, 2)
        };
        assert!(matches!(
            BowModel::<LinearIndex<Vec<f32>>>::new(deep),
            Err(ConfigError::PyramidLevel(7))
        ));
        assert_eq!(
            "L3".parse::<Normalization>(),
            Err(ConfigError::UnknownNormalization("L3".into()))
        );
        assert_eq!(
            "L1".parse::<Normalization>(),
            Ok(Normalization::L1SquareRoot)
        );
    }

    #[test]
    fn encoded_length() {
        let encoder = bow_encoder(Normalization::L2, true, 2);
        let descriptors = vec![vec![1.0, 1.0], vec![9.0, 1.0]];
        let keypoints = vec![kp(10.0, 10.0), kp(170.0, 170.0)];
        let encoded = encoder.encode(&descriptors, &keypoints, (180, 180)).unwrap();
        assert_eq!(encoded.len(), 3 * 5);

        let encoder = bow_encoder(Normalization::L2, false, 2);
        let encoded = encoder.encode(&descriptors, &keypoints, (180, 180)).unwrap();
        assert_eq!(encoded.len(), 3);
    }

    #[test]
    fn cells_sum_to_one_before_normalization() {
        let encoder = bow_encoder(Normalization::None, true, 3);
        let descriptors = vec![
            vec![1.0, 1.0],
            vec![9.0, 1.0],
            vec![1.0, 9.0],
            vec![8.0, 0.0],
            vec![0.0, 0.5],
        ];
        let keypoints = vec![
            kp(5.0, 5.0),
            kp(50.0, 5.0),
            kp(5.0, 50.0),
            kp(80.0, 80.0),
            kp(44.0, 31.0),
        ];
        let encoded = encoder.encode(&descriptors, &keypoints, (90, 90)).unwrap();
        for cell in encoded.chunks(3) {
            let sum: f32 = cell.iter().sum();
            assert!(sum == 0.0 || (sum - 1.0).abs() < 1e-6, "cell sum {}", sum);
        }
        // The whole image cell counts every descriptor.
        assert_relative_eq!(encoded[0], 2.0 / 5.0);
        assert_relative_eq!(encoded[1], 2.0 / 5.0);
        assert_relative_eq!(encoded[2], 1.0 / 5.0);
    }

    #[test]
    fn level_two_is_horizontal_bands() {
        let encoder = bow_encoder(Normalization::None, true, 3);
        // One descriptor in the bottom right corner of the image.
        let encoded = encoder
            .encode(&[vec![10.0, 0.0]], &[kp(85.0, 85.0)], (90, 90))
            .unwrap();
        // Level 0 (cell 0), level 1 bottom right (cell 1 + 3), level 2 bottom band (cell 5 + 2).
        let hot: Vec<usize> = encoded
            .chunks(3)
            .enumerate()
            .filter(|(_, cell)| cell[1] > 0.0)
            .map(|(ix, _)| ix)
            .collect();
        assert_eq!(hot, vec![0, 4, 7]);
    }

    #[test]
    fn l2_cells_have_unit_norm() {
        let encoder = bow_encoder(Normalization::L2, true, 2);
        let descriptors = vec![vec![1.0, 1.0], vec![9.0, 1.0], vec![9.0, 2.0]];
        let keypoints = vec![kp(5.0, 5.0), kp(10.0, 5.0), kp(80.0, 80.0)];
        let encoded = encoder.encode(&descriptors, &keypoints, (90, 90)).unwrap();
        for cell in encoded.chunks(3) {
            let norm = cell.iter().map(|v| v * v).sum::<f32>().sqrt();
            if cell.iter().all(|&v| v == 0.0) {
                assert_eq!(norm, 0.0);
            } else {
                assert_relative_eq!(norm, 1.0, epsilon = 1e-6);
            }
        }
        // The top right and bottom left cells of level 1 are empty.
        assert!(encoded[2 * 3..4 * 3].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn l1_square_root() {
        let encoder = bow_encoder(Normalization::L1SquareRoot, false, 0);
        let descriptors = vec![vec![1.0, 1.0], vec![9.0, 1.0], vec![9.0, 2.0], vec![10.0, 1.0]];
        let keypoints = vec![kp(1.0, 1.0); 4];
        let encoded = encoder.encode(&descriptors, &keypoints, (90, 90)).unwrap();
        assert_relative_eq!(encoded[0], 0.5);
        assert_relative_eq!(encoded[1], 0.75f32.sqrt());
        assert_eq!(encoded[2], 0.0);
    }

    #[test]
    fn keypoints_are_scaled_into_the_frame() {
        let encoder = bow_encoder(Normalization::None, true, 2);
        // A 900 pixel wide image maps onto the 90 pixel frame.
        let encoded = encoder
            .encode(&[vec![0.0, 0.0]], &[kp(600.0, 100.0)], (900, 900))
            .unwrap();
        // Top right cell of level 1.
        assert_eq!(encoded[2 * 3], 1.0);
    }

    #[test]
    fn mismatched_width() {
        let encoder = bow_encoder(Normalization::None, true, 2);
        assert!(matches!(
            encoder.encode(&[vec![0.0]], &[kp(0.0, 0.0)], (90, 90)),
            Err(ResourceError::DimensionMismatch {
                expected: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn pca_projection() {
        let pca = Pca::new(
            1,
            vec![1.0, 1.0],
            vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            vec![2.0, 4.0],
        )
        .unwrap();
        assert_eq!(pca.output_dim(), 1);
        assert_eq!(pca.project(&[5.0, 3.0]), vec![2.0]);
        assert!(pca.project_all(&[vec![1.0]]).is_err());
    }
}
