use crate::localize::Stage;
use crate::map::ViewId;
use thiserror::Error;

/// Invalid configuration detected while building a session or model.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("vocabulary must contain at least one center")]
    EmptyVocabulary,
    #[error("vocabulary center {index} has width {found} but {expected} was expected")]
    CenterWidth {
        index: usize,
        expected: usize,
        found: usize,
    },
    #[error("spatial pyramid level {0} exceeds the maximum of 3")]
    PyramidLevel(usize),
    #[error("unknown normalization {0:?}")]
    UnknownNormalization(String),
    #[error("{filter} knn of {knn} must be less than the {views} views in the map")]
    KnnTooLarge {
        filter: &'static str,
        knn: usize,
        views: usize,
    },
}

/// A model, file, or descriptor set that could not be used.
///
/// These errors are logged and the stage that needed the resource is skipped.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("no features available for view {0}")]
    MissingFeatures(ViewId),
    #[error("view {view} has {keypoints} keypoints but {descriptors} descriptors")]
    MisalignedFeatures {
        view: ViewId,
        keypoints: usize,
        descriptors: usize,
    },
    #[error("expected vectors of width {expected} but got {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// A text artifact that could not be parsed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("line {line}: {reason}")]
pub struct ParseError {
    pub line: usize,
    pub reason: String,
}

impl ParseError {
    pub(crate) fn new(line: usize, reason: impl Into<String>) -> Self {
        Self {
            line,
            reason: reason.into(),
        }
    }
}

/// A feature extractor failure.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no features were found in the image")]
    NoFeatures,
    #[error("keypoint and descriptor counts differ ({keypoints} != {descriptors})")]
    Misaligned {
        keypoints: usize,
        descriptors: usize,
    },
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

/// The reason a localization attempt ended without a pose.
#[derive(Debug, Error)]
pub enum LocalizeError {
    #[error("failed to extract query features: {0}")]
    Extraction(#[source] ExtractError),
    #[error("insufficient putative matches")]
    InsufficientPutativeMatches,
    #[error("insufficient geometric matches")]
    InsufficientGeometricMatches,
    #[error("not enough correspondences ({found} found)")]
    NotEnoughCorrespondences { found: usize },
    #[error("resection failed")]
    ResectionFailed,
}

impl LocalizeError {
    /// The last stage that completed before the failure.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Extraction(_) => Stage::Init,
            Self::InsufficientPutativeMatches => Stage::FeaturesExtracted,
            Self::InsufficientGeometricMatches => Stage::PutativeMatched,
            Self::NotEnoughCorrespondences { .. } | Self::ResectionFailed => {
                Stage::GeometricallyVerified
            }
        }
    }
}
