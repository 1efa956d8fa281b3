use crate::beacon::BeaconNormalization;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The settings for a localization session.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct LocalizeSettings {
    /// The maximum ratio between the best and second best descriptor distance for a putative match
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_match_ratio"))]
    pub match_ratio: f32,
    /// The minimum number of putative matches a candidate view needs to be kept
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_min_putative_matches")
    )]
    pub min_putative_matches: usize,
    /// Resection is only attempted with more correspondences than this
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_min_resection_points")
    )]
    pub min_resection_points: usize,
    /// The minimum number of inliers for a resected pose to be accepted
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_min_resection_inliers")
    )]
    pub min_resection_inliers: usize,
    /// The number of views kept by bag-of-words retrieval, or `None` to disable it
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_bow_knn"))]
    pub bow_knn: Option<usize>,
    /// The number of views kept by the beacon filter, or `None` to disable it
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_beacon_knn"))]
    pub beacon_knn: Option<usize>,
    /// Take every n-th view of the beacon ranking to avoid adjacent video frames
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_beacon_skip_frame")
    )]
    pub beacon_skip_frame: usize,
    /// The co-occurrence above which a view is a beacon candidate
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_beacon_cooccurrence_ratio")
    )]
    pub beacon_cooccurrence_ratio: f32,
    /// The signal strength above which a beacon counts towards co-occurrence
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_beacon_cooccurrence_threshold")
    )]
    pub beacon_cooccurrence_threshold: f32,
    /// The minimum number of beacons seen by both signatures to compute a distance
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_beacon_min_same")
    )]
    pub beacon_min_same: usize,
    /// How beacon signatures are normalized
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_beacon_normalization")
    )]
    pub beacon_normalization: BeaconNormalization,
    /// The threshold used for two-view sample consensus
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_geometric_consensus_threshold")
    )]
    pub geometric_consensus_threshold: f64,
    /// The threshold used for resection sample consensus
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_resection_consensus_threshold")
    )]
    pub resection_consensus_threshold: f64,
}

impl Default for LocalizeSettings {
    fn default() -> Self {
        Self {
            match_ratio: default_match_ratio(),
            min_putative_matches: default_min_putative_matches(),
            min_resection_points: default_min_resection_points(),
            min_resection_inliers: default_min_resection_inliers(),
            bow_knn: default_bow_knn(),
            beacon_knn: default_beacon_knn(),
            beacon_skip_frame: default_beacon_skip_frame(),
            beacon_cooccurrence_ratio: default_beacon_cooccurrence_ratio(),
            beacon_cooccurrence_threshold: default_beacon_cooccurrence_threshold(),
            beacon_min_same: default_beacon_min_same(),
            beacon_normalization: default_beacon_normalization(),
            geometric_consensus_threshold: default_geometric_consensus_threshold(),
            resection_consensus_threshold: default_resection_consensus_threshold(),
        }
    }
}

impl LocalizeSettings {
    pub fn match_ratio(self, match_ratio: f32) -> Self {
        Self {
            match_ratio,
            ..self
        }
    }

    pub fn min_putative_matches(self, min_putative_matches: usize) -> Self {
        Self {
            min_putative_matches,
            ..self
        }
    }

    pub fn min_resection_inliers(self, min_resection_inliers: usize) -> Self {
        Self {
            min_resection_inliers,
            ..self
        }
    }

    pub fn bow_knn(self, bow_knn: Option<usize>) -> Self {
        Self { bow_knn, ..self }
    }

    pub fn beacon_knn(self, beacon_knn: Option<usize>) -> Self {
        Self { beacon_knn, ..self }
    }

    pub fn beacon_skip_frame(self, beacon_skip_frame: usize) -> Self {
        Self {
            beacon_skip_frame,
            ..self
        }
    }

    pub fn beacon_normalization(self, beacon_normalization: BeaconNormalization) -> Self {
        Self {
            beacon_normalization,
            ..self
        }
    }
}

fn default_match_ratio() -> f32 {
    0.6
}

fn default_min_putative_matches() -> usize {
    16
}

fn default_min_resection_points() -> usize {
    8
}

fn default_min_resection_inliers() -> usize {
    10
}

fn default_bow_knn() -> Option<usize> {
    Some(100)
}

fn default_beacon_knn() -> Option<usize> {
    Some(800)
}

fn default_beacon_skip_frame() -> usize {
    1
}

fn default_beacon_cooccurrence_ratio() -> f32 {
    0.5
}

fn default_beacon_cooccurrence_threshold() -> f32 {
    10.0
}

fn default_beacon_min_same() -> usize {
    2
}

fn default_beacon_normalization() -> BeaconNormalization {
    BeaconNormalization::Median
}

fn default_geometric_consensus_threshold() -> f64 {
    1e-3
}

fn default_resection_consensus_threshold() -> f64 {
    1e-4
}
