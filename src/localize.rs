//! The localization pipeline.
//!
//! A call to [`Localizer::localize`] moves through the [`Stage`]s in order and stops
//! at the first stage without enough evidence to continue. The query image is
//! inserted into the map as a temporary view while it is matched, and it is removed
//! again before the call returns, whether it succeeded or not.

use crate::beacon::BeaconTable;
use crate::bow::BowModel;
use crate::descriptor::{Descriptor, GraphIndex, NeighborIndex};
use crate::error::{ConfigError, ExtractError, LocalizeError};
use crate::extract::FeatureExtractor;
use crate::geometry::{Correspondence, GeometricFilter, PoseSolver};
use crate::map::{FeatureLoader, Features, Map, QueryScope, View, ViewId};
use crate::matching::{match_to_query, PairMatches};
use crate::retrieval::{retrieve_candidates, CandidateQuery, Filters, Region};
use crate::settings::LocalizeSettings;
use cv_core::nalgebra::Point3;
use cv_core::{KeyPoint, Pose, WorldToCamera, WorldToWorld};
use cv_pinhole::CameraIntrinsics;
use image::{DynamicImage, GenericImageView};
use log::*;
use std::collections::{BTreeSet, HashMap};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

/// The stages of a localization attempt, in the order they are reached.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Init,
    CandidatesSelected,
    FeaturesExtracted,
    PutativeMatched,
    GeometricallyVerified,
    Resected,
    Done,
}

/// Beacon signals observed together with the query image.
#[derive(Debug, Clone, PartialEq)]
pub enum BeaconInput {
    /// An unparsed reading line
    Reading(String),
    /// A signature already laid out and normalized like the beacon table
    Signature(Vec<f32>),
}

/// The per-query inputs of [`Localizer::localize`].
#[derive(Debug, Clone, Default)]
pub struct LocalizeRequest {
    pub beacon: Option<BeaconInput>,
    pub region: Option<Region>,
    /// Return the inlier correspondences with the pose
    pub diagnostics: bool,
}

impl LocalizeRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn beacon(self, beacon: BeaconInput) -> Self {
        Self {
            beacon: Some(beacon),
            ..self
        }
    }

    pub fn region(self, region: Region) -> Self {
        Self {
            region: Some(region),
            ..self
        }
    }

    pub fn diagnostics(self, diagnostics: bool) -> Self {
        Self {
            diagnostics,
            ..self
        }
    }
}

/// The correspondences that support a localization, in world coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostics {
    /// The views that were matched against the query
    pub candidates: Vec<ViewId>,
    pub points_2d: Vec<KeyPoint>,
    pub points_3d: Vec<Point3<f64>>,
    /// The query feature index of each inlier
    pub inliers: Vec<usize>,
}

/// The result of a successful localization.
#[derive(Debug, Clone, PartialEq)]
pub struct Localization {
    /// Transforms world points into the query camera
    pub pose: WorldToCamera,
    /// The optical center of the query camera in world coordinates
    pub center: Point3<f64>,
    pub inliers: usize,
    pub diagnostics: Option<Diagnostics>,
}

/// A localization session over one map.
///
/// * `D` - the descriptor type of the map and query features
/// * `E` - extracts query features
/// * `G` - verifies the putative matches of a view pair
/// * `P` - resects the query pose
/// * `I` - the index used to search query descriptors
pub struct Localizer<D, E, G, P, I = GraphIndex<D>>
where
    D: Descriptor,
{
    map: Map<D>,
    settings: LocalizeSettings,
    /// The intrinsics of the query camera
    camera: CameraIntrinsics,
    extractor: E,
    geometric_filter: G,
    pose_solver: P,
    bow: Option<BowModel>,
    beacons: Option<BeaconTable>,
    /// Maps map coordinates into world coordinates
    map_to_world: Option<WorldToWorld>,
    loader: Option<Box<dyn FeatureLoader<D>>>,
    _index: PhantomData<I>,
}

impl<D, E, G, P, I> Localizer<D, E, G, P, I>
where
    D: Descriptor,
    E: FeatureExtractor<D>,
    G: GeometricFilter,
    P: PoseSolver,
    I: NeighborIndex<D> + Send,
{
    pub fn new(
        map: Map<D>,
        camera: CameraIntrinsics,
        extractor: E,
        geometric_filter: G,
        pose_solver: P,
        settings: LocalizeSettings,
    ) -> Self {
        Self {
            map,
            settings,
            camera,
            extractor,
            geometric_filter,
            pose_solver,
            bow: None,
            beacons: None,
            map_to_world: None,
            loader: None,
            _index: PhantomData,
        }
    }

    /// Enables bag-of-words retrieval.
    ///
    /// Fails if the configured knn would keep every view of the map.
    pub fn bow(self, bow: BowModel) -> Result<Self, ConfigError> {
        check_knn("bag of words", self.settings.bow_knn, self.map.num_views())?;
        Ok(Self {
            bow: Some(bow),
            ..self
        })
    }

    /// Enables the beacon filter.
    ///
    /// Fails if the configured knn would keep every view of the map.
    pub fn beacons(self, beacons: BeaconTable) -> Result<Self, ConfigError> {
        check_knn("beacon", self.settings.beacon_knn, self.map.num_views())?;
        Ok(Self {
            beacons: Some(beacons),
            ..self
        })
    }

    /// Set the transform from map coordinates into world coordinates.
    ///
    /// Default: identity
    pub fn map_to_world(self, map_to_world: WorldToWorld) -> Self {
        Self {
            map_to_world: Some(map_to_world),
            ..self
        }
    }

    /// Set the loader used for views whose features are not cached.
    pub fn loader(self, loader: impl FeatureLoader<D> + 'static) -> Self {
        Self {
            loader: Some(Box::new(loader)),
            ..self
        }
    }

    pub fn map(&self) -> &Map<D> {
        &self.map
    }

    pub fn settings(&self) -> &LocalizeSettings {
        &self.settings
    }

    /// Estimates the pose of the camera that captured `image`.
    pub fn localize(
        &mut self,
        image: &DynamicImage,
        request: &LocalizeRequest,
    ) -> Result<Localization, LocalizeError> {
        let features = self
            .extractor
            .extract(image)
            .map_err(LocalizeError::Extraction)?;
        if features.is_empty() {
            return Err(LocalizeError::Extraction(ExtractError::NoFeatures));
        }
        if !features.is_aligned() {
            return Err(LocalizeError::Extraction(ExtractError::Misaligned {
                keypoints: features.keypoints.len(),
                descriptors: features.descriptors.len(),
            }));
        }
        info!("extracted {} query features", features.len());

        let candidates = self.candidates(&features, image.dimensions(), request);
        info!("{:?}: {} candidate views", Stage::CandidatesSelected, candidates.len());

        let settings = self.settings;
        let camera = self.camera;
        let query_view = View {
            image: PathBuf::new(),
            size: image.dimensions(),
            pose: None,
            camera: None,
        };
        let mut scope = QueryScope::insert(&mut self.map, query_view, features);
        let query_id = scope.id();
        let query = scope
            .features(query_id)
            .cloned()
            .ok_or(LocalizeError::Extraction(ExtractError::NoFeatures))?;

        let ids: Vec<ViewId> = candidates.iter().copied().collect();
        if let Some(loader) = self.loader.as_deref() {
            scope.load_features(&ids, loader);
        }
        let candidate_features: HashMap<ViewId, Arc<Features<D>>> = ids
            .iter()
            .filter_map(|&id| match scope.features(id) {
                Some(features) => Some((id, features.clone())),
                None => {
                    warn!("no features for candidate view {}", id);
                    None
                }
            })
            .collect();
        info!(
            "{:?}: query view {} with {} candidate feature sets",
            Stage::FeaturesExtracted,
            query_id,
            candidate_features.len()
        );

        let slices: Vec<(ViewId, &[D])> = ids
            .iter()
            .filter_map(|id| {
                candidate_features
                    .get(id)
                    .map(|features| (*id, features.descriptors.as_slice()))
            })
            .collect();
        let putative = match_to_query::<D, I>(
            &slices,
            (query_id, query.descriptors.as_slice()),
            settings.match_ratio,
        );
        let putative: Vec<PairMatches> = resolve_conflicts(putative.pairs)
            .into_iter()
            .filter(|pair| pair.matches.len() >= settings.min_putative_matches)
            .collect();
        if putative.is_empty() {
            info!("no view has {} putative matches", settings.min_putative_matches);
            return Err(LocalizeError::InsufficientPutativeMatches);
        }
        info!(
            "{:?}: {} views with {} matches",
            Stage::PutativeMatched,
            putative.len(),
            putative.iter().map(|p| p.matches.len()).sum::<usize>()
        );

        let mut verified = Vec::with_capacity(putative.len());
        for pair in putative {
            let view_features = &candidate_features[&pair.a];
            let view_camera = scope.view_camera(pair.a).copied().unwrap_or(camera);
            let matches = self.geometric_filter.filter(
                &view_camera,
                &view_features.keypoints,
                &camera,
                &query.keypoints,
                &pair.matches,
            );
            debug!(
                "view {} kept {} of {} matches",
                pair.a,
                matches.len(),
                pair.matches.len()
            );
            if !matches.is_empty() {
                verified.push(PairMatches { matches, ..pair });
            }
        }
        if verified.is_empty() {
            return Err(LocalizeError::InsufficientGeometricMatches);
        }
        info!("{:?}: {} views", Stage::GeometricallyVerified, verified.len());

        let correspondences = assemble_correspondences(&scope, &verified, &query.keypoints);
        if correspondences.len() <= settings.min_resection_points {
            return Err(LocalizeError::NotEnoughCorrespondences {
                found: correspondences.len(),
            });
        }
        info!("resecting with {} correspondences", correspondences.len());

        let (map_pose, inliers) = self
            .pose_solver
            .solve(&camera, &correspondences)
            .ok_or(LocalizeError::ResectionFailed)?;
        if inliers.len() < settings.min_resection_inliers {
            info!("resection found only {} inliers", inliers.len());
            return Err(LocalizeError::ResectionFailed);
        }
        info!("{:?}: {} inliers", Stage::Resected, inliers.len());

        let (pose, to_world) = match self.map_to_world {
            Some(transform) => (
                WorldToCamera(map_pose.isometry() * transform.isometry().inverse()),
                transform.isometry(),
            ),
            None => (map_pose, WorldToWorld::identity().isometry()),
        };
        let center = pose.inverse().isometry() * Point3::origin();
        let diagnostics = request.diagnostics.then(|| Diagnostics {
            candidates: ids.clone(),
            points_2d: inliers
                .iter()
                .map(|&ix| correspondences[ix].keypoint)
                .collect(),
            points_3d: inliers
                .iter()
                .map(|&ix| to_world * correspondences[ix].point)
                .collect(),
            inliers: inliers
                .iter()
                .map(|&ix| correspondences[ix].feature)
                .collect(),
        });
        info!("{:?}: camera center {:?}", Stage::Done, center);
        Ok(Localization {
            pose,
            center,
            inliers: inliers.len(),
            diagnostics,
        })
    }

    fn candidates(
        &self,
        features: &Features<D>,
        image_size: (u32, u32),
        request: &LocalizeRequest,
    ) -> BTreeSet<ViewId> {
        let signature = match (&request.beacon, &self.beacons) {
            (Some(BeaconInput::Signature(signature)), _) => Some(signature.clone()),
            (Some(BeaconInput::Reading(line)), Some(table)) => {
                match table.parse_reading(line, self.settings.beacon_normalization) {
                    Ok(signature) => Some(signature),
                    Err(e) => {
                        warn!("ignoring beacon reading: {}", e);
                        None
                    }
                }
            }
            _ => None,
        };
        let query = CandidateQuery {
            features,
            image_size,
            beacon: signature.as_deref(),
            region: request.region,
        };
        let filters = Filters {
            settings: &self.settings,
            beacons: self.beacons.as_ref(),
            bow: self.bow.as_ref(),
            map_to_world: self.map_to_world,
        };
        let candidates = retrieve_candidates(&self.map, &query, &filters);
        if candidates.is_empty() {
            info!("no candidates selected, using all views");
            self.map.view_ids().collect()
        } else {
            candidates
        }
    }
}

fn check_knn(filter: &'static str, knn: Option<usize>, views: usize) -> Result<(), ConfigError> {
    match knn {
        Some(knn) if knn >= views => Err(ConfigError::KnnTooLarge { filter, knn, views }),
        _ => Ok(()),
    }
}

/// Keeps one match per query feature across all views.
///
/// The match with the smallest distance wins. Ties go to the view that comes first,
/// and within a view to the first match.
pub fn resolve_conflicts(mut pairs: Vec<PairMatches>) -> Vec<PairMatches> {
    pairs.sort_by_key(|pair| pair.a);
    // The winning (pair, match) position and distance of each query feature.
    let mut winners: HashMap<usize, ((usize, usize), f32)> = HashMap::new();
    for (pix, pair) in pairs.iter().enumerate() {
        for (mix, m) in pair.matches.iter().enumerate() {
            let best = winners.entry(m.b).or_insert(((pix, mix), m.distance));
            if m.distance < best.1 {
                *best = ((pix, mix), m.distance);
            }
        }
    }
    pairs
        .into_iter()
        .enumerate()
        .map(|(pix, pair)| {
            let matches = pair
                .matches
                .iter()
                .enumerate()
                .filter(|&(mix, m)| winners[&m.b].0 == (pix, mix))
                .map(|(_, &m)| m)
                .collect();
            PairMatches { matches, ..pair }
        })
        .collect()
}

/// Associates query features with the landmarks observed by their matched view features.
///
/// A query feature associated through several views keeps the association with the
/// smallest match distance.
fn assemble_correspondences<D>(
    map: &Map<D>,
    pairs: &[PairMatches],
    query_keypoints: &[KeyPoint],
) -> Vec<Correspondence> {
    let mut best: HashMap<usize, Correspondence> = HashMap::new();
    for pair in pairs {
        for m in &pair.matches {
            let landmark = match map.observed_landmark(pair.a, m.a) {
                Some(landmark) => landmark,
                None => continue,
            };
            let point = match map.landmark(landmark) {
                Some(landmark) => landmark.point,
                None => continue,
            };
            let correspondence = Correspondence {
                feature: m.b,
                keypoint: query_keypoints[m.b],
                point,
                landmark,
                distance: m.distance,
            };
            best.entry(m.b)
                .and_modify(|c| {
                    if correspondence.distance < c.distance {
                        *c = correspondence;
                    }
                })
                .or_insert(correspondence);
        }
    }
    let mut correspondences: Vec<Correspondence> = best.into_values().collect();
    correspondences.sort_by_key(|c| c.feature);
    correspondences
}
