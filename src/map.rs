//! The reconstructed map that query images are localized against.

use crate::error::ResourceError;
use cv_core::nalgebra::Point3;
use cv_core::{KeyPoint, Pose, WorldToCamera};
use cv_pinhole::CameraIntrinsics;
use derive_more::{Display, From, Into};
use log::*;
use rayon::prelude::*;
use slotmap::{new_key_type, SlotMap};
use std::collections::{BTreeMap, HashMap};
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

new_key_type! {
    pub struct LandmarkKey;
}

/// The identifier of a view in the map.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct ViewId(pub u32);

/// The identifier of a camera in the map.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraId(pub u32);

/// A reference image of the map.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct View {
    /// The image file the view was created from
    pub image: PathBuf,
    /// Width and height of the image in pixels
    pub size: (u32, u32),
    /// Pose of the view if it was reconstructed
    pub pose: Option<WorldToCamera>,
    /// The camera that captured the view
    pub camera: Option<CameraId>,
}

impl View {
    /// The optical center of the view in map coordinates.
    pub fn center(&self) -> Option<Point3<f64>> {
        self.pose
            .map(|pose| pose.inverse().isometry() * Point3::origin())
    }
}

/// An observation of a landmark by a feature of a view.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Observation {
    pub view: ViewId,
    pub feature: usize,
}

/// A 3d point in the map observed by two or more views.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Landmark {
    pub point: Point3<f64>,
    pub observations: Vec<Observation>,
}

/// The keypoints and descriptors of an image, index-aligned.
#[derive(Debug, Clone)]
pub struct Features<D> {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<D>,
}

impl<D> Features<D> {
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Whether every descriptor has a keypoint.
    pub fn is_aligned(&self) -> bool {
        self.keypoints.len() == self.descriptors.len()
    }

    fn check_aligned(&self, view: ViewId) -> Result<(), ResourceError> {
        if self.is_aligned() {
            Ok(())
        } else {
            Err(ResourceError::MisalignedFeatures {
                view,
                keypoints: self.keypoints.len(),
                descriptors: self.descriptors.len(),
            })
        }
    }
}

impl<D> Default for Features<D> {
    fn default() -> Self {
        Self {
            keypoints: vec![],
            descriptors: vec![],
        }
    }
}

/// Loads the features of a view on demand.
pub trait FeatureLoader<D>: Sync {
    fn load(&self, id: ViewId, view: &View) -> Result<Features<D>, ResourceError>;
}

impl<D, F> FeatureLoader<D> for F
where
    F: Fn(ViewId, &View) -> Result<Features<D>, ResourceError> + Sync,
{
    fn load(&self, id: ViewId, view: &View) -> Result<Features<D>, ResourceError> {
        self(id, view)
    }
}

/// Views, landmarks, and the cache of view features.
#[derive(Clone)]
pub struct Map<D> {
    views: BTreeMap<ViewId, View>,
    cameras: HashMap<CameraId, CameraIntrinsics>,
    landmarks: SlotMap<LandmarkKey, Landmark>,
    /// Maps a feature of a view to the landmark it observes.
    observations: HashMap<(ViewId, usize), LandmarkKey>,
    features: HashMap<ViewId, Arc<Features<D>>>,
}

impl<D> Default for Map<D> {
    fn default() -> Self {
        Self {
            views: BTreeMap::new(),
            cameras: HashMap::new(),
            landmarks: SlotMap::with_key(),
            observations: HashMap::new(),
            features: HashMap::new(),
        }
    }
}

impl<D> Map<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_view(&mut self, id: ViewId, view: View) {
        self.views.insert(id, view);
    }

    pub fn add_camera(&mut self, id: CameraId, camera: CameraIntrinsics) {
        self.cameras.insert(id, camera);
    }

    /// Adds a landmark and indexes its observations.
    pub fn add_landmark(&mut self, landmark: Landmark) -> LandmarkKey {
        let observations = landmark.observations.clone();
        let key = self.landmarks.insert(landmark);
        for Observation { view, feature } in observations {
            self.observations.insert((view, feature), key);
        }
        key
    }

    /// Caches the features of a view. Features whose keypoints and descriptors differ
    /// in count are rejected.
    pub fn insert_features(
        &mut self,
        id: ViewId,
        features: Features<D>,
    ) -> Result<(), ResourceError> {
        features.check_aligned(id)?;
        self.features.insert(id, Arc::new(features));
        Ok(())
    }

    pub fn view(&self, id: ViewId) -> Option<&View> {
        self.views.get(&id)
    }

    pub fn views(&self) -> impl Iterator<Item = (ViewId, &View)> + '_ {
        self.views.iter().map(|(&id, view)| (id, view))
    }

    pub fn view_ids(&self) -> impl Iterator<Item = ViewId> + '_ {
        self.views.keys().copied()
    }

    pub fn num_views(&self) -> usize {
        self.views.len()
    }

    pub fn camera(&self, id: CameraId) -> Option<&CameraIntrinsics> {
        self.cameras.get(&id)
    }

    /// The camera of a view, if the view has one.
    pub fn view_camera(&self, id: ViewId) -> Option<&CameraIntrinsics> {
        self.view(id)
            .and_then(|view| view.camera)
            .and_then(|camera| self.camera(camera))
    }

    pub fn landmark(&self, key: LandmarkKey) -> Option<&Landmark> {
        self.landmarks.get(key)
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmarks.len()
    }

    /// The landmark observed by a feature of a view.
    pub fn observed_landmark(&self, view: ViewId, feature: usize) -> Option<LandmarkKey> {
        self.observations.get(&(view, feature)).copied()
    }

    pub fn features(&self, id: ViewId) -> Option<&Arc<Features<D>>> {
        self.features.get(&id)
    }

    pub fn num_cached_features(&self) -> usize {
        self.features.len()
    }

    /// The id after the largest view id in the map.
    pub fn next_view_id(&self) -> ViewId {
        self.views
            .keys()
            .next_back()
            .map(|&ViewId(id)| ViewId(id + 1))
            .unwrap_or(ViewId(0))
    }
}

impl<D> Map<D>
where
    D: Send + Sync,
{
    /// Loads the features of any of `ids` that are not cached yet.
    ///
    /// Loading runs in parallel and the cache is only written once all loads finish.
    /// Views that fail to load or load misaligned features are logged and left uncached.
    pub fn load_features(&mut self, ids: &[ViewId], loader: &dyn FeatureLoader<D>) {
        let missing: Vec<(ViewId, &View)> = ids
            .iter()
            .filter(|&id| !self.features.contains_key(id))
            .filter_map(|&id| self.views.get(&id).map(|view| (id, view)))
            .collect();
        if missing.is_empty() {
            return;
        }
        info!("loading features for {} views", missing.len());
        let loaded: Vec<(ViewId, Result<Features<D>, ResourceError>)> = missing
            .par_iter()
            .map(|&(id, view)| {
                let result = loader
                    .load(id, view)
                    .and_then(|features| features.check_aligned(id).map(|_| features));
                (id, result)
            })
            .collect();
        for (id, result) in loaded {
            match result {
                Ok(features) => {
                    self.features.insert(id, Arc::new(features));
                }
                Err(e) => warn!("skipping view {}: {}", id, e),
            }
        }
    }
}

/// A query view temporarily inserted into the map.
///
/// The view and its features are removed from the map when the scope is dropped,
/// so the map returns to its previous state on every exit path.
pub struct QueryScope<'a, D> {
    map: &'a mut Map<D>,
    id: ViewId,
}

impl<'a, D> QueryScope<'a, D> {
    pub fn insert(map: &'a mut Map<D>, view: View, features: Features<D>) -> Self {
        let id = map.next_view_id();
        debug!("inserting query view {}", id);
        map.views.insert(id, view);
        map.features.insert(id, Arc::new(features));
        Self { map, id }
    }

    pub fn id(&self) -> ViewId {
        self.id
    }
}

impl<'a, D> Deref for QueryScope<'a, D> {
    type Target = Map<D>;

    fn deref(&self) -> &Map<D> {
        self.map
    }
}

impl<'a, D> DerefMut for QueryScope<'a, D> {
    fn deref_mut(&mut self) -> &mut Map<D> {
        self.map
    }
}

impl<'a, D> Drop for QueryScope<'a, D> {
    fn drop(&mut self) {
        debug!("removing query view {}", self.id);
        self.map.views.remove(&self.id);
        self.map.features.remove(&self.id);
    }
}
