//! Narrows the views of a map to the candidates worth matching against a query.
//!
//! Three filters run in order, each on the output of the previous one:
//!
//! 1. a radius around a known location,
//! 2. beacon signal similarity,
//! 3. bag-of-words similarity.
//!
//! A filter is skipped when its inputs are missing. The result may be empty, in
//! which case the caller decides what to fall back to.

use crate::beacon::{score_view, select_views, BeaconTable};
use crate::bow::BowModel;
use crate::descriptor::{Descriptor, NeighborIndex};
use crate::error::ResourceError;
use crate::map::{Features, Map, ViewId};
use crate::settings::LocalizeSettings;
use cv_core::nalgebra::Point3;
use cv_core::{Pose, WorldToWorld};
use log::*;
use std::collections::BTreeSet;

/// A sphere in world coordinates that the query camera is known to be in.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Region {
    pub center: Point3<f64>,
    pub radius: f64,
}

/// What is known about the query image before matching.
pub struct CandidateQuery<'a, D> {
    pub features: &'a Features<D>,
    pub image_size: (u32, u32),
    /// The normalized beacon signature of the query
    pub beacon: Option<&'a [f32]>,
    pub region: Option<Region>,
}

/// The models and transforms available to the filters.
pub struct Filters<'a, I> {
    pub settings: &'a LocalizeSettings,
    pub beacons: Option<&'a BeaconTable>,
    pub bow: Option<&'a BowModel<I>>,
    /// Maps map coordinates into world coordinates
    pub map_to_world: Option<WorldToWorld>,
}

/// Keeps the posed views whose camera center lies within `region`.
pub fn radius_filter<D>(
    map: &Map<D>,
    candidates: &BTreeSet<ViewId>,
    region: Region,
    map_to_world: Option<WorldToWorld>,
) -> BTreeSet<ViewId> {
    candidates
        .iter()
        .copied()
        .filter(|&id| {
            map.view(id)
                .and_then(|view| view.center())
                .map(|center| match map_to_world {
                    Some(transform) => transform.isometry() * center,
                    None => center,
                })
                .map_or(false, |center| {
                    (center - region.center).norm() <= region.radius
                })
        })
        .collect()
}

/// Keeps up to `knn` of the views with the most similar beacon signatures.
///
/// Views without a recorded signature or rejected by co-occurrence are ranked last
/// with an infinite distance, so they still count towards the decimation step.
pub fn beacon_filter<D>(
    map: &Map<D>,
    candidates: &BTreeSet<ViewId>,
    table: &BeaconTable,
    query: &[f32],
    knn: usize,
    settings: &LocalizeSettings,
) -> BTreeSet<ViewId> {
    let scored: Vec<(ViewId, f32)> = candidates
        .iter()
        .map(|&id| {
            let distance = table.signature(id).map_or(f32::INFINITY, |signature| {
                let has_pose = map.view(id).map_or(false, |view| view.pose.is_some());
                score_view(query, signature, has_pose, settings).distance
            });
            (id, distance)
        })
        .collect();
    debug!(
        "{} of {} views accepted by beacon co-occurrence",
        scored.iter().filter(|(_, distance)| distance.is_finite()).count(),
        scored.len()
    );
    select_views(&scored, knn, settings.beacon_skip_frame)
        .into_iter()
        .collect()
}

/// Keeps the `knn` views whose bag-of-words vectors are nearest to the query.
///
/// Views without an encoded vector are not eligible.
pub fn bow_filter<D, I>(
    bow: &BowModel<I>,
    candidates: &BTreeSet<ViewId>,
    features: &Features<D>,
    image_size: (u32, u32),
    knn: usize,
) -> Result<BTreeSet<ViewId>, ResourceError>
where
    D: Descriptor,
    I: NeighborIndex<Vec<f32>> + Sync,
{
    let query = bow.encode_features(features, image_size)?;
    let (ids, vectors): (Vec<ViewId>, Vec<Vec<f32>>) = candidates
        .iter()
        .filter_map(|&id| bow.vector(id).map(|vector| (id, vector.clone())))
        .unzip();
    if let Some(vector) = vectors.iter().find(|v| v.len() != query.len()) {
        return Err(ResourceError::DimensionMismatch {
            expected: query.len(),
            found: vector.len(),
        });
    }
    let index = I::build(&vectors);
    Ok(index
        .knn(&query, knn)
        .into_iter()
        .map(|neighbor| ids[neighbor.index])
        .collect())
}

/// Runs every applicable filter over all of the views in the map.
pub fn retrieve_candidates<D, I>(
    map: &Map<D>,
    query: &CandidateQuery<'_, D>,
    filters: &Filters<'_, I>,
) -> BTreeSet<ViewId>
where
    D: Descriptor,
    I: NeighborIndex<Vec<f32>> + Sync,
{
    let settings = filters.settings;
    let mut candidates: BTreeSet<ViewId> = map.view_ids().collect();

    if let Some(region) = query.region {
        candidates = radius_filter(map, &candidates, region, filters.map_to_world);
        info!("{} views within {} of the query region", candidates.len(), region.radius);
    }

    match (filters.beacons, query.beacon, settings.beacon_knn) {
        (Some(table), Some(signature), Some(knn)) => {
            candidates = beacon_filter(map, &candidates, table, signature, knn, settings);
            info!("{} views selected by beacons", candidates.len());
        }
        (_, _, None) => {}
        _ => debug!("beacon filter skipped"),
    }

    match (filters.bow, settings.bow_knn) {
        (Some(bow), Some(knn)) if candidates.len() > knn => {
            match bow_filter(bow, &candidates, query.features, query.image_size, knn) {
                Ok(selected) => {
                    candidates = selected;
                    info!("{} views selected by bag of words", candidates.len());
                }
                Err(e) => warn!("bag of words filter skipped: {}", e),
            }
        }
        (None, Some(_)) => debug!("bag of words filter skipped"),
        _ => {}
    }

    candidates
}
