//! Descriptor matching between images.
//!
//! All matching is based on the ratio test: the nearest neighbor of a
//! descriptor is only accepted when it is clearly closer than the second
//! nearest neighbor.

use crate::descriptor::{Descriptor, NeighborIndex};
use crate::map::ViewId;
use itertools::Itertools;
use log::*;
use rayon::prelude::*;
use std::collections::HashMap;

/// A match from feature `a` of the searching set to feature `b` of the searched set.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Match {
    pub a: usize,
    pub b: usize,
    pub distance: f32,
}

/// The matches between two views, computed by searching from `a` into `b`.
#[derive(Debug, Clone, PartialEq)]
pub struct PairMatches {
    pub a: ViewId,
    pub b: ViewId,
    pub matches: Vec<Match>,
}

/// Matches each descriptor of `a` to `index` with the ratio test.
///
/// The best neighbor is accepted when `d0 / d1 < ratio` and the second neighbor exists.
pub fn ratio_matches<D, I>(a: &[D], index: &I, ratio: f32) -> Vec<Match>
where
    D: Descriptor,
    I: NeighborIndex<D>,
{
    a.iter()
        .enumerate()
        .filter_map(|(aix, descriptor)| {
            let knn = index.knn(descriptor, 2);
            match knn.as_slice() {
                [best, second, ..] if second.distance.is_finite() => {
                    // A zero second distance means both neighbors are identical.
                    (second.distance > 0.0 && best.distance / second.distance < ratio).then(|| {
                        Match {
                            a: aix,
                            b: best.index,
                            distance: best.distance,
                        }
                    })
                }
                _ => None,
            }
        })
        .collect()
}

/// Drops every match whose `b` feature is claimed by more than one match.
pub fn unique_matches(mut matches: Vec<Match>) -> Vec<Match> {
    let counts = matches.iter().map(|m| m.b).counts();
    matches.retain(|m| counts[&m.b] == 1);
    matches
}

/// Matches two descriptor sets with the ratio test and a one-to-one constraint.
///
/// Returns no matches when either set has fewer than 2 descriptors.
pub fn match_pair<D, I>(a: &[D], b: &[D], ratio: f32) -> Vec<Match>
where
    D: Descriptor,
    I: NeighborIndex<D>,
{
    if a.len() < 2 || b.len() < 2 {
        return vec![];
    }
    let index = I::build(b);
    unique_matches(ratio_matches(a, &index, ratio))
}

/// Matches a sequence of frames and propagates matches along tracks.
///
/// Consecutive frames are matched directly with [`match_pair`]. Each frame is then
/// matched to every frame less than `max_frame_distance` ahead of it by following
/// the consecutive matches. A feature reaches a frame only if its chain is unbroken at
/// every frame in between.
pub fn track_sequence<D, I>(
    frames: &[(ViewId, &[D])],
    max_frame_distance: usize,
    ratio: f32,
) -> Vec<PairMatches>
where
    D: Descriptor,
    I: NeighborIndex<D>,
{
    let consecutive: Vec<Vec<Match>> = frames
        .par_windows(2)
        .map(|pair| match_pair::<D, I>(pair[0].1, pair[1].1, ratio))
        .collect();

    // next[f][i] is the feature of frame f + 1 that feature i of frame f matches.
    let next: Vec<Vec<Option<usize>>> = consecutive
        .iter()
        .zip(frames)
        .map(|(matches, &(_, descriptors))| {
            let mut pointers = vec![None; descriptors.len()];
            for m in matches {
                pointers[m.a] = Some(m.b);
            }
            pointers
        })
        .collect();

    let mut output: Vec<PairMatches> = consecutive
        .into_iter()
        .zip(frames.iter().tuple_windows())
        .map(|(matches, (&(a, _), &(b, _)))| PairMatches { a, b, matches })
        .collect();

    for (frame, &(a, descriptors)) in frames.iter().enumerate() {
        // Where each feature of this frame is tracked to in the current target frame.
        let mut tracked: Vec<Option<usize>> = (0..descriptors.len()).map(Some).collect();
        if let Some(pointers) = next.get(frame) {
            tracked.iter_mut().for_each(|t| *t = t.and_then(|i| pointers[i]));
        }
        let last = (frame + max_frame_distance).min(frames.len());
        for to in frame + 2..last {
            for t in tracked.iter_mut() {
                *t = t.and_then(|i| next[to - 1][i]);
            }
            let matches: Vec<Match> = tracked
                .iter()
                .enumerate()
                .filter_map(|(aix, &t)| {
                    t.map(|bix| Match {
                        a: aix,
                        b: bix,
                        distance: 0.0,
                    })
                })
                .collect();
            if !matches.is_empty() {
                output.push(PairMatches {
                    a,
                    b: frames[to].0,
                    matches,
                });
            }
        }
    }
    debug!("tracked {} frame pairs", output.len());
    output
}

/// The matches from candidate views to a query image.
#[derive(Debug, Clone, Default)]
pub struct QueryMatches {
    /// Matches searched from each candidate (`a`) into the query (`b`).
    pub pairs: Vec<PairMatches>,
    /// The smallest match distance of each matched query feature.
    pub feature_distance: HashMap<usize, f32>,
}

/// Matches the descriptors of each candidate view into the query descriptors.
///
/// One query index is built per worker thread and reused for all of the candidates
/// that worker handles. Only the ratio test is applied. Candidates without
/// descriptors are skipped, and nothing is matched if the query has fewer than 2.
pub fn match_to_query<D, I>(
    candidates: &[(ViewId, &[D])],
    query: (ViewId, &[D]),
    ratio: f32,
) -> QueryMatches
where
    D: Descriptor,
    I: NeighborIndex<D> + Send,
{
    let (query_id, query) = query;
    if query.len() < 2 {
        return QueryMatches::default();
    }
    let pairs: Vec<PairMatches> = candidates
        .par_iter()
        .map_init(
            || I::build(query),
            |index, &(view, descriptors)| PairMatches {
                a: view,
                b: query_id,
                matches: ratio_matches(descriptors, index, ratio),
            },
        )
        .filter(|pair| !pair.matches.is_empty())
        .collect();

    let mut feature_distance: HashMap<usize, f32> = HashMap::new();
    for m in pairs.iter().flat_map(|pair| &pair.matches) {
        feature_distance
            .entry(m.b)
            .and_modify(|d| *d = d.min(m.distance))
            .or_insert(m.distance);
    }
    QueryMatches {
        pairs,
        feature_distance,
    }
}
