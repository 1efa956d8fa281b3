//! Geometric verification of matches and pose resection.
//!
//! Both stages are sample consensus problems. The consensus algorithm is supplied by
//! the caller so that its thresholds, iteration limits and random number generator
//! are configured in one place.

use crate::map::LandmarkKey;
use crate::matching::Match;
use arrsac::Arrsac;
use cv_core::nalgebra::Point3;
use cv_core::sample_consensus::{Consensus, Estimator};
use cv_core::{
    CameraModel, FeatureMatch, FeatureWorldMatch, KeyPoint, WorldPoint,
    WorldToCamera,
};
use cv_pinhole::{CameraIntrinsics, NormalizedKeyPoint};
use eight_point::EightPoint;
use lambda_twist::LambdaTwist;
use log::*;
use rand::RngCore;

/// Removes matches between two views that are inconsistent with a rigid two-view geometry.
pub trait GeometricFilter {
    /// Returns the subset of `matches` that agree with the estimated geometry.
    ///
    /// Match `a` indices refer to `a_keypoints` and `b` indices to `b_keypoints`.
    fn filter(
        &mut self,
        a_camera: &CameraIntrinsics,
        a_keypoints: &[KeyPoint],
        b_camera: &CameraIntrinsics,
        b_keypoints: &[KeyPoint],
        matches: &[Match],
    ) -> Vec<Match>;
}

/// Filters matches with the inliers of an essential matrix estimated by sample consensus.
pub struct EssentialFilter<C, EE> {
    consensus: C,
    estimator: EE,
}

impl<C, EE> EssentialFilter<C, EE> {
    pub fn new(consensus: C, estimator: EE) -> Self {
        Self {
            consensus,
            estimator,
        }
    }
}

impl<R> EssentialFilter<Arrsac<R>, EightPoint>
where
    R: RngCore,
{
    /// ARRSAC with the eight point algorithm.
    pub fn arrsac(threshold: f64, rng: R) -> Self {
        Self::new(Arrsac::new(threshold, rng), EightPoint::new())
    }
}

impl<C, EE> GeometricFilter for EssentialFilter<C, EE>
where
    C: Consensus<EE, FeatureMatch<NormalizedKeyPoint>>,
    EE: Estimator<FeatureMatch<NormalizedKeyPoint>>,
{
    fn filter(
        &mut self,
        a_camera: &CameraIntrinsics,
        a_keypoints: &[KeyPoint],
        b_camera: &CameraIntrinsics,
        b_keypoints: &[KeyPoint],
        matches: &[Match],
    ) -> Vec<Match> {
        if matches.len() < EE::MIN_SAMPLES {
            return vec![];
        }
        let bearings: Vec<FeatureMatch<NormalizedKeyPoint>> = matches
            .iter()
            .map(|m| {
                FeatureMatch(
                    a_camera.calibrate(a_keypoints[m.a]),
                    b_camera.calibrate(b_keypoints[m.b]),
                )
            })
            .collect();
        match self
            .consensus
            .model_inliers(&self.estimator, bearings.iter().copied())
        {
            Some((_, inliers)) => {
                let mut inliers: Vec<usize> = inliers.into_iter().collect();
                inliers.sort_unstable();
                inliers.into_iter().map(|ix| matches[ix]).collect()
            }
            None => {
                debug!("no essential matrix found for {} matches", matches.len());
                vec![]
            }
        }
    }
}

/// A query feature associated with a landmark of the map.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Correspondence {
    /// The index of the query feature
    pub feature: usize,
    /// The pixel location of the query feature
    pub keypoint: KeyPoint,
    /// The landmark position in map coordinates
    pub point: Point3<f64>,
    pub landmark: LandmarkKey,
    /// The match distance the association was made with
    pub distance: f32,
}

/// Estimates the pose of a camera from 2d-3d correspondences.
pub trait PoseSolver {
    /// Returns the pose and the indices of the inlier correspondences.
    fn solve(
        &mut self,
        camera: &CameraIntrinsics,
        correspondences: &[Correspondence],
    ) -> Option<(WorldToCamera, Vec<usize>)>;
}

/// Resection with a perspective-n-point estimator inside sample consensus.
pub struct ConsensusPoseSolver<C, PE> {
    consensus: C,
    estimator: PE,
}

impl<C, PE> ConsensusPoseSolver<C, PE> {
    pub fn new(consensus: C, estimator: PE) -> Self {
        Self {
            consensus,
            estimator,
        }
    }
}

impl<R> ConsensusPoseSolver<Arrsac<R>, LambdaTwist>
where
    R: RngCore,
{
    /// ARRSAC with the lambda twist P3P solver.
    pub fn arrsac(threshold: f64, rng: R) -> Self {
        Self::new(Arrsac::new(threshold, rng), LambdaTwist::new())
    }
}

impl<C, PE> PoseSolver for ConsensusPoseSolver<C, PE>
where
    C: Consensus<PE, FeatureWorldMatch<NormalizedKeyPoint>>,
    PE: Estimator<FeatureWorldMatch<NormalizedKeyPoint>, Model = WorldToCamera>,
{
    fn solve(
        &mut self,
        camera: &CameraIntrinsics,
        correspondences: &[Correspondence],
    ) -> Option<(WorldToCamera, Vec<usize>)> {
        if correspondences.len() < PE::MIN_SAMPLES {
            return None;
        }
        let samples: Vec<FeatureWorldMatch<NormalizedKeyPoint>> = correspondences
            .iter()
            .map(|c| {
                FeatureWorldMatch(
                    camera.calibrate(c.keypoint),
                    WorldPoint(c.point.to_homogeneous()),
                )
            })
            .collect();
        let (pose, inliers) = self
            .consensus
            .model_inliers(&self.estimator, samples.iter().copied())?;
        let mut inliers: Vec<usize> = inliers.into_iter().collect();
        inliers.sort_unstable();
        Some((pose, inliers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use cv_core::nalgebra::{Point2, Rotation3, Vector3};
    use cv_core::Pose;
    use rand::{rngs::SmallRng, Rng, SeedableRng};
    use slotmap::SlotMap;

    fn camera() -> CameraIntrinsics {
        CameraIntrinsics::identity()
            .focal(500.0)
            .principal_point(Point2::new(320.0, 240.0))
    }

    #[test]
    fn too_few_matches_are_rejected() {
        let mut filter = EssentialFilter::arrsac(1e-3, SmallRng::seed_from_u64(0));
        let keypoints = vec![KeyPoint(Point2::new(10.0, 10.0)); 4];
        let matches: Vec<Match> = (0..4)
            .map(|i| Match {
                a: i,
                b: i,
                distance: 0.0,
            })
            .collect();
        let camera = camera();
        assert!(filter
            .filter(&camera, &keypoints, &camera, &keypoints, &matches)
            .is_empty());
    }

    #[test]
    fn essential_filter_removes_mismatches() {
        let mut rng = SmallRng::seed_from_u64(1);
        let camera = camera();
        let relative = WorldToCamera::from_parts(
            Vector3::new(-1.0, 0.1, 0.05),
            Rotation3::from_euler_angles(0.02, 0.08, -0.01),
        );
        let project = |p: Point3<f64>| {
            KeyPoint(Point2::new(
                p.x / p.z * 500.0 + 320.0,
                p.y / p.z * 500.0 + 240.0,
            ))
        };
        let points: Vec<Point3<f64>> = (0..60)
            .map(|_| {
                Point3::new(
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(5.0..10.0),
                )
            })
            .collect();
        let a_keypoints: Vec<KeyPoint> = points.iter().map(|&p| project(p)).collect();
        let b_keypoints: Vec<KeyPoint> = points
            .iter()
            .map(|&p| project(relative.isometry() * p))
            .collect();

        let mut matches: Vec<Match> = (0..60)
            .map(|i| Match {
                a: i,
                b: i,
                distance: 1.0,
            })
            .collect();
        // Pair the first features with the wrong feature in the other view.
        let outliers: Vec<Match> = (0..12)
            .map(|i| Match {
                a: i,
                b: (i + 29) % 60,
                distance: 1.0,
            })
            .collect();
        matches.extend(&outliers);

        let mut filter = EssentialFilter::arrsac(1e-7, SmallRng::seed_from_u64(0));
        let kept = filter.filter(&camera, &a_keypoints, &camera, &b_keypoints, &matches);
        assert!(kept.iter().all(|m| !outliers.contains(m)));
        assert!(kept.len() >= 50, "only {} matches kept", kept.len());
    }

    #[test]
    fn resection_recovers_pose() {
        let mut rng = SmallRng::seed_from_u64(3);
        let camera = camera();
        let pose = WorldToCamera::from_parts(
            Vector3::new(0.1, -0.2, 0.3),
            Rotation3::from_euler_angles(0.05, -0.1, 0.02),
        );
        let mut keys: SlotMap<LandmarkKey, ()> = SlotMap::with_key();
        let correspondences: Vec<Correspondence> = (0..40)
            .map(|feature| {
                let point = Point3::new(
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(4.0..8.0),
                );
                let world = pose.inverse().isometry() * point;
                let keypoint = KeyPoint(Point2::new(
                    point.x / point.z * 500.0 + 320.0,
                    point.y / point.z * 500.0 + 240.0,
                ));
                Correspondence {
                    feature,
                    keypoint,
                    point: world,
                    landmark: keys.insert(()),
                    distance: 0.0,
                }
            })
            .collect();
        let mut solver = ConsensusPoseSolver::arrsac(1e-6, SmallRng::seed_from_u64(0));
        let (estimate, inliers) = solver.solve(&camera, &correspondences).unwrap();
        assert!(inliers.len() >= 35);
        assert_relative_eq!(
            estimate.isometry().to_homogeneous(),
            pose.isometry().to_homogeneous(),
            epsilon = 1e-6
        );
    }

    #[test]
    fn pose_solver_needs_three_points() {
        let mut solver = ConsensusPoseSolver::arrsac(1e-6, SmallRng::seed_from_u64(0));
        assert!(solver.solve(&camera(), &[]).is_none());
    }
}
