//! # `cv-localize`
//!
//! Locates a query image within a map reconstructed from reference views.
//!
//! A query is localized in stages. Candidate views are first retrieved from the map
//! with a radius around a known location, beacon signal similarity, and
//! bag-of-words similarity. The query descriptors are then matched against each
//! candidate, the matches are verified with two-view geometry, and the surviving
//! matches are composed with the landmarks of the map into 2d-3d correspondences.
//! Finally the camera pose is resected from the correspondences.
//!
//! ## Modules
//! * [`bow`] - spatial pyramid bag-of-words encoding
//! * [`beacon`] - beacon signal signatures and similarity
//! * [`retrieval`] - candidate view retrieval
//! * [`matching`] - ratio test matching and track propagation
//! * [`geometry`] - geometric verification and pose resection
//! * [`localize`] - the localization pipeline
//!
//! ```no_run
//! use cv_localize::{
//!     AkazeExtractor, ConsensusPoseSolver, EssentialFilter, LocalizeRequest, LocalizeSettings,
//!     CameraIntrinsics, Localizer, Map,
//! };
//! use bitarray::BitArray;
//! use rand::{rngs::SmallRng, SeedableRng};
//!
//! let map: Map<BitArray<64>> = Map::new();
//! let settings = LocalizeSettings::default();
//! let camera = CameraIntrinsics::identity().focal(800.0);
//! let mut localizer: Localizer<_, _, _, _> = Localizer::new(
//!     map,
//!     camera,
//!     AkazeExtractor::default(),
//!     EssentialFilter::arrsac(settings.geometric_consensus_threshold, SmallRng::seed_from_u64(0)),
//!     ConsensusPoseSolver::arrsac(
//!         settings.resection_consensus_threshold,
//!         SmallRng::seed_from_u64(1),
//!     ),
//!     settings,
//! );
//! let image = image::open("query.png").unwrap();
//! let localization = localizer.localize(&image, &LocalizeRequest::new());
//! ```

pub mod beacon;
pub mod bow;
pub mod descriptor;
mod error;
mod extract;
pub mod geometry;
pub mod localize;
mod map;
pub mod matching;
pub mod retrieval;
mod settings;

pub use error::*;
pub use extract::*;
pub use localize::{BeaconInput, Diagnostics, Localization, LocalizeRequest, Localizer, Stage};
pub use map::*;
pub use settings::*;

pub use cv_pinhole::CameraIntrinsics;
pub use geometry::{ConsensusPoseSolver, EssentialFilter, GeometricFilter, PoseSolver};
