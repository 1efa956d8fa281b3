//! Descriptors and the nearest-neighbor indices used to search them.
//!
//! Every search in this crate goes through [`NeighborIndex`], which is built
//! once over a set of points and then queried for the `k` nearest points of a
//! query. Two indices are provided:
//!
//! * [`LinearIndex`] performs an exhaustive search with [`space::LinearKnn`].
//!   It is exact and is the right choice for small sets such as vocabularies.
//! * [`GraphIndex`] wraps an [`hgg::HggLite`] graph and performs approximate
//!   search. It is the default for matching image descriptors.

use bitarray::{BitArray, Hamming};
use hgg::HggLite as Hgg;
use space::{Knn, KnnInsert, KnnMap, LinearKnn, Metric};

/// A local feature descriptor that can be searched with a [`space::Metric`].
///
/// The metric unit is always a `u32` so that all indices in this crate share the
/// same integer ordering. Real valued descriptors encode their distance with
/// [`f32::to_bits`], which preserves ordering for non-negative floats.
pub trait Descriptor: Clone + Send + Sync {
    type Metric: Metric<Self, Unit = u32>;

    /// Creates the metric used to compare this descriptor.
    fn metric() -> Self::Metric;

    /// Converts a metric unit into a real distance.
    fn unit_distance(unit: u32) -> f32;

    /// Expands the descriptor into a real vector.
    ///
    /// This is used to feed binary descriptors into the bag-of-words encoder,
    /// which operates on real vectors.
    fn to_floats(&self) -> Vec<f32>;
}

impl<const B: usize> Descriptor for BitArray<B> {
    type Metric = Hamming;

    fn metric() -> Hamming {
        Hamming
    }

    fn unit_distance(unit: u32) -> f32 {
        unit as f32
    }

    fn to_floats(&self) -> Vec<f32> {
        self.bytes()
            .iter()
            .flat_map(|&byte| (0..8).map(move |bit| ((byte >> bit) & 1) as f32))
            .collect()
    }
}

/// The euclidean distance between two real vectors of the same length.
#[derive(Copy, Clone, Debug, Default)]
pub struct Euclidean;

impl Metric<Vec<f32>> for Euclidean {
    type Unit = u32;

    fn distance(&self, a: &Vec<f32>, b: &Vec<f32>) -> u32 {
        squared_distance(a, b).sqrt().to_bits()
    }
}

impl Descriptor for Vec<f32> {
    type Metric = Euclidean;

    fn metric() -> Euclidean {
        Euclidean
    }

    fn unit_distance(unit: u32) -> f32 {
        f32::from_bits(unit)
    }

    fn to_floats(&self) -> Vec<f32> {
        self.clone()
    }
}

pub(crate) fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(&a, &b)| (a - b) * (a - b)).sum()
}

/// A neighbor returned from a [`NeighborIndex`] search.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Neighbor {
    /// The index of the point in the slice the index was built from.
    pub index: usize,
    /// The distance from the query to the point.
    pub distance: f32,
}

/// A k-nearest-neighbor index over a fixed set of points.
pub trait NeighborIndex<D>: Sized {
    /// Builds the index. The indices returned by searches refer to `points`.
    fn build(points: &[D]) -> Self;

    /// Finds up to `k` neighbors of `query` sorted by ascending distance.
    fn knn(&self, query: &D, k: usize) -> Vec<Neighbor>;

    /// The number of points in the index.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exact exhaustive search.
#[derive(Clone, Debug)]
pub struct LinearIndex<D> {
    points: Vec<D>,
}

impl<D> NeighborIndex<D> for LinearIndex<D>
where
    D: Descriptor,
{
    fn build(points: &[D]) -> Self {
        Self {
            points: points.to_vec(),
        }
    }

    fn knn(&self, query: &D, k: usize) -> Vec<Neighbor> {
        let knn = LinearKnn {
            metric: D::metric(),
            iter: self.points.iter(),
        };
        knn.knn(query, k)
            .into_iter()
            .map(|neighbor| Neighbor {
                index: neighbor.index,
                distance: D::unit_distance(neighbor.distance),
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.points.len()
    }
}

/// Approximate search over a hierarchical greedy graph.
pub struct GraphIndex<D: Descriptor> {
    hgg: Hgg<D::Metric, D, usize>,
}

impl<D> NeighborIndex<D> for GraphIndex<D>
where
    D: Descriptor,
{
    fn build(points: &[D]) -> Self {
        let mut hgg = Hgg::new(D::metric()).insert_knn(32);
        for (ix, point) in points.iter().enumerate() {
            hgg.insert(point.clone(), ix);
        }
        Self { hgg }
    }

    fn knn(&self, query: &D, k: usize) -> Vec<Neighbor> {
        if self.hgg.len() == 0 {
            return vec![];
        }
        self.hgg
            .knn(query, k)
            .into_iter()
            .filter_map(|neighbor| {
                // The value stored with each key is its position in the source slice.
                self.hgg.get_value(neighbor.index).map(|&index| Neighbor {
                    index,
                    distance: D::unit_distance(neighbor.distance),
                })
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.hgg.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_knn_sorted_by_distance() {
        let points = vec![
            vec![0.0, 0.0],
            vec![3.0, 4.0],
            vec![1.0, 0.0],
            vec![0.0, 2.0],
        ];
        let index = LinearIndex::build(&points);
        let knn = index.knn(&vec![0.0, 0.0], 3);
        assert_eq!(
            knn.iter().map(|n| n.index).collect::<Vec<_>>(),
            vec![0, 2, 3]
        );
        assert_eq!(knn[0].distance, 0.0);
        assert_eq!(knn[1].distance, 1.0);
        assert_eq!(knn[2].distance, 2.0);
    }

    #[test]
    fn hamming_distance_as_float() {
        let mut a = BitArray::<64>::zeros();
        let b = BitArray::<64>::zeros();
        a.bytes_mut()[0] = 0b0000_0111;
        let index = LinearIndex::build(&[b]);
        let knn = index.knn(&a, 2);
        assert_eq!(knn.len(), 1);
        assert_eq!(knn[0].distance, 3.0);
    }

    #[test]
    fn binary_descriptor_unpacks_bits() {
        let mut a = BitArray::<2>::zeros();
        a.bytes_mut()[0] = 0b0000_0101;
        a.bytes_mut()[1] = 0b1000_0000;
        let floats = a.to_floats();
        assert_eq!(floats.len(), 16);
        assert_eq!(floats[0], 1.0);
        assert_eq!(floats[1], 0.0);
        assert_eq!(floats[2], 1.0);
        assert_eq!(floats[15], 1.0);
        assert_eq!(floats.iter().sum::<f32>(), 3.0);
    }
}
