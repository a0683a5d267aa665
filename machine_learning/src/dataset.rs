use std::ops::Range;

use ndarray::prelude::*;
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use rand_distr::{Distribution, Normal};

use crate::{MlErr, Result};

/// Splits `total` rows among `shards` and returns the range for `shard`.
///
/// Ranges are contiguous, disjoint, cover `[0..total)` and their sizes
/// differ by at most 1.
pub fn shard_range(total: usize, shard: usize, shards: usize) -> Range<usize> {
    assert!(shards > 0);
    assert!(shard < shards);

    let base = total / shards;
    let rem = total % shards;

    let start = shard * base + shard.min(rem);
    let extra = if shard < rem { 1 } else { 0 };
    let end = start + base + extra;

    start..end
}

/// An in-memory supervised dataset: one feature row and one one-hot label
/// row per sample.
#[derive(Debug, Clone)]
pub struct Dataset {
    x: Array2<f32>,
    y: Array2<f32>,
}

impl Dataset {
    pub fn new(x: Array2<f32>, y: Array2<f32>) -> Result<Self> {
        if x.nrows() != y.nrows() {
            return Err(MlErr::SizeMismatch {
                what: "dataset rows",
                got: y.nrows(),
                expected: x.nrows(),
            });
        }
        Ok(Self { x, y })
    }

    /// Generates `classes` Gaussian blobs of `per_class` samples each.
    ///
    /// Class centers are sampled from `Normal(0, spread)` and samples scatter
    /// around them with unit variance, so a larger `spread` makes the classes
    /// easier to separate. Rows interleave the classes round-robin, which
    /// keeps every contiguous shard balanced without an extra shuffle.
    pub fn blobs(
        per_class: usize,
        classes: usize,
        features: usize,
        spread: f32,
        seed: u64,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let center_dist = Normal::new(0.0, spread)?;
        let noise = Normal::new(0.0, 1.0)?;

        let centers: Vec<Vec<f32>> = (0..classes)
            .map(|_| (0..features).map(|_| center_dist.sample(&mut rng)).collect())
            .collect();

        let rows = per_class * classes;
        let mut x = Array2::zeros((rows, features));
        let mut y = Array2::zeros((rows, classes));
        for row in 0..rows {
            let class = row % classes;
            for (j, value) in x.row_mut(row).iter_mut().enumerate() {
                *value = centers[class][j] + noise.sample(&mut rng);
            }
            y[(row, class)] = 1.0;
        }

        Self::new(x, y)
    }

    pub fn len(&self) -> usize {
        self.x.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn features(&self) -> usize {
        self.x.ncols()
    }

    pub fn classes(&self) -> usize {
        self.y.ncols()
    }

    pub fn x(&self) -> ArrayView2<'_, f32> {
        self.x.view()
    }

    pub fn y(&self) -> ArrayView2<'_, f32> {
        self.y.view()
    }

    /// Copies out the balanced contiguous shard `shard` of `shards`.
    pub fn shard(&self, shard: usize, shards: usize) -> Dataset {
        let range = shard_range(self.len(), shard, shards);
        Dataset {
            x: self.x.slice(s![range.clone(), ..]).to_owned(),
            y: self.y.slice(s![range, ..]).to_owned(),
        }
    }

    /// Reorders the samples in place, keeping each row paired with its label.
    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        self.x = self.x.select(Axis(0), &order);
        self.y = self.y.select(Axis(0), &order);
    }

    /// Iterates `(x, y)` batch views of at most `batch` rows, in order. The
    /// trailing batch may be short.
    pub fn batches(&self, batch: usize) -> impl Iterator<Item = (ArrayView2<'_, f32>, ArrayView2<'_, f32>)> {
        assert!(batch > 0);
        self.x
            .axis_chunks_iter(Axis(0), batch)
            .zip(self.y.axis_chunks_iter(Axis(0), batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_ranges_are_balanced() {
        // total 10, shards 3 => sizes 4, 3, 3
        assert_eq!(shard_range(10, 0, 3), 0..4);
        assert_eq!(shard_range(10, 1, 3), 4..7);
        assert_eq!(shard_range(10, 2, 3), 7..10);
    }

    #[test]
    fn shard_copies_its_contiguous_rows() {
        let x = Array2::from_shape_fn((10, 2), |(i, _)| i as f32);
        let y = Array2::from_shape_fn((10, 2), |(i, j)| if i % 2 == j { 1.0 } else { 0.0 });
        let data = Dataset::new(x, y).unwrap();

        let mid = data.shard(1, 3);
        assert_eq!(mid.len(), 3);
        assert_eq!(mid.x().column(0).to_vec(), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn batches_walk_the_rows_in_order() {
        let x = Array2::from_shape_fn((5, 1), |(i, _)| i as f32);
        let y = Array2::ones((5, 2));
        let data = Dataset::new(x, y).unwrap();

        let sizes: Vec<usize> = data.batches(2).map(|(xb, _)| xb.nrows()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);

        let (first, _) = data.batches(2).next().unwrap();
        assert_eq!(first[(0, 0)], 0.0);
        assert_eq!(first[(1, 0)], 1.0);
    }

    #[test]
    fn blobs_interleave_one_hot_classes() {
        let data = Dataset::blobs(5, 3, 4, 2.0, 42).unwrap();
        assert_eq!(data.len(), 15);
        assert_eq!(data.features(), 4);
        assert_eq!(data.classes(), 3);

        for (row, label) in data.y().outer_iter().enumerate() {
            assert_eq!(label.sum(), 1.0);
            assert_eq!(label[row % 3], 1.0);
        }
    }

    #[test]
    fn shuffle_keeps_rows_paired() {
        // Feature 0 encodes the row id, the label encodes id % 2.
        let x = Array2::from_shape_fn((8, 2), |(i, j)| if j == 0 { i as f32 } else { 0.0 });
        let y = Array2::from_shape_fn((8, 2), |(i, j)| if i % 2 == j { 1.0 } else { 0.0 });
        let mut data = Dataset::new(x, y).unwrap();

        let mut rng = StdRng::seed_from_u64(3);
        data.shuffle(&mut rng);

        let mut ids: Vec<usize> = data.x().column(0).iter().map(|&v| v as usize).collect();
        for (row, id) in ids.iter().enumerate() {
            assert_eq!(data.y()[(row, id % 2)], 1.0);
        }
        ids.sort_unstable();
        assert_eq!(ids, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn row_count_mismatch_is_rejected() {
        let err = Dataset::new(Array2::zeros((3, 2)), Array2::zeros((4, 2))).unwrap_err();
        assert!(matches!(err, MlErr::SizeMismatch { .. }));
    }
}
