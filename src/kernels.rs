//! Numeric kernels executed by a [`Device`].
//!
//! Kernels operate on raw buffers and assume that the caller has already validated operand
//! sizes. Each launch is recorded with the device. Kernels that return a value to the caller
//! (`dot`, `min`) are synchronization points.
use crate::memory::Device;
use fenris_traits::Real;
use itertools::izip;

pub trait Kernels: Device {
    /// `x[i] = value`
    fn fill<T: Real>(&self, x: &mut [T], value: T) {
        self.record_launch();
        x.fill(value);
    }

    /// `y[i] += x[i]`
    fn add_assign<T: Real>(&self, y: &mut [T], x: &[T]) {
        self.record_launch();
        for (y_i, &x_i) in y.iter_mut().zip(x) {
            *y_i += x_i;
        }
    }

    /// `y[i] -= x[i]`
    fn sub_assign<T: Real>(&self, y: &mut [T], x: &[T]) {
        self.record_launch();
        for (y_i, &x_i) in y.iter_mut().zip(x) {
            *y_i -= x_i;
        }
    }

    /// `y[i] *= alpha`
    fn scale<T: Real>(&self, y: &mut [T], alpha: T) {
        self.record_launch();
        for y_i in y {
            *y_i *= alpha;
        }
    }

    /// `y[i] += alpha * x[i]`
    fn axpy<T: Real>(&self, y: &mut [T], alpha: T, x: &[T]) {
        self.record_launch();
        for (y_i, &x_i) in y.iter_mut().zip(x) {
            *y_i += alpha * x_i;
        }
    }

    /// `y[i] = -y[i]`
    fn neg<T: Real>(&self, y: &mut [T]) {
        self.record_launch();
        for y_i in y {
            *y_i = -*y_i;
        }
    }

    fn dot<T: Real>(&self, x: &[T], y: &[T]) -> T {
        self.record_launch();
        let result = x
            .iter()
            .zip(y)
            .fold(T::zero(), |acc, (&x_i, &y_i)| acc + x_i * y_i);
        self.synchronize();
        result
    }

    /// Minimum entry, or `None` for an empty buffer.
    fn min<T: Real>(&self, x: &[T]) -> Option<T> {
        self.record_launch();
        let result = x
            .iter()
            .copied()
            .reduce(|min, x_i| if x_i < min { x_i } else { min });
        self.synchronize();
        result
    }

    /// `out[i] = alpha * out[i] + v1[i] + v2[i]`
    fn xpay<T: Real>(&self, out: &mut [T], alpha: T, v1: &[T], v2: &[T]) {
        self.record_launch();
        for (out_i, &v1_i, &v2_i) in izip!(out, v1, v2) {
            *out_i = alpha * *out_i + v1_i + v2_i;
        }
    }

    /// `out[i] = v1[i] - v2[i]`
    fn xsy<T: Real>(&self, out: &mut [T], v1: &[T], v2: &[T]) {
        self.record_launch();
        for (out_i, &v1_i, &v2_i) in izip!(out, v1, v2) {
            *out_i = v1_i - v2_i;
        }
    }

    /// `x[indices[i]] = value` for every index.
    fn set_subvector<T: Real>(&self, x: &mut [T], indices: &[usize], value: T) {
        self.record_launch();
        for &index in indices {
            x[index] = value;
        }
    }

    /// Scatters the conforming entries `x` into every position of `y` that is not listed in
    /// the sorted `external` indices. External positions are left untouched.
    ///
    /// Requires `y.len() == x.len() + external.len()`.
    fn scatter_interior<T: Real>(&self, y: &mut [T], x: &[T], external: &[usize]) {
        self.record_launch();
        for_each_interior_segment(y.len(), external, |local, conforming| {
            y[local].copy_from_slice(&x[conforming]);
        });
    }

    /// Gathers every position of `x` that is not listed in the sorted `external` indices into
    /// the conforming entries `y`.
    ///
    /// Requires `x.len() == y.len() + external.len()`.
    fn gather_interior<T: Real>(&self, y: &mut [T], x: &[T], external: &[usize]) {
        self.record_launch();
        for_each_interior_segment(x.len(), external, |local, conforming| {
            y[conforming].copy_from_slice(&x[local]);
        });
    }
}

impl<D: Device> Kernels for D {}

/// Calls `f(local_range, conforming_range)` for each maximal run of local indices in
/// `0 .. num_local` that contains no external index.
///
/// The `i`-th external index shifts every subsequent local index down by one in the
/// conforming numbering.
fn for_each_interior_segment<F>(num_local: usize, external: &[usize], mut f: F)
where
    F: FnMut(std::ops::Range<usize>, std::ops::Range<usize>),
{
    let mut begin = 0;
    for (skipped, &end) in external.iter().enumerate() {
        if end > begin {
            f(begin..end, begin - skipped..end - skipped);
        }
        begin = end + 1;
    }
    if num_local > begin {
        let skipped = external.len();
        f(begin..num_local, begin - skipped..num_local - skipped);
    }
}
