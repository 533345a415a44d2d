use nalgebra::RealField;
use std::fmt::Debug;

pub use nalgebra;

/// Plain data that can live in a device buffer.
///
/// Buffers are always initialized, so every element type needs a `Default` value
/// to fill fresh allocations with.
pub trait Scalar: Copy + Default + Debug + PartialEq + Send + Sync + 'static {}

impl<T> Scalar for T where T: Copy + Default + Debug + PartialEq + Send + Sync + 'static {}

/// Real numbers stored in device vectors.
pub trait Real: RealField + Scalar {}

impl<T: RealField + Scalar> Real for T {}
