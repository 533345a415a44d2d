//! Dense multi-dimensional arrays in device memory.
//!
//! A [`DeviceArray`] has between one and four extents, fixed at allocation. How a
//! multi-index maps to a linear offset is decided by the [`Layout`] type parameter:
//!
//! - [`Xyz`] stores the extents and addresses `(x, y, z)` as `x + d0 * (y + d1 * z)`.
//! - [`Strided`] converts the extents into cumulative strides at allocation and addresses
//!   `(x, y, z)` as `s0 * x + s1 * y + s2 * z`. Allocating with `transposed = true`
//!   exchanges the roles of the first two axes, so the same storage can be addressed
//!   component-major instead of point-major without a physical transpose.
//!
//! Arrays are single-owner and deliberately do not implement `Clone`.
use crate::error::DeviceError;
use crate::memory::{Device, Host, Residency, Transfer};
use fenris_traits::Scalar;
use std::fmt;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::mem::{size_of, take};
use std::ops::{Index, IndexMut};

/// Addressing strategy of a [`DeviceArray`].
pub trait Layout: Debug + Copy + Default + Send + Sync + 'static {
    /// Converts the extents given at allocation into the addressing table of the array.
    fn dims(extents: [usize; 4], transposed: bool) -> [usize; 4];

    /// Linear offset of a four-dimensional index. Unused trailing coordinates are zero.
    fn offset(dims: &[usize; 4], index: [usize; 4]) -> usize;
}

/// Row-major layout with the first index varying fastest.
///
/// The `transposed` flag has no effect on this layout.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Xyz;

/// Layout addressed through precomputed strides.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Strided;

impl Layout for Xyz {
    fn dims(extents: [usize; 4], _transposed: bool) -> [usize; 4] {
        extents
    }

    fn offset(d: &[usize; 4], [x, y, z, w]: [usize; 4]) -> usize {
        x + d[0] * (y + d[1] * (z + d[2] * w))
    }
}

impl Layout for Strided {
    fn dims(extents: [usize; 4], transposed: bool) -> [usize; 4] {
        let mut extents = extents;
        if transposed {
            extents.swap(0, 1);
        }
        let mut strides = [1; 4];
        for i in 1..4 {
            strides[i] = strides[i - 1] * extents[i - 1];
        }
        if transposed {
            strides.swap(0, 1);
        }
        strides
    }

    fn offset(s: &[usize; 4], [x, y, z, w]: [usize; 4]) -> usize {
        s[0] * x + s[1] * y + s[2] * z + s[3] * w
    }
}

/// An index into a [`DeviceArray`].
///
/// A single `usize` addresses the underlying storage linearly, regardless of layout.
/// Tuples of two to four coordinates are mapped through the layout of the array.
pub trait ArrayIndex: Copy + Debug {
    fn to_offset<L: Layout>(self, extents: &[usize; 4], dims: &[usize; 4], len: usize) -> Option<usize>;
}

fn multi_index_offset<L: Layout>(index: [usize; 4], extents: &[usize; 4], dims: &[usize; 4]) -> Option<usize> {
    let in_bounds = index.iter().zip(extents).all(|(i, extent)| i < extent);
    in_bounds.then(|| L::offset(dims, index))
}

impl ArrayIndex for usize {
    fn to_offset<L: Layout>(self, _extents: &[usize; 4], _dims: &[usize; 4], len: usize) -> Option<usize> {
        (self < len).then_some(self)
    }
}

impl ArrayIndex for (usize, usize) {
    fn to_offset<L: Layout>(self, extents: &[usize; 4], dims: &[usize; 4], _len: usize) -> Option<usize> {
        multi_index_offset::<L>([self.0, self.1, 0, 0], extents, dims)
    }
}

impl ArrayIndex for (usize, usize, usize) {
    fn to_offset<L: Layout>(self, extents: &[usize; 4], dims: &[usize; 4], _len: usize) -> Option<usize> {
        multi_index_offset::<L>([self.0, self.1, self.2, 0], extents, dims)
    }
}

impl ArrayIndex for (usize, usize, usize, usize) {
    fn to_offset<L: Layout>(self, extents: &[usize; 4], dims: &[usize; 4], _len: usize) -> Option<usize> {
        multi_index_offset::<L>([self.0, self.1, self.2, self.3], extents, dims)
    }
}

pub struct DeviceArray<T: Scalar, L: Layout = Xyz, D: Device = Host> {
    device: D,
    data: Box<[T]>,
    extents: [usize; 4],
    dims: [usize; 4],
    layout: PhantomData<L>,
}

impl<T: Scalar, L: Layout, D: Device> Default for DeviceArray<T, L, D> {
    fn default() -> Self {
        Self {
            device: D::default(),
            data: Box::default(),
            extents: [0; 4],
            dims: [0; 4],
            layout: PhantomData,
        }
    }
}

impl<T: Scalar, L: Layout, D: Device> DeviceArray<T, L, D> {
    /// Allocates an array with the given extents, filled with `T::default()`.
    ///
    /// Between one and four extents must be given. Missing trailing extents are one.
    pub fn allocate(device: D, extents: &[usize], transposed: bool) -> Result<Self, DeviceError> {
        if extents.is_empty() || extents.len() > 4 {
            return Err(DeviceError::InvalidExtents {
                extents: extents.to_vec(),
            });
        }
        let mut padded = [1; 4];
        padded[..extents.len()].copy_from_slice(extents);
        let len = padded.iter().product();
        let data = device.allocate(len);
        Ok(Self {
            device,
            data,
            extents: padded,
            dims: L::dims(padded, transposed),
            layout: PhantomData,
        })
    }

    /// Allocates a one-dimensional array and copies `values` from host memory into it.
    pub fn from_host_slice(device: D, values: &[T]) -> Self {
        let mut data = device.allocate(values.len());
        let transfer = Transfer::between(Residency::Host, device.residency());
        device.copy(&mut data, values, transfer);
        let extents = [values.len(), 1, 1, 1];
        Self {
            device,
            data,
            extents,
            dims: L::dims(extents, false),
            layout: PhantomData,
        }
    }

    /// Copies the array contents into host memory, in linear storage order.
    pub fn to_host_vec(&self) -> Vec<T> {
        let mut values = vec![T::default(); self.len()];
        let transfer = Transfer::between(self.device.residency(), Residency::Host);
        self.device.copy(&mut values, &self.data, transfer);
        values
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.len() * size_of::<T>()
    }

    /// The extents given at allocation, padded with ones to four dimensions.
    pub fn extents(&self) -> &[usize; 4] {
        &self.extents
    }

    /// The addressing table of the layout: extents for [`Xyz`], strides for [`Strided`].
    pub fn dims(&self) -> &[usize; 4] {
        &self.dims
    }

    /// Linear storage offset of `index`, or `None` if it is out of bounds.
    pub fn offset<I: ArrayIndex>(&self, index: I) -> Option<usize> {
        index.to_offset::<L>(&self.extents, &self.dims, self.len())
    }

    pub fn get<I: ArrayIndex>(&self, index: I) -> Option<&T> {
        self.offset(index).map(|offset| &self.data[offset])
    }

    pub fn get_mut<I: ArrayIndex>(&mut self, index: I) -> Option<&mut T> {
        self.offset(index).map(move |offset| &mut self.data[offset])
    }

    /// The underlying storage, for passing to numeric kernels.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T: Scalar, L: Layout, D: Device, I: ArrayIndex> Index<I> for DeviceArray<T, L, D> {
    type Output = T;

    fn index(&self, index: I) -> &T {
        match self.offset(index) {
            Some(offset) => &self.data[offset],
            None => panic!("index {index:?} out of bounds for array with extents {:?}", self.extents),
        }
    }
}

impl<T: Scalar, L: Layout, D: Device, I: ArrayIndex> IndexMut<I> for DeviceArray<T, L, D> {
    fn index_mut(&mut self, index: I) -> &mut T {
        match self.offset(index) {
            Some(offset) => &mut self.data[offset],
            None => panic!("index {index:?} out of bounds for array with extents {:?}", self.extents),
        }
    }
}

impl<T: Scalar, L: Layout, D: Device> Debug for DeviceArray<T, L, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceArray")
            .field("device", &self.device)
            .field("layout", &L::default())
            .field("extents", &self.extents)
            .field("dims", &self.dims)
            .finish()
    }
}

impl<T: Scalar, L: Layout, D: Device> Drop for DeviceArray<T, L, D> {
    fn drop(&mut self) {
        self.device.release(take(&mut self.data));
    }
}
