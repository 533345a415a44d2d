//! One-dimensional vectors of reals in device memory.
use crate::array::{DeviceArray, Layout};
use crate::error::DeviceError;
use crate::kernels::Kernels;
use crate::memory::{Device, Host, Residency, Transfer};
use fenris_traits::Real;
use nalgebra::DVector;
use std::fmt;
use std::mem::{size_of, take};
use std::ops::{AddAssign, Deref, DerefMut, MulAssign, SubAssign};

/// Storage of a [`DeviceVector`].
///
/// Only `Owned` storage is ever released. A `Borrowed` buffer belongs to another vector or
/// array, and the lifetime ties the view to its source.
enum Storage<'a, T> {
    Owned(Box<[T]>),
    Borrowed(&'a mut [T]),
}

impl<'a, T> Deref for Storage<'a, T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Owned(buffer) => buffer,
            Self::Borrowed(slice) => slice,
        }
    }
}

impl<'a, T> DerefMut for Storage<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Self::Owned(buffer) => buffer,
            Self::Borrowed(slice) => slice,
        }
    }
}

/// A vector of reals stored in the memory space of the device `D`.
///
/// A vector either owns its buffer, or is a view into the buffer of another vector or
/// array (see [`get_range`](Self::get_range) and [`from_array`](Self::from_array)). Views
/// read and write the memory of their source directly. Arithmetic operates in place and is
/// executed by the device kernels.
///
/// Binary operations require operands of equal length. The checked methods report a
/// [`DeviceError::SizeMismatch`], while the operator forms (`+=`, `-=`) panic.
pub struct DeviceVector<'a, T: Real, D: Device = Host> {
    device: D,
    storage: Storage<'a, T>,
}

impl<T: Real, D: Device> DeviceVector<'static, T, D> {
    /// An owned vector of length `len`, filled with zeros.
    pub fn new(device: D, len: usize) -> Self {
        let buffer = device.allocate(len);
        Self {
            device,
            storage: Storage::Owned(buffer),
        }
    }

    pub fn from_element(device: D, len: usize, value: T) -> Self {
        let mut vector = Self::new(device, len);
        vector.fill(value);
        vector
    }

    /// Allocates a vector on the device and copies `values` from host memory into it.
    pub fn from_host_slice(device: D, values: &[T]) -> Self {
        let mut vector = Self::new(device, values.len());
        let transfer = Transfer::between(Residency::Host, vector.device.residency());
        vector.device.copy(&mut vector.storage, values, transfer);
        vector
    }

    pub fn from_host(device: D, host: &DVector<T>) -> Self {
        Self::from_host_slice(device, host.as_slice())
    }
}

impl<'a, T: Real, D: Device> DeviceVector<'a, T, D> {
    /// A vector aliasing the storage of `array`, in linear storage order.
    pub fn from_array<L: Layout>(array: &'a mut DeviceArray<T, L, D>) -> Self {
        let device = array.device().clone();
        Self {
            device,
            storage: Storage::Borrowed(array.as_mut_slice()),
        }
    }

    /// Copies the vector into a newly allocated host vector.
    pub fn to_host(&self) -> DVector<T> {
        let mut host = DVector::zeros(self.len());
        let transfer = Transfer::between(self.device.residency(), Residency::Host);
        self.device.copy(host.as_mut_slice(), &self.storage, transfer);
        host
    }

    /// A view of the entries `[offset, offset + count)`.
    ///
    /// The view does not own its data, and the source cannot be used while the view is alive.
    pub fn get_range(&mut self, offset: usize, count: usize) -> Result<DeviceVector<'_, T, D>, DeviceError> {
        let len = self.len();
        let range_end = offset
            .checked_add(count)
            .filter(|&end| end <= len)
            .ok_or(DeviceError::RangeOutOfBounds { offset, count, len })?;
        Ok(DeviceVector {
            device: self.device.clone(),
            storage: Storage::Borrowed(&mut self.storage[offset..range_end]),
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.len() * size_of::<T>()
    }

    pub fn owns_data(&self) -> bool {
        matches!(self.storage, Storage::Owned(_))
    }

    /// The underlying buffer, for passing to numeric kernels.
    pub fn as_slice(&self) -> &[T] {
        &self.storage
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.storage
    }

    /// Sets every entry to `value`.
    pub fn fill(&mut self, value: T) {
        self.device.fill(&mut self.storage, value);
    }

    /// Copies the entries of `other` into this vector.
    ///
    /// An owned vector is reallocated to the length of `other` if necessary. A view cannot
    /// change its length, so assigning a vector of different length to a view is an error.
    pub fn assign(&mut self, other: &DeviceVector<'_, T, D>) -> Result<(), DeviceError> {
        if self.len() != other.len() {
            match &mut self.storage {
                Storage::Owned(buffer) => {
                    self.device.release(take(buffer));
                    *buffer = self.device.allocate(other.len());
                }
                Storage::Borrowed(slice) => {
                    return Err(DeviceError::SizeMismatch {
                        operation: "assign",
                        expected: slice.len(),
                        actual: other.len(),
                    })
                }
            }
        }
        let transfer = Transfer::between(other.device.residency(), self.device.residency());
        self.device.copy(&mut self.storage, &other.storage, transfer);
        Ok(())
    }

    /// Copies `values` from host memory into this vector.
    pub fn copy_from_host_slice(&mut self, values: &[T]) -> Result<(), DeviceError> {
        DeviceError::check_size("copy_from_host_slice", self.len(), values.len())?;
        let transfer = Transfer::between(Residency::Host, self.device.residency());
        self.device.copy(&mut self.storage, values, transfer);
        Ok(())
    }

    /// Copies this vector into `values` in host memory.
    pub fn copy_to_host_slice(&self, values: &mut [T]) -> Result<(), DeviceError> {
        DeviceError::check_size("copy_to_host_slice", self.len(), values.len())?;
        let transfer = Transfer::between(self.device.residency(), Residency::Host);
        self.device.copy(values, &self.storage, transfer);
        Ok(())
    }

    /// `self += other`
    pub fn add_assign(&mut self, other: &DeviceVector<'_, T, D>) -> Result<(), DeviceError> {
        DeviceError::check_size("add_assign", self.len(), other.len())?;
        self.device.add_assign(&mut self.storage, &other.storage);
        Ok(())
    }

    /// `self -= other`
    pub fn sub_assign(&mut self, other: &DeviceVector<'_, T, D>) -> Result<(), DeviceError> {
        DeviceError::check_size("sub_assign", self.len(), other.len())?;
        self.device.sub_assign(&mut self.storage, &other.storage);
        Ok(())
    }

    /// `self *= alpha`
    pub fn scale(&mut self, alpha: T) {
        self.device.scale(&mut self.storage, alpha);
    }

    /// `self += alpha * other`
    pub fn axpy(&mut self, alpha: T, other: &DeviceVector<'_, T, D>) -> Result<(), DeviceError> {
        DeviceError::check_size("axpy", self.len(), other.len())?;
        self.device.axpy(&mut self.storage, alpha, &other.storage);
        Ok(())
    }

    /// Negates every entry in place.
    pub fn neg(&mut self) {
        self.device.neg(&mut self.storage);
    }

    pub fn dot(&self, other: &DeviceVector<'_, T, D>) -> Result<T, DeviceError> {
        DeviceError::check_size("dot", self.len(), other.len())?;
        Ok(self.device.dot(&self.storage, &other.storage))
    }

    /// The smallest entry, or `None` if the vector is empty.
    pub fn min(&self) -> Option<T> {
        self.device.min(&self.storage)
    }

    /// Sets the entries addressed by the first `count` of `indices` to `value`.
    ///
    /// Typically used to impose essential boundary conditions on a set of dofs.
    pub fn set_sub_vector(&mut self, indices: &[usize], value: T, count: usize) -> Result<(), DeviceError> {
        let indices = indices.get(..count).ok_or(DeviceError::RangeOutOfBounds {
            offset: 0,
            count,
            len: indices.len(),
        })?;
        let len = self.len();
        if let Some(&index) = indices.iter().find(|&&index| index >= len) {
            return Err(DeviceError::IndexOutOfBounds { index, len });
        }
        self.device.set_subvector(&mut self.storage, indices, value);
        Ok(())
    }
}

/// Computes `out = alpha * out + v1 + v2`.
///
/// Note that, despite the name, the *previous value of `out`* is the term scaled by `alpha`.
/// Neither `v1` nor `v2` is scaled.
pub fn add<T: Real, D: Device>(
    v1: &DeviceVector<'_, T, D>,
    alpha: T,
    v2: &DeviceVector<'_, T, D>,
    out: &mut DeviceVector<'_, T, D>,
) -> Result<(), DeviceError> {
    DeviceError::check_size("add", out.len(), v1.len())?;
    DeviceError::check_size("add", out.len(), v2.len())?;
    out.device.xpay(&mut out.storage, alpha, &v1.storage, &v2.storage);
    Ok(())
}

/// Computes `out = v1 - v2`.
pub fn subtract<T: Real, D: Device>(
    v1: &DeviceVector<'_, T, D>,
    v2: &DeviceVector<'_, T, D>,
    out: &mut DeviceVector<'_, T, D>,
) -> Result<(), DeviceError> {
    DeviceError::check_size("subtract", out.len(), v1.len())?;
    DeviceError::check_size("subtract", out.len(), v2.len())?;
    out.device.xsy(&mut out.storage, &v1.storage, &v2.storage);
    Ok(())
}

impl<'a, T: Real, D: Device> Clone for DeviceVector<'a, T, D> {
    /// Allocates a new owned buffer and copies the entries into it.
    fn clone(&self) -> Self {
        let mut buffer = self.device.allocate(self.len());
        let residency = self.device.residency();
        self.device
            .copy(&mut buffer, &self.storage, Transfer::between(residency, residency));
        Self {
            device: self.device.clone(),
            storage: Storage::Owned(buffer),
        }
    }
}

impl<'a, 'b, T: Real, D: Device> AddAssign<&'b DeviceVector<'_, T, D>> for DeviceVector<'a, T, D> {
    fn add_assign(&mut self, rhs: &'b DeviceVector<'_, T, D>) {
        assert_eq!(self.len(), rhs.len(), "Vectors must have the same length.");
        self.device.add_assign(&mut self.storage, &rhs.storage);
    }
}

impl<'a, 'b, T: Real, D: Device> SubAssign<&'b DeviceVector<'_, T, D>> for DeviceVector<'a, T, D> {
    fn sub_assign(&mut self, rhs: &'b DeviceVector<'_, T, D>) {
        assert_eq!(self.len(), rhs.len(), "Vectors must have the same length.");
        self.device.sub_assign(&mut self.storage, &rhs.storage);
    }
}

impl<'a, T: Real, D: Device> MulAssign<T> for DeviceVector<'a, T, D> {
    fn mul_assign(&mut self, alpha: T) {
        self.scale(alpha);
    }
}

impl<'a, T: Real, D: Device> fmt::Debug for DeviceVector<'a, T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceVector")
            .field("device", &self.device)
            .field("len", &self.len())
            .field("owns_data", &self.owns_data())
            .finish()
    }
}

impl<'a, T: Real + fmt::LowerExp, D: Device> fmt::Display for DeviceVector<'a, T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = self.to_host();
        for (i, value) in host.iter().enumerate() {
            writeln!(f, "[{i}] {value:.15e}")?;
        }
        Ok(())
    }
}

impl<'a, T: Real, D: Device> Drop for DeviceVector<'a, T, D> {
    fn drop(&mut self) {
        if let Storage::Owned(buffer) = &mut self.storage {
            self.device.release(take(buffer));
        }
    }
}
