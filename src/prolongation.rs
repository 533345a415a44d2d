//! Conforming prolongation between true dofs and local dofs.
//!
//! Each rank holds a *local* vector with one entry per local dof, including copies of dofs
//! shared with other ranks, and a *conforming* vector with one entry per true dof, that is,
//! per local dof that is not external. The prolongation `P` maps conforming vectors to local
//! vectors, and its transpose `Pᵀ` sums local contributions back into conforming vectors.
//!
//! ```text
//!   mult:            conforming ──copy──▶ interior ldofs, owner's value ──broadcast──▶ external ldofs
//!   mult_transpose:  local ──sum over group members──▶ owner's entry, interior ldofs ──copy──▶ conforming
//! ```
//!
//! Both directions are collective across all ranks sharing dofs: see [`GroupCommunicator`].
use crate::array::{DeviceArray, Xyz};
use crate::communicator::{GroupCommunicator, Reduction};
use crate::error::DeviceError;
use crate::kernels::Kernels;
use crate::memory::{Device, Host, Residency};
use crate::vector::DeviceVector;
use eyre::{bail, WrapErr};
use fenris_traits::Real;
use log::debug;
use std::marker::PhantomData;

pub struct ConformingProlongation<T, D, C>
where
    T: Real,
    D: Device,
    C: GroupCommunicator<T>,
{
    device: D,
    communicator: C,
    external_ldofs: Vec<usize>,
    // Mirror of `external_ldofs`, never modified after construction
    device_external_ldofs: DeviceArray<usize, Xyz, D>,
    marker: PhantomData<T>,
}

impl<T, D, C> ConformingProlongation<T, D, C>
where
    T: Real,
    D: Device,
    C: GroupCommunicator<T>,
{
    /// Creates the operator for the dof partition held by `communicator`.
    ///
    /// A partition without external dofs yields the identity.
    pub fn new(device: D, communicator: C) -> Self {
        let groups = communicator.groups();
        let external_ldofs = groups.external_ldofs().to_vec();
        let device_external_ldofs = DeviceArray::from_host_slice(device.clone(), &external_ldofs);
        debug!(
            "Conforming prolongation on rank {} ({}): {} local dofs, {} true dofs, {} external dofs in {} groups",
            groups.rank(),
            device.name(),
            groups.num_ldofs(),
            groups.num_true_dofs(),
            external_ldofs.len(),
            groups.groups().len()
        );
        Self {
            device,
            communicator,
            external_ldofs,
            device_external_ldofs,
            marker: PhantomData,
        }
    }

    /// Number of local dofs (rows of the prolongation).
    pub fn height(&self) -> usize {
        self.communicator.groups().num_ldofs()
    }

    /// Number of conforming (true) dofs (columns of the prolongation).
    pub fn width(&self) -> usize {
        self.height() - self.external_ldofs.len()
    }

    pub fn external_ldofs(&self) -> &[usize] {
        &self.external_ldofs
    }

    pub fn device_external_ldofs(&self) -> &DeviceArray<usize, Xyz, D> {
        &self.device_external_ldofs
    }

    pub fn communicator(&self) -> &C {
        &self.communicator
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    fn check_sizes(&self, operation: &'static str, conforming: usize, local: usize) -> Result<(), DeviceError> {
        DeviceError::check_size(operation, self.width(), conforming)?;
        DeviceError::check_size(operation, self.height(), local)
    }

    /// Computes `y = P x` for a conforming `x` and a local `y` in host memory.
    pub fn mult_host(&self, x: &[T], y: &mut [T]) -> eyre::Result<()> {
        self.check_sizes("mult_host", x.len(), y.len())?;
        let host = Host::new();
        host.scatter_interior(y, x, &self.external_ldofs);
        host.set_subvector(y, &self.external_ldofs, T::zero());
        self.communicator
            .combine_and_broadcast(y, Reduction::FirstWriter)
            .wrap_err("failed to broadcast external dofs")
    }

    /// Computes `y = Pᵀ x` for a local `x` and a conforming `y` in host memory.
    pub fn mult_transpose_host(&self, x: &[T], y: &mut [T]) -> eyre::Result<()> {
        self.check_sizes("mult_transpose_host", y.len(), x.len())?;
        let mut local = x.to_vec();
        self.communicator
            .combine_and_broadcast(&mut local, Reduction::Sum)
            .wrap_err("failed to reduce shared dofs")?;
        Host::new().gather_interior(y, &local, &self.external_ldofs);
        Ok(())
    }

    /// Computes `y = P x` for a conforming `x` and a local `y` in device memory.
    pub fn mult(&self, x: &DeviceVector<'_, T, D>, y: &mut DeviceVector<'_, T, D>) -> eyre::Result<()> {
        self.check_sizes("mult", x.len(), y.len())?;
        let external = self.device_external_ldofs.as_slice();
        self.device
            .scatter_interior(y.as_mut_slice(), x.as_slice(), external);
        self.device
            .set_subvector(y.as_mut_slice(), external, T::zero());
        self.combine_on_device(y, Reduction::FirstWriter)
            .wrap_err("failed to broadcast external dofs")
    }

    /// Computes `y = Pᵀ x` for a local `x` and a conforming `y` in device memory.
    pub fn mult_transpose(&self, x: &DeviceVector<'_, T, D>, y: &mut DeviceVector<'_, T, D>) -> eyre::Result<()> {
        self.check_sizes("mult_transpose", y.len(), x.len())?;
        let mut local = x.clone();
        self.combine_on_device(&mut local, Reduction::Sum)
            .wrap_err("failed to reduce shared dofs")?;
        self.device
            .gather_interior(y.as_mut_slice(), local.as_slice(), self.device_external_ldofs.as_slice());
        Ok(())
    }

    /// Runs the group communication on a local vector in device memory.
    ///
    /// This is a synchronization point: queued kernels writing `local` complete before the
    /// communicator reads it. A communicator working in host memory on a device-resident
    /// vector gets a host copy, which is copied back to the device afterwards.
    fn combine_on_device(&self, local: &mut DeviceVector<'_, T, D>, reduction: Reduction) -> eyre::Result<()> {
        self.device.synchronize();
        match (self.communicator.residency(), self.device.residency()) {
            (communicator, device) if communicator == device => {
                return self
                    .communicator
                    .combine_and_broadcast(local.as_mut_slice(), reduction);
            }
            (Residency::Device, Residency::Host) => {
                bail!("the group communicator requires device memory, but local vectors live in host memory")
            }
            _ => {}
        }

        debug!("Staging {} local dofs through host memory for group communication", local.len());
        let mut staging = vec![T::zero(); local.len()];
        local.copy_to_host_slice(&mut staging)?;
        self.communicator
            .combine_and_broadcast(&mut staging, reduction)?;
        local.copy_from_host_slice(&staging)?;
        Ok(())
    }
}
