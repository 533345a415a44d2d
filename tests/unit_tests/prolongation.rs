use super::run_on_ranks;
use fenris_device::communicator::{DofGroup, DofGroups, LocalCluster, SerialCommunicator};
use fenris_device::error::DeviceError;
use fenris_device::kernels::Kernels;
use fenris_device::memory::{Device, Host, Managed, MemoryCounters, Transfer};
use fenris_device::prolongation::ConformingProlongation;
use fenris_device::proptest::{partition_from_sharing, sharing_pattern};
use fenris_device::vector::DeviceVector;
use matrixcompare::prop_assert_scalar_eq;
use proptest::collection::vec;
use proptest::prelude::*;
use std::sync::Arc;

/// Rank 0 holds global dofs `[0, 1, 3]`, rank 1 holds `[1, 2, 3, 4]`. Dofs 1 and 3 are
/// shared and owned by rank 0.
fn two_rank_partition() -> Vec<DofGroups> {
    let group = |ldofs: Vec<usize>| DofGroup {
        id: 0,
        ranks: vec![0, 1],
        owner: 0,
        ldofs,
    };
    vec![
        DofGroups::try_new(0, 3, vec![group(vec![1, 2])]).unwrap(),
        DofGroups::try_new(1, 4, vec![group(vec![0, 2])]).unwrap(),
    ]
}

fn size_mismatch(error: &eyre::Report) -> Option<&DeviceError> {
    error.downcast_ref::<DeviceError>()
}

#[test]
fn serial_prolongation_is_identity() {
    let prolongation = ConformingProlongation::new(Host::new(), SerialCommunicator::new(4));
    assert_eq!(prolongation.height(), 4);
    assert_eq!(prolongation.width(), 4);
    assert!(prolongation.external_ldofs().is_empty());
    assert!(prolongation.device_external_ldofs().is_empty());

    let x = [1.0, -2.0, 3.5, 0.25];
    let mut y = [0.0; 4];
    prolongation.mult_host(&x, &mut y).unwrap();
    assert_eq!(y, x);

    let mut z = [0.0; 4];
    prolongation.mult_transpose_host(&y, &mut z).unwrap();
    assert_eq!(z, x);

    let x_device = DeviceVector::from_host_slice(Host::new(), &x);
    let mut y_device = DeviceVector::new(Host::new(), 4);
    prolongation.mult(&x_device, &mut y_device).unwrap();
    assert_eq!(y_device.to_host().as_slice(), &x);
    let mut z_device = DeviceVector::new(Host::new(), 4);
    prolongation.mult_transpose(&y_device, &mut z_device).unwrap();
    assert_eq!(z_device.to_host().as_slice(), &x);
}

#[test]
fn mismatched_sizes_are_rejected() {
    let prolongation = ConformingProlongation::new(Managed::new(), SerialCommunicator::new(4));

    let error = prolongation
        .mult_host(&[0.0; 3], &mut [0.0; 4])
        .unwrap_err();
    assert_eq!(
        size_mismatch(&error),
        Some(&DeviceError::SizeMismatch {
            operation: "mult_host",
            expected: 4,
            actual: 3
        })
    );

    let error = prolongation
        .mult_transpose_host(&[0.0; 5], &mut [0.0; 4])
        .unwrap_err();
    assert_eq!(
        size_mismatch(&error),
        Some(&DeviceError::SizeMismatch {
            operation: "mult_transpose_host",
            expected: 4,
            actual: 5
        })
    );

    let x = DeviceVector::<f64, _>::new(Managed::new(), 4);
    let mut y = DeviceVector::new(Managed::new(), 2);
    let error = prolongation.mult(&x, &mut y).unwrap_err();
    assert_eq!(
        size_mismatch(&error),
        Some(&DeviceError::SizeMismatch {
            operation: "mult",
            expected: 4,
            actual: 2
        })
    );

    let error = prolongation.mult_transpose(&y, &mut y.clone()).unwrap_err();
    assert_eq!(
        size_mismatch(&error),
        Some(&DeviceError::SizeMismatch {
            operation: "mult_transpose",
            expected: 4,
            actual: 2
        })
    );
}

#[test]
fn two_rank_mult_broadcasts_owned_values() {
    let cluster = LocalCluster::<f64>::new(2);
    // Conforming values of global dofs [0, 1, 3] on rank 0 and [2, 4] on rank 1
    let conforming = vec![vec![1.0, 2.0, 4.0], vec![3.0, 5.0]];
    let inputs = two_rank_partition().into_iter().zip(conforming).collect();

    let results = run_on_ranks(inputs, |(groups, x): (DofGroups, Vec<f64>)| {
        let prolongation = ConformingProlongation::new(Host::new(), cluster.communicator(groups));
        let mut y = vec![f64::NAN; prolongation.height()];
        prolongation.mult_host(&x, &mut y).unwrap();
        (prolongation.width(), y)
    });

    assert_eq!(results[0], (3, vec![1.0, 2.0, 4.0]));
    assert_eq!(results[1], (2, vec![2.0, 3.0, 4.0, 5.0]));
}

#[test]
fn two_rank_mult_transpose_sums_shared_values() {
    let cluster = LocalCluster::<f64>::new(2);
    let local = vec![vec![1.0, 2.0, 3.0], vec![10.0, 20.0, 30.0, 40.0]];
    let inputs = two_rank_partition().into_iter().zip(local).collect();

    let results = run_on_ranks(inputs, |(groups, x): (DofGroups, Vec<f64>)| {
        let prolongation = ConformingProlongation::new(Host::new(), cluster.communicator(groups));
        let mut y = vec![f64::NAN; prolongation.width()];
        prolongation.mult_transpose_host(&x, &mut y).unwrap();
        y
    });

    assert_eq!(results[0], vec![1.0, 12.0, 33.0]);
    assert_eq!(results[1], vec![20.0, 40.0]);
}

#[test]
fn device_path_stages_through_host_memory() {
    let cluster = LocalCluster::<f64>::new(2);
    let conforming = vec![vec![1.0, 2.0, 4.0], vec![3.0, 5.0]];
    let inputs = two_rank_partition().into_iter().zip(conforming).collect();

    let results = run_on_ranks(inputs, |(groups, x): (DofGroups, Vec<f64>)| {
        let counters = Arc::new(MemoryCounters::new());
        let device = Managed::new().with_observer(counters.clone());
        let prolongation = ConformingProlongation::new(device.clone(), cluster.communicator(groups));
        assert_eq!(prolongation.device_external_ldofs().len(), prolongation.external_ldofs().len());

        let x = DeviceVector::from_host_slice(device.clone(), &x);
        let mut y = DeviceVector::new(device.clone(), prolongation.height());
        let before = counters.snapshot();
        prolongation.mult(&x, &mut y).unwrap();
        let after = counters.snapshot();

        // Local kernels complete before the communicator reads the staged values
        assert!(after.synchronizations > before.synchronizations);
        let transfers = |transfer| after.transfers(transfer) - before.transfers(transfer);
        assert_eq!(transfers(Transfer::DeviceToHost), 1);
        assert_eq!(transfers(Transfer::HostToDevice), 1);
        assert!(!device.has_pending_work());
        y.to_host().as_slice().to_vec()
    });

    assert_eq!(results[0], vec![1.0, 2.0, 4.0]);
    assert_eq!(results[1], vec![2.0, 3.0, 4.0, 5.0]);
}

fn partition_and_vectors(
    num_ranks: usize,
) -> impl Strategy<Value = (Vec<DofGroups>, Vec<Vec<f64>>, Vec<Vec<f64>>)> {
    sharing_pattern(num_ranks, 8).prop_flat_map(move |sharing| {
        let partition = partition_from_sharing(num_ranks, &sharing);
        let conforming: Vec<_> = partition
            .iter()
            .map(|groups| vec(-10.0..10.0, groups.num_true_dofs()))
            .collect();
        let local: Vec<_> = partition
            .iter()
            .map(|groups| vec(-10.0..10.0, groups.num_ldofs()))
            .collect();
        (Just(partition), conforming, local)
    })
}

/// Per rank: `(x, P x, y, Pᵀ y)` computed with host buffers.
fn apply_on_host(partition: Vec<DofGroups>, x: Vec<Vec<f64>>, y: Vec<Vec<f64>>) -> Vec<[Vec<f64>; 4]> {
    let cluster = LocalCluster::<f64>::new(partition.len());
    let inputs = partition
        .into_iter()
        .zip(x)
        .zip(y)
        .map(|((groups, x), y)| (groups, x, y))
        .collect();
    run_on_ranks(inputs, |(groups, x, y): (DofGroups, Vec<f64>, Vec<f64>)| {
        let prolongation = ConformingProlongation::new(Host::new(), cluster.communicator(groups));
        let mut px = vec![0.0; prolongation.height()];
        let mut pty = vec![0.0; prolongation.width()];
        prolongation.mult_host(&x, &mut px).unwrap();
        prolongation.mult_transpose_host(&y, &mut pty).unwrap();
        [x, px, y, pty]
    })
}

/// Same as `apply_on_host`, but with vectors living on the device `D`.
fn apply_on_device<D: Device>(partition: Vec<DofGroups>, x: Vec<Vec<f64>>, y: Vec<Vec<f64>>) -> Vec<[Vec<f64>; 4]> {
    let cluster = LocalCluster::<f64>::new(partition.len());
    let inputs = partition
        .into_iter()
        .zip(x)
        .zip(y)
        .map(|((groups, x), y)| (groups, x, y))
        .collect();
    run_on_ranks(inputs, |(groups, x, y): (DofGroups, Vec<f64>, Vec<f64>)| {
        let device = D::default();
        let prolongation = ConformingProlongation::new(device.clone(), cluster.communicator(groups));
        let x_device = DeviceVector::from_host_slice(device.clone(), &x);
        let y_device = DeviceVector::from_host_slice(device.clone(), &y);
        let mut px = DeviceVector::new(device.clone(), prolongation.height());
        let mut pty = DeviceVector::new(device.clone(), prolongation.width());
        prolongation.mult(&x_device, &mut px).unwrap();
        prolongation.mult_transpose(&y_device, &mut pty).unwrap();
        let to_vec = |v: &DeviceVector<f64, D>| v.to_host().as_slice().to_vec();
        [x, to_vec(&px), y, to_vec(&pty)]
    })
}

proptest! {
    #[test]
    fn prolongation_and_transpose_are_adjoint((partition, x, y) in partition_and_vectors(3)) {
        let results = apply_on_host(partition, x, y);
        let host = Host::new();
        // <P x, y> == <x, Pᵀ y>, summed over all ranks
        let lhs: f64 = results.iter().map(|[_, px, y, _]| host.dot(px.as_slice(), y.as_slice())).sum();
        let rhs: f64 = results.iter().map(|[x, _, _, pty]| host.dot(x.as_slice(), pty.as_slice())).sum();
        prop_assert_scalar_eq!(lhs, rhs, comp = abs, tol = 1e-9);
    }

    #[test]
    fn interior_dofs_pass_through_exactly((partition, x, y) in partition_and_vectors(3)) {
        // Per rank: the local dofs that are not external, in conforming order, and whether
        // each of them belongs to a group
        let interiors: Vec<Vec<(usize, bool)>> = partition
            .iter()
            .map(|groups| {
                let grouped: Vec<usize> = groups.groups().iter().flat_map(|group| group.ldofs.clone()).collect();
                (0..groups.num_ldofs())
                    .filter(|ldof| groups.external_ldofs().binary_search(ldof).is_err())
                    .map(|ldof| (ldof, grouped.contains(&ldof)))
                    .collect()
            })
            .collect();
        let results = apply_on_host(partition, x, y);
        for ([x, px, y, pty], interior) in results.iter().zip(&interiors) {
            prop_assert_eq!(interior.len(), x.len());
            for (conforming, &(ldof, grouped)) in interior.iter().enumerate() {
                prop_assert_eq!(px[ldof].to_bits(), x[conforming].to_bits());
                if !grouped {
                    prop_assert_eq!(pty[conforming].to_bits(), y[ldof].to_bits());
                }
            }
        }
    }

    #[test]
    fn device_and_host_paths_are_bit_identical((partition, x, y) in partition_and_vectors(3)) {
        let on_host = apply_on_host(partition.clone(), x.clone(), y.clone());
        let on_managed = apply_on_device::<Managed>(partition.clone(), x.clone(), y.clone());
        let on_host_device = apply_on_device::<Host>(partition, x, y);
        for ((host, managed), host_device) in on_host.iter().zip(&on_managed).zip(&on_host_device) {
            for k in 0..4 {
                let bits = |values: &[f64]| values.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
                prop_assert_eq!(bits(&host[k]), bits(&managed[k]));
                prop_assert_eq!(bits(&host[k]), bits(&host_device[k]));
            }
        }
    }
}
