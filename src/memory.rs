//! Device memory management.
//!
//! A [`Device`] allocates, releases and copies buffers in its memory space and
//! executes the numeric kernels in [`crate::kernels`]. Two backends are provided:
//!
//! - [`Host`] keeps buffers in ordinary host memory and executes kernels eagerly.
//! - [`Managed`] models an accelerator with managed (unified) memory. Kernel launches are
//!   queued on a stream, and every operation that observes their results (reductions,
//!   transfers, releasing a buffer) first synchronizes with the stream.
//!
//! Both backends satisfy the same contracts, so any code generic over `D: Device` runs
//! unchanged on either.
//!
//! Allocation failure is fatal: buffers are obtained from the global allocator, which aborts
//! the process when a request cannot be satisfied.
use fenris_traits::Scalar;
use std::fmt;
use std::fmt::Debug;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// The memory space that holds the authoritative data of a buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Residency {
    Host,
    Device,
}

/// Direction of a buffer copy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Transfer {
    HostToHost,
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

impl Transfer {
    pub fn between(source: Residency, destination: Residency) -> Self {
        match (source, destination) {
            (Residency::Host, Residency::Host) => Self::HostToHost,
            (Residency::Host, Residency::Device) => Self::HostToDevice,
            (Residency::Device, Residency::Host) => Self::DeviceToHost,
            (Residency::Device, Residency::Device) => Self::DeviceToDevice,
        }
    }
}

/// An event emitted by a device to its [`MemoryObserver`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryEvent {
    Allocate { residency: Residency, bytes: usize },
    Release { residency: Residency, bytes: usize },
    Copy { transfer: Transfer, bytes: usize },
    Synchronize,
}

/// Receives memory events from a device.
///
/// Observers are called synchronously from the operation that triggers the event, so
/// implementations should be cheap.
pub trait MemoryObserver: Send + Sync {
    fn notify(&self, event: &MemoryEvent);
}

/// A [`MemoryObserver`] that counts events.
#[derive(Debug, Default)]
pub struct MemoryCounters {
    allocations: AtomicUsize,
    releases: AtomicUsize,
    bytes_allocated: AtomicUsize,
    bytes_released: AtomicUsize,
    // Indexed by `Transfer as usize`
    transfers: [AtomicUsize; 4],
    transferred_bytes: AtomicUsize,
    synchronizations: AtomicUsize,
}

/// A point-in-time copy of [`MemoryCounters`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub allocations: usize,
    pub releases: usize,
    pub bytes_allocated: usize,
    pub bytes_released: usize,
    transfers: [usize; 4],
    pub transferred_bytes: usize,
    pub synchronizations: usize,
}

impl MemoryStats {
    /// Number of buffers allocated but not yet released.
    pub fn live_allocations(&self) -> usize {
        self.allocations - self.releases
    }

    pub fn transfers(&self, transfer: Transfer) -> usize {
        self.transfers[transfer as usize]
    }
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MemoryStats {
        let load = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);
        MemoryStats {
            allocations: load(&self.allocations),
            releases: load(&self.releases),
            bytes_allocated: load(&self.bytes_allocated),
            bytes_released: load(&self.bytes_released),
            transfers: std::array::from_fn(|i| load(&self.transfers[i])),
            transferred_bytes: load(&self.transferred_bytes),
            synchronizations: load(&self.synchronizations),
        }
    }
}

impl MemoryObserver for MemoryCounters {
    fn notify(&self, event: &MemoryEvent) {
        match *event {
            MemoryEvent::Allocate { bytes, .. } => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                self.bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
            }
            MemoryEvent::Release { bytes, .. } => {
                self.releases.fetch_add(1, Ordering::Relaxed);
                self.bytes_released.fetch_add(bytes, Ordering::Relaxed);
            }
            MemoryEvent::Copy { transfer, bytes } => {
                self.transfers[transfer as usize].fetch_add(1, Ordering::Relaxed);
                self.transferred_bytes.fetch_add(bytes, Ordering::Relaxed);
            }
            MemoryEvent::Synchronize => {
                self.synchronizations.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// The device memory manager contract.
///
/// All operations are synchronous from the point of view of the caller: when `copy` returns,
/// the destination holds the data, and when `release` returns, no queued kernel can still
/// touch the buffer.
///
/// Zero-length buffers do not allocate and produce no events.
pub trait Device: Debug + Clone + Default + Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn residency(&self) -> Residency;

    fn observer(&self) -> Option<&dyn MemoryObserver>;

    /// Records that a kernel has been launched on this device.
    ///
    /// Backends that execute kernels asynchronously use this to know whether the next
    /// synchronization point actually has to wait.
    fn record_launch(&self) {}

    /// Blocks until all kernels launched on this device have completed.
    fn synchronize(&self) {}

    fn notify(&self, event: MemoryEvent) {
        if let Some(observer) = self.observer() {
            observer.notify(&event);
        }
    }

    /// Allocates a buffer of `len` elements, filled with `T::default()`.
    fn allocate<T: Scalar>(&self, len: usize) -> Box<[T]> {
        let buffer = vec![T::default(); len].into_boxed_slice();
        if len > 0 {
            self.notify(MemoryEvent::Allocate {
                residency: self.residency(),
                bytes: len * size_of::<T>(),
            });
        }
        buffer
    }

    fn release<T: Scalar>(&self, buffer: Box<[T]>) {
        if !buffer.is_empty() {
            self.synchronize();
            self.notify(MemoryEvent::Release {
                residency: self.residency(),
                bytes: buffer.len() * size_of::<T>(),
            });
        }
        drop(buffer);
    }

    /// Copies `source` into `destination`.
    ///
    /// # Panics
    ///
    /// A copy between buffers of different lengths cannot complete, which is fatal.
    fn copy<T: Scalar>(&self, destination: &mut [T], source: &[T], transfer: Transfer) {
        assert_eq!(
            destination.len(),
            source.len(),
            "Transfer failure: source and destination buffers must have the same length"
        );
        if source.is_empty() {
            return;
        }
        self.synchronize();
        destination.copy_from_slice(source);
        self.notify(MemoryEvent::Copy {
            transfer,
            bytes: source.len() * size_of::<T>(),
        });
    }
}

/// Buffers in host memory, kernels executed eagerly on the calling thread.
#[derive(Clone, Default)]
pub struct Host {
    observer: Option<Arc<dyn MemoryObserver>>,
}

impl Host {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(self, observer: Arc<dyn MemoryObserver>) -> Self {
        Self {
            observer: Some(observer),
        }
    }
}

impl Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("observed", &self.observer.is_some())
            .finish()
    }
}

impl Device for Host {
    fn name(&self) -> &'static str {
        "host"
    }

    fn residency(&self) -> Residency {
        Residency::Host
    }

    fn observer(&self) -> Option<&dyn MemoryObserver> {
        self.observer.as_deref()
    }
}

/// An accelerator backed by managed memory.
///
/// Clones share the same stream, so a launch recorded through one clone is waited for by a
/// synchronization through any other.
#[derive(Clone, Default)]
pub struct Managed {
    observer: Option<Arc<dyn MemoryObserver>>,
    pending: Arc<AtomicBool>,
}

impl Managed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(self, observer: Arc<dyn MemoryObserver>) -> Self {
        Self {
            observer: Some(observer),
            ..self
        }
    }

    /// Whether kernels have been launched since the last synchronization.
    pub fn has_pending_work(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

impl Debug for Managed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Managed")
            .field("observed", &self.observer.is_some())
            .field("pending", &self.has_pending_work())
            .finish()
    }
}

impl Device for Managed {
    fn name(&self) -> &'static str {
        "managed"
    }

    fn residency(&self) -> Residency {
        Residency::Device
    }

    fn observer(&self) -> Option<&dyn MemoryObserver> {
        self.observer.as_deref()
    }

    fn record_launch(&self) {
        self.pending.store(true, Ordering::Release);
    }

    fn synchronize(&self) {
        if self.pending.swap(false, Ordering::AcqRel) {
            self.notify(MemoryEvent::Synchronize);
        }
    }
}
