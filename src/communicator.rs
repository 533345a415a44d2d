//! Communication over groups of dofs shared between ranks.
//!
//! The local dofs of a rank that are shared with other ranks are partitioned into
//! *groups*. A group is identified by an id that is the same on every member rank, lists
//! its member ranks and has exactly one owner among them. The `k`-th local dof of a group
//! on one rank refers to the same global dof as the `k`-th local dof of that group on any
//! other member rank.
//!
//! Local dofs in groups owned by another rank are *external*: their conforming value lives
//! on the owner.
use crate::error::{DeviceError, DofGroupsError};
use crate::memory::Residency;
use eyre::{bail, eyre};
use fenris_traits::Real;
use log::trace;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{de, Deserialize, Deserializer, Serialize};
use std::sync::{Arc, Barrier};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DofGroup {
    pub id: usize,
    /// Member ranks of the group.
    pub ranks: Vec<usize>,
    pub owner: usize,
    /// Local dofs of this rank in the group, in the order shared by all members.
    pub ldofs: Vec<usize>,
}

/// The partition of the shared local dofs of one rank into communication groups.
///
/// Deserialization validates the partition like [`DofGroups::try_new`]. External dofs are
/// not stored, but recomputed from the groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DofGroups {
    rank: usize,
    num_ldofs: usize,
    groups: Vec<DofGroup>,
    // Sorted
    #[serde(skip)]
    external_ldofs: Vec<usize>,
}

impl<'de> Deserialize<'de> for DofGroups {
    fn deserialize<De: Deserializer<'de>>(deserializer: De) -> Result<Self, De::Error> {
        #[derive(Deserialize)]
        struct DofGroupsData {
            rank: usize,
            num_ldofs: usize,
            groups: Vec<DofGroup>,
        }

        let data = DofGroupsData::deserialize(deserializer)?;
        Self::try_new(data.rank, data.num_ldofs, data.groups).map_err(de::Error::custom)
    }
}

impl DofGroups {
    pub fn try_new(rank: usize, num_ldofs: usize, groups: Vec<DofGroup>) -> Result<Self, DofGroupsError> {
        let mut group_ids = FxHashSet::default();
        let mut seen_ldofs = FxHashSet::default();
        let mut external_ldofs = Vec::new();

        for group in &groups {
            if !group_ids.insert(group.id) {
                return Err(DofGroupsError::DuplicateGroup { group: group.id });
            }
            let mut members = FxHashSet::default();
            if let Some(&duplicate) = group.ranks.iter().find(|&&member| !members.insert(member)) {
                return Err(DofGroupsError::DuplicateRank {
                    group: group.id,
                    rank: duplicate,
                });
            }
            if !group.ranks.contains(&group.owner) {
                return Err(DofGroupsError::OwnerNotMember {
                    group: group.id,
                    owner: group.owner,
                });
            }
            if !group.ranks.contains(&rank) {
                return Err(DofGroupsError::RankNotMember { group: group.id, rank });
            }
            for &ldof in &group.ldofs {
                if ldof >= num_ldofs {
                    return Err(DofGroupsError::LdofOutOfRange { ldof, num_ldofs });
                }
                if !seen_ldofs.insert(ldof) {
                    return Err(DofGroupsError::LdofNotDisjoint { ldof });
                }
            }
            if group.owner != rank {
                external_ldofs.extend_from_slice(&group.ldofs);
            }
        }
        external_ldofs.sort_unstable();

        Ok(Self {
            rank,
            num_ldofs,
            groups,
            external_ldofs,
        })
    }

    /// Dofs of a single process that shares nothing.
    pub fn serial(num_ldofs: usize) -> Self {
        Self {
            rank: 0,
            num_ldofs,
            groups: Vec::new(),
            external_ldofs: Vec::new(),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_ldofs(&self) -> usize {
        self.num_ldofs
    }

    /// Number of local dofs whose conforming value is held by this rank.
    pub fn num_true_dofs(&self) -> usize {
        self.num_ldofs - self.external_ldofs.len()
    }

    pub fn groups(&self) -> &[DofGroup] {
        &self.groups
    }

    /// Local dofs owned by another rank, in ascending order.
    pub fn external_ldofs(&self) -> &[usize] {
        &self.external_ldofs
    }
}

/// How the values held by the members of a group are combined.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Reduction {
    /// Sum of the values held by all members.
    Sum,
    /// The value held by the owner of the group.
    FirstWriter,
}

/// Collective combine-and-redistribute over dof groups.
///
/// `combine_and_broadcast` is a blocking collective: every rank taking part in a group must
/// call it, with the same reduction, before any of them returns. Ranks that disagree on the
/// sequence of calls deadlock or produce meaningless values; this cannot be detected locally.
pub trait GroupCommunicator<T: Real> {
    fn groups(&self) -> &DofGroups;

    /// Memory space of the buffers passed to `combine_and_broadcast`.
    fn residency(&self) -> Residency {
        Residency::Host
    }

    /// For every group, combines the values of its local dofs across all members according
    /// to `reduction`, and writes the combined value into the local dofs of every member.
    ///
    /// `buffer` holds one entry per local dof. Entries outside of groups are not touched.
    fn combine_and_broadcast(&self, buffer: &mut [T], reduction: Reduction) -> eyre::Result<()>;
}

impl<'a, T: Real, C: ?Sized + GroupCommunicator<T>> GroupCommunicator<T> for &'a C {
    fn groups(&self) -> &DofGroups {
        C::groups(self)
    }

    fn residency(&self) -> Residency {
        C::residency(self)
    }

    fn combine_and_broadcast(&self, buffer: &mut [T], reduction: Reduction) -> eyre::Result<()> {
        C::combine_and_broadcast(self, buffer, reduction)
    }
}

/// Communicator of a rank that shares no dofs with anyone.
#[derive(Debug, Clone)]
pub struct SerialCommunicator {
    groups: DofGroups,
}

impl SerialCommunicator {
    pub fn new(num_ldofs: usize) -> Self {
        Self {
            groups: DofGroups::serial(num_ldofs),
        }
    }
}

impl<T: Real> GroupCommunicator<T> for SerialCommunicator {
    fn groups(&self) -> &DofGroups {
        &self.groups
    }

    fn combine_and_broadcast(&self, buffer: &mut [T], _reduction: Reduction) -> eyre::Result<()> {
        DeviceError::check_size("combine_and_broadcast", self.groups.num_ldofs(), buffer.len())?;
        Ok(())
    }
}

#[derive(Debug)]
struct GroupSlot<T> {
    // (rank, values of the group's dofs on that rank)
    contributions: Vec<(usize, Vec<T>)>,
    remaining_reads: usize,
}

/// A set of ranks running as threads of the same process.
///
/// Each rank obtains its [`LocalCommunicator`] from the cluster and drives it from its own
/// thread. Every collective call must be made by *all* ranks of the cluster, including
/// ranks that share no dofs.
#[derive(Debug)]
pub struct LocalCluster<T> {
    num_ranks: usize,
    barrier: Arc<Barrier>,
    exchange: Arc<Mutex<FxHashMap<usize, GroupSlot<T>>>>,
}

impl<T: Real> LocalCluster<T> {
    pub fn new(num_ranks: usize) -> Self {
        Self {
            num_ranks,
            barrier: Arc::new(Barrier::new(num_ranks)),
            exchange: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    /// The communicator of rank `groups.rank()`.
    ///
    /// # Panics
    ///
    /// Panics if the rank or any group member is not a rank of this cluster.
    pub fn communicator(&self, groups: DofGroups) -> LocalCommunicator<T> {
        assert!(groups.rank() < self.num_ranks, "Rank must belong to the cluster.");
        assert!(
            groups
                .groups()
                .iter()
                .flat_map(|group| &group.ranks)
                .all(|&rank| rank < self.num_ranks),
            "Group members must belong to the cluster."
        );
        LocalCommunicator {
            groups,
            barrier: Arc::clone(&self.barrier),
            exchange: Arc::clone(&self.exchange),
        }
    }
}

#[derive(Debug)]
pub struct LocalCommunicator<T> {
    groups: DofGroups,
    barrier: Arc<Barrier>,
    exchange: Arc<Mutex<FxHashMap<usize, GroupSlot<T>>>>,
}

impl<T: Real> LocalCommunicator<T> {
    fn publish(&self, buffer: &[T]) {
        let mut exchange = self.exchange.lock();
        let rank = self.groups.rank();
        for group in self.groups.groups() {
            let values = group.ldofs.iter().map(|&ldof| buffer[ldof]).collect();
            let slot = exchange.entry(group.id).or_insert_with(|| GroupSlot {
                contributions: Vec::with_capacity(group.ranks.len()),
                remaining_reads: 0,
            });
            // Every contributor reads the slot exactly once
            slot.remaining_reads += 1;
            // Kept in rank order, so that every member sums in the same order
            let position = slot
                .contributions
                .partition_point(|(other, _)| *other < rank);
            slot.contributions.insert(position, (rank, values));
        }
    }

    /// Checks that every group of this rank received a consistent set of contributions.
    fn validate(&self, exchange: &FxHashMap<usize, GroupSlot<T>>) -> eyre::Result<()> {
        for group in self.groups.groups() {
            let slot = exchange
                .get(&group.id)
                .ok_or_else(|| eyre!("no contributions were published for group {}", group.id))?;
            if slot.contributions.len() != group.ranks.len() {
                bail!(
                    "group {} has {} members, but {} contributed",
                    group.id,
                    group.ranks.len(),
                    slot.contributions.len()
                );
            }
            if let Some((rank, _)) = slot
                .contributions
                .iter()
                .find(|(_, values)| values.len() != group.ldofs.len())
            {
                bail!("rank {} contributed a different number of dofs to group {}", rank, group.id);
            }
            if !slot.contributions.iter().any(|(rank, _)| *rank == group.owner) {
                bail!("owner {} of group {} did not contribute", group.owner, group.id);
            }
        }
        Ok(())
    }

    fn collect(&self, buffer: &mut [T], reduction: Reduction) -> eyre::Result<()> {
        let mut exchange = self.exchange.lock();
        let result = self.validate(&exchange);
        if result.is_ok() {
            for group in self.groups.groups() {
                let contributions = &exchange[&group.id].contributions;
                match reduction {
                    Reduction::Sum => {
                        for (k, &ldof) in group.ldofs.iter().enumerate() {
                            buffer[ldof] = contributions
                                .iter()
                                .fold(T::zero(), |sum, (_, values)| sum + values[k]);
                        }
                    }
                    Reduction::FirstWriter => {
                        let owner_values = contributions
                            .iter()
                            .find(|(rank, _)| *rank == group.owner)
                            .map(|(_, values)| values.as_slice())
                            .unwrap_or_default();
                        for (&ldof, &value) in group.ldofs.iter().zip(owner_values) {
                            buffer[ldof] = value;
                        }
                    }
                }
            }
        }

        // Every read is released, also after a failed round, so the next round starts clean
        for group in self.groups.groups() {
            if let Some(slot) = exchange.get_mut(&group.id) {
                slot.remaining_reads -= 1;
                if slot.remaining_reads == 0 {
                    exchange.remove(&group.id);
                }
            }
        }
        result
    }
}

impl<T: Real> GroupCommunicator<T> for LocalCommunicator<T> {
    fn groups(&self) -> &DofGroups {
        &self.groups
    }

    fn combine_and_broadcast(&self, buffer: &mut [T], reduction: Reduction) -> eyre::Result<()> {
        // Checked before entering the collective, so that a rank with a malformed buffer
        // fails without leaving its contributions behind
        DeviceError::check_size("combine_and_broadcast", self.groups.num_ldofs(), buffer.len())?;
        trace!(
            "rank {} combining {} groups with {:?}",
            self.groups.rank(),
            self.groups.groups().len(),
            reduction
        );

        self.publish(buffer);
        self.barrier.wait();
        let result = self.collect(buffer, reduction);
        // No rank may publish for the next round before everyone has collected
        self.barrier.wait();
        result
    }
}
