use crate::communicator::{DofGroup, DofGroups};
use ::proptest::prelude::*;
use ::proptest::sample::subsequence;
use std::collections::BTreeMap;

/// Sharing patterns for `num_ranks` ranks.
///
/// Entry `g` of a pattern is the (sorted, non-empty) set of ranks referencing global dof `g`.
pub fn sharing_pattern(num_ranks: usize, max_dofs: usize) -> impl Strategy<Value = Vec<Vec<usize>>> {
    assert!(num_ranks > 0, "Need at least one rank.");
    let ranks: Vec<_> = (0..num_ranks).collect();
    ::proptest::collection::vec(subsequence(ranks, 1..=num_ranks), 0..=max_dofs)
}

/// Builds the dof partition of every rank from a sharing pattern.
///
/// Every rank numbers its local dofs in ascending order of global dof. Global dofs referenced
/// by the same set of two or more ranks form one group, owned by the lowest rank of the set.
pub fn partition_from_sharing(num_ranks: usize, sharing: &[Vec<usize>]) -> Vec<DofGroups> {
    let mut num_ldofs = vec![0; num_ranks];
    // For each global dof, its local index on every referencing rank
    let mut local_indices = Vec::with_capacity(sharing.len());
    for ranks in sharing {
        let indices: BTreeMap<usize, usize> = ranks
            .iter()
            .map(|&rank| {
                assert!(rank < num_ranks, "Rank out of bounds in sharing pattern.");
                let ldof = num_ldofs[rank];
                num_ldofs[rank] += 1;
                (rank, ldof)
            })
            .collect();
        local_indices.push(indices);
    }

    // Group ids follow the ordering of the rank sets, so all ranks agree on them
    let mut group_dofs: BTreeMap<Vec<usize>, Vec<usize>> = BTreeMap::new();
    for (global, indices) in local_indices.iter().enumerate() {
        if indices.len() > 1 {
            let ranks = indices.keys().copied().collect();
            group_dofs.entry(ranks).or_default().push(global);
        }
    }

    (0..num_ranks)
        .map(|rank| {
            let groups = group_dofs
                .iter()
                .enumerate()
                .filter(|(_, (ranks, _))| ranks.contains(&rank))
                .map(|(id, (ranks, globals))| DofGroup {
                    id,
                    ranks: ranks.clone(),
                    owner: ranks[0],
                    ldofs: globals
                        .iter()
                        .map(|global| local_indices[*global][&rank])
                        .collect(),
                })
                .collect();
            DofGroups::try_new(rank, num_ldofs[rank], groups)
                .expect("Internal error: partition built from a sharing pattern must be valid")
        })
        .collect()
}
