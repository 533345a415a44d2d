//! Precondition failures reported by device storage and dof partitions.
use std::error::Error;
use std::fmt;

/// A violated precondition on a device vector or array operation.
///
/// None of these are recoverable in the sense that a retry could succeed: they indicate
/// that the caller passed operands of incompatible shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Two operands (or an operand and an operator) disagree on their size.
    SizeMismatch {
        operation: &'static str,
        expected: usize,
        actual: usize,
    },
    /// An index addressed an entry outside of the buffer.
    IndexOutOfBounds { index: usize, len: usize },
    /// A sub-range `[offset, offset + count)` does not fit in the buffer.
    RangeOutOfBounds { offset: usize, count: usize, len: usize },
    /// Arrays have between one and four extents.
    InvalidExtents { extents: Vec<usize> },
}

impl DeviceError {
    pub(crate) fn check_size(operation: &'static str, expected: usize, actual: usize) -> Result<(), Self> {
        if expected == actual {
            Ok(())
        } else {
            Err(Self::SizeMismatch {
                operation,
                expected,
                actual,
            })
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeMismatch {
                operation,
                expected,
                actual,
            } => write!(f, "size mismatch in {operation}: expected {expected}, got {actual}"),
            Self::IndexOutOfBounds { index, len } => {
                write!(f, "index {index} out of bounds for buffer of length {len}")
            }
            Self::RangeOutOfBounds { offset, count, len } => write!(
                f,
                "range [{offset}, {}) out of bounds for buffer of length {len}",
                offset + count
            ),
            Self::InvalidExtents { extents } => {
                write!(f, "invalid array extents {extents:?}: expected between 1 and 4 extents")
            }
        }
    }
}

impl Error for DeviceError {}

/// A dof group partition that does not describe a valid communication pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DofGroupsError {
    LdofOutOfRange { ldof: usize, num_ldofs: usize },
    /// A local dof appears in more than one group (or twice in the same group).
    LdofNotDisjoint { ldof: usize },
    OwnerNotMember { group: usize, owner: usize },
    /// The local rank is not listed among the ranks of one of its groups.
    RankNotMember { group: usize, rank: usize },
    DuplicateGroup { group: usize },
    /// A rank is listed more than once among the members of a group.
    DuplicateRank { group: usize, rank: usize },
}

impl fmt::Display for DofGroupsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LdofOutOfRange { ldof, num_ldofs } => {
                write!(f, "local dof {ldof} out of range for {num_ldofs} local dofs")
            }
            Self::LdofNotDisjoint { ldof } => write!(f, "local dof {ldof} belongs to more than one group"),
            Self::OwnerNotMember { group, owner } => {
                write!(f, "owner rank {owner} of group {group} is not a member of the group")
            }
            Self::RankNotMember { group, rank } => {
                write!(f, "rank {rank} holds dofs of group {group} but is not a member of it")
            }
            Self::DuplicateGroup { group } => write!(f, "group {group} is listed more than once"),
            Self::DuplicateRank { group, rank } => {
                write!(f, "rank {rank} is listed more than once among the members of group {group}")
            }
        }
    }
}

impl Error for DofGroupsError {}
