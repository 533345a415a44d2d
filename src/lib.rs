//! Device-resident vectors and arrays, and the conforming prolongation operator that moves
//! data between the local dofs of a rank and the globally conforming true dofs.
//!
//! Storage types are generic over a [`memory::Device`], which is either host memory
//! ([`memory::Host`]) or an accelerator ([`memory::Managed`]). Code written against the
//! `Device` trait runs on both.
pub mod array;
pub mod communicator;
pub mod error;
pub mod kernels;
pub mod memory;
pub mod prolongation;
pub mod vector;

#[cfg(feature = "proptest")]
pub mod proptest;

pub extern crate nalgebra;

pub use fenris_traits::{Real, Scalar};
