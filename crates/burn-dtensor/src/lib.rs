#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Burn distributed tensors: sharding propagation.
//!
//! A distributed tensor is described by a [`DTensorSpec`](sharding::DTensorSpec): the
//! [`DeviceMesh`](sharding::DeviceMesh) it lives on and one [`Placement`](sharding::Placement)
//! per mesh dimension. Before an operator runs, its [`OpSchema`](ops::OpSchema) goes through a
//! [`ShardingPropagator`](ops::ShardingPropagator), which either resolves the placements of
//! the outputs or suggests how the inputs should be redistributed first.

extern crate alloc;

pub mod config;
pub mod error;
pub mod ops;
pub mod sharding;

#[cfg(test)]
mod test_utils;

pub use config::*;
pub use error::*;
