//! Distributed datasets.
//!
//! A [`DistributedArray`] is an ordered sequence of row chunks, each held in
//! the object store of one worker. A [`DataHandler`] groups the partitions of
//! one or more co-partitioned arrays by worker, and the
//! [`PartitionDirectory`] turns that grouping into a parts-to-ranks table
//! once a communicator session has assigned ranks.

pub mod distributed;
pub mod handler;
pub mod layout;

pub use distributed::{DistributedArray, PartitionHandle, PartitionedArray, Placement};
pub use handler::{DataHandler, PartGroup};
pub use layout::{PartRank, PartitionDirectory, PartsToRanks};
