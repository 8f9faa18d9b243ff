//! Lock-free concurrent data structures on a hazard-pointer safe memory
//! reclamation (SMR) foundation.
//!
//! The SMR engine ([`smr`]) and the non-blocking hash map ([`map`]) are the
//! two load-bearing pieces; the striped counter, stack, queue, and sorted
//! list are simpler consumers of the same reclamation machinery.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

mod atomic;
mod bag;
mod config;
mod global;
mod hazard;
mod local;
mod retire;
mod smr;

pub mod counter;
pub mod list;
pub mod map;
pub mod queue;
pub mod stack;

pub use crate::config::{Config, ConfigBuilder, ConfigError};
pub use crate::smr::{scan_now, unsafe_full_clean};

pub use crate::counter::StripedCounter;
pub use crate::list::SortedList;
pub use crate::map::NonBlockingMap;
pub use crate::queue::Queue;
pub use crate::stack::Stack;
