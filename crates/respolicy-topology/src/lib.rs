#![doc = include_str!("../readme.md")]

pub mod allocator;
pub mod cpuset;
pub mod sysfs;
pub mod system;
pub mod tree;

pub use allocator::{AllocationError, CpuAllocator, Resize};
pub use cpuset::CpuSet;
pub use sysfs::{DiscoveryError, SysFs};
pub use system::{CoreKind, MemType, MemTypeSet, System};
pub use tree::{CpuTree, NodeId, TopoLevel};
