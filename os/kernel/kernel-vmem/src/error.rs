use crate::addresses::{Depth, MapSize};

/// Recoverable address-space failures.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmError {
    /// No free extent fits the request.
    #[error("no free virtual range for {0}")]
    OutOfVirtualSpace(MapSize),
}

/// Why [`PageTable::set`](crate::PageTable::set) could not install an entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SetError {
    /// The path ends in a large page above the requested depth.
    #[error("path is covered by a large page at {depth:?}")]
    BlockedByLargePage { depth: Depth },
    /// The entry at the requested depth links a finer table.
    #[error("entry at {depth:?} links a page table")]
    BlockedByTable { depth: Depth },
}
