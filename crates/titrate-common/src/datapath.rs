//! Datapath attachment seams.
//!
//! The attachment manager only sees these traits; the loader backend (aya on
//! Linux) and the in-memory test doubles implement them.

use crate::error::ShaperResult;

/// Opaque handle to one XDP attachment, issued by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkHandle(pub u64);

/// Resolves interface names to kernel interface indices.
pub trait InterfaceResolver: Send + Sync {
    /// Returns the kernel index of `name`, or
    /// [`ShaperError::InterfaceNotFound`](crate::ShaperError::InterfaceNotFound).
    fn resolve(&self, name: &str) -> ShaperResult<u32>;
}

/// Allow-listing and attach/detach of the datapath program.
pub trait DatapathAttach: Send {
    /// Marks `if_index` as allowed in the allow-list record.
    fn allow(&mut self, if_index: u32) -> ShaperResult<()>;

    /// Attaches the program to `if_index` in generic (skb) mode.
    fn attach(&mut self, interface: &str, if_index: u32) -> ShaperResult<LinkHandle>;

    /// Releases an attachment previously returned by [`attach`](Self::attach).
    fn detach(&mut self, interface: &str, handle: LinkHandle) -> ShaperResult<()>;
}
