//! Backend negotiation contract.

use crate::error::{Error, KrwResult};
use crate::handlers::{Group, HandlerTable};

/// A provider of privileged memory operations.
///
/// A backend is asked, per capability group, to fill a handler table that
/// the caller pre-populates with everything resolved so far. A backend that
/// does not offer a group returns [`Error::Unsupported`]; any other error is a
/// failed negotiation.
pub trait Backend: Send + Sync {
    /// Display name used in diagnostics.
    fn name(&self) -> &str;

    /// Fill the core slots (kbase, kread, kwrite, kmalloc, kdealloc).
    fn init_core(&self, handlers: &mut HandlerTable) -> KrwResult<()>;

    /// Fill the extended slots (kcall, physread, physwrite).
    ///
    /// `handlers` already carries the resolved core slots.
    fn init_extended(&self, _handlers: &mut HandlerTable) -> KrwResult<()> {
        Err(Error::Unsupported)
    }

    /// Negotiate `group`.
    fn negotiate(&self, group: Group, handlers: &mut HandlerTable) -> KrwResult<()> {
        match group {
            Group::Core => self.init_core(handlers),
            Group::Extended => self.init_extended(handlers),
        }
    }
}

/// A backend that offers nothing.
pub struct NullBackend;

impl Backend for NullBackend {
    fn name(&self) -> &str {
        "none"
    }

    fn init_core(&self, _handlers: &mut HandlerTable) -> KrwResult<()> {
        Err(Error::Unsupported)
    }
}
