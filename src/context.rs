//! Lazy negotiation and dispatch.
//!
//! A [`Context`] owns a built-in backend, a source of candidate backends and
//! the handler registry they populate. Negotiation happens once, on the first
//! operation, behind a one-time gate: concurrent first callers block until it
//! completes, after which the registry is read without locking.

use core::ffi::c_void;

use spin::Once;

use crate::backend::Backend;
use crate::builtin::Builtin;
use crate::error::{Error, KrwResult};
use crate::handlers::{Group, HandlerRegistry, Operation, Outcome};
use crate::probe::{BackendSource, PluginDir, probe};

/// Granules accepted by the physical memory operations.
///
/// Any other granule is rejected with [`Error::InvalidArgument`] before a
/// backend sees it, so backends only ever handle these unit sizes. A backend
/// may still refuse one of them with its own status.
pub const GRANULES: &[u8] = &[1, 2, 4, 8];

/// Registry state after negotiation.
struct Negotiated {
    registry: HandlerRegistry,
    /// Winning plugins, kept loaded for as long as their handlers are reachable.
    _modules: Vec<Box<dyn Backend>>,
}

/// Which groups a negotiation resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub core: bool,
    pub extended: bool,
}

/// Negotiation and dispatch context.
pub struct Context {
    builtin: Box<dyn Backend>,
    source: Box<dyn BackendSource>,
    negotiated: Once<Negotiated>,
}

impl Context {
    pub fn new(builtin: Box<dyn Backend>, source: Box<dyn BackendSource>) -> Self {
        Self {
            builtin,
            source,
            negotiated: Once::new(),
        }
    }

    /// The built-in task backend plus the system plugin directory.
    pub fn system() -> Self {
        Self::new(Box::new(Builtin), Box::new(PluginDir::system()))
    }

    /// Negotiate now, if that has not happened yet.
    pub fn init(&self) -> Resolution {
        let registry = self.registry();
        Resolution {
            core: registry.is_resolved(Group::Core),
            extended: registry.is_resolved(Group::Extended),
        }
    }

    /// Whether negotiation has already run.
    pub fn is_negotiated(&self) -> bool {
        self.negotiated.is_completed()
    }

    /// The registry, negotiating first if needed.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.negotiated.call_once(|| self.negotiate()).registry
    }

    /// Whether `op` can be dispatched.
    pub fn supports(&self, op: Operation) -> bool {
        self.registry().get(op).is_some()
    }

    fn negotiate(&self) -> Negotiated {
        let mut registry = HandlerRegistry::new();
        let mut modules = Vec::new();

        if !self.negotiate_builtin(&mut registry) {
            modules.extend(probe(self.source.as_ref(), Group::Core, &mut registry));
        }
        modules.extend(probe(self.source.as_ref(), Group::Extended, &mut registry));

        info!(
            "krw negotiated: core={} extended={}",
            registry.is_resolved(Group::Core),
            registry.is_resolved(Group::Extended)
        );
        Negotiated {
            registry,
            _modules: modules,
        }
    }

    fn negotiate_builtin(&self, registry: &mut HandlerRegistry) -> bool {
        let mut handlers = *registry.table();
        if let Err(e) = self.builtin.init_core(&mut handlers) {
            debug!("{} backend unavailable: {}", self.builtin.name(), e);
            return false;
        }
        match registry.register(Group::Core, &handlers) {
            Outcome::Success => {
                info!("core handlers provided by {} backend", self.builtin.name());
                true
            }
            outcome => {
                warn!("{} backend rejected: {:?}", self.builtin.name(), outcome);
                false
            }
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Kernel base address (the kernel Mach-O header).
    pub fn kbase(&self) -> KrwResult<u64> {
        let f = self.registry().table().kbase.ok_or(Error::Unsupported)?;
        let mut addr = 0u64;
        Error::status(unsafe { f(&mut addr) })?;
        Ok(addr)
    }

    /// Read kernel memory at `from` into `to`.
    pub fn kread(&self, from: u64, to: &mut [u8]) -> KrwResult<()> {
        unsafe { self.kread_raw(from, to.as_mut_ptr().cast(), to.len()) }
    }

    /// Read `len` bytes of kernel memory at `from` into `to`.
    ///
    /// # Safety
    /// `to` must be valid for writes of `len` bytes.
    pub unsafe fn kread_raw(&self, from: u64, to: *mut c_void, len: usize) -> KrwResult<()> {
        let f = self.registry().table().kread.ok_or(Error::Unsupported)?;
        Error::status(unsafe { f(from, to, len) })
    }

    /// Write `from` to kernel memory at `to`.
    pub fn kwrite(&self, from: &[u8], to: u64) -> KrwResult<()> {
        unsafe { self.kwrite_raw(from.as_ptr().cast(), to, from.len()) }
    }

    /// Write `len` bytes from `from` to kernel memory at `to`.
    ///
    /// # Safety
    /// `from` must be valid for reads of `len` bytes.
    pub unsafe fn kwrite_raw(&self, from: *const c_void, to: u64, len: usize) -> KrwResult<()> {
        let f = self.registry().table().kwrite.ok_or(Error::Unsupported)?;
        Error::status(unsafe { f(from.cast_mut(), to, len) })
    }

    /// Allocate at least `size` bytes of kernel memory.
    pub fn kmalloc(&self, size: usize) -> KrwResult<u64> {
        let f = self.registry().table().kmalloc.ok_or(Error::Unsupported)?;
        let mut addr = 0u64;
        Error::status(unsafe { f(&mut addr, size) })?;
        Ok(addr)
    }

    /// Free kernel memory from [`kmalloc`](Self::kmalloc); `size` must match.
    pub fn kdealloc(&self, addr: u64, size: usize) -> KrwResult<()> {
        let f = self.registry().table().kdealloc.ok_or(Error::Unsupported)?;
        Error::status(unsafe { f(addr, size) })
    }

    /// Call kernel code at `func` with `args`, returning its result.
    pub fn kcall(&self, func: u64, args: &[u64]) -> KrwResult<u64> {
        unsafe { self.kcall_raw(func, args.len(), args.as_ptr()) }
    }

    /// Call kernel code at `func` with `argc` arguments read from `argv`.
    ///
    /// # Safety
    /// `argv` must be valid for reads of `argc` values.
    pub unsafe fn kcall_raw(&self, func: u64, argc: usize, argv: *const u64) -> KrwResult<u64> {
        let f = self.registry().table().kcall.ok_or(Error::Unsupported)?;
        let mut ret = 0u64;
        Error::status(unsafe { f(func, argc, argv, &mut ret) })?;
        Ok(ret)
    }

    /// Read physical memory at `from` into `to` in `granule`-sized units.
    ///
    /// `granule` must be one of [`GRANULES`]; otherwise this fails with
    /// [`Error::InvalidArgument`] without calling the backend.
    pub fn physread(&self, from: u64, to: &mut [u8], granule: u8) -> KrwResult<()> {
        unsafe { self.physread_raw(from, to.as_mut_ptr().cast(), to.len(), granule) }
    }

    /// # Safety
    /// `to` must be valid for writes of `len` bytes.
    pub unsafe fn physread_raw(
        &self,
        from: u64,
        to: *mut c_void,
        len: usize,
        granule: u8,
    ) -> KrwResult<()> {
        let f = self.registry().table().physread.ok_or(Error::Unsupported)?;
        check_granule(granule)?;
        Error::status(unsafe { f(from, to, len, granule) })
    }

    /// Write `from` to physical memory at `to` in `granule`-sized units.
    ///
    /// `granule` must be one of [`GRANULES`]; otherwise this fails with
    /// [`Error::InvalidArgument`] without calling the backend.
    pub fn physwrite(&self, from: &[u8], to: u64, granule: u8) -> KrwResult<()> {
        unsafe { self.physwrite_raw(from.as_ptr().cast(), to, from.len(), granule) }
    }

    /// # Safety
    /// `from` must be valid for reads of `len` bytes.
    pub unsafe fn physwrite_raw(
        &self,
        from: *const c_void,
        to: u64,
        len: usize,
        granule: u8,
    ) -> KrwResult<()> {
        let f = self.registry().table().physwrite.ok_or(Error::Unsupported)?;
        check_granule(granule)?;
        Error::status(unsafe { f(from.cast_mut(), to, len, granule) })
    }
}

fn check_granule(granule: u8) -> KrwResult<()> {
    if GRANULES.contains(&granule) {
        Ok(())
    } else {
        Err(Error::InvalidArgument)
    }
}
