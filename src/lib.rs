//! Kernel read/write
//!
//! A stable set of kernel memory operations whose implementation is
//! negotiated at first use between a built-in task-port backend and plugins
//! found in [`probe::PLUGIN_DIR`].
//!
//! Backends rarely implement every operation, so each one reports
//! [`Error::Unsupported`] when no backend provides it.
//!
//! # Capability groups
//!
//! - core: `kbase`, `kread`, `kwrite`, `kmalloc`, `kdealloc`
//! - extended: `kcall`, `physread`, `physwrite`
//!
//! The core group is served by the built-in backend when it can obtain the
//! kernel task port, and by the first plugin exporting a working
//! `krw_initializer` otherwise. The extended group is always served by a
//! plugin exporting `kcall_initializer`, which is handed the resolved core
//! handlers.
//!
//! # Features
//!
//! - `builtin` - Task-port backend on Apple targets (default)
//! - `cabi` - Export the C functions declared in `libkrw.h`
//!
//! # Quick Start
//!
//! ```ignore
//! let base = krw::kbase()?;
//! let mut magic = [0u8; 4];
//! krw::kread(base, &mut magic)?;
//!
//! let addr = krw::kmalloc(0x10)?;
//! krw::kwrite(&0x1122334455667788u64.to_le_bytes(), addr)?;
//! krw::kdealloc(addr, 0x10)?;
//! ```
//!
//! Passing invalid kernel addresses to any of these functions may panic the
//! kernel.

#[macro_use]
extern crate log;

pub mod backend;
pub mod builtin;
pub mod context;
pub mod error;
pub mod handlers;
pub mod platform;
pub mod probe;

#[cfg(feature = "cabi")]
pub mod ffi;

pub use backend::Backend;
pub use context::{Context, Resolution};
pub use error::{Error, KrwResult};
pub use handlers::{Group, HANDLERS_VERSION, HandlerTable, Operation};
pub use probe::{BackendSource, Candidate, PluginDir};

/// The process-wide context.
static GLOBAL: spin::Lazy<Context> = spin::Lazy::new(Context::system);

/// The context behind the crate-level functions.
pub fn global() -> &'static Context {
    &GLOBAL
}

// =============================================================================
// Initialization
// =============================================================================

/// Negotiate backends now instead of on first use.
///
/// Optional; every operation negotiates on demand.
pub fn init() -> Resolution {
    info!("Initializing krw...");
    let resolution = GLOBAL.init();
    info!(
        "  - core handlers: {}",
        if resolution.core { "resolved" } else { "unsupported" }
    );
    info!(
        "  - extended handlers: {}",
        if resolution.extended { "resolved" } else { "unsupported" }
    );
    resolution
}

// =============================================================================
// Operations
// =============================================================================

/// Kernel base, the address of the kernel Mach-O header.
pub fn kbase() -> KrwResult<u64> {
    GLOBAL.kbase()
}

/// Read kernel memory at `from` into `to`.
///
/// On failure an unknown number of bytes may have been read.
pub fn kread(from: u64, to: &mut [u8]) -> KrwResult<()> {
    GLOBAL.kread(from, to)
}

/// Write `from` to kernel memory at `to`.
///
/// On failure an unknown number of bytes may have been written.
pub fn kwrite(from: &[u8], to: u64) -> KrwResult<()> {
    GLOBAL.kwrite(from, to)
}

/// Allocate at least `size` bytes of readable, writable kernel memory,
/// aligned to at least 8 bytes.
pub fn kmalloc(size: usize) -> KrwResult<u64> {
    GLOBAL.kmalloc(size)
}

/// Free memory from [`kmalloc`]. `size` must be the size passed to it.
pub fn kdealloc(addr: u64, size: usize) -> KrwResult<()> {
    GLOBAL.kdealloc(addr, size)
}

/// Call kernel code at `func` with `args`.
pub fn kcall(func: u64, args: &[u64]) -> KrwResult<u64> {
    GLOBAL.kcall(func, args)
}

/// Read physical memory in units of `granule` bytes.
///
/// Granules other than 1, 2, 4 and 8 fail with [`Error::InvalidArgument`]
/// before reaching a backend.
pub fn physread(from: u64, to: &mut [u8], granule: u8) -> KrwResult<()> {
    GLOBAL.physread(from, to, granule)
}

/// Write physical memory in units of `granule` bytes.
///
/// Granules other than 1, 2, 4 and 8 fail with [`Error::InvalidArgument`]
/// before reaching a backend.
pub fn physwrite(from: &[u8], to: u64, granule: u8) -> KrwResult<()> {
    GLOBAL.physwrite(from, to, granule)
}
