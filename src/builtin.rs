//! Built-in privileged backend.
//!
//! [`TaskBackend`] implements the core group on top of a kernel task port:
//! it acquires the port lazily, caches it, and performs chunked transfers,
//! allocation and kernel base discovery through a [`TaskPort`].
//!
//! [`Builtin`] is the [`Backend`] the negotiator consults first. On Apple
//! targets it exposes a process-wide `TaskBackend<MachTask>` through C-ABI
//! trampolines; elsewhere it offers nothing.

use core::ffi::c_void;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::backend::Backend;
use crate::error::{Error, KrwResult};
use crate::handlers::{HANDLERS_VERSION, HandlerTable};
use crate::platform::{KernReturn, PORT_NULL, TaskName, TaskPort, is_valid_port};

/// Largest transfer issued per platform call.
pub const MAX_CHUNK: usize = 0xff0;

/// Unslid kernel text base the image-info size is added to.
pub const KERNEL_BASE_OFFSET: u64 = 0xfffffff007004000;

/// Kernel memory operations over a task port.
pub struct TaskBackend<P: TaskPort> {
    port: P,
    /// Cached kernel task port, `PORT_NULL` until acquired.
    task: AtomicU32,
    /// Serializes acquisition only; the cached port is read without it.
    acquire: Mutex<()>,
}

impl<P: TaskPort> TaskBackend<P> {
    pub const fn new(port: P) -> Self {
        Self {
            port,
            task: AtomicU32::new(PORT_NULL),
            acquire: Mutex::new(()),
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    /// Whether a kernel task port is currently cached.
    pub fn has_task(&self) -> bool {
        self.task.load(Ordering::Acquire) != PORT_NULL
    }

    /// The cached kernel task port, acquiring it on first use.
    ///
    /// Tries the host special port first and `task_for_pid(0)` second.
    pub fn kernel_task(&self) -> KrwResult<TaskName> {
        let cached = self.task.load(Ordering::Acquire);
        if cached != PORT_NULL {
            return Ok(cached);
        }

        let _guard = self.acquire.lock();
        let cached = self.task.load(Ordering::Acquire);
        if cached != PORT_NULL {
            return Ok(cached);
        }

        let port = self.lookup_kernel_task()?;
        self.task.store(port, Ordering::Release);
        Ok(port)
    }

    fn lookup_kernel_task(&self) -> KrwResult<TaskName> {
        match self.port.host_special_port() {
            Ok(port) if is_valid_port(port) => {
                debug!("kernel task from host special port 4: {:#x}", port);
                return Ok(port);
            }
            Ok(_) => {}
            Err(KernReturn::INVALID_ARGUMENT) => return Err(Error::PermissionDenied),
            Err(kr) => {
                debug!("host_get_special_port failed: {}", kr);
                return Err(Error::DeviceError);
            }
        }

        match self.port.task_for_kernel() {
            Ok(port) if is_valid_port(port) => {
                debug!("kernel task from task_for_pid(0): {:#x}", port);
                Ok(port)
            }
            Ok(_) => Err(Error::DeviceError),
            // task_for_pid gives no reason, assume it was refused
            Err(_) => Err(Error::PermissionDenied),
        }
    }

    /// Address of the kernel Mach-O header.
    pub fn kbase(&self) -> KrwResult<u64> {
        let task = self.kernel_task()?;
        let info = self
            .port
            .dyld_info(task)
            .map_err(|_| Error::DeviceError)?;
        if info.all_image_info_addr == 0 && info.all_image_info_size == 0 {
            return Err(Error::Unsupported);
        }
        Ok(KERNEL_BASE_OFFSET.wrapping_add(info.all_image_info_size))
    }

    /// Read `len` bytes of kernel memory at `from` into `to`.
    ///
    /// On failure an unknown number of bytes may have been copied.
    ///
    /// # Safety
    /// `to` must be valid for writes of `len` bytes.
    pub unsafe fn kread(&self, from: u64, to: *mut c_void, len: usize) -> KrwResult<()> {
        let start = to as u64;
        check_range(from, len)?;
        check_range(start, len)?;

        let task = self.kernel_task()?;
        let mut from = from;
        let mut dst = start;
        let mut remaining = len as u64;
        while remaining > 0 {
            let chunk = remaining.min(MAX_CHUNK as u64);
            let copied = match unsafe { self.port.read_overwrite(task, from, chunk, dst) } {
                Ok(n) if n > 0 => n.min(chunk),
                Ok(_) => return Err(interrupted(dst != start)),
                Err(kr) => return Err(classify(kr, dst != start)),
            };
            trace!("kread {:#x} <- {:#x} ({:#x} bytes)", dst, from, copied);
            from += copied;
            dst += copied;
            remaining -= copied;
        }
        Ok(())
    }

    /// Write `len` bytes from `from` to kernel memory at `to`.
    ///
    /// On failure an unknown number of bytes may have been written.
    ///
    /// # Safety
    /// `from` must be valid for reads of `len` bytes.
    pub unsafe fn kwrite(&self, from: *const c_void, to: u64, len: usize) -> KrwResult<()> {
        let start = from as u64;
        check_range(start, len)?;
        check_range(to, len)?;

        let task = self.kernel_task()?;
        let mut src = start;
        let mut to = to;
        let mut remaining = len as u64;
        while remaining > 0 {
            let chunk = remaining.min(MAX_CHUNK as u64);
            if let Err(kr) = unsafe { self.port.write(task, to, src, chunk) } {
                return Err(classify(kr, src != start));
            }
            trace!("kwrite {:#x} -> {:#x} ({:#x} bytes)", src, to, chunk);
            src += chunk;
            to += chunk;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Allocate at least `size` bytes of kernel memory.
    pub fn kmalloc(&self, size: usize) -> KrwResult<u64> {
        let task = self.kernel_task()?;
        self.port
            .allocate(task, size as u64)
            .map_err(|kr| match kr {
                KernReturn::INVALID_ARGUMENT => Error::InvalidArgument,
                KernReturn::NO_SPACE | KernReturn::RESOURCE_SHORTAGE => Error::OutOfMemory,
                _ => Error::DeviceError,
            })
    }

    /// Free an allocation made by [`kmalloc`](Self::kmalloc) with the same size.
    pub fn kdealloc(&self, addr: u64, size: usize) -> KrwResult<()> {
        let task = self.kernel_task()?;
        self.port
            .deallocate(task, addr, size as u64)
            .map_err(|kr| match kr {
                KernReturn::INVALID_ARGUMENT => Error::InvalidArgument,
                _ => Error::DeviceError,
            })
    }
}

impl<P: TaskPort> TaskBackend<P> {
    /// Drop the cached kernel task port. The next operation acquires it again.
    pub fn release(&self) {
        let _guard = self.acquire.lock();
        let task = self.task.swap(PORT_NULL, Ordering::AcqRel);
        if task != PORT_NULL {
            debug!("releasing kernel task {:#x}", task);
            self.port.release(task);
        }
    }
}

impl<P: TaskPort> Drop for TaskBackend<P> {
    fn drop(&mut self) {
        let task = *self.task.get_mut();
        if task != PORT_NULL {
            self.port.release(task);
        }
    }
}

#[inline]
fn check_range(addr: u64, len: usize) -> KrwResult<()> {
    addr.checked_add(len as u64)
        .map(|_| ())
        .ok_or(Error::InvalidArgument)
}

/// Failure with no usable error code.
#[inline]
fn interrupted(progressed: bool) -> Error {
    if progressed { Error::Io } else { Error::DeviceError }
}

fn classify(kr: KernReturn, progressed: bool) -> Error {
    match kr {
        KernReturn::INVALID_ARGUMENT | KernReturn::INVALID_ADDRESS => Error::InvalidArgument,
        _ => interrupted(progressed),
    }
}

// =============================================================================
// Process-wide backend
// =============================================================================

/// The built-in backend consulted before any plugin.
pub struct Builtin;

#[cfg(all(target_vendor = "apple", feature = "builtin"))]
mod global {
    use core::ffi::{c_int, c_void};

    use spin::Once;

    use super::TaskBackend;
    use crate::error::Error;
    use crate::platform::MachTask;

    pub(super) static KERNEL: TaskBackend<MachTask> = TaskBackend::new(MachTask);

    static UNLOAD: Once = Once::new();

    /// Statics never drop; the token is released from an exit hook instead.
    pub(super) fn release_at_exit() {
        UNLOAD.call_once(|| {
            if unsafe { libc::atexit(unload) } != 0 {
                warn!("failed to register kernel task release at exit");
            }
        });
    }

    extern "C" fn unload() {
        KERNEL.release();
    }

    pub(super) unsafe extern "C" fn kbase(addr: *mut u64) -> c_int {
        if addr.is_null() {
            return Error::InvalidArgument.code();
        }
        match KERNEL.kbase() {
            Ok(base) => {
                unsafe { addr.write(base) };
                0
            }
            Err(e) => e.code(),
        }
    }

    pub(super) unsafe extern "C" fn kread(from: u64, to: *mut c_void, len: usize) -> c_int {
        Error::to_status(unsafe { KERNEL.kread(from, to, len) })
    }

    pub(super) unsafe extern "C" fn kwrite(from: *mut c_void, to: u64, len: usize) -> c_int {
        Error::to_status(unsafe { KERNEL.kwrite(from, to, len) })
    }

    pub(super) unsafe extern "C" fn kmalloc(addr: *mut u64, size: usize) -> c_int {
        if addr.is_null() {
            return Error::InvalidArgument.code();
        }
        match KERNEL.kmalloc(size) {
            Ok(va) => {
                unsafe { addr.write(va) };
                0
            }
            Err(e) => e.code(),
        }
    }

    pub(super) unsafe extern "C" fn kdealloc(addr: u64, size: usize) -> c_int {
        Error::to_status(KERNEL.kdealloc(addr, size))
    }
}

impl Backend for Builtin {
    fn name(&self) -> &str {
        "builtin"
    }

    #[cfg(all(target_vendor = "apple", feature = "builtin"))]
    fn init_core(&self, handlers: &mut HandlerTable) -> KrwResult<()> {
        if handlers.version < HANDLERS_VERSION {
            return Err(Error::ProtocolTooOld);
        }
        handlers.version = HANDLERS_VERSION;
        global::KERNEL.kernel_task()?;
        global::release_at_exit();
        handlers.kbase = Some(global::kbase);
        handlers.kread = Some(global::kread);
        handlers.kwrite = Some(global::kwrite);
        handlers.kmalloc = Some(global::kmalloc);
        handlers.kdealloc = Some(global::kdealloc);
        Ok(())
    }

    #[cfg(not(all(target_vendor = "apple", feature = "builtin")))]
    fn init_core(&self, handlers: &mut HandlerTable) -> KrwResult<()> {
        if handlers.version < HANDLERS_VERSION {
            return Err(Error::ProtocolTooOld);
        }
        Err(Error::Unsupported)
    }
}
