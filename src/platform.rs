//! Platform abstraction over the privileged task-port primitives.
//!
//! The built-in backend only talks to the kernel through [`TaskPort`], so it
//! can be exercised in user space with a mock port. The real implementation,
//! [`MachTask`], is only available on Apple targets with the `builtin`
//! feature.

/// A Mach port name. `0` is `MACH_PORT_NULL`.
pub type TaskName = u32;

/// `MACH_PORT_NULL`
pub const PORT_NULL: TaskName = 0;

/// `MACH_PORT_DEAD`
pub const PORT_DEAD: TaskName = !0;

/// `MACH_PORT_VALID()`
#[inline]
pub fn is_valid_port(name: TaskName) -> bool {
    name != PORT_NULL && name != PORT_DEAD
}

/// A `kern_return_t` failure code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernReturn(pub i32);

impl KernReturn {
    pub const SUCCESS: Self = Self(0);
    pub const INVALID_ADDRESS: Self = Self(1);
    pub const PROTECTION_FAILURE: Self = Self(2);
    pub const NO_SPACE: Self = Self(3);
    pub const INVALID_ARGUMENT: Self = Self(4);
    pub const FAILURE: Self = Self(5);
    pub const RESOURCE_SHORTAGE: Self = Self(6);

    /// Turn a raw `kern_return_t` into a `Result`.
    #[inline]
    pub fn check(kr: i32) -> Result<(), KernReturn> {
        if kr == Self::SUCCESS.0 { Ok(()) } else { Err(Self(kr)) }
    }
}

impl core::fmt::Display for KernReturn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "kern_return {:#x}", self.0)
    }
}

/// Image-layout metadata of a task (`TASK_DYLD_INFO`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DyldInfo {
    pub all_image_info_addr: u64,
    pub all_image_info_size: u64,
}

/// Privileged primitives operating on the kernel task.
///
/// Mirrors the Mach calls the built-in backend is built on. Methods report
/// the raw failure code; classification happens in the backend.
pub trait TaskPort: Send + Sync {
    /// Node-scoped special port 4 of the local host.
    fn host_special_port(&self) -> Result<TaskName, KernReturn>;

    /// Task port of pid 0.
    fn task_for_kernel(&self) -> Result<TaskName, KernReturn>;

    /// Drop a send right obtained from one of the lookups above.
    fn release(&self, task: TaskName);

    /// `TASK_DYLD_INFO` of `task`.
    fn dyld_info(&self, task: TaskName) -> Result<DyldInfo, KernReturn>;

    /// Copy `size` bytes at kernel `addr` into local memory at `data`.
    /// Returns the number of bytes copied.
    ///
    /// # Safety
    /// `data` must be valid for writes of `size` bytes.
    unsafe fn read_overwrite(
        &self,
        task: TaskName,
        addr: u64,
        size: u64,
        data: u64,
    ) -> Result<u64, KernReturn>;

    /// Copy `size` bytes of local memory at `data` to kernel `addr`.
    ///
    /// # Safety
    /// `data` must be valid for reads of `size` bytes.
    unsafe fn write(&self, task: TaskName, addr: u64, data: u64, size: u64)
    -> Result<(), KernReturn>;

    /// Allocate `size` bytes anywhere in the task's address space.
    fn allocate(&self, task: TaskName, size: u64) -> Result<u64, KernReturn>;

    /// Release an allocation of exactly `size` bytes at `addr`.
    fn deallocate(&self, task: TaskName, addr: u64, size: u64) -> Result<(), KernReturn>;
}

// =============================================================================
// Real Implementation (Mach)
// =============================================================================

#[cfg(all(target_vendor = "apple", feature = "builtin"))]
mod mach {
    use core::ffi::c_int;

    use super::{DyldInfo, KernReturn, TaskName, TaskPort};

    const HOST_LOCAL_NODE: c_int = -1;
    const HOST_SPECIAL_PORT_KERNEL_TASK: c_int = 4;
    const TASK_DYLD_INFO: u32 = 17;
    const VM_FLAGS_ANYWHERE: c_int = 0x1;

    #[repr(C, packed(4))]
    #[derive(Default)]
    struct TaskDyldInfo {
        all_image_info_addr: u64,
        all_image_info_size: u64,
        all_image_info_format: i32,
    }

    const TASK_DYLD_INFO_COUNT: u32 =
        (core::mem::size_of::<TaskDyldInfo>() / core::mem::size_of::<u32>()) as u32;

    unsafe extern "C" {
        static mach_task_self_: TaskName;
        fn mach_host_self() -> TaskName;
        fn host_get_special_port(
            host: TaskName,
            node: c_int,
            which: c_int,
            port: *mut TaskName,
        ) -> i32;
        fn task_for_pid(target: TaskName, pid: c_int, task: *mut TaskName) -> i32;
        fn task_info(task: TaskName, flavor: u32, info: *mut i32, count: *mut u32) -> i32;
        fn mach_vm_read_overwrite(
            task: TaskName,
            addr: u64,
            size: u64,
            data: u64,
            outsize: *mut u64,
        ) -> i32;
        fn mach_vm_write(task: TaskName, addr: u64, data: usize, count: u32) -> i32;
        fn mach_vm_allocate(task: TaskName, addr: *mut u64, size: u64, flags: c_int) -> i32;
        fn mach_vm_deallocate(task: TaskName, addr: u64, size: u64) -> i32;
        fn mach_port_deallocate(task: TaskName, name: TaskName) -> i32;
    }

    #[inline]
    fn task_self() -> TaskName {
        unsafe { mach_task_self_ }
    }

    /// Task-port primitives backed by the Mach kernel.
    pub struct MachTask;

    impl TaskPort for MachTask {
        fn host_special_port(&self) -> Result<TaskName, KernReturn> {
            let mut port = super::PORT_NULL;
            let kr = unsafe {
                let host = mach_host_self();
                let kr = host_get_special_port(
                    host,
                    HOST_LOCAL_NODE,
                    HOST_SPECIAL_PORT_KERNEL_TASK,
                    &mut port,
                );
                mach_port_deallocate(task_self(), host);
                kr
            };
            KernReturn::check(kr).map(|()| port)
        }

        fn task_for_kernel(&self) -> Result<TaskName, KernReturn> {
            let mut port = super::PORT_NULL;
            let kr = unsafe { task_for_pid(task_self(), 0, &mut port) };
            KernReturn::check(kr).map(|()| port)
        }

        fn release(&self, task: TaskName) {
            unsafe {
                mach_port_deallocate(task_self(), task);
            }
        }

        fn dyld_info(&self, task: TaskName) -> Result<DyldInfo, KernReturn> {
            let mut info = TaskDyldInfo::default();
            let mut count = TASK_DYLD_INFO_COUNT;
            let kr = unsafe {
                task_info(
                    task,
                    TASK_DYLD_INFO,
                    (&raw mut info).cast::<i32>(),
                    &mut count,
                )
            };
            KernReturn::check(kr)?;
            Ok(DyldInfo {
                all_image_info_addr: info.all_image_info_addr,
                all_image_info_size: info.all_image_info_size,
            })
        }

        unsafe fn read_overwrite(
            &self,
            task: TaskName,
            addr: u64,
            size: u64,
            data: u64,
        ) -> Result<u64, KernReturn> {
            let mut outsize = size;
            let kr = unsafe { mach_vm_read_overwrite(task, addr, size, data, &mut outsize) };
            KernReturn::check(kr).map(|()| outsize)
        }

        unsafe fn write(
            &self,
            task: TaskName,
            addr: u64,
            data: u64,
            size: u64,
        ) -> Result<(), KernReturn> {
            KernReturn::check(unsafe { mach_vm_write(task, addr, data as usize, size as u32) })
        }

        fn allocate(&self, task: TaskName, size: u64) -> Result<u64, KernReturn> {
            let mut va = 0u64;
            let kr = unsafe { mach_vm_allocate(task, &mut va, size, VM_FLAGS_ANYWHERE) };
            KernReturn::check(kr).map(|()| va)
        }

        fn deallocate(&self, task: TaskName, addr: u64, size: u64) -> Result<(), KernReturn> {
            KernReturn::check(unsafe { mach_vm_deallocate(task, addr, size) })
        }
    }
}

#[cfg(all(target_vendor = "apple", feature = "builtin"))]
pub use mach::MachTask;
