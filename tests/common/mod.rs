//! Shared mocks for integration tests.
//!
//! - `MockBackend` / `MockSource`: scripted backends and a candidate source
//!   that journal every negotiation.
//! - `MockTask`: a `TaskPort` over simulated kernel memory.
//! - `mock_*`: C-ABI handlers installed by mock backends.

#![allow(dead_code)]

use core::ffi::{c_int, c_void};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use krw::platform::{DyldInfo, KernReturn, TaskName, TaskPort};
use krw::probe::LoadError;
use krw::{Backend, BackendSource, Candidate, Error, Group, HandlerTable, KrwResult};

// =============================================================================
// C-ABI handlers
// =============================================================================

pub const MOCK_KBASE: u64 = 0xfffffff007104000;
pub const MOCK_HEAP: u64 = 0xffffffe000000000;

pub unsafe extern "C" fn mock_kbase(addr: *mut u64) -> c_int {
    unsafe { addr.write(MOCK_KBASE) };
    0
}

/// Fills the buffer with the low byte of `from`.
pub unsafe extern "C" fn mock_kread(from: u64, to: *mut c_void, len: usize) -> c_int {
    unsafe { core::ptr::write_bytes(to.cast::<u8>(), from as u8, len) };
    0
}

pub unsafe extern "C" fn mock_kwrite(_from: *mut c_void, _to: u64, _len: usize) -> c_int {
    0
}

pub unsafe extern "C" fn failing_kwrite(_from: *mut c_void, _to: u64, _len: usize) -> c_int {
    Error::Io.code()
}

pub unsafe extern "C" fn mock_kmalloc(addr: *mut u64, size: usize) -> c_int {
    unsafe { addr.write(MOCK_HEAP + size as u64) };
    0
}

pub unsafe extern "C" fn mock_kdealloc(_addr: u64, _size: usize) -> c_int {
    0
}

/// Returns `func` plus the sum of the arguments.
pub unsafe extern "C" fn mock_kcall(func: u64, argc: usize, argv: *const u64, ret: *mut u64) -> c_int {
    let args = if argc == 0 {
        &[][..]
    } else {
        unsafe { core::slice::from_raw_parts(argv, argc) }
    };
    let sum = args.iter().fold(func, |acc, &a| acc.wrapping_add(a));
    unsafe { ret.write(sum) };
    0
}

/// Fills the buffer with the granule value.
pub unsafe extern "C" fn mock_physread(_from: u64, to: *mut c_void, len: usize, granule: u8) -> c_int {
    unsafe { core::ptr::write_bytes(to.cast::<u8>(), granule, len) };
    0
}

pub unsafe extern "C" fn mock_physwrite(_from: *mut c_void, _to: u64, _len: usize, _granule: u8) -> c_int {
    0
}

// =============================================================================
// Mock backends
// =============================================================================

/// How a mock backend answers a negotiation.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// No entry point for the group.
    Missing,
    /// Negotiation returns a failure status.
    Fail(Error),
    /// Fills every slot of the group.
    Provide,
    /// Reports success but leaves the required slots empty.
    Partial,
    /// Fills every slot of the group and stamps this version.
    Version(u64),
}

/// One negotiation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub backend: String,
    pub group: Group,
    /// Whether the table handed in already carried a read handler.
    pub seeded_read: bool,
}

#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Call>>>);

impl Journal {
    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn names(&self, group: Group) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.group == group)
            .map(|c| c.backend)
            .collect()
    }

    pub fn count(&self, group: Group) -> usize {
        self.names(group).len()
    }

    fn record(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }
}

#[derive(Clone)]
pub struct MockBackend {
    pub name: String,
    pub core: Behavior,
    pub extended: Behavior,
    pub journal: Journal,
    pub delay: Duration,
    /// Read handler installed for the core group.
    pub kread: krw::handlers::KreadFn,
    /// Write handler installed for the core group.
    pub kwrite: krw::handlers::KwriteFn,
}

impl MockBackend {
    pub fn new(name: &str, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            core: Behavior::Missing,
            extended: Behavior::Missing,
            journal: journal.clone(),
            delay: Duration::ZERO,
            kread: mock_kread,
            kwrite: mock_kwrite,
        }
    }

    pub fn core(mut self, behavior: Behavior) -> Self {
        self.core = behavior;
        self
    }

    pub fn extended(mut self, behavior: Behavior) -> Self {
        self.extended = behavior;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_kwrite(mut self, kwrite: krw::handlers::KwriteFn) -> Self {
        self.kwrite = kwrite;
        self
    }

    fn answer(&self, group: Group, behavior: Behavior, handlers: &mut HandlerTable) -> KrwResult<()> {
        self.journal.record(Call {
            backend: self.name.clone(),
            group,
            seeded_read: handlers.kread.is_some(),
        });
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        match behavior {
            Behavior::Missing => return Err(Error::Unsupported),
            Behavior::Fail(e) => return Err(e),
            Behavior::Partial => {
                match group {
                    Group::Core => handlers.kbase = Some(mock_kbase),
                    Group::Extended => handlers.physread = Some(mock_physread),
                }
                return Ok(());
            }
            Behavior::Provide => {}
            Behavior::Version(v) => handlers.version = v,
        }

        match group {
            Group::Core => {
                handlers.kbase = Some(mock_kbase);
                handlers.kread = Some(self.kread);
                handlers.kwrite = Some(self.kwrite);
                handlers.kmalloc = Some(mock_kmalloc);
                handlers.kdealloc = Some(mock_kdealloc);
            }
            Group::Extended => {
                handlers.kcall = Some(mock_kcall);
                handlers.physread = Some(mock_physread);
                handlers.physwrite = Some(mock_physwrite);
            }
        }
        Ok(())
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn init_core(&self, handlers: &mut HandlerTable) -> KrwResult<()> {
        self.answer(Group::Core, self.core, handlers)
    }

    fn init_extended(&self, handlers: &mut HandlerTable) -> KrwResult<()> {
        self.answer(Group::Extended, self.extended, handlers)
    }
}

/// A loaded mock; counts unloads when dropped.
struct Loaded {
    inner: MockBackend,
    unloads: Arc<AtomicUsize>,
}

impl Backend for Loaded {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn init_core(&self, handlers: &mut HandlerTable) -> KrwResult<()> {
        self.inner.init_core(handlers)
    }

    fn init_extended(&self, handlers: &mut HandlerTable) -> KrwResult<()> {
        self.inner.init_extended(handlers)
    }
}

impl Drop for Loaded {
    fn drop(&mut self) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
    }
}

/// Candidate source over in-memory mock backends.
#[derive(Default)]
pub struct MockSource {
    /// `None` makes loading that candidate fail.
    entries: Vec<(String, Option<MockBackend>)>,
    pub scans: Arc<AtomicUsize>,
    pub loads: Arc<AtomicUsize>,
    pub unloads: Arc<AtomicUsize>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a candidate; its file name is the backend name plus `.dylib`.
    pub fn with(mut self, backend: MockBackend) -> Self {
        let name = format!("{}.dylib", backend.name);
        self.entries.push((name, Some(backend)));
        self
    }

    /// Add a candidate that fails to load.
    pub fn with_broken(mut self, name: &str) -> Self {
        self.entries.push((format!("{}.dylib", name), None));
        self
    }
}

impl BackendSource for MockSource {
    fn candidates(&self) -> Vec<Candidate> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        self.entries
            .iter()
            .map(|(name, _)| Candidate {
                name: name.clone(),
                path: PathBuf::from("/usr/lib/libkrw").join(name),
            })
            .collect()
    }

    fn load(&self, candidate: &Candidate) -> Result<Box<dyn Backend>, LoadError> {
        let backend = self
            .entries
            .iter()
            .find(|(name, _)| *name == candidate.name)
            .and_then(|(_, backend)| backend.clone());
        match backend {
            Some(inner) => {
                self.loads.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(Loaded {
                    inner,
                    unloads: self.unloads.clone(),
                }))
            }
            None => Err(LoadError {
                path: candidate.path.clone(),
                reason: String::from("mach-o file, but is an incompatible architecture"),
            }),
        }
    }
}

// =============================================================================
// Mock task port
// =============================================================================

pub const KERNEL_TASK: TaskName = 0x1303;
const PAGE_SIZE: u64 = 0x4000;

#[derive(Default)]
pub struct Stats {
    pub special_lookups: AtomicUsize,
    pub pid_lookups: AtomicUsize,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    pub allocs: AtomicUsize,
    pub releases: AtomicUsize,
}

impl Stats {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Simulated kernel task with sparse byte-addressed memory.
pub struct MockTask {
    pub special_port: Result<TaskName, KernReturn>,
    pub pid0_port: Result<TaskName, KernReturn>,
    pub dyld: Result<DyldInfo, KernReturn>,
    /// Largest number of bytes a single read call copies.
    pub max_read: u64,
    /// Replace the result of the n-th (0-based) read call.
    pub read_override: Option<(usize, Result<u64, KernReturn>)>,
    /// Fail the n-th (0-based) write call.
    pub write_failure: Option<(usize, KernReturn)>,
    pub alloc_failure: Option<KernReturn>,
    pub stats: Arc<Stats>,
    memory: Mutex<BTreeMap<u64, u8>>,
    allocations: Mutex<BTreeMap<u64, u64>>,
    next_alloc: Mutex<u64>,
}

impl MockTask {
    pub fn new() -> Self {
        Self {
            special_port: Ok(KERNEL_TASK),
            pid0_port: Err(KernReturn::FAILURE),
            dyld: Ok(DyldInfo {
                all_image_info_addr: 0xfffffff0077e4000,
                all_image_info_size: 0x2c000,
            }),
            max_read: u64::MAX,
            read_override: None,
            write_failure: None,
            alloc_failure: None,
            stats: Arc::new(Stats::default()),
            memory: Mutex::new(BTreeMap::new()),
            allocations: Mutex::new(BTreeMap::new()),
            next_alloc: Mutex::new(MOCK_HEAP),
        }
    }

    /// Map `bytes` at `addr`.
    pub fn map(&self, addr: u64, bytes: &[u8]) {
        let mut memory = self.memory.lock().unwrap();
        for (i, &b) in bytes.iter().enumerate() {
            memory.insert(addr + i as u64, b);
        }
    }

    /// Bytes at `addr`, `None` where unmapped.
    pub fn peek(&self, addr: u64, len: usize) -> Vec<Option<u8>> {
        let memory = self.memory.lock().unwrap();
        (0..len as u64).map(|i| memory.get(&(addr + i)).copied()).collect()
    }

    pub fn is_allocated(&self, addr: u64) -> bool {
        self.allocations.lock().unwrap().contains_key(&addr)
    }
}

impl TaskPort for MockTask {
    fn host_special_port(&self) -> Result<TaskName, KernReturn> {
        self.stats.special_lookups.fetch_add(1, Ordering::SeqCst);
        self.special_port
    }

    fn task_for_kernel(&self) -> Result<TaskName, KernReturn> {
        self.stats.pid_lookups.fetch_add(1, Ordering::SeqCst);
        self.pid0_port
    }

    fn release(&self, _task: TaskName) {
        self.stats.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn dyld_info(&self, _task: TaskName) -> Result<DyldInfo, KernReturn> {
        self.dyld
    }

    unsafe fn read_overwrite(
        &self,
        _task: TaskName,
        addr: u64,
        size: u64,
        data: u64,
    ) -> Result<u64, KernReturn> {
        let call = self.stats.reads.fetch_add(1, Ordering::SeqCst);
        if let Some((n, result)) = self.read_override {
            if n == call {
                return result;
            }
        }

        let count = size.min(self.max_read);
        let memory = self.memory.lock().unwrap();
        for i in 0..count {
            let byte = *memory
                .get(&(addr + i))
                .ok_or(KernReturn::INVALID_ADDRESS)?;
            unsafe { (data as *mut u8).add(i as usize).write(byte) };
        }
        Ok(count)
    }

    unsafe fn write(&self, _task: TaskName, addr: u64, data: u64, size: u64) -> Result<(), KernReturn> {
        let call = self.stats.writes.fetch_add(1, Ordering::SeqCst);
        if let Some((n, kr)) = self.write_failure {
            if n == call {
                return Err(kr);
            }
        }

        let mut memory = self.memory.lock().unwrap();
        if (0..size).any(|i| !memory.contains_key(&(addr + i))) {
            return Err(KernReturn::INVALID_ADDRESS);
        }
        for i in 0..size {
            let byte = unsafe { (data as *const u8).add(i as usize).read() };
            memory.insert(addr + i, byte);
        }
        Ok(())
    }

    fn allocate(&self, _task: TaskName, size: u64) -> Result<u64, KernReturn> {
        self.stats.allocs.fetch_add(1, Ordering::SeqCst);
        if let Some(kr) = self.alloc_failure {
            return Err(kr);
        }
        if size == 0 {
            return Err(KernReturn::INVALID_ARGUMENT);
        }

        let rounded = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let mut next = self.next_alloc.lock().unwrap();
        let addr = *next;
        *next += rounded + PAGE_SIZE;
        self.map(addr, &vec![0u8; rounded as usize]);
        self.allocations.lock().unwrap().insert(addr, rounded);
        Ok(addr)
    }

    fn deallocate(&self, _task: TaskName, addr: u64, size: u64) -> Result<(), KernReturn> {
        let Some(rounded) = self.allocations.lock().unwrap().remove(&addr) else {
            return Err(KernReturn::INVALID_ARGUMENT);
        };
        let unmap = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let mut memory = self.memory.lock().unwrap();
        for i in 0..unmap.min(rounded) {
            memory.remove(&(addr + i));
        }
        Ok(())
    }
}
