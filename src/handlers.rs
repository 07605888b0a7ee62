//! Handler table and registry.
//!
//! The handler table is the structure exchanged with backends. Its layout is
//! part of the plugin ABI: fields may only be appended, never reordered or
//! removed, so that plugins built against an older table keep loading.

use core::ffi::{c_int, c_void};

/// Lowest handler table version this crate accepts, and the version it
/// stamps on tables it hands to backends.
pub const HANDLERS_VERSION: u64 = 1;

/// `int kbase(uint64_t *addr)`
pub type KbaseFn = unsafe extern "C" fn(addr: *mut u64) -> c_int;
/// `int kread(uint64_t from, void *to, size_t len)`
pub type KreadFn = unsafe extern "C" fn(from: u64, to: *mut c_void, len: usize) -> c_int;
/// `int kwrite(void *from, uint64_t to, size_t len)`
pub type KwriteFn = unsafe extern "C" fn(from: *mut c_void, to: u64, len: usize) -> c_int;
/// `int kmalloc(uint64_t *addr, size_t size)`
pub type KmallocFn = unsafe extern "C" fn(addr: *mut u64, size: usize) -> c_int;
/// `int kdealloc(uint64_t addr, size_t size)`
pub type KdeallocFn = unsafe extern "C" fn(addr: u64, size: usize) -> c_int;
/// `int kcall(uint64_t func, size_t argc, const uint64_t *argv, uint64_t *ret)`
pub type KcallFn =
    unsafe extern "C" fn(func: u64, argc: usize, argv: *const u64, ret: *mut u64) -> c_int;
/// `int physread(uint64_t from, void *to, size_t len, uint8_t granule)`
pub type PhysreadFn =
    unsafe extern "C" fn(from: u64, to: *mut c_void, len: usize, granule: u8) -> c_int;
/// `int physwrite(void *from, uint64_t to, size_t len, uint8_t granule)`
pub type PhyswriteFn =
    unsafe extern "C" fn(from: *mut c_void, to: u64, len: usize, granule: u8) -> c_int;

/// Plugin entry point: `int krw_initializer(struct krw_handlers_s *)`.
pub type InitializerFn = unsafe extern "C" fn(handlers: *mut HandlerTable) -> c_int;

/// Handler table shared with backends (`struct krw_handlers_s`).
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct HandlerTable {
    pub version: u64,
    pub kbase: Option<KbaseFn>,
    pub kread: Option<KreadFn>,
    pub kwrite: Option<KwriteFn>,
    pub kmalloc: Option<KmallocFn>,
    pub kdealloc: Option<KdeallocFn>,
    pub kcall: Option<KcallFn>,
    pub physread: Option<PhysreadFn>,
    pub physwrite: Option<PhyswriteFn>,
}

impl HandlerTable {
    /// Empty table stamped with [`HANDLERS_VERSION`].
    pub fn new() -> Self {
        Self {
            version: HANDLERS_VERSION,
            ..Self::default()
        }
    }

    /// Whether the slot for `op` is filled.
    pub fn has(&self, op: Operation) -> bool {
        match op {
            Operation::Kbase => self.kbase.is_some(),
            Operation::Kread => self.kread.is_some(),
            Operation::Kwrite => self.kwrite.is_some(),
            Operation::Kmalloc => self.kmalloc.is_some(),
            Operation::Kdealloc => self.kdealloc.is_some(),
            Operation::Kcall => self.kcall.is_some(),
            Operation::Physread => self.physread.is_some(),
            Operation::Physwrite => self.physwrite.is_some(),
        }
    }
}

impl core::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut s = f.debug_struct("HandlerTable");
        s.field("version", &self.version);
        for op in Operation::ALL {
            s.field(op.name(), &self.has(op));
        }
        s.finish()
    }
}

/// The eight operations a handler table can provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Kbase,
    Kread,
    Kwrite,
    Kmalloc,
    Kdealloc,
    Kcall,
    Physread,
    Physwrite,
}

impl Operation {
    /// All operations in table order.
    pub const ALL: [Operation; 8] = [
        Operation::Kbase,
        Operation::Kread,
        Operation::Kwrite,
        Operation::Kmalloc,
        Operation::Kdealloc,
        Operation::Kcall,
        Operation::Physread,
        Operation::Physwrite,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Kbase => "kbase",
            Self::Kread => "kread",
            Self::Kwrite => "kwrite",
            Self::Kmalloc => "kmalloc",
            Self::Kdealloc => "kdealloc",
            Self::Kcall => "kcall",
            Self::Physread => "physread",
            Self::Physwrite => "physwrite",
        }
    }

    /// Capability group this operation is negotiated in.
    pub fn group(self) -> Group {
        match self {
            Self::Kbase | Self::Kread | Self::Kwrite | Self::Kmalloc | Self::Kdealloc => {
                Group::Core
            }
            Self::Kcall | Self::Physread | Self::Physwrite => Group::Extended,
        }
    }
}

/// A resolved handler, as returned by [`HandlerRegistry::get`].
#[derive(Clone, Copy)]
pub enum Handler {
    Kbase(KbaseFn),
    Kread(KreadFn),
    Kwrite(KwriteFn),
    Kmalloc(KmallocFn),
    Kdealloc(KdeallocFn),
    Kcall(KcallFn),
    Physread(PhysreadFn),
    Physwrite(PhyswriteFn),
}

impl Handler {
    pub fn operation(&self) -> Operation {
        match self {
            Self::Kbase(_) => Operation::Kbase,
            Self::Kread(_) => Operation::Kread,
            Self::Kwrite(_) => Operation::Kwrite,
            Self::Kmalloc(_) => Operation::Kmalloc,
            Self::Kdealloc(_) => Operation::Kdealloc,
            Self::Kcall(_) => Operation::Kcall,
            Self::Physread(_) => Operation::Physread,
            Self::Physwrite(_) => Operation::Physwrite,
        }
    }
}

impl core::fmt::Debug for Handler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Handler({})", self.operation().name())
    }
}

/// Capability groups, negotiated independently of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Group {
    /// kbase, kread, kwrite, kmalloc, kdealloc
    Core,
    /// kcall, physread, physwrite
    Extended,
}

impl Group {
    /// Name of the plugin entry point that negotiates this group.
    pub fn entry_point(self) -> &'static str {
        match self {
            Self::Core => "krw_initializer",
            Self::Extended => "kcall_initializer",
        }
    }

    /// Operations owned by this group.
    pub fn operations(self) -> &'static [Operation] {
        match self {
            Self::Core => &Operation::ALL[..5],
            Self::Extended => &Operation::ALL[5..],
        }
    }

    /// Operations a backend must fill for a claim on this group to count.
    pub fn required(self) -> &'static [Operation] {
        match self {
            Self::Core => &[Operation::Kread, Operation::Kwrite],
            Self::Extended => &[Operation::Kcall],
        }
    }

    /// Whether `table` fills every required slot of this group.
    pub fn is_satisfied_by(self, table: &HandlerTable) -> bool {
        self.required().iter().all(|&op| table.has(op))
    }

    /// Copy this group's slots from `src` into `dst`, leaving the rest alone.
    fn copy_slots(self, src: &HandlerTable, dst: &mut HandlerTable) {
        match self {
            Self::Core => {
                dst.kbase = src.kbase;
                dst.kread = src.kread;
                dst.kwrite = src.kwrite;
                dst.kmalloc = src.kmalloc;
                dst.kdealloc = src.kdealloc;
            }
            Self::Extended => {
                dst.kcall = src.kcall;
                dst.physread = src.physread;
                dst.physwrite = src.physwrite;
            }
        }
    }
}

impl core::fmt::Display for Group {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Core => write!(f, "core"),
            Self::Extended => write!(f, "extended"),
        }
    }
}

/// Result of asking one backend to negotiate one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The backend does not offer this group at all.
    Unsupported,
    /// Table version below [`HANDLERS_VERSION`].
    ProtocolTooOld,
    /// Claimed success but left required slots empty.
    Incomplete,
    /// Negotiation returned a failure status.
    Failed(crate::Error),
}

/// The resolved handler table plus its support floor.
pub struct HandlerRegistry {
    table: HandlerTable,
    floor: u64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            table: HandlerTable::new(),
            floor: HANDLERS_VERSION,
        }
    }

    /// Validate a backend's table for `group` and merge it on success.
    ///
    /// Only the group's slots are copied; nothing changes unless the result
    /// is [`Outcome::Success`].
    pub fn register(&mut self, group: Group, candidate: &HandlerTable) -> Outcome {
        if candidate.version < self.floor {
            return Outcome::ProtocolTooOld;
        }
        if !group.is_satisfied_by(candidate) {
            return Outcome::Incomplete;
        }
        if candidate.version > self.floor {
            warn!(
                "backend uses handler API version {} (supported: {}), please update krw if possible",
                candidate.version, self.floor
            );
        }
        group.copy_slots(candidate, &mut self.table);
        Outcome::Success
    }

    /// Handler for `op`, if one was resolved.
    pub fn get(&self, op: Operation) -> Option<Handler> {
        let t = &self.table;
        match op {
            Operation::Kbase => t.kbase.map(Handler::Kbase),
            Operation::Kread => t.kread.map(Handler::Kread),
            Operation::Kwrite => t.kwrite.map(Handler::Kwrite),
            Operation::Kmalloc => t.kmalloc.map(Handler::Kmalloc),
            Operation::Kdealloc => t.kdealloc.map(Handler::Kdealloc),
            Operation::Kcall => t.kcall.map(Handler::Kcall),
            Operation::Physread => t.physread.map(Handler::Physread),
            Operation::Physwrite => t.physwrite.map(Handler::Physwrite),
        }
    }

    /// Whether `group` has been resolved.
    pub fn is_resolved(&self, group: Group) -> bool {
        group.is_satisfied_by(&self.table)
    }

    /// The current table, used to seed a backend's negotiation.
    pub fn table(&self) -> &HandlerTable {
        &self.table
    }

    pub fn version(&self) -> u64 {
        self.floor
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
