//! Backend candidate discovery and probing.
//!
//! A [`BackendSource`] lists and loads candidate backends. [`probe`] walks the
//! candidates of a source in name order and stops at the first one that
//! negotiates a capability group successfully.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::backend::Backend;
use crate::error::{Error, KrwResult};
use crate::handlers::{Group, HandlerRegistry, HandlerTable, InitializerFn, Outcome};

/// Directory scanned for plugins.
pub const PLUGIN_DIR: &str = "/usr/lib/libkrw";

/// A discovered, not yet loaded backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// File name; candidates are probed in byte-wise order of this name.
    pub name: String,
    pub path: PathBuf,
}

/// Failure to load a candidate.
#[derive(Debug)]
pub struct LoadError {
    pub path: PathBuf,
    pub reason: String,
}

impl core::fmt::Display for LoadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "failed to load {}: {}", self.path.display(), self.reason)
    }
}

impl core::error::Error for LoadError {}

/// Where candidate backends come from.
pub trait BackendSource: Send + Sync {
    /// Current candidates, in any order.
    fn candidates(&self) -> Vec<Candidate>;

    /// Load a candidate. Dropping the returned backend unloads it.
    fn load(&self, candidate: &Candidate) -> Result<Box<dyn Backend>, LoadError>;
}

/// Probe the candidates of `source` for `group`.
///
/// Each candidate negotiates on a copy of the registry's table, so it sees
/// every handler resolved so far. The first successful candidate is merged
/// into `registry` and returned; it must stay alive as long as its handlers
/// may be called. Every other candidate is dropped right after its attempt.
pub fn probe(
    source: &dyn BackendSource,
    group: Group,
    registry: &mut HandlerRegistry,
) -> Option<Box<dyn Backend>> {
    let mut candidates = source.candidates();
    candidates.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
    debug!("probing {} candidate(s) for {} handlers", candidates.len(), group);

    for candidate in &candidates {
        let backend = match source.load(candidate) {
            Ok(backend) => backend,
            Err(e) => {
                warn!("error attempting to load plugin {}", e);
                continue;
            }
        };

        let mut handlers = *registry.table();
        let outcome = match backend.negotiate(group, &mut handlers) {
            Ok(()) => registry.register(group, &handlers),
            Err(Error::Unsupported) => Outcome::Unsupported,
            Err(e) => Outcome::Failed(e),
        };

        match outcome {
            Outcome::Success => {
                info!("{} handlers provided by {}", group, candidate.path.display());
                return Some(backend);
            }
            Outcome::Unsupported => {
                debug!("{} does not provide {} handlers", candidate.name, group);
            }
            Outcome::Incomplete => {
                warn!(
                    "KRW plugin {} did not provide functions it purported to provide",
                    candidate.path.display()
                );
            }
            Outcome::ProtocolTooOld => {
                warn!(
                    "KRW plugin {} uses handler version {} (minimum {})",
                    candidate.path.display(),
                    handlers.version,
                    registry.version()
                );
            }
            Outcome::Failed(e) => {
                debug!("{} failed {} negotiation: {}", candidate.name, group, e);
            }
        }
    }

    debug!("no candidate provides {} handlers", group);
    None
}

// =============================================================================
// Plugin directory
// =============================================================================

/// Shared libraries in a directory, loaded with the system loader.
pub struct PluginDir {
    dir: PathBuf,
    extension: &'static str,
}

impl PluginDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            extension: std::env::consts::DLL_EXTENSION,
        }
    }

    /// The system plugin directory, [`PLUGIN_DIR`].
    pub fn system() -> Self {
        Self::new(PLUGIN_DIR)
    }

    /// Match files with `extension` instead of the platform default.
    pub fn with_extension(mut self, extension: &'static str) -> Self {
        self.extension = extension;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl BackendSource for PluginDir {
    fn candidates(&self) -> Vec<Candidate> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("cannot scan {}: {}", self.dir.display(), e);
                return Vec::new();
            }
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension() != Some(OsStr::new(self.extension)) {
                    return None;
                }
                // Non UTF-8 names cannot be ordered like the rest; skip them.
                let name = entry.file_name().into_string().ok()?;
                Some(Candidate { name, path })
            })
            .collect()
    }

    fn load(&self, candidate: &Candidate) -> Result<Box<dyn Backend>, LoadError> {
        PluginBackend::open(&candidate.path).map(|plugin| Box::new(plugin) as Box<dyn Backend>)
    }
}

/// A loaded plugin.
///
/// Resolves the group entry points by name on each negotiation. Dropping the
/// plugin unloads the library, so it must outlive any handler it provided.
pub struct PluginBackend {
    name: String,
    library: libloading::Library,
}

impl PluginBackend {
    /// Load the shared library at `path`.
    pub fn open(path: &Path) -> Result<Self, LoadError> {
        let load_error = |e: libloading::Error| LoadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        #[cfg(unix)]
        let library = unsafe {
            libloading::os::unix::Library::open(
                Some(path),
                libloading::os::unix::RTLD_LOCAL | libloading::os::unix::RTLD_LAZY,
            )
        }
        .map(libloading::Library::from)
        .map_err(load_error)?;

        #[cfg(not(unix))]
        let library = unsafe { libloading::Library::new(path) }.map_err(load_error)?;

        Ok(Self {
            name: path.display().to_string(),
            library,
        })
    }

    /// The entry point negotiating `group`, if the library exports it.
    ///
    /// The returned pointer is only valid while this plugin is loaded.
    pub fn entry_point(&self, group: Group) -> Option<InitializerFn> {
        let symbol = group.entry_point();
        unsafe { self.library.get::<InitializerFn>(symbol.as_bytes()) }
            .ok()
            .map(|init| *init)
    }

    fn call_initializer(&self, group: Group, handlers: &mut HandlerTable) -> KrwResult<()> {
        unsafe { run_initializer(self.entry_point(group), handlers) }
    }
}

/// Run a plugin entry point and translate its status.
///
/// # Safety
/// `init` must point to a function with the [`InitializerFn`] signature.
unsafe fn run_initializer(init: Option<InitializerFn>, handlers: &mut HandlerTable) -> KrwResult<()> {
    let Some(init) = init else {
        return Err(Error::Unsupported);
    };
    Error::status(unsafe { init(handlers) })
}

impl Backend for PluginBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn init_core(&self, handlers: &mut HandlerTable) -> KrwResult<()> {
        self.call_initializer(Group::Core, handlers)
    }

    fn init_extended(&self, handlers: &mut HandlerTable) -> KrwResult<()> {
        self.call_initializer(Group::Extended, handlers)
    }
}
