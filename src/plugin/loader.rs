//! Dynamic library loading using libloading.

use super::descriptor::{LUMEN_ABI_VERSION, PLUGIN_ENTRY_POINT, PluginDescriptor, PluginInfo};
use crate::error::{Error, Result};
use libloading::{Library, Symbol};
use serde::Deserialize;
use std::ffi::{OsStr, c_void};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

/// Type of the plugin entry point function.
type PluginEntryPoint = unsafe extern "C" fn() -> *const PluginDescriptor;

/// Platform-independent handle to an opened dynamic library.
pub struct SharedLibrary {
    library: Library,
    path: PathBuf,
}

impl SharedLibrary {
    /// Open the library at exactly `path`.
    ///
    /// # Safety
    ///
    /// Opening a library runs its initialisers. The library must be trusted.
    pub unsafe fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        // SAFETY: Caller ensures the library is trusted.
        let library = unsafe { Library::new(path) }.map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "failed to load library or its dependencies");
            Error::PluginLoad {
                path: path.display().to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(Self {
            library,
            path: path.to_path_buf(),
        })
    }

    /// Open `<stem><platform suffix>` (e.g. `plugins/foo` -> `plugins/foo.so`).
    ///
    /// # Safety
    ///
    /// See [`SharedLibrary::open`].
    pub unsafe fn load(stem: impl AsRef<Path>) -> Result<Self> {
        // SAFETY: Caller ensures the library is trusted.
        unsafe { Self::open(with_library_suffix(stem.as_ref())) }
    }

    /// Path the library was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Address of an exported symbol, or `None` (logged) when it is missing.
    pub fn symbol_address(&self, name: &str) -> Option<NonNull<c_void>> {
        // SAFETY: Only the address is read; no call is made through it.
        let symbol: std::result::Result<Symbol<*mut c_void>, _> =
            unsafe { self.library.get(name.as_bytes()) };
        match symbol {
            Ok(symbol) => NonNull::new(*symbol),
            Err(e) => {
                tracing::error!(symbol = name, path = %self.path.display(), error = %e, "failed to get symbol address");
                None
            }
        }
    }

    /// Close the library.
    pub fn unload(self) -> Result<()> {
        let name = self.path.display().to_string();
        self.library.close().map_err(|e| {
            tracing::error!(path = %name, error = %e, "failed to free library");
            Error::PluginUnload {
                name,
                message: e.to_string(),
            }
        })
    }
}

impl std::fmt::Debug for SharedLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedLibrary")
            .field("path", &self.path)
            .finish()
    }
}

/// Append the platform dynamic-library suffix to a path stem.
pub fn with_library_suffix(stem: &Path) -> PathBuf {
    let mut s = stem.as_os_str().to_os_string();
    s.push(std::env::consts::DLL_SUFFIX);
    PathBuf::from(s)
}

/// Whether a file name follows the plugin naming pattern `[0-9a-z_]+.<ext>`.
pub fn is_plugin_filename(name: &str) -> bool {
    let Some(stem) = name.strip_suffix(std::env::consts::DLL_SUFFIX) else {
        return false;
    };
    !stem.is_empty()
        && stem
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// A loaded plugin.
///
/// The plugin holds a reference to the shared library to keep it loaded.
pub struct Plugin {
    library: Arc<SharedLibrary>,
    /// Pointer to the plugin descriptor (valid as long as library is loaded).
    descriptor: *const PluginDescriptor,
    info: PluginInfo,
}

// SAFETY: Plugin only accesses static data from the loaded library
// through validated pointers. The library is kept alive by Arc.
unsafe impl Send for Plugin {}
unsafe impl Sync for Plugin {}

impl Plugin {
    /// Query and validate the descriptor of an opened library.
    ///
    /// # Safety
    ///
    /// The library must implement the plugin ABI if it exports the entry point.
    pub unsafe fn from_library(library: SharedLibrary) -> Result<Self> {
        // SAFETY: Getting a symbol from a loaded library.
        let entry_point: Symbol<PluginEntryPoint> = unsafe {
            library
                .library
                .get(PLUGIN_ENTRY_POINT.as_bytes())
                .map_err(|_| Error::MissingEntryPoint)?
        };

        // SAFETY: Caller guarantees the entry point follows the ABI.
        let descriptor = unsafe { entry_point() };
        if descriptor.is_null() {
            return Err(Error::InvalidDescriptor("plugin returned null descriptor"));
        }

        // SAFETY: Entry point returned non-null.
        let desc = unsafe { &*descriptor };
        if desc.abi_version != LUMEN_ABI_VERSION {
            return Err(Error::AbiMismatch {
                expected: LUMEN_ABI_VERSION,
                actual: desc.abi_version,
            });
        }

        // SAFETY: Caller guarantees the plugin is properly formed.
        unsafe { desc.validate().map_err(Error::InvalidDescriptor)? };
        let info = unsafe { PluginInfo::from_descriptor(desc) };

        Ok(Self {
            library: Arc::new(library),
            descriptor,
            info,
        })
    }

    /// Get information about the plugin.
    pub fn info(&self) -> &PluginInfo {
        &self.info
    }

    /// Get the plugin name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// The shared library backing this plugin.
    pub fn library(&self) -> &Arc<SharedLibrary> {
        &self.library
    }

    /// The validated descriptor.
    pub fn descriptor(&self) -> &PluginDescriptor {
        // SAFETY: Validated at load time; the library is kept alive.
        unsafe { &*self.descriptor }
    }

    /// Close the library.
    ///
    /// Fails while anything else (e.g. a live instance) still holds the library.
    pub fn unload(self) -> Result<()> {
        let name = self.info.name.clone();
        match Arc::try_unwrap(self.library) {
            Ok(library) => library.unload(),
            Err(library) => Err(Error::PluginUnload {
                name,
                message: format!(
                    "library is still referenced by {} live handle(s)",
                    Arc::strong_count(&library) - 1
                ),
            }),
        }
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.info.name)
            .field("version", &self.info.version)
            .field("components", &self.info.components.len())
            .finish()
    }
}

/// Plugin loader configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Directories searched for relative plugin stems.
    pub search_paths: Vec<PathBuf>,
    /// Load `<stem>-debug` instead of `<stem>`.
    pub debug_suffix: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            search_paths: vec![PathBuf::from(".")],
            debug_suffix: false,
        }
    }
}

impl LoaderConfig {
    /// Add a search path.
    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    /// Enable or disable the `-debug` artifact suffix.
    pub fn with_debug_suffix(mut self, enabled: bool) -> Self {
        self.debug_suffix = enabled;
        self
    }
}

/// Plugin loader for dynamically loading plugins from shared libraries.
#[derive(Debug, Default)]
pub struct PluginLoader {
    config: LoaderConfig,
}

impl PluginLoader {
    /// Create a new plugin loader.
    pub fn new(config: LoaderConfig) -> Self {
        Self { config }
    }

    /// Loader configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Add a search path for plugins.
    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) {
        self.config.search_paths.push(path.into());
    }

    /// Resolve the library path for a stem, honouring the debug suffix and search paths.
    pub fn resolve_path(&self, stem: &Path) -> PathBuf {
        let stem = if self.config.debug_suffix {
            let mut s = stem.as_os_str().to_os_string();
            s.push("-debug");
            PathBuf::from(s)
        } else {
            stem.to_path_buf()
        };
        let direct = with_library_suffix(&stem);
        if direct.exists() || stem.is_absolute() {
            return direct;
        }
        self.config
            .search_paths
            .iter()
            .map(|dir| with_library_suffix(&dir.join(&stem)))
            .find(|p| p.exists())
            .unwrap_or(direct)
    }

    /// Load a plugin given its path without the platform suffix.
    ///
    /// # Safety
    ///
    /// Loading plugins executes code from shared libraries. The plugin must:
    /// - Export a valid `lumen_plugin_descriptor` function
    /// - Return a valid, static plugin descriptor
    /// - Properly implement the create and release functions
    pub unsafe fn load(&self, stem: impl AsRef<Path>) -> Result<Plugin> {
        let path = self.resolve_path(stem.as_ref());
        let _span = crate::observability::span_plugin_load(&path.display().to_string()).entered();
        tracing::info!(path = %path.display(), "loading plugin");

        // SAFETY: Caller guarantees the plugin is trusted.
        let library = unsafe { SharedLibrary::open(&path)? };
        // SAFETY: Caller guarantees the plugin follows the ABI.
        let plugin = unsafe { Plugin::from_library(library)? };

        tracing::info!(
            name = plugin.name(),
            version = %plugin.info().version,
            components = plugin.info().components.len(),
            "successfully loaded plugin"
        );
        Ok(plugin)
    }

    /// Scan a directory and load every file matching the plugin naming pattern.
    ///
    /// A missing directory is skipped with a warning.
    ///
    /// # Safety
    ///
    /// See [`PluginLoader::load`]; all plugins in the directory must be trusted.
    pub unsafe fn scan_directory(&self, dir: impl AsRef<Path>) -> Vec<Result<Plugin>> {
        let dir = dir.as_ref();
        let mut plugins = Vec::new();

        if !dir.is_dir() {
            tracing::warn!(directory = %dir.display(), "missing plugin directory, skipping");
            return plugins;
        }

        let Ok(entries) = std::fs::read_dir(dir) else {
            tracing::warn!(directory = %dir.display(), "unreadable plugin directory, skipping");
            return plugins;
        };

        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| {
                path.file_name()
                    .and_then(OsStr::to_str)
                    .is_some_and(is_plugin_filename)
            })
            .collect();
        paths.sort();

        for path in paths {
            let stem = path.with_extension("");
            // SAFETY: Caller guarantees all plugins in the directory are trusted.
            plugins.push(unsafe { self.load(&stem) });
        }

        plugins
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_filename_pattern() {
        let ext = std::env::consts::DLL_SUFFIX;
        assert!(is_plugin_filename(&format!("accel_embree{ext}")));
        assert!(is_plugin_filename(&format!("libdemo_plugin{ext}")));
        assert!(!is_plugin_filename(&format!("Upper{ext}")));
        assert!(!is_plugin_filename(&format!("with-dash{ext}")));
        assert!(!is_plugin_filename(ext));
        assert!(!is_plugin_filename("readme.txt"));
    }

    #[test]
    fn test_suffix_appended() {
        let path = with_library_suffix(Path::new("plugins/foo"));
        assert_eq!(
            path,
            PathBuf::from(format!("plugins/foo{}", std::env::consts::DLL_SUFFIX))
        );
    }

    #[test]
    fn test_debug_suffix() {
        let loader = PluginLoader::new(LoaderConfig::default().with_debug_suffix(true));
        let path = loader.resolve_path(Path::new("/nonexistent/foo"));
        assert_eq!(
            path,
            PathBuf::from(format!("/nonexistent/foo-debug{}", std::env::consts::DLL_SUFFIX))
        );
    }

    #[test]
    fn test_load_nonexistent_plugin() {
        let loader = PluginLoader::default();
        let result = unsafe { loader.load("/nonexistent/plugin_xyz") };
        assert!(matches!(result, Err(Error::PluginLoad { .. })));
    }

    #[test]
    fn test_scan_missing_directory_is_skipped() {
        let loader = PluginLoader::default();
        let results = unsafe { loader.scan_directory("/nonexistent/plugin/dir") };
        assert!(results.is_empty());
    }

    #[test]
    fn test_scan_ignores_non_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join(format!("nested{}", std::env::consts::DLL_SUFFIX)))
            .unwrap();
        let loader = PluginLoader::default();
        let results = unsafe { loader.scan_directory(dir.path()) };
        assert!(results.is_empty());
    }

    #[test]
    fn test_scan_reports_broken_library() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir
            .path()
            .join(format!("bogus{}", std::env::consts::DLL_SUFFIX));
        std::fs::write(&bogus, b"not a shared library").unwrap();
        let loader = PluginLoader::default();
        let results = unsafe { loader.scan_directory(dir.path()) };
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(Error::PluginLoad { .. })));
    }
}
