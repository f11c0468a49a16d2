//! The process-scoped runtime context.
//!
//! A [`Runtime`] owns the component registry, the parallel scheduler and the
//! root of the component tree. Subsystems come up in a fixed order (logging,
//! metrics, parallel scheduler, plugins, root component) and go down in the
//! reverse order; in particular the root is released before any plugin is
//! unloaded, so no instance outlives the code that created it.

use crate::component::{ComponentPtr, DEFAULT_CONTEXT_KEY, Props, register_builtins};
use crate::error::{Error, Result};
use crate::locator::ROOT;
use crate::observability::{self, TracingConfig};
use crate::parallel::{ParallelConfig, Scheduler};
use crate::plugin::LoaderConfig;
use crate::registry::ComponentRegistry;
use crate::serial;
use bytes::Bytes;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Root component selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RootConfig {
    /// Type key of the root component.
    #[serde(rename = "type")]
    pub key: String,
    /// Props passed to its `construct`.
    pub props: Props,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            key: DEFAULT_CONTEXT_KEY.to_string(),
            props: Props::Null,
        }
    }
}

/// Runtime configuration.
///
/// ```json
/// {
///   "logging": { "level": "lumen=debug" },
///   "parallel": { "num_threads": 8 },
///   "plugin_dirs": ["./plugins"],
///   "root": { "type": "context::default", "props": { "children": {} } }
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Log subscriber settings.
    pub logging: TracingConfig,
    /// Describe the `lumen_*` metrics at startup.
    pub metrics: bool,
    /// Scheduler settings.
    pub parallel: ParallelConfig,
    /// Plugin loader settings.
    pub loader: LoaderConfig,
    /// Directories scanned for plugins.
    pub plugin_dirs: Vec<PathBuf>,
    /// Individual plugins, by stem.
    pub plugins: Vec<String>,
    /// Root component.
    pub root: RootConfig,
}

impl RuntimeConfig {
    /// Parse from props; `null` yields the defaults.
    pub fn from_props(props: &Props) -> Result<Self> {
        crate::dist::config::from_props(props)
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Replace the logging settings.
    pub fn with_logging(mut self, logging: TracingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Replace the scheduler settings.
    pub fn with_parallel(mut self, parallel: ParallelConfig) -> Self {
        self.parallel = parallel;
        self
    }

    /// Add a plugin directory to scan.
    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_dirs.push(dir.into());
        self
    }

    /// Add a plugin to load by stem.
    pub fn with_plugin(mut self, stem: impl Into<String>) -> Self {
        self.plugins.push(stem.into());
        self
    }

    /// Select the root component.
    pub fn with_root(mut self, key: impl Into<String>, props: Props) -> Self {
        self.root = RootConfig {
            key: key.into(),
            props,
        };
        self
    }

    fn has_plugins(&self) -> bool {
        !self.plugins.is_empty() || !self.plugin_dirs.is_empty()
    }
}

/// Process-scoped context: registry, scheduler and component tree.
pub struct Runtime {
    config: RuntimeConfig,
    registry: ComponentRegistry,
    scheduler: Arc<Scheduler>,
}

impl Runtime {
    /// Bring up a runtime that loads no plugins.
    ///
    /// Fails with [`Error::Config`] when the configuration lists plugins; use
    /// [`Runtime::with_plugins`] for those.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        if config.has_plugins() {
            return Err(Error::Config(
                "configuration lists plugins; use Runtime::with_plugins".into(),
            ));
        }
        // SAFETY: No plugin is loaded.
        unsafe { Self::start(config) }
    }

    /// Bring up a runtime and load the configured plugins.
    ///
    /// # Safety
    ///
    /// Every configured plugin must be trusted and built against this ABI.
    pub unsafe fn with_plugins(config: RuntimeConfig) -> Result<Self> {
        // SAFETY: Forwarded from the caller.
        unsafe { Self::start(config) }
    }

    unsafe fn start(config: RuntimeConfig) -> Result<Self> {
        observability::init_tracing(&config.logging)?;
        if config.metrics {
            observability::init_metrics();
        }
        let scheduler = Arc::new(Scheduler::new(config.parallel.clone())?);

        let registry = ComponentRegistry::with_loader(config.loader.clone());
        register_builtins(&registry);
        for dir in &config.plugin_dirs {
            // SAFETY: Forwarded from the caller.
            unsafe { registry.load_plugin_directory(dir) };
        }
        for stem in &config.plugins {
            // SAFETY: Forwarded from the caller.
            unsafe { registry.load_plugin(stem)? };
        }

        let mut runtime = Self {
            config,
            registry,
            scheduler,
        };
        runtime.reset()?;
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            threads = runtime.scheduler.num_threads(),
            plugins = runtime.registry.plugin_names().len(),
            root = %runtime.config.root.key,
            "lumen runtime initialized"
        );
        Ok(runtime)
    }

    /// The configuration this runtime was started with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The component registry.
    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// The component registry, mutably (for root replacement and `get_mut`).
    pub fn registry_mut(&mut self) -> &mut ComponentRegistry {
        &mut self.registry
    }

    /// Shared handle to the scheduler, for task handlers.
    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    /// The root component.
    pub fn root(&self) -> Option<&ComponentPtr> {
        self.registry.root()
    }

    /// Drop the current tree and build a fresh root from the configuration.
    pub fn reset(&mut self) -> Result<()> {
        self.registry.take_root();
        let root = self.registry.create_with(
            &self.config.root.key,
            ROOT,
            &self.config.root.props,
        )?;
        self.registry.register_root(root);
        Ok(())
    }

    /// Snapshot the whole component tree.
    pub fn serialize(&self) -> Result<Bytes> {
        tracing::info!("saving runtime state");
        serial::to_bytes(self.registry.root())
    }

    /// Replace the component tree with a snapshot from [`serialize`](Self::serialize).
    pub fn deserialize(&mut self, data: &[u8]) -> Result<()> {
        tracing::info!(bytes = data.len(), "loading runtime state");
        match serial::from_bytes(&self.registry, data)? {
            Some(root) => {
                self.registry.register_root(root);
            }
            None => {
                self.registry.take_root();
            }
        }
        Ok(())
    }

    /// Write a snapshot to `path`.
    pub fn save_state(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.serialize()?)?;
        Ok(())
    }

    /// Load a snapshot written by [`save_state`](Self::save_state).
    pub fn load_state(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let data = std::fs::read(path)?;
        self.deserialize(&data)
    }

    /// Release the tree, then unload every plugin.
    ///
    /// Called on drop; calling it explicitly surfaces unload errors.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.registry.take_root().is_some() {
            tracing::debug!("released root component");
        }
        self.registry.unload_plugins()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "runtime shutdown failed");
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("registry", &self.registry)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

/// Loads a set of plugins and unloads them again on drop.
pub struct ScopedPlugins<'a> {
    registry: &'a ComponentRegistry,
    names: Vec<String>,
}

impl<'a> ScopedPlugins<'a> {
    /// Load every plugin in `stems`.
    ///
    /// On failure the plugins loaded so far are unloaded again.
    ///
    /// # Safety
    ///
    /// The plugins must be trusted.
    pub unsafe fn load<S: AsRef<Path>>(
        registry: &'a ComponentRegistry,
        stems: impl IntoIterator<Item = S>,
    ) -> Result<Self> {
        let mut scoped = Self {
            registry,
            names: Vec::new(),
        };
        for stem in stems {
            let before = registry.plugin_names();
            // SAFETY: Forwarded from the caller.
            unsafe { registry.load_plugin(stem)? };
            scoped.names.extend(
                registry
                    .plugin_names()
                    .into_iter()
                    .filter(|name| !before.contains(name)),
            );
        }
        Ok(scoped)
    }

    /// Names of the plugins held by this guard.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl Drop for ScopedPlugins<'_> {
    fn drop(&mut self) {
        for name in self.names.iter().rev() {
            if let Err(e) = self.registry.unload_plugin(name) {
                tracing::warn!(plugin = %name, error = %e, "scoped plugin left loaded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{AccumFilm, DefaultContext};
    use serde_json::json;

    fn quiet() -> RuntimeConfig {
        RuntimeConfig::default()
            .with_logging(TracingConfig::none())
            .with_parallel(ParallelConfig::default().with_threads(2))
    }

    #[test]
    fn test_default_root() {
        let runtime = Runtime::new(quiet()).unwrap();
        let root = runtime.root().unwrap();
        assert_eq!(root.key(), DEFAULT_CONTEXT_KEY);
        assert_eq!(root.loc(), "$");
        assert_eq!(runtime.scheduler().num_threads(), 2);
    }

    #[test]
    fn test_children_from_config() {
        let config = quiet().with_root(
            DEFAULT_CONTEXT_KEY,
            json!({ "children": { "film": { "type": "film::accum", "props": { "size": 4 } } } }),
        );
        let runtime = Runtime::new(config).unwrap();
        let film = runtime.registry().get::<AccumFilm>("$.film").unwrap();
        assert_eq!(film.len(), 4);
    }

    #[test]
    fn test_plugins_need_unsafe_constructor() {
        let config = quiet().with_plugin("demo_plugin");
        assert!(matches!(Runtime::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_root_key() {
        let config = quiet().with_root("context::missing", Props::Null);
        assert!(matches!(
            Runtime::new(config),
            Err(Error::ComponentNotFound { .. })
        ));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = quiet().with_root(
            DEFAULT_CONTEXT_KEY,
            json!({ "children": { "film": { "type": "film::accum", "props": { "size": 3 } } } }),
        );
        let mut runtime = Runtime::new(config).unwrap();
        runtime
            .registry_mut()
            .get_mut::<AccumFilm>("$.film")
            .unwrap()
            .add(1, 2.5);
        let snapshot = runtime.serialize().unwrap();

        runtime.reset().unwrap();
        assert_eq!(runtime.registry().get::<AccumFilm>("$.film").unwrap().data()[1], 0.0);

        runtime.deserialize(&snapshot).unwrap();
        let film = runtime.registry().get::<AccumFilm>("$.film").unwrap();
        assert_eq!(film.data(), &[0.0, 2.5, 0.0]);
        assert!(runtime.registry().get::<DefaultContext>("$").is_ok());
    }

    #[test]
    fn test_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        let mut runtime = Runtime::new(quiet()).unwrap();
        runtime.save_state(&path).unwrap();
        runtime.load_state(&path).unwrap();
        assert_eq!(runtime.root().unwrap().key(), DEFAULT_CONTEXT_KEY);
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lumen.json");
        std::fs::write(
            &path,
            r#"{ "parallel": { "num_threads": 3 }, "root": { "type": "film::accum", "props": { "size": 2 } } }"#,
        )
        .unwrap();
        let config = RuntimeConfig::from_file(&path).unwrap();
        assert_eq!(config.parallel.num_threads, 3);
        assert_eq!(config.root.key, "film::accum");
        assert!(config.logging.enabled);

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(RuntimeConfig::from_file(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_shutdown_releases_root() {
        let mut runtime = Runtime::new(quiet()).unwrap();
        runtime.shutdown().unwrap();
        assert!(runtime.root().is_none());
    }

    #[test]
    fn test_scoped_plugins_failure() {
        let registry = ComponentRegistry::new();
        let result = unsafe { ScopedPlugins::load(&registry, ["/nonexistent/libnothing"]) };
        assert!(matches!(result, Err(Error::PluginLoad { .. })));
        assert!(registry.plugin_names().is_empty());
    }
}
