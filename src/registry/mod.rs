//! Component registry.
//!
//! The registry maps string keys to create/release pairs, creates instances by
//! key, owns the modules opened through it and holds the single root of the
//! live object tree.
//!
//! Mutations (register, unregister, plugin load/unload) are serialised behind
//! one lock; `create` and `resolve` only take a read lock and are safe to call
//! concurrently once plugin loading has quiesced.

mod entry;

pub use entry::{CreateFn, EntryOrigin, RegistryEntry, ReleaseFn};

use crate::component::{
    Component, ComponentPtr, ConstructContext, Props, RawComponent, component_from_raw,
    component_to_raw,
};
use crate::error::{Error, Result};
use crate::locator;
use crate::observability;
use crate::plugin::{CreateComponentFn, LoaderConfig, Plugin, PluginLoader, ReleaseComponentFn, SharedLibrary};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Keeps a plugin's library mapped for as long as any entry or instance uses it.
struct PluginFactory {
    _library: Arc<SharedLibrary>,
    create: CreateComponentFn,
    release: ReleaseComponentFn,
}

impl PluginFactory {
    fn create(&self) -> Option<RawComponent> {
        // SAFETY: The descriptor was validated when the plugin was loaded and
        // the library stays mapped while `self` is alive.
        RawComponent::from_ptr(unsafe { (self.create)() })
    }

    fn release(&self, raw: RawComponent) {
        // SAFETY: raw came from the create function of the same descriptor.
        unsafe { (self.release)(raw.as_ptr()) }
    }
}

/// Process-scoped registry of component factories.
pub struct ComponentRegistry {
    entries: RwLock<HashMap<String, Arc<RegistryEntry>>>,
    modules: Mutex<Vec<Plugin>>,
    loader: PluginLoader,
    root: Option<ComponentPtr>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::with_loader(LoaderConfig::default())
    }

    /// Create an empty registry with a custom plugin loader configuration.
    pub fn with_loader(config: LoaderConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            modules: Mutex::new(Vec::new()),
            loader: PluginLoader::new(config),
            root: None,
        }
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<RegistryEntry>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<RegistryEntry>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_modules(&self) -> MutexGuard<'_, Vec<Plugin>> {
        self.modules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a create/release pair under `key`.
    ///
    /// An existing entry is overwritten (last registration wins) and a warning
    /// is logged. Returns `true` when an entry was replaced.
    pub fn register<C, R>(&self, key: &str, create: C, release: R) -> bool
    where
        C: Fn() -> Option<RawComponent> + Send + Sync + 'static,
        R: Fn(RawComponent) + Send + Sync + 'static,
    {
        self.insert_entry(RegistryEntry::new(
            key,
            Arc::new(create),
            Arc::new(release),
            EntryOrigin::Static,
        ))
    }

    /// Register a Rust type constructed with `Default`.
    pub fn register_type<T: Component + Default>(&self, key: &str) -> bool {
        self.register(
            key,
            || RawComponent::from_ptr(component_to_raw(Box::new(T::default()))),
            |raw| {
                // SAFETY: raw was produced by the create closure above.
                drop(unsafe { raw.into_box() })
            },
        )
    }

    /// Insert a prepared entry. Returns `true` when an entry was replaced.
    pub fn insert_entry(&self, entry: RegistryEntry) -> bool {
        let key = entry.key().to_string();
        let previous = self.write_entries().insert(key.clone(), Arc::new(entry));
        match previous {
            Some(old) => {
                tracing::warn!(
                    key = %key,
                    previous_origin = ?old.origin(),
                    "component is already registered, overwriting"
                );
                true
            }
            None => {
                tracing::debug!(key = %key, "registered component");
                false
            }
        }
    }

    /// Remove the entry for `key`. Returns `true` if it was present.
    ///
    /// Live instances keep their entry and are still released correctly.
    pub fn unregister(&self, key: &str) -> bool {
        self.write_entries().remove(key).is_some()
    }

    /// Whether `key` is registered.
    pub fn contains(&self, key: &str) -> bool {
        self.read_entries().contains_key(key)
    }

    /// Look up an entry.
    pub fn entry(&self, key: &str) -> Option<Arc<RegistryEntry>> {
        self.read_entries().get(key).cloned()
    }

    /// All registered keys (unordered).
    pub fn keys(&self) -> Vec<String> {
        self.read_entries().keys().cloned().collect()
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    /// Whether no key is registered.
    pub fn is_empty(&self) -> bool {
        self.read_entries().is_empty()
    }

    /// Visit every registered key (unordered).
    pub fn foreach_registered(&self, mut visitor: impl FnMut(&str)) {
        for key in self.keys() {
            visitor(&key);
        }
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Create and construct an instance with empty properties.
    pub fn create(&self, key: &str, loc: &str) -> Result<ComponentPtr> {
        self.create_with(key, loc, &Props::Null)
    }

    /// Create an instance and run [`Component::construct`] with `props`.
    ///
    /// `loc` is the locator the instance will live at (empty when it is not
    /// part of the tree). A failing `construct` releases the instance.
    pub fn create_with(&self, key: &str, loc: &str, props: &Props) -> Result<ComponentPtr> {
        let mut ptr = self.instantiate(key, loc)?;
        let ctx = ConstructContext {
            registry: self,
            loc,
            props,
        };
        if let Err(e) = ptr.get_mut().construct(&ctx) {
            tracing::error!(key, loc, error = %e, "failed to construct component");
            return Err(e);
        }
        Ok(ptr)
    }

    /// Create an instance without constructing it.
    ///
    /// Used when the state is restored from a stream right afterwards.
    pub fn instantiate(&self, key: &str, loc: &str) -> Result<ComponentPtr> {
        // The lock is released before the factory runs so factories may use
        // the registry themselves.
        let entry = self.entry(key).ok_or_else(|| {
            tracing::error!(key, "failed to create component");
            Error::ComponentNotFound {
                key: key.to_string(),
            }
        })?;
        let raw = entry.create().ok_or_else(|| {
            Error::InvalidState(format!("factory of '{key}' returned a null instance"))
        })?;
        observability::record_component_created(key);
        Ok(ComponentPtr::new(raw, entry, loc.to_string()))
    }

    // ------------------------------------------------------------------
    // Plugins
    // ------------------------------------------------------------------

    /// Plugin loader used by [`load_plugin`](Self::load_plugin).
    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    /// Load the plugin at `stem` (platform suffix appended) and register its components.
    ///
    /// # Safety
    ///
    /// Loading plugins executes code from shared libraries. The plugin must be
    /// trusted and properly implement the plugin ABI.
    pub unsafe fn load_plugin(&self, stem: impl AsRef<Path>) -> Result<()> {
        // SAFETY: Caller guarantees the plugin is trusted.
        let plugin = unsafe { self.loader.load(stem)? };
        self.add_plugin(plugin)
    }

    /// Load every plugin found in `dir`.
    ///
    /// A missing directory is skipped with a warning, and a file that fails to
    /// load is logged and skipped. Returns the number of loaded plugins.
    ///
    /// # Safety
    ///
    /// All plugins in the directory must be trusted.
    pub unsafe fn load_plugin_directory(&self, dir: impl AsRef<Path>) -> usize {
        let mut loaded = 0;
        // SAFETY: Caller guarantees all plugins in the directory are trusted.
        for result in unsafe { self.loader.scan_directory(dir) } {
            match result.and_then(|plugin| self.add_plugin(plugin)) {
                Ok(()) => loaded += 1,
                Err(e) => tracing::warn!(error = %e, "skipping plugin"),
            }
        }
        loaded
    }

    fn add_plugin(&self, plugin: Plugin) -> Result<()> {
        let mut modules = self.lock_modules();
        if modules.iter().any(|p| p.name() == plugin.name()) {
            return Err(Error::PluginLoad {
                path: plugin.library().path().display().to_string(),
                message: format!("plugin '{}' is already loaded", plugin.name()),
            });
        }
        for entry in plugin_entries(&plugin, None) {
            self.insert_entry(entry);
        }
        modules.push(plugin);
        observability::record_plugins_loaded(modules.len());
        Ok(())
    }

    /// Names of the loaded plugins.
    pub fn plugin_names(&self) -> Vec<String> {
        self.lock_modules()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Unregister the components of a plugin and close its library.
    ///
    /// Fails with [`Error::PluginUnload`] (and keeps the plugin registered)
    /// while instances created from it are still alive.
    pub fn unload_plugin(&self, name: &str) -> Result<()> {
        let mut modules = self.lock_modules();
        let index = modules
            .iter()
            .position(|p| p.name() == name)
            .ok_or_else(|| Error::PluginUnload {
                name: name.to_string(),
                message: "plugin is not loaded".into(),
            })?;

        let origin = EntryOrigin::Plugin(name.to_string());
        let removed: Vec<String> = {
            let mut entries = self.write_entries();
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, e)| *e.origin() == origin)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &keys {
                entries.remove(key);
            }
            keys
        };

        let plugin = modules.remove(index);
        if Arc::strong_count(plugin.library()) > 1 {
            // Live instances still reference the module.
            for entry in plugin_entries(&plugin, Some(&removed)) {
                self.insert_entry(entry);
            }
            modules.insert(index, plugin);
            tracing::error!(plugin = name, "failed to unload plugin, instances still alive");
            return Err(Error::PluginUnload {
                name: name.to_string(),
                message: "instances created from this plugin are still alive".into(),
            });
        }

        plugin.unload()?;
        observability::record_plugins_loaded(modules.len());
        tracing::info!(plugin = name, "unloaded plugin");
        Ok(())
    }

    /// Unload every plugin. Failures are logged and the remaining plugins are
    /// still processed; the first error is returned.
    pub fn unload_plugins(&self) -> Result<()> {
        let mut first_error = None;
        for name in self.plugin_names().into_iter().rev() {
            if let Err(e) = self.unload_plugin(&name) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // ------------------------------------------------------------------
    // Root and locator resolution
    // ------------------------------------------------------------------

    /// Make `root` the root of the object tree.
    ///
    /// The root's locator becomes `$`. The previous root, if any, is handed
    /// back to the caller rather than destroyed.
    pub fn register_root(&mut self, mut root: ComponentPtr) -> Option<ComponentPtr> {
        root.set_loc(locator::ROOT.to_string());
        tracing::debug!(key = root.key(), "registered root component");
        self.root.replace(root)
    }

    /// Remove and return the root.
    pub fn take_root(&mut self) -> Option<ComponentPtr> {
        self.root.take()
    }

    /// The root, if registered.
    pub fn root(&self) -> Option<&ComponentPtr> {
        self.root.as_ref()
    }

    /// Mutable root, if registered.
    pub fn root_mut(&mut self) -> Option<&mut ComponentPtr> {
        self.root.as_mut()
    }

    /// Resolve a locator (`$.a.b`) to a live component.
    pub fn resolve(&self, loc: &str) -> Result<&ComponentPtr> {
        locator::resolve(self.root.as_ref(), loc)
    }

    /// Resolve a locator to a live component for mutation.
    pub fn resolve_mut(&mut self, loc: &str) -> Result<&mut ComponentPtr> {
        locator::resolve_mut(self.root.as_mut(), loc)
    }

    /// Resolve and downcast.
    pub fn get<T: Component>(&self, loc: &str) -> Result<&T> {
        let ptr = self.resolve(loc)?;
        let key = ptr.key().to_string();
        ptr.downcast_ref::<T>()
            .ok_or_else(|| type_mismatch::<T>(loc, &key))
    }

    /// Resolve and downcast for mutation.
    pub fn get_mut<T: Component>(&mut self, loc: &str) -> Result<&mut T> {
        let ptr = self.resolve_mut(loc)?;
        let key = ptr.key().to_string();
        ptr.downcast_mut::<T>()
            .ok_or_else(|| type_mismatch::<T>(loc, &key))
    }
}

fn type_mismatch<T>(loc: &str, key: &str) -> Error {
    Error::InvalidState(format!(
        "component at '{loc}' ('{key}') is not a {}",
        std::any::type_name::<T>()
    ))
}

/// Build registry entries for the components listed by a plugin descriptor.
///
/// With `only`, entries are limited to the given keys.
fn plugin_entries(plugin: &Plugin, only: Option<&[String]>) -> Vec<RegistryEntry> {
    // SAFETY: The descriptor was validated at load time.
    let components = unsafe { plugin.descriptor().components() };
    components
        .iter()
        .filter_map(|desc| {
            // SAFETY: Validated at load time.
            let key = unsafe { desc.key_str() }.to_string();
            if only.is_some_and(|keys| !keys.contains(&key)) {
                return None;
            }
            let factory = Arc::new(PluginFactory {
                _library: Arc::clone(plugin.library()),
                create: desc.create,
                release: desc.release,
            });
            let release_factory = Arc::clone(&factory);
            Some(RegistryEntry::new(
                key,
                Arc::new(move || factory.create()),
                Arc::new(move |raw| release_factory.release(raw)),
                EntryOrigin::Plugin(plugin.name().to_string()),
            ))
        })
        .collect()
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ComponentRegistry {
    fn drop(&mut self) {
        // The tree may contain plugin instances; release it first.
        self.root = None;
        if let Err(e) = self.unload_plugins() {
            tracing::warn!(error = %e, "plugins left loaded at teardown");
        }
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("entries", &self.len())
            .field("plugins", &self.plugin_names())
            .field("root", &self.root.as_ref().map(|r| r.key()))
            .finish()
    }
}

/// Release an instance created by [`component_to_raw`] in this module.
///
/// Convenience for hand-written `register` calls.
pub fn release_boxed(raw: RawComponent) {
    // SAFETY: raw was produced by component_to_raw in this module.
    drop(unsafe { component_from_raw(raw.as_ptr()) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{InputArchive, OutputArchive};

    #[derive(Default)]
    struct Leaf {
        value: i64,
    }

    impl Component for Leaf {
        fn construct(&mut self, ctx: &ConstructContext<'_>) -> Result<()> {
            if ctx.props["fail"].as_bool() == Some(true) {
                return Err(Error::Config("asked to fail".into()));
            }
            self.value = ctx.props["value"].as_i64().unwrap_or(0);
            Ok(())
        }

        fn save(&self, ar: &mut OutputArchive) -> Result<()> {
            ar.write_i64(self.value);
            Ok(())
        }

        fn load(&mut self, ar: &mut InputArchive<'_>) -> Result<()> {
            self.value = ar.read_i64()?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Other;

    impl Component for Other {}

    #[test]
    fn test_create_stamps_key() {
        let registry = ComponentRegistry::new();
        registry.register_type::<Leaf>("test::leaf");
        let ptr = registry.create("test::leaf", "").unwrap();
        assert_eq!(ptr.key(), "test::leaf");
        assert_eq!(ptr.entry().origin(), &EntryOrigin::Static);
    }

    #[test]
    fn test_create_unknown_key() {
        let registry = ComponentRegistry::new();
        let err = registry.create("test::missing", "").unwrap_err();
        assert!(matches!(err, Error::ComponentNotFound { ref key } if key == "test::missing"));
        let message = err.to_string();
        assert!(message.contains("test::missing"));
        assert!(message.contains("plugin"));
    }

    #[test]
    fn test_overwrite_last_wins() {
        let registry = ComponentRegistry::new();
        assert!(!registry.register_type::<Leaf>("test::slot"));
        assert!(registry.register_type::<Other>("test::slot"));
        let ptr = registry.create("test::slot", "").unwrap();
        assert!(ptr.is::<Other>());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister() {
        let registry = ComponentRegistry::new();
        registry.register_type::<Leaf>("test::leaf");
        let live = registry.create("test::leaf", "").unwrap();
        assert!(registry.unregister("test::leaf"));
        assert!(!registry.unregister("test::leaf"));
        assert!(!registry.contains("test::leaf"));
        assert!(registry.create("test::leaf", "").is_err());
        // The live instance still knows how to release itself.
        drop(live);
    }

    #[test]
    fn test_construct_with_props() {
        let registry = ComponentRegistry::new();
        registry.register_type::<Leaf>("test::leaf");
        let ptr = registry
            .create_with("test::leaf", "", &serde_json::json!({ "value": 42 }))
            .unwrap();
        assert_eq!(ptr.downcast_ref::<Leaf>().unwrap().value, 42);

        let err = registry
            .create_with("test::leaf", "", &serde_json::json!({ "fail": true }))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_null_factory() {
        let registry = ComponentRegistry::new();
        registry.register("test::null", || None, release_boxed);
        assert!(matches!(
            registry.create("test::null", ""),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_keys_and_foreach() {
        let registry = ComponentRegistry::new();
        registry.register_type::<Leaf>("test::a");
        registry.register_type::<Leaf>("test::b");
        let mut keys = registry.keys();
        keys.sort();
        assert_eq!(keys, vec!["test::a".to_string(), "test::b".to_string()]);

        let mut count = 0;
        registry.foreach_registered(|_| count += 1);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_register_root_returns_previous() {
        let mut registry = ComponentRegistry::new();
        registry.register_type::<Leaf>("test::leaf");
        assert!(registry.resolve("$").is_err());

        let first = registry.create("test::leaf", "").unwrap();
        assert!(registry.register_root(first).is_none());
        assert_eq!(registry.resolve("$").unwrap().loc(), "$");

        let second = registry.create("test::leaf", "").unwrap();
        let previous = registry.register_root(second).unwrap();
        assert_eq!(previous.key(), "test::leaf");
    }

    #[test]
    fn test_typed_get() {
        let mut registry = ComponentRegistry::new();
        registry.register_type::<Leaf>("test::leaf");
        let root = registry
            .create_with("test::leaf", "", &serde_json::json!({ "value": 7 }))
            .unwrap();
        registry.register_root(root);

        assert_eq!(registry.get::<Leaf>("$").unwrap().value, 7);
        registry.get_mut::<Leaf>("$").unwrap().value = 8;
        assert_eq!(registry.get::<Leaf>("$").unwrap().value, 8);
        assert!(matches!(
            registry.get::<Other>("$"),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_unload_unknown_plugin() {
        let registry = ComponentRegistry::new();
        assert!(matches!(
            registry.unload_plugin("nope"),
            Err(Error::PluginUnload { .. })
        ));
        assert!(registry.unload_plugins().is_ok());
    }

    #[test]
    fn test_missing_plugin_directory() {
        let registry = ComponentRegistry::new();
        let loaded = unsafe { registry.load_plugin_directory("/nonexistent/lumen/plugins") };
        assert_eq!(loaded, 0);
    }
}
