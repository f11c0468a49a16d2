//! Component types defined at runtime.
//!
//! An [`ExtensionClass`] describes a component type that the core was not
//! compiled with, such as a class written in an embedded scripting layer. Its
//! instances carry a free-form JSON state next to their named children, and
//! both are captured by save/load, so such components survive a round trip
//! like any compiled-in one. A class may also keep native data outside the
//! JSON state and persist it through its own save/load hooks, which run after
//! the base children and state.

use super::builtin::{Children, construct_children, load_children, save_children};
use super::{Component, ComponentPtr, ConstructContext, Props, RawComponent, component_to_raw};
use crate::error::Result;
use crate::registry::{ComponentRegistry, EntryOrigin, RegistryEntry, release_boxed};
use crate::serial::{InputArchive, OutputArchive};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Hook run after the default state and children are in place.
pub type ConstructHook =
    Arc<dyn Fn(&mut ExtensionComponent, &ConstructContext<'_>) -> Result<()> + Send + Sync>;

/// Hook appending class-specific fields after the base block.
pub type SaveHook = Arc<dyn Fn(&ExtensionComponent, &mut OutputArchive) -> Result<()> + Send + Sync>;

/// Hook reading back what the matching [`SaveHook`] wrote.
pub type LoadHook =
    Arc<dyn Fn(&mut ExtensionComponent, &mut InputArchive<'_>) -> Result<()> + Send + Sync>;

/// A component type defined at runtime.
pub struct ExtensionClass {
    key: String,
    default_state: Props,
    construct: Option<ConstructHook>,
    save: Option<SaveHook>,
    load: Option<LoadHook>,
}

impl ExtensionClass {
    /// New class registered under `key` with an empty object as state.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            default_state: Props::Object(Default::default()),
            construct: None,
            save: None,
            load: None,
        }
    }

    /// Initial state of every instance.
    pub fn with_state(mut self, state: Props) -> Self {
        self.default_state = state;
        self
    }

    /// Run `hook` at construction time.
    pub fn with_construct<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut ExtensionComponent, &ConstructContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.construct = Some(Arc::new(hook));
        self
    }

    /// Persist extra fields after the children and JSON state.
    ///
    /// Pair it with [`with_load`](Self::with_load) reading the same layout.
    pub fn with_save<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ExtensionComponent, &mut OutputArchive) -> Result<()> + Send + Sync + 'static,
    {
        self.save = Some(Arc::new(hook));
        self
    }

    /// Restore the fields written by the save hook.
    pub fn with_load<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut ExtensionComponent, &mut InputArchive<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.load = Some(Arc::new(hook));
        self
    }

    /// Registry key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Register the class. Returns `true` when an existing key was overwritten.
    pub fn register(self, registry: &ComponentRegistry) -> bool {
        let class = Arc::new(self);
        let key = class.key.clone();
        let create = move || {
            let instance = ExtensionComponent::new(Arc::clone(&class));
            RawComponent::from_ptr(component_to_raw(Box::new(instance)))
        };
        registry.insert_entry(RegistryEntry::new(
            key,
            Arc::new(create),
            Arc::new(release_boxed),
            EntryOrigin::Extension,
        ))
    }
}

impl fmt::Debug for ExtensionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionClass")
            .field("key", &self.key)
            .field("default_state", &self.default_state)
            .field("construct", &self.construct.is_some())
            .field("save", &self.save.is_some())
            .field("load", &self.load.is_some())
            .finish()
    }
}

/// Instance of an [`ExtensionClass`].
pub struct ExtensionComponent {
    class: Arc<ExtensionClass>,
    state: Props,
    children: Children,
    data: Option<Box<dyn Any + Send + Sync>>,
}

impl ExtensionComponent {
    fn new(class: Arc<ExtensionClass>) -> Self {
        let state = class.default_state.clone();
        Self {
            class,
            state,
            children: Children::new(),
            data: None,
        }
    }

    /// Attach native data kept outside the JSON state.
    pub fn set_data<T: Any + Send + Sync>(&mut self, data: T) {
        self.data = Some(Box::new(data));
    }

    /// Native data, if it is a `T`.
    pub fn data<T: Any>(&self) -> Option<&T> {
        self.data.as_ref()?.downcast_ref()
    }

    /// Mutable native data, if it is a `T`.
    pub fn data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.data.as_mut()?.downcast_mut()
    }

    /// Key of the defining class.
    pub fn class_key(&self) -> &str {
        &self.class.key
    }

    /// Out-of-band state.
    pub fn state(&self) -> &Props {
        &self.state
    }

    /// Mutable out-of-band state.
    pub fn state_mut(&mut self) -> &mut Props {
        &mut self.state
    }

    /// Set one state field, turning the state into an object if needed.
    pub fn set(&mut self, field: &str, value: impl Into<Props>) {
        if !self.state.is_object() {
            self.state = Props::Object(Default::default());
        }
        self.state[field] = value.into();
    }

    /// Insert a child, returning the previous occupant.
    pub fn insert_child(
        &mut self,
        name: &str,
        child: ComponentPtr,
    ) -> Result<Option<ComponentPtr>> {
        crate::locator::validate_name(name)?;
        Ok(self.children.insert(name.to_string(), child))
    }
}

impl Component for ExtensionComponent {
    fn construct(&mut self, ctx: &ConstructContext<'_>) -> Result<()> {
        if let (Some(state), Some(props)) = (self.state.as_object_mut(), ctx.props["state"].as_object()) {
            for (k, v) in props {
                state.insert(k.clone(), v.clone());
            }
        }
        self.children = construct_children(ctx, &ctx.props["children"])?;
        if let Some(hook) = self.class.construct.clone() {
            hook(self, ctx)?;
        }
        Ok(())
    }

    fn save(&self, ar: &mut OutputArchive) -> Result<()> {
        save_children(&self.children, ar)?;
        ar.write_json(&self.state)?;
        match &self.class.save {
            Some(hook) => hook(self, ar),
            None => Ok(()),
        }
    }

    fn load(&mut self, ar: &mut InputArchive<'_>) -> Result<()> {
        self.children = load_children(ar)?;
        self.state = ar.read_json()?;
        if let Some(hook) = self.class.load.clone() {
            hook(self, ar)?;
        }
        Ok(())
    }

    fn underlying(&self, name: &str) -> Option<&ComponentPtr> {
        self.children.get(name)
    }

    fn underlying_mut(&mut self, name: &str) -> Option<&mut ComponentPtr> {
        self.children.get_mut(name)
    }

    fn foreach_underlying(&self, visitor: &mut dyn FnMut(&ComponentPtr)) {
        self.children.values().for_each(visitor);
    }

    fn underlying_value(&self, query: &str) -> Props {
        if query.starts_with('/') {
            self.state.pointer(query).cloned().unwrap_or(Props::Null)
        } else {
            self.state.get(query).cloned().unwrap_or(Props::Null)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::register_builtins;
    use crate::error::Error;
    use serde_json::json;

    #[test]
    fn test_register_and_create() {
        let registry = ComponentRegistry::new();
        ExtensionClass::new("py::sphere")
            .with_state(json!({ "radius": 1.0 }))
            .register(&registry);

        let ptr = registry
            .create_with("py::sphere", "", &json!({ "state": { "radius": 2.5 } }))
            .unwrap();
        assert_eq!(ptr.key(), "py::sphere");
        assert_eq!(ptr.entry().origin(), &EntryOrigin::Extension);
        assert_eq!(ptr.get().underlying_value("radius"), json!(2.5));
    }

    #[test]
    fn test_construct_hook() {
        let registry = ComponentRegistry::new();
        ExtensionClass::new("py::counter")
            .with_construct(|this, ctx| {
                let start = ctx.props["start"].as_i64().unwrap_or(0);
                this.set("count", start * 2);
                Ok(())
            })
            .register(&registry);
        let ptr = registry
            .create_with("py::counter", "", &json!({ "start": 4 }))
            .unwrap();
        assert_eq!(ptr.get().underlying_value("/count"), json!(8));

        ExtensionClass::new("py::broken")
            .with_construct(|_, _| Err(Error::Config("broken".into())))
            .register(&registry);
        assert!(registry.create("py::broken", "").is_err());
    }

    #[test]
    fn test_pickle_roundtrip_with_children() {
        let registry = ComponentRegistry::new();
        register_builtins(&registry);
        ExtensionClass::new("py::scene").register(&registry);

        let mut scene = registry
            .create_with(
                "py::scene",
                "$",
                &json!({
                    "state": { "title": "cornell" },
                    "children": { "film": { "type": "film::accum", "props": { "size": 2 } } }
                }),
            )
            .unwrap();
        scene
            .downcast_mut::<ExtensionComponent>()
            .unwrap()
            .set("spp", 16);

        let bytes = crate::serial::to_bytes(Some(&scene)).unwrap();
        let restored = crate::serial::from_bytes(&registry, &bytes).unwrap().unwrap();
        let ext = restored.downcast_ref::<ExtensionComponent>().unwrap();
        assert_eq!(ext.class_key(), "py::scene");
        assert_eq!(ext.state(), &json!({ "title": "cornell", "spp": 16 }));
        assert_eq!(restored.get().underlying("film").unwrap().loc(), "$.film");
    }

    /// Running mean kept natively rather than in the JSON state.
    #[derive(Debug, Default, PartialEq)]
    struct Stats {
        samples: Vec<f64>,
    }

    fn stats_class() -> ExtensionClass {
        ExtensionClass::new("py::stats")
            .with_construct(|this, _| {
                this.set_data(Stats::default());
                Ok(())
            })
            .with_save(|this, ar| {
                let samples = this.data::<Stats>().map_or(&[][..], |s| &s.samples[..]);
                ar.write_f64_slice(samples)
            })
            .with_load(|this, ar| {
                let samples = ar.read_f64_vec()?;
                this.set_data(Stats { samples });
                Ok(())
            })
    }

    #[test]
    fn test_save_load_hooks_persist_native_data() {
        let registry = ComponentRegistry::new();
        stats_class().register(&registry);

        let mut ptr = registry
            .create_with("py::stats", "$", &json!({ "state": { "label": "luminance" } }))
            .unwrap();
        let ext = ptr.downcast_mut::<ExtensionComponent>().unwrap();
        ext.data_mut::<Stats>().unwrap().samples.extend([0.5, 1.5]);

        let bytes = crate::serial::to_bytes(Some(&ptr)).unwrap();
        let restored = crate::serial::from_bytes(&registry, &bytes).unwrap().unwrap();
        let ext = restored.downcast_ref::<ExtensionComponent>().unwrap();
        assert_eq!(ext.state(), &json!({ "label": "luminance" }));
        assert_eq!(
            ext.data::<Stats>(),
            Some(&Stats {
                samples: vec![0.5, 1.5]
            })
        );
        assert!(ext.data::<String>().is_none());
    }

    #[test]
    fn test_load_without_hook_rejects_hook_fields() {
        let producer = ComponentRegistry::new();
        stats_class().register(&producer);
        let ptr = producer.create("py::stats", "$").unwrap();
        let bytes = crate::serial::to_bytes(Some(&ptr)).unwrap();

        // Same key, no load hook: the extra fields are left unread.
        let consumer = ComponentRegistry::new();
        ExtensionClass::new("py::stats").register(&consumer);
        assert!(matches!(
            crate::serial::from_bytes(&consumer, &bytes),
            Err(Error::DeserializationFormat(_))
        ));
    }
}
