//! Polymorphic components.
//!
//! Every object managed by the runtime implements [`Component`]. Instances are
//! created by string key through the [`ComponentRegistry`], owned through a
//! [`ComponentPtr`] and addressed inside the live object tree by locator
//! (`$.assets.film`).
//!
//! # Example
//!
//! ```rust
//! use lumen::component::{Component, ConstructContext};
//! use lumen::registry::ComponentRegistry;
//! use lumen::serial::{InputArchive, OutputArchive};
//! use lumen::Result;
//!
//! #[derive(Default)]
//! struct Counter {
//!     value: u64,
//! }
//!
//! impl Component for Counter {
//!     fn construct(&mut self, ctx: &ConstructContext<'_>) -> Result<()> {
//!         self.value = ctx.props["value"].as_u64().unwrap_or(0);
//!         Ok(())
//!     }
//!
//!     fn save(&self, ar: &mut OutputArchive) -> Result<()> {
//!         ar.write_u64(self.value);
//!         Ok(())
//!     }
//!
//!     fn load(&mut self, ar: &mut InputArchive<'_>) -> Result<()> {
//!         self.value = ar.read_u64()?;
//!         Ok(())
//!     }
//! }
//!
//! let registry = ComponentRegistry::new();
//! registry.register_type::<Counter>("demo::counter");
//!
//! let counter = registry
//!     .create_with("demo::counter", "", &serde_json::json!({ "value": 3 }))
//!     .unwrap();
//! assert_eq!(counter.key(), "demo::counter");
//! assert_eq!(counter.downcast_ref::<Counter>().unwrap().value, 3);
//! ```

mod builtin;
mod extension;
mod handle;

use crate::error::{Error, Result};
use crate::registry::ComponentRegistry;
use crate::serial::{InputArchive, OutputArchive};
use std::any::Any;

pub use builtin::{
    ACCUM_FILM_KEY, AccumFilm, DEFAULT_CONTEXT_KEY, DefaultContext, register_builtins,
};
pub use extension::{ConstructHook, ExtensionClass, ExtensionComponent};
pub use handle::{ComponentPtr, RawComponent, component_from_raw, component_to_raw};

/// Configuration properties handed to `construct` and `init`-style entry points.
pub type Props = serde_json::Value;

/// Upcast helper so trait objects can be downcast to their concrete type.
///
/// Implemented for every `'static` type; component authors never implement it.
pub trait AsAny: Any {
    /// View as `&dyn Any`.
    fn as_any(&self) -> &dyn Any;
    /// View as `&mut dyn Any`.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Everything a component sees while it is being constructed.
pub struct ConstructContext<'a> {
    /// Registry that created the instance; used to create children.
    pub registry: &'a ComponentRegistry,
    /// Locator assigned to the instance (empty when outside the tree).
    pub loc: &'a str,
    /// Configuration properties.
    pub props: &'a Props,
}

impl<'a> ConstructContext<'a> {
    /// Locator of a child named `name` under this instance.
    pub fn make_loc(&self, name: &str) -> String {
        crate::locator::make_loc(self.loc, name)
    }

    /// Create and construct a child component named `name`.
    pub fn create_child(&self, key: &str, name: &str, props: &Props) -> Result<ComponentPtr> {
        crate::locator::validate_name(name)?;
        self.registry.create_with(key, &self.make_loc(name), props)
    }
}

/// Base trait of all components.
///
/// All methods have defaults so a plain data type only needs an empty `impl`.
pub trait Component: AsAny + Send + Sync {
    /// Called once right after creation.
    ///
    /// Returning an error fails the creation; the instance is released through
    /// the release function of the factory that made it.
    fn construct(&mut self, ctx: &ConstructContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Append the component's fields to the archive.
    fn save(&self, ar: &mut OutputArchive) -> Result<()> {
        let _ = ar;
        Ok(())
    }

    /// Restore the fields written by [`Component::save`].
    fn load(&mut self, ar: &mut InputArchive<'_>) -> Result<()> {
        let _ = ar;
        Ok(())
    }

    /// Named child lookup used by locator resolution.
    fn underlying(&self, name: &str) -> Option<&ComponentPtr> {
        let _ = name;
        None
    }

    /// Mutable named child lookup.
    fn underlying_mut(&mut self, name: &str) -> Option<&mut ComponentPtr> {
        let _ = name;
        None
    }

    /// Visit every owned child.
    fn foreach_underlying(&self, visitor: &mut dyn FnMut(&ComponentPtr)) {
        let _ = visitor;
    }

    /// Query an implementation-defined value (debugging aid).
    fn underlying_value(&self, query: &str) -> Props {
        let _ = query;
        Props::Null
    }

    /// Add a partial result of the same concrete type into `self`.
    fn accumulate(&mut self, partial: &dyn Component) -> Result<()> {
        let _ = partial;
        Err(Error::Unsupported(
            "component does not accumulate partial results".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Plain;

    impl Component for Plain {}

    #[test]
    fn test_default_methods() {
        let mut plain = Plain;
        assert!(plain.underlying("x").is_none());
        assert!(plain.underlying_mut("x").is_none());
        assert!(plain.underlying_value("").is_null());
        assert!(matches!(
            plain.accumulate(&Plain),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_downcast_through_trait_object() {
        let boxed: Box<dyn Component> = Box::new(Plain);
        assert!(boxed.as_ref().as_any().downcast_ref::<Plain>().is_some());
    }
}
