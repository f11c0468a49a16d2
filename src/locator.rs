//! Hierarchical addressing of live components.
//!
//! Grammar: `$` names the root; a locator is `$` followed by zero or more
//! `.segment` parts. There is no escaping, so names may not contain `.`;
//! [`validate_name`] enforces that where children are named.

use crate::component::{Component, ComponentPtr};
use crate::error::{Error, Result};
use crate::registry::ComponentRegistry;
use crate::serial::{InputArchive, OutputArchive};
use std::fmt;
use std::marker::PhantomData;

/// The root sigil.
pub const ROOT: &str = "$";

/// Segment separator.
pub const SEPARATOR: char = '.';

/// A parsed locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator<'a> {
    raw: &'a str,
    segments: Vec<&'a str>,
}

impl<'a> Locator<'a> {
    /// Parse a locator string.
    pub fn parse(raw: &'a str) -> Result<Self> {
        let mut parts = raw.split(SEPARATOR);
        if parts.next() != Some(ROOT) {
            return Err(Error::InvalidLocator(raw.to_string()));
        }
        let segments: Vec<&str> = parts.collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(Error::InvalidLocator(raw.to_string()));
        }
        Ok(Self { raw, segments })
    }

    /// Path segments below the root.
    pub fn segments(&self) -> &[&'a str] {
        &self.segments
    }

    /// Whether this is the root locator.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// The original string.
    pub fn as_str(&self) -> &'a str {
        self.raw
    }
}

impl fmt::Display for Locator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.raw)
    }
}

/// Reject names that cannot be addressed by a locator.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == ROOT || name.contains(SEPARATOR) {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Locator of a child named `name` under `base`.
///
/// An empty base yields an empty result; instances outside the tree have no
/// locator and neither do their children.
pub fn make_loc(base: &str, name: &str) -> String {
    if base.is_empty() {
        String::new()
    } else {
        format!("{base}{SEPARATOR}{name}")
    }
}

/// Last segment of a locator (`$` for the root).
pub fn name(loc: &str) -> &str {
    loc.rsplit_once(SEPARATOR).map_or(loc, |(_, name)| name)
}

/// Locator of the parent, or an empty string for the root or an empty locator.
pub fn parent_loc(loc: &str) -> &str {
    loc.rsplit_once(SEPARATOR).map_or("", |(parent, _)| parent)
}

fn not_found(loc: &str, segment: &str) -> Error {
    Error::LocatorNotFound {
        loc: loc.to_string(),
        segment: segment.to_string(),
    }
}

/// Walk `loc` from `root` through the named-child capability.
pub fn resolve<'r>(root: Option<&'r ComponentPtr>, loc: &str) -> Result<&'r ComponentPtr> {
    let locator = Locator::parse(loc)?;
    let mut current = root.ok_or_else(|| Error::RootNotRegistered(loc.to_string()))?;
    for segment in locator.segments() {
        current = current
            .get()
            .underlying(segment)
            .ok_or_else(|| not_found(loc, segment))?;
    }
    Ok(current)
}

/// Mutable variant of [`resolve`].
pub fn resolve_mut<'r>(
    root: Option<&'r mut ComponentPtr>,
    loc: &str,
) -> Result<&'r mut ComponentPtr> {
    let locator = Locator::parse(loc)?;
    let mut current = root.ok_or_else(|| Error::RootNotRegistered(loc.to_string()))?;
    for segment in locator.segments() {
        current = current
            .get_mut()
            .underlying_mut(segment)
            .ok_or_else(|| not_found(loc, segment))?;
    }
    Ok(current)
}

/// Non-owning reference to a component in the tree.
///
/// Stored as a locator and resolved on demand, so it never keeps its target
/// alive and is serialised as the locator string rather than a copy.
pub struct WeakRef<T> {
    loc: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Component> WeakRef<T> {
    /// Reference the component at `loc`.
    pub fn new(loc: impl Into<String>) -> Self {
        Self {
            loc: loc.into(),
            _marker: PhantomData,
        }
    }

    /// Reference an existing instance by its locator.
    pub fn to(ptr: &ComponentPtr) -> Self {
        Self::new(ptr.loc())
    }

    /// Target locator (empty when unset).
    pub fn loc(&self) -> &str {
        &self.loc
    }

    /// Whether a target is set.
    pub fn is_set(&self) -> bool {
        !self.loc.is_empty()
    }

    /// Resolve the target through the registry's root.
    pub fn resolve<'r>(&self, registry: &'r ComponentRegistry) -> Result<&'r T> {
        registry.get::<T>(&self.loc)
    }

    /// Write the locator.
    pub fn save(&self, ar: &mut OutputArchive) -> Result<()> {
        ar.write_str(&self.loc)
    }

    /// Read the locator back. Resolution happens later, against the restored tree.
    pub fn load(&mut self, ar: &mut InputArchive<'_>) -> Result<()> {
        self.loc = ar.read_string()?;
        Ok(())
    }
}

impl<T> Default for WeakRef<T> {
    fn default() -> Self {
        Self {
            loc: String::new(),
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for WeakRef<T> {
    fn clone(&self) -> Self {
        Self {
            loc: self.loc.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for WeakRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakRef").field(&self.loc).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ConstructContext, Props};
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Node {
        children: BTreeMap<String, ComponentPtr>,
    }

    impl Component for Node {
        fn construct(&mut self, ctx: &ConstructContext<'_>) -> Result<()> {
            if let Some(names) = ctx.props["children"].as_array() {
                for name in names.iter().filter_map(Props::as_str) {
                    let child = ctx.create_child("test::node", name, &Props::Null)?;
                    self.children.insert(name.to_string(), child);
                }
            }
            Ok(())
        }

        fn underlying(&self, name: &str) -> Option<&ComponentPtr> {
            self.children.get(name)
        }

        fn underlying_mut(&mut self, name: &str) -> Option<&mut ComponentPtr> {
            self.children.get_mut(name)
        }
    }

    fn tree() -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        registry.register_type::<Node>("test::node");
        let mut root = registry.create("test::node", ROOT).unwrap();
        let a = registry
            .create_with("test::node", "$.a", &serde_json::json!({ "children": ["b"] }))
            .unwrap();
        root.downcast_mut::<Node>()
            .unwrap()
            .children
            .insert("a".into(), a);
        registry.register_root(root);
        registry
    }

    #[test]
    fn test_parse() {
        let loc = Locator::parse("$.a.b").unwrap();
        assert_eq!(loc.segments(), &["a", "b"]);
        assert!(Locator::parse("$").unwrap().is_root());
        assert!(matches!(Locator::parse(""), Err(Error::InvalidLocator(_))));
        assert!(matches!(Locator::parse("a.b"), Err(Error::InvalidLocator(_))));
        assert!(matches!(Locator::parse("$..a"), Err(Error::InvalidLocator(_))));
        assert!(matches!(Locator::parse("$a"), Err(Error::InvalidLocator(_))));
    }

    #[test]
    fn test_resolve_nested() {
        let registry = tree();
        let b = registry.resolve("$.a.b").unwrap();
        assert_eq!(b.loc(), "$.a.b");
        assert_eq!(registry.resolve("$").unwrap().loc(), "$");
    }

    #[test]
    fn test_resolve_errors() {
        let registry = tree();
        assert!(matches!(
            registry.resolve("$.x"),
            Err(Error::LocatorNotFound { ref segment, .. }) if segment == "x"
        ));
        assert!(matches!(
            registry.resolve("$.a.b.c"),
            Err(Error::LocatorNotFound { .. })
        ));
        assert!(matches!(registry.resolve("a.b"), Err(Error::InvalidLocator(_))));
        assert!(matches!(registry.resolve(""), Err(Error::InvalidLocator(_))));

        let empty = ComponentRegistry::new();
        assert!(matches!(empty.resolve("$"), Err(Error::RootNotRegistered(_))));
    }

    #[test]
    fn test_resolve_mut() {
        let mut registry = tree();
        let b = registry.resolve_mut("$.a.b").unwrap();
        assert!(b.downcast_mut::<Node>().is_some());
    }

    #[test]
    fn test_name_helpers() {
        assert_eq!(name("$.a.b"), "b");
        assert_eq!(name("$"), "$");
        assert_eq!(parent_loc("$.a.b"), "$.a");
        assert_eq!(parent_loc("$"), "");
        assert_eq!(make_loc("$.a", "b"), "$.a.b");
        assert_eq!(make_loc("", "b"), "");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("film").is_ok());
        assert!(matches!(validate_name(""), Err(Error::InvalidName(_))));
        assert!(matches!(validate_name("$"), Err(Error::InvalidName(_))));
        assert!(matches!(validate_name("a.b"), Err(Error::InvalidName(_))));
    }

    #[test]
    fn test_weak_ref() {
        let registry = tree();
        let weak = WeakRef::<Node>::new("$.a.b");
        assert!(weak.is_set());
        assert!(weak.resolve(&registry).is_ok());
        assert!(WeakRef::<Node>::default().resolve(&registry).is_err());
    }
}
