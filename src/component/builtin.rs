//! Components every runtime registers.

use super::{Component, ComponentPtr, ConstructContext, Props};
use crate::error::{Error, Result};
use crate::registry::ComponentRegistry;
use crate::serial::{InputArchive, OutputArchive};
use std::collections::BTreeMap;

/// Key of [`DefaultContext`].
pub const DEFAULT_CONTEXT_KEY: &str = "context::default";

/// Key of [`AccumFilm`].
pub const ACCUM_FILM_KEY: &str = "film::accum";

/// Register the built-in components.
pub fn register_builtins(registry: &ComponentRegistry) {
    registry.register_type::<DefaultContext>(DEFAULT_CONTEXT_KEY);
    registry.register_type::<AccumFilm>(ACCUM_FILM_KEY);
}

/// Named children shared by container components.
pub(crate) type Children = BTreeMap<String, ComponentPtr>;

/// Create the children described by `{"name": {"type": key, "props": {...}}}`.
pub(crate) fn construct_children(ctx: &ConstructContext<'_>, desc: &Props) -> Result<Children> {
    let mut children = Children::new();
    let Some(desc) = desc.as_object() else {
        if !desc.is_null() {
            return Err(Error::Config("'children' must be an object".into()));
        }
        return Ok(children);
    };
    for (name, child) in desc {
        let key = child["type"].as_str().ok_or_else(|| {
            Error::Config(format!("child '{name}' is missing a 'type' key"))
        })?;
        let props = child.get("props").unwrap_or(&Props::Null);
        children.insert(name.clone(), ctx.create_child(key, name, props)?);
    }
    Ok(children)
}

pub(crate) fn save_children(children: &Children, ar: &mut OutputArchive) -> Result<()> {
    ar.write_len(children.len())?;
    for (name, child) in children {
        ar.write_str(name)?;
        ar.write_component(Some(child))?;
    }
    Ok(())
}

pub(crate) fn load_children(ar: &mut InputArchive<'_>) -> Result<Children> {
    let count = ar.read_u32()?;
    let mut children = Children::new();
    for _ in 0..count {
        let name = ar.read_string()?;
        let child = ar.read_component()?.ok_or_else(|| {
            Error::DeserializationFormat(format!("child '{name}' is absent"))
        })?;
        children.insert(name, child);
    }
    Ok(children)
}

/// Default root component: a plain container of named children.
///
/// ```json
/// { "children": { "film": { "type": "film::accum", "props": { "size": 100 } } } }
/// ```
#[derive(Default)]
pub struct DefaultContext {
    children: Children,
}

impl DefaultContext {
    /// Insert `child` under `name`, returning the previous occupant.
    pub fn insert(&mut self, name: &str, child: ComponentPtr) -> Result<Option<ComponentPtr>> {
        crate::locator::validate_name(name)?;
        Ok(self.children.insert(name.to_string(), child))
    }

    /// Remove a child.
    pub fn remove(&mut self, name: &str) -> Option<ComponentPtr> {
        self.children.remove(name)
    }

    /// Child names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }
}

impl Component for DefaultContext {
    fn construct(&mut self, ctx: &ConstructContext<'_>) -> Result<()> {
        self.children = construct_children(ctx, &ctx.props["children"])?;
        Ok(())
    }

    fn save(&self, ar: &mut OutputArchive) -> Result<()> {
        save_children(&self.children, ar)
    }

    fn load(&mut self, ar: &mut InputArchive<'_>) -> Result<()> {
        self.children = load_children(ar)?;
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
        match query {
            "children" => self.names().collect::<Vec<_>>().into(),
            _ => Props::Null,
        }
    }
}

/// Additive result buffer, one `f64` per pixel or sample index.
///
/// Partial buffers from workers are merged with [`Component::accumulate`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AccumFilm {
    data: Vec<f64>,
}

impl AccumFilm {
    /// Film with `size` zeroed cells.
    pub fn with_size(size: usize) -> Self {
        Self {
            data: vec![0.0; size],
        }
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the film has no cells.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Cell values.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Mutable cell values.
    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Add `value` to a cell. Out-of-range indices are ignored.
    pub fn add(&mut self, index: usize, value: f64) {
        if let Some(cell) = self.data.get_mut(index) {
            *cell += value;
        }
    }

    /// Zero every cell.
    pub fn clear(&mut self) {
        self.data.fill(0.0);
    }
}

impl Component for AccumFilm {
    fn construct(&mut self, ctx: &ConstructContext<'_>) -> Result<()> {
        let size = ctx.props["size"].as_u64().unwrap_or(0) as usize;
        self.data = vec![0.0; size];
        Ok(())
    }

    fn save(&self, ar: &mut OutputArchive) -> Result<()> {
        ar.write_f64_slice(&self.data)
    }

    fn load(&mut self, ar: &mut InputArchive<'_>) -> Result<()> {
        self.data = ar.read_f64_vec()?;
        Ok(())
    }

    fn underlying_value(&self, query: &str) -> Props {
        match query {
            "size" => self.data.len().into(),
            "sum" => self.data.iter().sum::<f64>().into(),
            _ => Props::Null,
        }
    }

    fn accumulate(&mut self, partial: &dyn Component) -> Result<()> {
        let partial = partial
            .as_any()
            .downcast_ref::<AccumFilm>()
            .ok_or_else(|| Error::Unsupported("can only accumulate another film::accum".into()))?;
        if partial.data.len() != self.data.len() {
            return Err(Error::InvalidState(format!(
                "film size mismatch: {} vs {}",
                self.data.len(),
                partial.data.len()
            )));
        }
        for (cell, v) in self.data.iter_mut().zip(&partial.data) {
            *cell += v;
        }
        Ok(())
    }
}
