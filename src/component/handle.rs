//! Owning handle for component instances.

use super::Component;
use crate::registry::RegistryEntry;
use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Type-erased pointer to a `Box<dyn Component>`.
///
/// This is the currency of create/release functions: it is a thin pointer so
/// it can cross the C ABI of a plugin, and it must be released by the module
/// that allocated it.
#[derive(Debug)]
#[repr(transparent)]
pub struct RawComponent(NonNull<c_void>);

// SAFETY: RawComponent points to a `Box<dyn Component>` and Component is
// Send + Sync.
unsafe impl Send for RawComponent {}
unsafe impl Sync for RawComponent {}

impl RawComponent {
    /// Wrap a raw pointer produced by [`component_to_raw`]. Returns `None` for null.
    pub fn from_ptr(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// The underlying thin pointer.
    pub fn as_ptr(&self) -> *mut c_void {
        self.0.as_ptr()
    }

    /// Reclaim ownership of the boxed component.
    ///
    /// # Safety
    ///
    /// The pointer must have been produced by [`component_to_raw`] in the
    /// calling module and must not be used afterwards.
    pub unsafe fn into_box(self) -> Box<dyn Component> {
        // SAFETY: Caller guarantees the pointer came from component_to_raw.
        unsafe { component_from_raw(self.0.as_ptr()) }
    }

    fn duplicate(&self) -> Self {
        Self(self.0)
    }
}

/// Convert a boxed component to a thin raw pointer for the C ABI.
///
/// Plugins use this in their create functions.
pub fn component_to_raw(component: Box<dyn Component>) -> *mut c_void {
    // Box the fat pointer so the result is a thin pointer.
    let boxed: Box<Box<dyn Component>> = Box::new(component);
    Box::into_raw(boxed) as *mut c_void
}

/// Convert a raw pointer back to a boxed component.
///
/// # Safety
///
/// The pointer must have been created by `component_to_raw` in the same module.
pub unsafe fn component_from_raw(ptr: *mut c_void) -> Box<dyn Component> {
    // SAFETY: Caller guarantees ptr was created by component_to_raw.
    let boxed: Box<Box<dyn Component>> =
        unsafe { Box::from_raw(ptr as *mut Box<dyn Component>) };
    *boxed
}

/// Exclusive owner of a component instance.
///
/// The handle remembers the registry entry (key, create and release
/// functions) the instance was made from. Dropping it calls that release
/// function, never the ambient allocator, so instances from a plugin are
/// freed by the plugin.
pub struct ComponentPtr {
    raw: RawComponent,
    entry: Arc<RegistryEntry>,
    loc: String,
}

impl ComponentPtr {
    pub(crate) fn new(raw: RawComponent, entry: Arc<RegistryEntry>, loc: String) -> Self {
        Self { raw, entry, loc }
    }

    /// Registry key the instance was created with.
    pub fn key(&self) -> &str {
        self.entry.key()
    }

    /// Registry entry the instance was created from.
    pub fn entry(&self) -> &Arc<RegistryEntry> {
        &self.entry
    }

    /// Global locator, or an empty string when outside the tree.
    pub fn loc(&self) -> &str {
        &self.loc
    }

    pub(crate) fn set_loc(&mut self, loc: String) {
        self.loc = loc;
    }

    /// Last locator segment (the name used by the parent).
    pub fn name(&self) -> &str {
        crate::locator::name(&self.loc)
    }

    /// Locator of the parent, or an empty string for the root.
    pub fn parent_loc(&self) -> &str {
        crate::locator::parent_loc(&self.loc)
    }

    /// Locator of a child of this instance.
    pub fn make_loc(&self, child: &str) -> String {
        crate::locator::make_loc(&self.loc, child)
    }

    /// Borrow the component.
    pub fn get(&self) -> &dyn Component {
        // SAFETY: raw is valid for as long as this handle lives.
        unsafe { &**(self.raw.as_ptr() as *const Box<dyn Component>) }
    }

    /// Mutably borrow the component.
    pub fn get_mut(&mut self) -> &mut dyn Component {
        // SAFETY: raw is valid and exclusively owned by this handle.
        unsafe { &mut **(self.raw.as_ptr() as *mut Box<dyn Component>) }
    }

    /// Downcast to a concrete type.
    pub fn downcast_ref<T: Component>(&self) -> Option<&T> {
        self.get().as_any().downcast_ref::<T>()
    }

    /// Mutably downcast to a concrete type.
    pub fn downcast_mut<T: Component>(&mut self) -> Option<&mut T> {
        self.get_mut().as_any_mut().downcast_mut::<T>()
    }

    /// Check the concrete type.
    pub fn is<T: Component>(&self) -> bool {
        self.get().as_any().is::<T>()
    }
}

impl Drop for ComponentPtr {
    fn drop(&mut self) {
        self.entry.release(self.raw.duplicate());
    }
}

impl fmt::Debug for ComponentPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentPtr")
            .field("key", &self.key())
            .field("loc", &self.loc)
            .finish()
    }
}
