//! Plugin system for dynamically loading components.
//!
//! A plugin is a shared library (`.so` on Linux) that exports a single symbol:
//!
//! ```c
//! const PluginDescriptor* lumen_plugin_descriptor();
//! ```
//!
//! The descriptor lists the component keys the plugin provides, each with a
//! C-ABI create/release pair. After loading, the
//! [`ComponentRegistry`](crate::registry::ComponentRegistry) registers every
//! listed key; unloading unregisters them again.
//!
//! # Example Plugin (Rust)
//!
//! ```ignore
//! use lumen::component::Component;
//!
//! #[derive(Default)]
//! struct Checker;
//!
//! impl Component for Checker {}
//!
//! lumen::define_plugin! {
//!     name: "texture_checker",
//!     version: "0.1.0",
//!     description: "Procedural checker texture",
//!     components: [
//!         {
//!             ident: checker,
//!             key: "texture::checker",
//!             description: "Two-colour checker",
//!             create: || Box::new(Checker),
//!         },
//!     ],
//! }
//! ```

mod descriptor;
mod loader;

pub use descriptor::{
    ComponentDescriptor, ComponentInfo, CreateComponentFn, LUMEN_ABI_VERSION, PLUGIN_ENTRY_POINT,
    PluginDescriptor, PluginInfo, ReleaseComponentFn,
};
pub use loader::{
    LoaderConfig, Plugin, PluginLoader, SharedLibrary, is_plugin_filename, with_library_suffix,
};
