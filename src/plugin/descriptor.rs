//! Plugin and component descriptors for the C-compatible ABI.
//!
//! These types define the minimal ABI surface that plugins must implement.

use std::ffi::{CStr, c_char, c_void};

/// Current ABI version. Plugins must match this version to be loaded.
pub const LUMEN_ABI_VERSION: u32 = 1;

/// Name of the symbol every plugin exports.
pub const PLUGIN_ENTRY_POINT: &str = "lumen_plugin_descriptor";

/// Function pointer type for creating component instances.
///
/// The returned pointer must come from
/// [`component_to_raw`](crate::component::component_to_raw), or be null on failure.
pub type CreateComponentFn = unsafe extern "C" fn() -> *mut c_void;

/// Function pointer type for releasing component instances.
///
/// The pointer must have been created by the matching `CreateComponentFn`.
pub type ReleaseComponentFn = unsafe extern "C" fn(*mut c_void);

/// Describes a single component type provided by a plugin.
#[repr(C)]
pub struct ComponentDescriptor {
    /// Null-terminated registry key (e.g., "demo::comp").
    pub key: *const c_char,
    /// Null-terminated description.
    pub description: *const c_char,
    /// Function to create an instance.
    pub create: CreateComponentFn,
    /// Function to release an instance created by `create`.
    pub release: ReleaseComponentFn,
}

// SAFETY: ComponentDescriptor contains only pointers to static data and
// function pointers.
unsafe impl Send for ComponentDescriptor {}
unsafe impl Sync for ComponentDescriptor {}

impl ComponentDescriptor {
    /// Get the key as a Rust string.
    ///
    /// # Safety
    ///
    /// The `key` pointer must be valid and null-terminated.
    pub unsafe fn key_str(&self) -> &str {
        // SAFETY: Caller guarantees `key` is valid and null-terminated.
        unsafe { CStr::from_ptr(self.key).to_str().unwrap_or("") }
    }

    /// Get the description as a Rust string.
    ///
    /// # Safety
    ///
    /// The `description` pointer must be null or valid and null-terminated.
    pub unsafe fn description_str(&self) -> &str {
        if self.description.is_null() {
            return "";
        }
        // SAFETY: Caller guarantees `description` is valid and null-terminated.
        unsafe { CStr::from_ptr(self.description).to_str().unwrap_or("") }
    }
}

/// Plugin descriptor returned by `lumen_plugin_descriptor()`.
#[repr(C)]
pub struct PluginDescriptor {
    /// ABI version - must match `LUMEN_ABI_VERSION`.
    pub abi_version: u32,
    /// Null-terminated plugin name.
    pub name: *const c_char,
    /// Null-terminated plugin version string.
    pub version: *const c_char,
    /// Null-terminated description.
    pub description: *const c_char,
    /// Number of entries in `components`.
    pub num_components: u32,
    /// Array of component descriptors.
    pub components: *const ComponentDescriptor,
}

// SAFETY: PluginDescriptor contains only pointers to static data.
unsafe impl Send for PluginDescriptor {}
unsafe impl Sync for PluginDescriptor {}

impl PluginDescriptor {
    /// Get plugin name as a Rust string.
    ///
    /// # Safety
    ///
    /// The `name` pointer must be valid and null-terminated.
    pub unsafe fn name_str(&self) -> &str {
        // SAFETY: Caller guarantees `name` is valid and null-terminated.
        unsafe { CStr::from_ptr(self.name).to_str().unwrap_or("unknown") }
    }

    /// Get version as a Rust string.
    ///
    /// # Safety
    ///
    /// The `version` pointer must be valid and null-terminated.
    pub unsafe fn version_str(&self) -> &str {
        // SAFETY: Caller guarantees `version` is valid and null-terminated.
        unsafe { CStr::from_ptr(self.version).to_str().unwrap_or("0.0.0") }
    }

    /// Get description as a Rust string.
    ///
    /// # Safety
    ///
    /// The `description` pointer must be null or valid and null-terminated.
    pub unsafe fn description_str(&self) -> &str {
        if self.description.is_null() {
            return "";
        }
        // SAFETY: Caller guarantees `description` is valid and null-terminated.
        unsafe { CStr::from_ptr(self.description).to_str().unwrap_or("") }
    }

    /// Get the slice of component descriptors.
    ///
    /// # Safety
    ///
    /// The `components` pointer must point to `num_components` items.
    pub unsafe fn components(&self) -> &[ComponentDescriptor] {
        if self.components.is_null() || self.num_components == 0 {
            &[]
        } else {
            // SAFETY: Caller guarantees `components` points to a valid array.
            unsafe { std::slice::from_raw_parts(self.components, self.num_components as usize) }
        }
    }

    /// Validate that this descriptor is safe to use.
    ///
    /// # Safety
    ///
    /// All pointer fields must be valid or null.
    pub unsafe fn validate(&self) -> Result<(), &'static str> {
        if self.abi_version != LUMEN_ABI_VERSION {
            return Err("ABI version mismatch");
        }
        if self.name.is_null() {
            return Err("plugin name is null");
        }
        if self.version.is_null() {
            return Err("plugin version is null");
        }
        // SAFETY: We're in an unsafe fn, caller guarantees validity.
        for comp in unsafe { self.components() } {
            if comp.key.is_null() {
                return Err("component key is null");
            }
            // SAFETY: Checked non-null above.
            if unsafe { comp.key_str() }.is_empty() {
                return Err("component key is empty or not UTF-8");
            }
        }
        Ok(())
    }
}

/// Safe Rust representation of plugin information.
#[derive(Debug, Clone)]
pub struct PluginInfo {
    /// Plugin name.
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// Plugin description.
    pub description: String,
    /// Components provided by this plugin.
    pub components: Vec<ComponentInfo>,
}

/// Safe Rust representation of a provided component.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    /// Registry key.
    pub key: String,
    /// Description.
    pub description: String,
}

impl PluginInfo {
    /// Create PluginInfo from a raw descriptor.
    ///
    /// # Safety
    ///
    /// The descriptor must have passed [`PluginDescriptor::validate`].
    pub unsafe fn from_descriptor(desc: &PluginDescriptor) -> Self {
        // SAFETY: Caller guarantees descriptor is valid.
        unsafe {
            Self {
                name: desc.name_str().to_string(),
                version: desc.version_str().to_string(),
                description: desc.description_str().to_string(),
                components: desc
                    .components()
                    .iter()
                    .map(|c| ComponentInfo {
                        key: c.key_str().to_string(),
                        description: c.description_str().to_string(),
                    })
                    .collect(),
            }
        }
    }

    /// Keys of the provided components.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.components.iter().map(|c| c.key.as_str())
    }
}

/// Define the plugin entry point and the create/release functions of its components.
///
/// Each component needs an identifier (used to name the generated functions),
/// its registry key, a description and a constructor closure. Instances are
/// released inside the plugin that created them.
///
/// # Example
///
/// ```ignore
/// lumen::define_plugin! {
///     name: "demo",
///     version: "0.1.0",
///     description: "Demo components",
///     components: [
///         {
///             ident: demo_comp,
///             key: "demo::comp",
///             description: "A demo component",
///             create: || Box::new(DemoComp::default()),
///         }
///     ]
/// }
/// ```
#[macro_export]
macro_rules! define_plugin {
    (
        name: $name:literal,
        version: $version:literal,
        description: $desc:literal,
        components: [
            $(
                {
                    ident: $ident:ident,
                    key: $key:literal,
                    description: $comp_desc:literal,
                    create: $create:expr $(,)?
                }
            ),* $(,)?
        ]
    ) => {
        $(
            $crate::paste::paste! {
                static [<COMP_KEY_ $ident:upper>]: &[u8] = concat!($key, "\0").as_bytes();
                static [<COMP_DESC_ $ident:upper>]: &[u8] = concat!($comp_desc, "\0").as_bytes();

                extern "C" fn [<lumen_create_ $ident>]() -> *mut std::ffi::c_void {
                    let creator: fn() -> Box<dyn $crate::component::Component> = $create;
                    $crate::component::component_to_raw(creator())
                }

                unsafe extern "C" fn [<lumen_release_ $ident>](ptr: *mut std::ffi::c_void) {
                    if !ptr.is_null() {
                        // SAFETY: ptr was produced by the matching create function above.
                        drop(unsafe { $crate::component::component_from_raw(ptr) });
                    }
                }
            }
        )*

        static PLUGIN_NAME: &[u8] = concat!($name, "\0").as_bytes();
        static PLUGIN_VERSION: &[u8] = concat!($version, "\0").as_bytes();
        static PLUGIN_DESC: &[u8] = concat!($desc, "\0").as_bytes();

        $crate::paste::paste! {
            static COMPONENT_DESCRIPTORS: &[$crate::plugin::ComponentDescriptor] = &[
                $(
                    $crate::plugin::ComponentDescriptor {
                        key: [<COMP_KEY_ $ident:upper>].as_ptr() as *const std::ffi::c_char,
                        description: [<COMP_DESC_ $ident:upper>].as_ptr() as *const std::ffi::c_char,
                        create: [<lumen_create_ $ident>],
                        release: [<lumen_release_ $ident>],
                    },
                )*
            ];
        }

        static PLUGIN_DESCRIPTOR: $crate::plugin::PluginDescriptor = $crate::plugin::PluginDescriptor {
            abi_version: $crate::plugin::LUMEN_ABI_VERSION,
            name: PLUGIN_NAME.as_ptr() as *const std::ffi::c_char,
            version: PLUGIN_VERSION.as_ptr() as *const std::ffi::c_char,
            description: PLUGIN_DESC.as_ptr() as *const std::ffi::c_char,
            num_components: COMPONENT_DESCRIPTORS.len() as u32,
            components: COMPONENT_DESCRIPTORS.as_ptr(),
        };

        /// Plugin entry point.
        #[unsafe(no_mangle)]
        pub extern "C" fn lumen_plugin_descriptor() -> *const $crate::plugin::PluginDescriptor {
            &PLUGIN_DESCRIPTOR
        }
    };
}
