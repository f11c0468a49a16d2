//! Plugin load/unload against the `demo-plugin` workspace member.
//!
//! The plugin is built on first use with the cargo that runs the tests.

use lumen::component::Props;
use lumen::error::Error;
use lumen::registry::ComponentRegistry;
use lumen::runtime::ScopedPlugins;
use lumen::serial;
use serde_json::json;
use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

/// Path of the built plugin without the platform suffix.
fn demo_plugin_stem() -> &'static Path {
    static STEM: OnceLock<PathBuf> = OnceLock::new();
    STEM.get_or_init(|| {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        let release = !cfg!(debug_assertions);
        let mut build = Command::new(env!("CARGO"));
        build
            .current_dir(&manifest_dir)
            .args(["build", "--quiet", "-p", "demo-plugin"]);
        if release {
            build.arg("--release");
        }
        let status = build.status().expect("failed to run cargo");
        assert!(status.success(), "building demo-plugin failed: {status}");

        let target = std::env::var_os("CARGO_TARGET_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| manifest_dir.join("target"));
        let profile = if release { "release" } else { "debug" };
        let stem = target.join(profile).join(format!("{DLL_PREFIX}demo_plugin"));
        let mut file = stem.clone().into_os_string();
        file.push(DLL_SUFFIX);
        assert!(
            Path::new(&file).exists(),
            "demo plugin missing at {}",
            stem.display()
        );
        stem
    })
}

#[test]
fn test_load_create_unload() {
    let stem = demo_plugin_stem();
    let registry = ComponentRegistry::new();
    unsafe { registry.load_plugin(stem).unwrap() };
    assert_eq!(registry.plugin_names(), vec!["demo".to_string()]);
    assert!(registry.contains("demo::comp"));
    assert!(registry.contains("demo::counter"));

    let comp = registry
        .create_with("demo::comp", "", &json!({ "value": 42 }))
        .unwrap();
    assert_eq!(comp.get().underlying_value("value"), json!(42));

    // The instance keeps the module mapped.
    match registry.unload_plugin("demo") {
        Err(Error::PluginUnload { name, .. }) => assert_eq!(name, "demo"),
        other => panic!("expected unload failure, got {other:?}"),
    }
    assert!(registry.contains("demo::comp"));

    drop(comp);
    registry.unload_plugin("demo").unwrap();
    assert!(registry.plugin_names().is_empty());
    assert!(matches!(
        registry.create("demo::comp", ""),
        Err(Error::ComponentNotFound { .. })
    ));
}

#[test]
fn test_plugin_component_roundtrip() {
    let stem = demo_plugin_stem();
    let registry = ComponentRegistry::new();
    unsafe { registry.load_plugin(stem).unwrap() };

    let bytes = {
        let comp = registry
            .create_with("demo::comp", "", &json!({ "value": -7 }))
            .unwrap();
        serial::to_bytes(Some(&comp)).unwrap()
    };
    let restored = serial::from_bytes(&registry, &bytes).unwrap().unwrap();
    assert_eq!(restored.key(), "demo::comp");
    assert_eq!(restored.get().underlying_value("value"), json!(-7));

    // Without the plugin the key is unknown.
    drop(restored);
    registry.unload_plugins().unwrap();
    assert!(matches!(
        serial::from_bytes(&registry, &bytes),
        Err(Error::DeserializationKeyMismatch { .. })
    ));
}

#[test]
fn test_double_load_is_rejected() {
    let stem = demo_plugin_stem();
    let registry = ComponentRegistry::new();
    unsafe { registry.load_plugin(stem).unwrap() };
    assert!(matches!(
        unsafe { registry.load_plugin(stem) },
        Err(Error::PluginLoad { .. })
    ));
    assert_eq!(registry.plugin_names().len(), 1);
}

#[test]
fn test_scoped_plugins() {
    let stem = demo_plugin_stem();
    let registry = ComponentRegistry::new();
    {
        let scoped = unsafe { ScopedPlugins::load(&registry, [stem]) }.unwrap();
        assert_eq!(scoped.names(), ["demo".to_string()]);
        assert!(registry.create_with("demo::counter", "", &Props::Null).is_ok());
    }
    assert!(registry.plugin_names().is_empty());
    assert!(!registry.contains("demo::counter"));
}

#[test]
fn test_construct_error_from_plugin() {
    let stem = demo_plugin_stem();
    let registry = ComponentRegistry::new();
    unsafe { registry.load_plugin(stem).unwrap() };
    assert!(matches!(
        registry.create_with("demo::comp", "", &json!({ "value": "seven" })),
        Err(Error::Config(_))
    ));
}
