//! Component tree walkthrough.
//!
//! Builds a small tree from configuration, adds a runtime-defined extension
//! class, resolves components by locator, dumps the tree and round-trips the
//! whole state through a snapshot.
//!
//! Run with: cargo run --example component_tree

use lumen::component::ExtensionComponent;
use lumen::prelude::*;
use serde_json::json;

fn dump(ptr: &ComponentPtr, depth: usize) {
    println!("{:indent$}{} [{}]", "", ptr.loc(), ptr.key(), indent = depth * 2);
    ptr.get().foreach_underlying(&mut |child| dump(child, depth + 1));
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("=== Component Tree Example ===\n");

    let config = RuntimeConfig::default()
        .with_logging(TracingConfig::none())
        .with_root(
            "context::default",
            json!({
                "children": {
                    "film": { "type": "film::accum", "props": { "size": 8 } },
                    "camera": { "type": "ext::camera", "props": { "state": { "fov": 45.0 } } }
                }
            }),
        );
    let mut runtime = Runtime::new(config)?;

    // Classes defined at runtime take part in construction after a reset.
    ExtensionClass::new("ext::camera")
        .with_state(json!({ "fov": 30.0, "position": [0.0, 0.0, 5.0] }))
        .with_construct(|camera, ctx| {
            camera.set("loc", ctx.loc);
            Ok(())
        })
        .register(runtime.registry());
    runtime.reset()?;

    println!("1. Tree:");
    if let Some(root) = runtime.root() {
        dump(root, 1);
    }

    println!("\n2. Resolution:");
    let camera = runtime.registry().get::<ExtensionComponent>("$.camera")?;
    println!("   $.camera fov = {}", camera.state()["fov"]);
    let film = runtime.registry_mut().get_mut::<AccumFilm>("$.film")?;
    for i in 0..film.len() {
        film.add(i, i as f64 * 0.5);
    }
    println!("   $.film sum = {}", runtime.registry().resolve("$.film")?.get().underlying_value("sum"));
    match runtime.registry().resolve("$.film.missing") {
        Ok(_) => unreachable!(),
        Err(e) => println!("   $.film.missing -> {e}"),
    }

    println!("\n3. Snapshot:");
    let snapshot = runtime.serialize()?;
    println!("   {} bytes", snapshot.len());
    runtime.reset()?;
    println!(
        "   after reset, sum = {}",
        runtime.registry().resolve("$.film")?.get().underlying_value("sum")
    );
    runtime.deserialize(&snapshot)?;
    println!(
        "   after restore, sum = {}",
        runtime.registry().resolve("$.film")?.get().underlying_value("sum")
    );

    Ok(())
}
