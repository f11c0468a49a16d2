//! Worker side of a distributed "render".
//!
//! Shades each assigned pixel range on the local thread pool and writes the
//! result into the film synced from the master.
//!
//! Run with: cargo run --example render_worker -- 127.0.0.1:14630 [name]

use lumen::dist::{WorkerConfig, WorkerContext, TcpWorker};
use lumen::prelude::*;

/// Stand-in for a real integrator: a smooth gradient over the pixel index.
fn shade(index: u64) -> f64 {
    let t = (index % 1024) as f64 / 1024.0;
    0.5 + 0.5 * (t * std::f64::consts::TAU).sin()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "127.0.0.1:14630".to_string());
    let mut config = WorkerConfig::default().with_address(address);
    if let Some(name) = args.next() {
        config = config.with_name(name);
    }

    let mut runtime = Runtime::new(RuntimeConfig::default().with_logging(TracingConfig::none()))?;
    let scheduler = runtime.scheduler();

    let mut worker = TcpWorker::new(config);
    worker.register_task_handler(Box::new(move |registry, start, end| {
        let film = registry.get_mut::<AccumFilm>("$.film")?;
        let (lo, hi) = (start as usize, end as usize);
        let pixels = film
            .data_mut()
            .get_mut(lo..hi)
            .ok_or_else(|| Error::InvalidState(format!("task {start}..{end} exceeds the film")))?;
        scheduler.for_each_mut(start, pixels, |index, value, _slot| *value += shade(index));
        Ok(())
    }));
    worker.on_process_completed(Box::new(|_registry| println!("pass completed")));

    worker.run_event_loop(runtime.registry_mut())?;
    println!("master closed the session");
    Ok(())
}
