//! Master side of a distributed "render".
//!
//! Waits for workers, partitions the pixel range into tasks, reports progress
//! and gathers the accumulated film from every worker.
//!
//! Run with:
//!   cargo run --example render_master -- 127.0.0.1:14630 2 65536
//!   cargo run --example render_worker -- 127.0.0.1:14630   (in other terminals)

use lumen::dist::{MasterConfig, MasterContext, TcpMaster};
use lumen::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let bind = args.next().unwrap_or_else(|| "127.0.0.1:14630".to_string());
    let workers: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(1);
    let pixels: u64 = args.next().and_then(|s| s.parse().ok()).unwrap_or(64 * 1024);

    let config = RuntimeConfig::default()
        .with_logging(TracingConfig::none())
        .with_root(
            "context::default",
            json!({ "children": { "film": { "type": "film::accum", "props": { "size": pixels } } } }),
        );
    let mut runtime = Runtime::new(config)?;

    let mut master = TcpMaster::bind(
        MasterConfig::default()
            .with_bind(bind)
            .with_task_size(4096),
    )?;
    println!("listening on {}", master.local_addr());

    let done = Arc::new(AtomicU64::new(0));
    let progress = Arc::clone(&done);
    master.on_task_finished(Box::new(move |processed| {
        let total = progress.fetch_add(processed, Ordering::Relaxed) + processed;
        println!("progress: {:5.1}%", total as f64 * 100.0 / pixels as f64);
    }));

    master.allow_connection(true);
    let connected = master.wait_for_workers(workers, Duration::from_secs(60))?;
    master.print_worker_info();
    println!("{connected} worker(s) connected");

    master.sync(runtime.registry())?;
    master.dispatch(0, pixels)?;
    master.notify_completed()?;
    master.gather_result(runtime.registry_mut(), "$.film")?;

    let film = runtime.registry().get::<AccumFilm>("$.film")?;
    let sum: f64 = film.data().iter().sum();
    println!("gathered film: {} pixels, mean value {:.4}", film.len(), sum / film.len() as f64);

    master.shutdown()?;
    Ok(())
}
