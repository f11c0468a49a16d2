//! Distributed execution: a master partitions an index range into tasks and
//! ships them to workers, which run a caller-supplied handler per task and
//! send back partial results.
//!
//! Both roles are selected by strategy key, mirroring the component
//! registry. The only built-in strategy is [`TCP_STRATEGY`].
//!
//! ```rust,no_run
//! use lumen::dist::{self, TCP_STRATEGY};
//! use serde_json::json;
//!
//! # fn main() -> lumen::Result<()> {
//! let mut master = dist::create_master(TCP_STRATEGY, &json!({ "bind": "0.0.0.0:14630" }))?;
//! master.on_task_finished(Box::new(|processed| println!("+{processed}")));
//! master.wait_for_workers(2, std::time::Duration::from_secs(30))?;
//! master.dispatch(0, 1920 * 1080)?;
//! master.notify_completed()?;
//! # Ok(())
//! # }
//! ```

pub(crate) mod config;
mod master;
mod partition;
pub mod protocol;
mod worker;

pub use config::{BackoffStrategy, MasterConfig, ReconnectPolicy, WorkerConfig};
pub use master::TcpMaster;
pub use partition::{Task, chunks, partition};
pub use worker::TcpWorker;

use crate::component::Props;
use crate::error::{Error, Result};
use crate::registry::ComponentRegistry;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Key of the TCP transport strategy.
pub const TCP_STRATEGY: &str = "dist::tcp";

/// Observer of task progress; receives the number of indices processed.
pub type TaskCallback = Box<dyn FnMut(u64) + Send>;

/// Master-side fallback that processes `[start, end)` locally.
pub type LocalHandler = Box<dyn FnMut(u64, u64) -> Result<()> + Send>;

/// Worker-side task handler, run once per assigned `[start, end)`.
pub type TaskHandler = Box<dyn FnMut(&mut ComponentRegistry, u64, u64) -> Result<()> + Send>;

/// Worker-side observer of the end of a pass.
pub type CompletedCallback = Box<dyn FnMut(&mut ComponentRegistry) + Send>;

/// Master lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MasterState {
    /// Listening, new workers are refused.
    Initialized,
    /// Listening and accepting workers.
    AcceptingConnections,
    /// Tasks of the current pass are outstanding.
    Busy,
    /// Workers were told the pass is over.
    Completed,
    /// Shut down.
    Shutdown,
}

/// Worker lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// Not connected yet.
    Initialized,
    /// Handshake done, waiting for work.
    Connected,
    /// Running the task handler.
    ProcessingTask,
    /// Between tasks.
    Idle,
    /// Connection closed.
    Disconnected,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initialized => "initialized",
            Self::Connected => "connected",
            Self::ProcessingTask => "processing",
            Self::Idle => "idle",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Master-side view of a connected worker.
#[derive(Clone, Debug)]
pub struct WorkerInfo {
    /// Identifier assigned at handshake.
    pub id: u64,
    /// Name the worker announced.
    pub name: String,
    /// Remote address.
    pub peer: SocketAddr,
    /// Cumulative number of processed indices.
    pub processed: u64,
    /// Task currently assigned.
    pub current: Option<Task>,
}

/// Master role.
pub trait MasterContext: Send {
    /// Address the master listens on.
    fn local_addr(&self) -> SocketAddr;

    /// Current lifecycle state.
    fn state(&self) -> MasterState;

    /// Accept or refuse new workers. Existing connections are unaffected.
    fn allow_connection(&mut self, allow: bool);

    /// Push the registry's root state to every worker (and to later joiners).
    fn sync(&mut self, registry: &ComponentRegistry) -> Result<()>;

    /// Observe progress. Callbacks run on one dedicated thread, one at a time.
    fn on_task_finished(&mut self, callback: TaskCallback);

    /// Process ranges locally while no worker is connected.
    fn set_local_handler(&mut self, handler: LocalHandler);

    /// Partition `[start, end)` into tasks and queue them.
    fn dispatch(&mut self, start: u64, end: u64) -> Result<()>;

    /// Wait until every task is done, then tell workers the pass is over.
    fn notify_completed(&mut self) -> Result<()>;

    /// Merge each worker's component at `loc` into the local one at `loc`.
    fn gather_result(&mut self, registry: &mut ComponentRegistry, loc: &str) -> Result<()>;

    /// Block until at least `count` workers are connected.
    fn wait_for_workers(&self, count: usize, timeout: Duration) -> Result<usize>;

    /// Snapshot of the connected workers.
    fn workers(&self) -> Vec<WorkerInfo>;

    /// Log one line per connected worker.
    fn print_worker_info(&self);

    /// Tell workers to shut down and stop all threads.
    fn shutdown(&mut self) -> Result<()>;
}

/// Worker role.
pub trait WorkerContext: Send {
    /// Current lifecycle state.
    fn state(&self) -> WorkerState;

    /// Set the handler run for each task.
    fn register_task_handler(&mut self, handler: TaskHandler);

    /// Observe the end of each pass.
    fn on_process_completed(&mut self, callback: CompletedCallback);

    /// Connect and serve the master until it shuts the worker down or the
    /// connection is lost.
    fn run_event_loop(&mut self, registry: &mut ComponentRegistry) -> Result<()>;
}

/// Create a master by strategy key.
pub fn create_master(strategy: &str, props: &Props) -> Result<Box<dyn MasterContext>> {
    match strategy {
        TCP_STRATEGY => Ok(Box::new(TcpMaster::bind(MasterConfig::from_props(props)?)?)),
        _ => Err(Error::ComponentNotFound {
            key: strategy.to_string(),
        }),
    }
}

/// Create a worker by strategy key.
pub fn create_worker(strategy: &str, props: &Props) -> Result<Box<dyn WorkerContext>> {
    match strategy {
        TCP_STRATEGY => Ok(Box::new(TcpWorker::new(WorkerConfig::from_props(props)?))),
        _ => Err(Error::ComponentNotFound {
            key: strategy.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_strategy() {
        assert!(matches!(
            create_master("dist::carrier_pigeon", &Props::Null),
            Err(Error::ComponentNotFound { .. })
        ));
        assert!(matches!(
            create_worker("dist::carrier_pigeon", &Props::Null),
            Err(Error::ComponentNotFound { .. })
        ));
    }

    #[test]
    fn test_worker_factory() {
        let worker = create_worker(TCP_STRATEGY, &serde_json::json!({ "name": "w" })).unwrap();
        assert_eq!(worker.state(), WorkerState::Initialized);
    }
}
