//! # Lumen
//!
//! A plugin-based component runtime with a distributed execution layer.
//!
//! Lumen provides:
//!
//! - **Component registry**: polymorphic objects created by string key, from
//!   statically linked code, dynamically loaded plugins or runtime-defined
//!   extension classes
//! - **Locator tree**: every live component is addressable by a `$`-rooted
//!   path such as `$.scene.camera`
//! - **Serialization**: snapshot and restore an arbitrary component graph
//! - **Distribution**: a master partitions an index range into tasks, workers
//!   process them and the master gathers the partial results
//!
//! ## Quick Start
//!
//! ```rust
//! use lumen::prelude::*;
//! use serde_json::json;
//!
//! let config = RuntimeConfig::default()
//!     .with_logging(TracingConfig::none())
//!     .with_root(
//!         "context::default",
//!         json!({ "children": { "film": { "type": "film::accum", "props": { "size": 16 } } } }),
//!     );
//! let mut runtime = Runtime::new(config)?;
//!
//! let film = runtime.registry_mut().get_mut::<AccumFilm>("$.film")?;
//! film.add(3, 1.0);
//!
//! let snapshot = runtime.serialize()?;
//! runtime.reset()?;
//! runtime.deserialize(&snapshot)?;
//! assert_eq!(runtime.registry().get::<AccumFilm>("$.film")?.data()[3], 1.0);
//! # Ok::<(), lumen::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod component;
pub mod dist;
pub mod error;
pub mod locator;
pub mod observability;
pub mod parallel;
pub mod plugin;
pub mod registry;
pub mod runtime;
pub mod serial;

#[doc(hidden)]
pub use paste;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::component::{
        AccumFilm, Component, ComponentPtr, ConstructContext, DefaultContext, ExtensionClass,
        Props,
    };
    pub use crate::dist::{
        MasterConfig, MasterContext, TcpMaster, TcpWorker, WorkerConfig, WorkerContext,
    };
    pub use crate::error::{Error, Result};
    pub use crate::locator::WeakRef;
    pub use crate::observability::TracingConfig;
    pub use crate::parallel::{ParallelConfig, Scheduler};
    pub use crate::registry::ComponentRegistry;
    pub use crate::runtime::{Runtime, RuntimeConfig};
    pub use crate::serial::{InputArchive, OutputArchive};
}

pub use error::{Error, Result};
