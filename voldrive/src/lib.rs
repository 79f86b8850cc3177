//! voldrive: pluggable volume orchestration.
//!
//! Storage backends are linked in at build time. Each contributes a
//! [`StorageDriver`](driver::StorageDriver) that owns the provider API, a
//! [`StorageExecutor`](executor::StorageExecutor) that does host-local work,
//! and its configuration keys. The [`Router`](router::Router) sends each
//! volume request to the driver bound to its service, and drivers reach the
//! host through the [`ExecutorDispatcher`](executor::ExecutorDispatcher).
//!
//! Start with [`VoldriveRuntime::new`].

pub mod config;
pub mod context;
pub mod db;
pub mod driver;
pub mod drivers;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod paths;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod util;

pub use config::{Config, ConfigSchema, EnvSnapshot};
pub use context::{CancelHandle, Context, TransactionId};
pub use driver::{DriverRegistry, StorageDriver};
pub use executor::{ExecutorDispatcher, ExecutorHandle, ExecutorRegistry, Isolation, StorageExecutor};
pub use metrics::RouterMetrics;
pub use paths::PathConfig;
pub use registry::OverridePolicy;
pub use router::{Router, VolumeOp, VolumeReply, VolumeRequest};
pub use runtime::{VoldriveOptions, VoldriveRuntime};

pub use voldrive_shared::{VoldriveError, VoldriveResult};
