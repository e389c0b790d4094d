pub mod config;
pub mod diagnostics;
pub mod mock;
pub mod objectmodel;
pub mod runtime;
pub mod sync;

pub use config::{ConfigError, LockingConfig, MarkLayout, MonitorOffsets};
pub use objectmodel::{header::LockWord, LockClass, ObjectHeader};
pub use runtime::{threads::MutatorThread, MonitorRuntime, SlowPath};
pub use sync::{FastLocking, LockPath, ObjectLockGuard, UnlockPath};
