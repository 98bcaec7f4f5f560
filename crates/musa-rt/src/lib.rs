//! MUSA backend for a heterogeneous task runtime.
//!
//! A [`MusaQueue`] turns memory and kernel operations into work on one
//! in-order device stream. Completion is tracked with pooled
//! [`CompletionEvent`]s, and kernels come either from ahead-of-time device
//! images or from portable IR compiled on demand and cached process-wide.

pub mod adaptivity;
pub mod arg_mapper;
pub mod backend;
pub mod code_object;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod driver;
pub mod error;
pub mod event;
pub mod event_pool;
pub mod hcf;
pub mod instrumentation;
pub mod jit;
pub mod kernel;
pub mod kernel_cache;
pub mod kernel_config;
pub mod node;
pub mod operations;
pub mod queue;

pub use backend::{MusaBackend, MusaBackendBuilder};
pub use config::{AdaptivityLevel, RuntimeConfig};
pub use device::{BackendId, DeviceId, DeviceProperties};
pub use diagnostics::ErrorSink;
pub use error::{ErrorKind, NativeError, RuntimeError, RuntimeResult};
pub use event::CompletionEvent;
pub use node::{NodeStatus, TaskNode};
pub use queue::{MusaQueue, QueueStatus};
