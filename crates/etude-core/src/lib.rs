// src/lib.rs
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod mmap;
pub mod parser;
pub mod pool;
pub mod server;
pub mod slab;
pub mod sync;
pub mod syscalls;

// Re-exports for users
pub use config::Config;
pub use conn::{Connection, Next};
pub use error::{EtudeError, EtudeResult};
pub use http::{HttpCode, Method, Status, Version};
pub use logging::{init_logging, init_logging_with_level};
pub use metrics::{Metrics, Snapshot};
pub use pool::{RejectReason, Rejected, Task, ThreadPool};
pub use server::{Listening, Server};
