pub mod coalescer;
pub mod config;
pub mod record;
pub mod service;
pub mod stats;
pub mod stream_worker;
pub mod supervisor;
pub mod validate;
pub mod worker_pool;

pub use config::IngestConfig;
pub use record::{IngestResult, LogLevel, NormalizedRecord, RawRecord};
pub use service::IngestError;
pub use supervisor::{Backends, Pipeline};
