//! Default implementations of the pluggable seams.
//!
//! These let the engine run in-process with zero external configuration.
//! Each can be replaced via the [`ProcessEngine`](crate::engine::ProcessEngine)
//! builder.

pub mod file_job_store;
pub mod in_memory_job_store;
pub mod in_memory_subscription_store;
pub mod json_decoder;
pub mod process_runtime;

pub use file_job_store::FileJobStore;
pub use in_memory_job_store::InMemoryJobStore;
pub use in_memory_subscription_store::InMemorySubscriptionStore;
pub use json_decoder::{DecoderConfig, JsonEventDecoder};
pub use process_runtime::InMemoryProcessRuntime;
