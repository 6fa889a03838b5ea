//! Taskweave core - building blocks shared by the queue and graph layers.
//!
//! # Modules
//!
//! - [`error`]: Failure taxonomy ([`TaskError`]) and schema errors
//! - [`schema`]: Port schemas and semantic format tags
//! - [`compat`]: Static and delivery-time dataflow compatibility checks
//! - [`cancellation`]: Cooperative cancellation tokens and race combinators
//! - [`cache`]: Fingerprinted task output cache
//! - [`events`]: Lifecycle event surface
//! - [`progress`]: Progress callback for run-functions
//! - [`config`]: Configuration structs and loading
//!
//! # Example
//!
//! ```rust
//! use taskweave_core::compat::{can_connect, Compatibility};
//! use taskweave_core::schema::PortSchema;
//!
//! let source = PortSchema::string().try_with_format("model:TextEmbeddingTask").unwrap();
//! let target = PortSchema::string().try_with_format("model").unwrap();
//! assert_eq!(can_connect(&source, &target), Compatibility::Static);
//! ```

pub mod cache;
pub mod cancellation;
pub mod compat;
pub mod config;
pub mod error;
pub mod events;
pub mod progress;
pub mod schema;

pub use cache::{Fingerprint, OutputCache};
pub use cancellation::{race, race_detached, CancellationToken, CancellationTokenSource};
pub use compat::{can_connect, is_runtime_compatible, Compatibility};
pub use config::{CacheConfig, EngineConfig, QueueConfig};
pub use error::{Result, SchemaError, TaskError};
pub use events::{EventKind, EventLog, EventScope, EventSink, LifecycleEvent, NullSink, TracingSink};
pub use progress::ProgressReporter;
pub use schema::{FormatTag, PortDefinition, PortSchema, TaskSchema};
