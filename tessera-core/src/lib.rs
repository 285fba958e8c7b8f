//! Tessera Core
//!
//! This crate provides the incremental computation engine of the Tessera
//! reactive data framework. Applications declare entities, relations and
//! dictionaries, attach computations to them, and mutate data only through
//! interactions. The engine keeps every computed value current by folding
//! each mutation event into bound state instead of re-reading everything.
//!
//! It implements:
//!
//! - Aggregates (count, sum, average, every, any, weighted sum)
//! - State machines driven by interaction events
//! - Transforms deriving records from other records
//! - Custom computations, including ones that suspend on external work
//! - Dependency ordered propagation with rollback on failure
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `schema`: Entities, relations, dictionaries and filtered entities
//! - `store`: The record store contract and its in-memory implementation
//! - `computation`: Computation definitions and their handles
//! - `state`: Bound state cells and pending async tasks
//! - `graph`: Computational dependency graph implementation
//! - `controller`: Setup, propagation and interaction dispatch
//!
//! # Example
//!
//! ```rust
//! use serde_json::json;
//! use tessera_core::computation::Count;
//! use tessera_core::schema::{Dictionary, Entity, Property, Schema};
//! use tessera_core::{fields, Controller};
//!
//! let schema = Schema::builder()
//!     .entity(Entity::new("Request").property(Property::new("title")))
//!     .dictionary(Dictionary::computed("requestCount", Count::record("Request")))
//!     .build()
//!     .unwrap();
//!
//! let mut controller = Controller::in_memory(schema);
//! controller.setup().unwrap();
//!
//! controller.create("Request", fields(json!({"title": "a"}))).unwrap();
//! assert_eq!(controller.dictionary("requestCount").unwrap(), json!(1));
//! ```

pub mod computation;
pub mod config;
pub mod controller;
pub mod error;
pub mod graph;
pub mod schema;
pub mod state;
pub mod store;

pub use config::EngineConfig;
pub use controller::{fields, Controller, Interaction, InteractionCall, InteractionCallResponse};
pub use error::{EngineError, Result};
pub use schema::Schema;
pub use store::{MemoryStore, RecordStore};

/// Install a `tracing` subscriber filtered by `TESSERA_LOG` (default `info`).
///
/// Call once, early. A second call panics because a global subscriber is
/// already set.
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("TESSERA_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Install a `tracing` subscriber with a fixed filter such as `"tessera_core=debug"`.
pub fn init_logging_with_level(level: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::registry()
        .with(EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
