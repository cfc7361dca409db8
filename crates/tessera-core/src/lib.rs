//! Tessera Core — multi-tenant event storage engine.
//!
//! This crate defines the record model, the repository seam, the storage
//! engine façade and the tenant enforcement layer. It contains no database
//! code; see `tessera-event-store` for the PostgreSQL adapter.

pub mod clock;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod identifiers;
pub mod repository;
pub mod snapshot;
pub mod store;
pub mod stream;
pub mod tenant;
pub mod token;

pub use config::{EngineConfig, RetryPolicy};
pub use engine::EventStorageEngine;
pub use error::{AppendError, StorageError};
pub use event::{EventBatch, EventRecord, PendingEvent, TrackedEventRecord};
pub use identifiers::{AggregateId, AggregateType, GlobalSequence, SequenceNumber, TenantId};
pub use snapshot::{PendingSnapshot, SnapshotRecord};
pub use store::RawEventStore;
pub use stream::EventStream;
pub use tenant::{TenantContext, TenantContextProvider, TenantEnforcedEventStore};
pub use token::TrackingToken;
