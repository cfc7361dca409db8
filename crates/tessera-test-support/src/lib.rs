//! Shared test doubles and fixtures for the Tessera event storage engine.

mod clock;
mod fixtures;
mod in_memory;
mod repository;

pub use clock::{FixedClock, SteppingClock};
pub use fixtures::{order_event, order_snapshot, tenant, unnumbered_order_event};
pub use in_memory::InMemoryEventRepository;
pub use repository::{
    DelayedEventRepository, Failure, FailingEventRepository, FlakyEventRepository,
    SpyEventRepository,
};
