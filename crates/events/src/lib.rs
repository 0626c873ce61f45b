//! `herdbook-events` — event mechanics shared across the workspace.
//!
//! Commands express intent; events are accepted facts. The bus distributes
//! published envelopes to projections and workers after the store has made
//! them durable.

pub mod bus;
pub mod command;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use command::Command;
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::execute;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
