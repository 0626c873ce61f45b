//! Infrastructure layer: event store, command dispatch, projections and the
//! daily-report application service.

pub mod command_dispatcher;
pub mod event_store;
pub mod projections;
pub mod read_model;
pub mod reports;

#[cfg(test)]
mod integration_tests;
