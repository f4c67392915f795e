//! Lifecycle orchestration for a fleet of locally running service components: discovery by
//! port, health polling, dependency-ordered start/stop and an escalating termination ladder.

pub mod console_log;
pub mod context;
pub mod error;
pub mod health;
pub mod hub;
pub mod launcher;
pub mod locator;
pub mod monitor;
pub mod process_control;
pub mod registry;
pub mod report;
pub mod resources;
pub mod safety;
pub mod scheduler;
pub mod score;
pub mod settings;
pub mod support;
pub mod terminator;

#[cfg(test)]
pub(crate) mod test_support;
