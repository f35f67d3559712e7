//! Per-owner registry of bus connections and proxies (component C6).

#[macro_use]
extern crate tracing;

mod agent;
mod error;
mod events;

pub use agent::BusAgent;
pub use error::AgentError;
pub use events::{AgentEvent, HandleId};
