//! Coordinates synchronized recording across a fleet of sensor nodes.
//!
//! The [`Fleet`] handle owns four cooperating actors: the node registry, the
//! command dispatcher, the session coordinator and one clock prober per
//! connected node. Nodes connect over a length-prefixed binary protocol
//! ([`fleet_wire`]); operators drive sessions through the handle or the HTTP
//! surface in [`http`].

pub mod agent;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod fleet;
pub mod hooks;
pub mod http;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use config::CoordinatorConfig;
pub use fleet::{Collaborators, Fleet};
