//! Wire contract shared by the edge monitor and the backend.
//!
//! Topic names, JSON payloads and the dispatch table machinery live here so
//! both sides of the bus agree on one definition.

pub mod bus;
pub mod errors;
pub mod messages;
pub mod topics;
pub mod validate;

pub use errors::{ProtocolError, Result};
pub use messages::{
    AssociationNotice, BridgeState, HourlyValue, HsvColor, LampColor, LampConfig, OutletStatus,
    SetEnabled, UsageSnapshot,
};
