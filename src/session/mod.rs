//! Agent sessions — records, live registry and steering mailbox.

pub mod model;
pub mod registry;
pub mod steering;
pub mod tracker;

pub use model::{AgentSession, EventKind, SessionEvent, SessionStatus, SteeringMessage};
pub use registry::{InterruptRequest, LiveSession, Registration, SessionRegistry};
pub use steering::{SteeringBatch, SteeringChannel};
pub use tracker::SessionTracker;
