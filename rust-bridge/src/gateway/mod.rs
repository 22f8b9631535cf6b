//! Gateway side of the bridge: publish requests, correlate responses.

pub mod broker;
pub mod correlator;

pub use broker::RequestBroker;
pub use correlator::{Correlator, PendingRequest, Resolution};
