//! Integration tests against mock HTTP servers

pub mod historical_source;
pub mod sink_delivery;
