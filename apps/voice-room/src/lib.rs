pub mod config;
pub mod media;
pub mod negotiation;
pub mod room;
pub mod signaling;
pub mod telemetry;
