//! Application layer - Port definitions.

/// The venue adapter capability surface and its settings.
pub mod ports;
