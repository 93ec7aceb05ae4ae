//! Infrastructure layer - The dispatcher.

/// Dispatch loop, executor and lifecycle state machine.
pub mod dispatch;
