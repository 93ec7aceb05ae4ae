//! Domain layer - Pure message and queue logic with no I/O.

/// The closed message union and its classification.
pub mod message;

/// Pending queue, queue items and the priority selector.
pub mod queue;

/// Registry of in-flight subscribe requests.
pub mod subscription;
