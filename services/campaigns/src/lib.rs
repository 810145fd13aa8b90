//! Broadcast orchestration: audience enumeration, the A/B test phase and
//! winner selection, and the phased enqueue into the send queue. The
//! service binary wraps this in a scheduler loop; the integration tests
//! drive the orchestrator directly.

pub mod audience;
pub mod orchestrator;
