//! Session lifecycle subsystem.
//!
//! Centralizes the per-tenant state machine, recipient normalization, and
//! the orchestration service that owns every client.

/// Session orchestration service and request/receipt types.
pub mod manager;
/// Recipient normalization into the canonical address form.
pub mod recipient;
/// Per-tenant state machine data.
pub mod state;

pub use manager::{Attachment, SendReceipt, SendRequest, SessionManager};
pub use state::{QrArtifact, SessionCore, SessionState, StatusSnapshot};
