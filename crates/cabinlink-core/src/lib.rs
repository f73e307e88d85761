//! Core agent logic: sensor classification, portal sync passes, the
//! remote command tunnel, and relay session management.
//!
//! The [`Agent`] owns the whole lifecycle; the individual modules are
//! exported for consumers that need a single piece (the classifier is
//! pure and usable standalone).

pub mod agent;
pub mod backup;
pub mod cameras;
pub mod classify;
pub mod error;
pub mod relay;
pub mod session;
pub mod tunnel;

pub use agent::Agent;
pub use backup::BackupCollector;
pub use cameras::{CameraDescriptor, CameraStatus, discover};
pub use classify::{ElectricalMetrics, classify};
pub use error::AgentError;
pub use relay::RelayManager;
pub use session::{PortalSession, SessionStore};
pub use tunnel::TunnelDispatcher;
