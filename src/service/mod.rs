//! Service layer

pub mod supervisor;
pub mod types;

pub use supervisor::{ServiceStatus, SessionInfo, Supervisor};
pub use types::{DetectionResult, PrimaryFace};
