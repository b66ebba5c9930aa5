//! Error taxonomy for camera bring-up, engine loading and caching.
//!
//! Every terminal failure maps to a category the UI layer can render
//! together with a corrective action. Transient failures (a single
//! detection call, a skipped cache write) never escalate past logging.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("camera permission denied")]
    PermissionDenied,

    #[error("no camera device found")]
    DeviceNotFound,

    #[error("camera device is busy or unreadable")]
    DeviceBusy,

    #[error("requested camera constraints cannot be satisfied")]
    ConstraintsUnsatisfiable,

    #[error("camera requires a secure context (origin: {origin})")]
    InsecureContext { origin: String },

    #[error("required model assets are missing")]
    AssetsMissing,

    #[error("no engine candidate could be loaded")]
    EngineUnavailable,

    /// A single inference call failed. Never terminates the detection loop.
    #[error("detection failed: {0}")]
    DetectionTransient(String),

    /// A runtime-cacheable request failed with no cached copy to fall back on.
    #[error("offline and not cached: {url}")]
    OfflineMiss { url: String },

    #[error("camera error: {0}")]
    Camera(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Corrective action for user-facing failure categories.
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            Error::PermissionDenied => {
                Some("grant camera permission in your browser or system settings")
            }
            Error::DeviceNotFound => Some("connect a camera and re-enumerate devices"),
            Error::DeviceBusy => Some("close other applications using the camera"),
            Error::ConstraintsUnsatisfiable => {
                Some("pick a different camera or lower the requested resolution")
            }
            Error::InsecureContext { .. } => {
                Some("serve the application over HTTPS or from localhost")
            }
            Error::AssetsMissing => {
                Some("make sure the models directory is deployed alongside the application")
            }
            Error::EngineUnavailable => {
                Some("check the model files and compute backend, then retry")
            }
            _ => None,
        }
    }

    /// Human-readable status string: category plus corrective action.
    pub fn user_message(&self) -> String {
        match self.guidance() {
            Some(fix) => format!("{self}: {fix}"),
            None => self.to_string(),
        }
    }

    /// Whether a failed camera open is worth one retry without format
    /// preferences. Permission and enumeration failures are not; the
    /// retry would fail the same way.
    pub fn is_retryable_open(&self) -> bool {
        matches!(self, Error::ConstraintsUnsatisfiable | Error::DeviceBusy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_carries_guidance() {
        let msg = Error::PermissionDenied.user_message();
        assert!(msg.contains("permission denied"));
        assert!(msg.contains("settings"));
    }

    #[test]
    fn test_insecure_context_names_origin() {
        let err = Error::InsecureContext {
            origin: "http://example.com".to_string(),
        };
        assert!(err.user_message().contains("http://example.com"));
        assert!(err.user_message().contains("HTTPS"));
    }
}
