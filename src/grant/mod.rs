//! Stream grant acquisition
//!
//! The supervisor talks to the upstream device API only through
//! [`GrantProvider`]. Grants are opaque: a media URL, an expiry and a
//! continuation token used to extend the same session.

pub mod sdm;
pub mod types;

pub use sdm::SdmGrantProvider;
pub use types::{
    Capabilities, Grant, GrantError, GrantExtension, GrantPayload, RATE_LIMIT_MARKER,
};

use async_trait::async_trait;
use serde_json::Value;

/// Issues, extends and revokes stream grants for one upstream API
#[async_trait]
pub trait GrantProvider: Send + Sync {
    /// Which live-stream protocols the camera supports
    async fn capabilities(&self, camera_id: &str) -> Result<Capabilities, GrantError>;

    /// Request a fresh primary-transport grant
    async fn generate(&self, camera_id: &str) -> Result<GrantPayload, GrantError>;

    /// Extend the session behind `token`
    async fn extend(&self, camera_id: &str, token: &str) -> Result<GrantExtension, GrantError>;

    /// Invalidate the session behind `token`
    async fn revoke(&self, _camera_id: &str, _token: &str) -> Result<(), GrantError> {
        Ok(())
    }

    /// Cameras visible to the signed-in account
    async fn list_devices(&self) -> Result<Vec<Value>, GrantError> {
        Ok(Vec::new())
    }
}
