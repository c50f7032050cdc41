//! Boundary to the identity/authorization collaborator.

use async_trait::async_trait;

/// Decides whether a user may enter a room and which display name to show.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Returns the verified display name, or the reason for refusal.
    async fn authorize(
        &self,
        user_id: Option<&str>,
        room_id: &str,
        requested_name: &str,
    ) -> Result<String, String>;
}

/// Lets everyone in under the name they asked for.
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(
        &self,
        _user_id: Option<&str>,
        _room_id: &str,
        requested_name: &str,
    ) -> Result<String, String> {
        let name = requested_name.trim();
        if name.is_empty() {
            Ok("guest".to_string())
        } else {
            Ok(name.to_string())
        }
    }
}
