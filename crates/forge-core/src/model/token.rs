use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single-use registration token consumed at worker registration.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationToken {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked: bool,
    /// Worker id that consumed this token, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed_by: Option<uuid::Uuid>,
}

impl RegistrationToken {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.revoked
            && self.consumed_by.is_none()
            && self.expires_at.map(|exp| now < exp).unwrap_or(true)
    }
}
