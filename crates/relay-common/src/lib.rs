// Shared data types and small helpers used across crates.

mod config;
mod envelope;
mod error;
pub mod keys;

pub use config::{Environment, PlaneConfig};
pub use envelope::{EventEnvelope, EventType};
pub use error::{PlaneError, PlaneResult};

use serde::{Deserialize, Serialize};

/// Already-authenticated identity consumed at the plane boundary.
///
/// Identity verification lives outside the event plane; by the time a
/// request reaches us the token has been exchanged for this value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub tenant_id: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            tenant_id: tenant_id.into(),
            permissions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principal_wire_names_are_camel_case() {
        let principal = Principal::new("u1", "t1");
        let json = serde_json::to_value(&principal).expect("serialize");
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["tenantId"], "t1");
        assert!(json.get("email").is_none());
    }

    #[test]
    fn principal_accepts_missing_permissions() {
        let principal: Principal =
            serde_json::from_str(r#"{"userId":"u1","tenantId":"t1"}"#).expect("parse");
        assert!(principal.permissions.is_empty());
    }
}
