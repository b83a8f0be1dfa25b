//! User and box-membership lookups against the identity service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use vbox_protocol::{BoxId, UserId};

use crate::error::{VboxError, upstream};

/// A user with the boxes they own and the boxes shared with them.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    #[serde(default, rename = "virtualbox")]
    pub owned: Vec<OwnedBox>,
    #[serde(default, rename = "usersToVirtualboxes")]
    pub shared: Vec<SharedBox>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OwnedBox {
    pub id: BoxId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SharedBox {
    #[serde(rename = "virtualboxId")]
    pub box_id: BoxId,
}

impl UserRecord {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn owning(mut self, box_id: impl Into<BoxId>) -> Self {
        self.owned.push(OwnedBox { id: box_id.into() });
        self
    }

    pub fn sharing(mut self, box_id: impl Into<BoxId>) -> Self {
        self.shared.push(SharedBox {
            box_id: box_id.into(),
        });
        self
    }

    pub fn owns(&self, box_id: &str) -> bool {
        self.owned.iter().any(|b| b.id == box_id)
    }

    pub fn shares(&self, box_id: &str) -> bool {
        self.shared.iter().any(|b| b.box_id == box_id)
    }
}

#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Look up a user. `None` if the service does not know them.
    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, VboxError>;
    /// Count one AI generation against the user's allowance.
    async fn record_generation(&self, user_id: &str) -> Result<(), VboxError>;
}

/// Client for the database worker.
pub struct HttpIdentity {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIdentity {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl IdentityService for HttpIdentity {
    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, VboxError> {
        let value: serde_json::Value = self
            .client
            .get(format!("{}/api/user", self.base_url))
            .query(&[("id", user_id)])
            .send()
            .await
            .map_err(|e| upstream("identity lookup", e))?
            .error_for_status()
            .map_err(|e| upstream("identity lookup", e))?
            .json()
            .await
            .map_err(|e| upstream("identity lookup", e))?;
        parse_user(value)
    }

    async fn record_generation(&self, user_id: &str) -> Result<(), VboxError> {
        self.client
            .post(format!("{}/api/virtualbox/generate", self.base_url))
            .json(&json!({ "userId": user_id }))
            .send()
            .await
            .map_err(|e| upstream("generation report", e))?
            .error_for_status()
            .map_err(|e| upstream("generation report", e))?;
        Ok(())
    }
}

/// The worker answers unknown users with `null` or `{}`.
fn parse_user(value: serde_json::Value) -> Result<Option<UserRecord>, VboxError> {
    match &value {
        serde_json::Value::Null => return Ok(None),
        serde_json::Value::Object(map) if map.is_empty() => return Ok(None),
        _ => {}
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| VboxError::UpstreamUnavailable(format!("identity lookup: malformed user: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_worker_user_shape() {
        let user = parse_user(json!({
            "id": "u1",
            "name": "Ada",
            "virtualbox": [{"id": "b1", "name": "demo", "type": "react"}],
            "usersToVirtualboxes": [{"userId": "u1", "virtualboxId": "b2"}]
        }))
        .unwrap()
        .unwrap();
        assert!(user.owns("b1"));
        assert!(!user.owns("b2"));
        assert!(user.shares("b2"));
    }

    #[test]
    fn empty_answers_mean_unknown_user() {
        assert!(parse_user(serde_json::Value::Null).unwrap().is_none());
        assert!(parse_user(json!({})).unwrap().is_none());
    }

    #[test]
    fn malformed_user_is_upstream_error() {
        let err = parse_user(json!({"virtualbox": 3})).unwrap_err();
        assert!(matches!(err, VboxError::UpstreamUnavailable(_)));
    }
}
