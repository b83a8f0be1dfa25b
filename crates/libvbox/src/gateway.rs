//! Admission of websocket handshakes.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;
use vbox_protocol::{BoxId, ConnectionId, Handshake, Role, UserId};

use crate::error::VboxError;
use crate::identity::IdentityService;

const MAX_PARAM_LEN: usize = 128;

/// An admitted connection, before it joins its box session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub box_id: BoxId,
    pub role: Role,
}

pub struct SessionGateway {
    identity: Arc<dyn IdentityService>,
}

impl SessionGateway {
    pub fn new(identity: Arc<dyn IdentityService>) -> Self {
        Self { identity }
    }

    /// Validate the handshake and resolve the caller's role in the box.
    pub async fn admit(&self, handshake: &Handshake) -> Result<Client, VboxError> {
        let user_id = validate_param("userId", handshake.user_id.as_deref())?;
        let box_id = validate_param("boxId", handshake.box_id.as_deref())?;

        let user = self
            .identity
            .get_user(user_id)
            .await?
            .ok_or_else(|| VboxError::AccessDenied(format!("unknown user {user_id}")))?;

        let role = if user.owns(box_id) {
            Role::Owner
        } else if user.shares(box_id) {
            Role::Shared
        } else {
            debug!(user_id, box_id, "user has no access to box");
            return Err(VboxError::AccessDenied(format!(
                "user {user_id} has no access to box {box_id}"
            )));
        };

        let client = Client {
            connection_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            box_id: box_id.to_string(),
            role,
        };
        info!(
            connection_id = %client.connection_id,
            user_id,
            box_id,
            ?role,
            "client admitted"
        );
        Ok(client)
    }
}

fn validate_param<'a>(name: &str, value: Option<&'a str>) -> Result<&'a str, VboxError> {
    let value = value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| VboxError::InvalidHandshake(format!("missing {name}")))?;
    if value.len() > MAX_PARAM_LEN {
        return Err(VboxError::InvalidHandshake(format!("{name} too long")));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(VboxError::InvalidHandshake(format!("{name} has invalid characters")));
    }
    Ok(value)
}
