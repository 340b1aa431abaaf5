//! Typed control frames sent by the server.
//!
//! An [`Envelope`] is `{ "type": <tag>, "data": <any JSON> }`. The tag
//! decides how `data` is interpreted; see the `*_TAG` constants.

use serde::{Deserialize, Serialize};

/// Tag for the connected-user list. `data` is an array of usernames.
pub const USERLIST_TAG: &str = "userlist";

/// Tag for a rejected admin credential or admin command. `data` is a string.
pub const AUTH_FAILED_TAG: &str = "auth_failed";

/// Tag for an informational server notice. `data` is a string.
pub const NOTICE_TAG: &str = "notice";

/// A tagged control message distinct from ordinary chat content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Routing tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Tag-specific payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    /// Builds a `userlist` envelope.
    #[must_use]
    pub fn user_list(users: &[String]) -> Self {
        Self {
            kind: USERLIST_TAG.to_string(),
            data: serde_json::Value::from(users.to_vec()),
        }
    }

    /// Builds an `auth_failed` envelope.
    #[must_use]
    pub fn auth_failed(reason: impl Into<String>) -> Self {
        Self {
            kind: AUTH_FAILED_TAG.to_string(),
            data: serde_json::Value::String(reason.into()),
        }
    }

    /// Builds a `notice` envelope.
    #[must_use]
    pub fn notice(text: impl Into<String>) -> Self {
        Self {
            kind: NOTICE_TAG.to_string(),
            data: serde_json::Value::String(text.into()),
        }
    }
}
