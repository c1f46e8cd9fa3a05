/// Wire messages.
///
/// A client sends one JSON object per connection:
/// `{"type": ..., "args": {...}}` plus either `login`/`password` or
/// `session_id`. The server replies with one JSON object carrying `type`,
/// `args` and the (possibly rotated) `session_id`.
///
/// Requests are a closed set: the envelope's `type` string selects a
/// variant and its `args` are parsed into that variant's typed arguments.
/// Unknown types and malformed args are rejected before any controller
/// runs.
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{Group, SecretMeta, User};

#[derive(Debug, Deserialize)]
pub struct RequestEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl RequestEnvelope {
    /// Every request authenticates with credentials or a session id.
    pub fn carries_auth(&self) -> bool {
        (self.login.is_some() && self.password.is_some()) || self.session_id.is_some()
    }
}

// ── Request arguments ──

#[derive(Debug, Deserialize)]
pub struct PingArgs {
    #[serde(default)]
    pub payload: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GroupCreateArgs {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct GroupRenameArgs {
    pub group_id: i64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct GroupDeleteArgs {
    pub group_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct GroupSearchArgs {
    /// Shell glob over group names.
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct GroupGetArgs {
    pub group_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct GroupUserArgs {
    pub group_id: i64,
    pub user_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct UserCreateArgs {
    pub login: String,
    pub name: String,
    /// Activation token lifespan in seconds.
    #[serde(default)]
    pub token_lifespan: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UserActivateArgs {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct UserChangePasswordArgs {
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct SecretCreateArgs {
    pub plaintext: String,
    pub group_ids: Vec<i64>,
    #[serde(default)]
    pub meta: SecretMeta,
}

#[derive(Debug, Deserialize)]
pub struct SecretSearchArgs {
    #[serde(default)]
    pub meta: SecretMeta,
}

#[derive(Debug, Deserialize)]
pub struct SecretIdArgs {
    pub secret_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct SecretUpdateMetaArgs {
    pub secret_id: i64,
    pub meta: SecretMeta,
}

#[derive(Debug, Deserialize)]
pub struct SecretUpdateValueArgs {
    pub secret_id: i64,
    pub plaintext: String,
}

/// A parsed request.
#[derive(Debug)]
pub enum Request {
    Ping(PingArgs),
    GroupCreate(GroupCreateArgs),
    GroupRename(GroupRenameArgs),
    GroupDelete(GroupDeleteArgs),
    GroupSearch(GroupSearchArgs),
    GroupGet(GroupGetArgs),
    GroupAddUser(GroupUserArgs),
    GroupRemoveUser(GroupUserArgs),
    UserCreate(UserCreateArgs),
    UserActivate(UserActivateArgs),
    UserChangePassword(UserChangePasswordArgs),
    SecretCreate(SecretCreateArgs),
    SecretSearch(SecretSearchArgs),
    SecretUnlock(SecretIdArgs),
    SecretUpdateMeta(SecretUpdateMetaArgs),
    SecretUpdateValue(SecretUpdateValueArgs),
    SecretDelete(SecretIdArgs),
}

impl Request {
    pub fn parse(envelope: &RequestEnvelope) -> Result<Self> {
        fn args<T: DeserializeOwned>(kind: &str, value: &Value) -> Result<T> {
            serde_json::from_value(value.clone())
                .map_err(|e| Error::MissingArgs(kind.to_string(), e.to_string()))
        }

        let kind = envelope.kind.as_str();
        let value = &envelope.args;
        match kind {
            "ping" => Ok(Request::Ping(args(kind, value)?)),
            "group_create" => Ok(Request::GroupCreate(args(kind, value)?)),
            "group_rename" => Ok(Request::GroupRename(args(kind, value)?)),
            "group_delete" => Ok(Request::GroupDelete(args(kind, value)?)),
            "group_search" => Ok(Request::GroupSearch(args(kind, value)?)),
            "group_get" => Ok(Request::GroupGet(args(kind, value)?)),
            "group_add_user" => Ok(Request::GroupAddUser(args(kind, value)?)),
            "group_remove_user" => Ok(Request::GroupRemoveUser(args(kind, value)?)),
            "user_create" => Ok(Request::UserCreate(args(kind, value)?)),
            "user_activate" => Ok(Request::UserActivate(args(kind, value)?)),
            "user_change_password" => Ok(Request::UserChangePassword(args(kind, value)?)),
            "secret_create" => Ok(Request::SecretCreate(args(kind, value)?)),
            "secret_search" => Ok(Request::SecretSearch(args(kind, value)?)),
            "secret_unlock" => Ok(Request::SecretUnlock(args(kind, value)?)),
            "secret_update_meta" => Ok(Request::SecretUpdateMeta(args(kind, value)?)),
            "secret_update_value" => Ok(Request::SecretUpdateValue(args(kind, value)?)),
            "secret_delete" => Ok(Request::SecretDelete(args(kind, value)?)),
            other => Err(Error::UnknownRequest(other.to_string())),
        }
    }
}

// ── Response payload views ──

#[derive(Debug, Serialize)]
pub struct UserView {
    pub id: i64,
    pub login: String,
    pub name: String,
    pub status: String,
}

impl UserView {
    pub fn of(user: &User) -> Self {
        Self {
            id: user.id,
            login: user.login.clone(),
            name: user.name.clone(),
            status: user.status.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GroupView {
    pub id: i64,
    pub name: String,
}

impl GroupView {
    pub fn of(group: &Group) -> Self {
        Self {
            id: group.id,
            name: group.name.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SecretListItem {
    pub secret_id: i64,
    pub metadata: SecretMeta,
}

/// A typed response; serialized as `{"type": ..., "args": {...}}`.
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "args", rename_all = "snake_case")]
pub enum Response {
    Pong {
        payload: Option<String>,
    },
    GroupCreated {
        group_id: i64,
        name: String,
    },
    GroupUpdated {
        group_id: i64,
    },
    GroupDeleted {
        group_id: i64,
    },
    GroupList {
        groups: Vec<GroupView>,
    },
    GroupInfo {
        group: GroupView,
        members: Vec<UserView>,
    },
    UserCreated {
        user: UserView,
        token: String,
    },
    UserUpdated {
        user: UserView,
    },
    UserPasswordChanged {},
    SecretCreated {
        secret_id: i64,
    },
    SecretList {
        secrets: Vec<SecretListItem>,
    },
    SecretValue {
        secret_id: i64,
        plaintext: String,
        metadata: SecretMeta,
        value_author: UserView,
        meta_author: UserView,
        groups: Vec<GroupView>,
    },
    SecretUpdated {
        secret_id: i64,
    },
    SecretDeleted {
        secret_id: i64,
    },
    Error {
        code: String,
        message: String,
    },
}

impl Response {
    pub fn error(err: &Error) -> Self {
        Response::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// The outer response object: the typed body plus the session id.
#[derive(Debug, Serialize)]
pub struct ResponseEnvelope {
    #[serde(flatten)]
    pub body: Response,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ResponseEnvelope {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("response serialization cannot fail")
    }
}
