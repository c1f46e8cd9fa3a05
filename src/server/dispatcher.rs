/// Per-request pipeline.
///
/// Parse → authenticate → route → commit/rollback → respond. The whole
/// request, authentication included, runs in a single store transaction.
/// Whatever happens, the user object is locked before the response leaves,
/// and semantic errors keep the client's session id alive.
use crate::error::{Error, Result};
use crate::model::User;
use crate::server::message::{Request, RequestEnvelope, Response, ResponseEnvelope};
use crate::server::{admin, auth, secret, ServerState};

/// Handle one raw request and produce the serialized response.
pub async fn handle(state: &ServerState, raw: &[u8]) -> String {
    let envelope: RequestEnvelope = match serde_json::from_slice(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            return error_envelope(None, &Error::InvalidMessage(e.to_string()));
        }
    };
    if !envelope.carries_auth() {
        return error_envelope(
            envelope.session_id.clone(),
            &Error::InvalidMessage("missing credentials or session id".to_string()),
        );
    }

    let request = match Request::parse(&envelope) {
        Ok(request) => request,
        Err(e) => return error_envelope(envelope.session_id.clone(), &e),
    };

    match process(state, &envelope, &request).await {
        Ok((response, session_id)) => ResponseEnvelope {
            body: response,
            session_id: Some(session_id),
        }
        .to_json(),
        Err((e, session_id)) => error_envelope(session_id, &e),
    }
}

/// The transactional part of the pipeline. Returns the response body and
/// the session id to attach; on failure, the session id the error response
/// should carry.
async fn process(
    state: &ServerState,
    envelope: &RequestEnvelope,
    request: &Request,
) -> std::result::Result<(Response, String), (Error, Option<String>)> {
    let mut tx = state
        .db
        .begin()
        .await
        .map_err(|e| (e, envelope.session_id.clone()))?;

    let mut outcome = match auth::authenticate(state, &mut tx, envelope, request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let _ = tx.rollback().await;
            return Err((e, envelope.session_id.clone()));
        }
    };

    let result = route(state, &mut tx, &mut outcome.user, request).await;
    outcome.user.lock();

    match result {
        Ok((response, fresh_secret_key)) => {
            if let Err(e) = tx.commit().await {
                return Err((e.into(), Some(outcome.session_id)));
            }
            // Rotate only after the password change is durable.
            let session_id = match fresh_secret_key {
                Some(secret_key) => {
                    state
                        .sessions
                        .rotate(&outcome.session_id, outcome.user.id, secret_key)
                }
                None => outcome.session_id,
            };
            Ok((response, session_id))
        }
        Err(e) => {
            let _ = tx.rollback().await;
            Err((e, Some(outcome.session_id)))
        }
    }
}

/// Exactly one controller declares each request type.
async fn route(
    state: &ServerState,
    conn: &mut sqlx::SqliteConnection,
    user: &mut User,
    request: &Request,
) -> Result<(Response, Option<crate::crypto::SecretKey>)> {
    match request {
        Request::Ping(args) => Ok((
            Response::Pong {
                payload: args.payload.clone(),
            },
            None,
        )),
        Request::SecretCreate(_)
        | Request::SecretSearch(_)
        | Request::SecretUnlock(_)
        | Request::SecretUpdateMeta(_)
        | Request::SecretUpdateValue(_)
        | Request::SecretDelete(_) => {
            let response = secret::handle(state, conn, user, request).await?;
            Ok((response, None))
        }
        Request::GroupCreate(_)
        | Request::GroupRename(_)
        | Request::GroupDelete(_)
        | Request::GroupSearch(_)
        | Request::GroupGet(_)
        | Request::GroupAddUser(_)
        | Request::GroupRemoveUser(_)
        | Request::UserCreate(_)
        | Request::UserActivate(_)
        | Request::UserChangePassword(_) => {
            let outcome = admin::handle(state, conn, user, request).await?;
            Ok((outcome.response, outcome.fresh_secret_key))
        }
    }
}

fn error_envelope(session_id: Option<String>, err: &Error) -> String {
    // Internal failures are logged with their cause; the client only gets
    // the generic code.
    let body = if err.is_internal() {
        tracing::error!(error = %err, code = err.code(), "request failed");
        Response::Error {
            code: err.code().to_string(),
            message: "internal error".to_string(),
        }
    } else {
        tracing::debug!(error = %err, code = err.code(), "request rejected");
        Response::error(err)
    };
    ResponseEnvelope { body, session_id }.to_json()
}
