/// Authentication controller.
///
/// Resolves a request to an unlocked user and a session id. Three paths:
/// bootstrap (the very first user becomes admin), activation (a `new` user
/// presents a valid token plus their initial passphrase), and the ordinary
/// path (session lookup, or password login creating a session).
///
/// Passphrase derivation is CPU-bound by design, so it runs on the
/// blocking thread pool.
use chrono::Utc;
use sqlx::SqliteConnection;

use crate::crypto::SecretKey;
use crate::error::{Error, Result};
use crate::model::{User, UserStatus};
use crate::server::message::{Request, RequestEnvelope};
use crate::server::ServerState;

pub struct AuthOutcome {
    pub user: User,
    pub session_id: String,
}

pub async fn authenticate(
    state: &ServerState,
    conn: &mut SqliteConnection,
    envelope: &RequestEnvelope,
    request: &Request,
) -> Result<AuthOutcome> {
    if state.repo.user_count(conn).await? == 0 {
        return bootstrap_first_user(state, conn, envelope).await;
    }
    if let Request::UserActivate(args) = request {
        return activate_user(state, conn, envelope, &args.token).await;
    }

    if let Some(session_id) = &envelope.session_id {
        let (user_id, secret_key) = state
            .sessions
            .fetch(session_id)
            .ok_or(Error::BadSession)?;
        let mut user = state
            .repo
            .user_by_id(conn, user_id)
            .await?
            .ok_or(Error::BadSession)?;
        ensure_allowed(&user, request)?;
        user.unlock(&secret_key)?;
        Ok(AuthOutcome {
            user,
            session_id: session_id.clone(),
        })
    } else {
        let (login, password) = credentials(envelope)?;
        let user = state
            .repo
            .user_by_login(conn, &login)
            .await?
            .ok_or_else(|| Error::UnknownUser(login.clone()))?;
        ensure_allowed(&user, request)?;

        let (mut user, mut secret_key) = derive_and_unlock(user, password.clone()).await?;

        // Stale derivation parameters get upgraded transparently on a
        // successful password login.
        if secret_key.params.obsolete() {
            tracing::info!(login = %user.login, "re-deriving key with current KDF parameters");
            let fresh = tokio::task::spawn_blocking(move || SecretKey::fresh(&password))
                .await
                .map_err(|e| Error::Crypto(format!("key derivation task failed: {e}")))??;
            user.encrypt(&fresh)?;
            state.repo.save_user_crypto(conn, &user).await?;
            secret_key = fresh;
        }

        let session_id = state.sessions.create(user.id, secret_key);
        Ok(AuthOutcome { user, session_id })
    }
}

/// An empty store turns the first login into account creation: the user is
/// persisted as admin with a fresh keypair sealed under their passphrase.
async fn bootstrap_first_user(
    state: &ServerState,
    conn: &mut SqliteConnection,
    envelope: &RequestEnvelope,
) -> Result<AuthOutcome> {
    let (login, password) = credentials(envelope)?;
    tracing::info!(login = %login, "empty store, creating first user as admin");

    let user = state
        .repo
        .create_user(conn, &login, &login, UserStatus::Admin)
        .await?;
    let (user, secret_key) = initialize_user(user, password).await?;
    state.repo.save_user_crypto(conn, &user).await?;

    let session_id = state.sessions.create(user.id, secret_key);
    Ok(AuthOutcome { user, session_id })
}

/// Activation needs explicit credentials plus a live token; the supplied
/// password becomes the user's passphrase.
async fn activate_user(
    state: &ServerState,
    conn: &mut SqliteConnection,
    envelope: &RequestEnvelope,
    token: &str,
) -> Result<AuthOutcome> {
    let (login, password) = credentials(envelope)?;
    let user = state
        .repo
        .user_by_login(conn, &login)
        .await?
        .ok_or_else(|| Error::UnknownUser(login.clone()))?;

    if user.status != UserStatus::New {
        return Err(Error::Forbidden(user.login));
    }
    let activation = state
        .repo
        .find_activation(conn, user.id, token)
        .await?
        .ok_or_else(|| Error::Forbidden(user.login.clone()))?;
    if !activation.valid_at(Utc::now().timestamp()) {
        return Err(Error::Forbidden(user.login));
    }

    let (mut user, secret_key) = initialize_user(user, password).await?;
    state.repo.save_user_crypto(conn, &user).await?;
    state
        .repo
        .set_user_status(conn, user.id, UserStatus::Active)
        .await?;
    user.status = UserStatus::Active;
    state.repo.purge_activations(conn, user.id).await?;
    tracing::info!(login = %user.login, "user activated");

    let session_id = state.sessions.create(user.id, secret_key);
    Ok(AuthOutcome { user, session_id })
}

/// Status gate: `active`/`admin` may do anything, `new` may only activate,
/// `archived` may do nothing.
fn ensure_allowed(user: &User, request: &Request) -> Result<()> {
    let allowed = matches!(user.status, UserStatus::Active | UserStatus::Admin)
        || (user.status == UserStatus::New && matches!(request, Request::UserActivate(_)));
    if allowed {
        Ok(())
    } else {
        Err(Error::Forbidden(user.login.clone()))
    }
}

fn credentials(envelope: &RequestEnvelope) -> Result<(String, String)> {
    match (&envelope.login, &envelope.password) {
        (Some(login), Some(password)) => Ok((login.clone(), password.clone())),
        _ => Err(Error::MissingAuth),
    }
}

/// Derive the secret key and unlock, off the async runtime.
async fn derive_and_unlock(mut user: User, password: String) -> Result<(User, SecretKey)> {
    tokio::task::spawn_blocking(move || -> Result<(User, SecretKey)> {
        let secret_key = user.secret_key(&password)?;
        user.unlock(&secret_key)?;
        Ok((user, secret_key))
    })
    .await
    .map_err(|e| Error::Crypto(format!("key derivation task failed: {e}")))?
}

/// First-time key setup (bootstrap, activation): generates the keypair and
/// leaves the user unlocked.
async fn initialize_user(mut user: User, password: String) -> Result<(User, SecretKey)> {
    tokio::task::spawn_blocking(move || -> Result<(User, SecretKey)> {
        let secret_key = user.reset_password(&password)?;
        Ok((user, secret_key))
    })
    .await
    .map_err(|e| Error::Crypto(format!("key derivation task failed: {e}")))?
}
