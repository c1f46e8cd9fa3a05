/// Secret controller.
///
/// All operations run with an unlocked user inside the dispatcher's
/// transaction. Mutations fan the re-encryption out over every sharing
/// group *before* the first write, so a failure mid-way leaves the stored
/// ciphertext untouched.
use sqlx::SqliteConnection;

use crate::crypto::{self, Armored, PrivateKey, PublicKey};
use crate::error::{Error, Result};
use crate::model::{Secret, User};
use crate::server::message::{
    GroupView, Request, Response, SecretCreateArgs, SecretListItem, SecretSearchArgs,
    SecretUpdateMetaArgs, SecretUpdateValueArgs, UserView,
};
use crate::server::ServerState;

pub async fn handle(
    state: &ServerState,
    conn: &mut SqliteConnection,
    user: &mut User,
    request: &Request,
) -> Result<Response> {
    match request {
        Request::SecretCreate(args) => create(state, conn, user, args).await,
        Request::SecretSearch(args) => search(state, conn, user, args).await,
        Request::SecretUnlock(args) => unlock(state, conn, user, args.secret_id).await,
        Request::SecretUpdateMeta(args) => update_meta(state, conn, user, args).await,
        Request::SecretUpdateValue(args) => update_value(state, conn, user, args).await,
        Request::SecretDelete(args) => delete(state, conn, user, args.secret_id).await,
        other => Err(Error::UnknownRequest(format!("{other:?}"))),
    }
}

async fn create(
    state: &ServerState,
    conn: &mut SqliteConnection,
    user: &mut User,
    args: &SecretCreateArgs,
) -> Result<Response> {
    if args.group_ids.is_empty() {
        return Err(Error::MissingArgs(
            "secret_create".to_string(),
            "group_ids must not be empty".to_string(),
        ));
    }
    let privk = unlocked_privk(user)?.clone();
    let meta_bytes = args.meta.serialize_bytes()?;

    // Seal for every group up front; nothing is written until all
    // encryptions succeeded.
    let mut sealed = Vec::with_capacity(args.group_ids.len());
    for group_id in &args.group_ids {
        let group = state
            .repo
            .group_by_id(conn, *group_id)
            .await?
            .ok_or(Error::UnknownGroup(*group_id))?;
        let ciphertext = crypto::seal_pair(&group.pubk, &privk, args.plaintext.as_bytes())?;
        let encrypted_metadata = crypto::seal_pair(&group.pubk, &privk, &meta_bytes)?;
        sealed.push((group.id, ciphertext, encrypted_metadata));
    }

    let secret_id = state.repo.create_secret(conn, user.id, user.id).await?;
    for (group_id, ciphertext, encrypted_metadata) in &sealed {
        state
            .repo
            .insert_secret_value(conn, secret_id, *group_id, ciphertext, encrypted_metadata)
            .await?;
    }
    tracing::debug!(secret_id, groups = sealed.len(), "secret created");
    Ok(Response::SecretCreated { secret_id })
}

async fn search(
    state: &ServerState,
    conn: &mut SqliteConnection,
    user: &mut User,
    args: &SecretSearchArgs,
) -> Result<Response> {
    if user.keychain.is_empty() {
        return Ok(Response::SecretList {
            secrets: Vec::new(),
        });
    }

    let mut secrets = Vec::new();
    for mut secret in state.repo.secrets_for_user(conn, user.id).await? {
        let group_privk = keychain_privk(user, secret.group_id)?.clone();
        let meta_author_pubk = author_pubk(state, conn, secret.meta_author_id).await?;
        secret.unlock_metadata(&meta_author_pubk, &group_privk)?;
        let metadata = secret.metadata.clone().expect("just unlocked");
        if metadata.matches(&args.meta) {
            secrets.push(SecretListItem {
                secret_id: secret.id,
                metadata,
            });
        }
    }
    Ok(Response::SecretList { secrets })
}

async fn unlock(
    state: &ServerState,
    conn: &mut SqliteConnection,
    user: &mut User,
    secret_id: i64,
) -> Result<Response> {
    let mut secret = reachable_secret(state, conn, user, secret_id).await?;
    let group_privk = keychain_privk(user, secret.group_id)?.clone();

    let value_author = state
        .repo
        .user_by_id(conn, secret.value_author_id)
        .await?
        .ok_or_else(|| Error::UnknownUser(secret.value_author_id.to_string()))?;
    let meta_author = state
        .repo
        .user_by_id(conn, secret.meta_author_id)
        .await?
        .ok_or_else(|| Error::UnknownUser(secret.meta_author_id.to_string()))?;

    secret.unlock_value(required_pubk(&value_author)?, &group_privk)?;
    secret.unlock_metadata(required_pubk(&meta_author)?, &group_privk)?;

    let plaintext = String::from_utf8(secret.plaintext.as_ref().expect("just unlocked").as_bytes().to_vec())
        .map_err(|_| Error::Crypto("secret plaintext is not valid UTF-8".to_string()))?;
    let metadata = secret.metadata.clone().expect("just unlocked");

    let groups = state
        .repo
        .groups_sharing_secret(conn, secret_id)
        .await?
        .iter()
        .map(GroupView::of)
        .collect();

    Ok(Response::SecretValue {
        secret_id,
        plaintext,
        metadata,
        value_author: UserView::of(&value_author),
        meta_author: UserView::of(&meta_author),
        groups,
    })
}

async fn update_meta(
    state: &ServerState,
    conn: &mut SqliteConnection,
    user: &mut User,
    args: &SecretUpdateMetaArgs,
) -> Result<Response> {
    let mut secret = reachable_secret(state, conn, user, args.secret_id).await?;
    let group_privk = keychain_privk(user, secret.group_id)?.clone();
    let meta_author_pubk = author_pubk(state, conn, secret.meta_author_id).await?;
    secret.unlock_metadata(&meta_author_pubk, &group_privk)?;

    let merged = secret
        .metadata
        .as_ref()
        .expect("just unlocked")
        .merge(&args.meta);

    let sealed = seal_for_sharing_groups(state, conn, user, args.secret_id, &merged.serialize_bytes()?).await?;
    for (group_id, encrypted_metadata) in &sealed {
        state
            .repo
            .update_secret_metadata(conn, args.secret_id, *group_id, encrypted_metadata)
            .await?;
    }
    state.repo.set_meta_author(conn, args.secret_id, user.id).await?;

    Ok(Response::SecretUpdated {
        secret_id: args.secret_id,
    })
}

async fn update_value(
    state: &ServerState,
    conn: &mut SqliteConnection,
    user: &mut User,
    args: &SecretUpdateValueArgs,
) -> Result<Response> {
    // Reachability check, same failure mode as unlock.
    reachable_secret(state, conn, user, args.secret_id).await?;

    let sealed = seal_for_sharing_groups(
        state,
        conn,
        user,
        args.secret_id,
        args.plaintext.as_bytes(),
    )
    .await?;
    for (group_id, ciphertext) in &sealed {
        state
            .repo
            .update_secret_value(conn, args.secret_id, *group_id, ciphertext)
            .await?;
    }
    state.repo.set_value_author(conn, args.secret_id, user.id).await?;

    Ok(Response::SecretUpdated {
        secret_id: args.secret_id,
    })
}

async fn delete(
    state: &ServerState,
    conn: &mut SqliteConnection,
    user: &mut User,
    secret_id: i64,
) -> Result<Response> {
    reachable_secret(state, conn, user, secret_id).await?;
    state.repo.delete_secret(conn, secret_id).await?;
    tracing::debug!(secret_id, "secret deleted");
    Ok(Response::SecretDeleted { secret_id })
}

// ── Helpers ──

/// The secret as reachable by this user, or `SECRET/NOTFOUND`. The answer
/// is the same whether the secret does not exist or is not shared with
/// them.
async fn reachable_secret(
    state: &ServerState,
    conn: &mut SqliteConnection,
    user: &User,
    secret_id: i64,
) -> Result<Secret> {
    state
        .repo
        .secret_for_user(conn, user.id, secret_id)
        .await?
        .ok_or(Error::SecretNotFound(secret_id))
}

/// Re-seal a payload for every group currently sharing the secret.
async fn seal_for_sharing_groups(
    state: &ServerState,
    conn: &mut SqliteConnection,
    user: &User,
    secret_id: i64,
    payload: &[u8],
) -> Result<Vec<(i64, Armored)>> {
    let privk = unlocked_privk(user)?.clone();
    let groups = state.repo.groups_sharing_secret(conn, secret_id).await?;
    let mut sealed = Vec::with_capacity(groups.len());
    for group in &groups {
        sealed.push((group.id, crypto::seal_pair(&group.pubk, &privk, payload)?));
    }
    Ok(sealed)
}

async fn author_pubk(
    state: &ServerState,
    conn: &mut SqliteConnection,
    author_id: i64,
) -> Result<PublicKey> {
    let author = state
        .repo
        .user_by_id(conn, author_id)
        .await?
        .ok_or_else(|| Error::UnknownUser(author_id.to_string()))?;
    Ok(required_pubk(&author)?.clone())
}

fn required_pubk(user: &User) -> Result<&PublicKey> {
    user.pubk
        .as_ref()
        .ok_or_else(|| Error::Crypto(format!("user {} has no public key", user.login)))
}

fn unlocked_privk(user: &User) -> Result<&PrivateKey> {
    user.privk()
        .ok_or_else(|| Error::Crypto(format!("user {} is locked", user.login)))
}

fn keychain_privk(user: &User, group_id: i64) -> Result<&PrivateKey> {
    user.keychain
        .get(&group_id)
        .and_then(|item| item.privk())
        .ok_or(Error::UnknownGroupPrivk(group_id))
}
