/// Group and user administration controller.
///
/// Everything here is admin-only except `user_change_password` (any
/// authenticated user changes their own passphrase) and the
/// `user_activate` acknowledgment, whose real work happens on the
/// authentication path.
use sqlx::SqliteConnection;

use crate::crypto::{KeyPair, SecretKey};
use crate::error::{Error, Result};
use crate::model::keychain::KeychainItem;
use crate::model::secret::glob_match;
use crate::model::{ActivationToken, User, UserStatus};
use crate::model::activation::DEFAULT_LIFESPAN_SECS;
use crate::server::message::{
    GroupCreateArgs, GroupUserArgs, GroupView, Request, Response, UserCreateArgs, UserView,
};
use crate::server::ServerState;

/// A handler result; a password change additionally hands the freshly
/// derived secret key back so the dispatcher can rotate the session.
pub struct Outcome {
    pub response: Response,
    pub fresh_secret_key: Option<SecretKey>,
}

impl Outcome {
    fn of(response: Response) -> Self {
        Self {
            response,
            fresh_secret_key: None,
        }
    }
}

pub async fn handle(
    state: &ServerState,
    conn: &mut SqliteConnection,
    user: &mut User,
    request: &Request,
) -> Result<Outcome> {
    match request {
        Request::GroupCreate(args) => group_create(state, conn, user, args).await,
        Request::GroupRename(args) => {
            ensure_admin(user)?;
            state
                .repo
                .group_by_id(conn, args.group_id)
                .await?
                .ok_or(Error::UnknownGroup(args.group_id))?;
            state.repo.rename_group(conn, args.group_id, &args.name).await?;
            Ok(Outcome::of(Response::GroupUpdated {
                group_id: args.group_id,
            }))
        }
        Request::GroupDelete(args) => group_delete(state, conn, user, args.group_id).await,
        Request::GroupSearch(args) => {
            ensure_admin(user)?;
            let groups = state
                .repo
                .all_groups(conn)
                .await?
                .iter()
                .filter(|g| glob_match(&args.name, &g.name))
                .map(GroupView::of)
                .collect();
            Ok(Outcome::of(Response::GroupList { groups }))
        }
        Request::GroupGet(args) => {
            ensure_admin(user)?;
            let group = state
                .repo
                .group_by_id(conn, args.group_id)
                .await?
                .ok_or(Error::UnknownGroup(args.group_id))?;
            let members = state
                .repo
                .group_members(conn, args.group_id)
                .await?
                .iter()
                .map(UserView::of)
                .collect();
            Ok(Outcome::of(Response::GroupInfo {
                group: GroupView::of(&group),
                members,
            }))
        }
        Request::GroupAddUser(args) => group_add_user(state, conn, user, args).await,
        Request::GroupRemoveUser(args) => {
            ensure_admin(user)?;
            state
                .repo
                .group_by_id(conn, args.group_id)
                .await?
                .ok_or(Error::UnknownGroup(args.group_id))?;
            state
                .repo
                .remove_keychain_item(conn, args.user_id, args.group_id)
                .await?;
            tracing::info!(
                group_id = args.group_id,
                user_id = args.user_id,
                "user removed from group"
            );
            Ok(Outcome::of(Response::GroupUpdated {
                group_id: args.group_id,
            }))
        }
        Request::UserCreate(args) => user_create(state, conn, user, args).await,
        Request::UserActivate(_) => {
            // Validation and key setup already ran on the authentication
            // path; acknowledge with the updated user.
            Ok(Outcome::of(Response::UserUpdated {
                user: UserView::of(user),
            }))
        }
        Request::UserChangePassword(args) => {
            change_password(state, conn, user, &args.new_password).await
        }
        other => Err(Error::UnknownRequest(format!("{other:?}"))),
    }
}

/// Create a group with a fresh keypair and make the calling admin its
/// first member. The group private key is never persisted; it only
/// survives sealed inside members' keychains.
async fn group_create(
    state: &ServerState,
    conn: &mut SqliteConnection,
    user: &mut User,
    args: &GroupCreateArgs,
) -> Result<Outcome> {
    ensure_admin(user)?;
    let user_pubk = user
        .pubk
        .clone()
        .ok_or_else(|| Error::Crypto(format!("user {} has no public key", user.login)))?;

    let pair = KeyPair::generate();
    let group = state.repo.create_group(conn, &args.name, &pair.pubk).await?;
    let item = KeychainItem::seal(group.id, &pair.pubk, &pair.privk, &user_pubk)?;
    state
        .repo
        .add_keychain_item(conn, user.id, group.id, &item.encrypted_privk)
        .await?;
    tracing::info!(group_id = group.id, name = %group.name, "group created");

    Ok(Outcome::of(Response::GroupCreated {
        group_id: group.id,
        name: group.name,
    }))
}

/// Deleting a group is refused while anyone but the caller is a member;
/// the cascade then removes the caller's keychain row and every sealed
/// secret copy for the group.
async fn group_delete(
    state: &ServerState,
    conn: &mut SqliteConnection,
    user: &mut User,
    group_id: i64,
) -> Result<Outcome> {
    ensure_admin(user)?;
    state
        .repo
        .group_by_id(conn, group_id)
        .await?
        .ok_or(Error::UnknownGroup(group_id))?;
    let members = state.repo.group_members(conn, group_id).await?;
    if members.iter().any(|m| m.id != user.id) {
        return Err(Error::GroupHasMembers(group_id));
    }
    state.repo.delete_group(conn, group_id).await?;
    tracing::info!(group_id, "group deleted");
    Ok(Outcome::of(Response::GroupDeleted { group_id }))
}

/// Grant membership: the caller must hold the group key in their own
/// unlocked keychain, and seals it for the target's keypair. The target
/// sees the new entry from their next authentication on.
async fn group_add_user(
    state: &ServerState,
    conn: &mut SqliteConnection,
    user: &mut User,
    args: &GroupUserArgs,
) -> Result<Outcome> {
    ensure_admin(user)?;
    let group = state
        .repo
        .group_by_id(conn, args.group_id)
        .await?
        .ok_or(Error::UnknownGroup(args.group_id))?;
    let group_privk = user
        .keychain
        .get(&args.group_id)
        .and_then(|item| item.privk())
        .ok_or(Error::UnknownGroupPrivk(args.group_id))?
        .clone();

    let target = state
        .repo
        .user_by_id(conn, args.user_id)
        .await?
        .ok_or_else(|| Error::UnknownUser(args.user_id.to_string()))?;
    let target_pubk = target.pubk.clone().ok_or_else(|| {
        Error::Crypto(format!("user {} has no public key yet", target.login))
    })?;

    let item = KeychainItem::seal(group.id, &group.pubk, &group_privk, &target_pubk)?;
    state
        .repo
        .add_keychain_item(conn, target.id, group.id, &item.encrypted_privk)
        .await?;
    tracing::info!(
        group_id = group.id,
        user_id = target.id,
        "user added to group"
    );

    Ok(Outcome::of(Response::GroupUpdated {
        group_id: args.group_id,
    }))
}

/// Create a `new` user with no crypto data and hand back a time-bounded
/// activation token.
async fn user_create(
    state: &ServerState,
    conn: &mut SqliteConnection,
    user: &mut User,
    args: &UserCreateArgs,
) -> Result<Outcome> {
    ensure_admin(user)?;
    let created = state
        .repo
        .create_user(conn, &args.login, &args.name, UserStatus::New)
        .await?;
    let token = ActivationToken::generate(
        created.id,
        args.token_lifespan.unwrap_or(DEFAULT_LIFESPAN_SECS),
    );
    state.repo.create_activation(conn, &token).await?;
    tracing::info!(login = %created.login, "user created, activation pending");

    Ok(Outcome::of(Response::UserCreated {
        user: UserView::of(&created),
        token: token.token,
    }))
}

/// Re-seal the caller's keychain under a key derived from the new
/// passphrase. The user is already unlocked by authentication, so no old
/// passphrase is needed; the dispatcher rotates the session with the key
/// we hand back.
async fn change_password(
    state: &ServerState,
    conn: &mut SqliteConnection,
    user: &mut User,
    new_password: &str,
) -> Result<Outcome> {
    let password = new_password.to_string();
    let fresh_key = tokio::task::spawn_blocking(move || SecretKey::fresh(&password))
        .await
        .map_err(|e| Error::Crypto(format!("key derivation task failed: {e}")))??;

    user.encrypt(&fresh_key)?;
    state.repo.save_user_crypto(conn, user).await?;
    tracing::info!(login = %user.login, "password changed");

    Ok(Outcome {
        response: Response::UserPasswordChanged {},
        fresh_secret_key: Some(fresh_key),
    })
}

fn ensure_admin(user: &User) -> Result<()> {
    if user.status == UserStatus::Admin {
        Ok(())
    } else {
        Err(Error::Forbidden(user.login.clone()))
    }
}
