/// Typed queries over the relational store.
///
/// Every method takes the caller's connection so it participates in the
/// dispatcher's per-request transaction. Users (with their keychains) and
/// groups are additionally cached process-wide behind read-write locks;
/// any write touching an entity invalidates its cache entry, and readers
/// get locked clones.
use std::collections::HashMap;
use std::sync::RwLock;

use sqlx::SqliteConnection;

use crate::crypto::Armored;
use crate::error::Result;
use crate::model::keychain::KeychainItem;
use crate::model::{ActivationToken, Group, Secret, User, UserStatus};
use crate::state::models::{ActivationRow, GroupRow, KeychainRow, SecretRow, UserRow};

#[derive(Default)]
pub struct Repository {
    users: RwLock<HashMap<i64, User>>,
    logins: RwLock<HashMap<String, i64>>,
    groups: RwLock<HashMap<i64, Group>>,
}

impl Repository {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Users ──

    pub async fn user_count(&self, conn: &mut SqliteConnection) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(&mut *conn)
            .await?;
        Ok(count)
    }

    pub async fn user_by_login(
        &self,
        conn: &mut SqliteConnection,
        login: &str,
    ) -> Result<Option<User>> {
        let cached_id = self.logins.read().expect("cache lock").get(login).copied();
        if let Some(id) = cached_id {
            if let Some(user) = self.users.read().expect("cache lock").get(&id) {
                return Ok(Some(user.clone()));
            }
        }

        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT u.id, u.login, u.name, u.status,
                   c.kdf_params, c.pubk, c.encrypted_privk
            FROM users u
            LEFT JOIN users_crypto_data c ON c.user_id = u.id
            WHERE u.login = ?
            "#,
        )
        .bind(login)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => Ok(Some(self.finish_user(conn, row).await?)),
            None => Ok(None),
        }
    }

    pub async fn user_by_id(
        &self,
        conn: &mut SqliteConnection,
        user_id: i64,
    ) -> Result<Option<User>> {
        if let Some(user) = self.users.read().expect("cache lock").get(&user_id) {
            return Ok(Some(user.clone()));
        }

        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT u.id, u.login, u.name, u.status,
                   c.kdf_params, c.pubk, c.encrypted_privk
            FROM users u
            LEFT JOIN users_crypto_data c ON c.user_id = u.id
            WHERE u.id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => Ok(Some(self.finish_user(conn, row).await?)),
            None => Ok(None),
        }
    }

    /// Attach the keychain and fill the cache.
    async fn finish_user(&self, conn: &mut SqliteConnection, row: UserRow) -> Result<User> {
        let mut user = row.into_user()?;

        let keychain_rows = sqlx::query_as::<_, KeychainRow>(
            r#"
            SELECT gm.group_id, g.pubk AS group_pubk, gm.encrypted_privk
            FROM group_members gm
            JOIN groups g ON g.id = gm.group_id
            WHERE gm.user_id = ?
            ORDER BY gm.group_id
            "#,
        )
        .bind(user.id)
        .fetch_all(&mut *conn)
        .await?;

        for kc in keychain_rows {
            let item = KeychainItem::from_stored(
                kc.group_id,
                crate::crypto::PublicKey::from_armored(&Armored::from_string(kc.group_pubk))?,
                Armored::from_string(kc.encrypted_privk),
            );
            user.keychain.insert(kc.group_id, item);
        }

        self.logins
            .write()
            .expect("cache lock")
            .insert(user.login.clone(), user.id);
        self.users
            .write()
            .expect("cache lock")
            .insert(user.id, user.clone());
        Ok(user)
    }

    pub async fn create_user(
        &self,
        conn: &mut SqliteConnection,
        login: &str,
        name: &str,
        status: UserStatus,
    ) -> Result<User> {
        let result = sqlx::query("INSERT INTO users (login, name, status) VALUES (?, ?, ?)")
            .bind(login)
            .bind(name)
            .bind(status.as_str())
            .execute(&mut *conn)
            .await?;
        Ok(User::new(
            result.last_insert_rowid(),
            login.to_string(),
            name.to_string(),
            status,
        ))
    }

    /// Persist a user's crypto columns (upsert).
    pub async fn save_user_crypto(&self, conn: &mut SqliteConnection, user: &User) -> Result<()> {
        let kdf_params = user
            .kdf_params
            .as_ref()
            .map(|p| p.to_armored())
            .ok_or_else(|| crate::error::Error::Crypto("user has no KDF parameters".into()))?;
        let pubk = user
            .pubk
            .as_ref()
            .map(|p| p.to_armored())
            .ok_or_else(|| crate::error::Error::Crypto("user has no public key".into()))?;
        let encrypted_privk = user
            .encrypted_privk
            .as_ref()
            .ok_or_else(|| crate::error::Error::Crypto("user has no sealed private key".into()))?;

        sqlx::query(
            r#"
            INSERT INTO users_crypto_data (user_id, kdf_params, pubk, encrypted_privk)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (user_id) DO UPDATE SET
                kdf_params = excluded.kdf_params,
                pubk = excluded.pubk,
                encrypted_privk = excluded.encrypted_privk
            "#,
        )
        .bind(user.id)
        .bind(kdf_params.as_str())
        .bind(pubk.as_str())
        .bind(encrypted_privk.as_str())
        .execute(&mut *conn)
        .await?;

        self.invalidate_user(user.id);
        Ok(())
    }

    pub async fn set_user_status(
        &self,
        conn: &mut SqliteConnection,
        user_id: i64,
        status: UserStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE users SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(user_id)
            .execute(&mut *conn)
            .await?;
        self.invalidate_user(user_id);
        Ok(())
    }

    // ── Groups ──

    pub async fn create_group(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
        pubk: &crate::crypto::PublicKey,
    ) -> Result<Group> {
        let result = sqlx::query("INSERT INTO groups (name, pubk) VALUES (?, ?)")
            .bind(name)
            .bind(pubk.to_armored().as_str())
            .execute(&mut *conn)
            .await?;
        Ok(Group {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            pubk: pubk.clone(),
        })
    }

    pub async fn group_by_id(
        &self,
        conn: &mut SqliteConnection,
        group_id: i64,
    ) -> Result<Option<Group>> {
        if let Some(group) = self.groups.read().expect("cache lock").get(&group_id) {
            return Ok(Some(group.clone()));
        }

        let row = sqlx::query_as::<_, GroupRow>("SELECT id, name, pubk FROM groups WHERE id = ?")
            .bind(group_id)
            .fetch_optional(&mut *conn)
            .await?;

        match row {
            Some(row) => {
                let group = row.into_group()?;
                self.groups
                    .write()
                    .expect("cache lock")
                    .insert(group.id, group.clone());
                Ok(Some(group))
            }
            None => Ok(None),
        }
    }

    pub async fn group_by_name(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
    ) -> Result<Option<Group>> {
        let row =
            sqlx::query_as::<_, GroupRow>("SELECT id, name, pubk FROM groups WHERE name = ?")
                .bind(name)
                .fetch_optional(&mut *conn)
                .await?;
        row.map(GroupRow::into_group).transpose()
    }

    pub async fn all_groups(&self, conn: &mut SqliteConnection) -> Result<Vec<Group>> {
        let rows =
            sqlx::query_as::<_, GroupRow>("SELECT id, name, pubk FROM groups ORDER BY name")
                .fetch_all(&mut *conn)
                .await?;
        rows.into_iter().map(GroupRow::into_group).collect()
    }

    pub async fn rename_group(
        &self,
        conn: &mut SqliteConnection,
        group_id: i64,
        name: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE groups SET name = ? WHERE id = ?")
            .bind(name)
            .bind(group_id)
            .execute(&mut *conn)
            .await?;
        self.invalidate_group(group_id);
        Ok(())
    }

    /// Delete a group; cascades remove its keychain rows and sealed
    /// secret copies.
    pub async fn delete_group(&self, conn: &mut SqliteConnection, group_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM groups WHERE id = ?")
            .bind(group_id)
            .execute(&mut *conn)
            .await?;
        self.invalidate_group(group_id);
        self.invalidate_all_users();
        Ok(())
    }

    pub async fn group_members(
        &self,
        conn: &mut SqliteConnection,
        group_id: i64,
    ) -> Result<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT u.id, u.login, u.name, u.status,
                   NULL AS kdf_params, NULL AS pubk, NULL AS encrypted_privk
            FROM users u
            JOIN group_members gm ON gm.user_id = u.id
            WHERE gm.group_id = ?
            ORDER BY u.login
            "#,
        )
        .bind(group_id)
        .fetch_all(&mut *conn)
        .await?;
        rows.into_iter().map(UserRow::into_user).collect()
    }

    // ── Keychain items ──

    pub async fn add_keychain_item(
        &self,
        conn: &mut SqliteConnection,
        user_id: i64,
        group_id: i64,
        encrypted_privk: &Armored,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_members (user_id, group_id, encrypted_privk) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(group_id)
        .bind(encrypted_privk.as_str())
        .execute(&mut *conn)
        .await?;
        self.invalidate_user(user_id);
        Ok(())
    }

    /// Remove one keychain row; returns whether it existed.
    pub async fn remove_keychain_item(
        &self,
        conn: &mut SqliteConnection,
        user_id: i64,
        group_id: i64,
    ) -> Result<bool> {
        let result = sqlx::query("DELETE FROM group_members WHERE user_id = ? AND group_id = ?")
            .bind(user_id)
            .bind(group_id)
            .execute(&mut *conn)
            .await?;
        self.invalidate_user(user_id);
        Ok(result.rows_affected() > 0)
    }

    // ── Secrets ──

    pub async fn create_secret(
        &self,
        conn: &mut SqliteConnection,
        value_author_id: i64,
        meta_author_id: i64,
    ) -> Result<i64> {
        let result =
            sqlx::query("INSERT INTO secrets (value_author_id, meta_author_id) VALUES (?, ?)")
                .bind(value_author_id)
                .bind(meta_author_id)
                .execute(&mut *conn)
                .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn insert_secret_value(
        &self,
        conn: &mut SqliteConnection,
        secret_id: i64,
        group_id: i64,
        ciphertext: &Armored,
        encrypted_metadata: &Armored,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO secret_values (secret_id, group_id, ciphertext, encrypted_metadata)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(secret_id)
        .bind(group_id)
        .bind(ciphertext.as_str())
        .bind(encrypted_metadata.as_str())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// All secrets reachable by a user, one row per secret. When a secret
    /// is reachable through several of the user's groups, the lowest group
    /// id wins, so the choice is deterministic.
    pub async fn secrets_for_user(
        &self,
        conn: &mut SqliteConnection,
        user_id: i64,
    ) -> Result<Vec<Secret>> {
        let rows = sqlx::query_as::<_, SecretRow>(
            r#"
            SELECT s.id, sv.group_id, s.value_author_id, s.meta_author_id,
                   sv.ciphertext, sv.encrypted_metadata
            FROM secrets s
            JOIN secret_values sv ON sv.secret_id = s.id
            JOIN group_members gm ON gm.group_id = sv.group_id
            WHERE gm.user_id = ?
            ORDER BY s.id, sv.group_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut secrets: Vec<Secret> = Vec::new();
        for row in rows {
            if secrets.last().map(|s: &Secret| s.id) == Some(row.id) {
                continue;
            }
            secrets.push(row.into_secret());
        }
        Ok(secrets)
    }

    /// The single reachable row for one secret, or `None` when the user is
    /// not a member of any group the secret is shared with.
    pub async fn secret_for_user(
        &self,
        conn: &mut SqliteConnection,
        user_id: i64,
        secret_id: i64,
    ) -> Result<Option<Secret>> {
        let row = sqlx::query_as::<_, SecretRow>(
            r#"
            SELECT s.id, sv.group_id, s.value_author_id, s.meta_author_id,
                   sv.ciphertext, sv.encrypted_metadata
            FROM secrets s
            JOIN secret_values sv ON sv.secret_id = s.id
            JOIN group_members gm ON gm.group_id = sv.group_id
            WHERE gm.user_id = ? AND s.id = ?
            ORDER BY sv.group_id
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(secret_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.map(SecretRow::into_secret))
    }

    pub async fn groups_sharing_secret(
        &self,
        conn: &mut SqliteConnection,
        secret_id: i64,
    ) -> Result<Vec<Group>> {
        let rows = sqlx::query_as::<_, GroupRow>(
            r#"
            SELECT g.id, g.name, g.pubk
            FROM groups g
            JOIN secret_values sv ON sv.group_id = g.id
            WHERE sv.secret_id = ?
            ORDER BY g.id
            "#,
        )
        .bind(secret_id)
        .fetch_all(&mut *conn)
        .await?;
        rows.into_iter().map(GroupRow::into_group).collect()
    }

    pub async fn update_secret_value(
        &self,
        conn: &mut SqliteConnection,
        secret_id: i64,
        group_id: i64,
        ciphertext: &Armored,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE secret_values SET ciphertext = ? WHERE secret_id = ? AND group_id = ?",
        )
        .bind(ciphertext.as_str())
        .bind(secret_id)
        .bind(group_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn update_secret_metadata(
        &self,
        conn: &mut SqliteConnection,
        secret_id: i64,
        group_id: i64,
        encrypted_metadata: &Armored,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE secret_values SET encrypted_metadata = ? WHERE secret_id = ? AND group_id = ?",
        )
        .bind(encrypted_metadata.as_str())
        .bind(secret_id)
        .bind(group_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn set_value_author(
        &self,
        conn: &mut SqliteConnection,
        secret_id: i64,
        user_id: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE secrets SET value_author_id = ? WHERE id = ?")
            .bind(user_id)
            .bind(secret_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn set_meta_author(
        &self,
        conn: &mut SqliteConnection,
        secret_id: i64,
        user_id: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE secrets SET meta_author_id = ? WHERE id = ?")
            .bind(user_id)
            .bind(secret_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn delete_secret(&self, conn: &mut SqliteConnection, secret_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM secrets WHERE id = ?")
            .bind(secret_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    // ── Activation tokens ──

    pub async fn create_activation(
        &self,
        conn: &mut SqliteConnection,
        token: &ActivationToken,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_activations (user_id, token, not_before, not_after)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(token.user_id)
        .bind(&token.token)
        .bind(token.not_before)
        .bind(token.not_after)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn find_activation(
        &self,
        conn: &mut SqliteConnection,
        user_id: i64,
        token: &str,
    ) -> Result<Option<ActivationToken>> {
        let row = sqlx::query_as::<_, ActivationRow>(
            r#"
            SELECT user_id, token, not_before, not_after
            FROM user_activations
            WHERE user_id = ? AND token = ?
            "#,
        )
        .bind(user_id)
        .bind(token)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.map(ActivationRow::into_token))
    }

    pub async fn purge_activations(
        &self,
        conn: &mut SqliteConnection,
        user_id: i64,
    ) -> Result<()> {
        sqlx::query("DELETE FROM user_activations WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    // ── Cache invalidation ──

    fn invalidate_user(&self, user_id: i64) {
        self.users.write().expect("cache lock").remove(&user_id);
        self.logins
            .write()
            .expect("cache lock")
            .retain(|_, id| *id != user_id);
    }

    fn invalidate_group(&self, group_id: i64) {
        self.groups.write().expect("cache lock").remove(&group_id);
    }

    /// Group deletion cascades into keychains; flush every cached user.
    fn invalidate_all_users(&self) {
        self.users.write().expect("cache lock").clear();
        self.logins.write().expect("cache lock").clear();
    }
}
