use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params, params_from_iter};

use super::path::{MAX_DEPTH, ROOT, ancestor_paths, depth, folder_name, is_sub_path};
use super::schema::SCHEMA;
use super::{DatabaseFilter, InvitationFilter, InvitationTransition, Store, TokenRedemption};
use crate::error::{Error, Result};
use crate::types::*;

const DATABASE_COLUMNS: &str =
    "name, db_type, owner, visibility, item_count, size_bytes, created_at, updated_at";
const GRANT_COLUMNS: &str = "database_name, user, role, created_at, updated_at";
const FOLDER_COLUMNS: &str = "database_name, path, name, file_count, created_at, updated_at";
const INVITATION_COLUMNS: &str = "id, database_name, inviter, invitee, role, status, message, \
     created_at, expires_at, accepted_at, responded_at, revoked_at";
const TOKEN_COLUMNS: &str = "id, token_hash, token_lookup, database_name, issuer, role, active, \
     description, created_at, expires_at, revoked_at, usage_count, max_uses";
const NOTIFICATION_COLUMNS: &str = "id, user, kind, message, data, created_at, read, read_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens a private in-memory store. Its contents vanish when dropped.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::warn!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

/// Fixed-width UTC timestamps so that text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: Error| conversion_error(idx, e.to_string()))
}

fn role_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Role> {
    let level: i64 = row.get(idx)?;
    Role::from_level(level).ok_or_else(|| conversion_error(idx, format!("invalid role level {level}")))
}

fn datetime_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    Ok(parse_datetime(&row.get::<_, String>(idx)?))
}

fn optional_datetime_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<String>>(idx)?.map(|s| parse_datetime(&s)))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

fn database_from_row(row: &Row<'_>) -> rusqlite::Result<Database> {
    Ok(Database {
        name: row.get(0)?,
        db_type: parse_column(row, 1)?,
        owner: row.get(2)?,
        visibility: parse_column(row, 3)?,
        item_count: row.get(4)?,
        size_bytes: row.get(5)?,
        created_at: datetime_column(row, 6)?,
        updated_at: datetime_column(row, 7)?,
    })
}

fn grant_from_row(row: &Row<'_>) -> rusqlite::Result<PermissionGrant> {
    Ok(PermissionGrant {
        database_name: row.get(0)?,
        user: row.get(1)?,
        role: role_column(row, 2)?,
        created_at: datetime_column(row, 3)?,
        updated_at: datetime_column(row, 4)?,
    })
}

fn folder_from_row(row: &Row<'_>) -> rusqlite::Result<Folder> {
    Ok(Folder {
        database_name: row.get(0)?,
        path: row.get(1)?,
        name: row.get(2)?,
        file_count: row.get(3)?,
        created_at: datetime_column(row, 4)?,
        updated_at: datetime_column(row, 5)?,
    })
}

fn invitation_from_row(row: &Row<'_>) -> rusqlite::Result<ShareInvitation> {
    Ok(ShareInvitation {
        id: row.get(0)?,
        database_name: row.get(1)?,
        inviter: row.get(2)?,
        invitee: row.get(3)?,
        role: role_column(row, 4)?,
        status: parse_column(row, 5)?,
        message: row.get(6)?,
        created_at: datetime_column(row, 7)?,
        expires_at: optional_datetime_column(row, 8)?,
        accepted_at: optional_datetime_column(row, 9)?,
        responded_at: optional_datetime_column(row, 10)?,
        revoked_at: optional_datetime_column(row, 11)?,
    })
}

/// Maps the token row; `used_by` is filled separately from `token_redemptions`.
fn token_from_row(row: &Row<'_>) -> rusqlite::Result<AccessToken> {
    Ok(AccessToken {
        id: row.get(0)?,
        token_hash: row.get(1)?,
        token_lookup: row.get(2)?,
        database_name: row.get(3)?,
        issuer: row.get(4)?,
        role: role_column(row, 5)?,
        active: row.get(6)?,
        description: row.get(7)?,
        created_at: datetime_column(row, 8)?,
        expires_at: datetime_column(row, 9)?,
        revoked_at: optional_datetime_column(row, 10)?,
        usage_count: row.get(11)?,
        max_uses: row.get(12)?,
        used_by: Default::default(),
    })
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    let data: String = row.get(4)?;
    Ok(Notification {
        id: row.get(0)?,
        user: row.get(1)?,
        kind: parse_column(row, 2)?,
        message: row.get(3)?,
        data: serde_json::from_str(&data).map_err(|e| conversion_error(4, e.to_string()))?,
        created_at: datetime_column(row, 5)?,
        read: row.get(6)?,
        read_at: optional_datetime_column(row, 7)?,
    })
}

fn query_folder(conn: &Connection, database_name: &str, path: &str) -> Result<Option<Folder>> {
    conn.query_row(
        &format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE database_name = ?1 AND path = ?2"),
        params![database_name, path],
        folder_from_row,
    )
    .optional()
    .map_err(Error::from)
}

fn query_invitation(conn: &Connection, id: &str) -> Result<Option<ShareInvitation>> {
    conn.query_row(
        &format!("SELECT {INVITATION_COLUMNS} FROM invitations WHERE id = ?1"),
        params![id],
        invitation_from_row,
    )
    .optional()
    .map_err(Error::from)
}

fn load_used_by(conn: &Connection, token: &mut AccessToken) -> Result<()> {
    let mut stmt =
        conn.prepare("SELECT user FROM token_redemptions WHERE token_id = ?1 ORDER BY user")?;
    let users = stmt.query_map(params![token.id], |row| row.get::<_, String>(0))?;
    token.used_by = users.collect::<std::result::Result<_, _>>()?;
    Ok(())
}

fn query_token(conn: &Connection, column: &str, value: &str) -> Result<Option<AccessToken>> {
    let token = conn
        .query_row(
            &format!("SELECT {TOKEN_COLUMNS} FROM access_tokens WHERE {column} = ?1"),
            params![value],
            token_from_row,
        )
        .optional()?;

    match token {
        Some(mut token) => {
            load_used_by(conn, &mut token)?;
            Ok(Some(token))
        }
        None => Ok(None),
    }
}

fn insert_notification(conn: &Connection, n: &Notification) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO notifications ({NOTIFICATION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        ),
        params![
            n.id,
            n.user,
            n.kind.as_str(),
            n.message,
            serde_json::to_string(&n.data)?,
            format_datetime(&n.created_at),
            n.read,
            n.read_at.as_ref().map(format_datetime),
        ],
    )?;
    Ok(())
}

/// Inserts a grant, or raises an existing one. Never lowers a role.
fn raise_grant(conn: &Connection, grant: &PermissionGrant) -> Result<()> {
    conn.execute(
        "INSERT INTO permission_grants (database_name, user, role, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (database_name, user) DO UPDATE SET
            role = MAX(role, excluded.role),
            updated_at = excluded.updated_at",
        params![
            grant.database_name,
            grant.user,
            grant.role.level(),
            format_datetime(&grant.created_at),
            format_datetime(&grant.updated_at),
        ],
    )?;
    Ok(())
}

/// Prefix matching every strict descendant of `path`.
fn descendant_prefix(path: &str) -> String {
    if path == ROOT {
        ROOT.to_string()
    } else {
        format!("{path}/")
    }
}

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    // Database operations

    fn create_database(&self, db: &Database) -> Result<()> {
        let result = self.conn().execute(
            &format!("INSERT INTO databases ({DATABASE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                db.name,
                db.db_type.as_str(),
                db.owner,
                db.visibility.as_str(),
                db.item_count,
                db.size_bytes,
                format_datetime(&db.created_at),
                format_datetime(&db.updated_at),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::already_exists("database", &db.name)),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn get_database(&self, name: &str) -> Result<Option<Database>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {DATABASE_COLUMNS} FROM databases WHERE name = ?1"),
            params![name],
            database_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_databases(&self, filter: &DatabaseFilter) -> Result<Vec<Database>> {
        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if let Some(owner) = &filter.owner {
            values.push(owner.clone());
            clauses.push(format!("owner = ?{}", values.len()));
        }
        if let Some(db_type) = filter.db_type {
            values.push(db_type.as_str().to_string());
            clauses.push(format!("db_type = ?{}", values.len()));
        }
        if let Some(visibility) = filter.visibility {
            values.push(visibility.as_str().to_string());
            clauses.push(format!("visibility = ?{}", values.len()));
        }
        if let Some(user) = &filter.accessible_to {
            values.push(user.clone());
            let idx = values.len();
            clauses.push(format!(
                "(visibility = 'public' OR owner = ?{idx} OR name IN
                    (SELECT database_name FROM permission_grants WHERE user = ?{idx}))"
            ));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DATABASE_COLUMNS} FROM databases {where_clause} ORDER BY name"
        ))?;
        let rows = stmt.query_map(params_from_iter(values.iter()), database_from_row)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn update_database_visibility(
        &self,
        name: &str,
        visibility: Visibility,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE databases SET visibility = ?1, updated_at = ?2 WHERE name = ?3",
            params![visibility.as_str(), format_datetime(&at), name],
        )?;

        if rows == 0 {
            return Err(Error::not_found("database", name));
        }
        Ok(())
    }

    fn update_database_stats(
        &self,
        name: &str,
        item_count: i64,
        size_bytes: i64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE databases SET item_count = ?1, size_bytes = ?2, updated_at = ?3 WHERE name = ?4",
            params![item_count, size_bytes, format_datetime(&at), name],
        )?;

        if rows == 0 {
            return Err(Error::not_found("database", name));
        }
        Ok(())
    }

    fn delete_database(&self, name: &str) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM databases WHERE name = ?1", params![name])?;
        Ok(rows > 0)
    }

    // Permission grant operations

    fn upsert_grant(&self, grant: &PermissionGrant) -> Result<()> {
        self.conn().execute(
            "INSERT INTO permission_grants (database_name, user, role, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (database_name, user) DO UPDATE SET
                role = excluded.role,
                updated_at = excluded.updated_at",
            params![
                grant.database_name,
                grant.user,
                grant.role.level(),
                format_datetime(&grant.created_at),
                format_datetime(&grant.updated_at),
            ],
        )?;
        Ok(())
    }

    fn get_grant(&self, database_name: &str, user: &str) -> Result<Option<PermissionGrant>> {
        let conn = self.conn();
        conn.query_row(
            &format!(
                "SELECT {GRANT_COLUMNS} FROM permission_grants WHERE database_name = ?1 AND user = ?2"
            ),
            params![database_name, user],
            grant_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_grants(&self, database_name: &str) -> Result<Vec<PermissionGrant>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {GRANT_COLUMNS} FROM permission_grants WHERE database_name = ?1 ORDER BY user"
        ))?;
        let rows = stmt.query_map(params![database_name], grant_from_row)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn list_user_grants(&self, user: &str) -> Result<Vec<PermissionGrant>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {GRANT_COLUMNS} FROM permission_grants WHERE user = ?1 ORDER BY database_name"
        ))?;
        let rows = stmt.query_map(params![user], grant_from_row)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn delete_grant(
        &self,
        database_name: &str,
        user: &str,
        notification: Option<&Notification>,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let rows = tx.execute(
            "DELETE FROM permission_grants WHERE database_name = ?1 AND user = ?2",
            params![database_name, user],
        )?;

        if rows > 0 {
            if let Some(n) = notification {
                insert_notification(&tx, n)?;
            }
        }

        tx.commit()?;
        Ok(rows > 0)
    }

    // Folder operations

    fn create_folder(&self, database_name: &str, path: &str, at: DateTime<Utc>) -> Result<Folder> {
        if path == ROOT {
            return Err(Error::already_exists("folder", path));
        }

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if query_folder(&tx, database_name, path)?.is_some() {
            return Err(Error::already_exists("folder", path));
        }

        let now = format_datetime(&at);
        let to_create = ancestor_paths(path)
            .into_iter()
            .filter(|p| p != ROOT)
            .chain(std::iter::once(path.to_string()));

        for current in to_create {
            tx.execute(
                "INSERT OR IGNORE INTO folders (database_name, path, name, file_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?4)",
                params![database_name, current, folder_name(&current), now],
            )?;
        }

        let folder = query_folder(&tx, database_name, path)?
            .ok_or_else(|| Error::not_found("folder", path))?;

        tx.commit()?;
        Ok(folder)
    }

    fn get_folder(&self, database_name: &str, path: &str) -> Result<Option<Folder>> {
        query_folder(&self.conn(), database_name, path)
    }

    fn list_child_folders(&self, database_name: &str, parent: &str) -> Result<Vec<Folder>> {
        let prefix = descendant_prefix(parent);
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FOLDER_COLUMNS} FROM folders
             WHERE database_name = ?1
               AND substr(path, 1, ?2) = ?3
               AND instr(substr(path, ?2 + 1), '/') = 0
             ORDER BY name"
        ))?;
        let rows = stmt.query_map(
            params![database_name, prefix.len() as i64, prefix],
            folder_from_row,
        )?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn delete_folder(&self, database_name: &str, path: &str, recursive: bool) -> Result<usize> {
        if path == ROOT {
            return Err(Error::InvalidInput("cannot delete the root folder".to_string()));
        }

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let folder = query_folder(&tx, database_name, path)?
            .ok_or_else(|| Error::not_found("folder", path))?;

        let prefix = descendant_prefix(path);
        let descendants: i64 = tx.query_row(
            "SELECT COUNT(*) FROM folders WHERE database_name = ?1 AND substr(path, 1, ?2) = ?3",
            params![database_name, prefix.len() as i64, prefix],
            |row| row.get(0),
        )?;

        if !recursive && (descendants > 0 || folder.file_count > 0) {
            return Err(Error::InvalidInput(format!(
                "folder '{path}' is not empty ({descendants} subfolders, {} files)",
                folder.file_count
            )));
        }

        let removed = tx.execute(
            "DELETE FROM folders
             WHERE database_name = ?1 AND (path = ?2 OR substr(path, 1, ?3) = ?4)",
            params![database_name, path, prefix.len() as i64, prefix],
        )?;

        tx.commit()?;
        Ok(removed)
    }

    fn move_folder(
        &self,
        database_name: &str,
        from: &str,
        to: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if from == ROOT || to == ROOT {
            return Err(Error::InvalidInput("cannot move the root folder".to_string()));
        }
        if from == to {
            return Ok(());
        }
        if is_sub_path(to, from) {
            return Err(Error::InvalidInput(format!(
                "cannot move folder '{from}' into itself or its descendants"
            )));
        }

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if query_folder(&tx, database_name, from)?.is_none() {
            return Err(Error::not_found("folder", from));
        }
        if query_folder(&tx, database_name, to)?.is_some() {
            return Err(Error::already_exists("folder", to));
        }

        let prefix = descendant_prefix(from);
        let deepest: Option<i64> = {
            let mut stmt = tx.prepare(
                "SELECT path FROM folders WHERE database_name = ?1 AND substr(path, 1, ?2) = ?3",
            )?;
            let paths = stmt.query_map(
                params![database_name, prefix.len() as i64, prefix],
                |row| row.get::<_, String>(0),
            )?;
            let mut deepest = None;
            for p in paths {
                let d = depth(&p?) as i64;
                deepest = Some(deepest.map_or(d, |cur: i64| cur.max(d)));
            }
            deepest
        };
        let relative = deepest.unwrap_or(depth(from) as i64) - depth(from) as i64;
        let new_depth = depth(to) + relative as usize;
        if new_depth > MAX_DEPTH {
            return Err(Error::MaxDepthExceeded {
                path: to.to_string(),
                depth: new_depth,
                max: MAX_DEPTH,
            });
        }

        let now = format_datetime(&at);

        for ancestor in ancestor_paths(to).into_iter().filter(|p| p != ROOT) {
            tx.execute(
                "INSERT OR IGNORE INTO folders (database_name, path, name, file_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?4)",
                params![database_name, ancestor, folder_name(&ancestor), now],
            )?;
        }

        tx.execute(
            "UPDATE folders SET path = ?1, name = ?2, updated_at = ?3
             WHERE database_name = ?4 AND path = ?5",
            params![to, folder_name(to), now, database_name, from],
        )?;

        tx.execute(
            "UPDATE folders SET path = ?1 || substr(path, ?2), updated_at = ?3
             WHERE database_name = ?4 AND substr(path, 1, ?5) = ?6",
            params![
                to,
                from.len() as i64 + 1,
                now,
                database_name,
                prefix.len() as i64,
                prefix
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn adjust_file_count(
        &self,
        database_name: &str,
        path: &str,
        delta: i64,
        at: DateTime<Utc>,
    ) -> Result<Folder> {
        let conn = self.conn();
        let rows = conn.execute(
            "UPDATE folders SET file_count = MAX(0, file_count + ?1), updated_at = ?2
             WHERE database_name = ?3 AND path = ?4",
            params![delta, format_datetime(&at), database_name, path],
        )?;

        if rows == 0 {
            return Err(Error::not_found("folder", path));
        }

        query_folder(&conn, database_name, path)?.ok_or_else(|| Error::not_found("folder", path))
    }

    // Invitation operations

    fn create_invitation(
        &self,
        invitation: &ShareInvitation,
        notification: &Notification,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            &format!(
                "INSERT INTO invitations ({INVITATION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                invitation.id,
                invitation.database_name,
                invitation.inviter,
                invitation.invitee,
                invitation.role.level(),
                invitation.status.as_str(),
                invitation.message,
                format_datetime(&invitation.created_at),
                invitation.expires_at.as_ref().map(format_datetime),
                invitation.accepted_at.as_ref().map(format_datetime),
                invitation.responded_at.as_ref().map(format_datetime),
                invitation.revoked_at.as_ref().map(format_datetime),
            ],
        )?;
        insert_notification(&tx, notification)?;

        tx.commit()?;
        Ok(())
    }

    fn get_invitation(&self, id: &str) -> Result<Option<ShareInvitation>> {
        query_invitation(&self.conn(), id)
    }

    fn list_invitations(&self, filter: &InvitationFilter) -> Result<Vec<ShareInvitation>> {
        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();

        let columns = [
            ("database_name", filter.database_name.clone()),
            ("inviter", filter.inviter.clone()),
            ("invitee", filter.invitee.clone()),
            ("status", filter.status.map(|s| s.as_str().to_string())),
        ];
        for (column, value) in columns {
            if let Some(value) = value {
                values.push(value);
                clauses.push(format!("{column} = ?{}", values.len()));
            }
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {INVITATION_COLUMNS} FROM invitations {where_clause}
             ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(params_from_iter(values.iter()), invitation_from_row)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn transition_invitation(&self, transition: &InvitationTransition) -> Result<ShareInvitation> {
        let column = match transition.to {
            InvitationStatus::Accepted => "accepted_at",
            InvitationStatus::Rejected => "responded_at",
            InvitationStatus::Revoked => "revoked_at",
            InvitationStatus::Pending => {
                return Err(Error::InvalidInput(
                    "an invitation cannot transition back to pending".to_string(),
                ));
            }
        };

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // The status guard makes the pending check and the write one step.
        let rows = tx.execute(
            &format!(
                "UPDATE invitations SET status = ?1, {column} = ?2 WHERE id = ?3 AND status = 'pending'"
            ),
            params![
                transition.to.as_str(),
                format_datetime(&transition.at),
                transition.id
            ],
        )?;

        if rows == 0 {
            return match query_invitation(&tx, &transition.id)? {
                None => Err(Error::not_found("invitation", &transition.id)),
                Some(current) => Err(Error::AlreadyTerminal {
                    what: format!("invitation '{}'", transition.id),
                    status: current.status.to_string(),
                }),
            };
        }

        if let Some(grant) = &transition.grant {
            raise_grant(&tx, grant)?;
        }
        insert_notification(&tx, &transition.notification)?;

        let updated = query_invitation(&tx, &transition.id)?
            .ok_or_else(|| Error::not_found("invitation", &transition.id))?;

        tx.commit()?;
        Ok(updated)
    }

    // Access token operations

    fn create_token(&self, token: &AccessToken) -> Result<()> {
        let result = self.conn().execute(
            &format!(
                "INSERT INTO access_tokens ({TOKEN_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                token.id,
                token.token_hash,
                token.token_lookup,
                token.database_name,
                token.issuer,
                token.role.level(),
                token.active,
                token.description,
                format_datetime(&token.created_at),
                format_datetime(&token.expires_at),
                token.revoked_at.as_ref().map(format_datetime),
                token.usage_count,
                token.max_uses,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::TokenLookupCollision),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn get_token_by_id(&self, id: &str) -> Result<Option<AccessToken>> {
        query_token(&self.conn(), "id", id)
    }

    fn get_token_by_lookup(&self, lookup: &str) -> Result<Option<AccessToken>> {
        query_token(&self.conn(), "token_lookup", lookup)
    }

    fn list_tokens(&self, database_name: &str) -> Result<Vec<AccessToken>> {
        let conn = self.conn();
        let mut tokens = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TOKEN_COLUMNS} FROM access_tokens WHERE database_name = ?1
                 ORDER BY created_at DESC, rowid DESC"
            ))?;
            let rows = stmt.query_map(params![database_name], token_from_row)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        for token in &mut tokens {
            load_used_by(&conn, token)?;
        }
        Ok(tokens)
    }

    fn redeem_token(&self, redemption: &TokenRedemption) -> Result<AccessToken> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let token = query_token(&tx, "id", &redemption.token_id)?.ok_or(Error::TokenInvalid)?;

        if !token.active {
            return Err(Error::TokenInvalid);
        }
        if token.is_expired(redemption.at) {
            return Err(Error::TokenExpired(token.id));
        }
        if token.is_exhausted() {
            return Err(Error::TokenExhausted(token.id));
        }

        tx.execute(
            "UPDATE access_tokens SET usage_count = usage_count + 1 WHERE id = ?1",
            params![token.id],
        )?;
        tx.execute(
            "INSERT INTO token_redemptions (token_id, user, first_used_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (token_id, user) DO NOTHING",
            params![token.id, redemption.user, format_datetime(&redemption.at)],
        )?;

        if let Some(grant) = &redemption.grant {
            raise_grant(&tx, grant)?;
        }
        insert_notification(&tx, &redemption.notification)?;

        let updated = query_token(&tx, "id", &token.id)?.ok_or(Error::TokenInvalid)?;

        tx.commit()?;
        Ok(updated)
    }

    fn deactivate_token(
        &self,
        id: &str,
        at: DateTime<Utc>,
        notifications: &[Notification],
    ) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let rows = tx.execute(
            "UPDATE access_tokens SET active = 0, revoked_at = ?1 WHERE id = ?2 AND active = 1",
            params![format_datetime(&at), id],
        )?;

        if rows == 0 {
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM access_tokens WHERE id = ?1)",
                params![id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(Error::not_found("access token", id));
            }
            return Ok(false);
        }

        for n in notifications {
            insert_notification(&tx, n)?;
        }

        tx.commit()?;
        Ok(true)
    }

    fn deactivate_expired_tokens(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let expired: Vec<String> = {
            let mut stmt = tx.prepare("SELECT id, expires_at FROM access_tokens WHERE active = 1")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, datetime_column(row, 1)?))
            })?;
            let mut expired = Vec::new();
            for row in rows {
                let (id, expires_at) = row?;
                if now >= expires_at {
                    expired.push(id);
                }
            }
            expired
        };

        for id in &expired {
            tx.execute(
                "UPDATE access_tokens SET active = 0 WHERE id = ?1",
                params![id],
            )?;
        }

        tx.commit()?;
        Ok(expired.len())
    }

    // Notification operations

    fn create_notification(&self, notification: &Notification) -> Result<()> {
        insert_notification(&self.conn(), notification)
    }

    fn get_notification(&self, id: &str) -> Result<Option<Notification>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?1"),
            params![id],
            notification_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_notifications(&self, user: &str, unread_only: bool) -> Result<Vec<Notification>> {
        let filter = if unread_only { "AND read = 0" } else { "" };
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE user = ?1 {filter}
             ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(params![user], notification_from_row)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn count_unread_notifications(&self, user: &str) -> Result<i64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM notifications WHERE user = ?1 AND read = 0",
            params![user],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn mark_notification_read(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE notifications SET read = 1, read_at = ?1 WHERE id = ?2 AND read = 0",
            params![format_datetime(&at), id],
        )?;
        Ok(rows > 0)
    }

    fn mark_all_notifications_read(&self, user: &str, at: DateTime<Utc>) -> Result<usize> {
        let rows = self.conn().execute(
            "UPDATE notifications SET read = 1, read_at = ?1 WHERE user = ?2 AND read = 0",
            params![format_datetime(&at), user],
        )?;
        Ok(rows)
    }

    fn delete_notification(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM notifications WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn delete_user_notifications(&self, user: &str) -> Result<usize> {
        let rows = self
            .conn()
            .execute("DELETE FROM notifications WHERE user = ?1", params![user])?;
        Ok(rows)
    }
}
