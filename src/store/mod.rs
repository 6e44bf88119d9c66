pub mod path;
mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::*;

/// Filters for listing databases. Results are always ordered by name.
#[derive(Debug, Clone, Default)]
pub struct DatabaseFilter {
    pub owner: Option<String>,
    pub db_type: Option<DatabaseType>,
    pub visibility: Option<Visibility>,
    /// Only databases this user owns, holds a grant on, or can read publicly.
    pub accessible_to: Option<String>,
}

/// Filters for listing invitations. Results are ordered newest first.
#[derive(Debug, Clone, Default)]
pub struct InvitationFilter {
    pub database_name: Option<String>,
    pub inviter: Option<String>,
    pub invitee: Option<String>,
    pub status: Option<InvitationStatus>,
}

/// A pending -> terminal invitation change, applied atomically together with
/// its grant and notification.
#[derive(Debug, Clone)]
pub struct InvitationTransition {
    pub id: String,
    pub to: InvitationStatus,
    pub at: DateTime<Utc>,
    pub grant: Option<PermissionGrant>,
    pub notification: Notification,
}

/// A single token redemption, applied atomically: validity check, usage
/// increment, redeemer set, grant and issuer notification.
#[derive(Debug, Clone)]
pub struct TokenRedemption {
    pub token_id: String,
    pub user: String,
    pub at: DateTime<Utc>,
    pub grant: Option<PermissionGrant>,
    pub notification: Notification,
}

/// Store defines the persistence interface.
///
/// Operations that combine a state check with a write (registration,
/// invitation transitions, token redemption) must be atomic with respect to
/// every other call on the same store.
pub trait Store: Send + Sync {
    fn initialize(&self) -> Result<()>;

    // Database operations
    fn create_database(&self, db: &Database) -> Result<()>;
    fn get_database(&self, name: &str) -> Result<Option<Database>>;
    fn list_databases(&self, filter: &DatabaseFilter) -> Result<Vec<Database>>;
    fn update_database_visibility(
        &self,
        name: &str,
        visibility: Visibility,
        at: DateTime<Utc>,
    ) -> Result<()>;
    fn update_database_stats(
        &self,
        name: &str,
        item_count: i64,
        size_bytes: i64,
        at: DateTime<Utc>,
    ) -> Result<()>;
    fn delete_database(&self, name: &str) -> Result<bool>;

    // Permission grant operations
    fn upsert_grant(&self, grant: &PermissionGrant) -> Result<()>;
    fn get_grant(&self, database_name: &str, user: &str) -> Result<Option<PermissionGrant>>;
    fn list_grants(&self, database_name: &str) -> Result<Vec<PermissionGrant>>;
    fn list_user_grants(&self, user: &str) -> Result<Vec<PermissionGrant>>;
    /// Deletes a grant; the notification is stored only if a grant was removed.
    fn delete_grant(
        &self,
        database_name: &str,
        user: &str,
        notification: Option<&Notification>,
    ) -> Result<bool>;

    // Folder operations (materialized path)
    /// Creates the folder and any missing ancestors. Fails if the folder exists.
    fn create_folder(&self, database_name: &str, path: &str, at: DateTime<Utc>) -> Result<Folder>;
    fn get_folder(&self, database_name: &str, path: &str) -> Result<Option<Folder>>;
    fn list_child_folders(&self, database_name: &str, parent: &str) -> Result<Vec<Folder>>;
    /// Returns the number of folders removed.
    fn delete_folder(&self, database_name: &str, path: &str, recursive: bool) -> Result<usize>;
    fn move_folder(
        &self,
        database_name: &str,
        from: &str,
        to: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;
    fn adjust_file_count(
        &self,
        database_name: &str,
        path: &str,
        delta: i64,
        at: DateTime<Utc>,
    ) -> Result<Folder>;

    // Invitation operations
    fn create_invitation(
        &self,
        invitation: &ShareInvitation,
        notification: &Notification,
    ) -> Result<()>;
    fn get_invitation(&self, id: &str) -> Result<Option<ShareInvitation>>;
    fn list_invitations(&self, filter: &InvitationFilter) -> Result<Vec<ShareInvitation>>;
    fn transition_invitation(&self, transition: &InvitationTransition) -> Result<ShareInvitation>;

    // Access token operations
    fn create_token(&self, token: &AccessToken) -> Result<()>;
    fn get_token_by_id(&self, id: &str) -> Result<Option<AccessToken>>;
    fn get_token_by_lookup(&self, lookup: &str) -> Result<Option<AccessToken>>;
    fn list_tokens(&self, database_name: &str) -> Result<Vec<AccessToken>>;
    fn redeem_token(&self, redemption: &TokenRedemption) -> Result<AccessToken>;
    /// Deactivates a token. Returns false if it was already inactive, in which
    /// case no notifications are stored.
    fn deactivate_token(
        &self,
        id: &str,
        at: DateTime<Utc>,
        notifications: &[Notification],
    ) -> Result<bool>;
    fn deactivate_expired_tokens(&self, now: DateTime<Utc>) -> Result<usize>;

    // Notification operations
    fn create_notification(&self, notification: &Notification) -> Result<()>;
    fn get_notification(&self, id: &str) -> Result<Option<Notification>>;
    fn list_notifications(&self, user: &str, unread_only: bool) -> Result<Vec<Notification>>;
    fn count_unread_notifications(&self, user: &str) -> Result<i64>;
    fn mark_notification_read(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;
    fn mark_all_notifications_read(&self, user: &str, at: DateTime<Utc>) -> Result<usize>;
    fn delete_notification(&self, id: &str) -> Result<bool>;
    fn delete_user_notifications(&self, user: &str) -> Result<usize>;
}
