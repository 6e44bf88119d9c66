use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use super::notifications::build_notification;
use crate::auth;
use crate::error::{Error, Result};
use crate::store::{DatabaseFilter, Store};
use crate::types::{
    Action, Database, DatabaseType, NotificationKind, PermissionGrant, Role, Visibility,
};
use crate::validation::{validate_database_name, validate_user};

/// Canonical set of named databases and their permission grants.
///
/// Unregistering removes grants, folders, invitations and tokens of the
/// database. Cached embeddings are not tied to a database and are untouched.
#[derive(Clone)]
pub struct DatabaseRegistry {
    store: Arc<dyn Store>,
}

impl DatabaseRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Registers a private database.
    pub fn register(&self, name: &str, db_type: DatabaseType, owner: &str) -> Result<Database> {
        self.register_with(name, db_type, owner, Visibility::Private)
    }

    pub fn register_with(
        &self,
        name: &str,
        db_type: DatabaseType,
        owner: &str,
        visibility: Visibility,
    ) -> Result<Database> {
        validate_database_name(name)?;
        validate_user(owner, "owner")?;

        let now = Utc::now();
        let db = Database {
            name: name.to_string(),
            db_type,
            owner: owner.to_string(),
            visibility,
            item_count: 0,
            size_bytes: 0,
            created_at: now,
            updated_at: now,
        };

        // The primary key decides concurrent registrations of one name.
        self.store.create_database(&db)?;
        info!("Registered {db_type} database '{name}' owned by {owner}");
        Ok(db)
    }

    pub fn get(&self, name: &str) -> Result<Database> {
        self.store
            .get_database(name)?
            .ok_or_else(|| Error::not_found("database", name))
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.store.get_database(name)?.is_some())
    }

    pub fn list(&self, filter: &DatabaseFilter) -> Result<Vec<Database>> {
        self.store.list_databases(filter)
    }

    /// Only the owner may unregister.
    pub fn unregister(&self, name: &str, actor: &str) -> Result<()> {
        let db = self.get(name)?;
        if db.owner != actor {
            return Err(Error::Forbidden(format!(
                "only the owner of database '{name}' can unregister it"
            )));
        }
        self.force_unregister(name)
    }

    /// Unregisters without an ownership check. For operator tooling.
    pub fn force_unregister(&self, name: &str) -> Result<()> {
        if !self.store.delete_database(name)? {
            return Err(Error::not_found("database", name));
        }
        info!("Unregistered database '{name}'");
        Ok(())
    }

    pub fn set_visibility(&self, name: &str, actor: &str, visibility: Visibility) -> Result<Database> {
        let db = self.require_access(name, Some(actor), Action::Admin)?;
        if db.visibility != visibility {
            self.store
                .update_database_visibility(name, visibility, Utc::now())?;
            info!("Database '{name}' is now {visibility}");
        }
        self.get(name)
    }

    pub fn update_stats(&self, name: &str, item_count: i64, size_bytes: i64) -> Result<Database> {
        if item_count < 0 || size_bytes < 0 {
            return Err(Error::InvalidInput(format!(
                "stats for database '{name}' cannot be negative"
            )));
        }
        self.store
            .update_database_stats(name, item_count, size_bytes, Utc::now())?;
        self.get(name)
    }

    pub fn user_role(&self, name: &str, user: &str) -> Result<Option<Role>> {
        let db = self.get(name)?;
        auth::resolve_role(self.store.as_ref(), &db, user)
    }

    pub fn check_access(&self, name: &str, user: Option<&str>, action: Action) -> Result<bool> {
        let db = self.get(name)?;
        auth::check_access(self.store.as_ref(), &db, user, action)
    }

    /// Returns the database if `user` may perform `action` on it.
    pub fn require_access(&self, name: &str, user: Option<&str>, action: Action) -> Result<Database> {
        let db = self.get(name)?;
        auth::require_access(self.store.as_ref(), &db, user, action)?;
        Ok(db)
    }

    /// Sets `user`'s role exactly, replacing any previous grant.
    pub fn grant_access(
        &self,
        name: &str,
        actor: &str,
        user: &str,
        role: Role,
    ) -> Result<PermissionGrant> {
        validate_user(user, "user")?;
        if role == Role::Owner {
            return Err(Error::InvalidInput(
                "the owner role cannot be granted".to_string(),
            ));
        }

        let db = self.require_access(name, Some(actor), Action::Admin)?;
        if db.owner == user {
            return Err(Error::InvalidInput(format!(
                "{user} already owns database '{name}'"
            )));
        }

        let now = Utc::now();
        let created_at = self
            .store
            .get_grant(name, user)?
            .map_or(now, |g| g.created_at);
        let grant = PermissionGrant {
            database_name: name.to_string(),
            user: user.to_string(),
            role,
            created_at,
            updated_at: now,
        };
        self.store.upsert_grant(&grant)?;
        info!("Granted {role} on '{name}' to {user}");
        Ok(grant)
    }

    /// Removes `user`'s grant. Admins may revoke anyone; users may drop
    /// their own access. Returns false if there was nothing to revoke.
    pub fn revoke_access(&self, name: &str, actor: &str, user: &str) -> Result<bool> {
        let db = self.get(name)?;
        let by_other = actor != user;
        if by_other {
            auth::require_access(self.store.as_ref(), &db, Some(actor), Action::Admin)?;
        }

        let notification = by_other.then(|| {
            build_notification(
                user,
                NotificationKind::AccessRevoked,
                format!("{actor} revoked your access to '{name}'"),
                [
                    ("database_name", name.to_string()),
                    ("revoked_by", actor.to_string()),
                ],
            )
        });

        let removed = self.store.delete_grant(name, user, notification.as_ref())?;
        if removed {
            info!("Revoked access to '{name}' for {user}");
        }
        Ok(removed)
    }

    pub fn list_grants(&self, name: &str) -> Result<Vec<PermissionGrant>> {
        self.get(name)?;
        self.store.list_grants(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn registry() -> (DatabaseRegistry, Arc<dyn Store>) {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        let store: Arc<dyn Store> = Arc::new(store);
        (DatabaseRegistry::new(store.clone()), store)
    }

    #[test]
    fn test_register_and_get() {
        let (registry, _) = registry();
        let db = registry.register("docs", DatabaseType::Vector, "u1").unwrap();
        assert_eq!(db.visibility, Visibility::Private);
        assert_eq!(db.item_count, 0);

        assert!(registry.exists("docs").unwrap());
        assert!(!registry.exists("other").unwrap());
        assert_eq!(registry.get("docs").unwrap().owner, "u1");
        assert!(matches!(registry.get("other"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_register_rejects_duplicates_and_bad_names() {
        let (registry, _) = registry();
        registry.register("docs", DatabaseType::Vector, "u1").unwrap();

        assert!(matches!(
            registry.register("docs", DatabaseType::Graph, "u2"),
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            registry.register("", DatabaseType::Graph, "u2"),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            registry.register("notes", DatabaseType::Graph, " "),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_unregister_owner_only() {
        let (registry, _) = registry();
        registry.register("docs", DatabaseType::Vector, "u1").unwrap();

        assert!(matches!(registry.unregister("docs", "u2"), Err(Error::Forbidden(_))));
        registry.unregister("docs", "u1").unwrap();
        assert!(matches!(registry.unregister("docs", "u1"), Err(Error::NotFound(_))));
        assert!(matches!(registry.force_unregister("docs"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_list_filters() {
        let (registry, _) = registry();
        registry
            .register_with("zeta", DatabaseType::Graph, "u1", Visibility::Public)
            .unwrap();
        registry.register("alpha", DatabaseType::Vector, "u1").unwrap();
        registry.register("mid", DatabaseType::Vector, "u2").unwrap();
        registry.grant_access("mid", "u2", "u3", Role::Reader).unwrap();

        let all = registry.list(&DatabaseFilter::default()).unwrap();
        let names: Vec<&str> = all.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);

        let owned = registry
            .list(&DatabaseFilter {
                owner: Some("u1".to_string()),
                db_type: Some(DatabaseType::Vector),
                ..DatabaseFilter::default()
            })
            .unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].name, "alpha");

        let visible = registry
            .list(&DatabaseFilter {
                accessible_to: Some("u3".to_string()),
                ..DatabaseFilter::default()
            })
            .unwrap();
        let names: Vec<&str> = visible.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["mid", "zeta"]);
    }

    #[test]
    fn test_access_resolution() {
        let (registry, _) = registry();
        registry.register("docs", DatabaseType::Vector, "u1").unwrap();

        assert_eq!(registry.user_role("docs", "u1").unwrap(), Some(Role::Owner));
        assert_eq!(registry.user_role("docs", "u2").unwrap(), None);
        assert!(!registry.check_access("docs", None, Action::Read).unwrap());

        registry.grant_access("docs", "u1", "u2", Role::Writer).unwrap();
        assert!(registry.check_access("docs", Some("u2"), Action::Write).unwrap());
        assert!(!registry.check_access("docs", Some("u2"), Action::Admin).unwrap());

        registry
            .set_visibility("docs", "u1", Visibility::Public)
            .unwrap();
        assert!(registry.check_access("docs", None, Action::Read).unwrap());
        assert!(!registry.check_access("docs", None, Action::Write).unwrap());
        assert!(matches!(
            registry.require_access("docs", Some("u3"), Action::Write),
            Err(Error::Forbidden(_))
        ));
    }

    #[test]
    fn test_grant_rules() {
        let (registry, _) = registry();
        registry.register("docs", DatabaseType::Vector, "u1").unwrap();

        assert!(matches!(
            registry.grant_access("docs", "u1", "u2", Role::Owner),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            registry.grant_access("docs", "u1", "u1", Role::Reader),
            Err(Error::InvalidInput(_))
        ));

        registry.grant_access("docs", "u1", "u2", Role::Writer).unwrap();
        assert!(matches!(
            registry.grant_access("docs", "u2", "u3", Role::Reader),
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(
            registry.set_visibility("docs", "u2", Visibility::Public),
            Err(Error::Forbidden(_))
        ));

        // Explicit grants set the role exactly, including downgrades.
        registry.grant_access("docs", "u1", "u2", Role::Reader).unwrap();
        assert_eq!(registry.user_role("docs", "u2").unwrap(), Some(Role::Reader));
        assert_eq!(registry.list_grants("docs").unwrap().len(), 1);
    }

    #[test]
    fn test_revoke_access_notifies_revoked_user() {
        let (registry, store) = registry();
        registry.register("docs", DatabaseType::Vector, "u1").unwrap();
        registry.grant_access("docs", "u1", "u2", Role::Reader).unwrap();
        registry.grant_access("docs", "u1", "u3", Role::Reader).unwrap();

        assert!(matches!(
            registry.revoke_access("docs", "u3", "u2"),
            Err(Error::Forbidden(_))
        ));
        assert!(registry.revoke_access("docs", "u1", "u2").unwrap());
        assert!(!registry.revoke_access("docs", "u1", "u2").unwrap());

        let inbox = store.list_notifications("u2", false).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].kind, NotificationKind::AccessRevoked);
        assert_eq!(inbox[0].data["revoked_by"], "u1");

        // Leaving a database is silent.
        assert!(registry.revoke_access("docs", "u3", "u3").unwrap());
        assert!(store.list_notifications("u3", false).unwrap().is_empty());
        assert_eq!(registry.user_role("docs", "u3").unwrap(), None);
    }

    #[test]
    fn test_update_stats() {
        let (registry, _) = registry();
        registry.register("docs", DatabaseType::Vector, "u1").unwrap();

        let db = registry.update_stats("docs", 42, 4096).unwrap();
        assert_eq!((db.item_count, db.size_bytes), (42, 4096));
        assert!(matches!(
            registry.update_stats("docs", -1, 0),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            registry.update_stats("missing", 1, 1),
            Err(Error::NotFound(_))
        ));
    }
}
