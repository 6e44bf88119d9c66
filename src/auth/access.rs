use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{Action, Database, Role, can_access_database};

/// Resolves the effective role of a user on a database.
/// The owner is always `Owner`, without consulting grants.
pub fn resolve_role(store: &dyn Store, db: &Database, user: &str) -> Result<Option<Role>> {
    if db.owner == user {
        return Ok(Some(Role::Owner));
    }

    let grant = store.get_grant(&db.name, user)?;
    Ok(grant.map(|g| g.role))
}

/// Returns true if the (possibly anonymous) user may perform `action` on the database.
pub fn check_access(
    store: &dyn Store,
    db: &Database,
    user: Option<&str>,
    action: Action,
) -> Result<bool> {
    let role = match user {
        Some(user) => resolve_role(store, db, user)?,
        None => None,
    };
    Ok(can_access_database(db.visibility, role, action))
}

/// Like `check_access`, returning a forbidden error if access is denied.
pub fn require_access(
    store: &dyn Store,
    db: &Database,
    user: Option<&str>,
    action: Action,
) -> Result<()> {
    if !check_access(store, db, user, action)? {
        return Err(Error::Forbidden(format!(
            "{} lacks {action} access to database '{}'",
            user.unwrap_or("anonymous user"),
            db.name
        )));
    }
    Ok(())
}
