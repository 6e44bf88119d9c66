use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::info;
use uuid::Uuid;

use super::DatabaseRegistry;
use super::notifications::build_notification;
use crate::auth::TokenGenerator;
use crate::config::SharingConfig;
use crate::error::{Error, Result};
use crate::store::{InvitationFilter, InvitationTransition, Store};
use crate::types::{
    Action, InvitationStatus, NotificationKind, PermissionGrant, Role, ShareInvitation,
};
use crate::validation::validate_user;

const MAX_MESSAGE_LEN: usize = 1000;

#[derive(Debug, Clone, Default)]
pub struct InvitationOptions {
    /// Overrides the configured invitation lifetime.
    pub expires_in: Option<Duration>,
    pub message: Option<String>,
}

/// Delegation of database access through invitations and bearer tokens.
/// Every state change stores its notification in the same transaction.
#[derive(Clone)]
pub struct SharingService {
    pub(super) store: Arc<dyn Store>,
    pub(super) registry: DatabaseRegistry,
    pub(super) tokens: Arc<TokenGenerator>,
    pub(super) config: SharingConfig,
}

pub(super) fn validate_shared_role(role: Role) -> Result<()> {
    if role == Role::Owner {
        return Err(Error::InvalidInput(
            "ownership cannot be shared; use reader or writer".to_string(),
        ));
    }
    Ok(())
}

pub(super) fn validate_lifetime(expires_in: Option<Duration>) -> Result<()> {
    if expires_in.is_some_and(|d| d <= Duration::zero()) {
        return Err(Error::InvalidInput("expiry must be in the future".to_string()));
    }
    Ok(())
}

impl SharingService {
    pub fn new(store: Arc<dyn Store>, registry: DatabaseRegistry, config: SharingConfig) -> Self {
        Self {
            store,
            registry,
            tokens: Arc::new(TokenGenerator::new()),
            config,
        }
    }

    /// Invites `invitee` to `database` with `role`. The inviter needs admin
    /// access; the invitee is notified.
    pub fn create_invitation(
        &self,
        database: &str,
        inviter: &str,
        invitee: &str,
        role: Role,
        options: InvitationOptions,
    ) -> Result<ShareInvitation> {
        validate_user(invitee, "invitee")?;
        validate_shared_role(role)?;
        validate_lifetime(options.expires_in)?;
        let message = options
            .message
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());
        if message.as_ref().is_some_and(|m| m.len() > MAX_MESSAGE_LEN) {
            return Err(Error::InvalidInput(format!(
                "invitation message cannot exceed {MAX_MESSAGE_LEN} characters"
            )));
        }

        let db = self
            .registry
            .require_access(database, Some(inviter), Action::Admin)?;
        if invitee == db.owner {
            return Err(Error::InvalidInput(format!(
                "{invitee} already owns database '{database}'"
            )));
        }

        let now = Utc::now();
        let invitation = ShareInvitation {
            id: Uuid::new_v4().to_string(),
            database_name: db.name.clone(),
            inviter: inviter.to_string(),
            invitee: invitee.to_string(),
            role,
            status: InvitationStatus::Pending,
            message,
            created_at: now,
            expires_at: options
                .expires_in
                .or_else(|| self.config.invitation_ttl())
                .map(|ttl| now + ttl),
            accepted_at: None,
            responded_at: None,
            revoked_at: None,
        };

        let notification = build_notification(
            invitee,
            NotificationKind::InvitationReceived,
            format!("{inviter} invited you to '{database}' as {role}"),
            [
                ("invitation_id", invitation.id.clone()),
                ("database_name", db.name.clone()),
                ("inviter", inviter.to_string()),
                ("role", role.to_string()),
            ],
        );

        self.store.create_invitation(&invitation, &notification)?;
        info!("Invited {invitee} to '{database}' as {role}");
        Ok(invitation)
    }

    pub fn get_invitation(&self, id: &str) -> Result<ShareInvitation> {
        self.store
            .get_invitation(id)?
            .ok_or_else(|| Error::not_found("invitation", id))
    }

    fn pending_invitation(&self, id: &str) -> Result<ShareInvitation> {
        let invitation = self.get_invitation(id)?;
        if invitation.status.is_terminal() {
            return Err(Error::AlreadyTerminal {
                what: format!("invitation '{id}'"),
                status: invitation.status.to_string(),
            });
        }
        Ok(invitation)
    }

    /// Accepts a pending invitation and grants its role. An existing higher
    /// grant is kept.
    pub fn accept(&self, id: &str, user: &str) -> Result<ShareInvitation> {
        let invitation = self.pending_invitation(id)?;
        if invitation.invitee != user {
            return Err(Error::Forbidden(format!(
                "invitation '{id}' was not sent to {user}"
            )));
        }
        let now = Utc::now();
        if invitation.is_expired(now) {
            return Err(Error::InvitationExpired(id.to_string()));
        }

        let db = self.registry.get(&invitation.database_name)?;
        let grant = (db.owner != user).then(|| PermissionGrant {
            database_name: db.name.clone(),
            user: user.to_string(),
            role: invitation.role,
            created_at: now,
            updated_at: now,
        });

        let notification = build_notification(
            &invitation.inviter,
            NotificationKind::InvitationAccepted,
            format!("{user} accepted your invitation to '{}'", db.name),
            [
                ("invitation_id", id.to_string()),
                ("database_name", db.name.clone()),
                ("invitee", user.to_string()),
                ("role", invitation.role.to_string()),
            ],
        );

        let accepted = self.store.transition_invitation(&InvitationTransition {
            id: id.to_string(),
            to: InvitationStatus::Accepted,
            at: now,
            grant,
            notification,
        })?;
        info!("{user} accepted invitation {id} to '{}'", db.name);
        Ok(accepted)
    }

    /// Declines a pending invitation. Expired invitations may still be declined.
    pub fn decline(&self, id: &str, user: &str) -> Result<ShareInvitation> {
        let invitation = self.pending_invitation(id)?;
        if invitation.invitee != user {
            return Err(Error::Forbidden(format!(
                "invitation '{id}' was not sent to {user}"
            )));
        }

        let notification = build_notification(
            &invitation.inviter,
            NotificationKind::InvitationRejected,
            format!(
                "{user} declined your invitation to '{}'",
                invitation.database_name
            ),
            [
                ("invitation_id", id.to_string()),
                ("database_name", invitation.database_name.clone()),
                ("invitee", user.to_string()),
            ],
        );

        let declined = self.store.transition_invitation(&InvitationTransition {
            id: id.to_string(),
            to: InvitationStatus::Rejected,
            at: Utc::now(),
            grant: None,
            notification,
        })?;
        info!("{user} declined invitation {id}");
        Ok(declined)
    }

    pub fn reject(&self, id: &str, user: &str) -> Result<ShareInvitation> {
        self.decline(id, user)
    }

    /// Withdraws a pending invitation. Allowed for the inviter and the
    /// database owner.
    pub fn revoke(&self, id: &str, actor: &str) -> Result<ShareInvitation> {
        let invitation = self.pending_invitation(id)?;
        if invitation.inviter != actor {
            let db = self.registry.get(&invitation.database_name)?;
            if db.owner != actor {
                return Err(Error::Forbidden(format!(
                    "{actor} cannot revoke invitation '{id}'"
                )));
            }
        }

        let notification = build_notification(
            &invitation.invitee,
            NotificationKind::InvitationRevoked,
            format!(
                "Your invitation to '{}' was revoked",
                invitation.database_name
            ),
            [
                ("invitation_id", id.to_string()),
                ("database_name", invitation.database_name.clone()),
                ("revoked_by", actor.to_string()),
            ],
        );

        let revoked = self.store.transition_invitation(&InvitationTransition {
            id: id.to_string(),
            to: InvitationStatus::Revoked,
            at: Utc::now(),
            grant: None,
            notification,
        })?;
        info!("{actor} revoked invitation {id}");
        Ok(revoked)
    }

    /// Invitations addressed to `user`, newest first.
    pub fn list_received(
        &self,
        user: &str,
        status: Option<InvitationStatus>,
    ) -> Result<Vec<ShareInvitation>> {
        self.store.list_invitations(&InvitationFilter {
            invitee: Some(user.to_string()),
            status,
            ..InvitationFilter::default()
        })
    }

    pub fn list_sent(&self, user: &str) -> Result<Vec<ShareInvitation>> {
        self.store.list_invitations(&InvitationFilter {
            inviter: Some(user.to_string()),
            ..InvitationFilter::default()
        })
    }

    /// All invitations for a database. Requires admin access.
    pub fn list_for_database(&self, database: &str, actor: &str) -> Result<Vec<ShareInvitation>> {
        self.registry
            .require_access(database, Some(actor), Action::Admin)?;
        self.store.list_invitations(&InvitationFilter {
            database_name: Some(database.to_string()),
            ..InvitationFilter::default()
        })
    }
}

#[cfg(test)]
pub(super) mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::types::DatabaseType;

    pub(in crate::service) fn sharing() -> (SharingService, Arc<dyn Store>) {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        let store: Arc<dyn Store> = Arc::new(store);
        let registry = DatabaseRegistry::new(store.clone());
        registry.register("docs", DatabaseType::Vector, "u1").unwrap();
        let service = SharingService::new(store.clone(), registry, SharingConfig::default());
        (service, store)
    }

    fn invite(svc: &SharingService, invitee: &str, role: Role) -> ShareInvitation {
        svc.create_invitation("docs", "u1", invitee, role, InvitationOptions::default())
            .unwrap()
    }

    #[test]
    fn test_create_invitation_notifies_invitee() {
        let (svc, store) = sharing();
        let inv = svc
            .create_invitation(
                "docs",
                "u1",
                "u2",
                Role::Writer,
                InvitationOptions {
                    message: Some("  join us  ".to_string()),
                    ..InvitationOptions::default()
                },
            )
            .unwrap();

        assert_eq!(inv.status, InvitationStatus::Pending);
        assert_eq!(inv.message.as_deref(), Some("join us"));
        let ttl = inv.expires_at.unwrap() - inv.created_at;
        assert_eq!(ttl, Duration::hours(168));

        let inbox = store.list_notifications("u2", false).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].kind, NotificationKind::InvitationReceived);
        assert_eq!(inbox[0].data["invitation_id"], inv.id.as_str());
        assert_eq!(inbox[0].data["role"], "writer");
    }

    #[test]
    fn test_create_invitation_rules() {
        let (svc, _) = sharing();
        let opts = InvitationOptions::default;

        assert!(matches!(
            svc.create_invitation("docs", "u1", "u2", Role::Owner, opts()),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            svc.create_invitation("docs", "u1", "u1", Role::Reader, opts()),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            svc.create_invitation("docs", "u2", "u3", Role::Reader, opts()),
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(
            svc.create_invitation("missing", "u1", "u3", Role::Reader, opts()),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            svc.create_invitation(
                "docs",
                "u1",
                "u3",
                Role::Reader,
                InvitationOptions {
                    expires_in: Some(Duration::seconds(-5)),
                    ..opts()
                }
            ),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_accept_grants_role_once() {
        let (svc, store) = sharing();
        let inv = invite(&svc, "u2", Role::Writer);

        assert!(matches!(svc.accept(&inv.id, "u3"), Err(Error::Forbidden(_))));

        let accepted = svc.accept(&inv.id, "u2").unwrap();
        assert_eq!(accepted.status, InvitationStatus::Accepted);
        assert!(accepted.accepted_at.is_some());
        assert_eq!(svc.registry.user_role("docs", "u2").unwrap(), Some(Role::Writer));

        assert!(matches!(
            svc.accept(&inv.id, "u2"),
            Err(Error::AlreadyTerminal { .. })
        ));
        assert!(matches!(svc.revoke(&inv.id, "u1"), Err(Error::AlreadyTerminal { .. })));

        let inbox = store.list_notifications("u1", false).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].kind, NotificationKind::InvitationAccepted);
    }

    #[test]
    fn test_accept_never_downgrades() {
        let (svc, _) = sharing();
        svc.registry
            .grant_access("docs", "u1", "u2", Role::Writer)
            .unwrap();
        let inv = invite(&svc, "u2", Role::Reader);

        svc.accept(&inv.id, "u2").unwrap();
        assert_eq!(svc.registry.user_role("docs", "u2").unwrap(), Some(Role::Writer));
    }

    #[test]
    fn test_decline_and_revoke() {
        let (svc, store) = sharing();
        let declined = invite(&svc, "u2", Role::Reader);
        let revoked = invite(&svc, "u3", Role::Reader);

        assert!(matches!(svc.decline(&declined.id, "u3"), Err(Error::Forbidden(_))));
        let result = svc.reject(&declined.id, "u2").unwrap();
        assert_eq!(result.status, InvitationStatus::Rejected);
        assert!(result.responded_at.is_some());
        assert_eq!(svc.registry.user_role("docs", "u2").unwrap(), None);

        assert!(matches!(svc.revoke(&revoked.id, "u3"), Err(Error::Forbidden(_))));
        let result = svc.revoke(&revoked.id, "u1").unwrap();
        assert_eq!(result.status, InvitationStatus::Revoked);
        assert!(matches!(
            svc.accept(&revoked.id, "u3"),
            Err(Error::AlreadyTerminal { .. })
        ));

        let u3_inbox = store.list_notifications("u3", false).unwrap();
        let kinds: Vec<NotificationKind> = u3_inbox.iter().map(|n| n.kind).collect();
        assert!(kinds.contains(&NotificationKind::InvitationRevoked));
        let u1_inbox = store.list_notifications("u1", false).unwrap();
        assert_eq!(u1_inbox[0].kind, NotificationKind::InvitationRejected);
    }

    #[test]
    fn test_expired_invitation() {
        let (svc, _) = sharing();
        let inv = svc
            .create_invitation(
                "docs",
                "u1",
                "u2",
                Role::Reader,
                InvitationOptions {
                    expires_in: Some(Duration::milliseconds(1)),
                    ..InvitationOptions::default()
                },
            )
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        assert!(matches!(
            svc.accept(&inv.id, "u2"),
            Err(Error::InvitationExpired(_))
        ));
        assert_eq!(svc.get_invitation(&inv.id).unwrap().status, InvitationStatus::Pending);
        assert_eq!(svc.revoke(&inv.id, "u1").unwrap().status, InvitationStatus::Revoked);
    }

    #[test]
    fn test_never_expiring_invitations() {
        let (svc, store) = sharing();
        let svc = SharingService {
            config: SharingConfig {
                invitation_ttl_hours: 0,
                ..SharingConfig::default()
            },
            ..svc
        };
        let inv = invite(&svc, "u2", Role::Reader);
        assert!(inv.expires_at.is_none());
        assert!(store.get_invitation(&inv.id).unwrap().unwrap().expires_at.is_none());
    }

    #[test]
    fn test_listing() {
        let (svc, _) = sharing();
        let first = invite(&svc, "u2", Role::Reader);
        invite(&svc, "u3", Role::Writer);
        svc.accept(&first.id, "u2").unwrap();

        assert_eq!(svc.list_received("u2", None).unwrap().len(), 1);
        assert!(
            svc.list_received("u2", Some(InvitationStatus::Pending))
                .unwrap()
                .is_empty()
        );
        assert_eq!(svc.list_sent("u1").unwrap().len(), 2);
        assert_eq!(svc.list_for_database("docs", "u1").unwrap().len(), 2);
        assert!(matches!(
            svc.list_for_database("docs", "u2"),
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(svc.get_invitation("nope"), Err(Error::NotFound(_))));
    }
}
