use std::collections::BTreeSet;

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::SharingService;
use super::notifications::build_notification;
use super::sharing::{validate_lifetime, validate_shared_role};
use crate::auth::parse_token;
use crate::error::{Error, Result};
use crate::store::TokenRedemption;
use crate::types::{AccessToken, Action, NotificationKind, PermissionGrant, Role};
use crate::validation::validate_user;

const MAX_DESCRIPTION_LEN: usize = 256;
const MAX_LOOKUP_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct TokenOptions {
    /// Overrides the configured token lifetime.
    pub expires_in: Option<Duration>,
    /// Unlimited when unset.
    pub max_uses: Option<i64>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Redemption {
    /// False when the redeemer already owns the database.
    pub granted: bool,
    pub role: Role,
    pub database_name: String,
}

impl SharingService {
    /// Issues a bearer token for `database`. The raw token is returned once
    /// and never stored.
    pub fn generate_token(
        &self,
        database: &str,
        issuer: &str,
        role: Role,
        options: TokenOptions,
    ) -> Result<(AccessToken, String)> {
        validate_shared_role(role)?;
        validate_lifetime(options.expires_in)?;
        if options.max_uses.is_some_and(|n| n < 1) {
            return Err(Error::InvalidInput("max_uses must be at least 1".to_string()));
        }
        if options
            .description
            .as_ref()
            .is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN)
        {
            return Err(Error::InvalidInput(format!(
                "token description cannot exceed {MAX_DESCRIPTION_LEN} characters"
            )));
        }

        let db = self
            .registry
            .require_access(database, Some(issuer), Action::Admin)?;
        let now = Utc::now();
        let expires_at = now + options.expires_in.unwrap_or_else(|| self.config.token_ttl());

        let mut attempt = 0;
        loop {
            attempt += 1;
            let generated = self.tokens.generate()?;
            let token = AccessToken {
                id: Uuid::new_v4().to_string(),
                token_hash: generated.hash,
                token_lookup: generated.lookup,
                database_name: db.name.clone(),
                issuer: issuer.to_string(),
                role,
                active: true,
                description: options.description.clone(),
                created_at: now,
                expires_at,
                revoked_at: None,
                usage_count: 0,
                max_uses: options.max_uses,
                used_by: BTreeSet::new(),
            };

            match self.store.create_token(&token) {
                Ok(()) => {
                    info!("Issued {role} token {} for '{database}'", token.id);
                    return Ok((token, generated.raw));
                }
                Err(Error::TokenLookupCollision) if attempt < MAX_LOOKUP_ATTEMPTS => {
                    warn!("Token lookup collision, regenerating");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Redeems a raw token for `user`. Validity check, usage increment and
    /// grant happen in one store transaction, so `max_uses` is never exceeded.
    pub fn redeem(&self, raw_token: &str, user: &str) -> Result<Redemption> {
        validate_user(user, "user")?;
        let parts = parse_token(raw_token)?;

        let token = self
            .store
            .get_token_by_lookup(parts.lookup)?
            .ok_or(Error::TokenInvalid)?;
        if !self.tokens.verify(raw_token, &token.token_hash)? {
            return Err(Error::TokenInvalid);
        }

        let db = self.registry.get(&token.database_name)?;
        let now = Utc::now();
        let is_owner = db.owner == user;
        let grant = (!is_owner).then(|| PermissionGrant {
            database_name: db.name.clone(),
            user: user.to_string(),
            role: token.role,
            created_at: now,
            updated_at: now,
        });

        let notification = build_notification(
            &token.issuer,
            NotificationKind::TokenUsed,
            format!("{user} used your access token for '{}'", db.name),
            [
                ("token_id", token.id.clone()),
                ("database_name", db.name.clone()),
                ("redeemed_by", user.to_string()),
            ],
        );

        let updated = self.store.redeem_token(&TokenRedemption {
            token_id: token.id.clone(),
            user: user.to_string(),
            at: now,
            grant,
            notification,
        })?;
        info!(
            "{user} redeemed token {} for '{}' ({} uses)",
            updated.id, db.name, updated.usage_count
        );

        Ok(Redemption {
            granted: !is_owner,
            role: if is_owner { Role::Owner } else { token.role },
            database_name: db.name,
        })
    }

    /// Deactivates a token. Idempotent: returns false if it was already
    /// inactive. Users who redeemed it are notified on the first revoke.
    /// Grants obtained through the token are kept.
    pub fn revoke_token(&self, id: &str, actor: &str) -> Result<bool> {
        let token = self.get_token(id)?;
        if token.issuer != actor {
            let db = self.registry.get(&token.database_name)?;
            if db.owner != actor {
                return Err(Error::Forbidden(format!(
                    "{actor} cannot revoke access token '{id}'"
                )));
            }
        }

        let notifications: Vec<_> = token
            .used_by
            .iter()
            .map(|user| {
                build_notification(
                    user,
                    NotificationKind::TokenRevoked,
                    format!(
                        "An access token you used for '{}' was revoked",
                        token.database_name
                    ),
                    [
                        ("token_id", token.id.clone()),
                        ("database_name", token.database_name.clone()),
                        ("revoked_by", actor.to_string()),
                    ],
                )
            })
            .collect();

        let revoked = self.store.deactivate_token(id, Utc::now(), &notifications)?;
        if revoked {
            info!("{actor} revoked token {id}");
        }
        Ok(revoked)
    }

    pub fn get_token(&self, id: &str) -> Result<AccessToken> {
        self.store
            .get_token_by_id(id)?
            .ok_or_else(|| Error::not_found("access token", id))
    }

    /// Tokens issued for a database, newest first. Requires admin access.
    pub fn list_tokens(&self, database: &str, actor: &str) -> Result<Vec<AccessToken>> {
        self.registry
            .require_access(database, Some(actor), Action::Admin)?;
        self.store.list_tokens(database)
    }

    /// Marks every expired token inactive. Returns how many changed.
    pub fn deactivate_expired(&self) -> Result<usize> {
        let count = self.store.deactivate_expired_tokens(Utc::now())?;
        if count > 0 {
            info!("Deactivated {count} expired tokens");
        }
        Ok(count)
    }
}
