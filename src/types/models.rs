use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Role, Visibility};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Vector,
    Graph,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
    pub db_type: DatabaseType,
    pub owner: String,
    pub visibility: Visibility,
    pub item_count: i64,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub database_name: String,
    pub user: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub database_name: String,
    pub path: String,
    pub name: String,
    pub file_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Rejected,
    Revoked,
}

impl InvitationStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != InvitationStatus::Pending
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareInvitation {
    pub id: String,
    pub database_name: String,
    pub inviter: String,
    pub invitee: String,
    pub role: Role,
    pub status: InvitationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ShareInvitation {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub id: String,
    #[serde(skip)]
    pub token_hash: String,
    #[serde(skip)]
    pub token_lookup: String,
    pub database_name: String,
    pub issuer: String,
    pub role: Role,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    pub usage_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_uses: Option<i64>,
    pub used_by: BTreeSet<String>,
}

impl AccessToken {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.max_uses.is_some_and(|max| self.usage_count >= max)
    }

    /// True while the token can still be redeemed.
    #[must_use]
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.is_expired(now) && !self.is_exhausted()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    InvitationReceived,
    InvitationAccepted,
    InvitationRejected,
    InvitationRevoked,
    TokenUsed,
    TokenRevoked,
    AccessRevoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user: String,
    pub kind: NotificationKind,
    pub message: String,
    pub data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub read: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $s),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($ty::$variant),)+
                    _ => Err(Error::InvalidInput(format!(
                        concat!("unknown ", stringify!($ty), " '{}'"),
                        s
                    ))),
                }
            }
        }
    };
}

string_enum!(DatabaseType {
    Vector => "vector",
    Graph => "graph",
});

string_enum!(InvitationStatus {
    Pending => "pending",
    Accepted => "accepted",
    Rejected => "rejected",
    Revoked => "revoked",
});

string_enum!(NotificationKind {
    InvitationReceived => "invitation_received",
    InvitationAccepted => "invitation_accepted",
    InvitationRejected => "invitation_rejected",
    InvitationRevoked => "invitation_revoked",
    TokenUsed => "token_used",
    TokenRevoked => "token_revoked",
    AccessRevoked => "access_revoked",
});

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn token(max_uses: Option<i64>, usage_count: i64) -> AccessToken {
        let now = Utc::now();
        AccessToken {
            id: "t1".to_string(),
            token_hash: String::new(),
            token_lookup: String::new(),
            database_name: "docs".to_string(),
            issuer: "u1".to_string(),
            role: Role::Reader,
            active: true,
            description: None,
            created_at: now,
            expires_at: now + Duration::hours(1),
            revoked_at: None,
            usage_count,
            max_uses,
            used_by: BTreeSet::new(),
        }
    }

    #[test]
    fn test_token_validity() {
        let now = Utc::now();
        assert!(token(None, 100).is_valid(now));
        assert!(token(Some(2), 1).is_valid(now));
        assert!(!token(Some(2), 2).is_valid(now));

        let mut inactive = token(None, 0);
        inactive.active = false;
        assert!(!inactive.is_valid(now));

        assert!(!token(None, 0).is_valid(now + Duration::hours(2)));
    }

    #[test]
    fn test_status_round_trip_strings() {
        assert_eq!(InvitationStatus::Revoked.as_str(), "revoked");
        assert_eq!(
            "token_used".parse::<NotificationKind>().unwrap(),
            NotificationKind::TokenUsed
        );
        assert!("sideways".parse::<InvitationStatus>().is_err());
        assert!(InvitationStatus::Accepted.is_terminal());
        assert!(!InvitationStatus::Pending.is_terminal());
    }
}
