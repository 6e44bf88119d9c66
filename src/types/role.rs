use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A role on a database. Ordered: owner > writer > reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Reader = 1,
    Writer = 2,
    Owner = 3,
}

/// Something a subject may attempt on a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Write,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    #[default]
    Private,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Reader, Role::Writer, Role::Owner];

    /// Position in the role hierarchy (owner=3, writer=2, reader=1).
    #[must_use]
    pub const fn level(self) -> i64 {
        self as i64
    }

    pub fn from_level(level: i64) -> Option<Role> {
        match level {
            1 => Some(Role::Reader),
            2 => Some(Role::Writer),
            3 => Some(Role::Owner),
            _ => None,
        }
    }

    /// Actions this role is allowed to perform.
    #[must_use]
    pub const fn actions(self) -> &'static [Action] {
        match self {
            Role::Owner => &[Action::Read, Action::Write, Action::Admin],
            Role::Writer => &[Action::Read, Action::Write],
            Role::Reader => &[Action::Read],
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Reader => "reader",
            Role::Writer => "writer",
            Role::Owner => "owner",
        }
    }
}

impl Action {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Write => "write",
            Action::Admin => "admin",
        }
    }
}

impl Visibility {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }
}

#[must_use]
pub fn role_allows_action(role: Role, action: Action) -> bool {
    role.actions().contains(&action)
}

#[must_use]
pub fn role_is_higher_or_equal(a: Role, b: Role) -> bool {
    a.level() >= b.level()
}

#[must_use]
pub fn minimum_role_for_action(action: Action) -> Role {
    match action {
        Action::Admin => Role::Owner,
        Action::Write => Role::Writer,
        Action::Read => Role::Reader,
    }
}

/// Public databases are readable by anyone. Everything else needs a role
/// whose action set contains the requested action.
#[must_use]
pub fn can_access_database(visibility: Visibility, role: Option<Role>, action: Action) -> bool {
    if visibility == Visibility::Public && action == Action::Read {
        return true;
    }
    role.is_some_and(|r| role_allows_action(r, action))
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reader" => Ok(Role::Reader),
            "writer" => Ok(Role::Writer),
            "owner" => Ok(Role::Owner),
            _ => Err(Error::InvalidInput(format!("unknown role '{s}'"))),
        }
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Action::Read),
            "write" => Ok(Action::Write),
            "admin" => Ok(Action::Admin),
            _ => Err(Error::InvalidInput(format!("unknown action '{s}'"))),
        }
    }
}

impl FromStr for Visibility {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            _ => Err(Error::InvalidInput(format!("unknown visibility '{s}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACTIONS: [Action; 3] = [Action::Read, Action::Write, Action::Admin];

    #[test]
    fn test_role_hierarchy_levels() {
        assert_eq!(Role::Owner.level(), 3);
        assert_eq!(Role::Writer.level(), 2);
        assert_eq!(Role::Reader.level(), 1);
        assert_eq!(Role::from_level(2), Some(Role::Writer));
        assert_eq!(Role::from_level(0), None);
    }

    #[test]
    fn test_role_is_reflexive_and_total() {
        for a in Role::ALL {
            assert!(role_is_higher_or_equal(a, a));
            for b in Role::ALL {
                assert!(role_is_higher_or_equal(a, b) || role_is_higher_or_equal(b, a));
            }
        }
        assert!(role_is_higher_or_equal(Role::Owner, Role::Reader));
        assert!(!role_is_higher_or_equal(Role::Reader, Role::Writer));
    }

    #[test]
    fn test_action_sets_are_nested() {
        for action in ACTIONS {
            if role_allows_action(Role::Reader, action) {
                assert!(role_allows_action(Role::Writer, action));
            }
            if role_allows_action(Role::Writer, action) {
                assert!(role_allows_action(Role::Owner, action));
            }
        }
        assert!(role_allows_action(Role::Owner, Action::Admin));
        assert!(!role_allows_action(Role::Writer, Action::Admin));
        assert!(!role_allows_action(Role::Reader, Action::Write));
    }

    #[test]
    fn test_minimum_role_allows_action() {
        for action in ACTIONS {
            let min = minimum_role_for_action(action);
            assert!(role_allows_action(min, action));
            for role in Role::ALL {
                assert_eq!(
                    role_allows_action(role, action),
                    role_is_higher_or_equal(role, min)
                );
            }
        }
    }

    #[test]
    fn test_public_read_without_role() {
        assert!(can_access_database(Visibility::Public, None, Action::Read));
        assert!(!can_access_database(Visibility::Public, None, Action::Write));
        assert!(!can_access_database(Visibility::Private, None, Action::Read));
        assert!(can_access_database(
            Visibility::Public,
            Some(Role::Writer),
            Action::Write
        ));
        assert!(!can_access_database(
            Visibility::Private,
            Some(Role::Writer),
            Action::Admin
        ));
    }

    #[test]
    fn test_parse_role() {
        assert_eq!("writer".parse::<Role>().unwrap(), Role::Writer);
        assert!("admin".parse::<Role>().is_err());
        assert_eq!("public".parse::<Visibility>().unwrap(), Visibility::Public);
    }
}
