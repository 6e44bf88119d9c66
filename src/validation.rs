use crate::error::{Error, Result};

const MAX_DATABASE_NAME_LEN: usize = 64;
const MAX_USER_LEN: usize = 256;

fn is_valid_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'
}

pub fn validate_database_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput("database name cannot be empty".to_string()));
    }
    if name.len() > MAX_DATABASE_NAME_LEN {
        return Err(Error::InvalidInput(format!(
            "database name '{name}' cannot exceed {MAX_DATABASE_NAME_LEN} characters"
        )));
    }
    if !name.chars().all(is_valid_name_char) {
        return Err(Error::InvalidInput(format!(
            "database name '{name}' can only contain alphanumeric characters, hyphens, underscores, and periods"
        )));
    }
    if name.starts_with(['-', '_', '.']) {
        return Err(Error::InvalidInput(format!(
            "database name '{name}' cannot start with a hyphen, underscore, or period"
        )));
    }
    Ok(())
}

/// User identifiers are opaque (wallet addresses, account ids), so only
/// emptiness, length and whitespace are checked.
pub fn validate_user(user: &str, field: &str) -> Result<()> {
    if user.trim().is_empty() {
        return Err(Error::InvalidInput(format!("{field} cannot be empty")));
    }
    if user.len() > MAX_USER_LEN {
        return Err(Error::InvalidInput(format!(
            "{field} cannot exceed {MAX_USER_LEN} characters"
        )));
    }
    if user.chars().any(char::is_whitespace) {
        return Err(Error::InvalidInput(format!(
            "{field} '{user}' cannot contain whitespace"
        )));
    }
    Ok(())
}
