mod access;
mod token;

pub use access::{check_access, require_access, resolve_role};
pub use token::{GeneratedToken, TokenGenerator, TokenParts, parse_token};
