//! Virtual folder paths.
//!
//! Paths are absolute, `/`-separated and case-sensitive. The root `/` is
//! implicit in every database and has no parent.

use crate::error::{Error, Result};

pub const ROOT: &str = "/";
pub const MAX_DEPTH: usize = 10;
pub const MAX_NAME_LEN: usize = 255;

fn is_valid_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '(' | ')' | ' ')
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Produces the canonical form of a path. Never fails: empty input becomes `/`.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = segments(path.trim()).collect();
    format!("/{}", segments.join("/"))
}

/// Validates a single folder name and returns it trimmed.
pub fn validate_folder_name(name: &str) -> Result<String> {
    let invalid = |reason: &str| Error::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = name.trim();

    if trimmed.is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if trimmed == "." || trimmed == ".." {
        return Err(invalid("name cannot be '.' or '..'"));
    }
    if trimmed.len() > MAX_NAME_LEN {
        return Err(invalid("name cannot exceed 255 characters"));
    }
    if let Some(c) = trimmed.chars().find(|c| !is_valid_name_char(*c)) {
        return Err(invalid(&format!(
            "character {c:?} is not allowed; use letters, digits, spaces, '-', '_', '.', '(' or ')'"
        )));
    }

    Ok(trimmed.to_string())
}

/// Validates a path and returns its normalized form.
pub fn validate_path(path: &str) -> Result<String> {
    if path.trim().is_empty() {
        return Err(Error::InvalidPath {
            path: path.to_string(),
            reason: "path cannot be empty".to_string(),
        });
    }

    let normalized = normalize_path(path);
    if normalized == ROOT {
        return Ok(normalized);
    }

    let parts: Vec<&str> = segments(&normalized).collect();

    if parts.iter().any(|s| s.contains("..")) {
        return Err(Error::InvalidPath {
            path: path.to_string(),
            reason: "path cannot contain '..'".to_string(),
        });
    }

    let depth = parts.len();
    if depth > MAX_DEPTH {
        return Err(Error::MaxDepthExceeded {
            path: normalized.clone(),
            depth,
            max: MAX_DEPTH,
        });
    }

    let names = parts
        .iter()
        .map(|part| validate_folder_name(part))
        .collect::<Result<Vec<_>>>()?;

    Ok(format!("/{}", names.join("/")))
}

/// Number of segments below the root.
#[must_use]
pub fn depth(path: &str) -> usize {
    segments(path).count()
}

#[must_use]
pub fn parent_path(path: &str) -> Option<String> {
    let normalized = normalize_path(path);
    if normalized == ROOT {
        return None;
    }
    match normalized.rfind('/') {
        Some(0) | None => Some(ROOT.to_string()),
        Some(idx) => Some(normalized[..idx].to_string()),
    }
}

/// Every ancestor from the root down, excluding the path itself.
#[must_use]
pub fn ancestor_paths(path: &str) -> Vec<String> {
    let mut ancestors = Vec::new();
    let mut current = parent_path(path);
    while let Some(p) = current {
        current = parent_path(&p);
        ancestors.push(p);
    }
    ancestors.reverse();
    ancestors
}

#[must_use]
pub fn join_path(parent: &str, name: &str) -> String {
    normalize_path(&format!("{}/{}", normalize_path(parent), name))
}

/// Last segment of the path; empty for the root.
#[must_use]
pub fn folder_name(path: &str) -> String {
    segments(path).last().unwrap_or_default().to_string()
}

/// True if `child` lies strictly beneath `parent`.
#[must_use]
pub fn is_sub_path(child: &str, parent: &str) -> bool {
    let child = normalize_path(child);
    let parent = normalize_path(parent);

    if child == parent {
        return false;
    }
    if parent == ROOT {
        return true;
    }
    child.starts_with(&format!("{parent}/"))
}
