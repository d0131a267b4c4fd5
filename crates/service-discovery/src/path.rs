//! Node path helpers and protected child naming.
//!
//! Protected sequential children are named `_c_<token>-n<sequence>`, where
//! `token` is 32 hex characters chosen by the client and `sequence` is the
//! parent's counter padded to ten digits.

use rand::Rng;

use crate::store::{StoreError, StoreResult};

pub const PROTECTED_PREFIX: &str = "_c_";
/// Base name of endpoint nodes, placed before the sequence suffix.
pub const ENDPOINT_NODE_NAME: &str = "n";
pub const SEQUENCE_WIDTH: usize = 10;

/// Check that `path` is absolute, has no empty or relative components and no
/// trailing slash. `/` itself is valid.
pub fn validate(path: &str) -> StoreResult<()> {
    let invalid = |reason: &str| StoreError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    if !path.starts_with('/') {
        return Err(invalid("must start with '/'"));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(invalid("must not end with '/'"));
    }
    for component in path[1..].split('/') {
        match component {
            "" => return Err(invalid("empty component")),
            "." | ".." => return Err(invalid("relative component")),
            _ => {}
        }
    }
    Ok(())
}

/// Check a single path component such as a service name.
pub fn validate_name(name: &str) -> StoreResult<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(StoreError::InvalidPath {
            path: name.to_string(),
            reason: "not a single path component".to_string(),
        });
    }
    Ok(())
}

pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Parent of a validated path; `None` for `/`.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last component of a validated path.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Every ancestor of `path` below `/`, outermost first, ending with `path`.
pub fn lineage(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        current.push('/');
        current.push_str(component);
        out.push(current.clone());
    }
    out
}

/// Prefix matched against a directory listing when probing for children.
pub fn children_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    }
}

pub fn new_protection_token() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Child name without the sequence suffix, used to recognise our own node.
pub fn protected_stem(token: &str) -> String {
    format!("{PROTECTED_PREFIX}{token}-{ENDPOINT_NODE_NAME}")
}

pub fn protected_child_name(token: &str, sequence: u64) -> String {
    format!(
        "{}{:0width$}",
        protected_stem(token),
        sequence,
        width = SEQUENCE_WIDTH
    )
}

/// A parsed protected child name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedName<'a> {
    pub token: &'a str,
    pub sequence: u64,
}

pub fn parse_protected(name: &str) -> Option<ProtectedName<'_>> {
    let rest = name.strip_prefix(PROTECTED_PREFIX)?;
    let (token, tail) = rest.split_once('-')?;
    let digits = tail.strip_prefix(ENDPOINT_NODE_NAME)?;
    if token.is_empty() || digits.len() != SEQUENCE_WIDTH {
        return None;
    }
    let sequence = digits.parse().ok()?;
    Some(ProtectedName { token, sequence })
}

/// Find the child created with `token`, if a previous attempt did land.
pub fn find_protected_child<'a, I>(children: I, token: &str) -> Option<String>
where
    I: IntoIterator<Item = &'a String>,
{
    children
        .into_iter()
        .find(|child| parse_protected(child).is_some_and(|p| p.token == token))
        .cloned()
}
