//! Owner identity and storage key construction.
//!
//! A GitHub repository is parented either by an organization
//! (github.com/golang/go) or by a user account (github.com/jgwest/rogue-cloud).
//! `Owner` represents either parent. The owner name is the stable path prefix
//! for every key in the content store.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error returned when constructing an invalid owner name.
#[derive(Debug, Clone, Error)]
#[error("invalid owner name: {reason}: {name:?}")]
pub struct InvalidOwnerName {
    name: String,
    reason: &'static str,
}

/// An organization or user account that parents a set of repositories.
///
/// Immutable once constructed. Names are non-empty and contain no whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum Owner {
    Org(String),
    User(String),
}

impl Owner {
    /// Creates an organization owner, validating the name.
    pub fn org(name: impl Into<String>) -> Result<Self, InvalidOwnerName> {
        Ok(Owner::Org(validate_name(name.into())?))
    }

    /// Creates a user owner, validating the name.
    pub fn user(name: impl Into<String>) -> Result<Self, InvalidOwnerName> {
        Ok(Owner::User(validate_name(name.into())?))
    }

    /// Returns the owner name regardless of kind.
    pub fn name(&self) -> &str {
        match self {
            Owner::Org(name) | Owner::User(name) => name,
        }
    }

    /// Returns the name if this is an organization.
    pub fn org_name(&self) -> Option<&str> {
        match self {
            Owner::Org(name) => Some(name),
            Owner::User(_) => None,
        }
    }

    /// Returns the name if this is a user.
    pub fn user_name(&self) -> Option<&str> {
        match self {
            Owner::Org(_) => None,
            Owner::User(name) => Some(name),
        }
    }

    pub fn is_org(&self) -> bool {
        matches!(self, Owner::Org(_))
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Org(name) => write!(f, "org {}", name),
            Owner::User(name) => write!(f, "user {}", name),
        }
    }
}

fn validate_name(name: String) -> Result<String, InvalidOwnerName> {
    if name.is_empty() {
        return Err(InvalidOwnerName {
            name,
            reason: "empty",
        });
    }
    if name.chars().any(char::is_whitespace) {
        return Err(InvalidOwnerName {
            name,
            reason: "contains whitespace",
        });
    }
    Ok(name)
}

/// Key for an issue document: `<owner>/<repo>/<number>`.
pub fn issue_key(owner: &Owner, repo_name: &str, issue_number: i64) -> String {
    format!("{}/{}/{}", owner.name(), repo_name, issue_number)
}

/// Key for a repository document: `<owner>/<repo>`.
pub fn repo_key(owner: &Owner, repo_name: &str) -> String {
    format!("{}/{}", owner.name(), repo_name)
}

/// Key for an organization document.
pub fn org_key(org_name: &str) -> String {
    org_name.to_string()
}

/// Key for a user-repositories document.
pub fn user_repositories_key(user_name: &str) -> String {
    user_name.to_string()
}

/// Key for a user document: `users/<login>`.
pub fn user_key(login: &str) -> String {
    format!("users/{}", login)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn org_and_user_accessors() {
        let org = Owner::org("eclipse").unwrap();
        assert_eq!(org.name(), "eclipse");
        assert_eq!(org.org_name(), Some("eclipse"));
        assert_eq!(org.user_name(), None);
        assert!(org.is_org());

        let user = Owner::user("jgwest").unwrap();
        assert_eq!(user.name(), "jgwest");
        assert_eq!(user.org_name(), None);
        assert_eq!(user.user_name(), Some("jgwest"));
        assert!(!user.is_org());
    }

    #[test]
    fn rejects_empty_name() {
        assert!(Owner::org("").is_err());
        assert!(Owner::user("").is_err());
    }

    #[test]
    fn rejects_whitespace() {
        assert!(Owner::org("two words").is_err());
        assert!(Owner::user("tab\tname").is_err());
    }

    #[test]
    fn equality_distinguishes_kind() {
        let org = Owner::org("golang").unwrap();
        let user = Owner::user("golang").unwrap();
        assert_ne!(org, user);
        assert_eq!(org, Owner::org("golang").unwrap());
    }

    #[test]
    fn key_formats() {
        let owner = Owner::org("eclipse").unwrap();
        assert_eq!(issue_key(&owner, "che", 42), "eclipse/che/42");
        assert_eq!(repo_key(&owner, "che"), "eclipse/che");
        assert_eq!(user_key("octocat"), "users/octocat");
        assert_eq!(org_key("eclipse"), "eclipse");
        assert_eq!(user_repositories_key("jgwest"), "jgwest");
    }
}
