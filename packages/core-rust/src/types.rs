use serde::{Deserialize, Serialize};

/// Authenticated caller on whose behalf an operation runs.
///
/// Authentication itself happens upstream (gateway, transport); the execution
/// core only carries the resolved identity through the operation and into
/// audit records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Unique identifier for the authenticated entity.
    pub id: String,
    /// Roles assigned to this principal for authorization checks.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Principal {
    /// Creates a principal with no roles.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: Vec::new(),
        }
    }

    /// Adds a role, returning the updated principal.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    /// Returns `true` if the principal carries the given role.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principal_roles() {
        let p = Principal::new("user-1").with_role("admin");
        assert!(p.has_role("admin"));
        assert!(!p.has_role("auditor"));
    }

    #[test]
    fn principal_deserializes_without_roles() {
        let p: Principal = serde_json::from_str(r#"{"id":"svc-7"}"#).unwrap();
        assert_eq!(p, Principal::new("svc-7"));
    }
}
