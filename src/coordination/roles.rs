//! Node roles and role-based task eligibility

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Healer and Governor
    System,
    Media,
    Web,
    Broadcaster,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::System, Role::Media, Role::Web, Role::Broadcaster];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::Media => "media",
            Role::Web => "web",
            Role::Broadcaster => "broadcaster",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(Role::System),
            "media" => Ok(Role::Media),
            "web" => Ok(Role::Web),
            "broadcaster" => Ok(Role::Broadcaster),
            other => Err(Error::InvalidConfig(format!("unknown role: {}", other))),
        }
    }
}

/// The roles a node holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleSet(BTreeSet<Role>);

impl RoleSet {
    pub fn all() -> Self {
        Self(Role::ALL.into_iter().collect())
    }

    /// Parse a comma-separated list. Empty or missing input means every role.
    pub fn parse(input: Option<&str>) -> Result<Self> {
        let Some(input) = input.filter(|s| !s.trim().is_empty()) else {
            return Ok(Self::all());
        };
        let roles = input
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(Role::from_str)
            .collect::<Result<BTreeSet<_>>>()?;
        if roles.is_empty() {
            return Ok(Self::all());
        }
        Ok(Self(roles))
    }

    pub fn contains(&self, role: Role) -> bool {
        self.0.contains(&role)
    }

    /// A task without a required role can run anywhere.
    pub fn can_handle(&self, required: Option<Role>) -> bool {
        required.map_or(true, |role| self.contains(role))
    }

    pub fn iter(&self) -> impl Iterator<Item = Role> + '_ {
        self.0.iter().copied()
    }
}

impl Default for RoleSet {
    fn default() -> Self {
        Self::all()
    }
}

impl FromIterator<Role> for RoleSet {
    fn from_iter<I: IntoIterator<Item = Role>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for RoleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(Role::as_str).collect();
        f.write_str(&names.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_roles_mean_all() {
        assert_eq!(RoleSet::parse(None).unwrap(), RoleSet::all());
        assert_eq!(RoleSet::parse(Some("  ")).unwrap(), RoleSet::all());
    }

    #[test]
    fn test_parse_is_case_insensitive_and_trims() {
        let roles = RoleSet::parse(Some("System, media,")).unwrap();
        assert!(roles.contains(Role::System));
        assert!(roles.contains(Role::Media));
        assert!(!roles.contains(Role::Web));
        assert_eq!(roles.to_string(), "system,media");
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        assert!(RoleSet::parse(Some("system,gpu")).is_err());
    }

    #[test]
    fn test_can_handle() {
        let roles = RoleSet::parse(Some("web")).unwrap();
        assert!(roles.can_handle(None));
        assert!(roles.can_handle(Some(Role::Web)));
        assert!(!roles.can_handle(Some(Role::System)));
    }
}
