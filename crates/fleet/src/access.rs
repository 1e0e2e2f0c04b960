use std::collections::HashSet;

use crate::error::{Error, Result};

/// Static allow-list of owner ids permitted to run privileged commands.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    allowed: HashSet<String>,
}

impl AccessPolicy {
    pub fn new<I, S>(allowlist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: allowlist
                .into_iter()
                .map(|id| id.as_ref().trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
        }
    }

    #[must_use]
    pub fn from_config(config: &deskfarm_config::AccessConfig) -> Self {
        Self::new(&config.allowlist)
    }

    /// Whether `owner` is on the list. An empty list denies everyone.
    #[must_use]
    pub fn is_allowed(&self, owner: &str) -> bool {
        self.allowed.contains(owner.trim())
    }

    pub fn check(&self, owner: &str) -> Result<()> {
        if self.is_allowed(owner) {
            Ok(())
        } else {
            Err(Error::NotAuthorized(owner.to_string()))
        }
    }

    /// Allowed when `owner` is on the list or owns the instance.
    pub fn check_owner_or_allowed(&self, caller: &str, instance_owner: &str) -> Result<()> {
        if caller == instance_owner {
            return Ok(());
        }
        self.check(caller)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}
