//! Agent rollup ids
//!
//! A leaf id has no trailing delimiter. Ancestor ids are prefixes of a child
//! id cut at a delimiter boundary, keeping the trailing delimiter:
//! `"gp::parent::leaf"` has ancestors `"gp::parent::"` and `"gp::"`.

use std::fmt;

use crate::error::{Result, RollupError};

pub const DELIMITER: &str = "::";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AgentRollupId(String);

impl AgentRollupId {
    pub fn parse(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let body = id.strip_suffix(DELIMITER).unwrap_or(&id);
        if body.is_empty() || body.split(DELIMITER).any(str::is_empty) {
            return Err(RollupError::InvalidAgentRollupId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ids with a trailing delimiter are never leaves.
    pub fn is_leaf(&self) -> bool {
        !self.0.ends_with(DELIMITER)
    }

    /// Immediate parent, if any.
    pub fn parent(&self) -> Option<AgentRollupId> {
        let body = self.0.strip_suffix(DELIMITER).unwrap_or(&self.0);
        body.rfind(DELIMITER)
            .map(|idx| AgentRollupId(body[..idx + DELIMITER.len()].to_string()))
    }

    /// Ancestors, nearest first.
    pub fn ancestors(&self) -> Vec<AgentRollupId> {
        let mut ancestors = Vec::new();
        let mut current = self.parent();
        while let Some(id) = current {
            current = id.parent();
            ancestors.push(id);
        }
        ancestors
    }
}

impl fmt::Display for AgentRollupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AgentRollupId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
