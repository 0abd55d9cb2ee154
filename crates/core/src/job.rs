use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Group used when a job definition does not name one.
pub const DEFAULT_GROUP: &str = "DEFAULT";

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Identity of a schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub name: String,
    pub group: String,
}

impl JobKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Result<Self, CoreError> {
        let name = name.into();
        let group = group.into();
        if name.trim().is_empty() {
            return Err(CoreError::InvalidJobKey("job name must not be empty".into()));
        }
        if group.trim().is_empty() {
            return Err(CoreError::InvalidJobKey(format!("job '{name}' has an empty group")));
        }
        Ok(Self { name, group })
    }

    /// Key in [`DEFAULT_GROUP`].
    pub fn named(name: impl Into<String>) -> Result<Self, CoreError> {
        Self::new(name, DEFAULT_GROUP)
    }

    /// 64-bit FNV-1a over `group`, a unit separator and `name`.
    ///
    /// Node assignment is derived from this value, so it must not change
    /// between processes or releases.
    pub fn stable_hash(&self) -> i64 {
        let mut h = FNV_OFFSET;
        let bytes = self
            .group
            .as_bytes()
            .iter()
            .chain(std::iter::once(&0x1f_u8))
            .chain(self.name.as_bytes().iter());
        for b in bytes {
            h ^= *b as u64;
            h = h.wrapping_mul(FNV_PRIME);
        }
        h as i64
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Whether a job is assigned to exactly one node or runs everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partitioning {
    /// Runs on the single node selected by hash-mod-count assignment.
    #[default]
    Partitioned,
    /// Exempt from partitioning: every eligible node runs its own instance.
    Generic,
}

impl Partitioning {
    pub fn from_generic_flag(generic: bool) -> Self {
        if generic {
            Partitioning::Generic
        } else {
            Partitioning::Partitioned
        }
    }

    pub fn is_generic(self) -> bool {
        self == Partitioning::Generic
    }
}
