use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a schedule is declared. The scope prefixes every trigger identity, so
/// the same schedule attached at two levels yields two distinct triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Built-in schedule shipped with the job definition.
    #[default]
    Default,
    /// Schedule configured on the job itself.
    Job,
    /// Schedule configured on a single step of a job.
    Step,
}

impl Scope {
    pub fn prefix(self) -> &'static str {
        match self {
            Scope::Default => "default",
            Scope::Job => "job",
            Scope::Step => "step",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}
