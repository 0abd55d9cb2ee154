use crate::trigger::TriggerState;
use crate::validation::ValidationResult;

/// Errors building schedules and driving trigger state.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid period: {0}")]
    InvalidPeriod(String),

    #[error("trigger {trigger}: cannot {action} while {from:?}")]
    IllegalTransition {
        trigger: String,
        from: TriggerState,
        action: &'static str,
    },

    #[error("fire time out of range: {0}")]
    OutOfRange(String),
}

/// Errors registering schedule types. These indicate a wiring defect and
/// should abort startup.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("schedule type '{0}' is already registered")]
    DuplicateType(String),

    #[error("schedule type name must not be empty")]
    EmptyType,
}

/// Malformed duration strings.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("duration is empty")]
    Empty,

    #[error("unknown unit '{unit}' in '{input}'")]
    UnknownUnit { input: String, unit: String },

    #[error("missing number before unit in '{0}'")]
    MissingNumber(String),

    #[error("trailing number without unit in '{0}'")]
    TrailingNumber(String),

    #[error("duration '{0}' is too large")]
    Overflow(String),
}

/// A schedule document failed validation. Carries every problem found.
#[derive(Debug, thiserror::Error)]
#[error("invalid schedule: {0}")]
pub struct ValidationErrors(pub ValidationResult);

impl ValidationErrors {
    pub fn result(&self) -> &ValidationResult {
        &self.0
    }
}
