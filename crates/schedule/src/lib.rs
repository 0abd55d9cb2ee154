//! Declarative schedules and the triggers built from them.
//!
//! A schedule document such as
//! `{"interval": {"period": "5m", "random_delay_enabled": true}}` is parsed by
//! the [`ScheduleRegistry`] into a [`Schedule`], which turns into a [`Trigger`]
//! whose key is derived from the schedule's content. Parsing the same document
//! for the same job therefore always yields the same trigger key.

pub mod duration;
pub mod error;
pub mod interval;
pub mod registry;
pub mod schedule;
pub mod scope;
pub mod trigger;
pub mod validation;

pub use duration::{format_duration, parse_duration};
pub use error::{DurationError, RegistryError, ScheduleError, ValidationErrors};
pub use interval::IntervalSchedule;
pub use registry::ScheduleRegistry;
pub use schedule::{identity_prefix, trigger_identity, CustomSchedule, Schedule};
pub use scope::Scope;
pub use trigger::{MisfirePolicy, Trigger, TriggerKey, TriggerState};
pub use validation::{ValidationError, ValidationResult};
