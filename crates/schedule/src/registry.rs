//! Type-discriminated schedule parsing.

use std::fmt;

use serde_json::Value;
use tracing::debug;

use crate::error::{RegistryError, ValidationErrors};
use crate::interval::IntervalSchedule;
use crate::schedule::Schedule;
use crate::scope::Scope;
use crate::validation::{fuzzy_match, ValidationResult};


/// Parser for one schedule type. Receives the nested body, the scope, the
/// document path of the body and the report to record problems in.
pub type ScheduleParser =
    Box<dyn Fn(&Value, Scope, &str, &mut ValidationResult) -> Option<Schedule> + Send + Sync>;

/// Maps type discriminators such as `"interval"` to parsers.
///
/// Registration happens at startup; lookups follow registration order, so the
/// first registered discriminator present in a document wins.
pub struct ScheduleRegistry {
    parsers: Vec<(String, ScheduleParser)>,
}

impl ScheduleRegistry {
    /// A registry with no types at all.
    pub fn empty() -> Self {
        Self { parsers: Vec::new() }
    }

    /// A registry with the built-in `interval` type.
    pub fn with_defaults() -> Self {
        Self {
            parsers: vec![(
                IntervalSchedule::TYPE.to_string(),
                Box::new(IntervalSchedule::parse) as ScheduleParser,
            )],
        }
    }

    /// Add a schedule type. Registering a type twice is a wiring error.
    pub fn register<F>(&mut self, type_name: &str, parser: F) -> Result<(), RegistryError>
    where
        F: Fn(&Value, Scope, &str, &mut ValidationResult) -> Option<Schedule> + Send + Sync + 'static,
    {
        let type_name = type_name.trim();
        if type_name.is_empty() {
            return Err(RegistryError::EmptyType);
        }
        if self.contains(type_name) {
            return Err(RegistryError::DuplicateType(type_name.to_string()));
        }
        debug!(schedule_type = type_name, "registered schedule type");
        self.parsers.push((type_name.to_string(), Box::new(parser)));
        Ok(())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.parsers.iter().any(|(t, _)| t == type_name)
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.parsers.iter().map(|(t, _)| t.as_str())
    }

    /// Parse a `{"<type>": {...}}` document.
    ///
    /// Every problem is reported at once: a missing discriminator, sibling
    /// keys the matched parser does not consume, and the body's own errors.
    pub fn parse(&self, document: &Value, scope: Scope) -> Result<Schedule, ValidationErrors> {
        let mut result = ValidationResult::new();
        let types: Vec<&str> = self.types().collect();

        let Some(doc) = document.as_object() else {
            result.error("", "schedule must be an object");
            return Err(ValidationErrors(result));
        };

        let matched = self
            .parsers
            .iter()
            .find(|(type_name, _)| doc.contains_key(type_name.as_str()));

        let Some((type_name, parser)) = matched else {
            let suggestion = doc
                .keys()
                .find_map(|k| fuzzy_match(k, &types))
                .map(|s| format!("did you mean '{s}'?"));
            result.error_with_suggestion(
                "",
                format!("schedule required: expected one of [{}]", types.join(", ")),
                suggestion,
            );
            return Err(ValidationErrors(result));
        };

        result.unused_attributes("", doc.keys(), &[type_name.as_str()]);

        let body = &doc[type_name.as_str()];
        let schedule = parser(body, scope, type_name, &mut result);

        match schedule {
            Some(schedule) if result.is_valid() => Ok(schedule),
            Some(_) => Err(ValidationErrors(result)),
            None => {
                if result.is_valid() {
                    result.error(type_name.as_str(), "schedule could not be built");
                }
                Err(ValidationErrors(result))
            }
        }
    }
}

impl Default for ScheduleRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for ScheduleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleRegistry")
            .field("types", &self.types().collect::<Vec<_>>())
            .finish()
    }
}
