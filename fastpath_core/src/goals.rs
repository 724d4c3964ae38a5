//! Built-in fasting goals and goal catalog helpers.
//!
//! The predefined goals are seeded into the store the first time it has no
//! goal definitions at all.

use crate::config::Config;
use crate::types::FastingGoal;
use once_cell::sync::Lazy;
use std::collections::HashSet;

/// Cached predefined goals - built once and reused
static PREDEFINED_GOALS: Lazy<Vec<FastingGoal>> = Lazy::new(predefined_goals);

/// Get a reference to the cached predefined goals
pub fn get_predefined_goals() -> &'static [FastingGoal] {
    &PREDEFINED_GOALS
}

/// Builds the predefined goal list (14, 16, 18 and 20 hour fasts)
pub fn predefined_goals() -> Vec<FastingGoal> {
    vec![
        FastingGoal::new("14-Hour Fast", 14 * 3600)
            .with_description("A gentle start to time-restricted eating."),
        FastingGoal::new("16-Hour Fast", 16 * 3600).with_description(
            "A popular choice, may aid weight management and blood sugar control.",
        ),
        FastingGoal::new("18-Hour Fast", 18 * 3600)
            .with_description("A longer fast, potentially enhancing fat burning and focus."),
        FastingGoal::new("20-Hour Fast", 20 * 3600).with_description("An extended daily fast."),
    ]
}

/// Goals to seed for a given configuration: the predefined set plus any
/// `[[goals.extra]]` entries. Extras that fail validation or reuse a name
/// are skipped with a warning.
pub fn seed_goals_for(config: &Config) -> Vec<FastingGoal> {
    let mut goals = get_predefined_goals().to_vec();
    let mut names: HashSet<String> = goals.iter().map(|g| g.name.clone()).collect();

    for extra in &config.goals.extra {
        let mut goal = match FastingGoal::custom(extra.hours, Some(&extra.name)) {
            Ok(goal) => goal,
            Err(e) => {
                tracing::warn!("Skipping configured goal '{}': {}", extra.name, e);
                continue;
            }
        };
        goal.description = extra.description.clone();

        if !names.insert(goal.name.clone()) {
            tracing::warn!("Skipping configured goal '{}': duplicate name", goal.name);
            continue;
        }
        goals.push(goal);
    }

    goals
}

/// Validate a goal collection for consistency
///
/// Returns a list of validation errors, or empty Vec if valid.
pub fn validate_goals(goals: &[FastingGoal]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for goal in goals {
        if let Err(e) = goal.validate() {
            errors.push(e.to_string());
        }
        if !seen.insert(goal.name.as_str()) {
            errors.push(format!("Duplicate goal name '{}'", goal.name));
        }
    }

    errors
}
