use crate::model::Experiment;
use std::time::Duration;

/// Validate an experiment before it is persisted
///
/// # Validation Rules
/// - `id` and `name` cannot be empty
/// - `id` may only contain ASCII letters, digits, '.', '_' and '-'
/// - `baselinePipeline` and `candidatePipeline` cannot be empty and must differ
/// - `duration` must be valid format (e.g., "30m", "2h")
/// - Success criteria percentages must be within 0-100
///
/// # Returns
/// * `Ok(())` - Validation passed
/// * `Err(String)` - Validation error message
pub fn validate_experiment(experiment: &Experiment) -> Result<(), String> {
    if experiment.id.trim().is_empty() {
        return Err("id cannot be empty".to_string());
    }
    if let Some(c) = experiment.id.chars().find(|c| !is_id_char(*c)) {
        return Err(format!(
            "id '{}' contains '{}'; allowed are letters, digits, '.', '_' and '-'",
            experiment.id, c
        ));
    }
    if experiment.name.trim().is_empty() {
        return Err("name cannot be empty".to_string());
    }

    let config = &experiment.config;
    if config.baseline_pipeline.trim().is_empty() {
        return Err("config.baselinePipeline cannot be empty".to_string());
    }
    if config.candidate_pipeline.trim().is_empty() {
        return Err("config.candidatePipeline cannot be empty".to_string());
    }
    if config.baseline_pipeline == config.candidate_pipeline {
        return Err(format!(
            "config.candidatePipeline must differ from baselinePipeline, both are '{}'",
            config.baseline_pipeline
        ));
    }

    if parse_duration(&config.duration).is_none() {
        return Err(format!("config.duration invalid: '{}'", config.duration));
    }

    let criteria = &config.success_criteria;
    for (field, value) in [
        ("minCardinalityReduction", criteria.min_cardinality_reduction),
        ("maxCpuOverhead", criteria.max_cpu_overhead),
        ("maxMemoryOverhead", criteria.max_memory_overhead),
        (
            "minCriticalProcessCoverage",
            criteria.min_critical_process_coverage,
        ),
    ] {
        if !(0.0..=100.0).contains(&value) {
            return Err(format!(
                "config.successCriteria.{} must be 0-100, got {}",
                field, value
            ));
        }
    }

    Ok(())
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// Parse a duration string like "5m", "30s", "1h" into std::time::Duration
///
/// Supported formats:
/// - "30s" → 30 seconds (max 24h = 86400s)
/// - "5m" → 5 minutes (max 24h = 1440m)
/// - "2h" → 2 hours (max 1 week = 168h)
///
/// Zero is rejected. Seconds and minutes are capped at a day, hours at a
/// week, so that typos like "999999h" fail instead of scheduling forever.
pub fn parse_duration(duration_str: &str) -> Option<Duration> {
    let duration_str = duration_str.trim();
    let unit = duration_str.chars().last()?;
    let number: u64 = duration_str[..duration_str.len() - unit.len_utf8()]
        .parse()
        .ok()?;

    if number == 0 {
        return None;
    }

    match unit {
        's' if number <= 86_400 => Some(Duration::from_secs(number)),
        'm' if number <= 1_440 => number.checked_mul(60).map(Duration::from_secs),
        'h' if number <= 168 => number.checked_mul(3_600).map(Duration::from_secs),
        _ => None,
    }
}
