use crate::config::types::{
    Config, CrawlDefaults, DetectionConfig, ProjectEntry, SchedulerConfig, StorageConfig,
    UserAgentConfig,
};
use crate::ConfigError;
use std::collections::HashSet;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_scheduler_config(&config.scheduler)?;
    validate_crawl_defaults(&config.crawl)?;
    validate_detection_config(&config.detection)?;
    validate_storage_config(&config.storage)?;
    validate_user_agent_config(&config.user_agent)?;
    validate_projects(&config.projects)?;
    Ok(())
}

/// Validates scheduler configuration
fn validate_scheduler_config(config: &SchedulerConfig) -> Result<(), ConfigError> {
    if config.max_concurrent_crawls < 1 || config.max_concurrent_crawls > 64 {
        return Err(ConfigError::Validation(format!(
            "max_concurrent_crawls must be between 1 and 64, got {}",
            config.max_concurrent_crawls
        )));
    }

    if config.poll_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "poll_interval_secs must be >= 1".to_string(),
        ));
    }

    if config.no_change_threshold < 1 {
        return Err(ConfigError::Validation(
            "no_change_threshold must be >= 1".to_string(),
        ));
    }

    if config.backoff_growth < 1.0 {
        return Err(ConfigError::Validation(format!(
            "backoff_growth must be >= 1.0, got {}",
            config.backoff_growth
        )));
    }

    if config.max_backoff_multiplier < 1.0 {
        return Err(ConfigError::Validation(format!(
            "max_backoff_multiplier must be >= 1.0, got {}",
            config.max_backoff_multiplier
        )));
    }

    Ok(())
}

/// Validates default crawl parameters
fn validate_crawl_defaults(config: &CrawlDefaults) -> Result<(), ConfigError> {
    if config.max_pages < 1 {
        return Err(ConfigError::Validation(format!(
            "max_pages must be >= 1, got {}",
            config.max_pages
        )));
    }

    if config.timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "timeout_secs must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates change detection thresholds and weights
fn validate_detection_config(config: &DetectionConfig) -> Result<(), ConfigError> {
    let unit_values = [
        ("noise_floor", config.noise_floor),
        ("significance_threshold", config.significance_threshold),
        (
            "redesign_structure_threshold",
            config.redesign_structure_threshold,
        ),
        (
            "structure_change_threshold",
            config.structure_change_threshold,
        ),
    ];

    for (name, value) in unit_values {
        if !(0.0..=1.0).contains(&value) {
            return Err(ConfigError::Validation(format!(
                "{} must be between 0.0 and 1.0, got {}",
                name, value
            )));
        }
    }

    let weights = [
        config.text_weight,
        config.structure_weight,
        config.resource_weight,
    ];
    if weights.iter().any(|w| *w < 0.0) || weights.iter().sum::<f64>() <= 0.0 {
        return Err(ConfigError::Validation(
            "similarity weights must be non-negative and not all zero".to_string(),
        ));
    }

    if config.noise_floor > config.significance_threshold {
        return Err(ConfigError::Validation(format!(
            "noise_floor ({}) cannot exceed significance_threshold ({})",
            config.noise_floor, config.significance_threshold
        )));
    }

    if config.content_ratio < 1.0 {
        return Err(ConfigError::Validation(format!(
            "content_ratio must be >= 1.0, got {}",
            config.content_ratio
        )));
    }

    Ok(())
}

/// Validates storage configuration
fn validate_storage_config(config: &StorageConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    if config.artifact_dir.is_empty() {
        return Err(ConfigError::Validation(
            "artifact_dir cannot be empty".to_string(),
        ));
    }

    if config.staging_dir.is_empty() {
        return Err(ConfigError::Validation(
            "staging_dir cannot be empty".to_string(),
        ));
    }

    if config.staging_dir == config.artifact_dir {
        return Err(ConfigError::Validation(
            "staging_dir and artifact_dir must differ".to_string(),
        ));
    }

    Ok(())
}

/// Validates user agent configuration
fn validate_user_agent_config(config: &UserAgentConfig) -> Result<(), ConfigError> {
    if config.crawler_name.is_empty() {
        return Err(ConfigError::Validation(
            "crawler_name cannot be empty".to_string(),
        ));
    }

    if !config
        .crawler_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "crawler_name must contain only alphanumeric characters and hyphens, got '{}'",
            config.crawler_name
        )));
    }

    Url::parse(&config.contact_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid contact_url: {}", e)))?;

    validate_email(&config.contact_email)?;

    Ok(())
}

/// Validates tracked project entries
fn validate_projects(projects: &[ProjectEntry]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();

    for entry in projects {
        if entry.code.trim().is_empty() {
            return Err(ConfigError::Validation(
                "project code cannot be empty".to_string(),
            ));
        }

        if !seen.insert(entry.code.to_uppercase()) {
            return Err(ConfigError::Validation(format!(
                "duplicate project code '{}'",
                entry.code
            )));
        }

        let url = Url::parse(&entry.website).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid website '{}': {}", entry.website, e))
        })?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::Validation(format!(
                "Website '{}' must use HTTP or HTTPS",
                entry.website
            )));
        }

        if let Some(cap) = entry.market_cap {
            if cap < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "market_cap for '{}' cannot be negative",
                    entry.code
                )));
            }
        }
    }

    Ok(())
}

/// Basic email validation
fn validate_email(email: &str) -> Result<(), ConfigError> {
    if email.is_empty() {
        return Err(ConfigError::Validation(
            "contact_email cannot be empty".to_string(),
        ));
    }

    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    }

    if !parts[1].contains('.') {
        return Err(ConfigError::Validation(format!(
            "Invalid email domain: '{}'",
            email
        )));
    }

    Ok(())
}
