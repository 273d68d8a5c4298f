//! Configuration loader: merges the .env file, config.toml and PARKWATCH_* env vars.

use common::config::FanOut;
use common::{Error, ServiceConfig};
use std::path::PathBuf;

fn parse_positive_u64(raw: &str, env_name: &str) -> Result<u64, Error> {
    let parsed = raw
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::Config(format!("{env_name} must be an integer > 0")))?;
    if parsed == 0 {
        return Err(Error::Config(format!("{env_name} must be an integer > 0")));
    }
    Ok(parsed)
}

fn parse_bool(raw: &str) -> bool {
    let lowered = raw.trim().to_ascii_lowercase();
    lowered != "0" && lowered != "false" && lowered != "no" && lowered != "off"
}

fn config_path() -> PathBuf {
    std::env::var("PARKWATCH_CONFIG")
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

pub fn validate_config(config: &ServiceConfig) -> Result<(), Error> {
    let mut issues: Vec<String> = Vec::new();

    if config.upstream.mirrors.is_empty() {
        issues.push("upstream.mirrors must contain at least one endpoint".into());
    }
    if config.upstream.mirrors.iter().any(|m| m.trim().is_empty()) {
        issues.push("upstream.mirrors must not contain empty endpoints".into());
    }
    if config.upstream.attempts == 0 {
        issues.push("upstream.attempts must be > 0".into());
    }
    if config.upstream.attempt_timeout_ms == 0 {
        issues.push("upstream.attempt_timeout_ms must be > 0".into());
    }

    if config.cache.area_ttl_secs == 0 {
        issues.push("cache.area_ttl_secs must be > 0".into());
    }
    if config.cache.entity_ttl_secs == 0 {
        issues.push("cache.entity_ttl_secs must be > 0".into());
    }
    if config.cache.coord_precision > 7 {
        issues.push("cache.coord_precision must be <= 7".into());
    }

    let p = &config.prediction;
    if p.pattern_limit == 0 {
        issues.push("prediction.pattern_limit must be > 0".into());
    }
    if p.trend_window < 2 || p.trend_window % 2 != 0 {
        issues.push("prediction.trend_window must be an even number >= 2".into());
    }
    if p.history_weight < 0.0 || p.current_weight < 0.0 || p.trend_weight < 0.0 {
        issues.push("prediction weights must be >= 0".into());
    }
    if p.min_confidence > p.max_confidence || p.max_confidence > 100 {
        issues.push("prediction confidence band must satisfy min <= max <= 100".into());
    }
    if p.low_confidence > 100 {
        issues.push("prediction.low_confidence must be <= 100".into());
    }
    if p.fallback_jitter < 0 {
        issues.push("prediction.fallback_jitter must be >= 0".into());
    }

    let b = &config.broadcast;
    if b.interval_secs == 0 {
        issues.push("broadcast.interval_secs must be > 0".into());
    }
    if b.max_delta < 0 {
        issues.push("broadcast.max_delta must be >= 0".into());
    }
    if !(0.0..=1.0).contains(&b.history_probability) {
        issues.push("broadcast.history_probability must be in [0,1]".into());
    }

    if config.listing.max_results == 0 {
        issues.push("listing.max_results must be > 0".into());
    }
    if config.listing.default_radius_m == 0 {
        issues.push("listing.default_radius_m must be > 0".into());
    }

    for seed in &config.facilities {
        if seed.total_spots == 0 {
            issues.push(format!("facility {} must have total_spots > 0", seed.id));
        }
        if seed.available_spots.is_some_and(|a| a > seed.total_spots) {
            issues.push(format!(
                "facility {} has available_spots above total_spots",
                seed.id
            ));
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "Invalid config:\n - {}",
            issues.join("\n - ")
        )))
    }
}

/// Apply `PARKWATCH_*` overrides read through `lookup`.
pub fn apply_env_overrides(
    config: &mut ServiceConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), Error> {
    if let Some(raw) = lookup("PARKWATCH_MIRRORS") {
        let mirrors: Vec<String> = raw
            .split(',')
            .map(|m| m.trim().trim_end_matches('/').to_string())
            .filter(|m| !m.is_empty())
            .collect();
        if !mirrors.is_empty() {
            config.upstream.mirrors = mirrors;
        }
    }
    if let Some(raw) = lookup("PARKWATCH_ATTEMPTS") {
        config.upstream.attempts = parse_positive_u64(&raw, "PARKWATCH_ATTEMPTS")?
            .try_into()
            .map_err(|_| Error::Config("PARKWATCH_ATTEMPTS is too large".into()))?;
    }
    if let Some(raw) = lookup("PARKWATCH_ATTEMPT_TIMEOUT_MS") {
        config.upstream.attempt_timeout_ms =
            parse_positive_u64(&raw, "PARKWATCH_ATTEMPT_TIMEOUT_MS")?;
    }
    if let Some(raw) = lookup("PARKWATCH_BACKOFF_BASE_MS") {
        config.upstream.backoff_base_ms = parse_positive_u64(&raw, "PARKWATCH_BACKOFF_BASE_MS")?;
    }
    if let Some(raw) = lookup("PARKWATCH_AREA_TTL_SECS") {
        config.cache.area_ttl_secs = parse_positive_u64(&raw, "PARKWATCH_AREA_TTL_SECS")?;
    }
    if let Some(raw) = lookup("PARKWATCH_ENTITY_TTL_SECS") {
        config.cache.entity_ttl_secs = parse_positive_u64(&raw, "PARKWATCH_ENTITY_TTL_SECS")?;
    }
    if let Some(raw) = lookup("PARKWATCH_BROADCAST_INTERVAL_SECS") {
        config.broadcast.interval_secs =
            parse_positive_u64(&raw, "PARKWATCH_BROADCAST_INTERVAL_SECS")?;
    }
    if let Some(raw) = lookup("PARKWATCH_BROADCAST_ENABLED") {
        config.broadcast.enabled = parse_bool(&raw);
    }
    if let Some(raw) = lookup("PARKWATCH_FAN_OUT") {
        config.broadcast.fan_out = match raw.trim().to_ascii_lowercase().as_str() {
            "all" => FanOut::All,
            "subscribed" => FanOut::Subscribed,
            _ => {
                return Err(Error::Config(
                    "PARKWATCH_FAN_OUT must be one of: all, subscribed".into(),
                ));
            }
        };
    }
    if let Some(raw) = lookup("PARKWATCH_RNG_SEED") {
        let seed = raw
            .trim()
            .parse::<u64>()
            .map_err(|_| Error::Config("PARKWATCH_RNG_SEED must be an unsigned integer".into()))?;
        config.rng_seed = Some(seed);
    }
    Ok(())
}

/// Load service configuration from environment and optional config file.
pub fn load_config() -> Result<ServiceConfig, Error> {
    // 1. Load .env file from project root or parent directories.
    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("No .env file loaded: {}", e);
    }

    // 2. Start with defaults.
    let mut config = ServiceConfig::default();

    // 3. Try loading config.toml if it exists.
    let path = config_path();
    if path.exists() {
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
    }

    // 4. Override with environment variables (highest priority).
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;

    validate_config(&config)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        validate_config(&ServiceConfig::default()).unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ServiceConfig::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("PARKWATCH_MIRRORS", "https://a/api/interpreter/, https://b/api/interpreter"),
                ("PARKWATCH_ATTEMPTS", "4"),
                ("PARKWATCH_FAN_OUT", "subscribed"),
                ("PARKWATCH_BROADCAST_ENABLED", "off"),
                ("PARKWATCH_RNG_SEED", "99"),
            ]),
        )
        .unwrap();

        assert_eq!(
            config.upstream.mirrors,
            vec!["https://a/api/interpreter", "https://b/api/interpreter"]
        );
        assert_eq!(config.upstream.attempts, 4);
        assert_eq!(config.broadcast.fan_out, FanOut::Subscribed);
        assert!(!config.broadcast.enabled);
        assert_eq!(config.rng_seed, Some(99));
    }

    #[test]
    fn test_bad_env_values_rejected() {
        let mut config = ServiceConfig::default();
        assert!(apply_env_overrides(&mut config, env(&[("PARKWATCH_ATTEMPTS", "0")])).is_err());
        assert!(apply_env_overrides(&mut config, env(&[("PARKWATCH_FAN_OUT", "room")])).is_err());
    }

    #[test]
    fn test_validation_collects_all_issues() {
        let mut config = ServiceConfig::default();
        config.upstream.mirrors.clear();
        config.broadcast.history_probability = 1.5;
        config.prediction.min_confidence = 99;

        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("upstream.mirrors"));
        assert!(err.contains("history_probability"));
        assert!(err.contains("confidence band"));
    }

    #[test]
    fn test_toml_sections() {
        let raw = r#"
            rng_seed = 7

            [cache]
            area_ttl_secs = 120

            [[facilities]]
            id = "local_gare"
            name = "Gare de Lyon"
            total_spots = 300
            lat = 48.8443
            lng = 2.3744
        "#;
        let config: ServiceConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.cache.area_ttl_secs, 120);
        assert_eq!(config.cache.entity_ttl_secs, 3600);
        assert_eq!(config.facilities.len(), 1);
        assert_eq!(config.rng_seed, Some(7));
        validate_config(&config).unwrap();
    }
}
