//! Configuration management commands.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use dialoguer::Confirm;

use super::{ConfigArgs, ConfigCommand};
use crate::config::{generate_default_config, CliConfig, CONFIG_NAMES};
use crate::context::Context;

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => show_config(ctx),
        ConfigCommand::Get { key } => get_config(&key, ctx),
        ConfigCommand::Set { key, value } => set_config(&key, &value, ctx),
        ConfigCommand::Init { force } => init_config(force, ctx),
        ConfigCommand::Validate => validate_config(ctx),
    }
}

fn show_config(ctx: &Context) -> Result<()> {
    if ctx.output.is_json() {
        ctx.output.json(&ctx.config);
        return Ok(());
    }

    ctx.output.header("Current Configuration");
    match &ctx.config_path {
        Some(path) => ctx.output.kv("file", &path.display().to_string()),
        None => ctx.output.kv("file", "(defaults)"),
    }

    for (section, keys) in [
        ("dedupe", &["filter_get_only", "replica_capacity"][..]),
        (
            "query",
            &[
                "stale_after_ms",
                "evict_after_ms",
                "sweep_interval_ms",
                "retry",
                "retry_delay_ms",
                "event_capacity",
            ][..],
        ),
        ("simulate", &["views", "distinct_views", "latency_ms", "base_url"][..]),
    ] {
        ctx.output.info("");
        ctx.output.info(&format!("[{}]", section));
        for key in keys {
            let value = get_config_value(&ctx.config, &format!("{}.{}", section, key))?;
            ctx.output.kv(key, &value);
        }
    }

    Ok(())
}

fn get_config(key: &str, ctx: &Context) -> Result<()> {
    let value = get_config_value(&ctx.config, key)?;

    if ctx.output.is_json() {
        ctx.output.json(&serde_json::json!({ "key": key, "value": value }));
    } else {
        println!("{}", value);
    }

    Ok(())
}

fn set_config(key: &str, value: &str, ctx: &Context) -> Result<()> {
    let config_path = match &ctx.config_path {
        Some(path) => path.clone(),
        None => find_config_file(ctx)?,
    };

    let mut config = CliConfig::load(&config_path)?;
    set_config_value(&mut config, key, value)?;
    config.query.validate()?;
    config.save(&config_path)?;

    ctx.output.success(&format!("Set {} = {}", key, value));
    Ok(())
}

fn init_config(force: bool, ctx: &Context) -> Result<()> {
    let config_path = ctx.cwd.join(CONFIG_NAMES[0]);

    if config_path.exists() && !force {
        let overwrite = !ctx.output.is_json()
            && Confirm::new()
                .with_prompt(format!("{} exists. Overwrite?", config_path.display()))
                .default(false)
                .interact()?;
        if !overwrite {
            bail!(
                "Config file already exists: {}. Use --force to overwrite.",
                config_path.display()
            );
        }
    }

    fs::write(&config_path, generate_default_config())
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    ctx.output.success(&format!("Created: {}", config_path.display()));
    Ok(())
}

fn validate_config(ctx: &Context) -> Result<()> {
    ctx.output.header("Validating configuration");

    let mut errors: Vec<String> = Vec::new();
    if let Err(e) = ctx.config.query.validate() {
        errors.push(e.to_string());
    }
    let warnings = config_warnings(&ctx.config);

    if errors.is_empty() && warnings.is_empty() {
        ctx.output.success("Configuration is valid");
        return Ok(());
    }

    for error in &errors {
        ctx.output.error(&format!("Error: {}", error));
    }

    for warning in &warnings {
        ctx.output.warn(&format!("Warning: {}", warning));
    }

    if !errors.is_empty() {
        bail!("Configuration has {} error(s)", errors.len());
    }

    ctx.output.success("Configuration is valid (with warnings)");
    Ok(())
}

fn config_warnings(config: &CliConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if !config.dedupe.filter_get_only {
        warnings.push("dedupe.filter_get_only is false; non-GET calls will be coalesced".to_string());
    }
    if config.dedupe.replica_capacity == Some(0) {
        warnings.push("dedupe.replica_capacity of 0 behaves as 1".to_string());
    }
    if config.query.stale_after_ms.is_none() {
        warnings.push("query.stale_after_ms is unset; entries never go stale".to_string());
    }
    if config.simulate.views == 0 {
        warnings.push("simulate.views is 0; nothing will be coalesced".to_string());
    }
    if !config.simulate.base_url.starts_with("http") {
        warnings.push(format!(
            "simulate.base_url '{}' is not an http(s) URL",
            config.simulate.base_url
        ));
    }

    warnings
}

fn get_config_value(config: &CliConfig, key: &str) -> Result<String> {
    let parts: Vec<&str> = key.split('.').collect();

    let value = match parts.as_slice() {
        ["dedupe", "filter_get_only"] => config.dedupe.filter_get_only.to_string(),
        ["dedupe", "replica_capacity"] => optional(config.dedupe.replica_capacity),
        ["query", "stale_after_ms"] => optional(config.query.stale_after_ms),
        ["query", "evict_after_ms"] => optional(config.query.evict_after_ms),
        ["query", "sweep_interval_ms"] => config.query.sweep_interval_ms.to_string(),
        ["query", "retry"] => config.query.retry.to_string(),
        ["query", "retry_delay_ms"] => config.query.retry_delay_ms.to_string(),
        ["query", "event_capacity"] => config.query.event_capacity.to_string(),
        ["simulate", "views"] => config.simulate.views.to_string(),
        ["simulate", "distinct_views"] => config.simulate.distinct_views.to_string(),
        ["simulate", "latency_ms"] => config.simulate.latency_ms.to_string(),
        ["simulate", "base_url"] => format!("\"{}\"", config.simulate.base_url),
        _ => bail!("Unknown config key: {}", key),
    };

    Ok(value)
}

fn set_config_value(config: &mut CliConfig, key: &str, value: &str) -> Result<()> {
    let parts: Vec<&str> = key.split('.').collect();

    match parts.as_slice() {
        ["dedupe", "filter_get_only"] => config.dedupe.filter_get_only = value.parse()?,
        ["dedupe", "replica_capacity"] => config.dedupe.replica_capacity = parse_optional(value)?,
        ["query", "stale_after_ms"] => config.query.stale_after_ms = parse_optional(value)?,
        ["query", "evict_after_ms"] => config.query.evict_after_ms = parse_optional(value)?,
        ["query", "sweep_interval_ms"] => config.query.sweep_interval_ms = value.parse()?,
        ["query", "retry"] => config.query.retry = value.parse()?,
        ["query", "retry_delay_ms"] => config.query.retry_delay_ms = value.parse()?,
        ["query", "event_capacity"] => config.query.event_capacity = value.parse()?,
        ["simulate", "views"] => config.simulate.views = value.parse()?,
        ["simulate", "distinct_views"] => config.simulate.distinct_views = value.parse()?,
        ["simulate", "latency_ms"] => config.simulate.latency_ms = value.parse()?,
        ["simulate", "base_url"] => config.simulate.base_url = value.to_string(),
        _ => bail!("Unknown config key: {}", key),
    }

    Ok(())
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "null".to_string())
}

fn parse_optional<T>(value: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        "null" | "none" | "" => Ok(None),
        _ => Ok(Some(value.parse()?)),
    }
}

fn find_config_file(ctx: &Context) -> Result<PathBuf> {
    for name in CONFIG_NAMES {
        let path = ctx.cwd.join(name);
        if path.exists() {
            return Ok(path);
        }
    }
    bail!("No config file found. Run `tq config init` to create one.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_set_values() {
        let mut config = CliConfig::default();

        assert_eq!(get_config_value(&config, "query.stale_after_ms").unwrap(), "1000");
        set_config_value(&mut config, "query.evict_after_ms", "null").unwrap();
        set_config_value(&mut config, "dedupe.replica_capacity", "8").unwrap();
        set_config_value(&mut config, "simulate.base_url", "http://api").unwrap();

        assert_eq!(get_config_value(&config, "query.evict_after_ms").unwrap(), "null");
        assert_eq!(config.dedupe.replica_capacity, Some(8));
        assert_eq!(get_config_value(&config, "simulate.base_url").unwrap(), "\"http://api\"");
    }

    #[test]
    fn test_unknown_and_malformed_keys() {
        let mut config = CliConfig::default();

        assert!(get_config_value(&config, "query.nope").is_err());
        assert!(set_config_value(&mut config, "query.retry", "many").is_err());
        assert!(set_config_value(&mut config, "dedupe", "true").is_err());
    }

    #[test]
    fn test_warnings() {
        let mut config = CliConfig::default();
        assert!(config_warnings(&config).is_empty());

        config.dedupe.filter_get_only = false;
        config.simulate.views = 0;
        assert_eq!(config_warnings(&config).len(), 2);
    }
}
