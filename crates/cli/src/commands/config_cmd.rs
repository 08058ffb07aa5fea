//! `parley config`: configuration management commands.

use std::path::Path;

use anyhow::{Context, bail};
use clap::Subcommand;
use parley_config::AppConfig;

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration (API key redacted)
    Show,

    /// Parse and validate the configuration file
    Validate,

    /// Print the config file path
    Path,

    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub fn run(config_path: &Path, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => show(config_path),
        ConfigAction::Validate => validate(config_path),
        ConfigAction::Path => {
            println!("{}", config_path.display());
            Ok(())
        }
        ConfigAction::Init { force } => init(config_path, force),
    }
}

fn show(config_path: &Path) -> anyhow::Result<()> {
    let mut config = AppConfig::load_with_env(config_path)?;
    if config.model.api_key.is_some() {
        config.model.api_key = Some("[REDACTED]".into());
    }
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn validate(config_path: &Path) -> anyhow::Result<()> {
    let config = AppConfig::load_with_env(config_path)
        .with_context(|| format!("invalid configuration at {}", config_path.display()))?;

    for warning in warnings(&config) {
        println!("warning: {warning}");
    }
    println!("{} is valid", config_path.display());
    println!("  model:      {} @ {}", config.model.name, config.model.base_url);
    println!(
        "  limits:     {} iterations, {} ops/round, {} ops/turn",
        config.limits.max_iterations, config.limits.max_ops_per_turn, config.limits.max_total_ops
    );
    println!("  embeddings: {}", config.retrieval.embedding_model);
    println!("  speech:     {}", if config.speech.enabled { "on" } else { "off" });
    Ok(())
}

/// Settings that load fine but will likely misbehave.
fn warnings(config: &AppConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    if !config.has_api_key() {
        warnings.push("no API key set (PARLEY_API_KEY or OPENAI_API_KEY)".to_string());
    }
    if config.limits.max_ops_per_turn as u64 > u64::from(config.limits.max_total_ops) {
        warnings.push("limits.max_ops_per_turn exceeds limits.max_total_ops".to_string());
    }
    if !config.retrieval.use_hybrid && config.retrieval.embedding_model == "hashing" {
        warnings.push(
            "semantic-only retrieval with the hashing embedder matches on shared words only"
                .to_string(),
        );
    }
    if config.instructions.trim().is_empty() {
        warnings.push("instructions are empty".to_string());
    }
    warnings
}

fn init(config_path: &Path, force: bool) -> anyhow::Result<()> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite",
            config_path.display()
        );
    }
    if let Some(dir) = config_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    std::fs::write(config_path, AppConfig::default_toml())
        .with_context(|| format!("writing {}", config_path.display()))?;
    println!("Wrote {}", config_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        init(&path, false).unwrap();
        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.limits.max_iterations, 10);

        assert!(init(&path, false).is_err());
        init(&path, true).unwrap();
    }

    #[test]
    fn default_config_warns_only_about_missing_key() {
        let config = AppConfig::default();
        assert_eq!(warnings(&config).len(), 1);
        assert!(warnings(&config)[0].contains("API key"));
    }

    #[test]
    fn oversized_round_cap_is_flagged() {
        let mut config = AppConfig::default();
        config.model.api_key = Some("sk-test".into());
        config.limits.max_ops_per_turn = 80;
        let found = warnings(&config);
        assert_eq!(found.len(), 1);
        assert!(found[0].contains("max_ops_per_turn"));
    }
}
