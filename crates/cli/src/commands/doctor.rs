//! `parley doctor`: diagnose whether a turn can run.

use std::path::Path;
use std::sync::Arc;

use parley_config::AppConfig;
use parley_core::identity::IdentityPartition;
use parley_retrieval::{HashingEmbedder, InMemoryIndex, Ingestor, RetrievalOptions, RetrievalPipeline};

pub async fn run(config_path: &Path) -> anyhow::Result<()> {
    println!("Parley doctor");
    println!();

    let mut issues = 0;

    let config = if config_path.exists() {
        match AppConfig::load_with_env(config_path) {
            Ok(config) => {
                println!("  ok    config file valid ({})", config_path.display());
                config
            }
            Err(e) => {
                println!("  FAIL  config file invalid: {e}");
                return Ok(());
            }
        }
    } else {
        println!(
            "  warn  no config file at {}, using defaults (run `parley config init`)",
            config_path.display()
        );
        let mut config = AppConfig::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    };

    if config.has_api_key() {
        println!("  ok    API key configured");
    } else {
        println!("  warn  no API key configured");
        issues += 1;
    }

    let dispatcher = parley_operations::default_dispatcher(
        Arc::new(RetrievalPipeline::new(
            Arc::new(HashingEmbedder::default()),
            Arc::new(InMemoryIndex::new()),
        )),
        RetrievalOptions::default(),
    );
    let kinds: Vec<String> = dispatcher.kinds().iter().map(ToString::to_string).collect();
    println!("  ok    built-in operations: {}", kinds.join(", "));

    if retrieval_self_check().await {
        println!("  ok    retrieval pipeline answers from an ingested document");
    } else {
        println!("  FAIL  retrieval self-check returned nothing");
        issues += 1;
    }

    println!();
    if issues == 0 {
        println!("  All checks passed.");
    } else {
        println!("  {issues} issue(s) found.");
    }
    Ok(())
}

/// Ingest a sample document offline and retrieve it back.
async fn retrieval_self_check() -> bool {
    let embedder = Arc::new(HashingEmbedder::default());
    let index = Arc::new(InMemoryIndex::new());
    let identity = IdentityPartition::guest("doctor");

    let ingested = Ingestor::new(embedder.clone(), index.clone())
        .ingest(
            &identity,
            "doctor-sample",
            "Parley streams replies sentence by sentence.",
        )
        .await;
    if !matches!(ingested, Ok(n) if n > 0) {
        return false;
    }

    let bundle = RetrievalPipeline::new(embedder, index)
        .retrieve(
            "Parley streams replies sentence by sentence",
            &identity,
            &RetrievalOptions::default(),
        )
        .await;
    !bundle.is_empty()
}
