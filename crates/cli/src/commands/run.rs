//! `parley run`: one turn, streamed to stdout.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Args;
use parley_agent::{OrchestratorConfig, TurnOrchestrator};
use parley_config::AppConfig;
use parley_core::identity::IdentityPartition;
use parley_core::retrieval::EmbeddingService;
use parley_core::stream::{StreamEvent, StreamPayload};
use parley_core::turn::TurnInput;
use parley_operations::OperationDispatcher;
use parley_retrieval::{
    Bm25, HashingEmbedder, InMemoryIndex, Ingestor, PipelineSettings, RetrievalPipeline,
};
use tracing::{info, warn};

#[derive(Args)]
pub struct RunArgs {
    /// The user message
    pub message: String,

    /// Identity partition, as `user:<id>`, `tenant:<id>` or `guest:<id>`
    #[arg(short, long, default_value = "user:local")]
    pub identity: String,

    /// Documents to ingest into the identity's partition before the turn
    #[arg(long, value_name = "FILE", num_args = 1..)]
    pub ingest: Vec<PathBuf>,

    /// Synthesize speech for the reply
    #[arg(long)]
    pub speech: bool,

    /// Print only the reply text instead of JSON events
    #[arg(long)]
    pub text: bool,

    /// tokenizer.json used for context budgets (needs the `hf-tokenizer` feature)
    #[arg(long, value_name = "FILE")]
    pub tokenizer: Option<PathBuf>,
}

pub async fn run(config_path: &Path, args: RunArgs) -> anyhow::Result<()> {
    let mut config = AppConfig::load_with_env(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if args.speech {
        config.speech.enabled = true;
    }

    if !config.has_api_key() && !is_local(&config.model.base_url) {
        bail!(
            "no API key configured; set PARLEY_API_KEY or OPENAI_API_KEY, or add model.api_key to {}",
            config_path.display()
        );
    }

    let identity = IdentityPartition::parse(&args.identity);
    let embedder = build_embedder(&config);
    let index = Arc::new(
        InMemoryIndex::new().with_bm25(Bm25::new(config.retrieval.bm25_k1, config.retrieval.bm25_b)),
    );

    if !args.ingest.is_empty() {
        let ingestor = Ingestor::new(embedder.clone(), index.clone())
            .with_max_chars(config.retrieval.chunk_max_chars);
        for path in &args.ingest {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let document_id = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            let chunks = ingestor
                .ingest(&identity, &document_id, &text)
                .await
                .with_context(|| format!("ingesting {}", path.display()))?;
            info!(document_id = %document_id, chunks, identity = %identity, "Document ingested");
        }
    }

    let pipeline = RetrievalPipeline::new(embedder, index).with_settings(PipelineSettings {
        similarity_floor: config.retrieval.similarity_floor,
        diversity_threshold: config.retrieval.diversity_threshold,
        rrf_k: config.retrieval.rrf_k,
    });
    #[cfg(feature = "hf-tokenizer")]
    let pipeline = match &args.tokenizer {
        Some(path) => pipeline.with_token_counter(Arc::new(
            parley_retrieval::HfTokenCounter::from_file(path)?,
        )),
        None => pipeline,
    };
    #[cfg(not(feature = "hf-tokenizer"))]
    if args.tokenizer.is_some() {
        warn!("Built without the hf-tokenizer feature; using estimated token counts");
    }
    let pipeline = Arc::new(pipeline);

    let orchestrator_config = OrchestratorConfig::from_app_config(&config);
    let dispatcher = Arc::new(build_dispatcher(
        &config,
        pipeline.clone(),
        &orchestrator_config,
    ));

    let model = parley_providers::model_service(&config.model);
    let mut orchestrator =
        TurnOrchestrator::new(model, dispatcher, pipeline, orchestrator_config);
    if let Some(synthesizer) = parley_providers::speech_synthesizer(&config.model, &config.speech)
    {
        orchestrator = orchestrator.with_speech(synthesizer);
    }
    let orchestrator = Arc::new(orchestrator);

    let (mut events, handle) = orchestrator.run(TurnInput::new(identity, args.message));

    let mut stdout = std::io::stdout().lock();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&mut stdout, &event, args.text)?;
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, abandoning turn");
                drop(events);
                break;
            }
        }
    }
    if args.text {
        writeln!(stdout)?;
    }

    let turn = handle.await.context("turn task failed")?;
    info!(
        turn_id = %turn.id,
        reason = ?turn.termination_reason,
        iterations = turn.iteration_count,
        operations = turn.total_operations_executed,
        total_tokens = turn.usage.total_tokens,
        "Turn finished"
    );
    Ok(())
}

fn build_embedder(config: &AppConfig) -> Arc<dyn EmbeddingService> {
    if config.retrieval.embedding_model == "hashing" {
        Arc::new(HashingEmbedder::default())
    } else {
        Arc::new(
            parley_providers::embedding_service(&config.model, &config.retrieval.embedding_model)
                .with_timeout(Duration::from_secs(config.model.request_timeout_secs)),
        )
    }
}

fn build_dispatcher(
    config: &AppConfig,
    pipeline: Arc<RetrievalPipeline>,
    orchestrator_config: &OrchestratorConfig,
) -> OperationDispatcher {
    let mut dispatcher =
        parley_operations::default_dispatcher(pipeline, orchestrator_config.retrieval)
            .with_default_timeout(Duration::from_secs(config.dispatcher.default_timeout_secs));
    for (kind, secs) in config.dispatcher.parsed_overrides() {
        dispatcher = dispatcher.with_timeout(kind, Duration::from_secs(secs));
    }
    dispatcher
}

fn print_event(out: &mut impl Write, event: &StreamEvent, text_only: bool) -> anyhow::Result<()> {
    if !text_only {
        writeln!(out, "{}", serde_json::to_string(event)?)?;
        return Ok(());
    }
    match &event.payload {
        StreamPayload::TextDelta { text } => {
            write!(out, "{text}")?;
            out.flush()?;
        }
        StreamPayload::Error { message } => eprintln!("\n[error] {message}"),
        _ => {}
    }
    Ok(())
}

fn is_local(base_url: &str) -> bool {
    base_url.contains("://localhost") || base_url.contains("://127.0.0.1")
}
