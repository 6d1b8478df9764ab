use anyhow::{Result, anyhow};
use futures_util::StreamExt;
use std::io::Write;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::outline::print_outline;
use crate::core::llm::registry::PROVIDER_ENV;
use crate::core::llm::{
    ChatMessage, GenericProvider, LlmError, LlmManager, ProviderRegistry, StreamConfig,
};
use crate::core::log::{BatchBuilder, ExecutionLogStore, LogBatchResult, LogRole, ResultFormat};
use crate::core::terminal::print_warn;

pub(crate) const DEFAULT_PROVIDER: &str = "openai";

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct RunArgs {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_retries: Option<u32>,
    pub system: Option<String>,
    pub expand: bool,
    pub prompt: String,
}

impl RunArgs {
    fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            model: self.model.clone(),
            temperature: self.temperature,
            max_retries: self.max_retries,
            max_tokens: None,
        }
    }
}

/// What came back from the model before the stream ended.
#[derive(Debug, Default)]
pub(crate) struct RunOutcome {
    pub output: String,
    pub cancelled: bool,
}

pub(crate) fn provider_choice(explicit: Option<&str>, from_env: Option<String>) -> String {
    explicit
        .map(str::to_string)
        .or(from_env)
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_PROVIDER.to_string())
}

pub(crate) async fn run_prompt(args: RunArgs) -> Result<()> {
    let registry = ProviderRegistry::load()?;
    let provider_id = provider_choice(args.provider.as_deref(), std::env::var(PROVIDER_ENV).ok());
    let def = registry.get_provider(&provider_id).cloned().ok_or_else(|| {
        anyhow!(
            "Unknown provider '{}'. Run 'mindforge providers' to list them.",
            provider_id
        )
    })?;
    let active_id = def.id.clone();
    let provider = GenericProvider::from_env(def, None, args.model.as_deref())?;
    let mut manager = LlmManager::new();
    manager.register_provider(Box::new(provider));
    manager.set_active(&active_id, args.model.clone());

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; stopping the stream");
            on_ctrl_c.cancel();
        }
    });

    let messages = conversation(&args);
    let outcome = stream_to_stdout(&manager, &messages, &args.stream_config(), cancel).await?;

    let batch = assemble_batch(&args, &outcome);
    let store = Arc::new(ExecutionLogStore::new());
    publish(&store, &batch, args.expand);
    Ok(())
}

fn conversation(args: &RunArgs) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if let Some(system) = &args.system {
        messages.push(ChatMessage::system(system.as_str()));
    }
    messages.push(ChatMessage::user(args.prompt.as_str()));
    messages
}

/// Prints deltas as they arrive. A failure mid-stream is returned after the partial output has
/// been shown; nothing is published for a failed run.
pub(crate) async fn stream_to_stdout(
    manager: &LlmManager,
    messages: &[ChatMessage],
    config: &StreamConfig,
    cancel: CancellationToken,
) -> Result<RunOutcome, LlmError> {
    let mut stream = manager
        .stream_with_selected(messages, config, Some(cancel.clone()))
        .await?;
    let mut outcome = RunOutcome::default();
    let mut stdout = std::io::stdout();

    while let Some(delta) = stream.next().await {
        match delta {
            Ok(text) => {
                let _ = write!(stdout, "{}", text);
                let _ = stdout.flush();
                outcome.output.push_str(&text);
            }
            Err(e) => {
                println!();
                return Err(e);
            }
        }
    }
    println!();

    outcome.cancelled = cancel.is_cancelled();
    debug!(
        "Stream finished ({} chars, cancelled: {})",
        outcome.output.len(),
        outcome.cancelled
    );
    Ok(outcome)
}

pub(crate) fn assemble_batch(args: &RunArgs, outcome: &RunOutcome) -> LogBatchResult {
    let mut builder = BatchBuilder::new();
    if let Some(system) = &args.system {
        builder.system_prompt(system);
        builder.push(LogRole::System, system.clone());
    }
    builder.push(LogRole::User, args.prompt.clone());
    if !outcome.output.is_empty() {
        builder.push(LogRole::Assistant, outcome.output.clone());
    }

    if outcome.cancelled {
        print_warn("Stopped before the model finished.");
        builder.finish_cancelled("cancelled by user", &outcome.output)
    } else {
        builder.finish(outcome.output.clone(), ResultFormat::Markdown)
    }
}

/// Hands the batch to the store; the outline is drawn by a store subscriber.
pub(crate) fn publish(store: &Arc<ExecutionLogStore>, batch: &LogBatchResult, expand: bool) {
    let reader: Weak<ExecutionLogStore> = Arc::downgrade(store);
    let subscription = store.subscribe(move || {
        if let Some(store) = reader.upgrade() {
            print_outline(&store.snapshot(), expand);
        }
    });
    store.set_from_batch(batch);
    subscription.unsubscribe();
}
