use std::sync::Arc;

use duh::config::DuhConfig;
use duh::provider::http::{ApiFormat, HttpProvider};
use duh::provider::{ModelCapability, ModelInfo, ModelProvider};
use duh::{run_consensus, ProviderManager};

/// Static per-vendor model catalog. A production deployment would pull
/// this from the provider's models endpoint or a pricing table shipped
/// alongside the binary; hardcoded here since this binary is a thin
/// demonstration of the Engine API, not the vendor catalog service.
fn known_models(provider_id: &str) -> Vec<(&'static str, &'static str, f64, f64)> {
    match provider_id {
        "anthropic" => vec![("claude-opus-4-6", "Claude Opus", 15.0, 75.0)],
        "openai" => vec![("gpt-5", "GPT-5", 5.0, 15.0)],
        "google" => vec![("gemini-3-pro", "Gemini 3 Pro", 3.5, 10.5)],
        _ => Vec::new(),
    }
}

fn api_format_for(provider_id: &str) -> ApiFormat {
    match provider_id {
        "anthropic" => ApiFormat::Anthropic,
        _ => ApiFormat::OpenAi,
    }
}

fn default_base_url(provider_id: &str) -> &'static str {
    match provider_id {
        "anthropic" => "https://api.anthropic.com/v1/messages",
        "openai" => "https://api.openai.com/v1/chat/completions",
        "google" => "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions",
        _ => "",
    }
}

/// Registers an `HttpProvider` for every configured provider with a
/// resolvable API key. Providers missing a key are skipped with a
/// warning rather than failing startup — a session can still run with
/// whatever subset of the panel is actually reachable.
fn register_providers(config: &DuhConfig, pm: &ProviderManager) {
    for (provider_id, provider_config) in &config.providers {
        if !provider_config.enabled {
            continue;
        }
        let Some(api_key) = provider_config.resolve_api_key() else {
            tracing::warn!(provider_id, "no API key resolved — skipping provider");
            continue;
        };

        let catalog = known_models(provider_id);
        if catalog.is_empty() {
            tracing::warn!(provider_id, "no known model catalog for this provider — skipping");
            continue;
        }
        let models: Vec<ModelInfo> = catalog
            .into_iter()
            .map(|(model_id, display_name, input_cost, output_cost)| ModelInfo {
                provider_id: provider_id.clone(),
                model_id: model_id.to_string(),
                display_name: display_name.to_string(),
                capability: ModelCapability::full(),
                context_window: 200_000,
                max_output_tokens: 8192,
                input_cost_per_mtok: input_cost,
                output_cost_per_mtok: output_cost,
                is_local: false,
                proposer_eligible: true,
            })
            .collect();

        let base_url = provider_config.base_url.clone().unwrap_or_else(|| default_base_url(provider_id).to_string());
        let provider: Arc<dyn ModelProvider> =
            Arc::new(HttpProvider::new(provider_id.clone(), base_url, api_key, api_format_for(provider_id), models));

        if let Err(err) = pm.register(provider) {
            tracing::error!(provider_id, error = %err, "failed to register provider");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("duh starting");

    let config = DuhConfig::load("duh.toml")?;
    let pm = Arc::new(ProviderManager::new(config.cost.hard_limit));
    register_providers(&config, &pm);

    let question = std::env::args().nth(1).unwrap_or_else(|| "What should we do?".to_string());

    let outcome = run_consensus(&question, &config, pm, None, None, None).await?;
    println!("{}", outcome.decision);
    tracing::info!(
        confidence = outcome.confidence,
        cost = outcome.cost,
        rounds = outcome.rounds_used,
        "consensus complete"
    );

    tracing::info!("duh shutting down");
    Ok(())
}
