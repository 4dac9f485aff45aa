use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::consensus::convergence::{compute_confidence, compute_rigor};
use crate::consensus::machine::{ChallengeResult, ConsensusContext};
use crate::error::DuhError;
use crate::manager::ProviderManager;
use crate::provider::{PromptMessage, ResponseFormat, SendOptions};
use crate::retry::{retry_with_backoff, with_cancellation, RetryConfig};
use crate::tools::{tool_augmented_send, ToolRegistry};

/// A tool registry paired with the round cap a handler should honor when
/// driving the tool-use loop, threaded through from `consensus.tools`
/// config. `None` means plain, tool-less generation.
pub struct ToolContext<'a> {
    pub registry: &'a dyn ToolRegistry,
    pub max_rounds: u32,
}

/// The 14 exact opener markers a challenger response is checked against.
/// Preserved verbatim per the design note on sycophancy detection —
/// not an invented or "smarter" heuristic.
const SYCOPHANCY_MARKERS: [&str; 14] = [
    "great answer",
    "excellent analysis",
    "good point",
    "spot on",
    "nothing to add",
    "well reasoned",
    "solid work",
    "beautiful",
    "i agree",
    "correct",
    "you are right",
    "overall your answer",
    "the answer is good",
    "nice work",
];

/// Case-insensitive substring match within the first 200 characters of
/// the stripped content.
pub fn detect_sycophancy(content: &str) -> bool {
    let lowered = content.trim_start().to_lowercase();
    let window: String = lowered.chars().take(200).collect();
    SYCOPHANCY_MARKERS.iter().any(|marker| window.contains(marker))
}

async fn send_with_retry(
    pm: &ProviderManager,
    model_ref: &str,
    messages: &[PromptMessage],
    opts: &SendOptions,
    cancel: Option<&CancellationToken>,
) -> Result<String, DuhError> {
    let (provider, model_id) = pm.get_provider(model_ref)?;
    let model_info = pm.get_model_info(model_ref)?;
    let retry_config = RetryConfig::default();

    let response = with_cancellation(cancel, retry_with_backoff(&retry_config, None::<fn(u32, std::time::Duration, &DuhError)>, || {
        let provider = provider.clone();
        let model_id = model_id.clone();
        async move { provider.send(messages, &model_id, opts).await }
    }))
    .await?;

    pm.record_usage(&model_info, &response.usage)?;
    Ok(response.content)
}

/// Like `send_with_retry`, but when `tools` is supplied drives the
/// tool-use loop (§4.5's "tool-augmented send" contract) instead of a
/// single call. Cost is recorded for every round the loop actually made,
/// not just the final one, and every invocation is appended to the
/// returned log for the caller to merge into `ctx.tool_calls_log`.
/// `cancel`, when supplied, aborts the in-flight call (and drops the
/// underlying transport's connection) the moment the session is
/// cancelled, rather than waiting for it to complete.
async fn send_with_retry_and_tools(
    pm: &ProviderManager,
    model_ref: &str,
    messages: Vec<PromptMessage>,
    tools: Option<&ToolContext<'_>>,
    cancel: Option<&CancellationToken>,
) -> Result<(String, Vec<String>), DuhError> {
    let Some(tool_ctx) = tools else {
        let content = send_with_retry(pm, model_ref, &messages, &SendOptions::new(), cancel).await?;
        return Ok((content, Vec::new()));
    };

    let (provider, model_id) = pm.get_provider(model_ref)?;
    let model_info = pm.get_model_info(model_ref)?;
    let retry_config = RetryConfig::default();

    let result = with_cancellation(cancel, retry_with_backoff(&retry_config, None::<fn(u32, std::time::Duration, &DuhError)>, || {
        let provider = provider.clone();
        let model_id = model_id.clone();
        let messages = messages.clone();
        async move { tool_augmented_send(provider.as_ref(), &model_id, messages, tool_ctx.registry, tool_ctx.max_rounds).await }
    }))
    .await?;

    pm.record_usage(&model_info, &result.usage)?;
    Ok((result.content, result.tool_calls_log))
}

/// Filters to `proposer_eligible` models, rotates by the count of
/// archived rounds so far. `InsufficientModels` if none are eligible.
/// The round-robin key is deliberately `round_history.len()` (rounds
/// already archived), not a per-session attempt counter. `panel`, when
/// given, restricts eligibility to that set of `model_ref`s (the Engine
/// API's optional panel override); `None` considers every registered
/// model.
pub fn select_proposer(pm: &ProviderManager, ctx: &ConsensusContext, panel: Option<&[String]>) -> Result<String, DuhError> {
    let mut eligible: Vec<_> = pm
        .list_all_models()
        .into_iter()
        .filter(|m| m.proposer_eligible)
        .filter(|m| panel.is_none_or(|p| p.contains(&m.model_ref())))
        .map(|m| m.model_ref())
        .collect();
    eligible.sort();
    if eligible.is_empty() {
        return Err(DuhError::InsufficientModels("no proposer-eligible models registered".into()));
    }
    let idx = ctx.round_history.len() % eligible.len();
    Ok(eligible.swap_remove(idx))
}

/// Drops the proposer, selects at least `min_challengers`, preferring
/// distinct providers for diversity. `InsufficientModels` if too few
/// remain. `panel` restricts candidates the same way as `select_proposer`.
pub fn select_challengers(
    pm: &ProviderManager,
    proposer: &str,
    min_challengers: usize,
    panel: Option<&[String]>,
) -> Result<Vec<String>, DuhError> {
    let mut candidates: Vec<_> = pm
        .list_all_models()
        .into_iter()
        .filter(|m| m.model_ref() != proposer)
        .filter(|m| panel.is_none_or(|p| p.contains(&m.model_ref())))
        .collect();
    candidates.sort_by(|a, b| a.model_ref().cmp(&b.model_ref()));

    if candidates.len() < min_challengers {
        return Err(DuhError::InsufficientModels(format!(
            "need at least {min_challengers} challengers, found {}",
            candidates.len()
        )));
    }

    let mut seen_providers = std::collections::HashSet::new();
    let mut ordered = Vec::new();
    for model in &candidates {
        if seen_providers.insert(model.provider_id.clone()) {
            ordered.push(model.model_ref());
        }
    }
    for model in &candidates {
        let model_ref = model.model_ref();
        if !ordered.contains(&model_ref) {
            ordered.push(model_ref);
        }
    }
    Ok(ordered.into_iter().take(min_challengers).collect())
}

fn build_propose_prompt(question: &str) -> Vec<PromptMessage> {
    vec![
        PromptMessage::system(
            "You are proposing an initial answer in a multi-model consensus debate. \
             Give your best direct answer to the question.",
        ),
        PromptMessage::user(question),
    ]
}

pub async fn handle_propose(
    ctx: &mut ConsensusContext,
    pm: &ProviderManager,
    proposer: &str,
    tools: Option<&ToolContext<'_>>,
    cancel: Option<&CancellationToken>,
) -> Result<(), DuhError> {
    let messages = build_propose_prompt(&ctx.question);
    let (content, log) = send_with_retry_and_tools(pm, proposer, messages, tools, cancel).await?;
    ctx.proposal = Some(content);
    ctx.proposal_model = Some(proposer.to_string());
    ctx.tool_calls_log.extend(log);
    Ok(())
}

/// The four challenge framings a challenger can be assigned when the
/// caller supplies no `consensus.challenge_types` override.
pub const DEFAULT_CHALLENGE_TYPES: [&str; 4] = ["flaw", "alternative", "risk", "devils_advocate"];

fn framing_instruction(framing: &str) -> &'static str {
    match framing {
        "alternative" => "Propose a concrete alternative approach and argue for it.",
        "risk" => "Identify the biggest risk or failure mode in this answer.",
        "devils_advocate" => "Argue against this answer as forcefully as you can, even if you privately agree with it.",
        _ => "Identify the most significant flaw or gap in this answer.",
    }
}

fn build_challenge_prompt(question: &str, proposal: &str, framing: &str) -> Vec<PromptMessage> {
    vec![
        PromptMessage::system(format!(
            "You are challenging a proposed answer in a multi-model consensus debate. \
             {} \
             Be direct and specific; do not simply agree.",
            framing_instruction(framing)
        )),
        PromptMessage::user(format!("Question: {question}\n\nProposed answer:\n{proposal}")),
    ]
}

/// Fans out challenger calls concurrently, each challenger assigned a
/// framing (round-robin over `challenge_types`, or `DEFAULT_CHALLENGE_TYPES`
/// when empty) keyed by its position in `challengers`. A single challenger
/// failure shrinks the challenger set but does not fail the phase unless
/// every challenger fails. `cancel`, when supplied, is cloned into every
/// spawned task so the whole fan-out unwinds promptly when the session
/// is cancelled rather than waiting out the slowest challenger.
pub async fn handle_challenge(
    ctx: &mut ConsensusContext,
    pm: Arc<ProviderManager>,
    challengers: &[String],
    challenge_types: &[String],
    cancel: Option<&CancellationToken>,
) -> Result<(), DuhError> {
    let question = ctx.question.clone();
    let proposal = ctx.proposal.clone().unwrap_or_default();
    let framings: Vec<String> = if challenge_types.is_empty() {
        DEFAULT_CHALLENGE_TYPES.iter().map(|s| s.to_string()).collect()
    } else {
        challenge_types.to_vec()
    };

    let mut set = JoinSet::new();
    for (idx, model_ref) in challengers.iter().enumerate() {
        let pm = pm.clone();
        let model_ref = model_ref.clone();
        let framing = framings[idx % framings.len()].clone();
        let messages = build_challenge_prompt(&question, &proposal, &framing);
        let cancel = cancel.cloned();
        set.spawn(async move {
            let result = send_with_retry(&pm, &model_ref, &messages, &SendOptions::new(), cancel.as_ref()).await;
            (model_ref, framing, result)
        });
    }

    let mut challenges = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((model_ref, framing, Ok(content))) => {
                let sycophantic = detect_sycophancy(&content);
                challenges.push(ChallengeResult { model_ref, content, sycophantic, framing });
            }
            Ok((model_ref, _framing, Err(err))) => {
                tracing::warn!(model_ref, error = %err, "challenger call failed");
            }
            Err(join_err) => {
                tracing::warn!(error = %join_err, "challenger task panicked");
            }
        }
    }

    if challenges.is_empty() {
        return Err(DuhError::InsufficientModels("all challengers failed".into()));
    }

    // Stable ordering by challenger-selection order, not arrival order.
    challenges.sort_by_key(|c| challengers.iter().position(|m| m == &c.model_ref).unwrap_or(usize::MAX));
    ctx.challenges = challenges;
    Ok(())
}

fn build_revise_prompt(question: &str, proposal: &str, challenges: &[ChallengeResult]) -> Vec<PromptMessage> {
    let challenge_block: String = challenges
        .iter()
        .map(|c| format!("[{}]: {}", c.model_ref, c.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    vec![
        PromptMessage::system(
            "You proposed an answer that was challenged by other models. \
             Revise your answer, addressing legitimate challenges and \
             standing firm against challenges that do not hold up.",
        ),
        PromptMessage::user(format!(
            "Question: {question}\n\nYour proposal:\n{proposal}\n\nChallenges:\n{challenge_block}"
        )),
    ]
}

pub async fn handle_revise(
    ctx: &mut ConsensusContext,
    pm: &ProviderManager,
    tools: Option<&ToolContext<'_>>,
    cancel: Option<&CancellationToken>,
) -> Result<(), DuhError> {
    let reviser = ctx
        .proposal_model
        .clone()
        .ok_or_else(|| DuhError::Consensus("REVISE requires a proposal_model".into()))?;
    let messages = build_revise_prompt(
        &ctx.question,
        ctx.proposal.as_deref().unwrap_or_default(),
        &ctx.challenges,
    );
    let (content, log) = send_with_retry_and_tools(pm, &reviser, messages, tools, cancel).await?;
    ctx.revision = Some(content);
    ctx.tool_calls_log.extend(log);
    Ok(())
}

/// Sets `decision`, computes `rigor`/`confidence`, and extracts dissent
/// as the concatenation of every non-sycophantic challenge. `None` if
/// every challenge was sycophantic.
pub fn handle_commit(ctx: &mut ConsensusContext) -> Result<(), DuhError> {
    let revision = ctx
        .revision
        .clone()
        .ok_or_else(|| DuhError::Consensus("COMMIT requires a revision".into()))?;
    ctx.decision = Some(revision);
    ctx.rigor = compute_rigor(&ctx.challenges);
    let intent = ctx.taxonomy.as_ref().map(|(intent, _, _)| intent.as_str());
    ctx.confidence = compute_confidence(intent, ctx.rigor);

    let dissent_parts: Vec<String> = ctx
        .challenges
        .iter()
        .filter(|c| !c.sycophantic)
        .map(|c| format!("[{}]: {}", c.model_ref, c.content))
        .collect();
    ctx.dissent = if dissent_parts.is_empty() {
        None
    } else {
        Some(dissent_parts.join("\n\n"))
    };
    Ok(())
}

/// Best-effort `{intent, category, genus}` classification using the
/// cheapest eligible model with JSON response format. Failures are
/// swallowed — the caller leaves `ctx.taxonomy` unset on error, matching
/// the original's graceful-`unknown`-on-any-exception idiom.
pub async fn classify_taxonomy(ctx: &mut ConsensusContext, pm: &ProviderManager) {
    let Some(cheapest) = pm
        .list_all_models()
        .into_iter()
        .min_by(|a, b| a.input_cost_per_mtok.partial_cmp(&b.input_cost_per_mtok).unwrap())
        .map(|m| m.model_ref())
    else {
        return;
    };

    let messages = vec![
        PromptMessage::system(
            "Classify the following question. Return strict JSON: \
             {\"intent\": one of factual|technical|creative|judgment|strategic, \
              \"category\": a short topic label, \"genus\": a one-word domain}.",
        ),
        PromptMessage::user(ctx.question.clone()),
    ];
    let mut opts = SendOptions::new();
    opts.response_format = Some(ResponseFormat::Json);
    opts.temperature = Some(0.0);

    let Ok(content) = send_with_retry(pm, &cheapest, &messages, &opts, None).await else {
        tracing::warn!("taxonomy classification failed, leaving intent unset");
        return;
    };

    let Ok(value) = serde_json::from_str::<serde_json::Value>(content.trim()) else {
        return;
    };
    let intent = value.get("intent").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
    let category = value.get("category").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let genus = value.get("genus").and_then(|v| v.as_str()).unwrap_or("").to_string();
    ctx.taxonomy = Some((intent, category, genus));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sycophancy_detected_case_insensitively_in_opener() {
        assert!(detect_sycophancy("Great Answer! Nothing to add."));
        assert!(detect_sycophancy("  i agree completely with this."));
    }

    #[test]
    fn sycophancy_not_flagged_for_genuine_rebuttal() {
        assert!(!detect_sycophancy(
            "I disagree — the O(n^2) step will dominate at scale."
        ));
    }

    #[test]
    fn sycophancy_marker_outside_200_char_window_is_ignored() {
        let padding = "x".repeat(250);
        let content = format!("{padding} great answer");
        assert!(!detect_sycophancy(&content));
    }

    #[tokio::test]
    async fn propose_on_a_pre_cancelled_token_never_calls_the_provider() {
        use crate::provider::mock::{model_info, MockProvider};

        let pm = ProviderManager::new(0.0);
        let provider = Arc::new(MockProvider::new("p1", vec![model_info("p1", "m1", 1.0, 1.0, true)]));
        provider.queue_responses("m1", vec!["should never be read".to_string()]);
        pm.register(provider.clone()).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let mut ctx = ConsensusContext::new("t1", "question?", 3);
        let err = handle_propose(&mut ctx, &pm, "p1:m1", None, Some(&token)).await.unwrap_err();
        assert!(matches!(err, DuhError::Consensus(_)));
        assert_eq!(provider.call_count("m1"), 0);
    }
}
