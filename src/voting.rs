use tokio_util::sync::CancellationToken;

use crate::error::DuhError;
use crate::manager::ProviderManager;
use crate::provider::{ModelInfo, PromptMessage, SendOptions};
use crate::retry::with_cancellation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VotingAggregationStrategy {
    Majority,
    Weighted,
}

impl VotingAggregationStrategy {
    fn as_str(self) -> &'static str {
        match self {
            Self::Majority => "majority",
            Self::Weighted => "weighted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct VoteResult {
    pub model_ref: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct VotingAggregation {
    pub votes: Vec<VoteResult>,
    pub decision: String,
    pub strategy: String,
    pub confidence: f64,
}

async fn collect_vote(
    question: &str,
    model_info: &ModelInfo,
    pm: &ProviderManager,
    cancel: Option<&CancellationToken>,
) -> Option<VoteResult> {
    let model_ref = model_info.model_ref();
    let (provider, model_id) = match pm.get_provider(&model_ref) {
        Ok(pair) => pair,
        Err(err) => {
            tracing::warn!(model_ref, error = %err, "vote routing failed");
            return None;
        }
    };
    let messages = vec![PromptMessage::user(question)];
    let mut opts = SendOptions::new();
    opts.temperature = Some(0.7);

    let sent = with_cancellation(cancel, provider.send(&messages, &model_id, &opts)).await;

    match sent {
        Ok(response) => {
            if let Err(err) = pm.record_usage(model_info, &response.usage) {
                tracing::warn!(model_ref, error = %err, "failed to record vote usage");
            }
            Some(VoteResult { model_ref, content: response.content })
        }
        Err(err) => {
            tracing::warn!(model_ref, error = %err, "vote failed");
            None
        }
    }
}

fn numbered_answers(votes: &[VoteResult]) -> String {
    votes
        .iter()
        .enumerate()
        .map(|(i, v)| format!("--- Answer {} (from {}) ---\n{}", i + 1, v.model_ref, v.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn numbered_answers_weighted(votes: &[VoteResult], pm: &ProviderManager) -> String {
    votes
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let weight = pm.get_model_info(&v.model_ref).map(|m| m.output_cost_per_mtok).unwrap_or(0.0);
            format!(
                "--- Answer {} (from {}, capability weight: {weight:.2}) ---\n{}",
                i + 1,
                v.model_ref,
                v.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

async fn aggregate_majority(
    question: &str,
    votes: &[VoteResult],
    pm: &ProviderManager,
    strongest: &ModelInfo,
    cancel: Option<&CancellationToken>,
) -> Result<VotingAggregation, DuhError> {
    let system = "You are selecting the best answer from multiple experts. \
         Read all the answers below and return the best answer, improving it \
         if possible. Do not mention that you are selecting from multiple answers.";
    let user = format!(
        "Original question: {question}\n\nExpert answers:\n{}\n\nReturn the best answer with any improvements.",
        numbered_answers(votes)
    );
    let messages = vec![PromptMessage::system(system), PromptMessage::user(user)];

    let (provider, model_id) = pm.get_provider(&strongest.model_ref())?;
    let mut opts = SendOptions::new();
    opts.temperature = Some(0.3);
    let response = with_cancellation(cancel, async {
        provider
            .send(&messages, &model_id, &opts)
            .await
            .map_err(|e| DuhError::Consensus(format!("meta-judge call failed: {e}")))
    })
    .await?;
    pm.record_usage(strongest, &response.usage)?;

    Ok(VotingAggregation {
        votes: votes.to_vec(),
        decision: response.content,
        strategy: "majority".to_string(),
        confidence: 0.8,
    })
}

async fn aggregate_weighted(
    question: &str,
    votes: &[VoteResult],
    pm: &ProviderManager,
    strongest: &ModelInfo,
    cancel: Option<&CancellationToken>,
) -> Result<VotingAggregation, DuhError> {
    let system = "You are synthesising answers from multiple experts into a single \
         comprehensive response. Higher-capability-weight answers should be \
         given more influence. Do not mention weights or that you are merging answers.";
    let user = format!(
        "Original question: {question}\n\nExpert answers with capability weights:\n{}\n\n\
         Synthesise into one comprehensive answer.",
        numbered_answers_weighted(votes, pm)
    );
    let messages = vec![PromptMessage::system(system), PromptMessage::user(user)];

    let (provider, model_id) = pm.get_provider(&strongest.model_ref())?;
    let mut opts = SendOptions::new();
    opts.temperature = Some(0.3);
    let response = with_cancellation(cancel, async {
        provider
            .send(&messages, &model_id, &opts)
            .await
            .map_err(|e| DuhError::Consensus(format!("meta-judge call failed: {e}")))
    })
    .await?;
    pm.record_usage(strongest, &response.usage)?;

    Ok(VotingAggregation {
        votes: votes.to_vec(),
        decision: response.content,
        strategy: "weighted".to_string(),
        confidence: 0.85,
    })
}

/// Fans out `question` to every registered model in parallel, drops
/// failures, and aggregates the survivors. Zero survivors yields an
/// empty aggregation with `confidence=0`; exactly one survivor is
/// returned verbatim with `confidence=1.0` and no meta-judge call.
pub async fn run_voting(
    question: &str,
    pm: &ProviderManager,
    aggregation: VotingAggregationStrategy,
    cancel: Option<&CancellationToken>,
) -> Result<VotingAggregation, DuhError> {
    let models = pm.list_all_models();
    if models.is_empty() {
        return Ok(VotingAggregation {
            votes: Vec::new(),
            decision: String::new(),
            strategy: aggregation.as_str().to_string(),
            confidence: 0.0,
        });
    }

    // A truly concurrent fan-out: every model is queried in parallel and
    // the phase completes once all have returned or failed, same as the
    // CHALLENGE phase's `JoinSet` fan-out but over borrowed `pm` since no
    // ownership needs to cross a spawn boundary here.
    use futures_util::StreamExt;
    let mut tasks = futures_util::stream::FuturesUnordered::new();
    for model_info in &models {
        tasks.push(collect_vote(question, model_info, pm, cancel));
    }
    let mut votes = Vec::new();
    while let Some(vote) = tasks.next().await {
        if let Some(vote) = vote {
            votes.push(vote);
        }
    }

    if votes.is_empty() {
        return Ok(VotingAggregation {
            votes: Vec::new(),
            decision: String::new(),
            strategy: aggregation.as_str().to_string(),
            confidence: 0.0,
        });
    }
    if votes.len() == 1 {
        let vote = votes.into_iter().next().unwrap();
        let decision = vote.content.clone();
        return Ok(VotingAggregation {
            votes: vec![vote],
            decision,
            strategy: aggregation.as_str().to_string(),
            confidence: 1.0,
        });
    }

    let strongest = models
        .iter()
        .max_by(|a, b| a.output_cost_per_mtok.partial_cmp(&b.output_cost_per_mtok).unwrap())
        .expect("models non-empty checked above")
        .clone();

    match aggregation {
        VotingAggregationStrategy::Weighted => aggregate_weighted(question, &votes, pm, &strongest, cancel).await,
        VotingAggregationStrategy::Majority => aggregate_majority(question, &votes, pm, &strongest, cancel).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::provider::mock::{model_info, MockProvider};

    #[tokio::test]
    async fn zero_models_returns_empty_aggregation() {
        let pm = ProviderManager::new(0.0);
        let result = run_voting("q", &pm, VotingAggregationStrategy::Majority, None).await.unwrap();
        assert_eq!(result.confidence, 0.0);
        assert!(result.votes.is_empty());
    }

    #[tokio::test]
    async fn single_survivor_is_returned_without_meta_judge() {
        let pm = ProviderManager::new(0.0);
        let provider = Arc::new(MockProvider::new("p1", vec![model_info("p1", "m1", 1.0, 1.0, true)]));
        provider.queue_responses("m1", vec!["Answer.".to_string()]);
        pm.register(provider).unwrap();

        let result = run_voting("q", &pm, VotingAggregationStrategy::Majority, None).await.unwrap();
        assert_eq!(result.decision, "Answer.");
        assert_eq!(result.confidence, 1.0);
    }

    #[tokio::test]
    async fn multiple_votes_invoke_meta_judge_for_majority() {
        let pm = ProviderManager::new(0.0);
        let p1 = Arc::new(MockProvider::new("p1", vec![model_info("p1", "m1", 1.0, 1.0, true)]));
        let p2 = Arc::new(MockProvider::new("p2", vec![model_info("p2", "m2", 1.0, 5.0, true)]));
        p1.queue_responses("m1", vec!["answer one".to_string()]);
        p2.queue_responses("m2", vec!["the best synthesized answer".to_string()]);
        pm.register(p1).unwrap();
        pm.register(p2.clone()).unwrap();

        let result = run_voting("q", &pm, VotingAggregationStrategy::Majority, None).await.unwrap();
        assert_eq!(result.strategy, "majority");
        assert_eq!(result.confidence, 0.8);
        assert_eq!(p2.call_count("m2"), 2);
    }

    #[tokio::test]
    async fn meta_judge_failure_propagates_instead_of_degrading_silently() {
        // Hard limit sized so the two vote calls land under it but the
        // meta-judge call (routed to p2, the strongest model) pushes the
        // running total over, making `record_usage` fail for real.
        let pm = ProviderManager::new(0.0006);
        let p1 = Arc::new(MockProvider::new("p1", vec![model_info("p1", "m1", 1.0, 1.0, true)]));
        let p2 = Arc::new(MockProvider::new("p2", vec![model_info("p2", "m2", 1.0, 5.0, true)]));
        p1.queue_responses("m1", vec!["answer one".to_string()]);
        p2.queue_responses("m2", vec!["answer two".to_string(), "synthesized answer".to_string()]);
        pm.register(p1).unwrap();
        pm.register(p2).unwrap();

        let err = run_voting("q", &pm, VotingAggregationStrategy::Majority, None).await.unwrap_err();
        assert!(matches!(err, DuhError::CostLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn pre_cancelled_token_stops_every_vote_before_it_reaches_a_provider() {
        let pm = ProviderManager::new(0.0);
        let p1 = Arc::new(MockProvider::new("p1", vec![model_info("p1", "m1", 1.0, 1.0, true)]));
        let p2 = Arc::new(MockProvider::new("p2", vec![model_info("p2", "m2", 1.0, 1.0, true)]));
        p1.queue_responses("m1", vec!["answer one".to_string()]);
        p2.queue_responses("m2", vec!["answer two".to_string()]);
        pm.register(p1.clone()).unwrap();
        pm.register(p2.clone()).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let result = run_voting("q", &pm, VotingAggregationStrategy::Majority, Some(&token)).await.unwrap();
        assert_eq!(result.confidence, 0.0);
        assert!(result.votes.is_empty());
        assert_eq!(p1.call_count("m1"), 0);
        assert_eq!(p2.call_count("m2"), 0);
    }
}
