use crate::error::DuhError;
use crate::manager::ProviderManager;
use crate::provider::{PromptMessage, SendOptions};
use crate::scheduler::SubtaskResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisStrategy {
    Merge,
    Prioritize,
}

impl SynthesisStrategy {
    fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Prioritize => "prioritize",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisResult {
    pub content: String,
    pub confidence: f64,
    pub rigor: f64,
    pub strategy: String,
}

fn subtask_block(results: &[SubtaskResult]) -> String {
    results
        .iter()
        .map(|r| format!("## {} (confidence: {:.2})\n{}", r.label, r.confidence, r.decision))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn build_merge_prompt(question: &str, results: &[SubtaskResult]) -> Vec<PromptMessage> {
    let system = "You are an expert synthesizer. You are given a question that was \
         broken into subtasks, each answered independently. Your job is to \
         combine these subtask answers into a single, coherent, comprehensive \
         final answer.\n\n\
         Rules:\n\
         - Integrate all subtask results into a unified response\n\
         - Resolve any contradictions between subtask answers\n\
         - Ensure the final answer directly addresses the original question\n\
         - Do not mention the decomposition process or subtasks\n\
         - Produce a clear, well-structured answer";
    let user = format!(
        "Original question: {question}\n\nSubtask results:\n\n{}\n\n\
         Synthesize these into a single comprehensive answer to the original question.",
        subtask_block(results)
    );
    vec![PromptMessage::system(system), PromptMessage::user(user)]
}

fn build_prioritize_prompt(question: &str, results: &[SubtaskResult]) -> Vec<PromptMessage> {
    let mut sorted = results.to_vec();
    sorted.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap());
    let system = "You are an expert synthesizer. You are given a question that was \
         broken into subtasks, each answered independently with a confidence \
         score. Your job is to combine these into a final answer, giving MORE \
         weight to higher-confidence subtask answers.\n\n\
         Rules:\n\
         - Higher-confidence subtask results should dominate the final answer\n\
         - Lower-confidence results should be included but with caveats\n\
         - If high and low confidence results contradict, prefer the high-confidence version\n\
         - Ensure the final answer directly addresses the original question\n\
         - Do not mention the decomposition process or confidence scores\n\
         - Produce a clear, well-structured answer";
    let user = format!(
        "Original question: {question}\n\nSubtask results (ordered by confidence, highest first):\n\n{}\n\n\
         Synthesize these into a single comprehensive answer, prioritizing higher-confidence results.",
        subtask_block(&sorted)
    );
    vec![PromptMessage::system(system), PromptMessage::user(user)]
}

/// Merges subtask results into a final answer using the strongest
/// registered model (highest output cost, as a capability proxy).
/// Aggregate confidence/rigor are the arithmetic mean over subtasks.
pub async fn synthesize(
    question: &str,
    results: &[SubtaskResult],
    pm: &ProviderManager,
    strategy: SynthesisStrategy,
) -> Result<SynthesisResult, DuhError> {
    if results.is_empty() {
        return Err(DuhError::Consensus("no subtask results to synthesize".into()));
    }

    let models = pm.list_all_models();
    let strongest = models
        .into_iter()
        .max_by(|a, b| a.output_cost_per_mtok.partial_cmp(&b.output_cost_per_mtok).unwrap())
        .ok_or_else(|| DuhError::Consensus("no models available for synthesis".into()))?;
    let (provider, model_id) = pm.get_provider(&strongest.model_ref())?;

    let messages = match strategy {
        SynthesisStrategy::Merge => build_merge_prompt(question, results),
        SynthesisStrategy::Prioritize => build_prioritize_prompt(question, results),
    };
    let mut opts = SendOptions::new();
    opts.max_tokens = Some(4096);
    opts.temperature = Some(0.5);

    let response = provider
        .send(&messages, &model_id, &opts)
        .await
        .map_err(|e| DuhError::Consensus(format!("synthesis model call failed: {e}")))?;
    pm.record_usage(&strongest, &response.usage)?;

    let confidence = results.iter().map(|r| r.confidence).sum::<f64>() / results.len() as f64;
    let rigor = results.iter().map(|r| r.rigor).sum::<f64>() / results.len() as f64;

    Ok(SynthesisResult {
        content: response.content,
        confidence,
        rigor,
        strategy: strategy.as_str().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::provider::mock::{model_info, MockProvider};

    fn result(label: &str, confidence: f64, rigor: f64) -> SubtaskResult {
        SubtaskResult {
            label: label.to_string(),
            decision: format!("decision for {label}"),
            confidence,
            rigor,
        }
    }

    #[tokio::test]
    async fn empty_results_rejected() {
        let pm = ProviderManager::new(0.0);
        let err = synthesize("q", &[], &pm, SynthesisStrategy::Merge).await.unwrap_err();
        assert!(matches!(err, DuhError::Consensus(_)));
    }

    #[tokio::test]
    async fn aggregate_confidence_is_arithmetic_mean() {
        let pm = ProviderManager::new(0.0);
        pm.register(Arc::new(MockProvider::new("p1", vec![model_info("p1", "m1", 1.0, 2.0, true)])))
            .unwrap();
        let results = vec![result("a", 0.8, 0.9), result("b", 0.6, 0.7)];
        let synthesis = synthesize("q", &results, &pm, SynthesisStrategy::Merge).await.unwrap();
        assert!((synthesis.confidence - 0.7).abs() < 1e-9);
        assert!((synthesis.rigor - 0.8).abs() < 1e-9);
        assert_eq!(synthesis.strategy, "merge");
    }
}
