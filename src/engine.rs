use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::DuhConfig;
use crate::consensus::convergence::check_convergence;
use crate::consensus::handlers::{
    classify_taxonomy, handle_challenge, handle_commit, handle_propose, handle_revise, select_challengers, select_proposer,
    ToolContext,
};
use crate::consensus::machine::{ConsensusContext, ConsensusState, ConsensusStateMachine};
use crate::decompose::handle_decompose;
use crate::error::DuhError;
use crate::manager::ProviderManager;
use crate::scheduler::schedule_subtasks;
use crate::synthesis::{synthesize, SynthesisStrategy};
use crate::tools::ToolRegistry;

/// Summary returned by `run_consensus`/`run_decompose` once a session
/// reaches `COMPLETE`.
#[derive(Debug, Clone)]
pub struct ConsensusOutcome {
    pub decision: String,
    pub confidence: f64,
    pub dissent: Option<String>,
    pub cost: f64,
    pub rounds_used: u32,
}

/// One event of the `stream_consensus` wire sequence. Field names match
/// the WebSocket event tags verbatim so a transport adapter can project
/// this directly to JSON.
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    PhaseStart { phase: &'static str, round: u32, model: Option<String>, models: Option<Vec<String>> },
    PhaseComplete { phase: &'static str, content: Option<String> },
    Challenge { model: String, content: String },
    Commit { round: u32, confidence: f64, dissent: Option<String> },
    Complete { decision: String, confidence: f64, dissent: Option<String>, cost: f64 },
    Error { message: String },
}

/// Caller-supplied consumer of `stream_consensus` events, e.g. a
/// WebSocket frame writer. Implementors decide how (or whether) to
/// surface a sink failure; `stream_consensus` does not retry sends.
pub trait EventSink {
    fn emit(&mut self, event: ConsensusEvent);
}

async fn run_round(
    ctx: &mut ConsensusContext,
    pm: &Arc<ProviderManager>,
    min_challengers: usize,
    panel: Option<&[String]>,
    challenge_types: &[String],
    tools: Option<&ToolContext<'_>>,
    cancel: Option<&CancellationToken>,
) -> Result<(), DuhError> {
    if let Some(token) = cancel {
        if token.is_cancelled() {
            return Err(DuhError::Consensus("session cancelled".to_string()));
        }
    }

    let mut sm = ConsensusStateMachine::new(ctx);

    sm.transition(ConsensusState::Propose)?;
    let proposer = select_proposer(pm, sm.context, panel)?;
    handle_propose(sm.context, pm, &proposer, tools, cancel).await?;

    sm.transition(ConsensusState::Challenge)?;
    let challengers = select_challengers(pm, &proposer, min_challengers, panel)?;
    handle_challenge(sm.context, pm.clone(), &challengers, challenge_types, cancel).await?;

    sm.transition(ConsensusState::Revise)?;
    handle_revise(sm.context, pm, tools, cancel).await?;

    sm.transition(ConsensusState::Commit)?;
    handle_commit(sm.context)?;
    check_convergence(sm.context);
    Ok(())
}

/// Drives the state machine end to end: repeats PROPOSE → CHALLENGE →
/// REVISE → COMMIT until convergence or `max_rounds` is exhausted, then
/// transitions to COMPLETE. `panel`, if given, restricts proposer and
/// challenger eligibility to that set of `model_ref`s. `tool_registry`,
/// if given, drives the proposer/reviser through the tool-augmented send
/// loop (§4.5) instead of a single call, capped at `config.tools.max_rounds`.
pub async fn run_consensus(
    question: &str,
    config: &DuhConfig,
    pm: Arc<ProviderManager>,
    panel: Option<&[String]>,
    tool_registry: Option<&dyn ToolRegistry>,
    cancel: Option<CancellationToken>,
) -> Result<ConsensusOutcome, DuhError> {
    let mut ctx = ConsensusContext::new(String::new(), question, config.general.max_rounds);
    if config.taxonomy.enabled {
        classify_taxonomy(&mut ctx, &pm).await;
    }
    let tools = tool_registry.filter(|_| config.tools.enabled).map(|registry| ToolContext {
        registry,
        max_rounds: config.tools.max_rounds,
    });

    let result = run_consensus_loop(
        &mut ctx,
        &pm,
        config.consensus.min_challengers,
        panel,
        &config.consensus.challenge_types,
        tools.as_ref(),
        cancel.as_ref(),
    )
    .await;
    match result {
        Ok(()) => Ok(ConsensusOutcome {
            decision: ctx.decision.unwrap_or_default(),
            confidence: ctx.confidence,
            dissent: ctx.dissent,
            cost: pm.total_cost(),
            rounds_used: ctx.current_round,
        }),
        Err(err) => {
            let mut sm = ConsensusStateMachine::new(&mut ctx);
            if let Err(fail_err) = sm.fail(err.to_string()) {
                tracing::warn!(error = %fail_err, "session already terminal, not re-failing");
            }
            Err(err)
        }
    }
}

async fn run_consensus_loop(
    ctx: &mut ConsensusContext,
    pm: &Arc<ProviderManager>,
    min_challengers: usize,
    panel: Option<&[String]>,
    challenge_types: &[String],
    tools: Option<&ToolContext<'_>>,
    cancel: Option<&CancellationToken>,
) -> Result<(), DuhError> {
    loop {
        run_round(ctx, pm, min_challengers, panel, challenge_types, tools, cancel).await?;

        let mut sm = ConsensusStateMachine::new(ctx);
        if sm.context.converged || sm.context.current_round >= sm.context.max_rounds {
            sm.transition(ConsensusState::Complete)?;
            return Ok(());
        }
        sm.transition(ConsensusState::Propose)?;
    }
}

/// Re-exported verbatim: the all-model fan-out voting protocol (§4.10)
/// takes no consensus context of its own.
pub use crate::voting::{run_voting, VotingAggregationStrategy};

/// Pipelines decomposition, per-subtask mini-consensus, and synthesis.
/// If the decomposer returns exactly one subtask, falls back to a plain
/// `run_consensus` call on the original question — decomposition adds
/// nothing when there is only one piece of work.
pub async fn run_decompose(
    question: &str,
    config: &DuhConfig,
    pm: Arc<ProviderManager>,
    cancel: Option<CancellationToken>,
) -> Result<ConsensusOutcome, DuhError> {
    let mut ctx = ConsensusContext::new(String::new(), question, config.general.max_rounds);
    let mut sm = ConsensusStateMachine::new(&mut ctx);
    sm.transition(ConsensusState::Decompose)?;
    let subtasks = handle_decompose(sm.context, &pm, config.decompose.max_subtasks).await?;

    if subtasks.len() == 1 {
        return run_consensus(question, config, pm, None, None, cancel).await;
    }

    let results = schedule_subtasks(subtasks, question, pm.clone(), config.decompose.parallel, cancel).await?;
    let synthesis = synthesize(question, &results, &pm, SynthesisStrategy::Merge).await?;

    Ok(ConsensusOutcome {
        decision: synthesis.content,
        confidence: synthesis.confidence,
        dissent: None,
        cost: pm.total_cost(),
        rounds_used: 1,
    })
}

/// Drives the same PROPOSE → CHALLENGE → REVISE → COMMIT loop as
/// `run_consensus`, emitting one `ConsensusEvent` per step of the wire
/// sequence documented for the WebSocket transport. On any error, emits
/// a terminal `Error` event and returns it — no `Complete` event follows.
pub async fn stream_consensus(
    question: &str,
    config: &DuhConfig,
    pm: Arc<ProviderManager>,
    sink: &mut dyn EventSink,
    cancel: Option<CancellationToken>,
) -> Result<(), DuhError> {
    let mut ctx = ConsensusContext::new(String::new(), question, config.general.max_rounds);
    let min_challengers = config.consensus.min_challengers;

    let outcome = stream_consensus_loop(&mut ctx, &pm, min_challengers, sink, &config.consensus.challenge_types, cancel.as_ref()).await;
    match outcome {
        Ok(()) => {
            sink.emit(ConsensusEvent::Complete {
                decision: ctx.decision.clone().unwrap_or_default(),
                confidence: ctx.confidence,
                dissent: ctx.dissent.clone(),
                cost: pm.total_cost(),
            });
            Ok(())
        }
        Err(err) => {
            sink.emit(ConsensusEvent::Error { message: err.user_message() });
            Err(err)
        }
    }
}

async fn stream_consensus_loop(
    ctx: &mut ConsensusContext,
    pm: &Arc<ProviderManager>,
    min_challengers: usize,
    sink: &mut dyn EventSink,
    challenge_types: &[String],
    cancel: Option<&CancellationToken>,
) -> Result<(), DuhError> {
    loop {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                return Err(DuhError::Consensus("session cancelled".to_string()));
            }
        }

        let mut sm = ConsensusStateMachine::new(ctx);
        sm.transition(ConsensusState::Propose)?;
        let round = sm.context.current_round;
        let proposer = select_proposer(pm, sm.context, None)?;
        sink.emit(ConsensusEvent::PhaseStart {
            phase: "PROPOSE",
            round,
            model: Some(proposer.clone()),
            models: None,
        });
        handle_propose(sm.context, pm, &proposer, None, cancel).await?;
        sink.emit(ConsensusEvent::PhaseComplete {
            phase: "PROPOSE",
            content: sm.context.proposal.clone(),
        });

        sm.transition(ConsensusState::Challenge)?;
        let challengers = select_challengers(pm, &proposer, min_challengers, None)?;
        sink.emit(ConsensusEvent::PhaseStart {
            phase: "CHALLENGE",
            round,
            model: None,
            models: Some(challengers.clone()),
        });
        handle_challenge(sm.context, pm.clone(), &challengers, challenge_types, cancel).await?;
        for challenge in &sm.context.challenges {
            sink.emit(ConsensusEvent::Challenge {
                model: challenge.model_ref.clone(),
                content: challenge.content.clone(),
            });
        }
        sink.emit(ConsensusEvent::PhaseComplete { phase: "CHALLENGE", content: None });

        sm.transition(ConsensusState::Revise)?;
        sink.emit(ConsensusEvent::PhaseStart {
            phase: "REVISE",
            round,
            model: sm.context.proposal_model.clone(),
            models: None,
        });
        handle_revise(sm.context, pm, None, cancel).await?;
        sink.emit(ConsensusEvent::PhaseComplete {
            phase: "REVISE",
            content: sm.context.revision.clone(),
        });

        sm.transition(ConsensusState::Commit)?;
        handle_commit(sm.context)?;
        check_convergence(sm.context);
        sink.emit(ConsensusEvent::Commit {
            round,
            confidence: sm.context.confidence,
            dissent: sm.context.dissent.clone(),
        });

        if sm.context.converged || sm.context.current_round >= sm.context.max_rounds {
            sm.transition(ConsensusState::Complete)?;
            return Ok(());
        }
        sm.transition(ConsensusState::Propose)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::{model_info, MockProvider};

    fn panel_of_three(pm: &ProviderManager) {
        let p1 = Arc::new(MockProvider::new("p1", vec![model_info("p1", "m1", 1.0, 1.0, true)]));
        let p2 = Arc::new(MockProvider::new("p2", vec![model_info("p2", "m2", 1.0, 1.0, true)]));
        let p3 = Arc::new(MockProvider::new("p3", vec![model_info("p3", "m3", 1.0, 1.0, true)]));
        p1.queue_responses("m1", vec!["PostgreSQL adds complexity".to_string(), "PostgreSQL adds operational complexity".to_string()]);
        p2.queue_responses("m2", vec!["PostgreSQL adds complexity".to_string(), "PostgreSQL adds operational complexity".to_string()]);
        p3.queue_responses("m3", vec!["PostgreSQL adds complexity".to_string(), "PostgreSQL adds operational complexity".to_string()]);
        pm.register(p1).unwrap();
        pm.register(p2).unwrap();
        pm.register(p3).unwrap();
    }

    #[tokio::test]
    async fn run_consensus_converges_within_max_rounds() {
        let pm = Arc::new(ProviderManager::new(0.0));
        panel_of_three(&pm);
        let config = DuhConfig::default();

        let outcome = run_consensus("should we use postgres?", &config, pm, None, None, None).await.unwrap();
        assert!(outcome.rounds_used <= config.general.max_rounds);
        assert!(!outcome.decision.is_empty());
    }

    #[tokio::test]
    async fn pre_cancelled_token_aborts_before_any_round_runs() {
        let pm = Arc::new(ProviderManager::new(0.0));
        panel_of_three(&pm);
        let config = DuhConfig::default();
        let token = CancellationToken::new();
        token.cancel();

        let err = run_consensus("should we use postgres?", &config, pm, None, None, Some(token))
            .await
            .unwrap_err();
        assert!(matches!(err, DuhError::Consensus(_)));
    }

    #[tokio::test]
    async fn run_consensus_drives_proposer_through_tool_registry() {
        use crate::tools::{ToolCall, ToolResult};

        struct CountingRegistry {
            calls: std::sync::atomic::AtomicUsize,
        }
        #[async_trait::async_trait]
        impl ToolRegistry for CountingRegistry {
            fn list_definitions(&self) -> Vec<crate::provider::ToolDefinition> {
                vec![crate::provider::ToolDefinition {
                    name: "lookup".to_string(),
                    description: "looks something up".to_string(),
                    parameters: serde_json::json!({"type": "object"}),
                }]
            }
            async fn execute(&self, _call: &ToolCall) -> ToolResult {
                self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                ToolResult { content: "looked up".to_string(), is_error: false }
            }
        }

        let pm = Arc::new(ProviderManager::new(0.0));
        panel_of_three(&pm);
        let mut config = DuhConfig::default();
        config.tools.enabled = true;
        config.tools.max_rounds = 3;
        let registry = CountingRegistry { calls: std::sync::atomic::AtomicUsize::new(0) };

        let outcome = run_consensus("should we use postgres?", &config, pm, None, Some(&registry), None).await.unwrap();
        assert!(!outcome.decision.is_empty());
    }

    struct CollectingSink {
        events: Vec<ConsensusEvent>,
    }
    impl EventSink for CollectingSink {
        fn emit(&mut self, event: ConsensusEvent) {
            self.events.push(event);
        }
    }

    #[tokio::test]
    async fn stream_consensus_emits_complete_as_final_event() {
        let pm = Arc::new(ProviderManager::new(0.0));
        panel_of_three(&pm);
        let config = DuhConfig::default();
        let mut sink = CollectingSink { events: Vec::new() };

        stream_consensus("should we use postgres?", &config, pm, &mut sink, None).await.unwrap();
        assert!(matches!(sink.events.last(), Some(ConsensusEvent::Complete { .. })));
    }
}
