use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::consensus::handlers::{handle_challenge, handle_commit, handle_propose, handle_revise, select_challengers, select_proposer};
use crate::consensus::machine::{ConsensusContext, ConsensusState, ConsensusStateMachine, SubtaskSpec};
use crate::error::DuhError;
use crate::manager::ProviderManager;

const MINI_CONSENSUS_CHALLENGERS: usize = 2;

#[derive(Debug, Clone)]
pub struct SubtaskResult {
    pub label: String,
    pub decision: String,
    pub confidence: f64,
    pub rigor: f64,
}

/// Runs a single-round PROPOSE → CHALLENGE → REVISE → COMMIT cycle for
/// one subtask, reusing the consensus phase handlers directly — the
/// mini-consensus referenced in the scheduler's design.
async fn execute_subtask(
    subtask: SubtaskSpec,
    question: String,
    pm: Arc<ProviderManager>,
    prior_results: HashMap<String, SubtaskResult>,
    cancel: Option<CancellationToken>,
) -> Result<SubtaskResult, DuhError> {
    let mut dep_parts: Vec<String> = Vec::new();
    for dep_label in &subtask.dependencies {
        if let Some(dep_result) = prior_results.get(dep_label) {
            dep_parts.push(format!("[{dep_label}]: {}", dep_result.decision));
        }
    }

    let mut augmented = format!(
        "Original question: {question}\n\nYour specific subtask: {}",
        subtask.description
    );
    if !dep_parts.is_empty() {
        augmented.push_str(&format!("\n\nContext from prior subtasks:\n{}", dep_parts.join("\n")));
    }

    let mut ctx = ConsensusContext::new(format!("subtask-{}", subtask.label), augmented, 1);
    let mut sm = ConsensusStateMachine::new(&mut ctx);

    sm.transition(ConsensusState::Propose)?;
    let proposer = select_proposer(&pm, sm.context, None)?;
    handle_propose(sm.context, &pm, &proposer, None, cancel.as_ref()).await?;

    sm.transition(ConsensusState::Challenge)?;
    let challengers = select_challengers(&pm, &proposer, MINI_CONSENSUS_CHALLENGERS, None)?;
    handle_challenge(sm.context, pm.clone(), &challengers, &[], cancel.as_ref()).await?;

    sm.transition(ConsensusState::Revise)?;
    handle_revise(sm.context, &pm, None, cancel.as_ref()).await?;

    sm.transition(ConsensusState::Commit)?;
    handle_commit(sm.context)?;

    Ok(SubtaskResult {
        label: subtask.label,
        decision: ctx.decision.unwrap_or_default(),
        confidence: ctx.confidence,
        rigor: ctx.rigor,
    })
}

/// Executes a validated subtask DAG respecting dependency order, using
/// Kahn's algorithm (indegree array + adjacency list + FIFO ready
/// queue) to determine each batch of runnable subtasks. Batches with
/// more than one ready subtask run concurrently via `JoinSet` when
/// `parallel` is set; otherwise subtasks run sequentially in label
/// order within the batch.
pub async fn schedule_subtasks(
    subtasks: Vec<SubtaskSpec>,
    question: &str,
    pm: Arc<ProviderManager>,
    parallel: bool,
    cancel: Option<CancellationToken>,
) -> Result<Vec<SubtaskResult>, DuhError> {
    if subtasks.is_empty() {
        return Err(DuhError::Consensus("no subtasks to schedule".into()));
    }

    let mut indegree: HashMap<String, usize> = subtasks.iter().map(|s| (s.label.clone(), 0)).collect();
    let mut adjacency: HashMap<String, Vec<String>> = subtasks.iter().map(|s| (s.label.clone(), Vec::new())).collect();
    let mut by_label: HashMap<String, SubtaskSpec> = HashMap::new();
    for subtask in subtasks {
        for dep in &subtask.dependencies {
            adjacency.get_mut(dep).unwrap().push(subtask.label.clone());
            *indegree.get_mut(&subtask.label).unwrap() += 1;
        }
        by_label.insert(subtask.label.clone(), subtask);
    }

    let mut ready_vec: Vec<String> = indegree
        .iter()
        .filter(|(_, &degree)| degree == 0)
        .map(|(label, _)| label.clone())
        .collect();
    ready_vec.sort();

    let mut results = Vec::new();
    let mut prior_results: HashMap<String, SubtaskResult> = HashMap::new();
    let mut remaining = by_label.len();

    while !ready_vec.is_empty() {
        if let Some(token) = &cancel {
            if token.is_cancelled() {
                return Err(DuhError::Consensus("session cancelled".to_string()));
            }
        }

        let batch: Vec<SubtaskSpec> = ready_vec.drain(..).map(|label| by_label.remove(&label).unwrap()).collect();

        let batch_results = if parallel && batch.len() > 1 {
            let mut set = JoinSet::new();
            for subtask in batch {
                let pm = pm.clone();
                let question = question.to_string();
                let prior = prior_results.clone();
                let cancel = cancel.clone();
                set.spawn(async move { execute_subtask(subtask, question, pm, prior, cancel).await });
            }
            let mut out = Vec::new();
            while let Some(joined) = set.join_next().await {
                out.push(joined.map_err(|e| DuhError::Consensus(format!("subtask task panicked: {e}")))??);
            }
            out
        } else {
            let mut out = Vec::new();
            for subtask in batch {
                out.push(execute_subtask(subtask, question.to_string(), pm.clone(), prior_results.clone(), cancel.clone()).await?);
            }
            out
        };

        for result in batch_results {
            remaining -= 1;
            for neighbor in adjacency.get(&result.label).cloned().unwrap_or_default() {
                let degree = indegree.get_mut(&neighbor).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    ready_vec.push(neighbor);
                }
            }
            prior_results.insert(result.label.clone(), result.clone());
            results.push(result);
        }
        ready_vec.sort();
    }

    if remaining != 0 {
        return Err(DuhError::Consensus("cycle detected: not all subtasks could be scheduled".into()));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::{model_info, MockProvider};

    fn pm_with_panel() -> Arc<ProviderManager> {
        let pm = ProviderManager::new(0.0);
        let p1 = Arc::new(MockProvider::new(
            "p1",
            vec![model_info("p1", "m1", 1.0, 1.0, true)],
        ));
        let p2 = Arc::new(MockProvider::new(
            "p2",
            vec![model_info("p2", "m2", 1.0, 1.0, true)],
        ));
        let p3 = Arc::new(MockProvider::new(
            "p3",
            vec![model_info("p3", "m3", 1.0, 1.0, true)],
        ));
        pm.register(p1).unwrap();
        pm.register(p2).unwrap();
        pm.register(p3).unwrap();
        Arc::new(pm)
    }

    fn spec(label: &str, deps: &[&str]) -> SubtaskSpec {
        SubtaskSpec {
            label: label.to_string(),
            description: format!("describe {label}"),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn two_independent_subtasks_both_complete() {
        let pm = pm_with_panel();
        let subtasks = vec![spec("a", &[]), spec("b", &[])];
        let results = schedule_subtasks(subtasks, "question", pm, true, None).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn dependent_subtask_runs_after_its_dependency() {
        let pm = pm_with_panel();
        let subtasks = vec![spec("a", &[]), spec("b", &["a"])];
        let results = schedule_subtasks(subtasks, "question", pm, true, None).await.unwrap();
        let a_idx = results.iter().position(|r| r.label == "a").unwrap();
        let b_idx = results.iter().position(|r| r.label == "b").unwrap();
        assert!(a_idx < b_idx);
    }

    #[tokio::test]
    async fn empty_subtask_list_is_rejected() {
        let pm = pm_with_panel();
        let err = schedule_subtasks(Vec::new(), "question", pm, true, None).await.unwrap_err();
        assert!(matches!(err, DuhError::Consensus(_)));
    }

    #[tokio::test]
    async fn pre_cancelled_token_stops_scheduling_before_any_subtask_runs() {
        let pm = pm_with_panel();
        let subtasks = vec![spec("a", &[]), spec("b", &[])];
        let token = CancellationToken::new();
        token.cancel();
        let err = schedule_subtasks(subtasks, "question", pm, true, Some(token)).await.unwrap_err();
        assert!(matches!(err, DuhError::Consensus(_)));
    }
}
