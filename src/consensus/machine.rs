use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::DuhError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsensusState {
    Idle,
    Decompose,
    Propose,
    Challenge,
    Revise,
    Commit,
    Complete,
    Failed,
}

impl ConsensusState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct ChallengeResult {
    pub model_ref: String,
    pub content: String,
    pub sycophantic: bool,
    /// Which challenge type (from `consensus.challenge_types`) this
    /// challenger was asked to argue from, e.g. `"flaw"` or
    /// `"devils_advocate"`.
    pub framing: String,
}

#[derive(Debug, Clone)]
pub struct RoundResult {
    pub round_number: u32,
    pub proposal: String,
    pub proposal_model: String,
    pub challenges: Vec<ChallengeResult>,
    pub revision: String,
    pub decision: String,
    pub confidence: f64,
    pub rigor: f64,
    pub dissent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SubtaskSpec {
    pub label: String,
    pub description: String,
    pub dependencies: HashSet<String>,
}

/// Mutable bag owned by exactly one state machine for the duration of a
/// consensus session.
#[derive(Debug, Clone)]
pub struct ConsensusContext {
    pub thread_id: String,
    pub question: String,
    pub max_rounds: u32,
    pub state: ConsensusState,
    pub current_round: u32,
    pub proposal: Option<String>,
    pub proposal_model: Option<String>,
    pub challenges: Vec<ChallengeResult>,
    pub revision: Option<String>,
    pub decision: Option<String>,
    pub confidence: f64,
    pub rigor: f64,
    pub dissent: Option<String>,
    pub converged: bool,
    pub round_history: Vec<RoundResult>,
    pub subtasks: Vec<SubtaskSpec>,
    pub taxonomy: Option<(String, String, String)>,
    pub tool_calls_log: Vec<String>,
    pub error: Option<String>,
}

impl ConsensusContext {
    pub fn new(thread_id: impl Into<String>, question: impl Into<String>, max_rounds: u32) -> Self {
        Self {
            thread_id: thread_id.into(),
            question: question.into(),
            max_rounds,
            state: ConsensusState::Idle,
            current_round: 0,
            proposal: None,
            proposal_model: None,
            challenges: Vec::new(),
            revision: None,
            decision: None,
            confidence: 0.0,
            rigor: 0.0,
            dissent: None,
            converged: false,
            round_history: Vec::new(),
            subtasks: Vec::new(),
            taxonomy: None,
            tool_calls_log: Vec::new(),
            error: None,
        }
    }

    fn clear_working_round(&mut self) {
        self.proposal = None;
        self.proposal_model = None;
        self.challenges.clear();
        self.revision = None;
        self.decision = None;
        self.confidence = 0.0;
        self.rigor = 0.0;
        self.dissent = None;
    }

    fn archive_round(&mut self) {
        let round = RoundResult {
            round_number: self.current_round,
            proposal: self.proposal.clone().unwrap_or_default(),
            proposal_model: self.proposal_model.clone().unwrap_or_default(),
            challenges: self.challenges.clone(),
            revision: self.revision.clone().unwrap_or_default(),
            decision: self.decision.clone().unwrap_or_default(),
            confidence: self.confidence,
            rigor: self.rigor,
            dissent: self.dissent.clone(),
        };
        self.round_history.push(round);
    }
}

fn legal_targets(from: ConsensusState) -> &'static [ConsensusState] {
    use ConsensusState::*;
    match from {
        Idle => &[Propose, Decompose],
        Decompose => &[Propose],
        Propose => &[Challenge],
        Challenge => &[Revise],
        Revise => &[Commit],
        Commit => &[Propose, Complete],
        Complete => &[],
        Failed => &[],
    }
}

/// Drives the PROPOSE → CHALLENGE → REVISE → COMMIT protocol. Performs
/// no IO itself — handlers perform IO, then call `transition`.
pub struct ConsensusStateMachine<'a> {
    pub context: &'a mut ConsensusContext,
}

impl<'a> ConsensusStateMachine<'a> {
    pub fn new(context: &'a mut ConsensusContext) -> Self {
        Self { context }
    }

    /// Currently legal next states, `FAILED` always offered from a
    /// non-terminal state, for interactive tooling.
    pub fn valid_transitions(&self) -> Vec<ConsensusState> {
        if self.context.state.is_terminal() {
            return Vec::new();
        }
        let mut targets = legal_targets(self.context.state).to_vec();
        targets.push(ConsensusState::Failed);
        targets
    }

    pub fn can_transition(&self, to: ConsensusState) -> bool {
        legal_targets(self.context.state).contains(&to) || to == ConsensusState::Failed
    }

    fn check_guard(&self, to: ConsensusState) -> Result<(), DuhError> {
        use ConsensusState::*;
        match (self.context.state, to) {
            (Idle, Decompose) | (Idle, Propose) | (Decompose, Propose) => {
                if self.context.question.trim().is_empty() {
                    return Err(DuhError::Consensus("question must be non-empty".into()));
                }
            }
            (Commit, Propose) => {
                if self.context.converged || self.context.current_round >= self.context.max_rounds {
                    return Err(DuhError::Consensus(
                        "cannot start a new round: already converged or max_rounds reached".into(),
                    ));
                }
            }
            (_, Challenge) => {
                if self.context.proposal.is_none() {
                    return Err(DuhError::Consensus("CHALLENGE requires a proposal".into()));
                }
            }
            (_, Revise) => {
                if self.context.challenges.is_empty() {
                    return Err(DuhError::Consensus("REVISE requires at least one challenge".into()));
                }
            }
            (_, Commit) => {
                if self.context.revision.is_none() {
                    return Err(DuhError::Consensus("COMMIT requires a revision".into()));
                }
            }
            (Commit, Complete) => {
                if !(self.context.converged || self.context.current_round >= self.context.max_rounds) {
                    return Err(DuhError::Consensus(
                        "cannot complete: not converged and rounds remain".into(),
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn validate_transition(&self, to: ConsensusState) -> Result<(), DuhError> {
        if self.context.state.is_terminal() {
            return Err(DuhError::Consensus(format!(
                "cannot transition out of terminal state {:?}",
                self.context.state
            )));
        }
        if !self.can_transition(to) {
            return Err(DuhError::Consensus(format!(
                "illegal transition {:?} -> {:?}",
                self.context.state, to
            )));
        }
        self.check_guard(to)
    }

    pub fn transition(&mut self, to: ConsensusState) -> Result<(), DuhError> {
        self.validate_transition(to)?;

        use ConsensusState::*;
        match (self.context.state, to) {
            (Idle, Propose) | (Decompose, Propose) => {
                self.context.current_round = 1;
                self.context.clear_working_round();
            }
            (Commit, Propose) => {
                self.context.archive_round();
                self.context.current_round += 1;
                self.context.clear_working_round();
            }
            (_, Complete) => {
                self.context.archive_round();
            }
            _ => {}
        }
        self.context.state = to;
        Ok(())
    }

    /// Transitions to `FAILED`, recording `message` on the context.
    /// Errors, leaving the context untouched, if already in a terminal
    /// state — `FAILED` is reachable from any *non-terminal* state only.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), DuhError> {
        if self.context.state.is_terminal() {
            return Err(DuhError::Consensus(format!(
                "cannot fail: already in terminal state {:?}",
                self.context.state
            )));
        }
        self.context.error = Some(message.into());
        self.context.state = ConsensusState::Failed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ConsensusContext {
        ConsensusContext::new("t1", "what should we do?", 3)
    }

    #[test]
    fn propose_requires_nonempty_question() {
        let mut context = ConsensusContext::new("t1", "", 3);
        let mut sm = ConsensusStateMachine::new(&mut context);
        assert!(sm.transition(ConsensusState::Propose).is_err());
    }

    #[test]
    fn full_round_then_new_round_on_non_convergence() {
        let mut context = ctx();
        let mut sm = ConsensusStateMachine::new(&mut context);
        sm.transition(ConsensusState::Propose).unwrap();
        assert_eq!(sm.context.current_round, 1);
        sm.context.proposal = Some("proposal text".into());
        sm.transition(ConsensusState::Challenge).unwrap();
        sm.context.challenges.push(ChallengeResult {
            model_ref: "m2".into(),
            content: "a challenge".into(),
            sycophantic: false,
            framing: "flaw".into(),
        });
        sm.transition(ConsensusState::Revise).unwrap();
        sm.context.revision = Some("revised text".into());
        sm.transition(ConsensusState::Commit).unwrap();
        sm.context.decision = Some("revised text".into());

        sm.transition(ConsensusState::Propose).unwrap();
        assert_eq!(sm.context.current_round, 2);
        assert_eq!(sm.context.round_history.len(), 1);
        assert!(sm.context.proposal.is_none());
    }

    #[test]
    fn commit_to_complete_requires_convergence_or_exhausted_rounds() {
        let mut context = ctx();
        let mut sm = ConsensusStateMachine::new(&mut context);
        sm.transition(ConsensusState::Propose).unwrap();
        sm.context.proposal = Some("p".into());
        sm.transition(ConsensusState::Challenge).unwrap();
        sm.context.challenges.push(ChallengeResult {
            model_ref: "m2".into(),
            content: "c".into(),
            sycophantic: false,
            framing: "flaw".into(),
        });
        sm.transition(ConsensusState::Revise).unwrap();
        sm.context.revision = Some("r".into());
        sm.transition(ConsensusState::Commit).unwrap();

        assert!(sm.transition(ConsensusState::Complete).is_err());
        sm.context.converged = true;
        assert!(sm.transition(ConsensusState::Complete).is_ok());
        assert_eq!(sm.context.round_history.len(), 1);
    }

    #[test]
    fn valid_transitions_always_offers_failed_from_non_terminal() {
        let mut context = ctx();
        let sm = ConsensusStateMachine::new(&mut context);
        assert!(sm.valid_transitions().contains(&ConsensusState::Failed));
    }

    #[test]
    fn terminal_states_offer_no_transitions() {
        let mut context = ctx();
        context.state = ConsensusState::Complete;
        let sm = ConsensusStateMachine::new(&mut context);
        assert!(sm.valid_transitions().is_empty());
    }

    #[test]
    fn fail_transitions_a_non_terminal_context_to_failed() {
        let mut context = ctx();
        let mut sm = ConsensusStateMachine::new(&mut context);
        sm.fail("provider exhausted retries").unwrap();
        assert_eq!(sm.context.state, ConsensusState::Failed);
        assert_eq!(sm.context.error.as_deref(), Some("provider exhausted retries"));
    }

    #[test]
    fn fail_is_rejected_from_an_already_terminal_state() {
        let mut context = ctx();
        context.state = ConsensusState::Complete;
        let mut sm = ConsensusStateMachine::new(&mut context);
        assert!(sm.fail("too late").is_err());
        assert_eq!(sm.context.state, ConsensusState::Complete);
        assert!(sm.context.error.is_none());

        context.state = ConsensusState::Failed;
        context.error = Some("first failure".to_string());
        let mut sm = ConsensusStateMachine::new(&mut context);
        assert!(sm.fail("second failure").is_err());
        assert_eq!(sm.context.error.as_deref(), Some("first failure"));
    }
}
