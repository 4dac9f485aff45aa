use std::collections::HashSet;

use crate::consensus::machine::{ChallengeResult, ConsensusContext};

pub const DEFAULT_CONVERGENCE_THRESHOLD: f64 = 0.7;

/// Word-overlap similarity between two texts: lowercase, split on
/// whitespace, Jaccard over the resulting sets. Both-empty is maximal
/// agreement (1.0); exactly-one-empty is maximal disagreement (0.0).
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let set_a: HashSet<&str> = a.split_whitespace().collect();
    let set_b: HashSet<&str> = b.split_whitespace().collect();

    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }

    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

fn rounds_converged(current: &[ChallengeResult], previous: &[ChallengeResult], threshold: f64) -> bool {
    if current.is_empty() || previous.is_empty() {
        return false;
    }
    let lowered_a: Vec<String> = current.iter().map(|c| c.content.to_lowercase()).collect();
    let lowered_b: Vec<String> = previous.iter().map(|c| c.content.to_lowercase()).collect();

    let total: f64 = lowered_a
        .iter()
        .map(|cur| {
            lowered_b
                .iter()
                .map(|prev| jaccard_similarity(cur, prev))
                .fold(0.0_f64, f64::max)
        })
        .sum();
    let average = total / lowered_a.len() as f64;
    average >= threshold
}

/// Compares the current round's challenges against only the most
/// recently archived round's challenges. Round 1 (empty history) is
/// never converged. Sets `ctx.converged` as a side effect and returns it.
pub fn check_convergence(ctx: &mut ConsensusContext) -> bool {
    check_convergence_with_threshold(ctx, DEFAULT_CONVERGENCE_THRESHOLD)
}

pub fn check_convergence_with_threshold(ctx: &mut ConsensusContext, threshold: f64) -> bool {
    let converged = match ctx.round_history.last() {
        Some(previous) => rounds_converged(&ctx.challenges, &previous.challenges, threshold),
        None => false,
    };
    ctx.converged = converged;
    converged
}

/// `0.5` when there are no challenges to judge rigor from; otherwise
/// `0.5 + 0.5 * genuine_ratio`, range `[0.5, 1.0]`.
pub fn compute_rigor(challenges: &[ChallengeResult]) -> f64 {
    if challenges.is_empty() {
        return 0.5;
    }
    let genuine = challenges.iter().filter(|c| !c.sycophantic).count();
    0.5 + 0.5 * (genuine as f64 / challenges.len() as f64)
}

/// Per-`intent` epistemic ceiling; `confidence = min(cap, rigor)`.
pub fn domain_cap(intent: Option<&str>) -> f64 {
    match intent {
        Some("factual") => 0.95,
        Some("technical") => 0.90,
        Some("creative") => 0.85,
        Some("judgment") => 0.80,
        Some("strategic") => 0.70,
        _ => 0.85,
    }
}

pub fn compute_confidence(intent: Option<&str>, rigor: f64) -> f64 {
    domain_cap(intent).min(rigor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jaccard_identical_strings_is_one() {
        assert_eq!(jaccard_similarity("a b c", "a b c"), 1.0);
    }

    #[test]
    fn jaccard_both_empty_is_one() {
        assert_eq!(jaccard_similarity("", ""), 1.0);
    }

    #[test]
    fn jaccard_one_empty_is_zero() {
        assert_eq!(jaccard_similarity("a b", ""), 0.0);
    }

    #[test]
    fn jaccard_is_symmetric() {
        let a = "the quick brown fox";
        let b = "the slow brown dog";
        assert_eq!(jaccard_similarity(a, b), jaccard_similarity(b, a));
    }

    #[test]
    fn rigor_is_half_with_no_challenges() {
        assert_eq!(compute_rigor(&[]), 0.5);
    }

    #[test]
    fn rigor_monotonic_in_genuine_ratio() {
        let one_genuine = vec![ChallengeResult {
            model_ref: "m".into(),
            content: "c".into(),
            sycophantic: false,
            framing: "flaw".into(),
        }];
        let one_sycophantic = vec![ChallengeResult {
            model_ref: "m".into(),
            content: "c".into(),
            sycophantic: true,
            framing: "flaw".into(),
        }];
        assert!(compute_rigor(&one_genuine) > compute_rigor(&one_sycophantic));
    }

    #[test]
    fn sycophancy_filter_rigor_is_three_quarters() {
        let challenges = vec![
            ChallengeResult {
                model_ref: "m1".into(),
                content: "great answer nothing to add".into(),
                sycophantic: true,
                framing: "flaw".into(),
            },
            ChallengeResult {
                model_ref: "m2".into(),
                content: "i disagree the step will dominate".into(),
                sycophantic: false,
                framing: "flaw".into(),
            },
        ];
        assert_eq!(compute_rigor(&challenges), 0.75);
    }

    #[test]
    fn confidence_equals_cap_at_perfect_rigor() {
        assert_eq!(compute_confidence(Some("strategic"), 1.0), 0.70);
        assert_eq!(compute_confidence(Some("factual"), 1.0), 0.95);
    }

    #[test]
    fn confidence_bounded_by_rigor_below_cap() {
        assert_eq!(compute_confidence(Some("factual"), 0.75), 0.75);
    }

    #[test]
    fn round_one_never_converges() {
        let mut ctx = ConsensusContext::new("t", "q", 3);
        ctx.challenges.push(ChallengeResult {
            model_ref: "m".into(),
            content: "x".into(),
            sycophantic: false,
            framing: "flaw".into(),
        });
        assert!(!check_convergence(&mut ctx));
    }

    #[test]
    fn similar_consecutive_round_challenges_converge() {
        use crate::consensus::machine::RoundResult;
        let mut ctx = ConsensusContext::new("t", "q", 3);
        ctx.round_history.push(RoundResult {
            round_number: 1,
            proposal: String::new(),
            proposal_model: String::new(),
            challenges: vec![ChallengeResult {
                model_ref: "m2".into(),
                content: "postgresql adds complexity".into(),
                sycophantic: false,
                framing: "flaw".into(),
            }],
            revision: String::new(),
            decision: String::new(),
            confidence: 0.0,
            rigor: 0.0,
            dissent: None,
        });
        ctx.challenges.push(ChallengeResult {
            model_ref: "m2".into(),
            content: "postgresql adds operational complexity".into(),
            sycophantic: false,
            framing: "flaw".into(),
        });
        assert!(check_convergence(&mut ctx));
        assert!(ctx.converged);
    }
}
