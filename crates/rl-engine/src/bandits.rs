//! UCB1 arm selection.
//!
//! `score = reward / trials + sqrt(2 * ln(global_trials) / trials)`
//!
//! The function is pure: arms carry their own counters and nothing is
//! remembered between calls. Callers must hand in arms that have been tried at
//! least once and a global trial count of at least two; anything else is
//! rejected instead of producing NaN or infinite scores.

use rotator_core::types::{Arm, BannerId};
use rotator_core::{RotatorError, RotatorResult};
use serde::Serialize;
use tracing::trace;

/// An arm with its UCB1 score broken into its two terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoredArm {
    pub id: BannerId,
    pub exploitation: f64,
    pub exploration: f64,
    pub score: f64,
}

/// Pick the arm with the highest upper confidence bound. Ties go to the arm
/// that appears first in `arms`.
pub fn choose(arms: &[Arm], global_trials: u64) -> RotatorResult<BannerId> {
    if arms.is_empty() {
        return Err(RotatorError::InvalidInput(
            "cannot choose from an empty arm set".to_string(),
        ));
    }

    let log_total = log_global_trials(global_trials)?;
    let mut best: Option<ScoredArm> = None;

    for arm in arms {
        let scored = score_with_log(arm, log_total)?;
        trace!(banner = %scored.id, score = scored.score, "ucb1 score");
        match best {
            Some(current) if scored.score <= current.score => {}
            _ => best = Some(scored),
        }
    }

    best.map(|s| s.id)
        .ok_or_else(|| RotatorError::InvalidInput("no arm scored".to_string()))
}

/// Score a single arm.
pub fn score(arm: &Arm, global_trials: u64) -> RotatorResult<ScoredArm> {
    score_with_log(arm, log_global_trials(global_trials)?)
}

/// Score every arm, preserving input order.
pub fn scores(arms: &[Arm], global_trials: u64) -> RotatorResult<Vec<ScoredArm>> {
    let log_total = log_global_trials(global_trials)?;
    arms.iter().map(|arm| score_with_log(arm, log_total)).collect()
}

fn log_global_trials(global_trials: u64) -> RotatorResult<f64> {
    if global_trials < 2 {
        return Err(RotatorError::InvalidArmState(format!(
            "global trial count must be at least 2, got {global_trials}"
        )));
    }
    Ok((global_trials as f64).ln())
}

fn score_with_log(arm: &Arm, log_total: f64) -> RotatorResult<ScoredArm> {
    if arm.trials == 0 {
        return Err(RotatorError::InvalidArmState(format!(
            "banner {} has no trials",
            arm.id
        )));
    }

    let trials = arm.trials as f64;
    let exploitation = arm.reward as f64 / trials;
    let exploration = (2.0 * log_total / trials).sqrt();

    Ok(ScoredArm {
        id: arm.id,
        exploitation,
        exploration,
        score: exploitation + exploration,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rotator_core::ErrorKind;

    fn arm(id: i64, trials: u64, reward: u64) -> Arm {
        Arm::new(BannerId(id), trials, reward)
    }

    #[test]
    fn test_dominant_reward_wins() {
        let arms = [arm(1, 100, 99), arm(2, 100, 1), arm(3, 100, 1)];
        assert_eq!(choose(&arms, 300).unwrap(), BannerId(1));
    }

    #[test]
    fn test_highest_rate_among_many() {
        let arms = [
            arm(1, 100, 99),
            arm(2, 100, 1),
            arm(3, 100, 1),
            arm(9, 100, 100),
        ];
        assert_eq!(choose(&arms, 400).unwrap(), BannerId(9));
    }

    #[test]
    fn test_ties_break_to_first_arm() {
        let arms = [arm(5, 50, 5), arm(2, 50, 5), arm(7, 50, 5)];
        for _ in 0..10 {
            assert_eq!(choose(&arms, 150).unwrap(), BannerId(5));
        }
    }

    #[test]
    fn test_exploration_favours_less_tried_arm() {
        // Same click rate; the rarely shown banner carries the larger bonus.
        let arms = [arm(1, 1000, 100), arm(2, 10, 1)];
        assert_eq!(choose(&arms, 1010).unwrap(), BannerId(2));
    }

    #[test]
    fn test_empty_arms_rejected() {
        let err = choose(&[], 10).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_untried_arm_rejected() {
        let arms = [arm(1, 10, 1), arm(2, 0, 0)];
        let err = choose(&arms, 10).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArmState);
        assert!(err.to_string().contains("banner 2"));
    }

    #[test]
    fn test_global_trials_below_two_rejected() {
        let arms = [arm(1, 1, 0)];
        assert_eq!(
            choose(&arms, 1).unwrap_err().kind(),
            ErrorKind::InvalidArmState
        );
        assert_eq!(
            choose(&arms, 0).unwrap_err().kind(),
            ErrorKind::InvalidArmState
        );
    }

    #[test]
    fn test_score_terms() {
        let scored = score(&arm(3, 4, 1), 16).unwrap();
        assert!((scored.exploitation - 0.25).abs() < 1e-12);
        let expected_bonus = (2.0 * 16f64.ln() / 4.0).sqrt();
        assert!((scored.exploration - expected_bonus).abs() < 1e-12);
        assert!((scored.score - (0.25 + expected_bonus)).abs() < 1e-12);
    }

    #[test]
    fn test_scores_preserve_order() {
        let arms = [arm(4, 10, 1), arm(1, 20, 1)];
        let all = scores(&arms, 30).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, BannerId(4));
        assert!(all[0].score > all[1].score);
    }

    #[test]
    fn test_random_arm_sets_choose_member() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..500 {
            let len = rng.gen_range(1..20);
            let arms: Vec<Arm> = (0..len)
                .map(|i| {
                    let trials = rng.gen_range(1..10_000u64);
                    let reward = rng.gen_range(0..=trials);
                    arm(i + 1, trials, reward)
                })
                .collect();
            let global: u64 = arms.iter().map(|a| a.trials).sum::<u64>().max(2);

            let chosen = choose(&arms, global).unwrap();
            assert!(arms.iter().any(|a| a.id == chosen));

            let best = scores(&arms, global)
                .unwrap()
                .into_iter()
                .map(|s| s.score)
                .fold(f64::NEG_INFINITY, f64::max);
            let chosen_arm = arms.iter().find(|a| a.id == chosen).unwrap();
            let chosen_score = score(chosen_arm, global).unwrap().score;
            assert_eq!(chosen_score, best);
        }
    }
}
