//! Multi-armed bandit selection for banner rotation. UCB1 scoring over
//! per-context (trials, reward) arms.

pub mod bandits;

pub use bandits::{choose, score, scores, ScoredArm};
