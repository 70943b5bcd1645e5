//! Banner selection pipeline: loads arm counters for a (slot, social group)
//! context, picks a banner with UCB1, and records the outcome. Also hosts the
//! assignment manager that makes banners eligible for slots.

#![warn(clippy::unwrap_used)]

pub mod assignment;
pub mod deadline;
pub mod decision;

pub use assignment::AssignmentManager;
pub use decision::{select, DecisionEngine, Selection, SelectionStrategy};
