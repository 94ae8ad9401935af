//! Side-effecting adapters for the orchestration engine.

pub mod agent;
pub mod config;
pub mod escalation;
pub mod git;
pub mod ledger;
pub mod paths;
pub mod process;
pub mod report;
pub mod tracker;
