//! The proxy auto-sync scenario
//!
//! A scenario is described in YAML (see [`config::ScenarioSpec`]) and run
//! step by step by [`runner::Scenario`].

pub mod config;
pub mod runner;

pub use config::{DataEntry, NodeSpec, ProxySpec, ScenarioSpec};
pub use runner::{Scenario, ScenarioReport, Step};
