#![doc = include_str!("../README.md")]

mod api;
mod browser;
mod evasion;
mod orchestrator;
mod strategy;

pub use browser::AutomatedBrowserClient;
pub use evasion::FingerprintEvasionClient;
pub use orchestrator::{AuthOrchestrator, StrategyRegistry};
pub use strategy::{LoginStrategy, StartLoginOutcome, StrategyError};
