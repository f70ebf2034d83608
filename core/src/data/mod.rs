//! Configuration data: the selector table, settings files and the scenario
//! library.

pub mod scenarios;
pub mod selectors;
pub mod settings;

pub use scenarios::{CompiledScenario, ScenarioSet};
pub use selectors::{Category, SelectorKey, SelectorTable};
