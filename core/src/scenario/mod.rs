//! Conversational scenario detection.

pub mod detector;
pub mod probe;

pub use detector::{DetectContext, MatchInfo, ScenarioDetector, ScenarioMatch};
pub use probe::{ScenarioProbe, TextOnlyProbe, UiProbe};
