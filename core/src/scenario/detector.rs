//! Scenario Detector: configuration-driven classification of conversational
//! content into named, prioritized, cooldown-gated recovery scenarios.
//!
//! The detector's only durable state is the per-scenario and per-group
//! last-trigger maps plus a short message history. `detect` never records a
//! trigger; the caller calls `mark_triggered` once the recovery is issued.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::data::scenarios::{CompiledScenario, ScenarioSet};
use crate::scenario::probe::ScenarioProbe;
use crate::types::config::Settings;

/// Inputs for one detection pass.
#[derive(Debug, Clone, Copy)]
pub struct DetectContext<'a> {
    /// Text of the latest assistant turn.
    pub last_message: &'a str,
    /// Recent conversation, oldest first.
    pub chat_content: &'a str,
    pub idle_ms: u64,
    pub ever_busy: bool,
}

/// Which check produced a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "via", rename_all = "snake_case")]
pub enum MatchInfo {
    TextCheck { matcher: String },
    Matcher { matcher: String },
    Keyword { keyword: String },
    Pattern { pattern: String },
    Duration { idle_ms: u64, threshold_ms: u64 },
}

impl fmt::Display for MatchInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchInfo::TextCheck { matcher } => write!(f, "text check on {}", matcher),
            MatchInfo::Matcher { matcher } => write!(f, "matcher {}", matcher),
            MatchInfo::Keyword { keyword } => write!(f, "keyword {:?}", keyword),
            MatchInfo::Pattern { pattern } => write!(f, "pattern /{}/", pattern),
            MatchInfo::Duration {
                idle_ms,
                threshold_ms,
            } => write!(f, "idle {}ms >= {}ms", idle_ms, threshold_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioMatch {
    pub scenario_id: String,
    pub priority: i32,
    pub match_info: MatchInfo,
}

#[derive(Debug, Clone)]
pub struct ScenarioDetector {
    scenarios: ScenarioSet,
    last_trigger: HashMap<String, u64>,
    group_last_trigger: HashMap<String, u64>,
    history: VecDeque<(u64, String)>,
    history_limit: usize,
    default_group_cooldown_ms: u64,
    default_duration_ms: u64,
}

impl ScenarioDetector {
    pub fn new(scenarios: ScenarioSet, settings: &Settings) -> Self {
        ScenarioDetector {
            scenarios,
            last_trigger: HashMap::new(),
            group_last_trigger: HashMap::new(),
            history: VecDeque::new(),
            history_limit: settings.history_limit,
            default_group_cooldown_ms: settings.default_group_cooldown_ms,
            default_duration_ms: settings.default_duration_threshold_ms,
        }
    }

    pub fn scenarios(&self) -> &ScenarioSet {
        &self.scenarios
    }

    /// Evaluate every enabled scenario and return the highest-priority match.
    /// Ties go to the scenario listed first.
    pub fn detect(
        &mut self,
        ctx: &DetectContext<'_>,
        probe: &dyn ScenarioProbe,
        now_ms: u64,
    ) -> Option<ScenarioMatch> {
        self.remember(ctx.last_message, now_ms);

        let mut best: Option<ScenarioMatch> = None;
        for scenario in self.scenarios.iter() {
            let config = &scenario.config;
            if !config.enabled {
                continue;
            }
            if let Some(better) = &best {
                if better.priority >= config.priority {
                    continue;
                }
            }
            if self.cooling_down(scenario, now_ms) {
                continue;
            }
            if config.requires_active_history && !ctx.ever_busy {
                continue;
            }
            if let Some(info) = self.evaluate(scenario, ctx, probe) {
                best = Some(ScenarioMatch {
                    scenario_id: config.id.clone(),
                    priority: config.priority,
                    match_info: info,
                });
            }
        }
        if let Some(m) = &best {
            debug!(scenario = %m.scenario_id, via = %m.match_info, "scenario matched");
        }
        best
    }

    fn cooling_down(&self, scenario: &CompiledScenario, now_ms: u64) -> bool {
        let config = &scenario.config;
        let last = self.last_trigger.get(&config.id);
        if let (Some(cooldown), Some(last)) = (config.cooldown_ms, last) {
            let elapsed = now_ms.saturating_sub(*last);
            if elapsed < cooldown {
                debug!(scenario = %config.id, remaining_ms = cooldown - elapsed, "on cooldown");
                return true;
            }
        }
        if let Some(group) = &config.group {
            let window = config.group_cooldown_ms.unwrap_or(self.default_group_cooldown_ms);
            if let Some(last) = self.group_last_trigger.get(group) {
                if now_ms.saturating_sub(*last) < window {
                    debug!(scenario = %config.id, group = %group, "group on cooldown");
                    return true;
                }
            }
        }
        false
    }

    fn evaluate(
        &self,
        scenario: &CompiledScenario,
        ctx: &DetectContext<'_>,
        probe: &dyn ScenarioProbe,
    ) -> Option<MatchInfo> {
        let detection = &scenario.config.detection;
        let content = self.content_hit(scenario, ctx, probe);

        let matched = match &detection.duration {
            Some(duration) => {
                let threshold_ms = duration.min_idle_ms.unwrap_or(self.default_duration_ms);
                let idle_met = ctx.idle_ms >= threshold_ms;
                let by_duration = MatchInfo::Duration {
                    idle_ms: ctx.idle_ms,
                    threshold_ms,
                };
                if duration.require_match {
                    if idle_met {
                        content
                    } else {
                        None
                    }
                } else {
                    content.or_else(|| idle_met.then_some(by_duration))
                }
            }
            None => content,
        }?;

        if !detection.incomplete_markers.is_empty() {
            let haystack = ctx.chat_content.to_lowercase();
            let incomplete = detection
                .incomplete_markers
                .iter()
                .any(|m| haystack.contains(&m.to_lowercase()));
            if !incomplete {
                debug!(scenario = %scenario.config.id, "no incomplete markers; suppressed");
                return None;
            }
        }
        Some(matched)
    }

    /// Structural and textual checks, cheapest and most specific first.
    fn content_hit(
        &self,
        scenario: &CompiledScenario,
        ctx: &DetectContext<'_>,
        probe: &dyn ScenarioProbe,
    ) -> Option<MatchInfo> {
        let config = &scenario.config;
        let detection = &config.detection;

        if let Some(tc) = &detection.text_check {
            match probe.texts(&tc.matcher, tc.latest_only) {
                Ok(texts) => {
                    let hit = texts.iter().any(|t| match (&tc.text, &scenario.text_pattern) {
                        (Some(needle), _) => t.to_lowercase().contains(&needle.to_lowercase()),
                        (None, Some(re)) => re.is_match(t),
                        (None, None) => true,
                    });
                    if hit {
                        return Some(MatchInfo::TextCheck {
                            matcher: tc.matcher.clone(),
                        });
                    }
                }
                Err(e) => warn!(scenario = %config.id, error = %e, "text check skipped"),
            }
        }

        for matcher in &detection.matchers {
            match probe.exists(matcher) {
                Ok(true) => {
                    return Some(MatchInfo::Matcher {
                        matcher: matcher.clone(),
                    })
                }
                Ok(false) => {}
                Err(e) => warn!(scenario = %config.id, error = %e, "matcher skipped"),
            }
        }

        let haystack = if ctx.last_message.trim().is_empty() {
            ctx.chat_content
        } else {
            ctx.last_message
        };
        if !detection.keywords.is_empty() {
            let lower = haystack.to_lowercase();
            if let Some(keyword) = detection
                .keywords
                .iter()
                .find(|k| lower.contains(&k.to_lowercase()))
            {
                return Some(MatchInfo::Keyword {
                    keyword: keyword.clone(),
                });
            }
        }

        scenario
            .patterns
            .iter()
            .find(|re| re.is_match(haystack))
            .map(|re| MatchInfo::Pattern {
                pattern: re.as_str().to_string(),
            })
    }

    /// Record that a scenario's recovery was issued.
    pub fn mark_triggered(&mut self, scenario_id: &str, now_ms: u64) {
        self.last_trigger.insert(scenario_id.to_string(), now_ms);
        if let Some(group) = self
            .scenarios
            .get(scenario_id)
            .and_then(|s| s.config.group.clone())
        {
            self.group_last_trigger.insert(group, now_ms);
        }
        info!(scenario = %scenario_id, at_ms = now_ms, "scenario triggered");
    }

    pub fn last_triggered(&self, scenario_id: &str) -> Option<u64> {
        self.last_trigger.get(scenario_id).copied()
    }

    pub fn group_last_triggered(&self, group: &str) -> Option<u64> {
        self.group_last_trigger.get(group).copied()
    }

    /// True when neither cooldown map holds an entry.
    pub fn is_pristine(&self) -> bool {
        self.last_trigger.is_empty()
            && self.group_last_trigger.is_empty()
            && self.history.is_empty()
    }

    fn remember(&mut self, message: &str, now_ms: u64) {
        let message = message.trim();
        if message.is_empty() || self.history_limit == 0 {
            return;
        }
        if self.history.back().map(|(_, m)| m.as_str()) == Some(message) {
            return;
        }
        self.history.push_back((now_ms, message.to_string()));
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }

    /// Recently observed latest messages with the time they were first seen.
    pub fn recent_messages(&self) -> impl Iterator<Item = (u64, &str)> {
        self.history.iter().map(|(t, m)| (*t, m.as_str()))
    }

    /// Clear cooldown maps and history.
    pub fn reset(&mut self) {
        self.last_trigger.clear();
        self.group_last_trigger.clear();
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::scenarios::{builtin, parse};
    use crate::data::settings::default_settings;
    use crate::scenario::probe::TextOnlyProbe;

    fn detector(yaml: &str) -> ScenarioDetector {
        let set = ScenarioSet::compile(parse(yaml).unwrap()).unwrap();
        ScenarioDetector::new(set, &default_settings())
    }

    fn ctx(message: &str) -> DetectContext<'_> {
        DetectContext {
            last_message: message,
            chat_content: message,
            idle_ms: 0,
            ever_busy: true,
        }
    }

    const COOLDOWN: &str = r#"
- id: limited
  priority: 5
  cooldown_ms: 30000
  detection:
    keywords: ["limit reached"]
  action: {kind: type}
"#;

    #[test]
    fn cooldown_blocks_then_expires() {
        let mut d = detector(COOLDOWN);
        let c = ctx("The model step limit reached.");
        assert!(d.detect(&c, &TextOnlyProbe, 0).is_some());
        d.mark_triggered("limited", 0);
        assert!(d.detect(&c, &TextOnlyProbe, 20000).is_none());
        assert!(d.detect(&c, &TextOnlyProbe, 31000).is_some());
    }

    #[test]
    fn detect_does_not_mark_triggered() {
        let mut d = detector(COOLDOWN);
        let c = ctx("limit reached");
        assert!(d.detect(&c, &TextOnlyProbe, 0).is_some());
        assert!(d.detect(&c, &TextOnlyProbe, 1000).is_some());
        assert_eq!(d.last_triggered("limited"), None);
    }

    #[test]
    fn group_cooldown_suppresses_siblings() {
        let mut d = detector(
            r#"
- id: first
  priority: 9
  group: recovery
  group_cooldown_ms: 30000
  detection: {keywords: ["error"]}
  action: {kind: type}
- id: second
  priority: 3
  group: recovery
  group_cooldown_ms: 30000
  detection: {keywords: ["error"]}
  action: {kind: type}
"#,
        );
        let c = ctx("an error occurred");
        assert_eq!(d.detect(&c, &TextOnlyProbe, 0).unwrap().scenario_id, "first");
        d.mark_triggered("first", 0);
        assert_eq!(d.group_last_triggered("recovery"), Some(0));
        assert!(d.detect(&c, &TextOnlyProbe, 10000).is_none());
        assert!(d.detect(&c, &TextOnlyProbe, 30000).is_some());
    }

    #[test]
    fn group_cooldown_defaults_from_settings() {
        let mut d = detector(
            r#"
- id: a
  group: g
  detection: {keywords: ["x"]}
  action: {kind: type}
"#,
        );
        d.mark_triggered("a", 0);
        assert!(d.detect(&ctx("x"), &TextOnlyProbe, 29999).is_none());
        assert!(d.detect(&ctx("x"), &TextOnlyProbe, 30000).is_some());
    }

    #[test]
    fn highest_priority_wins_and_ties_keep_order() {
        let mut d = detector(
            r#"
- id: low
  priority: 1
  detection: {keywords: ["stuck"]}
  action: {kind: type}
- id: tie_a
  priority: 5
  detection: {keywords: ["stuck"]}
  action: {kind: type}
- id: tie_b
  priority: 5
  detection: {patterns: ["st.ck"]}
  action: {kind: type}
"#,
        );
        let m = d.detect(&ctx("I am STUCK"), &TextOnlyProbe, 0).unwrap();
        assert_eq!(m.scenario_id, "tie_a");
        assert_eq!(m.priority, 5);
        assert_eq!(
            m.match_info,
            MatchInfo::Keyword {
                keyword: "stuck".into()
            }
        );
    }

    #[test]
    fn patterns_are_case_insensitive() {
        let mut d = detector(
            r#"
- id: p
  detection: {patterns: ["rate\\s+limit"]}
  action: {kind: wait, wait_ms: 1000}
"#,
        );
        let m = d.detect(&ctx("RATE   LIMIT hit"), &TextOnlyProbe, 0).unwrap();
        assert!(matches!(m.match_info, MatchInfo::Pattern { .. }));
    }

    #[test]
    fn keywords_fall_back_to_chat_content() {
        let mut d = detector(COOLDOWN);
        let c = DetectContext {
            last_message: "  ",
            chat_content: "earlier: limit reached",
            idle_ms: 0,
            ever_busy: false,
        };
        assert!(d.detect(&c, &TextOnlyProbe, 0).is_some());
    }

    #[test]
    fn duration_alone_and_gated() {
        let mut d = detector(
            r#"
- id: idle
  priority: 1
  detection:
    duration: {min_idle_ms: 5000}
  action: {kind: type}
- id: gated
  priority: 2
  detection:
    keywords: ["password"]
    duration: {min_idle_ms: 5000, require_match: true}
  action: {kind: custom, handler: skip_after_timeout}
"#,
        );
        let mut c = ctx("Enter password:");
        c.idle_ms = 1000;
        assert!(d.detect(&c, &TextOnlyProbe, 0).is_none());
        c.idle_ms = 6000;
        assert_eq!(d.detect(&c, &TextOnlyProbe, 0).unwrap().scenario_id, "gated");
        let mut quiet = ctx("working on it");
        quiet.idle_ms = 6000;
        let m = d.detect(&quiet, &TextOnlyProbe, 0).unwrap();
        assert_eq!(m.scenario_id, "idle");
        assert!(matches!(m.match_info, MatchInfo::Duration { threshold_ms: 5000, .. }));
    }

    #[test]
    fn active_history_required() {
        let mut d = detector(
            r#"
- id: ready
  requires_active_history: true
  detection: {duration: {}}
  action: {kind: type}
"#,
        );
        let mut c = ctx("");
        c.idle_ms = 60000;
        c.ever_busy = false;
        assert!(d.detect(&c, &TextOnlyProbe, 0).is_none());
        c.ever_busy = true;
        assert!(d.detect(&c, &TextOnlyProbe, 0).is_some());
    }

    #[test]
    fn incomplete_markers_suppress_false_done() {
        let mut d = detector(
            r#"
- id: premature
  detection:
    keywords: ["done"]
    incomplete_markers: ["TODO"]
  action: {kind: type, message: keep going}
"#,
        );
        let done = DetectContext {
            last_message: "All done!",
            chat_content: "step 1 ok\nAll done!",
            idle_ms: 0,
            ever_busy: true,
        };
        assert!(d.detect(&done, &TextOnlyProbe, 0).is_none());
        let premature = DetectContext {
            chat_content: "// TODO: wire the parser\nAll done!",
            ..done
        };
        assert!(d.detect(&premature, &TextOnlyProbe, 0).is_some());
    }

    #[test]
    fn disabled_scenarios_never_match() {
        let mut d = detector(
            r#"
- id: off
  enabled: false
  detection: {keywords: ["x"]}
  action: {kind: type}
"#,
        );
        assert!(d.detect(&ctx("x"), &TextOnlyProbe, 0).is_none());
    }

    #[test]
    fn builtin_model_limit_matches_text() {
        let set = ScenarioSet::compile(builtin()).unwrap();
        let mut d = ScenarioDetector::new(set, &default_settings());
        let m = d
            .detect(&ctx("model step limit reached"), &TextOnlyProbe, 0)
            .unwrap();
        assert_eq!(m.scenario_id, "model_limit_reached");
    }

    #[test]
    fn history_is_bounded_and_deduplicated() {
        let mut d = detector(COOLDOWN);
        for i in 0..15 {
            d.detect(&ctx(&format!("message {}", i)), &TextOnlyProbe, i);
            d.detect(&ctx(&format!("message {}", i)), &TextOnlyProbe, i);
        }
        let recent: Vec<_> = d.recent_messages().collect();
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0], (5, "message 5"));
    }

    #[test]
    fn reset_clears_everything() {
        let mut d = detector(COOLDOWN);
        d.detect(&ctx("limit reached"), &TextOnlyProbe, 0);
        d.mark_triggered("limited", 0);
        assert!(!d.is_pristine());
        d.reset();
        assert!(d.is_pristine());
        assert!(d.detect(&ctx("limit reached"), &TextOnlyProbe, 1).is_some());
    }
}
