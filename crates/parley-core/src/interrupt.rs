//! Interruption detector.
//!
//! Classifies raw user text typed while a generation is running. Matching is
//! evaluated level by level, table order then variation order within a
//! level:
//!
//! | level     | rule                                          | confidence | interrupts      |
//! |-----------|-----------------------------------------------|------------|-----------------|
//! | exact     | whole input equals a variation                | 1.0        | always          |
//! | prefix    | input starts with variation + space or comma  | 0.9        | always          |
//! | contained | input of at most 20 chars contains variation  | 0.7        | high priority   |

use serde::Serialize;

/// Inputs longer than this (in chars) only match exactly or by prefix.
pub const SHORT_INPUT_MAX_CHARS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptPriority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptAction {
    Stop,
    Pause,
    Redirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Prefix,
    Contained,
}

impl MatchKind {
    fn confidence(self) -> f64 {
        match self {
            MatchKind::Exact => 1.0,
            MatchKind::Prefix => 0.9,
            MatchKind::Contained => 0.7,
        }
    }
}

/// One row of the keyword table. Variations are lowercase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordEntry {
    pub keyword: String,
    pub variations: Vec<String>,
    pub priority: InterruptPriority,
    pub action: InterruptAction,
}

impl KeywordEntry {
    pub fn new(
        keyword: &str,
        variations: &[&str],
        priority: InterruptPriority,
        action: InterruptAction,
    ) -> Self {
        Self {
            keyword: keyword.to_string(),
            variations: variations.iter().map(|v| v.to_lowercase()).collect(),
            priority,
            action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterruptMatch {
    pub keyword: String,
    /// Variation that matched.
    pub matched: String,
    pub kind: MatchKind,
    pub confidence: f64,
    pub priority: InterruptPriority,
    pub action: InterruptAction,
    pub should_interrupt: bool,
}

impl InterruptMatch {
    /// Text after a redirect keyword, e.g. `"actually, use python"` ->
    /// `"use python"`. Only prefix matches carry a remainder.
    pub fn redirect_text(&self, input: &str) -> Option<String> {
        if self.action != InterruptAction::Redirect || self.kind != MatchKind::Prefix {
            return None;
        }
        let rest: String = input
            .trim()
            .chars()
            .skip(self.matched.chars().count())
            .collect();
        let rest = rest.trim_start_matches([' ', ',']).trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptionDetector {
    table: Vec<KeywordEntry>,
}

impl Default for InterruptionDetector {
    fn default() -> Self {
        use InterruptAction::{Pause, Redirect, Stop};
        use InterruptPriority::{High, Medium};

        Self::new(vec![
            KeywordEntry::new(
                "stop",
                &[
                    "stop", "halt", "cease", "quit", "end", "abort", "cancel", "enough", "stop it",
                    "stop that",
                ],
                High,
                Stop,
            ),
            KeywordEntry::new(
                "wait",
                &[
                    "wait",
                    "hold on",
                    "hold up",
                    "pause",
                    "one moment",
                    "just a sec",
                    "hang on",
                ],
                High,
                Pause,
            ),
            KeywordEntry::new(
                "actually",
                &[
                    "actually",
                    "instead",
                    "rather",
                    "change of plan",
                    "no wait",
                    "scratch that",
                ],
                Medium,
                Redirect,
            ),
        ])
    }
}

impl InterruptionDetector {
    pub fn new(table: Vec<KeywordEntry>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &[KeywordEntry] {
        &self.table
    }

    pub fn detect(&self, input: &str) -> Option<InterruptMatch> {
        let normalized = input.trim().to_lowercase();
        if normalized.is_empty() {
            return None;
        }
        let short = normalized.chars().count() <= SHORT_INPUT_MAX_CHARS;

        let rules: [(MatchKind, &dyn Fn(&str) -> bool); 3] = [
            (MatchKind::Exact, &|v: &str| normalized == v),
            (MatchKind::Prefix, &|v: &str| {
                normalized
                    .strip_prefix(v)
                    .is_some_and(|rest| rest.starts_with([' ', ',']))
            }),
            (MatchKind::Contained, &|v: &str| short && normalized.contains(v)),
        ];

        rules.iter().find_map(|(kind, matches)| {
            self.table.iter().find_map(|entry| {
                entry
                    .variations
                    .iter()
                    .find(|variation| matches(variation))
                    .map(|variation| InterruptMatch {
                        keyword: entry.keyword.clone(),
                        matched: variation.clone(),
                        kind: *kind,
                        confidence: kind.confidence(),
                        priority: entry.priority,
                        action: entry.action,
                        should_interrupt: *kind != MatchKind::Contained
                            || entry.priority == InterruptPriority::High,
                    })
            })
        })
    }
}

/// Classifies `input` against the default keyword table.
pub fn detect(input: &str) -> Option<InterruptMatch> {
    InterruptionDetector::default().detect(input)
}
