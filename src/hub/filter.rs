//! Subscription filter compilation and per-record matching.
//!
//! A `ClientSubscription` arrives as JSON from a subscriber and is compiled
//! once into glob matchers and a regex. Matching afterwards is pure and
//! allocation-free on the hot path.

use globset::{Glob, GlobMatcher};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::model::{RawLogEntry, StackTraceView};

/// Filter descriptor supplied by a subscriber. Every field defaults, so `{}`
/// subscribes to everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSubscription {
    /// Shell-style glob patterns matched against the host, OR-combined.
    pub host_patterns: Vec<String>,
    /// Glob patterns matched against the logger name, OR-combined.
    pub logger_patterns: Vec<String>,
    /// Level names, matched case-insensitively. Empty = all levels.
    pub levels: Vec<String>,
    /// Case-insensitive substrings; any match accepts.
    pub message_contains: Vec<String>,
    /// Case-insensitive substrings; any match rejects.
    pub message_excludes: Vec<String>,
    /// Optional regex over the message (partial match).
    pub message_regex: String,
    /// "summary" or "filtered".
    pub stack_trace_mode: String,
    pub stack_trace_include: Vec<String>,
    pub stack_trace_exclude: Vec<String>,
    /// Messages per second, 0 = unlimited. Burst equals the rate.
    pub max_rate: u32,
    /// Batch window in milliseconds, 0 disables batching.
    pub batch_timeout_ms: u64,
}

impl ClientSubscription {
    /// The filter every session starts with: INFO and above, summarised
    /// stack traces.
    pub fn default_subscription() -> Self {
        Self {
            levels: vec!["INFO".into(), "WARN".into(), "ERROR".into(), "FATAL".into()],
            stack_trace_mode: "summary".into(),
            ..Self::default()
        }
    }
}

/// A subscription pattern that failed to compile. The message names the
/// offending pattern so the subscriber can fix it.
#[derive(Debug)]
pub struct FilterError {
    pub pattern: String,
    pub reason: String,
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pattern {:?}: {}", self.pattern, self.reason)
    }
}

impl std::error::Error for FilterError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackTraceMode {
    Summary,
    Filtered,
}

/// Compiled form of a `ClientSubscription`.
#[derive(Debug)]
pub struct SubscriptionFilter {
    subscription: ClientSubscription,
    mode: StackTraceMode,
    host_globs: Vec<GlobMatcher>,
    logger_globs: Vec<GlobMatcher>,
    message_regex: Option<Regex>,
    stack_include: Vec<GlobMatcher>,
    stack_exclude: Vec<GlobMatcher>,
}

impl Default for SubscriptionFilter {
    fn default() -> Self {
        Self {
            subscription: ClientSubscription::default_subscription(),
            mode: StackTraceMode::Summary,
            host_globs: Vec::new(),
            logger_globs: Vec::new(),
            message_regex: None,
            stack_include: Vec::new(),
            stack_exclude: Vec::new(),
        }
    }
}

fn compile_globs(patterns: &[String]) -> Result<Vec<GlobMatcher>, FilterError> {
    patterns
        .iter()
        .map(|p| {
            Glob::new(p)
                .map(|g| g.compile_matcher())
                .map_err(|e| FilterError {
                    pattern: p.clone(),
                    reason: e.to_string(),
                })
        })
        .collect()
}

impl SubscriptionFilter {
    pub fn compile(subscription: ClientSubscription) -> Result<Self, FilterError> {
        let host_globs = compile_globs(&subscription.host_patterns)?;
        let logger_globs = compile_globs(&subscription.logger_patterns)?;
        let stack_include = compile_globs(&subscription.stack_trace_include)?;
        let stack_exclude = compile_globs(&subscription.stack_trace_exclude)?;

        let message_regex = if subscription.message_regex.is_empty() {
            None
        } else {
            Some(
                Regex::new(&subscription.message_regex).map_err(|e| FilterError {
                    pattern: subscription.message_regex.clone(),
                    reason: e.to_string(),
                })?,
            )
        };

        let mode = match subscription.stack_trace_mode.as_str() {
            "filtered" => StackTraceMode::Filtered,
            _ => StackTraceMode::Summary,
        };

        Ok(Self {
            subscription,
            mode,
            host_globs,
            logger_globs,
            message_regex,
            stack_include,
            stack_exclude,
        })
    }

    pub fn subscription(&self) -> &ClientSubscription {
        &self.subscription
    }

    /// True if the entry passes every non-empty filter axis.
    pub fn matches(&self, entry: &RawLogEntry) -> bool {
        if !self.host_globs.is_empty() && !self.host_globs.iter().any(|g| g.is_match(&entry.host)) {
            return false;
        }

        if !self.logger_globs.is_empty()
            && !self.logger_globs.iter().any(|g| g.is_match(&entry.logger))
        {
            return false;
        }

        if !self.subscription.levels.is_empty()
            && !self
                .subscription
                .levels
                .iter()
                .any(|l| l.eq_ignore_ascii_case(&entry.level))
        {
            return false;
        }

        if !self.subscription.message_contains.is_empty() {
            let lower = entry.message.to_lowercase();
            if !self
                .subscription
                .message_contains
                .iter()
                .any(|s| lower.contains(&s.to_lowercase()))
            {
                return false;
            }
        }

        if !self.subscription.message_excludes.is_empty() {
            let lower = entry.message.to_lowercase();
            if self
                .subscription
                .message_excludes
                .iter()
                .any(|s| lower.contains(&s.to_lowercase()))
            {
                return false;
            }
        }

        if let Some(re) = &self.message_regex {
            if !re.is_match(&entry.message) {
                return false;
            }
        }

        true
    }

    /// Reduce a non-empty stack trace to the shape this subscriber asked for.
    pub fn reduce_stack_trace(&self, stack_trace: &str) -> Option<StackTraceView> {
        if stack_trace.is_empty() {
            return None;
        }

        let hash = hex::encode(Sha256::digest(stack_trace.as_bytes()));

        match self.mode {
            StackTraceMode::Summary => Some(StackTraceView::Summary {
                hash,
                first_line: first_relevant_frame(stack_trace),
                frame_count: count_frames(stack_trace),
            }),
            StackTraceMode::Filtered => {
                let frames = self.filter_frames(stack_trace);
                let total = count_frames(stack_trace);
                Some(StackTraceView::Filtered {
                    hash,
                    omitted: total.saturating_sub(frames.len()),
                    frames,
                })
            }
        }
    }

    /// Apply include/exclude globs frame by frame. The first frame-shaped
    /// line is always kept so a fully-filtered trace still points somewhere.
    fn filter_frames(&self, stack_trace: &str) -> Vec<String> {
        let mut result = Vec::new();
        let mut first_frame: Option<String> = None;

        for line in stack_trace.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || is_header_line(trimmed) || !is_frame_line(trimmed) {
                continue;
            }

            let is_first = first_frame.is_none();
            if is_first {
                first_frame = Some(trimmed.to_string());
            }

            let class_key = extract_class_key(trimmed);

            if !self.stack_include.is_empty()
                && !self
                    .stack_include
                    .iter()
                    .any(|g| g.is_match(trimmed) || g.is_match(&class_key))
                && !is_first
            {
                continue;
            }

            if !self.stack_exclude.is_empty()
                && self
                    .stack_exclude
                    .iter()
                    .any(|g| g.is_match(trimmed) || g.is_match(&class_key))
                && !is_first
            {
                continue;
            }

            result.push(trimmed.to_string());
        }

        if result.is_empty() {
            if let Some(first) = first_frame {
                result.push(first);
            }
        }

        result
    }
}

fn is_header_line(line: &str) -> bool {
    line.contains("Exception:") || line.contains("Error:")
}

fn is_frame_line(line: &str) -> bool {
    line.contains(".java:") || line.contains(".kt:") || (line.contains('(') && line.contains(')'))
}

/// First frame-shaped line, or the first non-empty line if the trace has no
/// recognisable frames.
fn first_relevant_frame(stack_trace: &str) -> String {
    for line in stack_trace.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || is_header_line(trimmed) {
            continue;
        }
        if is_frame_line(trimmed) {
            return trimmed.to_string();
        }
    }

    stack_trace
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("Unknown")
        .to_string()
}

fn count_frames(stack_trace: &str) -> usize {
    stack_trace
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !is_header_line(l) && is_frame_line(l))
        .count()
}

/// "at org.jboss.ejb3.EJBComponent.invoke(EJBComponent.java:123)" becomes
/// "org.jboss.ejb3.EJBComponent".
fn extract_class_key(frame: &str) -> String {
    let mut line = frame.strip_prefix("at ").unwrap_or(frame).trim();

    if let Some(paren) = line.find('(') {
        line = &line[..paren];
    }

    match line.rfind('.') {
        Some(dot) if dot > 0 => line[..dot].to_string(),
        _ => line.to_string(),
    }
}
