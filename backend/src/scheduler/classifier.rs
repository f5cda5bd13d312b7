//! Two-tier failure classification.
//!
//! A run failure is either [`Severity::Recoverable`] (transient RPC or network
//! trouble: retry on the next tick from the same cursor) or [`Severity::Fatal`]
//! (needs an operator: the task is halted). Classification is a substring
//! match over the lowercased error text against an ordered table; the first
//! matching row wins and unmatched errors are fatal.
//!
//! The table is plain data so signatures from new RPC providers can be added
//! with [`ErrorClassifier::with_rule`] without touching control flow.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Recoverable,
    Fatal,
}

/// Verdict for one failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunError {
    Recoverable { code: String },
    Fatal { code: String, message: String },
}

impl RunError {
    pub fn severity(&self) -> Severity {
        match self {
            RunError::Recoverable { .. } => Severity::Recoverable,
            RunError::Fatal { .. } => Severity::Fatal,
        }
    }

    /// Stable snake_case code for logs.
    pub fn code(&self) -> &str {
        match self {
            RunError::Recoverable { code } | RunError::Fatal { code, .. } => code,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, RunError::Fatal { .. })
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Recoverable { code } => write!(f, "recoverable ({})", code),
            RunError::Fatal { code, message } => write!(f, "fatal ({}): {}", code, message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierRule {
    pub pattern: String,
    pub severity: Severity,
    pub code: String,
}

impl ClassifierRule {
    pub fn new(pattern: &str, severity: Severity, code: &str) -> Self {
        Self {
            pattern: pattern.to_lowercase(),
            severity,
            code: code.to_string(),
        }
    }
}

pub const UNKNOWN_CODE: &str = "unknown";

#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<ClassifierRule>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        use Severity::*;

        // Order matters: pool exhaustion surfaces as a "timeout" and must be
        // matched before the generic transient timeout row.
        let rules = vec![
            ClassifierRule::new("timeout exceeded when trying to connect", Fatal, "db_pool_exhausted"),
            ClassifierRule::new("pool timed out while waiting for an open connection", Fatal, "db_pool_exhausted"),
            ClassifierRule::new("malformed revert data", Fatal, "malformed_revert"),
            ClassifierRule::new("invalid revert data", Fatal, "malformed_revert"),
            ClassifierRule::new("malformed return data", Fatal, "malformed_contract"),
            ClassifierRule::new("execution reverted", Fatal, "call_reverted"),
            ClassifierRule::new("missing required config", Fatal, "missing_config"),
            ClassifierRule::new("invalid task config", Fatal, "invalid_config"),
            ClassifierRule::new("validation failed", Fatal, "domain_validation"),
            ClassifierRule::new("missing response", Recoverable, "missing_response"),
            ClassifierRule::new("timeout", Recoverable, "timeout"),
            ClassifierRule::new("timed out", Recoverable, "timeout"),
            ClassifierRule::new("could not detect network", Recoverable, "network_detection"),
            ClassifierRule::new("rate limit", Recoverable, "rate_limited"),
            ClassifierRule::new("too many requests", Recoverable, "rate_limited"),
            ClassifierRule::new("http error 429", Recoverable, "rate_limited"),
            ClassifierRule::new("http error 5", Recoverable, "upstream_unavailable"),
            ClassifierRule::new("null response", Recoverable, "missing_response"),
            ClassifierRule::new("server returned an error response", Recoverable, "rpc_error"),
            ClassifierRule::new("expected rpc error", Recoverable, "rpc_error"),
            ClassifierRule::new("deserialization error", Recoverable, "transient_decode"),
            ClassifierRule::new("underlying network changed", Recoverable, "network_changed"),
            ClassifierRule::new("error sending request", Recoverable, "transport"),
            ClassifierRule::new("connection reset", Recoverable, "transport"),
        ];

        Self { rules }
    }
}

impl ErrorClassifier {
    /// A classifier with no rules: everything is `Fatal("unknown")`.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Appends a rule after the existing ones.
    pub fn with_rule(mut self, pattern: &str, severity: Severity, code: &str) -> Self {
        self.rules.push(ClassifierRule::new(pattern, severity, code));
        self
    }

    /// Inserts a rule ahead of the existing ones so it takes precedence.
    pub fn with_priority_rule(mut self, pattern: &str, severity: Severity, code: &str) -> Self {
        self.rules.insert(0, ClassifierRule::new(pattern, severity, code));
        self
    }

    pub fn rules(&self) -> &[ClassifierRule] {
        &self.rules
    }

    pub fn classify(&self, err: &dyn fmt::Display) -> RunError {
        self.classify_message(&err.to_string())
    }

    pub fn classify_message(&self, message: &str) -> RunError {
        let lowered = message.to_lowercase();
        let matched = self.rules.iter().find(|rule| lowered.contains(&rule.pattern));

        match matched {
            Some(rule) if rule.severity == Severity::Recoverable => RunError::Recoverable {
                code: rule.code.clone(),
            },
            Some(rule) => RunError::Fatal {
                code: rule.code.clone(),
                message: message.to_string(),
            },
            None => RunError::Fatal {
                code: UNKNOWN_CODE.to_string(),
                message: message.to_string(),
            },
        }
    }
}
