//! Rule DSL: conditions over an attempt's response, paired with actions that
//! steer retries and per-host rate limits.
//!
//! A rule arrives from configuration as three strings (`condition`, `action`,
//! `arg`) and is compiled at load time into tagged variants evaluated by a
//! small interpreter. The condition grammar is `<operand><op><operand2>` with
//! `op` one of `!=`, `=`, `>`, `<` (detected in that order, so `!=` is never
//! mistaken for `=`).

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use super::glob;
use crate::types::ResponseCtx;

/// Left-hand operand of a condition, extracted from a [`ResponseCtx`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Response body as a string; empty when the attempt produced no response.
    Body,
    /// Decimal status code; empty when the attempt produced no response.
    Status,
    /// Elapsed seconds for the attempt, six fractional digits.
    ResponseTime,
    /// First value of the named response header, or empty.
    Header(String),
}

impl Operand {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "body" => Some(Self::Body),
            "status" => Some(Self::Status),
            "response_time" => Some(Self::ResponseTime),
            _ => op.strip_prefix("header:").map(|name| Self::Header(name.to_string())),
        }
    }

    /// Extracts this operand's value from the attempt result.
    ///
    /// An attempt that failed before a response arrived yields an empty
    /// string for every response-derived operand.
    #[must_use]
    pub fn eval(&self, ctx: &ResponseCtx) -> String {
        match self {
            Self::Body => ctx
                .body
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default(),
            Self::Status => ctx
                .response
                .as_ref()
                .map(|r| r.status.as_u16().to_string())
                .unwrap_or_default(),
            Self::ResponseTime => format!("{:.6}", ctx.response_time),
            Self::Header(name) => ctx
                .response
                .as_ref()
                .and_then(|r| r.headers.get(name.as_str()))
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string)
                .unwrap_or_default(),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Body => write!(f, "body"),
            Self::Status => write!(f, "status"),
            Self::ResponseTime => write!(f, "response_time"),
            Self::Header(name) => write!(f, "header:{name}"),
        }
    }
}

/// Right-hand side of an equality comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Contains an unescaped `*`; wildcard match.
    Glob(String),
    /// Literal comparison; `\*` escapes already resolved to `*`.
    Exact(String),
}

impl Pattern {
    fn parse(raw: &str) -> Self {
        if glob::is_glob(raw) {
            Self::Glob(raw.to_string())
        } else {
            Self::Exact(glob::unescape(raw))
        }
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Self::Glob(pattern) => glob::glob_match(pattern, value),
            Self::Exact(literal) => literal == value,
        }
    }
}

/// Comparison applied to the evaluated operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    Eq(Pattern),
    Ne(Pattern),
    Gt(f64),
    Lt(f64),
}

/// A compiled condition: operand plus comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub operand: Operand,
    pub comparison: Comparison,
}

impl Condition {
    /// Evaluates the condition against one attempt's result.
    ///
    /// Numeric comparisons that fail to parse the operand value log a
    /// warning and evaluate to `false`; they never abort the request.
    #[must_use]
    pub fn matches(&self, ctx: &ResponseCtx) -> bool {
        let value = self.operand.eval(ctx);
        match &self.comparison {
            Comparison::Eq(pattern) => pattern.matches(&value),
            Comparison::Ne(pattern) => !pattern.matches(&value),
            Comparison::Gt(threshold) => match value.parse::<f64>() {
                Ok(n) => n > *threshold,
                Err(e) => {
                    warn!(operand = %self.operand, value, error = %e, "error computing rule");
                    false
                }
            },
            Comparison::Lt(threshold) => match value.parse::<f64>() {
                Ok(n) => n < *threshold,
                Err(e) => {
                    warn!(operand = %self.operand, value, error = %e, "error computing rule");
                    false
                }
            },
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.comparison {
            Comparison::Eq(Pattern::Glob(p)) => write!(f, "{}={p}", self.operand),
            Comparison::Eq(Pattern::Exact(p)) => write!(f, "{}={}", self.operand, escape(p)),
            Comparison::Ne(Pattern::Glob(p)) => write!(f, "{}!={p}", self.operand),
            Comparison::Ne(Pattern::Exact(p)) => write!(f, "{}!={}", self.operand, escape(p)),
            Comparison::Gt(n) => write!(f, "{}>{n}", self.operand),
            Comparison::Lt(n) => write!(f, "{}<{n}", self.operand),
        }
    }
}

fn escape(literal: &str) -> String {
    literal.replace('*', "\\*")
}

/// Action taken when a rule's condition matches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    DontRetry,
    ForceRetry,
    ShouldRetry,
    /// Multiplies `every` by the factor (factor > 1 slows the host down).
    MultiplyEvery(f64),
    /// Replaces the limit; stored as a rate in tokens per second.
    SetEvery(f64),
}

impl Action {
    /// Returns the configuration keyword for this action.
    #[must_use]
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::DontRetry => "dont_retry",
            Self::ForceRetry => "force_retry",
            Self::ShouldRetry => "should_retry",
            Self::MultiplyEvery(_) => "multiply_every",
            Self::SetEvery(_) => "set_every",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.keyword())
    }
}

/// A compiled rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub condition: Condition,
    pub action: Action,
}

/// Errors produced while compiling a rule from its raw strings.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid rule condition: {0}")]
    InvalidCondition(String),

    #[error("invalid operand in rule: {0}")]
    InvalidOperand(String),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("invalid argument {arg:?} for action {action}: {reason}")]
    InvalidArgument { action: String, arg: String, reason: String },
}

impl Rule {
    /// Compiles a rule from its three configuration strings.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError`] when the condition has no recognized operator or
    /// operand, the action keyword is unknown, or the argument does not parse
    /// for the actions that take one.
    pub fn parse(condition: &str, action: &str, arg: &str) -> Result<Self, RuleError> {
        let action = parse_action(action, arg)?;
        let condition = parse_condition(condition)?;
        Ok(Self { condition, action })
    }

    /// Evaluates the rule's condition; the action applies iff this is `true`.
    #[must_use]
    pub fn matches(&self, ctx: &ResponseCtx) -> bool {
        self.condition.matches(ctx)
    }
}

fn parse_action(action: &str, arg: &str) -> Result<Action, RuleError> {
    match action {
        "dont_retry" => Ok(Action::DontRetry),
        "force_retry" => Ok(Action::ForceRetry),
        "should_retry" => Ok(Action::ShouldRetry),
        "multiply_every" => {
            let factor: f64 = arg.parse().map_err(|e: std::num::ParseFloatError| {
                RuleError::InvalidArgument {
                    action: action.to_string(),
                    arg: arg.to_string(),
                    reason: e.to_string(),
                }
            })?;
            Ok(Action::MultiplyEvery(factor))
        }
        "set_every" => {
            let every: Duration =
                humantime::parse_duration(arg).map_err(|e| RuleError::InvalidArgument {
                    action: action.to_string(),
                    arg: arg.to_string(),
                    reason: e.to_string(),
                })?;
            if every.is_zero() {
                return Err(RuleError::InvalidArgument {
                    action: action.to_string(),
                    arg: arg.to_string(),
                    reason: "interval must not be zero".to_string(),
                });
            }
            Ok(Action::SetEvery(1.0 / every.as_secs_f64()))
        }
        other => Err(RuleError::InvalidAction(other.to_string())),
    }
}

/// Splits `raw` at the first occurrence of `op`.
fn split_at_op(raw: &str, op: &str) -> (String, String) {
    let idx = raw.find(op).expect("caller checked the operator is present");
    (raw[..idx].to_string(), raw[idx + op.len()..].to_string())
}

fn parse_condition(raw: &str) -> Result<Condition, RuleError> {
    // `!=` before `=`; `>`/`<` after both.
    if raw.contains("!=") {
        let (op1, op2) = split_at_op(raw, "!=");
        let operand = Operand::parse(&op1)
            .ok_or_else(|| RuleError::InvalidOperand(raw.to_string()))?;
        return Ok(Condition { operand, comparison: Comparison::Ne(Pattern::parse(&op2)) });
    }
    if raw.contains('=') {
        let (op1, op2) = split_at_op(raw, "=");
        let operand = Operand::parse(&op1)
            .ok_or_else(|| RuleError::InvalidOperand(raw.to_string()))?;
        return Ok(Condition { operand, comparison: Comparison::Eq(Pattern::parse(&op2)) });
    }
    if raw.contains('>') {
        let (op1, op2) = split_at_op(raw, ">");
        let operand = Operand::parse(&op1)
            .ok_or_else(|| RuleError::InvalidOperand(raw.to_string()))?;
        let threshold = parse_threshold(&operand, &op2, raw)?;
        return Ok(Condition { operand, comparison: Comparison::Gt(threshold) });
    }
    if raw.contains('<') {
        let (op1, op2) = split_at_op(raw, "<");
        let operand = Operand::parse(&op1)
            .ok_or_else(|| RuleError::InvalidOperand(raw.to_string()))?;
        let threshold = parse_threshold(&operand, &op2, raw)?;
        return Ok(Condition { operand, comparison: Comparison::Lt(threshold) });
    }

    Err(RuleError::InvalidCondition(raw.to_string()))
}

/// Parses the numeric right-hand side of `>`/`<`.
///
/// `response_time` thresholds are duration strings converted to seconds.
fn parse_threshold(operand: &Operand, op2: &str, raw: &str) -> Result<f64, RuleError> {
    if *operand == Operand::ResponseTime {
        return humantime::parse_duration(op2)
            .map(|d| d.as_secs_f64())
            .map_err(|_| RuleError::InvalidCondition(raw.to_string()));
    }
    op2.parse::<f64>().map_err(|_| RuleError::InvalidCondition(raw.to_string()))
}
