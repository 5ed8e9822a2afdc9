//! Typed condition evaluation.
//!
//! Conditions arrive as loosely typed [`ConditionSpec`]s and are compiled once
//! per pass into closed enums; a bad operator or operand surfaces at compile
//! time, not halfway through a pass. Evaluation resolves the subject through
//! the file's cache and never fails for a missing value: that is a non-match.
//!
//! String comparisons are byte-exact except the `*_ignore_case` operators,
//! which compare Unicode lower-case forms (`str::to_lowercase`), independent
//! of locale.

use super::clock::Clock;
use super::provider::MetadataProvider;
use super::{parse_size, FileEntity, Value, ValueKind};
use crate::config::{ConditionSpec, MatchSpec};
use crate::error::{Result, SorterError};
use chrono::{DateTime, Local, Months, NaiveDate, TimeDelta, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value as Json;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericOp {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NumericTest {
    Compare(NumericOp, f64),
    /// Inclusive at both ends
    Between(f64, f64),
}

#[derive(Debug, Clone)]
pub enum StringTest {
    Equals(String),
    NotEquals(String),
    /// Operand stored lower-cased
    EqualsIgnoreCase(String),
    Contains(String),
    DoesNotContain(String),
    /// Operand stored lower-cased
    ContainsIgnoreCase(String),
    StartsWith(String),
    EndsWith(String),
    Matches(Regex),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

/// A length of time counted back from "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Span {
    pub amount: u32,
    pub unit: SpanUnit,
}

impl Span {
    /// The instant `self` before `now`, or `None` if it is out of range.
    pub fn before(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let amount = i64::from(self.amount);
        match self.unit {
            SpanUnit::Minutes => now.checked_sub_signed(TimeDelta::try_minutes(amount)?),
            SpanUnit::Hours => now.checked_sub_signed(TimeDelta::try_hours(amount)?),
            SpanUnit::Days => now.checked_sub_signed(TimeDelta::try_days(amount)?),
            SpanUnit::Weeks => now.checked_sub_signed(TimeDelta::try_weeks(amount)?),
            SpanUnit::Months => now.checked_sub_months(Months::new(self.amount)),
            SpanUnit::Years => now.checked_sub_months(Months::new(self.amount.checked_mul(12)?)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DateTest {
    Before(DateTime<Utc>),
    After(DateTime<Utc>),
    /// Inclusive at both ends
    Between(DateTime<Utc>, DateTime<Utc>),
    InLast(Span),
    NotInLast(Span),
    IsToday,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArrayTest {
    ContainsAll(Vec<String>),
    ContainsAny(Vec<String>),
    ContainsNone(Vec<String>),
    /// Same members, ignoring order and duplicates
    Equals(Vec<String>),
}

#[derive(Debug, Clone)]
pub enum Test {
    Numeric(NumericTest),
    String(StringTest),
    Date(DateTest),
    Array(ArrayTest),
}

/// A compiled leaf condition.
#[derive(Debug, Clone)]
pub struct Condition {
    pub subject: String,
    pub test: Test,
}

/// A compiled condition tree.
#[derive(Debug, Clone)]
pub enum Match {
    All(Vec<Match>),
    Any(Vec<Match>),
    Not(Box<Match>),
    Leaf(Condition),
}

fn json_kind(value: &Json) -> String {
    match value {
        Json::Null => "null".to_string(),
        Json::Bool(_) => "boolean".to_string(),
        Json::Number(_) => "number".to_string(),
        Json::String(s) => format!("string '{}'", s),
        Json::Array(items) => format!("array of {} items", items.len()),
        Json::Object(_) => "object".to_string(),
    }
}

fn mismatch(spec: &ConditionSpec, operand: &Json) -> SorterError {
    SorterError::TypeMismatch {
        subject: spec.subject.clone(),
        expected: spec.kind,
        found: json_kind(operand),
    }
}

fn unsupported(spec: &ConditionSpec) -> SorterError {
    SorterError::UnsupportedOperator {
        operator: spec.operator.clone(),
        kind: spec.kind,
    }
}

impl Condition {
    pub fn compile(spec: &ConditionSpec) -> Result<Self> {
        let test = match spec.kind {
            ValueKind::Numeric => Test::Numeric(compile_numeric(spec)?),
            ValueKind::String => Test::String(compile_string(spec)?),
            ValueKind::Date => Test::Date(compile_date(spec)?),
            ValueKind::Array => Test::Array(compile_array(spec)?),
        };

        Ok(Self {
            subject: spec.subject.clone(),
            test,
        })
    }

    pub fn kind(&self) -> ValueKind {
        match self.test {
            Test::Numeric(_) => ValueKind::Numeric,
            Test::String(_) => ValueKind::String,
            Test::Date(_) => ValueKind::Date,
            Test::Array(_) => ValueKind::Array,
        }
    }
}

fn numeric_operand(spec: &ConditionSpec, operand: &Json) -> Result<f64> {
    match operand {
        Json::Number(n) => n.as_f64().ok_or_else(|| mismatch(spec, operand)),
        Json::String(s) => parse_size(s)
            .map(|bytes| bytes as f64)
            .ok_or_else(|| mismatch(spec, operand)),
        _ => Err(mismatch(spec, operand)),
    }
}

fn compile_numeric(spec: &ConditionSpec) -> Result<NumericTest> {
    let op = match spec.operator.as_str() {
        "equals" => NumericOp::Equals,
        "not_equals" => NumericOp::NotEquals,
        "greater_than" => NumericOp::GreaterThan,
        "greater_or_equal" => NumericOp::GreaterOrEqual,
        "less_than" => NumericOp::LessThan,
        "less_or_equal" => NumericOp::LessOrEqual,
        "between" => {
            return match &spec.operand {
                Json::Array(bounds) if bounds.len() == 2 => Ok(NumericTest::Between(
                    numeric_operand(spec, &bounds[0])?,
                    numeric_operand(spec, &bounds[1])?,
                )),
                other => Err(mismatch(spec, other)),
            };
        }
        _ => return Err(unsupported(spec)),
    };

    Ok(NumericTest::Compare(op, numeric_operand(spec, &spec.operand)?))
}

fn compile_string(spec: &ConditionSpec) -> Result<StringTest> {
    let text = || match &spec.operand {
        Json::String(s) => Ok(s.clone()),
        other => Err(mismatch(spec, other)),
    };

    let test = match spec.operator.as_str() {
        "equals" => StringTest::Equals(text()?),
        "not_equals" => StringTest::NotEquals(text()?),
        "equals_ignore_case" => StringTest::EqualsIgnoreCase(text()?.to_lowercase()),
        "contains" => StringTest::Contains(text()?),
        "does_not_contain" => StringTest::DoesNotContain(text()?),
        "contains_ignore_case" => StringTest::ContainsIgnoreCase(text()?.to_lowercase()),
        "starts_with" => StringTest::StartsWith(text()?),
        "ends_with" => StringTest::EndsWith(text()?),
        "matches" => {
            let pattern = text()?;
            let regex = Regex::new(&pattern).map_err(|e| SorterError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            StringTest::Matches(regex)
        }
        _ => return Err(unsupported(spec)),
    };
    Ok(test)
}

/// Parses an RFC 3339 timestamp or a `YYYY-MM-DD` date (local midnight).
pub fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc3339(text) {
        return Some(date.with_timezone(&Utc));
    }

    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)?
        .and_local_timezone(Local)
        .earliest()
        .map(|date| date.with_timezone(&Utc))
}

fn date_operand(spec: &ConditionSpec, operand: &Json) -> Result<DateTime<Utc>> {
    match operand {
        Json::String(s) => parse_date(s).ok_or_else(|| mismatch(spec, operand)),
        other => Err(mismatch(spec, other)),
    }
}

fn span_operand(spec: &ConditionSpec) -> Result<Span> {
    Span::deserialize(&spec.operand).map_err(|_| mismatch(spec, &spec.operand))
}

fn compile_date(spec: &ConditionSpec) -> Result<DateTest> {
    let test = match spec.operator.as_str() {
        "before" => DateTest::Before(date_operand(spec, &spec.operand)?),
        "after" => DateTest::After(date_operand(spec, &spec.operand)?),
        "between" => match &spec.operand {
            Json::Array(bounds) if bounds.len() == 2 => DateTest::Between(
                date_operand(spec, &bounds[0])?,
                date_operand(spec, &bounds[1])?,
            ),
            other => return Err(mismatch(spec, other)),
        },
        "in_last" => DateTest::InLast(span_operand(spec)?),
        "not_in_last" => DateTest::NotInLast(span_operand(spec)?),
        "is_today" => DateTest::IsToday,
        _ => return Err(unsupported(spec)),
    };
    Ok(test)
}

fn compile_array(spec: &ConditionSpec) -> Result<ArrayTest> {
    let items = match &spec.operand {
        Json::Array(items) => items
            .iter()
            .map(|item| match item {
                Json::String(s) => Ok(s.clone()),
                other => Err(mismatch(spec, other)),
            })
            .collect::<Result<Vec<_>>>()?,
        other => return Err(mismatch(spec, other)),
    };

    let test = match spec.operator.as_str() {
        "contains" | "contains_all" => ArrayTest::ContainsAll(items),
        "contains_any" => ArrayTest::ContainsAny(items),
        "contains_none" => ArrayTest::ContainsNone(items),
        "equals" => ArrayTest::Equals(items),
        _ => return Err(unsupported(spec)),
    };
    Ok(test)
}

impl Match {
    pub fn compile(spec: &MatchSpec) -> Result<Self> {
        let tree = match spec {
            MatchSpec::All { all } => {
                Match::All(all.iter().map(Match::compile).collect::<Result<_>>()?)
            }
            MatchSpec::Any { any } => {
                Match::Any(any.iter().map(Match::compile).collect::<Result<_>>()?)
            }
            MatchSpec::Not { not } => Match::Not(Box::new(Match::compile(not)?)),
            MatchSpec::Leaf(leaf) => Match::Leaf(Condition::compile(leaf)?),
        };
        Ok(tree)
    }

    pub fn leaf_count(&self) -> usize {
        match self {
            Match::All(children) | Match::Any(children) => {
                children.iter().map(Match::leaf_count).sum()
            }
            Match::Not(inner) => inner.leaf_count(),
            Match::Leaf(_) => 1,
        }
    }
}

impl NumericTest {
    pub fn check(&self, subject: f64) -> bool {
        match *self {
            NumericTest::Compare(op, operand) => match op {
                NumericOp::Equals => subject == operand,
                NumericOp::NotEquals => subject != operand,
                NumericOp::GreaterThan => subject > operand,
                NumericOp::GreaterOrEqual => subject >= operand,
                NumericOp::LessThan => subject < operand,
                NumericOp::LessOrEqual => subject <= operand,
            },
            NumericTest::Between(low, high) => low <= subject && subject <= high,
        }
    }
}

impl StringTest {
    pub fn check(&self, subject: &str) -> bool {
        match self {
            StringTest::Equals(s) => subject == s,
            StringTest::NotEquals(s) => subject != s,
            StringTest::EqualsIgnoreCase(lower) => subject.to_lowercase() == *lower,
            StringTest::Contains(s) => subject.contains(s.as_str()),
            StringTest::DoesNotContain(s) => !subject.contains(s.as_str()),
            StringTest::ContainsIgnoreCase(lower) => subject.to_lowercase().contains(lower.as_str()),
            StringTest::StartsWith(s) => subject.starts_with(s.as_str()),
            StringTest::EndsWith(s) => subject.ends_with(s.as_str()),
            StringTest::Matches(regex) => regex.is_match(subject),
        }
    }
}

impl DateTest {
    pub fn check(&self, subject: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            DateTest::Before(date) => subject < *date,
            DateTest::After(date) => subject > *date,
            DateTest::Between(from, to) => *from <= subject && subject <= *to,
            // A span reaching past the representable range covers everything.
            DateTest::InLast(span) => span.before(now).map_or(true, |cutoff| subject >= cutoff),
            DateTest::NotInLast(span) => span.before(now).is_some_and(|cutoff| subject < cutoff),
            DateTest::IsToday => {
                subject.with_timezone(&Local).date_naive() == now.with_timezone(&Local).date_naive()
            }
        }
    }
}

impl ArrayTest {
    pub fn check(&self, subject: &[String]) -> bool {
        let has = |wanted: &String| subject.contains(wanted);
        match self {
            ArrayTest::ContainsAll(items) => items.iter().all(has),
            ArrayTest::ContainsAny(items) => items.iter().any(has),
            ArrayTest::ContainsNone(items) => !items.iter().any(has),
            ArrayTest::Equals(items) => {
                let mut left: Vec<&String> = subject.iter().collect();
                let mut right: Vec<&String> = items.iter().collect();
                left.sort();
                left.dedup();
                right.sort();
                right.dedup();
                left == right
            }
        }
    }
}

/// Evaluates compiled conditions against file entities.
#[derive(Clone)]
pub struct ConditionEvaluator {
    provider: Arc<dyn MetadataProvider>,
    clock: Arc<dyn Clock>,
}

impl ConditionEvaluator {
    pub fn new(provider: Arc<dyn MetadataProvider>, clock: Arc<dyn Clock>) -> Self {
        Self { provider, clock }
    }

    /// Evaluates one leaf. An unavailable subject is `Ok(false)`.
    pub fn evaluate(&self, condition: &Condition, file: &mut FileEntity) -> Result<bool> {
        let value = match file.resolve(&condition.subject, condition.kind(), self.provider.as_ref())
        {
            Ok(value) => value,
            Err(SorterError::AttributeUnavailable { key, path }) => {
                tracing::trace!("'{}' unavailable for {}, no match", key, path.display());
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let matched = match (&condition.test, &value) {
            (Test::Numeric(test), Value::Number(n)) => test.check(*n),
            (Test::String(test), Value::String(s)) => test.check(s),
            (Test::Date(test), Value::Date(d)) => test.check(*d, self.clock.now()),
            (Test::Array(test), Value::Array(items)) => test.check(items),
            _ => {
                return Err(SorterError::TypeMismatch {
                    subject: condition.subject.clone(),
                    expected: condition.kind(),
                    found: value.kind().to_string(),
                })
            }
        };
        Ok(matched)
    }

    /// Evaluates a whole tree. A tree without leaves always matches.
    pub fn evaluate_match(&self, tree: &Match, file: &mut FileEntity) -> Result<bool> {
        if tree.leaf_count() == 0 {
            return Ok(true);
        }
        self.walk(tree, file)
    }

    fn walk(&self, tree: &Match, file: &mut FileEntity) -> Result<bool> {
        match tree {
            Match::All(children) => {
                for child in children {
                    if !self.walk(child, file)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Match::Any(children) => {
                if children.is_empty() {
                    return Ok(true);
                }
                for child in children {
                    if self.walk(child, file)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Match::Not(inner) => Ok(!self.walk(inner, file)?),
            Match::Leaf(condition) => self.evaluate(condition, file),
        }
    }
}
