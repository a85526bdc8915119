// Gate Conditions
// Tagged expression tree deciding whether a job runs

use crate::expression::parser::{ConditionParser, ParseConditionError};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Comparison operator over a run metadata field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompareOp::Eq => write!(f, "=="),
            CompareOp::Ne => write!(f, "!="),
        }
    }
}

/// Predicate controlling whether a job runs.
///
/// Conditions are parsed once from text (see [`Condition::parse`]) and then
/// evaluated any number of times by
/// [`GateEvaluator`](crate::expression::GateEvaluator). Text form is used for
/// serde, so templates can carry conditions as plain strings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Condition {
    /// `always()`
    #[default]
    Always,
    /// `true` / `false`
    Literal(bool),
    /// `field == 'value'` / `field != 'value'`
    Compare {
        field: String,
        op: CompareOp,
        value: String,
    },
    /// `startsWith(field, 'prefix')`
    StartsWith { field: String, prefix: String },
    /// `success(a, b, ..)`: every named job succeeded
    AllSucceeded(Vec<String>),
    /// `failure(a, b, ..)`: at least one named job failed
    AnyFailed(Vec<String>),
    Not(Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    /// Parse the text form of a condition
    pub fn parse(input: &str) -> Result<Self, ParseConditionError> {
        ConditionParser::parse_str(input)
    }

    pub fn field_eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Compare {
            field: field.into(),
            op: CompareOp::Eq,
            value: value.into(),
        }
    }

    pub fn field_ne(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Compare {
            field: field.into(),
            op: CompareOp::Ne,
            value: value.into(),
        }
    }

    pub fn all_succeeded<I, S>(jobs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AllSucceeded(jobs.into_iter().map(Into::into).collect())
    }

    pub fn any_failed<I, S>(jobs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AnyFailed(jobs.into_iter().map(Into::into).collect())
    }

    pub fn and(self, other: Condition) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Condition) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Job names referenced by aggregate predicates
    pub fn referenced_jobs(&self) -> Vec<&str> {
        let mut jobs = Vec::new();
        self.walk(&mut |c| {
            if let Condition::AllSucceeded(names) | Condition::AnyFailed(names) = c {
                jobs.extend(names.iter().map(String::as_str));
            }
        });
        jobs
    }

    /// Run metadata fields referenced by comparisons
    pub fn referenced_fields(&self) -> Vec<&str> {
        let mut fields = Vec::new();
        self.walk(&mut |c| match c {
            Condition::Compare { field, .. } | Condition::StartsWith { field, .. } => {
                fields.push(field.as_str())
            }
            _ => {}
        });
        fields
    }

    fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Condition)) {
        visit(self);
        match self {
            Condition::Not(inner) => inner.walk(visit),
            Condition::And(l, r) | Condition::Or(l, r) => {
                l.walk(visit);
                r.walk(visit);
            }
            _ => {}
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Condition::Or(..) => 1,
            Condition::And(..) => 2,
            _ => 3,
        }
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>, min: u8) -> fmt::Result {
        if self.precedence() < min {
            write!(f, "({})", self)
        } else {
            write!(f, "{}", self)
        }
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Always => write!(f, "always()"),
            Condition::Literal(b) => write!(f, "{}", b),
            Condition::Compare { field, op, value } => {
                write!(f, "{} {} {}", field, op, quote(value))
            }
            Condition::StartsWith { field, prefix } => {
                write!(f, "startsWith({}, {})", field, quote(prefix))
            }
            Condition::AllSucceeded(jobs) => write!(f, "success({})", jobs.join(", ")),
            Condition::AnyFailed(jobs) => write!(f, "failure({})", jobs.join(", ")),
            Condition::Not(inner) => {
                write!(f, "!")?;
                inner.fmt_operand(f, 3)
            }
            Condition::And(l, r) => {
                l.fmt_operand(f, 2)?;
                write!(f, " && ")?;
                r.fmt_operand(f, 3)
            }
            Condition::Or(l, r) => {
                l.fmt_operand(f, 1)?;
                write!(f, " || ")?;
                r.fmt_operand(f, 2)
            }
        }
    }
}

impl FromStr for Condition {
    type Err = ParseConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Condition {
    type Error = ParseConditionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Condition> for String {
    fn from(c: Condition) -> Self {
        c.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_parses_back() {
        let cases = [
            "always()",
            "repository_owner == 'materialsproject'",
            "branch != 'main' && success(lint, test, docs)",
            "(event == 'push' || event == 'tag') && !failure(test)",
            "startsWith(branch, 'refs/tags/v')",
            "actor == 'o''brien'",
        ];
        for case in cases {
            let parsed = Condition::parse(case).unwrap();
            assert_eq!(parsed.to_string(), case);
            assert_eq!(Condition::parse(&parsed.to_string()).unwrap(), parsed);
        }
    }

    #[test]
    fn test_display_keeps_grouping() {
        let c = Condition::field_eq("event", "push")
            .or(Condition::field_eq("event", "tag"))
            .and(Condition::Literal(true));
        assert_eq!(c.to_string(), "(event == 'push' || event == 'tag') && true");
    }

    #[test]
    fn test_referenced_jobs_and_fields() {
        let c = Condition::parse("success(lint, docs) && (branch == 'main' || !failure(test))")
            .unwrap();
        assert_eq!(c.referenced_jobs(), vec!["lint", "docs", "test"]);
        assert_eq!(c.referenced_fields(), vec!["branch"]);
    }

    #[test]
    fn test_serde_as_string() {
        let c = Condition::field_eq("repository_owner", "materialsproject");
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, "\"repository_owner == 'materialsproject'\"");
        let back: Condition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }
}
