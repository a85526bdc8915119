// Gate Evaluator
// Pure interpreter for Condition trees over run metadata and upstream outcomes

use crate::error::{EngineError, EngineResult};
use crate::execution::aggregator::JobOutcome;
use crate::execution::context::{RunContext, TriggerInfo};
use crate::expression::condition::{CompareOp, Condition};

/// Evaluates gate conditions. Evaluation has no side effects.
pub struct GateEvaluator;

impl GateEvaluator {
    /// Evaluate `condition` against the run's trigger metadata and the
    /// outcomes recorded so far in its result aggregator
    pub fn evaluate(condition: &Condition, ctx: &RunContext) -> EngineResult<bool> {
        match condition {
            Condition::Always => Ok(true),
            Condition::Literal(b) => Ok(*b),
            Condition::Compare { field, op, value } => {
                let actual = Self::field(ctx, field)?;
                Ok(match op {
                    CompareOp::Eq => actual == value,
                    CompareOp::Ne => actual != value,
                })
            }
            Condition::StartsWith { field, prefix } => {
                Ok(Self::field(ctx, field)?.starts_with(prefix.as_str()))
            }
            Condition::AllSucceeded(jobs) => {
                for job in jobs {
                    if Self::outcome(ctx, job)? != Some(JobOutcome::Succeeded) {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::AnyFailed(jobs) => {
                for job in jobs {
                    if Self::outcome(ctx, job)? == Some(JobOutcome::Failed) {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not(inner) => Ok(!Self::evaluate(inner, ctx)?),
            Condition::And(l, r) => Ok(Self::evaluate(l, ctx)? && Self::evaluate(r, ctx)?),
            Condition::Or(l, r) => Ok(Self::evaluate(l, ctx)? || Self::evaluate(r, ctx)?),
        }
    }

    /// Check every field and job reference up front, so that short-circuiting
    /// cannot hide a misconfigured condition until some later run
    pub fn check_references(condition: &Condition, ctx: &RunContext) -> EngineResult<()> {
        for field in condition.referenced_fields() {
            Self::field(ctx, field)?;
        }
        for job in condition.referenced_jobs() {
            Self::outcome(ctx, job)?;
        }
        Ok(())
    }

    fn field<'a>(ctx: &'a RunContext, name: &str) -> EngineResult<&'a str> {
        ctx.trigger
            .field(name)
            .ok_or_else(|| EngineError::UnknownPredicateField(name.to_string()))
    }

    fn outcome(ctx: &RunContext, job: &str) -> EngineResult<Option<JobOutcome>> {
        if !ctx.results().knows(job) {
            return Err(EngineError::UnknownPredicateField(format!("job '{}'", job)));
        }
        Ok(ctx.results().query(job))
    }
}

/// Whether `name` is a valid trigger field for conditions
pub fn is_known_field(name: &str) -> bool {
    TriggerInfo::FIELDS.contains(&name)
}
