use bigdecimal::{BigDecimal, RoundingMode, Zero};
use serde_json::Value;

use super::{format_decimal, to_decimal, TaskContext, TaskError};

const DEFAULT_PRECISION: i64 = 18;

fn input_decimal(ctx: &TaskContext<'_>) -> Result<BigDecimal, TaskError> {
    let v = ctx.value_or_input("input")?;
    to_decimal(&v).map_err(TaskError::Math)
}

pub(super) fn multiply(ctx: &TaskContext<'_>) -> Result<Value, TaskError> {
    let input = input_decimal(ctx)?;
    let times = ctx
        .decimal("times")?
        .ok_or(TaskError::MissingParam("times"))?;
    Ok(Value::String(format_decimal(&(input * times))))
}

pub(super) fn divide(ctx: &TaskContext<'_>) -> Result<Value, TaskError> {
    let input = input_decimal(ctx)?;
    let divisor = ctx
        .decimal("divisor")?
        .ok_or(TaskError::MissingParam("divisor"))?;
    if divisor.is_zero() {
        return Err(TaskError::Math("division by zero".into()));
    }
    let precision = match ctx.u64("precision")? {
        Some(p) => i64::try_from(p).map_err(|_| TaskError::BadParam {
            name: "precision",
            reason: "too large".into(),
        })?,
        None => DEFAULT_PRECISION,
    };
    let quotient = (input / divisor).with_scale_round(precision, RoundingMode::HalfUp);
    Ok(Value::String(format_decimal(&quotient)))
}

/// The numeric inputs of an aggregation, tolerating `allowedFaults` errors.
/// Values come from the `values` attribute when set, else from the inputs.
fn aggregate_inputs(ctx: &TaskContext<'_>) -> Result<Vec<BigDecimal>, TaskError> {
    let allowed = ctx.u64("allowedFaults")?.unwrap_or(0) as usize;
    let raw: Vec<Result<Value, String>> = match ctx.json("values")? {
        Some(Value::Array(items)) => items.into_iter().map(Ok).collect(),
        Some(other) => {
            return Err(TaskError::BadParam {
                name: "values",
                reason: format!("{other} is not a list"),
            })
        }
        None => ctx.inputs.clone(),
    };
    if raw.is_empty() {
        return Err(TaskError::Math("no values to aggregate".into()));
    }

    let total = raw.len();
    let mut values = Vec::with_capacity(total);
    let mut errors = 0;
    for r in raw {
        match r.and_then(|v| to_decimal(&v)) {
            Ok(d) => values.push(d),
            Err(_) => errors += 1,
        }
    }
    if errors > allowed || values.is_empty() {
        return Err(TaskError::TooManyFaults {
            errors,
            total,
            allowed,
        });
    }
    Ok(values)
}

pub(super) fn sum(ctx: &TaskContext<'_>) -> Result<Value, TaskError> {
    let total = aggregate_inputs(ctx)?
        .into_iter()
        .fold(BigDecimal::zero(), |acc, v| acc + v);
    Ok(Value::String(format_decimal(&total)))
}

pub(super) fn median(ctx: &TaskContext<'_>) -> Result<Value, TaskError> {
    let mut values = aggregate_inputs(ctx)?;
    values.sort();
    let mid = values.len() / 2;
    let median = if values.len() % 2 == 1 {
        values[mid].clone()
    } else {
        (&values[mid - 1] + &values[mid]) / BigDecimal::from(2)
    };
    Ok(Value::String(format_decimal(&median)))
}
