//! Expression evaluation over joined rows and groups.
//!
//! Predicates use SQL three-valued logic: a comparison involving NULL yields
//! NULL, and only rows whose predicate is TRUE pass a filter.

use std::cmp::Ordering;

use regex::Regex;
use reel_core::{
    BinaryOp, Date, Error, Expr, Func, QueryError, QueryErrorKind, Result, TypeError, Value,
};

use crate::table::TableDef;

/// Statement-wide inputs.
pub(crate) struct Env<'a> {
    pub params: &'a [Value],
    pub today: Date,
}

/// One table's row inside a joined row. `values` is `None` for the
/// unmatched side of a LEFT JOIN.
#[derive(Clone, Copy)]
pub(crate) struct Binding<'a> {
    pub alias: &'a str,
    pub def: &'a TableDef,
    pub values: Option<&'a [Value]>,
}

/// Select-list values already computed for the current row or group.
pub(crate) type Outputs<'a> = &'a [(String, Value)];

fn database_error(message: impl Into<String>) -> Error {
    Error::Query(QueryError::new(QueryErrorKind::Database, message))
}

fn syntax_error(message: impl Into<String>) -> Error {
    Error::Query(QueryError::new(QueryErrorKind::Syntax, message))
}

fn column(frame: &[Binding<'_>], table: Option<&str>, name: &str) -> Result<Value> {
    let binding = frame.iter().find(|b| match table {
        Some(alias) => b.alias == alias,
        None => b.def.index_of(name).is_some(),
    });
    let Some(binding) = binding else {
        return Err(Error::Query(QueryError::new(
            QueryErrorKind::NotFound,
            format!("column {}{} is not in scope", table.map_or(String::new(), |t| format!("{t}.")), name),
        )));
    };
    let index = binding.def.column_index(name)?;
    Ok(binding.values.map_or(Value::Null, |values| values[index].clone()))
}

fn alias(outputs: Outputs<'_>, name: &str) -> Result<Value> {
    outputs
        .iter()
        .find(|(alias, _)| alias == name)
        .map(|(_, value)| value.clone())
        .ok_or_else(|| syntax_error(format!("unknown select alias {name}")))
}

/// Evaluate `expr` against one joined row.
pub(crate) fn eval_row(
    expr: &Expr,
    frame: &[Binding<'_>],
    env: &Env<'_>,
    outputs: Outputs<'_>,
) -> Result<Value> {
    eval_with(expr, env, &mut |e| match e {
        Expr::Column { table, name } => Some(column(frame, table.as_deref(), name)),
        Expr::Alias(name) => Some(alias(outputs, name)),
        _ => None,
    })
}

/// Evaluate `expr` against a group of joined rows.
///
/// Aggregates fold over the group; bare columns read the group's first row.
pub(crate) fn eval_group(
    expr: &Expr,
    group: &[Vec<Binding<'_>>],
    env: &Env<'_>,
    outputs: Outputs<'_>,
) -> Result<Value> {
    eval_with(expr, env, &mut |e| match e {
        Expr::CountStar => Some(Ok(Value::BigInt(group.len() as i64))),
        Expr::Function { func, args } if func.is_aggregate() => {
            Some(aggregate(*func, args, group, env))
        }
        Expr::Column { .. } => Some(
            group
                .first()
                .map_or(Ok(Value::Null), |frame| eval_row(e, frame, env, &[])),
        ),
        Expr::Alias(name) => Some(alias(outputs, name)),
        _ => None,
    })
}

/// Is the predicate TRUE (not FALSE, not NULL)?
pub(crate) fn is_true(value: &Value) -> Result<bool> {
    Ok(truth(value)? == Some(true))
}

fn truth(value: &Value) -> Result<Option<bool>> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(*b)),
        other => Err(Error::Type(TypeError {
            expected: "BOOLEAN",
            actual: other.type_name().to_string(),
            column: None,
        })),
    }
}

fn from_truth(truth: Option<bool>) -> Value {
    truth.map_or(Value::Null, Value::Bool)
}

fn eval_with(
    expr: &Expr,
    env: &Env<'_>,
    leaf: &mut dyn FnMut(&Expr) -> Option<Result<Value>>,
) -> Result<Value> {
    if let Some(value) = leaf(expr) {
        return value;
    }
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Placeholder(index) => index
            .checked_sub(1)
            .and_then(|i| env.params.get(i))
            .cloned()
            .ok_or_else(|| syntax_error(format!("parameter ${index} is not bound"))),
        Expr::Binary { left, op, right } => {
            let l = eval_with(left, env, leaf)?;
            let r = eval_with(right, env, leaf)?;
            binary(*op, &l, &r)
        }
        Expr::Not(inner) => {
            let value = eval_with(inner, env, leaf)?;
            Ok(from_truth(truth(&value)?.map(|b| !b)))
        }
        Expr::IsNull { expr, negated } => {
            let value = eval_with(expr, env, leaf)?;
            Ok(Value::Bool(value.is_null() != *negated))
        }
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let value = eval_with(expr, env, leaf)?;
            let low = eval_with(low, env, leaf)?;
            let high = eval_with(high, env, leaf)?;
            let above = truth(&binary(BinaryOp::Ge, &value, &low)?)?;
            let below = truth(&binary(BinaryOp::Le, &value, &high)?)?;
            let inside = and(above, below);
            Ok(from_truth(if *negated { inside.map(|b| !b) } else { inside }))
        }
        Expr::In {
            expr,
            values,
            negated,
        } => {
            let value = eval_with(expr, env, leaf)?;
            let mut found = Some(false);
            for candidate in values {
                let candidate = eval_with(candidate, env, leaf)?;
                found = or(found, truth(&binary(BinaryOp::Eq, &value, &candidate)?)?);
            }
            Ok(from_truth(if *negated { found.map(|b| !b) } else { found }))
        }
        Expr::Like {
            expr,
            pattern,
            negated,
        } => {
            let value = eval_with(expr, env, leaf)?;
            match value {
                Value::Null => Ok(Value::Null),
                Value::Text(text) => Ok(Value::Bool(like(pattern)?.is_match(&text) != *negated)),
                other => Err(Error::Type(TypeError {
                    expected: "TEXT",
                    actual: other.type_name().to_string(),
                    column: None,
                })),
            }
        }
        Expr::Function { func, args } if !func.is_aggregate() => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_with(arg, env, leaf)?);
            }
            scalar_function(*func, values, env)
        }
        Expr::Function { func, .. } => Err(syntax_error(format!(
            "aggregate {} is not allowed here",
            func.name()
        ))),
        Expr::CountStar => Err(syntax_error("COUNT(*) is not allowed here")),
        Expr::Column { name, .. } => Err(syntax_error(format!("column {name} is not in scope"))),
        Expr::Alias(name) => Err(syntax_error(format!("alias {name} is not in scope"))),
        Expr::Path(path) => Err(syntax_error(format!("unresolved field path {path}"))),
    }
}

fn and(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(false), _) | (_, Some(false)) => Some(false),
        (Some(true), Some(true)) => Some(true),
        _ => None,
    }
}

fn or(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(true), _) | (_, Some(true)) => Some(true),
        (Some(false), Some(false)) => Some(false),
        _ => None,
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    match op {
        BinaryOp::And => Ok(from_truth(and(truth(l)?, truth(r)?))),
        BinaryOp::Or => Ok(from_truth(or(truth(l)?, truth(r)?))),
        op if op.is_comparison() => {
            if l.is_null() || r.is_null() {
                return Ok(Value::Null);
            }
            let ordering = l.compare(r).ok_or_else(|| {
                Error::Type(TypeError {
                    expected: l.type_name(),
                    actual: r.type_name().to_string(),
                    column: None,
                })
            })?;
            let result = match op {
                BinaryOp::Eq => ordering == Ordering::Equal,
                BinaryOp::Ne => ordering != Ordering::Equal,
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }
        op => arithmetic(op, l, r),
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    let mismatch = || {
        Error::Type(TypeError {
            expected: "numeric operands",
            actual: format!("{} {} {}", l.type_name(), op.as_str(), r.type_name()),
            column: None,
        })
    };
    if matches!(l, Value::Double(_)) || matches!(r, Value::Double(_)) {
        let (a, b) = (l.as_f64().ok_or_else(mismatch)?, r.as_f64().ok_or_else(mismatch)?);
        if op == BinaryOp::Div && b == 0.0 {
            return Err(database_error("division by zero"));
        }
        return Ok(Value::Double(match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            _ => a / b,
        }));
    }
    let (a, b) = (l.as_i64().ok_or_else(mismatch)?, r.as_i64().ok_or_else(mismatch)?);
    let result = match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Sub => a.checked_sub(b),
        BinaryOp::Mul => a.checked_mul(b),
        _ if b == 0 => return Err(database_error("division by zero")),
        _ => a.checked_div(b),
    }
    .ok_or_else(|| database_error("integer out of range"))?;
    // INTEGER op INTEGER stays INTEGER when it fits.
    if matches!((l, r), (Value::Int(_), Value::Int(_))) {
        if let Ok(narrow) = i32::try_from(result) {
            return Ok(Value::Int(narrow));
        }
    }
    Ok(Value::BigInt(result))
}

/// Translate a LIKE pattern (`%`, `_`, `\` escapes) into an anchored regex.
fn like(pattern: &str) -> Result<Regex> {
    let mut regex = String::from("(?s)^");
    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    regex.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    Regex::new(&regex).map_err(|e| syntax_error(format!("invalid LIKE pattern {pattern:?}: {e}")))
}

fn scalar_function(func: Func, args: Vec<Value>, env: &Env<'_>) -> Result<Value> {
    let first = args.first().cloned().unwrap_or(Value::Null);
    match func {
        Func::Coalesce => Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null)),
        Func::CurrentDate => Ok(Value::Date(env.today)),
        Func::Year => match first {
            Value::Null => Ok(Value::Null),
            Value::Date(date) => Ok(Value::Int(date.year())),
            Value::Text(text) => Ok(Value::Int(text.parse::<Date>()?.year())),
            other => Err(Error::Type(TypeError {
                expected: "DATE",
                actual: other.type_name().to_string(),
                column: None,
            })),
        },
        Func::Lower | Func::Upper => match first {
            Value::Null => Ok(Value::Null),
            Value::Text(text) if func == Func::Lower => Ok(Value::Text(text.to_lowercase())),
            Value::Text(text) => Ok(Value::Text(text.to_uppercase())),
            other => Err(Error::Type(TypeError {
                expected: "TEXT",
                actual: other.type_name().to_string(),
                column: None,
            })),
        },
        aggregate => Err(syntax_error(format!(
            "aggregate {} is not allowed here",
            aggregate.name()
        ))),
    }
}

fn aggregate(func: Func, args: &[Expr], group: &[Vec<Binding<'_>>], env: &Env<'_>) -> Result<Value> {
    let arg = args
        .first()
        .ok_or_else(|| syntax_error(format!("{} needs an argument", func.name())))?;
    let mut values = Vec::with_capacity(group.len());
    for frame in group {
        let value = eval_row(arg, frame, env, &[])?;
        if !value.is_null() {
            values.push(value);
        }
    }
    match func {
        Func::Count => Ok(Value::BigInt(values.len() as i64)),
        Func::Min => Ok(values
            .into_iter()
            .min_by(Value::sort_cmp)
            .unwrap_or(Value::Null)),
        Func::Max => Ok(values
            .into_iter()
            .max_by(Value::sort_cmp)
            .unwrap_or(Value::Null)),
        Func::Sum if values.is_empty() => Ok(Value::Null),
        Func::Sum if values.iter().all(|v| matches!(v, Value::Int(_) | Value::BigInt(_))) => {
            let mut total: i64 = 0;
            for value in &values {
                total = total
                    .checked_add(value.as_i64().unwrap_or_default())
                    .ok_or_else(|| database_error("bigint out of range"))?;
            }
            Ok(Value::BigInt(total))
        }
        Func::Sum | Func::Avg => {
            let mut total = 0.0;
            for value in &values {
                total += value.as_f64().ok_or_else(|| {
                    Error::Type(TypeError {
                        expected: "numeric",
                        actual: value.type_name().to_string(),
                        column: None,
                    })
                })?;
            }
            if func == Func::Sum {
                Ok(Value::Double(total))
            } else if values.is_empty() {
                Ok(Value::Null)
            } else {
                #[allow(clippy::cast_precision_loss)]
                Ok(Value::Double(total / values.len() as f64))
            }
        }
        other => scalar_function(other, Vec::new(), env),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Env<'static> {
        Env {
            params: &[],
            today: Date::from_days(0),
        }
    }

    fn eval(expr: &Expr) -> Value {
        eval_row(expr, &[], &env(), &[]).unwrap()
    }

    #[test]
    fn three_valued_logic() {
        assert_eq!(eval(&Expr::lit(Value::Null).eq(1)), Value::Null);
        assert_eq!(
            eval(&Expr::lit(Value::Null).eq(1).and(Expr::lit(false))),
            Value::Bool(false)
        );
        assert_eq!(
            eval(&Expr::lit(Value::Null).eq(1).or(Expr::lit(true))),
            Value::Bool(true)
        );
        assert_eq!(eval(&Expr::lit(Value::Null).is_null()), Value::Bool(true));
        assert!(!is_true(&eval(&Expr::lit(Value::Null).eq(1).not())).unwrap());
    }

    #[test]
    fn like_patterns() {
        assert_eq!(eval(&Expr::lit("Clint Eastwood").contains("East")), Value::Bool(true));
        assert_eq!(eval(&Expr::lit("Clint").starts_with("cl")), Value::Bool(false));
        assert_eq!(eval(&Expr::lit("100%").contains("0%")), Value::Bool(true));
        assert_eq!(eval(&Expr::lit("1000").contains("0%")), Value::Bool(false));
        assert_eq!(eval(&Expr::lit("a.c").like("a_c")), Value::Bool(true));
    }

    #[test]
    fn arithmetic_and_functions() {
        assert_eq!(eval(&Expr::lit(2024).sub(Expr::lit(1992))), Value::Int(32));
        assert_eq!(eval(&Expr::lit(7_i64).div(Expr::lit(2))), Value::BigInt(3));
        assert!(eval_row(&Expr::lit(1).div(Expr::lit(0)), &[], &env(), &[]).is_err());
        assert_eq!(eval(&Expr::current_year()), Value::Int(1970));
        assert_eq!(
            eval(&Expr::coalesce(vec![Expr::lit(Value::Null), Expr::lit(4)])),
            Value::Int(4)
        );
        assert_eq!(
            eval(&Expr::lit(5).between(Expr::lit(1), Expr::lit(5))),
            Value::Bool(true)
        );
        assert_eq!(
            eval(&Expr::lit(3).in_list(vec![Expr::lit(1), Expr::lit(Value::Null)])),
            Value::Null
        );
    }

    #[test]
    fn aggregates_ignore_nulls() {
        let group: Vec<Vec<Binding<'_>>> = vec![Vec::new(), Vec::new()];
        let count = eval_group(&Expr::count_star(), &group, &env(), &[]).unwrap();
        assert_eq!(count, Value::BigInt(2));
        let sum = eval_group(&Expr::lit(Value::Null).sum(), &group, &env(), &[]).unwrap();
        assert_eq!(sum, Value::Null);
        let total = eval_group(
            &Expr::coalesce(vec![Expr::lit(4).sum(), Expr::lit(0)]),
            &group,
            &env(),
            &[],
        )
        .unwrap();
        assert_eq!(total, Value::BigInt(8));
        assert!(eval_row(&Expr::count_star(), &[], &env(), &[]).is_err());
    }
}
