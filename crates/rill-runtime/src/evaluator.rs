//! Expression evaluation against a [`Valuer`]
//!
//! [`ValuerEval`] walks an [`Expr`] tree and produces a [`Value`] or an
//! [`EvalError`]. Field references that cannot be resolved evaluate to
//! `Null`; type errors are reported with the dynamic type of both operands.
//!
//! ## Null comparisons
//!
//! When either operand of a binary operator is `Null`:
//!
//! | Operator        | Result                         |
//! |-----------------|--------------------------------|
//! | `=`, `<=`, `>=` | `true` only if both are null   |
//! | `!=`            | `true` unless both are null    |
//! | `<`, `>`        | `false`                        |
//! | anything else   | `Null`                         |

use crate::error::{EvalError, EvalResult};
use crate::valuer::Valuer;
use rill_core::validate::builtins::is_aggregate_function;
use rill_core::{BinOp, Call, CaseExpr, Expr, UnaryOp, Value};
use std::cmp::Ordering;

/// Evaluate `expr` against `valuer`.
pub fn eval(expr: &Expr, valuer: &dyn Valuer) -> EvalResult<Value> {
    ValuerEval::new(valuer).eval(expr)
}

/// Evaluator bound to one valuer
pub struct ValuerEval<'a> {
    valuer: &'a dyn Valuer,
}

impl<'a> ValuerEval<'a> {
    pub fn new(valuer: &'a dyn Valuer) -> Self {
        Self { valuer }
    }

    pub fn eval(&self, expr: &Expr) -> EvalResult<Value> {
        match expr {
            Expr::Integer(n) => Ok(Value::Int(*n)),
            Expr::Number(n) => Ok(Value::Float(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::FieldRef { stream, name } => Ok(self
                .valuer
                .value(name, stream.as_deref())
                .unwrap_or(Value::Null)),
            Expr::MetaRef { stream, name } => Ok(self
                .valuer
                .meta(name, stream.as_deref())
                .unwrap_or(Value::Null)),
            Expr::Wildcard { stream } => Ok(self
                .valuer
                .all(stream.as_deref())
                .map(Value::Map)
                .unwrap_or(Value::Null)),
            Expr::Paren(inner) => self.eval(inner),
            Expr::Unary { op, expr } => self.eval_unary(*op, expr),
            Expr::Binary { op, lhs, rhs } => self.eval_binary(*op, lhs, rhs),
            Expr::Call(call) => self.eval_call(call),
            Expr::Case(case) => self
                .eval_case(case)
                .map_err(|e| e.context("evaluate case expression error")),
            Expr::Index(_) | Expr::Colon { .. } => {
                Err(EvalError::msg(format!("unexpected expression {}", expr)))
            }
            Expr::Window(_) => Ok(Value::Null),
        }
    }

    fn eval_unary(&self, op: UnaryOp, expr: &Expr) -> EvalResult<Value> {
        let v = self.eval(expr)?;
        match (op, v) {
            (_, Value::Null) => Ok(Value::Null),
            (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
            (UnaryOp::Neg, Value::Int(n)) => Ok(Value::Int(n.wrapping_neg())),
            (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
            (UnaryOp::Not, v) => Err(EvalError::msg(format!(
                "invalid operation NOT {}",
                v.describe()
            ))),
            (UnaryOp::Neg, v) => Err(EvalError::msg(format!(
                "invalid operation - {}",
                v.describe()
            ))),
        }
    }

    fn eval_binary(&self, op: BinOp, lhs: &Expr, rhs: &Expr) -> EvalResult<Value> {
        match op {
            BinOp::Arrow => {
                let l = self.eval(lhs)?;
                arrow(&l, rhs)
            }
            BinOp::Subset => {
                let l = self.eval(lhs)?;
                self.subset(&l, rhs)
            }
            BinOp::And | BinOp::Or => {
                let l = self.eval(lhs)?;
                match (op, &l) {
                    (BinOp::And, Value::Bool(false)) => return Ok(Value::Bool(false)),
                    (BinOp::Or, Value::Bool(true)) => return Ok(Value::Bool(true)),
                    _ => {}
                }
                let r = self.eval(rhs)?;
                apply_binary(op, &l, &r)
            }
            _ => {
                let l = self.eval(lhs)?;
                let r = self.eval(rhs)?;
                apply_binary(op, &l, &r)
            }
        }
    }

    fn subset(&self, lhs: &Value, rhs: &Expr) -> EvalResult<Value> {
        if lhs.is_null() {
            return Ok(Value::Null);
        }
        let arr = lhs.as_array().ok_or_else(|| {
            EvalError::msg(format!("[] is an invalid operation for {}", lhs.type_tag()))
        })?;
        let len = arr.len() as i64;
        match rhs {
            Expr::Colon { start, end } => {
                let s = if *start < 0 { start + len } else { *start };
                if s < 0 || s > len {
                    return Err(EvalError::msg(format!(
                        "start index {} out of range of length {}",
                        start, len
                    )));
                }
                let e = match end {
                    None | Some(-1) => len,
                    Some(e) if *e < 0 => e + len,
                    Some(e) => *e,
                };
                if e < 0 || e > len {
                    return Err(EvalError::msg(format!(
                        "end index {} out of range of length {}",
                        end.unwrap_or(len),
                        len
                    )));
                }
                if s > e {
                    return Err(EvalError::msg(format!(
                        "start cannot be greater than end. start:{}  end:{}",
                        s, e
                    )));
                }
                Ok(Value::Array(arr[s as usize..e as usize].to_vec()))
            }
            other => {
                let index = match other {
                    Expr::Index(i) => *i,
                    expr => match self.eval(expr)? {
                        Value::Int(i) => i,
                        v => {
                            return Err(EvalError::msg(format!(
                                "invalid index {}",
                                v.describe()
                            )))
                        }
                    },
                };
                let i = if index < 0 { index + len } else { index };
                if i < 0 || i >= len {
                    return Err(EvalError::msg(format!(
                        "out of index: {} of {}",
                        index, len
                    )));
                }
                Ok(arr[i as usize].clone())
            }
        }
    }

    fn eval_call(&self, call: &Call) -> EvalResult<Value> {
        match call.name.as_str() {
            "window_start" => {
                return Ok(self
                    .valuer
                    .window_range()
                    .map(|r| Value::Int(r.start))
                    .unwrap_or(Value::Null))
            }
            "window_end" => {
                return Ok(self
                    .valuer
                    .window_range()
                    .map(|r| Value::Int(r.end))
                    .unwrap_or(Value::Null))
            }
            _ => {}
        }

        let args = if is_aggregate_function(&call.name) {
            match self.valuer.as_aggregate() {
                Some(data) => call
                    .args
                    .iter()
                    .map(|arg| data.aggregate_eval(arg).map(Value::Array))
                    .collect::<EvalResult<Vec<_>>>()?,
                // A single record is a group of one
                None => call
                    .args
                    .iter()
                    .map(|arg| self.eval(arg).map(|v| Value::Array(vec![v])))
                    .collect::<EvalResult<Vec<_>>>()?,
            }
        } else {
            call.args
                .iter()
                .map(|arg| self.eval(arg))
                .collect::<EvalResult<Vec<_>>>()?
        };

        let result = self
            .valuer
            .as_call()
            .and_then(|c| c.call(&call.name, &args));
        match result {
            Some(Ok(v)) => Ok(v),
            Some(Err(message)) => Err(EvalError::call(&call.name, message)),
            None => Err(EvalError::call(&call.name, "function not found")),
        }
    }

    fn eval_case(&self, case: &CaseExpr) -> EvalResult<Value> {
        match &case.value {
            Some(value) => {
                let v = self.eval(value)?;
                for when in &case.when_clauses {
                    let w = self.eval(&when.expr)?;
                    if apply_binary(BinOp::Eq, &v, &w)? == Value::Bool(true) {
                        return self.eval(&when.result);
                    }
                }
            }
            None => {
                for when in &case.when_clauses {
                    // A WHEN that is not a boolean never matches.
                    if self.eval(&when.expr)? == Value::Bool(true) {
                        return self.eval(&when.result);
                    }
                }
            }
        }
        match &case.else_clause {
            Some(e) => self.eval(e),
            None => Ok(Value::Null),
        }
    }
}

/// `lhs -> rhs`. A null object yields null; any other non-map is an error.
fn arrow(lhs: &Value, rhs: &Expr) -> EvalResult<Value> {
    let m = match lhs {
        Value::Map(m) => m,
        Value::Null => return Ok(Value::Null),
        other => {
            return Err(EvalError::msg(format!(
                "the result {} is not a type of map",
                other.describe()
            )))
        }
    };
    let key = match rhs {
        Expr::FieldRef { name, .. } => name.as_str(),
        Expr::Str(s) => s.as_str(),
        _ => {
            return Err(EvalError::msg(
                "the right expression is not a field reference node",
            ))
        }
    };
    Ok(m.get(key)
        .or_else(|| {
            m.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
        .cloned()
        .unwrap_or(Value::Null))
}

fn compare(op: BinOp, ord: Option<Ordering>) -> Value {
    let b = match op {
        BinOp::Eq => ord == Some(Ordering::Equal),
        BinOp::NotEq => ord != Some(Ordering::Equal),
        BinOp::Lt => ord == Some(Ordering::Less),
        BinOp::Le => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
        BinOp::Gt => ord == Some(Ordering::Greater),
        BinOp::Ge => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
        _ => false,
    };
    Value::Bool(b)
}

/// Apply a binary operator to two already evaluated operands.
pub fn apply_binary(op: BinOp, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    if lhs.is_null() || rhs.is_null() {
        let both = lhs.is_null() && rhs.is_null();
        return Ok(match op {
            BinOp::Eq | BinOp::Le | BinOp::Ge => Value::Bool(both),
            BinOp::NotEq => Value::Bool(!both),
            BinOp::Lt | BinOp::Gt => Value::Bool(false),
            _ => Value::Null,
        });
    }

    let invalid = || EvalError::invalid_operation(lhs, op, rhs);
    match (lhs, rhs) {
        (Value::Int(l), Value::Int(r)) => int_op(op, *l, *r).ok_or_else(invalid)?,
        (Value::Int(_), Value::Float(_))
        | (Value::Float(_), Value::Int(_))
        | (Value::Float(_), Value::Float(_)) => {
            let (l, r) = match (lhs.as_float(), rhs.as_float()) {
                (Some(l), Some(r)) => (l, r),
                _ => return Err(invalid()),
            };
            float_op(op, l, r).ok_or_else(invalid)?
        }
        (Value::Str(l), Value::Str(r)) => {
            if op.is_comparison() {
                Ok(compare(op, Some(l.cmp(r))))
            } else {
                Err(invalid())
            }
        }
        (Value::Bool(l), Value::Bool(r)) => match op {
            BinOp::Eq => Ok(Value::Bool(l == r)),
            BinOp::NotEq => Ok(Value::Bool(l != r)),
            BinOp::And | BinOp::BitAnd => Ok(Value::Bool(*l && *r)),
            BinOp::Or | BinOp::BitOr => Ok(Value::Bool(*l || *r)),
            BinOp::BitXor => Ok(Value::Bool(l ^ r)),
            _ => Err(invalid()),
        },
        (Value::Time(_), _) | (_, Value::Time(_)) => {
            match (lhs.to_time(), rhs.to_time()) {
                (Some(l), Some(r)) if op.is_comparison() => Ok(compare(op, Some(l.cmp(&r)))),
                _ => Err(invalid()),
            }
        }
        (Value::Array(_), Value::Array(_)) | (Value::Map(_), Value::Map(_)) => match op {
            BinOp::Eq => Ok(Value::Bool(lhs == rhs)),
            BinOp::NotEq => Ok(Value::Bool(lhs != rhs)),
            _ => Err(invalid()),
        },
        _ => Err(invalid()),
    }
}

/// `None` when the operator does not apply to integers.
fn int_op(op: BinOp, l: i64, r: i64) -> Option<EvalResult<Value>> {
    let v = match op {
        BinOp::Add => Value::Int(l.wrapping_add(r)),
        BinOp::Sub => Value::Int(l.wrapping_sub(r)),
        BinOp::Mul => Value::Int(l.wrapping_mul(r)),
        BinOp::Div => {
            if r == 0 {
                return Some(Err(EvalError::DividedByZero));
            }
            Value::Int(l.wrapping_div(r))
        }
        BinOp::Mod => {
            if r == 0 {
                return Some(Err(EvalError::DividedByZero));
            }
            Value::Int(l.wrapping_rem(r))
        }
        BinOp::BitAnd => Value::Int(l & r),
        BinOp::BitOr => Value::Int(l | r),
        BinOp::BitXor => Value::Int(l ^ r),
        op if op.is_comparison() => compare(op, Some(l.cmp(&r))),
        _ => return None,
    };
    Some(Ok(v))
}

fn float_op(op: BinOp, l: f64, r: f64) -> Option<EvalResult<Value>> {
    let v = match op {
        BinOp::Add => Value::Float(l + r),
        BinOp::Sub => Value::Float(l - r),
        BinOp::Mul => Value::Float(l * r),
        BinOp::Div => {
            if r == 0.0 {
                return Some(Err(EvalError::DividedByZero));
            }
            Value::Float(l / r)
        }
        BinOp::Mod => {
            if r == 0.0 {
                return Some(Err(EvalError::DividedByZero));
            }
            Value::Float(l % r)
        }
        op if op.is_comparison() => compare(op, l.partial_cmp(&r)),
        _ => return None,
    };
    Some(Ok(v))
}

/// Truthiness used by WHERE, HAVING and join conditions.
///
/// `None` means the value is not a boolean.
pub fn as_condition(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Null => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::{GroupedTuples, Message, Row, Tuple, WindowRange};
    use crate::valuer::{MultiValuer, AGGREGATE_FUNCTIONS, FUNCTIONS};
    use rill_core::{BinOp, Expr, WhenClause};

    fn demo(pairs: &[(&str, Value)]) -> Tuple {
        Tuple::new(
            "demo",
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<Message>(),
            0,
        )
    }

    fn eval_on(expr: &Expr, t: &Tuple) -> EvalResult<Value> {
        let v = MultiValuer::new(vec![t, &FUNCTIONS, &AGGREGATE_FUNCTIONS]);
        eval(expr, &v)
    }

    #[test]
    fn test_numeric_promotion() {
        let t = demo(&[("a", 3.into()), ("b", 1.5.into())]);
        let sum = Expr::binary(BinOp::Add, Expr::field("a"), Expr::field("b"));
        assert_eq!(eval_on(&sum, &t), Ok(Value::Float(4.5)));
        let div = Expr::binary(BinOp::Div, Expr::field("a"), Expr::Integer(2));
        assert_eq!(eval_on(&div, &t), Ok(Value::Int(1)));
    }

    #[test]
    fn test_division_by_zero_is_an_error_for_operators() {
        let t = demo(&[]);
        let div = Expr::binary(BinOp::Div, Expr::Integer(3), Expr::Integer(0));
        assert_eq!(eval_on(&div, &t), Err(EvalError::DividedByZero));
        let rem = Expr::binary(BinOp::Mod, Expr::Number(3.0), Expr::Integer(0));
        assert_eq!(eval_on(&rem, &t), Err(EvalError::DividedByZero));
    }

    #[test]
    fn test_type_mismatch_message() {
        let t = demo(&[("size", "string".into())]);
        let cond = Expr::binary(BinOp::Ge, Expr::field("size"), Expr::Integer(3));
        let err = eval_on(&cond, &t).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid operation string(string) >= int64(3)"
        );
    }

    #[test]
    fn test_null_comparison_table() {
        let null = Value::Null;
        let one = Value::Int(1);
        assert_eq!(apply_binary(BinOp::Eq, &null, &null), Ok(Value::Bool(true)));
        assert_eq!(apply_binary(BinOp::Eq, &null, &one), Ok(Value::Bool(false)));
        assert_eq!(apply_binary(BinOp::Ge, &null, &null), Ok(Value::Bool(true)));
        assert_eq!(apply_binary(BinOp::NotEq, &one, &null), Ok(Value::Bool(true)));
        assert_eq!(apply_binary(BinOp::NotEq, &null, &null), Ok(Value::Bool(false)));
        assert_eq!(apply_binary(BinOp::Lt, &null, &null), Ok(Value::Bool(false)));
        assert_eq!(apply_binary(BinOp::Add, &null, &one), Ok(Value::Null));
    }

    #[test]
    fn test_string_ordering_is_lexicographic() {
        let a = Value::Str("apple".into());
        let b = Value::Str("banana".into());
        assert_eq!(apply_binary(BinOp::Lt, &a, &b), Ok(Value::Bool(true)));
        assert!(apply_binary(BinOp::Add, &a, &b).is_err());
    }

    #[test]
    fn test_short_circuit_skips_rhs_errors() {
        let t = demo(&[]);
        let bad = Expr::binary(BinOp::Div, Expr::Integer(1), Expr::Integer(0));
        let and = Expr::binary(BinOp::And, Expr::Bool(false), bad.clone());
        assert_eq!(eval_on(&and, &t), Ok(Value::Bool(false)));
        let or = Expr::binary(BinOp::Or, Expr::Bool(true), bad);
        assert_eq!(eval_on(&or, &t), Ok(Value::Bool(true)));
    }

    #[test]
    fn test_bitwise() {
        let t = demo(&[]);
        let e = Expr::binary(BinOp::BitXor, Expr::Integer(6), Expr::Integer(3));
        assert_eq!(eval_on(&e, &t), Ok(Value::Int(5)));
        let e = Expr::binary(BinOp::BitAnd, Expr::Bool(true), Expr::Bool(false));
        assert_eq!(eval_on(&e, &t), Ok(Value::Bool(false)));
    }

    #[test]
    fn test_arrow_and_index() {
        let mut inner = rill_core::ValueMap::new();
        inner.insert(
            "list".into(),
            Value::Array(vec![1.into(), 2.into(), 3.into(), 4.into()]),
        );
        let t = demo(&[("obj", Value::Map(inner)), ("s", "x".into())]);
        let list = Expr::binary(BinOp::Arrow, Expr::field("obj"), Expr::field("list"));

        let idx = Expr::binary(BinOp::Subset, list.clone(), Expr::Index(-1));
        assert_eq!(eval_on(&idx, &t), Ok(Value::Int(4)));

        let slice = Expr::binary(
            BinOp::Subset,
            list.clone(),
            Expr::Colon {
                start: 1,
                end: Some(-1),
            },
        );
        assert_eq!(
            eval_on(&slice, &t),
            Ok(Value::Array(vec![2.into(), 3.into(), 4.into()]))
        );

        let out = Expr::binary(BinOp::Subset, list.clone(), Expr::Index(4));
        assert_eq!(eval_on(&out, &t).unwrap_err().to_string(), "out of index: 4 of 4");

        let backwards = Expr::binary(
            BinOp::Subset,
            list,
            Expr::Colon {
                start: 3,
                end: Some(1),
            },
        );
        assert_eq!(
            eval_on(&backwards, &t).unwrap_err().to_string(),
            "start cannot be greater than end. start:3  end:1"
        );

        let not_array = Expr::binary(BinOp::Subset, Expr::field("s"), Expr::Index(0));
        assert_eq!(
            eval_on(&not_array, &t).unwrap_err().to_string(),
            "[] is an invalid operation for string"
        );

        let missing = Expr::binary(BinOp::Arrow, Expr::field("obj"), Expr::field("x"));
        assert_eq!(eval_on(&missing, &t), Ok(Value::Null));

        let null_obj = Expr::binary(BinOp::Arrow, Expr::field("nothing"), Expr::field("x"));
        assert_eq!(eval_on(&null_obj, &t), Ok(Value::Null));

        let not_map = Expr::binary(BinOp::Arrow, Expr::field("s"), Expr::field("x"));
        assert_eq!(
            eval_on(&not_map, &t).unwrap_err().to_string(),
            "the result string(x) is not a type of map"
        );
    }

    #[test]
    fn test_case_expression() {
        let t = demo(&[("size", 5.into())]);
        let case = Expr::Case(CaseExpr {
            value: None,
            when_clauses: vec![WhenClause {
                expr: Expr::binary(BinOp::Gt, Expr::field("size"), Expr::Integer(3)),
                result: Expr::Str("big".into()),
            }],
            else_clause: Some(Box::new(Expr::Str("small".into()))),
        });
        assert_eq!(eval_on(&case, &t), Ok(Value::Str("big".into())));

        let non_bool_when = Expr::Case(CaseExpr {
            value: None,
            when_clauses: vec![
                WhenClause {
                    expr: Expr::field("size"),
                    result: Expr::Str("size".into()),
                },
                WhenClause {
                    expr: Expr::Str("true".into()),
                    result: Expr::Str("text".into()),
                },
            ],
            else_clause: Some(Box::new(Expr::Str("none".into()))),
        });
        assert_eq!(eval_on(&non_bool_when, &t), Ok(Value::Str("none".into())));

        let bad = Expr::Case(CaseExpr {
            value: Some(Box::new(Expr::field("size"))),
            when_clauses: vec![WhenClause {
                expr: Expr::Str("5".into()),
                result: Expr::Integer(1),
            }],
            else_clause: None,
        });
        assert_eq!(
            eval_on(&bad, &t).unwrap_err().to_string(),
            "evaluate case expression error: invalid operation int64(5) = string(5)"
        );
    }

    #[test]
    fn test_aggregate_call_over_group() {
        let group = GroupedTuples {
            content: vec![
                Row::Tuple(demo(&[("size", 3.into())])),
                Row::Tuple(demo(&[("size", 5.into())])),
            ],
            range: Some(WindowRange::new(1000, 2000)),
        };
        let v = MultiValuer::new(vec![&group, &FUNCTIONS, &AGGREGATE_FUNCTIONS]);
        let avg = Expr::call("avg", vec![Expr::field("size")]);
        assert_eq!(eval(&avg, &v), Ok(Value::Int(4)));
        let end = Expr::call("window_end", vec![]);
        assert_eq!(eval(&end, &v), Ok(Value::Int(2000)));
    }

    #[test]
    fn test_function_errors_are_wrapped() {
        let t = demo(&[]);
        let e = Expr::call("nosuch", vec![]);
        assert_eq!(
            eval_on(&e, &t).unwrap_err().to_string(),
            "call func nosuch error: function not found"
        );
    }
}
