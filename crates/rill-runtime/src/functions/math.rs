//! Math functions

use super::{arg, FuncResult};
use rill_core::Value;

const NUMBER_ONLY: &str = "only float64 & int type are supported";

fn to_f64(v: &Value) -> Result<f64, String> {
    match v {
        Value::Float(f) => Ok(*f),
        Value::Int(n) => Ok(*n as f64),
        _ => Err(NUMBER_ONLY.to_string()),
    }
}

fn unary(args: &[Value], f: fn(f64) -> f64) -> FuncResult {
    to_f64(arg(args, 0)).map(|v| Value::Float(f(v)))
}

fn int_pair(args: &[Value]) -> Result<(i64, i64), String> {
    match (arg(args, 0), arg(args, 1)) {
        (Value::Int(a), Value::Int(b)) => Ok((*a, *b)),
        _ => Err("Expect int type for both operands.".to_string()),
    }
}

pub(super) fn call(name: &str, args: &[Value]) -> FuncResult {
    match name {
        "abs" => match arg(args, 0) {
            Value::Int(n) => Ok(Value::Int(n.wrapping_abs())),
            Value::Float(f) => Ok(Value::Float(f.abs())),
            _ => Err(NUMBER_ONLY.to_string()),
        },
        "acos" => unary(args, f64::acos),
        "asin" => unary(args, f64::asin),
        "atan" => unary(args, f64::atan),
        "atan2" => {
            let y = to_f64(arg(args, 0))?;
            let x = to_f64(arg(args, 1))?;
            Ok(Value::Float(y.atan2(x)))
        }
        "bitand" => int_pair(args).map(|(a, b)| Value::Int(a & b)),
        "bitor" => int_pair(args).map(|(a, b)| Value::Int(a | b)),
        "bitxor" => int_pair(args).map(|(a, b)| Value::Int(a ^ b)),
        "bitnot" => match arg(args, 0) {
            Value::Int(n) => Ok(Value::Int(!n)),
            _ => Err("Expect int type for operand.".to_string()),
        },
        "ceil" => unary(args, f64::ceil),
        "cos" => unary(args, f64::cos),
        "cosh" => unary(args, f64::cosh),
        "exp" => unary(args, f64::exp),
        "ln" => unary(args, f64::ln),
        "log" => unary(args, f64::log10),
        // Unlike the `%` operator, a zero divisor yields zero here.
        "mod" => match (arg(args, 0), arg(args, 1)) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(if *b == 0 { 0 } else { a % b })),
            (a, b) => {
                let a = to_f64(a)?;
                let b = to_f64(b)?;
                Ok(Value::Float(if b == 0.0 { 0.0 } else { a % b }))
            }
        },
        "power" => {
            let base = to_f64(arg(args, 0))?;
            let exp = to_f64(arg(args, 1))?;
            Ok(Value::Float(base.powf(exp)))
        }
        "rand" => Ok(Value::Float(rand::random::<f64>())),
        "round" => unary(args, f64::round),
        "sign" => {
            let v = to_f64(arg(args, 0))?;
            Ok(Value::Int(if v > 0.0 {
                1
            } else if v < 0.0 {
                -1
            } else {
                0
            }))
        }
        "sin" => unary(args, f64::sin),
        "sinh" => unary(args, f64::sinh),
        "sqrt" => unary(args, f64::sqrt),
        "tan" => unary(args, f64::tan),
        "tanh" => unary(args, f64::tanh),
        _ => Err(format!("unknown math function name {}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abs_keeps_type() {
        assert_eq!(call("abs", &[Value::Int(-3)]), Ok(Value::Int(3)));
        assert_eq!(
            call("abs", &["x".into()]),
            Err("only float64 & int type are supported".to_string())
        );
    }

    #[test]
    fn test_mod_by_zero_is_zero() {
        assert_eq!(call("mod", &[Value::Int(7), Value::Int(0)]), Ok(Value::Int(0)));
        assert_eq!(call("mod", &[Value::Int(7), Value::Int(4)]), Ok(Value::Int(3)));
        assert_eq!(
            call("mod", &[Value::Float(7.5), Value::Int(2)]),
            Ok(Value::Float(1.5))
        );
    }

    #[test]
    fn test_bit_functions() {
        assert_eq!(call("bitand", &[Value::Int(12), Value::Int(10)]), Ok(Value::Int(8)));
        assert_eq!(call("bitnot", &[Value::Int(0)]), Ok(Value::Int(-1)));
        assert!(call("bitor", &[Value::Float(1.0), Value::Int(1)]).is_err());
    }

    #[test]
    fn test_rounding_and_sign() {
        assert_eq!(call("round", &[Value::Float(2.5)]), Ok(Value::Float(3.0)));
        assert_eq!(call("ceil", &[Value::Float(2.1)]), Ok(Value::Float(3.0)));
        assert_eq!(call("sign", &[Value::Float(-0.1)]), Ok(Value::Int(-1)));
        assert_eq!(call("power", &[Value::Int(2), Value::Int(10)]), Ok(Value::Float(1024.0)));
    }

    #[test]
    fn test_rand_in_unit_interval() {
        match call("rand", &[]) {
            Ok(Value::Float(f)) => assert!((0.0..1.0).contains(&f)),
            other => panic!("unexpected {:?}", other),
        }
    }
}
