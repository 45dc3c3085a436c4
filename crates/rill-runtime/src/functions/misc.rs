//! Conversion, hash and other scalar functions

use super::{arg, to_string_always, FuncResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rill_core::Value;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

const UNSUPPORTED: &str = "Not supported type conversion.";

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn cast(v: &Value, to: &str) -> FuncResult {
    match to {
        "bigint" => match v {
            Value::Int(n) => Ok(Value::Int(*n)),
            Value::Float(f) => Ok(Value::Int(*f as i64)),
            Value::Str(s) => s
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| format!("strconv.Atoi: parsing {:?}: invalid syntax", s)),
            Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
            _ => Err(UNSUPPORTED.to_string()),
        },
        "float" => match v {
            Value::Int(n) => Ok(Value::Float(*n as f64)),
            Value::Float(f) => Ok(Value::Float(*f)),
            Value::Str(s) => s
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| format!("strconv.ParseFloat: parsing {:?}: invalid syntax", s)),
            Value::Bool(b) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
            _ => Err(UNSUPPORTED.to_string()),
        },
        "string" => match v {
            Value::Int(_) | Value::Float(_) | Value::Str(_) | Value::Bool(_) => {
                Ok(Value::Str(v.to_string()))
            }
            Value::Time(t) => Ok(Value::Str(t.to_rfc3339())),
            _ => Err(UNSUPPORTED.to_string()),
        },
        "boolean" => match v {
            Value::Int(n) => Ok(Value::Bool(*n != 0)),
            Value::Float(f) => Ok(Value::Bool(*f != 0.0)),
            Value::Str(s) => parse_bool(s)
                .map(Value::Bool)
                .ok_or_else(|| format!("strconv.ParseBool: parsing {:?}: invalid syntax", s)),
            Value::Bool(b) => Ok(Value::Bool(*b)),
            _ => Err(UNSUPPORTED.to_string()),
        },
        "datetime" => v
            .to_time()
            .map(Value::Time)
            .ok_or_else(|| UNSUPPORTED.to_string()),
        _ => Err("Unknow type, only support bigint, float, string, boolean and datetime.".to_string()),
    }
}

/// Round half away from zero to `precision` decimals.
fn to_fixed(num: f64, precision: i64) -> f64 {
    let output = 10f64.powi(precision as i32);
    let scaled = num * output;
    (scaled + 0.5f64.copysign(scaled)).trunc() / output
}

pub(super) fn conv_call(name: &str, args: &[Value]) -> FuncResult {
    match name {
        "cast" => match arg(args, 1) {
            Value::Str(to) => cast(arg(args, 0), &to.to_lowercase()),
            _ => Err("Expect string type for the 2nd parameter.".to_string()),
        },
        // Returns the code point, as the character type is numeric.
        "chr" => match arg(args, 0) {
            Value::Int(n) => Ok(Value::Int(*n as i32 as i64)),
            Value::Float(f) => Ok(Value::Int(*f as i64 as i32 as i64)),
            Value::Str(s) => {
                if s.len() > 1 {
                    return Err("Parameter length cannot larger than 1.".to_string());
                }
                Ok(s.chars()
                    .next()
                    .map(|c| Value::Int(c as i64))
                    .unwrap_or(Value::Null))
            }
            _ => Err(
                "Only bigint, float and string type can be convert to char type.".to_string(),
            ),
        },
        "encode" => match arg(args, 1) {
            Value::Str(enc) if enc.eq_ignore_ascii_case("base64") => match arg(args, 0) {
                Value::Str(s) => Ok(Value::Str(STANDARD.encode(s.as_bytes()))),
                _ => Err("Only string type can be encoded.".to_string()),
            },
            _ => Err("Only base64 encoding is supported.".to_string()),
        },
        "trunc" => {
            let num = match arg(args, 0) {
                Value::Int(n) => *n as f64,
                Value::Float(f) => *f,
                _ => return Err("Only int and float type can be truncated.".to_string()),
            };
            match arg(args, 1) {
                Value::Int(p) => Ok(Value::Float(to_fixed(num, *p))),
                _ => Err("The 2nd parameter must be int value.".to_string()),
            }
        }
        _ => Err(format!("Not supported function name {}", name)),
    }
}

fn hex_digest<D: Digest>(input: &str) -> String {
    D::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

pub(super) fn hash_call(name: &str, args: &[Value]) -> FuncResult {
    let input = to_string_always(arg(args, 0));
    let digest = match name {
        "sha224" => hex_digest::<Sha224>(&input),
        "sha256" => hex_digest::<Sha256>(&input),
        "sha384" => hex_digest::<Sha384>(&input),
        "sha512" => hex_digest::<Sha512>(&input),
        _ => return Err(format!("unknown hash function name {}", name)),
    };
    Ok(Value::Str(digest))
}

pub(super) fn other_call(name: &str, args: &[Value]) -> FuncResult {
    match name {
        "isnull" => Ok(Value::Bool(arg(args, 0).is_null())),
        "newuuid" => Ok(Value::Str(uuid::Uuid::new_v4().to_string())),
        "nanvl" => match arg(args, 0) {
            Value::Float(f) if f.is_nan() => Ok(arg(args, 1).clone()),
            v => Ok(v.clone()),
        },
        // Resolved by the evaluator when a window range is present.
        "window_start" | "window_end" => Ok(Value::Null),
        _ => Err(format!("unknown function name {}", name)),
    }
}
