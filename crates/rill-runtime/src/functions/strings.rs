//! String functions

use super::{arg, to_int, to_string_always, FuncResult};
use regex::Regex;
use rill_core::Value;

fn substring(s: &str, start: i64, end: Option<i64>) -> FuncResult {
    if start < 0 {
        return Err("start index must be a positive number".to_string());
    }
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len() as i64;
    let end = match end {
        Some(e) if e < 0 => return Err("end index must be a positive number".to_string()),
        Some(e) if start > e => {
            return Err("start index must be smaller than end index".to_string())
        }
        Some(e) => e.min(len),
        None => len,
    };
    if start > len {
        return Ok(Value::Str(String::new()));
    }
    Ok(Value::Str(chars[start as usize..end as usize].iter().collect()))
}

pub(super) fn call(name: &str, args: &[Value]) -> FuncResult {
    let a0 = arg(args, 0);
    let a1 = arg(args, 1);
    match name {
        "concat" => Ok(Value::Str(args.iter().map(to_string_always).collect())),
        "endswith" => {
            if a0.is_null() || a1.is_null() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(
                to_string_always(a0).ends_with(&to_string_always(a1)),
            ))
        }
        "indexof" => {
            if a0.is_null() || a1.is_null() {
                return Ok(Value::Int(-1));
            }
            let hay = to_string_always(a0);
            let idx = hay
                .find(&to_string_always(a1))
                .map(|i| i as i64)
                .unwrap_or(-1);
            Ok(Value::Int(idx))
        }
        "length" => Ok(Value::Int(to_string_always(a0).chars().count() as i64)),
        "lower" => Ok(map_str(a0, |s| s.to_lowercase())),
        "upper" => Ok(map_str(a0, |s| s.to_uppercase())),
        "trim" => Ok(map_str(a0, |s| s.trim().to_string())),
        "ltrim" => Ok(map_str(a0, |s| s.trim_start().to_string())),
        "rtrim" => Ok(map_str(a0, |s| s.trim_end().to_string())),
        "lpad" | "rpad" => {
            if a0.is_null() {
                return Ok(Value::Null);
            }
            let n = to_int(a1)?.max(0) as usize;
            let s = to_string_always(a0);
            let pad = " ".repeat(n);
            Ok(Value::Str(if name == "lpad" {
                pad + &s
            } else {
                s + &pad
            }))
        }
        "numbytes" => Ok(Value::Int(to_string_always(a0).len() as i64)),
        "regexp_matches" => {
            if a0.is_null() || a1.is_null() {
                return Ok(Value::Bool(false));
            }
            let re = Regex::new(&to_string_always(a1)).map_err(|e| e.to_string())?;
            Ok(Value::Bool(re.is_match(&to_string_always(a0))))
        }
        "regexp_replace" => {
            let a2 = arg(args, 2);
            if a0.is_null() || a1.is_null() || a2.is_null() {
                return Ok(Value::Null);
            }
            let re = Regex::new(&to_string_always(a1)).map_err(|e| e.to_string())?;
            let haystack = to_string_always(a0);
            let replaced = re.replace_all(&haystack, to_string_always(a2).as_str());
            Ok(Value::Str(replaced.into_owned()))
        }
        "startswith" => {
            if a0.is_null() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(
                to_string_always(a0).starts_with(&to_string_always(a1)),
            ))
        }
        "split_value" => {
            if a0.is_null() || a1.is_null() {
                return Ok(Value::Null);
            }
            let s = to_string_always(a0);
            let sep = to_string_always(a1);
            let parts: Vec<&str> = s.split(sep.as_str()).collect();
            let idx = to_int(arg(args, 2))?;
            if idx < 0 || idx as usize >= parts.len() {
                return Err(format!(
                    "{} out of index array (size = {})",
                    idx,
                    parts.len()
                ));
            }
            Ok(Value::Str(parts[idx as usize].to_string()))
        }
        "substring" => {
            if a0.is_null() {
                return Ok(Value::Null);
            }
            let start = to_int(a1)?;
            let end = match args.get(2) {
                Some(v) => Some(to_int(v)?),
                None => None,
            };
            substring(&to_string_always(a0), start, end)
        }
        _ => Err(format!("unknown string function name {}", name)),
    }
}

fn map_str(v: &Value, f: impl Fn(&str) -> String) -> Value {
    match v {
        Value::Null => Value::Null,
        v => Value::Str(f(&to_string_always(v))),
    }
}
