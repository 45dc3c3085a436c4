//! Static registries of builtin scalar and aggregate functions.

/// Function family, used to route validation and evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncType {
    Math,
    Str,
    Conv,
    Hash,
    Other,
    DateTime,
    /// Scalar calls that keep state across records, see `is_analytic_function`.
    Analytic,
    Agg,
}

pub static MATH_FUNCTIONS: &[&str] = &[
    "abs", "acos", "asin", "atan", "atan2", "bitand", "bitor", "bitxor", "bitnot", "ceil", "cos",
    "cosh", "exp", "ln", "log", "mod", "power", "rand", "round", "sign", "sin", "sinh", "sqrt",
    "tan", "tanh",
];

pub static STRING_FUNCTIONS: &[&str] = &[
    "concat",
    "endswith",
    "indexof",
    "length",
    "lower",
    "lpad",
    "ltrim",
    "numbytes",
    "regexp_matches",
    "regexp_replace",
    "rpad",
    "rtrim",
    "startswith",
    "split_value",
    "substring",
    "trim",
    "upper",
];

pub static CONVERSION_FUNCTIONS: &[&str] = &["cast", "chr", "encode", "trunc"];

pub static HASH_FUNCTIONS: &[&str] = &["sha224", "sha256", "sha384", "sha512"];

pub static OTHER_FUNCTIONS: &[&str] = &["isnull", "nanvl", "newuuid", "window_start", "window_end"];

pub static DATETIME_FUNCTIONS: &[&str] = &[
    "now",
    "current_timestamp",
    "local_time",
    "local_timestamp",
    "cur_date",
    "current_date",
    "cur_time",
    "current_time",
    "format_time",
    "date_calc",
    "date_diff",
    "day_name",
    "day_of_month",
    "day",
    "day_of_week",
    "day_of_year",
    "from_days",
    "from_unix_time",
    "hour",
    "last_day",
    "microsecond",
    "minute",
    "month",
    "month_name",
    "second",
];

/// Functions that remember earlier records. Each call site owns its state.
pub static ANALYTIC_FUNCTIONS: &[&str] = &["changed_col", "had_changed", "lag", "latest"];

/// Aggregate functions; each argument is evaluated over the whole group.
pub static AGGREGATE_FUNCTIONS: &[&str] =
    &["avg", "count", "max", "min", "sum", "collect", "deduplicate"];

/// Accepted target types of `cast`.
pub static CAST_TYPES: &[&str] = &["bigint", "float", "string", "boolean", "datetime"];

/// Classify a function name, case-insensitively.
pub fn func_type(name: &str) -> Option<FuncType> {
    let lower = name.to_ascii_lowercase();
    let name = lower.as_str();
    if AGGREGATE_FUNCTIONS.contains(&name) {
        Some(FuncType::Agg)
    } else if MATH_FUNCTIONS.contains(&name) {
        Some(FuncType::Math)
    } else if STRING_FUNCTIONS.contains(&name) {
        Some(FuncType::Str)
    } else if CONVERSION_FUNCTIONS.contains(&name) {
        Some(FuncType::Conv)
    } else if HASH_FUNCTIONS.contains(&name) {
        Some(FuncType::Hash)
    } else if OTHER_FUNCTIONS.contains(&name) {
        Some(FuncType::Other)
    } else if DATETIME_FUNCTIONS.contains(&name) {
        Some(FuncType::DateTime)
    } else if ANALYTIC_FUNCTIONS.contains(&name) {
        Some(FuncType::Analytic)
    } else {
        None
    }
}

pub fn is_aggregate_function(name: &str) -> bool {
    func_type(name) == Some(FuncType::Agg)
}

pub fn is_analytic_function(name: &str) -> bool {
    func_type(name) == Some(FuncType::Analytic)
}

/// Every known function name, for suggestions.
pub fn all_functions() -> impl Iterator<Item = &'static str> {
    MATH_FUNCTIONS
        .iter()
        .chain(STRING_FUNCTIONS)
        .chain(CONVERSION_FUNCTIONS)
        .chain(HASH_FUNCTIONS)
        .chain(OTHER_FUNCTIONS)
        .chain(DATETIME_FUNCTIONS)
        .chain(ANALYTIC_FUNCTIONS)
        .chain(AGGREGATE_FUNCTIONS)
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_func_type_is_case_insensitive() {
        assert_eq!(func_type("AVG"), Some(FuncType::Agg));
        assert_eq!(func_type("Lower"), Some(FuncType::Str));
        assert_eq!(func_type("sha256"), Some(FuncType::Hash));
        assert_eq!(func_type("Format_Time"), Some(FuncType::DateTime));
        assert!(is_analytic_function("LAG"));
        assert!(!is_analytic_function("lower"));
        assert_eq!(func_type("nope"), None);
    }

    #[test]
    fn test_no_name_registered_twice() {
        let mut names: Vec<_> = all_functions().collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }
}
