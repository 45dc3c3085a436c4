//! Property-based tests for the SQL parser.
//!
//! Verifies that the parser never panics on arbitrary input and that
//! plausible rule queries always parse.

use proptest::prelude::*;

/// Strategy that generates random strings of ASCII characters.
fn arbitrary_source() -> impl Strategy<Value = String> {
    prop::collection::vec(prop::char::range('\x00', '\x7f'), 0..512)
        .prop_map(|chars| chars.into_iter().collect::<String>())
}

/// Random strings built from SQL tokens, which reach deeper parser states.
fn token_soup() -> impl Strategy<Value = String> {
    let token = prop_oneof![
        Just("SELECT"),
        Just("FROM"),
        Just("WHERE"),
        Just("GROUP BY"),
        Just("CASE"),
        Just("WHEN"),
        Just("END"),
        Just("("),
        Just(")"),
        Just("["),
        Just("]"),
        Just(":"),
        Just("->"),
        Just(","),
        Just("*"),
        Just("-"),
        Just("a"),
        Just("1"),
        Just("\"s\""),
        Just("tumblingwindow"),
    ];
    prop::collection::vec(token, 0..64).prop_map(|t| t.join(" "))
}

/// Strategy that generates syntactically plausible SELECT statements.
fn plausible_select() -> impl Strategy<Value = String> {
    let stream_name = "s_[a-z0-9]{1,8}";
    let field_name = "f_[a-z0-9_]{1,8}";
    let condition = prop_oneof![
        Just("".to_string()),
        Just(" WHERE f_a > 0".to_string()),
        Just(" WHERE f_b = \"red\" AND f_c <= 3.5".to_string()),
        Just(" WHERE NOT (f_a % 2 = 0)".to_string()),
    ];
    let window = prop_oneof![
        Just("".to_string()),
        Just(" GROUP BY TUMBLINGWINDOW(ss, 10)".to_string()),
        Just(" GROUP BY f_k, HOPPINGWINDOW(mi, 5, 1)".to_string()),
        Just(" GROUP BY COUNTWINDOW(4)".to_string()),
    ];
    let projection = prop_oneof![
        Just("*".to_string()),
        Just("f_a * 2 AS doubled".to_string()),
        Just("lower(f_b), f_arr[1:3]".to_string()),
        Just("f_obj->val AS v".to_string()),
    ];

    (stream_name, field_name, projection, condition, window).prop_map(
        |(sname, fname, proj, cond, win)| {
            format!("SELECT {}, {} FROM {}{}{}", fname, proj, sname, cond, win)
        },
    )
}

proptest! {
    /// The parser must never panic on arbitrary input.
    #[test]
    fn parser_never_panics(source in arbitrary_source()) {
        let _ = rill_parser::parse(&source);
    }

    #[test]
    fn parser_never_panics_on_token_soup(source in token_soup()) {
        let _ = rill_parser::parse(&source);
    }

    /// Plausible SELECT statements should parse successfully.
    #[test]
    fn plausible_select_parses(source in plausible_select()) {
        let result = rill_parser::parse_select(&source);
        prop_assert!(
            result.is_ok(),
            "Expected plausible SQL to parse successfully, got error on input:\n{}\nError: {:?}",
            source,
            result.err()
        );
    }

    /// Integer literals survive lexing and parsing.
    #[test]
    fn integer_literals_preserved(n in 0i64..1_000_000) {
        let sql = format!("SELECT f_a FROM s_demo WHERE f_a = {}", n);
        let stmt = rill_parser::parse_select(&sql).unwrap();
        let rendered = stmt.condition.map(|c| c.to_string());
        prop_assert_eq!(rendered, Some(format!("f_a = {}", n)));
    }
}
