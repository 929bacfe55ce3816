// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Raw request parameters → structured conditions.
//!
//! Operators reach the engine in three encodings, because URL query strings
//! cannot carry them uniformly:
//!
//! ```text
//! ?limit=10                 → limit
//! ?age>=18                  → key "age>" value "18"    → age >= 18   (trailing symbol)
//! ?age_GT_18                → key "age_GT_18" value "" → age > 18    (embedded token)
//! ?deleted_at_IS_NULL_      → key with empty value     → deleted_at IS NULL
//! ?id=1&id=2                → id = 1 OR id = 2
//! ```

use crate::error::{EngineError, Result};

use super::QueryInfo;

/// Ordered raw parameters: name → values, as the HTTP layer decoded them.
pub type QueryParams = Vec<(String, Vec<String>)>;

/// Embedded operator tokens and the SQL operator each stands for.
///
/// Order is significant: the first token (in this order) found in the key
/// wins, and several tokens contain others (`_IS_NOT_NULL_` / `_IS_NULL_`,
/// `>=` / `>`).
pub const OPERATOR_TOKENS: [(&str, &str); 22] = [
    ("_IS_NOT_NULL_", "IS NOT NULL"),
    ("_IS_NULL_", "IS NULL"),
    ("_IS_NOT_FALSE_", "IS NOT FALSE"),
    ("_IS_NOT_TRUE_", "IS NOT TRUE"),
    ("_IS_TRUE_", "IS TRUE"),
    ("_IS_FALSE_", "IS FALSE"),
    ("_NOT_LIKE_", "NOT LIKE"),
    ("_LIKE_", "LIKE"),
    ("_NOT_REGEXP_", "NOT REGEXP"),
    ("_REGEXP_", "REGEXP"),
    ("_GT_", ">"),
    ("_GE_", ">="),
    ("_LT_", "<"),
    ("_LE_", "<="),
    ("_EQ_", "="),
    ("_NE_", "!="),
    (">=", ">="),
    ("<=", "<="),
    ("<>", "<>"),
    (">", ">"),
    ("<", "<"),
    ("=", "="),
];

/// Parse every parameter into `query`'s conditions and limit.
pub fn parse_conditions(query: &mut QueryInfo, params: &QueryParams) -> Result<()> {
    for (key, values) in params {
        if key.eq_ignore_ascii_case("limit") {
            let raw = values.first().map(String::as_str).unwrap_or("");
            let limit = raw
                .trim()
                .parse::<u32>()
                .map_err(|_| EngineError::bad_request(format!("invalid limit '{}'", raw)))?;
            query.limit = Some(limit);
            continue;
        }

        let (column, operator, values) = split_operator(key, values);
        if !is_identifier(&column) {
            return Err(EngineError::bad_request(format!(
                "invalid column name '{}'",
                column
            )));
        }
        query.add_condition(&column, &operator, values);
    }
    Ok(())
}

/// Split one parameter into `(column, operator, values)`.
fn split_operator(key: &str, values: &[String]) -> (String, String, Vec<String>) {
    let values: Vec<String> = if values.is_empty() {
        vec![String::new()]
    } else {
        values.to_vec()
    };

    if let Some(last) = key.chars().last() {
        if matches!(last, '!' | '>' | '<') {
            let column = &key[..key.len() - last.len_utf8()];
            return (column.to_string(), format!("{}=", last), values);
        }
    }

    if values.len() == 1 && values[0].is_empty() {
        for (token, operator) in OPERATOR_TOKENS {
            if let Some(pos) = key.find(token) {
                let column = &key[..pos];
                let mut value = &key[pos + token.len()..];
                if !token.ends_with('_') {
                    value = value.strip_prefix('_').unwrap_or(value);
                }
                return (column.to_string(), operator.to_string(), vec![value.to_string()]);
            }
        }
    }

    (key.to_string(), "=".to_string(), values)
}

/// Column names are spliced into SQL, so only plain identifiers pass.
fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}
