// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Clause builder
//!
//! Translates a [`QueryInfo`] into a parameterized SQL WHERE clause (without
//! the `WHERE` keyword) using `?` placeholders.
//!
//! # SQL Generated
//!
//! ```sql
//! (id = ? OR id = ? OR id = ?)            -- one column, several equal values
//! (age > ? AND age < ?) AND name LIKE ?   -- several operators on one column
//! deleted_at IS NULL                      -- unary operator, no parameter
//! ```

use serde_json::{Number, Value};

use super::QueryInfo;

/// Operators that take no right-hand side.
pub const UNARY_OPERATORS: [&str; 6] = [
    "IS NOT NULL",
    "IS NULL",
    "IS NOT FALSE",
    "IS NOT TRUE",
    "IS TRUE",
    "IS FALSE",
];

pub fn is_unary_operator(operator: &str) -> bool {
    UNARY_OPERATORS.contains(&operator)
}

/// Build the clause, appending bound values to `params` in placeholder order.
///
/// Empty values are replaced by `default` (normally the record's own id).
pub fn build_clause(query: &QueryInfo, params: &mut Vec<Value>, default: &Value) -> String {
    let columns: Vec<String> = query
        .conditions()
        .map(|(column, condition)| {
            let groups: Vec<String> = condition
                .groups()
                .map(|(op, values)| translate_group(column, op, values, params, default))
                .collect();
            if groups.len() > 1 {
                format!("({})", groups.join(" AND "))
            } else {
                groups.concat()
            }
        })
        .collect();
    columns.join(" AND ")
}

fn translate_group(
    column: &str,
    operator: &str,
    values: &[String],
    params: &mut Vec<Value>,
    default: &Value,
) -> String {
    if is_unary_operator(operator) {
        return format!("{} {}", column, operator);
    }

    let exprs: Vec<String> = if values.is_empty() {
        params.push(default.clone());
        vec![format!("{} {} ?", column, operator)]
    } else {
        values
            .iter()
            .map(|value| {
                if value.is_empty() {
                    params.push(default.clone());
                } else {
                    params.push(coerce_param(value));
                }
                format!("{} {} ?", column, operator)
            })
            .collect()
    };

    if exprs.len() == 1 {
        return exprs.concat();
    }
    let joiner = if operator == "=" { " OR " } else { " AND " };
    format!("({})", exprs.join(joiner))
}

/// Bind canonical numbers as numbers, everything else as text.
///
/// Only strings that print back identically are converted, so `"007"` or
/// `"1e3"` stay text.
pub fn coerce_param(raw: &str) -> Value {
    if let Ok(n) = raw.parse::<i64>() {
        if n.to_string() == raw {
            return Value::Number(n.into());
        }
    }
    if let Ok(f) = raw.parse::<f64>() {
        if f.is_finite() && f.to_string() == raw {
            if let Some(n) = Number::from_f64(f) {
                return Value::Number(n);
            }
        }
    }
    Value::String(raw.to_string())
}
