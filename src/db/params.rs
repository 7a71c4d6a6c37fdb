//! Parameter binding utilities for database queries.
//!
//! `bind_params` attaches `QueryParam` values to a PostgreSQL query in order.
//! `expand_named` rewrites `:name` placeholders into positional `$n` ones so
//! the same binding path serves named-parameter statements.

use crate::error::{DbError, DbResult};
use crate::models::QueryParam;
use sqlx::postgres::PgArguments;
use sqlx::query::{Query, QueryAs};
use sqlx::types::Json;
use sqlx::Postgres;
use std::collections::HashMap;

/// Bind a parameter to a PostgreSQL query.
pub(crate) fn bind_param<'q>(
    query: Query<'q, Postgres, PgArguments>,
    param: &'q QueryParam,
) -> Query<'q, Postgres, PgArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        QueryParam::Timestamp(v) => query.bind(*v),
        QueryParam::Json(v) => query.bind(Json(v)),
    }
}

/// Bind a parameter to a PostgreSQL `query_as`.
pub(crate) fn bind_param_as<'q, O>(
    query: QueryAs<'q, Postgres, O, PgArguments>,
    param: &'q QueryParam,
) -> QueryAs<'q, Postgres, O, PgArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        QueryParam::Timestamp(v) => query.bind(*v),
        QueryParam::Json(v) => query.bind(Json(v)),
    }
}

/// Bind every parameter in order.
pub fn bind_params<'q>(
    query: Query<'q, Postgres, PgArguments>,
    params: &'q [QueryParam],
) -> Query<'q, Postgres, PgArguments> {
    params.iter().fold(query, bind_param)
}

/// Bind every parameter in order to a `query_as`.
pub fn bind_params_as<'q, O>(
    query: QueryAs<'q, Postgres, O, PgArguments>,
    params: &'q [QueryParam],
) -> QueryAs<'q, Postgres, O, PgArguments> {
    params.iter().fold(query, bind_param_as)
}

/// Rewrite `:name` placeholders to `$n` and collect the matching values.
///
/// A name used more than once maps to a single position. `::type` casts and
/// text inside single quotes are left alone. A placeholder without a value
/// in `params` is a validation error.
pub fn expand_named(
    sql: &str,
    params: &HashMap<String, QueryParam>,
) -> DbResult<(String, Vec<QueryParam>)> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut names: Vec<String> = Vec::new();
    let mut values = Vec::new();
    let mut in_quote = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '\'' {
            in_quote = !in_quote;
            out.push(c);
            i += 1;
            continue;
        }
        if in_quote || c != ':' {
            out.push(c);
            i += 1;
            continue;
        }

        // `::` is a cast, not a placeholder.
        if chars.get(i + 1) == Some(&':') {
            out.push_str("::");
            i += 2;
            continue;
        }

        let start = i + 1;
        let mut end = start;
        while end < chars.len()
            && (chars[end].is_ascii_alphanumeric() || chars[end] == '_')
            && !(end == start && chars[end].is_ascii_digit())
        {
            end += 1;
        }
        if end == start {
            out.push(c);
            i += 1;
            continue;
        }

        let name: String = chars[start..end].iter().collect();
        let position = match names.iter().position(|n| *n == name) {
            Some(pos) => pos + 1,
            None => {
                let value = params.get(&name).ok_or_else(|| {
                    DbError::validation(format!("missing value for named parameter ':{name}'"))
                        .with_context("parameter", name.clone())
                })?;
                values.push(value.clone());
                names.push(name);
                names.len()
            }
        };
        out.push('$');
        out.push_str(&position.to_string());
        i = end;
    }

    Ok((out, values))
}
