//! Fluent SQL builder for PostgreSQL.
//!
//! Values never appear in the SQL text: every value becomes a `$n`
//! placeholder and is returned alongside the statement by
//! [`QueryBuilder::build`]. Placeholders are numbered in call order across
//! all clauses, so `where_eq` followed by `having` yields `$1` then `$2`
//! regardless of where the clauses land in the final statement.
//!
//! ```
//! use db_kit::db::QueryBuilder;
//!
//! let (sql, args) = QueryBuilder::select(["id", "name"])
//!     .from("users")
//!     .where_eq("active", true)
//!     .order_by_desc("created_at")
//!     .limit(10)
//!     .build();
//!
//! assert_eq!(
//!     sql,
//!     "SELECT id, name FROM users WHERE active = $1 ORDER BY created_at DESC LIMIT 10"
//! );
//! assert_eq!(args.len(), 1);
//! ```

use crate::models::QueryParam;
use sqlx::postgres::{PgArguments, Postgres};
use sqlx::query::Query;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Statement {
    Select,
    Insert,
    Update,
    Delete,
}

/// Builder for SELECT, INSERT, UPDATE and DELETE statements.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    statement: Option<Statement>,
    table: String,
    columns: Vec<String>,
    rows: Vec<String>,
    conditions: Vec<String>,
    assignments: Vec<String>,
    joins: Vec<String>,
    order_by: Vec<String>,
    group_by: Vec<String>,
    having: Vec<String>,
    limit: Option<u64>,
    offset: Option<u64>,
    conflict_columns: Vec<String>,
    conflict_action: Option<String>,
    args: Vec<QueryParam>,
    next_index: usize,
}

impl QueryBuilder {
    fn new(statement: Statement) -> Self {
        Self {
            statement: Some(statement),
            table: String::new(),
            columns: Vec::new(),
            rows: Vec::new(),
            conditions: Vec::new(),
            assignments: Vec::new(),
            joins: Vec::new(),
            order_by: Vec::new(),
            group_by: Vec::new(),
            having: Vec::new(),
            limit: None,
            offset: None,
            conflict_columns: Vec::new(),
            conflict_action: None,
            args: Vec::new(),
            next_index: 1,
        }
    }

    /// `SELECT <columns>`; no columns selects `*`.
    pub fn select<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut builder = Self::new(Statement::Select);
        builder.columns = columns.into_iter().map(Into::into).collect();
        builder
    }

    /// `INSERT INTO <table>`
    pub fn insert(table: impl Into<String>) -> Self {
        let mut builder = Self::new(Statement::Insert);
        builder.table = table.into();
        builder
    }

    /// `UPDATE <table>`
    pub fn update(table: impl Into<String>) -> Self {
        let mut builder = Self::new(Statement::Update);
        builder.table = table.into();
        builder
    }

    /// `DELETE FROM`; set the table with [`QueryBuilder::from`].
    pub fn delete() -> Self {
        Self::new(Statement::Delete)
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Alias of [`QueryBuilder::from`] that reads better for inserts.
    #[must_use]
    #[allow(clippy::wrong_self_convention, clippy::should_implement_trait)]
    pub fn into(self, table: impl Into<String>) -> Self {
        self.from(table)
    }

    /// Replace the column list.
    #[must_use]
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Append one row of INSERT values. Call repeatedly for multi-row inserts.
    #[must_use]
    pub fn values<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<QueryParam>,
    {
        let placeholders: Vec<String> = values.into_iter().map(|v| self.push_arg(v)).collect();
        self.rows.push(format!("({})", placeholders.join(", ")));
        self
    }

    /// `SET <column> = $n`
    #[must_use]
    pub fn set(mut self, column: impl Into<String>, value: impl Into<QueryParam>) -> Self {
        let placeholder = self.push_arg(value);
        self.assignments
            .push(format!("{} = {placeholder}", column.into()));
        self
    }

    /// [`QueryBuilder::set`] for each pair, in iteration order.
    #[must_use]
    pub fn set_all<I, K, V>(self, values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<QueryParam>,
    {
        values
            .into_iter()
            .fold(self, |builder, (column, value)| builder.set(column, value))
    }

    /// Raw condition with `?` placeholders, each rewritten to the next `$n`.
    ///
    /// Conditions are joined with `AND`.
    #[must_use]
    pub fn where_clause<I, V>(mut self, condition: &str, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<QueryParam>,
    {
        let condition = self.number_placeholders(condition, args);
        self.conditions.push(condition);
        self
    }

    #[must_use]
    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<QueryParam>) -> Self {
        let placeholder = self.push_arg(value);
        self.conditions
            .push(format!("{} = {placeholder}", column.into()));
        self
    }

    #[must_use]
    pub fn where_in<I, V>(mut self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<QueryParam>,
    {
        let placeholders: Vec<String> = values.into_iter().map(|v| self.push_arg(v)).collect();
        self.conditions
            .push(format!("{} IN ({})", column.into(), placeholders.join(", ")));
        self
    }

    #[must_use]
    pub fn where_null(mut self, column: impl Into<String>) -> Self {
        self.conditions.push(format!("{} IS NULL", column.into()));
        self
    }

    #[must_use]
    pub fn where_not_null(mut self, column: impl Into<String>) -> Self {
        self.conditions
            .push(format!("{} IS NOT NULL", column.into()));
        self
    }

    #[must_use]
    pub fn join(self, table: &str, on: &str) -> Self {
        self.push_join("JOIN", table, on)
    }

    #[must_use]
    pub fn left_join(self, table: &str, on: &str) -> Self {
        self.push_join("LEFT JOIN", table, on)
    }

    #[must_use]
    pub fn right_join(self, table: &str, on: &str) -> Self {
        self.push_join("RIGHT JOIN", table, on)
    }

    #[must_use]
    pub fn inner_join(self, table: &str, on: &str) -> Self {
        self.push_join("INNER JOIN", table, on)
    }

    /// `ORDER BY <column> <direction>`; the direction is upper-cased and
    /// defaults to `ASC`.
    #[must_use]
    pub fn order_by(mut self, column: impl Into<String>, direction: Option<&str>) -> Self {
        let direction = direction.map_or_else(|| "ASC".to_string(), str::to_uppercase);
        self.order_by
            .push(format!("{} {direction}", column.into()));
        self
    }

    #[must_use]
    pub fn order_by_desc(self, column: impl Into<String>) -> Self {
        self.order_by(column, Some("DESC"))
    }

    #[must_use]
    pub fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by
            .extend(columns.into_iter().map(Into::into));
        self
    }

    /// Raw HAVING condition, placeholders handled like
    /// [`QueryBuilder::where_clause`].
    #[must_use]
    pub fn having<I, V>(mut self, condition: &str, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<QueryParam>,
    {
        let condition = self.number_placeholders(condition, args);
        self.having.push(condition);
        self
    }

    #[must_use]
    pub fn limit(mut self, count: u64) -> Self {
        self.limit = Some(count);
        self
    }

    #[must_use]
    pub fn offset(mut self, count: u64) -> Self {
        self.offset = Some(count);
        self
    }

    /// `ON CONFLICT (<columns>)`; pair with [`QueryBuilder::do_nothing`] or
    /// [`QueryBuilder::do_update`].
    #[must_use]
    pub fn on_conflict<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conflict_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn do_nothing(mut self) -> Self {
        self.conflict_action = Some("DO NOTHING".to_string());
        self
    }

    /// `DO UPDATE SET <column> = $n, ...` in iteration order.
    #[must_use]
    pub fn do_update<I, K, V>(mut self, updates: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<QueryParam>,
    {
        let assignments: Vec<String> = updates
            .into_iter()
            .map(|(column, value)| {
                let placeholder = self.push_arg(value);
                format!("{} = {placeholder}", column.into())
            })
            .collect();
        self.conflict_action = Some(format!("DO UPDATE SET {}", assignments.join(", ")));
        self
    }

    /// Clear every clause and argument, including the statement kind.
    ///
    /// A reset builder builds an empty statement.
    pub fn reset(&mut self) -> &mut Self {
        *self = Self::new(Statement::Select);
        self.statement = None;
        self
    }

    /// Arguments collected so far, in placeholder order.
    pub fn args(&self) -> &[QueryParam] {
        &self.args
    }

    /// Final SQL and its arguments.
    pub fn build(&self) -> (String, Vec<QueryParam>) {
        let sql = match self.statement {
            Some(Statement::Select) => self.build_select(),
            Some(Statement::Insert) => self.build_insert(),
            Some(Statement::Update) => self.build_update(),
            Some(Statement::Delete) => self.build_delete(),
            None => return (String::new(), Vec::new()),
        };
        (sql, self.args.clone())
    }

    /// Bind built arguments onto `sqlx::query(sql)`.
    ///
    /// `sql` and `args` are the pair returned by [`QueryBuilder::build`].
    pub fn bind<'q>(sql: &'q str, args: &'q [QueryParam]) -> Query<'q, Postgres, PgArguments> {
        super::params::bind_params(sqlx::query(sql), args)
    }

    fn push_arg(&mut self, value: impl Into<QueryParam>) -> String {
        let placeholder = format!("${}", self.next_index);
        self.next_index += 1;
        self.args.push(value.into());
        placeholder
    }

    /// Replace successive `?` with `$n`, one per argument. Extra arguments
    /// still consume a position.
    fn number_placeholders<I, V>(&mut self, condition: &str, args: I) -> String
    where
        I: IntoIterator<Item = V>,
        V: Into<QueryParam>,
    {
        let mut rest = condition;
        let mut out = String::with_capacity(condition.len() + 8);

        for value in args {
            let placeholder = self.push_arg(value);
            if let Some(pos) = rest.find('?') {
                out.push_str(&rest[..pos]);
                out.push_str(&placeholder);
                rest = &rest[pos + 1..];
            }
        }
        out.push_str(rest);
        out
    }

    fn push_join(mut self, kind: &str, table: &str, on: &str) -> Self {
        self.joins.push(format!("{kind} {table} ON {on}"));
        self
    }

    fn push_where(&self, parts: &mut Vec<String>) {
        if !self.conditions.is_empty() {
            parts.push(format!("WHERE {}", self.conditions.join(" AND ")));
        }
    }

    fn build_select(&self) -> String {
        let mut parts = Vec::new();

        if self.columns.is_empty() {
            parts.push("SELECT *".to_string());
        } else {
            parts.push(format!("SELECT {}", self.columns.join(", ")));
        }
        if !self.table.is_empty() {
            parts.push(format!("FROM {}", self.table));
        }
        if !self.joins.is_empty() {
            parts.push(self.joins.join(" "));
        }
        self.push_where(&mut parts);
        if !self.group_by.is_empty() {
            parts.push(format!("GROUP BY {}", self.group_by.join(", ")));
        }
        if !self.having.is_empty() {
            parts.push(format!("HAVING {}", self.having.join(" AND ")));
        }
        if !self.order_by.is_empty() {
            parts.push(format!("ORDER BY {}", self.order_by.join(", ")));
        }
        if let Some(limit) = self.limit {
            parts.push(format!("LIMIT {limit}"));
        }
        if let Some(offset) = self.offset {
            parts.push(format!("OFFSET {offset}"));
        }

        parts.join(" ")
    }

    fn build_insert(&self) -> String {
        let mut parts = vec![format!("INSERT INTO {}", self.table)];

        if !self.columns.is_empty() {
            parts.push(format!("({})", self.columns.join(", ")));
        }
        if !self.rows.is_empty() {
            parts.push(format!("VALUES {}", self.rows.join(", ")));
        }
        if !self.conflict_columns.is_empty() {
            let mut clause = format!("ON CONFLICT ({})", self.conflict_columns.join(", "));
            if let Some(action) = &self.conflict_action {
                clause.push(' ');
                clause.push_str(action);
            }
            parts.push(clause);
        }

        parts.join(" ")
    }

    fn build_update(&self) -> String {
        let mut parts = vec![format!("UPDATE {}", self.table)];
        if !self.assignments.is_empty() {
            parts.push(format!("SET {}", self.assignments.join(", ")));
        }
        self.push_where(&mut parts);
        parts.join(" ")
    }

    fn build_delete(&self) -> String {
        let mut parts = vec![format!("DELETE FROM {}", self.table)];
        self.push_where(&mut parts);
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_all() {
        let (sql, args) = QueryBuilder::select(Vec::<String>::new())
            .from("users")
            .build();
        assert_eq!(sql, "SELECT * FROM users");
        assert!(args.is_empty());
    }

    #[test]
    fn test_select_with_where_clause() {
        let (sql, args) = QueryBuilder::select(["id"])
            .from("users")
            .where_clause("age > ? AND age < ?", [18, 65])
            .where_eq("status", "active")
            .build();
        assert_eq!(
            sql,
            "SELECT id FROM users WHERE age > $1 AND age < $2 AND status = $3"
        );
        assert_eq!(
            args,
            vec![
                QueryParam::Int(18),
                QueryParam::Int(65),
                QueryParam::String("active".into())
            ]
        );
    }

    #[test]
    fn test_select_full() {
        let (sql, args) = QueryBuilder::select(["u.name", "COUNT(o.id)"])
            .from("users u")
            .left_join("orders o", "o.user_id = u.id")
            .where_not_null("u.email")
            .group_by(["u.name"])
            .having("COUNT(o.id) > ?", [5])
            .order_by("u.name", Some("desc"))
            .limit(20)
            .offset(40)
            .build();
        assert_eq!(
            sql,
            "SELECT u.name, COUNT(o.id) FROM users u LEFT JOIN orders o ON o.user_id = u.id \
             WHERE u.email IS NOT NULL GROUP BY u.name HAVING COUNT(o.id) > $1 \
             ORDER BY u.name DESC LIMIT 20 OFFSET 40"
        );
        assert_eq!(args, vec![QueryParam::Int(5)]);
    }

    #[test]
    fn test_joins() {
        let (sql, _) = QueryBuilder::select(["*"])
            .from("a")
            .join("b", "b.a_id = a.id")
            .inner_join("c", "c.b_id = b.id")
            .right_join("d", "d.c_id = c.id")
            .build();
        assert_eq!(
            sql,
            "SELECT * FROM a JOIN b ON b.a_id = a.id INNER JOIN c ON c.b_id = b.id \
             RIGHT JOIN d ON d.c_id = c.id"
        );
    }

    #[test]
    fn test_where_in_and_null() {
        let (sql, args) = QueryBuilder::select(["id"])
            .from("users")
            .where_in("role", ["admin", "owner"])
            .where_null("deleted_at")
            .order_by("id", None)
            .build();
        assert_eq!(
            sql,
            "SELECT id FROM users WHERE role IN ($1, $2) AND deleted_at IS NULL ORDER BY id ASC"
        );
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn test_insert_multi_row() {
        let (sql, args) = QueryBuilder::insert("users")
            .columns(["name", "age"])
            .values([QueryParam::from("alice"), QueryParam::from(30)])
            .values([QueryParam::from("bob"), QueryParam::from(25)])
            .build();
        assert_eq!(
            sql,
            "INSERT INTO users (name, age) VALUES ($1, $2), ($3, $4)"
        );
        assert_eq!(args.len(), 4);
        assert_eq!(args[2], QueryParam::String("bob".into()));
    }

    #[test]
    fn test_insert_on_conflict() {
        let (sql, _) = QueryBuilder::insert("users")
            .columns(["email"])
            .values(["a@example.com"])
            .on_conflict(["email"])
            .do_nothing()
            .build();
        assert_eq!(
            sql,
            "INSERT INTO users (email) VALUES ($1) ON CONFLICT (email) DO NOTHING"
        );

        let (sql, args) = QueryBuilder::insert("users")
            .columns(["email", "name"])
            .values(["a@example.com", "Alice"])
            .on_conflict(["email"])
            .do_update([("name", "Alice")])
            .build();
        assert_eq!(
            sql,
            "INSERT INTO users (email, name) VALUES ($1, $2) ON CONFLICT (email) DO UPDATE SET name = $3"
        );
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn test_insert_via_into() {
        let (sql, _) = QueryBuilder::insert("")
            .into("events")
            .columns(["kind"])
            .values(["login"])
            .build();
        assert_eq!(sql, "INSERT INTO events (kind) VALUES ($1)");
    }

    #[test]
    fn test_update() {
        let (sql, args) = QueryBuilder::update("users")
            .set("name", "carol")
            .set_all([("age", 41)])
            .where_eq("id", 7)
            .build();
        assert_eq!(sql, "UPDATE users SET name = $1, age = $2 WHERE id = $3");
        assert_eq!(args[2], QueryParam::Int(7));
    }

    #[test]
    fn test_delete() {
        let (sql, args) = QueryBuilder::delete()
            .from("sessions")
            .where_clause("expires_at < ?", [QueryParam::from("2024-01-01")])
            .build();
        assert_eq!(sql, "DELETE FROM sessions WHERE expires_at < $1");
        assert_eq!(args.len(), 1);

        let (sql, _) = QueryBuilder::delete().from("sessions").build();
        assert_eq!(sql, "DELETE FROM sessions");
    }

    #[test]
    fn test_placeholders_monotonic_across_clauses() {
        // HAVING is rendered after WHERE but the numbers follow call order.
        let (sql, _) = QueryBuilder::select(["team"])
            .from("scores")
            .having("SUM(points) > ?", [10])
            .where_eq("season", 2024)
            .group_by(["team"])
            .build();
        assert_eq!(
            sql,
            "SELECT team FROM scores WHERE season = $2 GROUP BY team HAVING SUM(points) > $1"
        );
    }

    #[test]
    fn test_extra_args_consume_positions() {
        let (sql, args) = QueryBuilder::select(["id"])
            .from("t")
            .where_clause("a = ?", [1, 2])
            .where_eq("b", 3)
            .build();
        assert_eq!(sql, "SELECT id FROM t WHERE a = $1 AND b = $3");
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn test_clone_is_independent() {
        let base = QueryBuilder::select(["id"]).from("users");
        let filtered = base.clone().where_eq("id", 1);

        assert_eq!(base.build().0, "SELECT id FROM users");
        assert_eq!(filtered.build().0, "SELECT id FROM users WHERE id = $1");
    }

    #[test]
    fn test_reset() {
        let mut builder = QueryBuilder::select(["id"]).from("users").where_eq("id", 1);
        builder.reset();
        assert_eq!(builder.build(), (String::new(), Vec::new()));
        assert!(builder.args().is_empty());

        let (sql, _) = builder.clone().from("users").build();
        assert!(sql.is_empty());
    }
}
