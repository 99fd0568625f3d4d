//! SELECT assembly from fragments.
//!
//! The builder does not parse what it is given. Fragments are stored verbatim;
//! at [`SqlBuilder::get_sql`] time plain identifiers are passed through the
//! dialect's field formatting and the dialect composes the final statement.

use crate::db::Backend;
use crate::db::escape::is_identifier;

/// Fragments of one SELECT, separators already applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectParts {
    pub fields: String,
    pub from: String,
    pub where_clause: String,
    pub group_by: String,
    pub order_by: String,
    pub limit: Option<String>,
}

/// Accumulates field / from / where / group / order / limit fragments.
///
/// # Examples
///
/// ```ignore
/// let mut builder = SqlBuilder::new();
/// builder.add_field("pkid").add_field("company");
/// builder.add_from("customer");
/// builder.add_where("company LIKE ?", "AND");
/// let sql = builder.get_sql(&Sqlite);
/// // SELECT pkid, company
/// // FROM customer
/// // WHERE company LIKE ?
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlBuilder {
    fields: Vec<String>,
    from: Vec<String>,
    where_clause: String,
    group_by: Vec<String>,
    order_by: Vec<String>,
    limit: Option<String>,
}

impl SqlBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_field(&mut self, expr: &str) -> &mut Self {
        self.fields.push(expr.to_string());
        self
    }

    pub fn clear_fields(&mut self) -> &mut Self {
        self.fields.clear();
        self
    }

    pub fn set_fields_clause(&mut self, expr: &str) -> &mut Self {
        self.fields = non_empty(expr);
        self
    }

    pub fn add_from(&mut self, expr: &str) -> &mut Self {
        self.from.push(expr.to_string());
        self
    }

    pub fn set_from_clause(&mut self, expr: &str) -> &mut Self {
        self.from = non_empty(expr);
        self
    }

    /// Append a predicate joined to the existing clause by `conjunction`.
    pub fn add_where(&mut self, expr: &str, conjunction: &str) -> &mut Self {
        if self.where_clause.is_empty() {
            self.where_clause = expr.to_string();
        } else {
            self.where_clause = format!(
                "{} {} {}",
                self.where_clause,
                conjunction.trim().to_uppercase(),
                expr
            );
        }
        self
    }

    pub fn set_where_clause(&mut self, expr: &str) -> &mut Self {
        self.where_clause = expr.trim().to_string();
        self
    }

    pub fn clear_where(&mut self) -> &mut Self {
        self.where_clause.clear();
        self
    }

    pub fn add_group_by(&mut self, expr: &str) -> &mut Self {
        self.group_by.push(expr.to_string());
        self
    }

    pub fn set_group_by_clause(&mut self, expr: &str) -> &mut Self {
        self.group_by = non_empty(expr);
        self
    }

    pub fn add_order_by(&mut self, expr: &str) -> &mut Self {
        self.order_by.push(expr.to_string());
        self
    }

    pub fn set_order_by_clause(&mut self, expr: &str) -> &mut Self {
        self.order_by = non_empty(expr);
        self
    }

    /// Row limit; an empty expression removes it.
    pub fn set_limit(&mut self, expr: &str) -> &mut Self {
        let expr = expr.trim();
        self.limit = (!expr.is_empty()).then(|| expr.to_string());
        self
    }

    pub fn get_fields_clause(&self) -> String {
        self.fields.join(", ")
    }

    pub fn get_from_clause(&self) -> String {
        self.from.join(", ")
    }

    pub fn get_where_clause(&self) -> &str {
        &self.where_clause
    }

    pub fn get_group_by_clause(&self) -> String {
        self.group_by.join(", ")
    }

    pub fn get_order_by_clause(&self) -> String {
        self.order_by.join(", ")
    }

    pub fn get_limit(&self) -> Option<&str> {
        self.limit.as_deref()
    }

    pub fn has_from(&self) -> bool {
        !self.from.is_empty()
    }

    /// Fragments rendered for `backend`.
    ///
    /// `default_from` is used when no FROM fragment was given. Each entry of
    /// `extra_where` is ANDed onto the user clause, which is parenthesized
    /// when extras are present.
    pub fn select_parts(
        &self,
        backend: &dyn Backend,
        default_from: &str,
        extra_where: &[String],
    ) -> SelectParts {
        let fields = if self.fields.is_empty() {
            "*".to_string()
        } else {
            format_list(backend, &self.fields)
        };
        let from = if self.from.is_empty() {
            format_item(backend, default_from)
        } else {
            format_list(backend, &self.from)
        };

        let mut predicates = Vec::with_capacity(extra_where.len() + 1);
        if !self.where_clause.is_empty() {
            if extra_where.is_empty() {
                predicates.push(self.where_clause.clone());
            } else {
                predicates.push(format!("({})", self.where_clause));
            }
        }
        predicates.extend(extra_where.iter().cloned());

        SelectParts {
            fields,
            from,
            where_clause: predicates.join(" AND "),
            group_by: format_list(backend, &self.group_by),
            order_by: format_list(backend, &self.order_by),
            limit: self.limit.clone(),
        }
    }

    /// Final SELECT text.
    pub fn get_sql(&self, backend: &dyn Backend) -> String {
        backend.compose_select(&self.select_parts(backend, "", &[]))
    }

    /// Final SELECT text with a default FROM and extra predicates.
    pub fn get_sql_with(
        &self,
        backend: &dyn Backend,
        default_from: &str,
        extra_where: &[String],
    ) -> String {
        backend.compose_select(&self.select_parts(backend, default_from, extra_where))
    }
}

fn non_empty(expr: &str) -> Vec<String> {
    let expr = expr.trim();
    if expr.is_empty() {
        Vec::new()
    } else {
        vec![expr.to_string()]
    }
}

fn format_item(backend: &dyn Backend, item: &str) -> String {
    if is_identifier(item) {
        backend.format_field(item)
    } else {
        item.to_string()
    }
}

fn format_list(backend: &dyn Backend, items: &[String]) -> String {
    items
        .iter()
        .map(|item| format_item(backend, item))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Firebird, Sqlite};
    use rstest::{fixture, rstest};

    #[fixture]
    fn builder() -> SqlBuilder {
        let mut builder = SqlBuilder::new();
        builder
            .add_field("pkid")
            .add_field("company")
            .add_from("customer")
            .add_where("company LIKE ?", "and")
            .add_where("active = 1", "or")
            .add_order_by("company DESC");
        builder
    }

    #[rstest]
    fn test_get_sql_composes_clauses(builder: SqlBuilder) {
        assert_eq!(
            builder.get_sql(&Sqlite),
            "SELECT pkid, company\nFROM customer\nWHERE company LIKE ? OR active = 1\nORDER BY company DESC"
        );
    }

    #[rstest]
    fn test_defaults_to_star_and_default_from() {
        let builder = SqlBuilder::new();
        assert_eq!(
            builder.get_sql_with(&Sqlite, "orders", &[]),
            "SELECT *\nFROM orders"
        );
    }

    #[rstest]
    fn test_extra_predicates_parenthesize_user_clause(builder: SqlBuilder) {
        let sql = builder.get_sql_with(&Sqlite, "", &["custid = ?".to_string()]);
        assert!(sql.contains("WHERE (company LIKE ? OR active = 1) AND custid = ?"));

        let plain = SqlBuilder::new().get_sql_with(&Sqlite, "t", &["1=0".to_string()]);
        assert_eq!(plain, "SELECT *\nFROM t\nWHERE 1=0");
    }

    #[rstest]
    fn test_identifiers_are_formatted_by_dialect(builder: SqlBuilder) {
        let mut builder = builder;
        builder.set_limit("10");
        assert_eq!(
            builder.get_sql(&Firebird),
            "SELECT FIRST 10 \"PKID\", \"COMPANY\"\nFROM \"CUSTOMER\"\nWHERE company LIKE ? OR active = 1\nORDER BY company DESC"
        );
    }

    #[rstest]
    fn test_set_and_clear(builder: SqlBuilder) {
        let mut builder = builder;
        builder
            .set_where_clause(" state = 'NY' ")
            .set_group_by_clause("state")
            .set_order_by_clause("")
            .clear_fields()
            .add_field("count(*)")
            .set_limit("5");
        assert_eq!(builder.get_where_clause(), "state = 'NY'");
        assert_eq!(builder.get_order_by_clause(), "");
        assert_eq!(builder.get_limit(), Some("5"));
        assert_eq!(
            builder.get_sql(&Sqlite),
            "SELECT count(*)\nFROM customer\nWHERE state = 'NY'\nGROUP BY state\nLIMIT 5"
        );

        builder.clear_where().set_limit("");
        assert_eq!(builder.get_where_clause(), "");
        assert_eq!(builder.get_limit(), None);
    }
}
