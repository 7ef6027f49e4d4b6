//! WHERE / ORDER BY generation for the SQLite store
//!
//! Compiles a validated filter tree into a parameterized SQL query over the
//! `knowledge_entry` table (aliased `k`). Field names never reach the SQL
//! text directly: every [`Field`] maps to a fixed column through
//! [`column_for`].

use chrono::{DateTime, SecondsFormat, Utc};

use crate::storage::connection::COMPARE_FN;
use crate::storage::filter::{
    ComparisonOperator, Condition, Field, FieldKind, Filter, FilterGroup, FilterValue,
    LogicalOperator,
};

/// Columns selected for a record, in row-mapping order
pub const SELECT_COLUMNS: &str = "k.id, k.category, k.content_type, k.content, k.importance, \
     k.created_at, k.updated_at, k.expires_at, k.source_id, k.source_type, k.owner_id, \
     k.owner_type, k.subject_ids, k.subject_type, k.tags, k.refs, k.metadata, k.is_deleted";

/// Column allow-list
pub fn column_for(field: Field) -> &'static str {
    match field {
        Field::Id => "k.id",
        Field::Category => "k.category",
        Field::ContentType => "k.content_type",
        Field::Content => "k.content",
        Field::Importance => "k.importance",
        Field::CreatedAt => "k.created_at",
        Field::UpdatedAt => "k.updated_at",
        Field::ExpiresAt => "k.expires_at",
        Field::SourceId => "k.source_id",
        Field::SourceType => "k.source_type",
        Field::OwnerId => "k.owner_id",
        Field::OwnerType => "k.owner_type",
        Field::SubjectIds => "k.subject_ids",
        Field::SubjectType => "k.subject_type",
        Field::Tags => "k.tags",
        Field::References => "k.refs",
        Field::Metadata => "k.metadata",
    }
}

/// Fixed-width UTC timestamp, so text order is chronological
pub fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// A compiled search
pub struct SearchQuery {
    pub sql: String,
    pub params: Vec<Box<dyn rusqlite::ToSql>>,
    /// List/reference sort fields are ordered and paginated after fetching
    pub sort_in_process: bool,
}

/// SQL generation context for building parameterized queries
pub struct SqlBuilder {
    params: Vec<Box<dyn rusqlite::ToSql>>,
}

impl SqlBuilder {
    pub fn new() -> Self {
        Self { params: Vec::new() }
    }

    /// Compile a complete search for one account
    pub fn build_search(mut self, filter: &Filter, account_id: &str) -> SearchQuery {
        self.params.push(Box::new(account_id.to_string()));
        let mut sql = format!(
            "SELECT {} FROM knowledge_entry k WHERE k.account_id = ?",
            SELECT_COLUMNS
        );

        match (filter.scans_live(), filter.scans_deleted()) {
            (true, false) => sql.push_str(" AND k.is_deleted = 0"),
            (false, true) => sql.push_str(" AND k.is_deleted = 1"),
            _ => {}
        }

        if !filter.root_group.is_empty() {
            let clause = self.build_group(&filter.root_group);
            sql.push_str(" AND ");
            sql.push_str(&clause);
        }

        let sort_field = filter.sort_field();
        let sort_in_process = matches!(
            sort_field.map(|f| f.kind()),
            Some(FieldKind::List | FieldKind::References)
        );

        // Rows arrive in id order unless a SQL-sortable field says otherwise,
        // matching the in-process candidate order
        match sort_field {
            Some(field) if !sort_in_process && field.kind() != FieldKind::Map => {
                sql.push_str(&format!(
                    " ORDER BY {} {}, k.id ASC",
                    column_for(field),
                    filter.order_dir.as_sql()
                ));
            }
            _ => sql.push_str(" ORDER BY k.id ASC"),
        }

        if !sort_in_process {
            // SQLite reads a negative OFFSET as 0, so clamp instead of wrapping
            let offset = i64::try_from(filter.offset).unwrap_or(i64::MAX);
            if filter.limit > 0 {
                sql.push_str(" LIMIT ? OFFSET ?");
                self.params
                    .push(Box::new(i64::try_from(filter.limit).unwrap_or(i64::MAX)));
                self.params.push(Box::new(offset));
            } else if filter.offset > 0 {
                sql.push_str(" LIMIT -1 OFFSET ?");
                self.params.push(Box::new(offset));
            }
        }

        SearchQuery {
            sql,
            params: self.params,
            sort_in_process,
        }
    }

    /// Build SQL from a filter group
    pub fn build_group(&mut self, group: &FilterGroup) -> String {
        if group.is_empty() {
            return "1=1".to_string(); // Always true
        }

        let mut parts: Vec<String> = Vec::new();
        for condition in &group.conditions {
            parts.push(self.build_condition(condition));
        }
        for nested in &group.groups {
            parts.push(self.build_group(nested));
        }

        match group.operator {
            LogicalOperator::And => format!("({})", parts.join(" AND ")),
            LogicalOperator::Or => format!("({})", parts.join(" OR ")),
            LogicalOperator::Not => format!("NOT ({})", parts.join(" OR ")),
        }
    }

    fn build_condition(&mut self, condition: &Condition) -> String {
        let field = condition.field();
        let column = column_for(field);
        let op = condition.operator();
        let value = condition.value();

        match field.kind() {
            FieldKind::Scalar => self.build_scalar(column, op, value),
            FieldKind::Time => match value {
                FilterValue::Time(t) if op != ComparisonOperator::Contains => {
                    self.params.push(Box::new(format_time(t)));
                    format!("COALESCE({}, '') {} ?", column, sql_operator(op))
                }
                _ => "1=0".to_string(),
            },
            FieldKind::Bytes => {
                let needle = match value {
                    FilterValue::Bytes(b) => b.clone(),
                    FilterValue::String(s) => s.as_bytes().to_vec(),
                    _ => return "1=0".to_string(),
                };
                match op {
                    ComparisonOperator::Contains if needle.is_empty() => "1=1".to_string(),
                    ComparisonOperator::Contains => {
                        self.params.push(Box::new(needle));
                        format!("instr({}, ?) > 0", column)
                    }
                    ComparisonOperator::Eq | ComparisonOperator::Ne => {
                        self.params.push(Box::new(needle));
                        format!("{} {} ?", column, sql_operator(op))
                    }
                    _ => "1=0".to_string(),
                }
            }
            FieldKind::List => match (op, value.to_text()) {
                (ComparisonOperator::Contains, Some(item)) => {
                    self.params.push(Box::new(item));
                    format!(
                        "EXISTS (SELECT 1 FROM json_each({}) WHERE json_each.value = ?)",
                        column
                    )
                }
                _ => "1=0".to_string(),
            },
            FieldKind::References => match (op, value) {
                (ComparisonOperator::Contains, FilterValue::String(id)) => {
                    self.params.push(Box::new(id.clone()));
                    format!(
                        "EXISTS (SELECT 1 FROM json_each({}) \
                         WHERE json_extract(json_each.value, '$.id') = ?)",
                        column
                    )
                }
                _ => "1=0".to_string(),
            },
            FieldKind::Map => self.build_metadata(column, op, value),
        }
    }

    // Generic fields compare as text; ordering goes through the shared comparator
    fn build_scalar(&mut self, column: &str, op: ComparisonOperator, value: &FilterValue) -> String {
        let Some(text) = value.to_text() else {
            return "1=0".to_string();
        };
        self.params.push(Box::new(text));

        match op {
            ComparisonOperator::Eq | ComparisonOperator::Ne => {
                format!("CAST({} AS TEXT) {} ?", column, sql_operator(op))
            }
            ComparisonOperator::Contains => format!("instr(CAST({} AS TEXT), ?) > 0", column),
            _ => format!("{}({}, ?) {} 0", COMPARE_FN, column, sql_operator(op)),
        }
    }

    fn build_metadata(&mut self, column: &str, op: ComparisonOperator, value: &FilterValue) -> String {
        match (op, value) {
            (ComparisonOperator::Eq, FilterValue::Map(pairs)) => self.metadata_equals(column, pairs),
            (ComparisonOperator::Ne, FilterValue::Map(pairs)) => {
                format!("NOT {}", self.metadata_equals(column, pairs))
            }
            (ComparisonOperator::Contains, FilterValue::Map(pairs)) => {
                if pairs.is_empty() {
                    return "1=0".to_string();
                }
                let checks: Vec<String> = pairs
                    .iter()
                    .map(|(k, v)| self.metadata_pair(column, k, v))
                    .collect();
                format!("({})", checks.join(" OR "))
            }
            (ComparisonOperator::Contains, FilterValue::String(key)) => {
                self.params.push(Box::new(key.clone()));
                format!(
                    "EXISTS (SELECT 1 FROM json_each({}) WHERE json_each.key = ?)",
                    column
                )
            }
            _ => "1=0".to_string(),
        }
    }

    // Every pair present; an empty map only matches empty metadata
    fn metadata_equals(
        &mut self,
        column: &str,
        pairs: &std::collections::BTreeMap<String, String>,
    ) -> String {
        if pairs.is_empty() {
            return format!("(NOT EXISTS (SELECT 1 FROM json_each({})))", column);
        }
        let checks: Vec<String> = pairs
            .iter()
            .map(|(k, v)| self.metadata_pair(column, k, v))
            .collect();
        format!("({})", checks.join(" AND "))
    }

    fn metadata_pair(&mut self, column: &str, key: &str, value: &str) -> String {
        self.params.push(Box::new(key.to_string()));
        self.params.push(Box::new(value.to_string()));
        format!(
            "EXISTS (SELECT 1 FROM json_each({}) WHERE json_each.key = ? AND json_each.value = ?)",
            column
        )
    }

    /// Take the accumulated parameters
    pub fn take_params(&mut self) -> Vec<Box<dyn rusqlite::ToSql>> {
        std::mem::take(&mut self.params)
    }
}

impl Default for SqlBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn sql_operator(op: ComparisonOperator) -> &'static str {
    match op {
        ComparisonOperator::Eq => "=",
        ComparisonOperator::Ne => "!=",
        ComparisonOperator::Gt => ">",
        ComparisonOperator::Lt => "<",
        ComparisonOperator::Ge => ">=",
        ComparisonOperator::Le => "<=",
        ComparisonOperator::Contains => "LIKE",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::filter::SortDirection;

    fn where_clause(group: &FilterGroup) -> (String, usize) {
        let mut builder = SqlBuilder::new();
        let sql = builder.build_group(group);
        (sql, builder.take_params().len())
    }

    #[test]
    fn test_empty_group_is_true() {
        let (sql, params) = where_clause(&FilterGroup::default());
        assert_eq!(sql, "1=1");
        assert_eq!(params, 0);
    }

    #[test]
    fn test_scalar_conditions() {
        let group = FilterGroup::and(vec![
            Condition::eq("Category", "fact").unwrap(),
            Condition::gt("Importance", 25).unwrap(),
            Condition::contains("OwnerID", "agent").unwrap(),
        ]);
        let (sql, params) = where_clause(&group);
        assert_eq!(
            sql,
            "(CAST(k.category AS TEXT) = ? AND kb_compare(k.importance, ?) > 0 \
             AND instr(CAST(k.owner_id AS TEXT), ?) > 0)"
        );
        assert_eq!(params, 3);
    }

    #[test]
    fn test_not_group_is_none_match() {
        let group = FilterGroup::not(vec![
            Condition::eq("Category", "fact").unwrap(),
            Condition::eq("Category", "action").unwrap(),
        ]);
        let (sql, _) = where_clause(&group);
        assert!(sql.starts_with("NOT ("));
        assert!(sql.contains(" OR "));
    }

    #[test]
    fn test_list_and_reference_membership() {
        let (sql, params) =
            where_clause(&FilterGroup::and(vec![Condition::contains("Tags", "billing").unwrap()]));
        assert!(sql.contains("json_each(k.tags) WHERE json_each.value = ?"));
        assert_eq!(params, 1);

        let (sql, _) = where_clause(&FilterGroup::and(vec![
            Condition::contains("References", "r0").unwrap(),
        ]));
        assert!(sql.contains("json_extract(json_each.value, '$.id') = ?"));
    }

    #[test]
    fn test_metadata_conditions() {
        let eq = Condition::eq("Metadata", [("team", "payments"), ("region", "eu")]).unwrap();
        let (sql, params) = where_clause(&FilterGroup::and(vec![eq]));
        assert_eq!(sql.matches("EXISTS").count(), 2);
        assert!(sql.contains(" AND "));
        assert_eq!(params, 4);

        let empty = Condition::eq("Metadata", FilterValue::Map(Default::default())).unwrap();
        let (sql, params) = where_clause(&FilterGroup::and(vec![empty]));
        assert!(sql.contains("NOT EXISTS (SELECT 1 FROM json_each(k.metadata))"));
        assert_eq!(params, 0);

        let any = Condition::contains("Metadata", [("a", "1"), ("b", "2")]).unwrap();
        let (sql, _) = where_clause(&FilterGroup::and(vec![any]));
        assert!(sql.contains(" OR "));

        let key = Condition::contains("Metadata", "team").unwrap();
        let (sql, params) = where_clause(&FilterGroup::and(vec![key]));
        assert!(sql.contains("json_each.key = ?)"));
        assert_eq!(params, 1);

        let ne = Condition::ne("Metadata", [("team", "core")]).unwrap();
        let (sql, _) = where_clause(&FilterGroup::and(vec![ne]));
        assert!(sql.starts_with("(NOT ("));
    }

    #[test]
    fn test_time_and_content_conditions() {
        let (sql, _) = where_clause(&FilterGroup::and(vec![
            Condition::lt("ExpiresAt", "2030-01-01T00:00:00Z").unwrap(),
        ]));
        assert_eq!(sql, "(COALESCE(k.expires_at, '') < ?)");

        let (sql, _) = where_clause(&FilterGroup::and(vec![
            Condition::contains("Content", "postgres").unwrap(),
        ]));
        assert_eq!(sql, "(instr(k.content, ?) > 0)");

        let (sql, params) = where_clause(&FilterGroup::and(vec![
            Condition::contains("Content", "").unwrap(),
        ]));
        assert_eq!(sql, "(1=1)");
        assert_eq!(params, 0);
    }

    #[test]
    fn test_search_query_shape() {
        let filter = Filter::new(FilterGroup::and(vec![Condition::gt("Importance", 25).unwrap()]))
            .order_by("Importance", SortDirection::Desc)
            .limit(10)
            .offset(5);
        let query = SqlBuilder::new().build_search(&filter, "acct");

        assert!(query.sql.contains("k.account_id = ?"));
        assert!(query.sql.contains("k.is_deleted = 0"));
        assert!(query.sql.contains("ORDER BY k.importance DESC, k.id ASC"));
        assert!(query.sql.ends_with("LIMIT ? OFFSET ?"));
        assert_eq!(query.params.len(), 4);
        assert!(!query.sort_in_process);
    }

    #[test]
    fn test_search_offset_only_and_partitions() {
        let query = SqlBuilder::new().build_search(&Filter::all().offset(3).include_deleted(), "a");
        assert!(query.sql.ends_with("LIMIT -1 OFFSET ?"));
        assert!(!query.sql.contains("k.is_deleted ="));

        let query = SqlBuilder::new().build_search(&Filter::all().only_deleted(), "a");
        assert!(query.sql.contains("k.is_deleted = 1"));
    }

    #[test]
    fn test_list_sort_runs_in_process() {
        let filter = Filter::all().order_by("Tags", SortDirection::Asc).limit(2);
        let query = SqlBuilder::new().build_search(&filter, "a");
        assert!(query.sort_in_process);
        assert!(query.sql.ends_with("ORDER BY k.id ASC"));
        assert!(!query.sql.contains("LIMIT"));

        let filter = Filter::all().order_by("Metadata", SortDirection::Asc);
        let query = SqlBuilder::new().build_search(&filter, "a");
        assert!(!query.sort_in_process);
        assert!(query.sql.ends_with("ORDER BY k.id ASC"));
    }

    #[test]
    fn test_unsorted_search_orders_by_id() {
        let query = SqlBuilder::new().build_search(&Filter::all().limit(5), "a");
        assert!(query.sql.ends_with("ORDER BY k.id ASC LIMIT ? OFFSET ?"));
    }

    #[test]
    fn test_huge_offset_and_limit_clamp() {
        let filter = Filter::all().offset(usize::MAX).limit(usize::MAX);
        let query = SqlBuilder::new().build_search(&filter, "a");
        let values: Vec<_> = query.params.iter().map(|p| p.to_sql().unwrap()).collect();
        let tail: Vec<_> = values[values.len() - 2..]
            .iter()
            .map(|v| match v {
                rusqlite::types::ToSqlOutput::Owned(rusqlite::types::Value::Integer(n)) => *n,
                other => panic!("unexpected param: {:?}", other),
            })
            .collect();
        assert_eq!(tail, vec![i64::MAX, i64::MAX]);
    }

    #[test]
    fn test_timestamps_are_fixed_width() {
        use chrono::TimeZone;
        let a = format_time(&Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let b = format_time(
            &(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + chrono::Duration::nanoseconds(1500)),
        );
        assert_eq!(a, "2024-01-01T00:00:00.000000000Z");
        assert_eq!(a.len(), b.len());
        assert!(a < b);
    }
}
