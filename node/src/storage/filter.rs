//! Filter algebra compiled to parameterized SQL. Field names are validated
//! against the queried table's column whitelist, values always travel as bind
//! parameters.

use rusqlite::types::Value;

use super::{StorageError, StorageResult};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FilterValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl From<&str> for FilterValue {
    fn from(v: &str) -> Self {
        FilterValue::Str(v.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(v: String) -> Self {
        FilterValue::Str(v)
    }
}

impl From<i64> for FilterValue {
    fn from(v: i64) -> Self {
        FilterValue::Int(v)
    }
}

impl From<u64> for FilterValue {
    fn from(v: u64) -> Self {
        FilterValue::Int(v as i64)
    }
}

impl From<bool> for FilterValue {
    fn from(v: bool) -> Self {
        FilterValue::Bool(v)
    }
}

impl From<FilterValue> for Value {
    fn from(v: FilterValue) -> Self {
        match v {
            FilterValue::Str(s) => Value::Text(s),
            FilterValue::Int(i) => Value::Integer(i),
            FilterValue::Bool(b) => Value::Integer(i64::from(b)),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Eq(&'static str, FilterValue),
    Ne(&'static str, FilterValue),
    In(&'static str, Vec<FilterValue>),
    Lt(&'static str, FilterValue),
    Le(&'static str, FilterValue),
    Gt(&'static str, FilterValue),
    Ge(&'static str, FilterValue),
    Contains {
        field: &'static str,
        value: String,
        case_insensitive: bool,
    },
    Null(&'static str),
    NotNull(&'static str),
}

impl Filter {
    fn write_sql(
        &self,
        columns: &[&str],
        sql: &mut String,
        params: &mut Vec<Value>,
    ) -> StorageResult<()> {
        let check = |field: &'static str| -> StorageResult<&'static str> {
            if columns.contains(&field) {
                Ok(field)
            } else {
                Err(StorageError::InvalidFilter(format!(
                    "Unknown field: {field}"
                )))
            }
        };

        match self {
            Filter::And(children) | Filter::Or(children) => {
                if children.is_empty() {
                    sql.push_str("(1=1)");
                    return Ok(());
                }
                let joiner = if matches!(self, Filter::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                sql.push('(');
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(joiner);
                    }
                    child.write_sql(columns, sql, params)?;
                }
                sql.push(')');
            }
            Filter::Not(child) => {
                sql.push_str("(NOT ");
                child.write_sql(columns, sql, params)?;
                sql.push(')');
            }
            Filter::Eq(field, value) => {
                sql.push_str(&format!("({} = ?)", check(field)?));
                params.push(value.clone().into());
            }
            Filter::Ne(field, value) => {
                sql.push_str(&format!("({} != ?)", check(field)?));
                params.push(value.clone().into());
            }
            Filter::In(field, values) => {
                if values.is_empty() {
                    sql.push_str("(1=0)");
                    return Ok(());
                }
                let placeholders = vec!["?"; values.len()].join(",");
                sql.push_str(&format!("({} IN ({placeholders}))", check(field)?));
                for value in values {
                    params.push(value.clone().into());
                }
            }
            Filter::Lt(field, value) => {
                sql.push_str(&format!("({} < ?)", check(field)?));
                params.push(value.clone().into());
            }
            Filter::Le(field, value) => {
                sql.push_str(&format!("({} <= ?)", check(field)?));
                params.push(value.clone().into());
            }
            Filter::Gt(field, value) => {
                sql.push_str(&format!("({} > ?)", check(field)?));
                params.push(value.clone().into());
            }
            Filter::Ge(field, value) => {
                sql.push_str(&format!("({} >= ?)", check(field)?));
                params.push(value.clone().into());
            }
            Filter::Contains {
                field,
                value,
                case_insensitive,
            } => {
                let field = check(field)?;
                // ESCAPE so user-supplied % and _ match literally.
                let escaped = value.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
                if *case_insensitive {
                    sql.push_str(&format!("(LOWER({field}) LIKE LOWER(?) ESCAPE '\\')"));
                } else {
                    sql.push_str(&format!("({field} LIKE ? ESCAPE '\\')"));
                }
                params.push(Value::Text(format!("%{escaped}%")));
            }
            Filter::Null(field) => {
                sql.push_str(&format!("({} IS NULL)", check(field)?));
            }
            Filter::NotNull(field) => {
                sql.push_str(&format!("({} IS NOT NULL)", check(field)?));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SortDir {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Query {
    filter: Option<Filter>,
    sort: Vec<(&'static str, SortDir)>,
    skip: Option<usize>,
    limit: Option<usize>,
}

impl Query {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub(crate) fn sort(mut self, field: &'static str, dir: SortDir) -> Self {
        self.sort.push((field, dir));
        self
    }

    pub(crate) fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub(crate) fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Appends WHERE/ORDER BY/LIMIT clauses to `select`, returning the bind
    /// parameters in order.
    pub(crate) fn to_sql(
        &self,
        select: &str,
        columns: &[&str],
    ) -> StorageResult<(String, Vec<Value>)> {
        let mut sql = select.to_string();
        let mut params = Vec::new();

        if let Some(filter) = &self.filter {
            sql.push_str(" WHERE ");
            filter.write_sql(columns, &mut sql, &mut params)?;
        }

        if !self.sort.is_empty() {
            sql.push_str(" ORDER BY ");
            for (i, (field, dir)) in self.sort.iter().enumerate() {
                if !columns.contains(field) {
                    return Err(StorageError::InvalidFilter(format!(
                        "Unknown sort field: {field}"
                    )));
                }
                if i > 0 {
                    sql.push_str(", ");
                }
                sql.push_str(field);
                sql.push_str(match dir {
                    SortDir::Asc => " ASC",
                    SortDir::Desc => " DESC",
                });
            }
        }

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(skip) = self.skip {
            if self.limit.is_none() {
                sql.push_str(" LIMIT -1");
            }
            sql.push_str(&format!(" OFFSET {skip}"));
        }

        Ok((sql, params))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const COLUMNS: &[&str] = &["namespace", "state", "created", "tag"];

    #[test]
    fn test_eq_and_gt() {
        let query = Query::new()
            .filter(Filter::And(vec![
                Filter::Eq("namespace", "ns1".into()),
                Filter::Gt("created", 100u64.into()),
            ]))
            .sort("created", SortDir::Asc)
            .limit(10);

        let (sql, params) = query.to_sql("SELECT * FROM messages", COLUMNS).unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM messages WHERE ((namespace = ?) AND (created > ?)) \
             ORDER BY created ASC LIMIT 10"
        );
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let query = Query::new().filter(Filter::Eq("nope", "x".into()));
        let result = query.to_sql("SELECT * FROM messages", COLUMNS);
        assert!(matches!(result, Err(StorageError::InvalidFilter(_))));
    }

    #[test]
    fn test_or_not_nesting() {
        let query = Query::new().filter(Filter::Not(Box::new(Filter::Or(vec![
            Filter::Eq("state", "staged".into()),
            Filter::Null("tag"),
        ]))));
        let (sql, params) = query.to_sql("SELECT * FROM messages", COLUMNS).unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM messages WHERE (NOT ((state = ?) OR (tag IS NULL)))"
        );
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_in_empty_matches_nothing() {
        let query = Query::new().filter(Filter::In("state", vec![]));
        let (sql, _) = query.to_sql("SELECT * FROM messages", COLUMNS).unwrap();
        assert!(sql.ends_with("(1=0)"));
    }

    #[test]
    fn test_contains_escapes_wildcards() {
        let query = Query::new().filter(Filter::Contains {
            field: "tag",
            value: "50%_done".to_string(),
            case_insensitive: false,
        });
        let (_, params) = query.to_sql("SELECT * FROM messages", COLUMNS).unwrap();
        assert_eq!(params[0], Value::Text("%50\\%\\_done%".to_string()));
    }

    #[test]
    fn test_skip_without_limit() {
        let query = Query::new().skip(5);
        let (sql, _) = query.to_sql("SELECT * FROM messages", COLUMNS).unwrap();
        assert_eq!(sql, "SELECT * FROM messages LIMIT -1 OFFSET 5");
    }
}
