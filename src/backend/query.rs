//! Table query builder.
//!
//! Describes a read against one table: column projection, filter predicates,
//! ordering and a pagination window. `to_params` renders it into the query
//! string understood by the table API (`col=eq.value`, `order=col.desc`, ...).

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq { column: String, value: String },
    In { column: String, values: Vec<String> },
}

impl Filter {
    pub fn column(&self) -> &str {
        match self {
            Filter::Eq { column, .. } | Filter::In { column, .. } => column,
        }
    }

    /// Evaluates the predicate against a JSON row.
    pub fn matches(&self, row: &Value) -> bool {
        let Some(field) = row.get(self.column()) else {
            return false;
        };
        let field = value_as_param(field);
        match self {
            Filter::Eq { value, .. } => &field == value,
            Filter::In { values, .. } => values.contains(&field),
        }
    }

    fn to_param(&self) -> (String, String) {
        match self {
            Filter::Eq { column, value } => (column.clone(), format!("eq.{}", value)),
            Filter::In { column, values } => {
                let list = values
                    .iter()
                    .map(|v| quote_list_item(v))
                    .collect::<Vec<_>>()
                    .join(",");
                (column.clone(), format!("in.({})", list))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    table: String,
    columns: String,
    filters: Vec<Filter>,
    order: Vec<Order>,
    offset: Option<usize>,
    limit: Option<usize>,
    count_exact: bool,
}

impl Query {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            columns: "*".to_string(),
            filters: Vec::new(),
            order: Vec::new(),
            offset: None,
            limit: None,
            count_exact: false,
        }
    }

    pub fn select(mut self, columns: &str) -> Self {
        self.columns = columns.to_string();
        self
    }

    pub fn eq(mut self, column: &str, value: impl ToString) -> Self {
        self.filters.push(Filter::Eq {
            column: column.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn in_list<I, V>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        self.filters.push(Filter::In {
            column: column.to_string(),
            values: values.into_iter().map(|v| v.to_string()).collect(),
        });
        self
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        self.order.push(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Inclusive row window, `from..=to`.
    pub fn range(mut self, from: usize, to: usize) -> Self {
        self.offset = Some(from);
        self.limit = Some(to.saturating_sub(from) + 1);
        self
    }

    /// Asks the backend for the exact number of matching rows.
    pub fn with_count(mut self) -> Self {
        self.count_exact = true;
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &str {
        &self.columns
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn ordering(&self) -> &[Order] {
        &self.order
    }

    pub fn offset(&self) -> Option<usize> {
        self.offset
    }

    pub fn row_limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn wants_count(&self) -> bool {
        self.count_exact
    }

    /// Query-string parameters for a read.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("select".to_string(), self.columns.clone())];
        params.extend(self.filter_params());
        if !self.order.is_empty() {
            let order = self
                .order
                .iter()
                .map(|o| {
                    format!(
                        "{}.{}",
                        o.column,
                        if o.ascending { "asc" } else { "desc" }
                    )
                })
                .collect::<Vec<_>>()
                .join(",");
            params.push(("order".to_string(), order));
        }
        if let Some(offset) = self.offset {
            params.push(("offset".to_string(), offset.to_string()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }

    /// Query-string parameters that only carry the filters, used by updates.
    pub fn filter_params(&self) -> Vec<(String, String)> {
        self.filters.iter().map(Filter::to_param).collect()
    }
}

/// Renders a JSON scalar the way it appears in a filter value.
pub fn value_as_param(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn quote_list_item(value: &str) -> String {
    if value.contains(|c| matches!(c, ',' | '(' | ')' | '"')) {
        format!("\"{}\"", value.replace('"', "\\\""))
    } else {
        value.to_string()
    }
}
