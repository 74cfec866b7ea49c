//! Structured query → SQL translation.
//!
//! Placeholders are assigned by walking `data`, then `where`, then `having`
//! in insertion order, so the named parameters `param_1..param_N` always
//! line up with argument positions.

use crate::dialect::Dialect;
use crate::error::SqlError;
use crate::model::{
    Action, BatchInsertRequest, DatabaseKind, InsertRequest, Params, SortOrder, StructuredQuery,
};

pub struct QueryBuilder {
    kind: DatabaseKind,
}

impl QueryBuilder {
    pub fn new(kind: DatabaseKind) -> Self {
        Self { kind }
    }

    fn dialect(&self) -> &'static dyn Dialect {
        self.kind.dialect()
    }

    pub fn build(&self, query: &StructuredQuery) -> Result<(String, Params), SqlError> {
        match query.action {
            Action::Select => self.build_select(query),
            Action::Insert => self.build_insert(query),
            Action::Update => self.build_update(query),
            Action::Delete => self.build_delete(query),
        }
    }

    fn build_select(&self, query: &StructuredQuery) -> Result<(String, Params), SqlError> {
        let mut sql = String::from("SELECT ");
        if query.fields.is_empty() {
            sql.push('*');
        } else {
            sql.push_str(&query.fields.join(", "));
        }
        sql.push_str(" FROM ");
        sql.push_str(&query.table);

        let mut params = Params::new();
        let mut next_index = 1;

        if let Some(filter) = non_empty(&query.filter) {
            let clause = self.condition_clause(filter, &mut params, &mut next_index);
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }

        if !query.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&query.group_by.join(", "));
        }

        if let Some(having) = non_empty(&query.having) {
            let clause = self.condition_clause(having, &mut params, &mut next_index);
            sql.push_str(" HAVING ");
            sql.push_str(&clause);
        }

        if !query.order_by.is_empty() {
            let clauses: Vec<String> = query
                .order_by
                .iter()
                .map(|entry| {
                    let order = entry.order.unwrap_or(SortOrder::Asc);
                    format!("{} {}", entry.field, order.as_sql())
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&clauses.join(", "));
        }

        if let Some(limit) = query.limit.filter(|limit| *limit > 0) {
            sql.push(' ');
            sql.push_str(&self.dialect().limit_fragment(limit));
        }

        Ok((sql, params))
    }

    fn build_insert(&self, query: &StructuredQuery) -> Result<(String, Params), SqlError> {
        let data = non_empty(&query.data)
            .ok_or_else(|| SqlError::syntax("no data provided for insert"))?;

        let mut params = Params::new();
        let mut next_index = 1;
        let (fields, placeholders) = self.value_list(data, &mut params, &mut next_index);

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            query.table,
            fields.join(", "),
            placeholders.join(", ")
        );
        Ok((sql, params))
    }

    fn build_update(&self, query: &StructuredQuery) -> Result<(String, Params), SqlError> {
        let data = non_empty(&query.data)
            .ok_or_else(|| SqlError::syntax("no data provided for update"))?;

        let mut params = Params::new();
        let mut next_index = 1;

        let assignments: Vec<String> = data
            .iter()
            .map(|(field, value)| {
                let placeholder = self.next_placeholder(&mut params, &mut next_index, value);
                format!("{field} = {placeholder}")
            })
            .collect();

        let mut sql = format!("UPDATE {} SET {}", query.table, assignments.join(", "));

        if let Some(filter) = non_empty(&query.filter) {
            let clause = self.condition_clause(filter, &mut params, &mut next_index);
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }

        Ok((sql, params))
    }

    // A DELETE without a WHERE clause never leaves the builder.
    fn build_delete(&self, query: &StructuredQuery) -> Result<(String, Params), SqlError> {
        let filter = non_empty(&query.filter)
            .ok_or_else(|| SqlError::syntax("a WHERE clause is required for delete"))?;

        let mut params = Params::new();
        let mut next_index = 1;
        let clause = self.condition_clause(filter, &mut params, &mut next_index);

        let sql = format!("DELETE FROM {} WHERE {}", query.table, clause);
        Ok((sql, params))
    }

    /// Convenience insert with conflict handling and RETURNING support.
    pub fn build_insert_request(&self, req: &InsertRequest) -> Result<(String, Params), SqlError> {
        if req.data.is_empty() {
            return Err(SqlError::syntax("no data provided for insert"));
        }

        let mut params = Params::new();
        let mut next_index = 1;
        let (fields, placeholders) = self.value_list(&req.data, &mut params, &mut next_index);

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            req.table,
            fields.join(", "),
            placeholders.join(", ")
        );

        if let Some(mode) = req.on_conflict {
            sql.push_str(&self.dialect().on_conflict_fragment(mode, &fields));
        }
        sql.push_str(&self.dialect().returning_fragment(&req.return_fields));

        Ok((sql, params))
    }

    /// Single-statement multi-row insert. Columns are fixed from the first
    /// record; records missing a column bind NULL.
    pub fn build_batch_insert(&self, req: &BatchInsertRequest) -> Result<(String, Params), SqlError> {
        let first = req
            .data
            .first()
            .ok_or_else(|| SqlError::syntax("no data provided for batch insert"))?;
        let fields: Vec<String> = first.keys().cloned().collect();

        let mut params = Params::new();
        let mut next_index = 1;
        let mut rows = Vec::with_capacity(req.data.len());

        for record in &req.data {
            let placeholders: Vec<String> = fields
                .iter()
                .map(|field| {
                    let value = record.get(field).cloned().unwrap_or(serde_json::Value::Null);
                    self.next_placeholder(&mut params, &mut next_index, &value)
                })
                .collect();
            rows.push(format!("({})", placeholders.join(", ")));
        }

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            req.table,
            fields.join(", "),
            rows.join(", ")
        );

        if let Some(mode) = req.on_conflict {
            sql.push_str(&self.dialect().on_conflict_fragment(mode, &fields));
        }
        sql.push_str(&self.dialect().returning_fragment(&req.return_fields));

        Ok((sql, params))
    }

    fn condition_clause(
        &self,
        conditions: &Params,
        params: &mut Params,
        next_index: &mut usize,
    ) -> String {
        let clauses: Vec<String> = conditions
            .iter()
            .map(|(field, value)| {
                let placeholder = self.next_placeholder(params, next_index, value);
                format!("{field} = {placeholder}")
            })
            .collect();
        clauses.join(" AND ")
    }

    fn value_list(
        &self,
        data: &Params,
        params: &mut Params,
        next_index: &mut usize,
    ) -> (Vec<String>, Vec<String>) {
        let mut fields = Vec::with_capacity(data.len());
        let mut placeholders = Vec::with_capacity(data.len());
        for (field, value) in data {
            fields.push(field.clone());
            placeholders.push(self.next_placeholder(params, next_index, value));
        }
        (fields, placeholders)
    }

    fn next_placeholder(
        &self,
        params: &mut Params,
        next_index: &mut usize,
        value: &serde_json::Value,
    ) -> String {
        let placeholder = self.dialect().placeholder(*next_index);
        params.insert(format!("param_{next_index}"), value.clone());
        *next_index += 1;
        placeholder
    }
}

fn non_empty(map: &Option<Params>) -> Option<&Params> {
    map.as_ref().filter(|map| !map.is_empty())
}
