//! Tables, constraint enforcement and statement interpretation.

use std::collections::BTreeMap;
use std::sync::Arc;

use reel_core::{
    ColumnInfo, ConstraintKind, Date, Error, Expr, JoinKind, OrderDirection, QueryError,
    QueryErrorKind, Result, Row, SelectStatement, Value,
};

use crate::eval::{Binding, Env, eval_group, eval_row, is_true};
use crate::table::{StoredRow, Table, TableDef};

/// Inverse of one applied row change.
#[derive(Debug, Clone)]
pub(crate) enum Undo {
    Inserted { table: String, rowid: u64 },
    Updated { table: String, rowid: u64, old: Vec<Value> },
    Deleted { table: String, index: usize, row: StoredRow },
}

/// Knobs a single write honors.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WriteOptions {
    pub enforce_foreign_keys: bool,
    pub today: Date,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Database {
    tables: BTreeMap<String, Table>,
    sequences: BTreeMap<String, i64>,
}

fn violation(kind: ConstraintKind, table: &str, column: Option<&str>, message: String) -> Error {
    Error::Query(QueryError::constraint(
        kind,
        table,
        column.map(str::to_string),
        message,
    ))
}

fn not_found(message: String) -> Error {
    Error::Query(QueryError::new(QueryErrorKind::NotFound, message))
}

fn rejected(kind: QueryErrorKind, message: String) -> Error {
    Error::Query(QueryError::new(kind, message))
}

impl Database {
    pub fn new(tables: Vec<Table>, sequences: Vec<String>) -> Result<Self> {
        let mut db = Database::default();
        for table in tables {
            let name = table.def.name.clone();
            if db.tables.insert(name.clone(), table).is_some() {
                return Err(Error::config(format!("table {name} is declared twice")));
            }
        }
        for sequence in sequences {
            db.sequences.insert(sequence, 1);
        }
        Ok(db)
    }

    pub fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| not_found(format!("table {name} does not exist")))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| not_found(format!("table {name} does not exist")))
    }

    pub fn next_sequence_value(&mut self, name: &str) -> Result<i64> {
        let next = self
            .sequences
            .get_mut(name)
            .ok_or_else(|| not_found(format!("sequence {name} does not exist")))?;
        let value = *next;
        *next += 1;
        Ok(value)
    }

    /// Move sequences and identity counters past every stored identity.
    pub fn sync_counters(&mut self) {
        for table in self.tables.values_mut() {
            let Some(max) = table.max_identity() else {
                continue;
            };
            table.next_id = table.next_id.max(max + 1);
            if let Some(sequence) = &table.def.sequence {
                if let Some(next) = self.sequences.get_mut(sequence) {
                    *next = (*next).max(max + 1);
                }
            }
        }
    }

    fn compute_derived(def: &TableDef, values: &mut [Value], today: Date) -> Result<()> {
        for (index, column) in def.columns.iter().enumerate() {
            if let Some(formula) = column.derived {
                let binding = Binding {
                    alias: &def.name,
                    def,
                    values: Some(&*values),
                };
                let env = Env { params: &[], today };
                let computed = eval_row(&formula.to_expr(None), &[binding], &env, &[])?;
                values[index] = def.coerce(index, computed);
            }
        }
        Ok(())
    }

    /// Check a candidate row against every constraint of its table.
    fn check_row(
        &self,
        def: &TableDef,
        values: &[Value],
        replacing: Option<u64>,
        enforce_foreign_keys: bool,
    ) -> Result<()> {
        let table = self.table(&def.name)?;
        for (index, (column, value)) in def.columns.iter().zip(values).enumerate() {
            if value.is_null() {
                if !column.nullable {
                    return Err(violation(
                        ConstraintKind::NotNull,
                        &def.name,
                        Some(&column.name),
                        format!(
                            "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
                            column.name, def.name
                        ),
                    ));
                }
                continue;
            }
            if !column.sql_type.accepts(value) {
                let mut err = QueryError::new(
                    QueryErrorKind::Database,
                    format!(
                        "invalid {} value for column {} of type {}",
                        value.type_name(),
                        column.name,
                        column.sql_type.as_sql()
                    ),
                );
                err.sqlstate = Some("22P02".to_string());
                err.table = Some(def.name.clone());
                err.column = Some(column.name.clone());
                return Err(Error::Query(err));
            }
            if let (Some(max), Some(text)) = (column.max_length, value.as_str()) {
                if text.chars().count() > max {
                    return Err(violation(
                        ConstraintKind::Length,
                        &def.name,
                        Some(&column.name),
                        format!("value too long for column \"{}\" (limit {max})", column.name),
                    ));
                }
            }
            if column.unique {
                let taken = table
                    .rows
                    .iter()
                    .any(|row| Some(row.rowid) != replacing && row.values[index].same_as(value));
                if taken {
                    return Err(violation(
                        ConstraintKind::Unique,
                        &def.name,
                        Some(&column.name),
                        format!("duplicate key value {value} for column \"{}\"", column.name),
                    ));
                }
            }
            if enforce_foreign_keys {
                if let Some(target) = &column.references {
                    let target = self.table(target)?;
                    let exists = target.rows.iter().any(|row| {
                        target
                            .identity_of(row)
                            .is_some_and(|id| Value::BigInt(id).same_as(value))
                    });
                    if !exists {
                        return Err(violation(
                            ConstraintKind::ForeignKey,
                            &def.name,
                            Some(&column.name),
                            format!(
                                "{}.{} = {value} is not present in table \"{}\"",
                                def.name, column.name, target.def.name
                            ),
                        ));
                    }
                }
            }
        }
        for set in &def.unique_sets {
            let duplicate = table.rows.iter().any(|row| {
                Some(row.rowid) != replacing
                    && set.iter().all(|&i| row.values[i].same_as(&values[i]))
            });
            if duplicate {
                let names: Vec<&str> = set.iter().map(|&i| def.columns[i].name.as_str()).collect();
                return Err(violation(
                    ConstraintKind::Unique,
                    &def.name,
                    None,
                    format!("duplicate key for ({}) in \"{}\"", names.join(", "), def.name),
                ));
            }
        }
        Ok(())
    }

    /// Insert one row; returns its identity and the undo record.
    pub fn insert(
        &mut self,
        table: &str,
        columns: &[String],
        params: &[Value],
        options: WriteOptions,
    ) -> Result<(Option<i64>, Undo)> {
        let current = self.table(table)?;
        let def = &current.def;
        if params.len() < columns.len() {
            return Err(rejected(
                QueryErrorKind::Syntax,
                format!("INSERT into {table} binds {} of {} columns", params.len(), columns.len()),
            ));
        }
        let mut values = vec![Value::Null; def.columns.len()];
        for (column, value) in columns.iter().zip(params) {
            let index = def.column_index(column)?;
            if def.columns[index].derived.is_some() {
                return Err(rejected(
                    QueryErrorKind::Syntax,
                    format!("cannot insert into generated column {column}"),
                ));
            }
            values[index] = def.coerce(index, value.clone());
        }
        if let Some(identity) = def.identity {
            if identity.auto && values[identity.index].is_null() {
                values[identity.index] = Value::BigInt(current.next_id);
            }
        }
        Self::compute_derived(def, &mut values, options.today)?;
        self.check_row(def, &values, None, options.enforce_foreign_keys)?;

        let target = self.table_mut(table)?;
        let identity = target
            .def
            .identity
            .and_then(|identity| values[identity.index].as_i64());
        if let Some(id) = identity {
            target.next_id = target.next_id.max(id + 1);
        }
        let rowid = target.next_rowid;
        target.next_rowid += 1;
        target.rows.push(StoredRow { rowid, values });
        Ok((
            identity,
            Undo::Inserted {
                table: table.to_string(),
                rowid,
            },
        ))
    }

    fn matching(&self, table: &Table, filter: &Expr, params: &[Value], today: Date) -> Result<Vec<u64>> {
        let env = Env { params, today };
        let mut matched = Vec::new();
        for row in &table.rows {
            let binding = Binding {
                alias: &table.def.name,
                def: &table.def,
                values: Some(&row.values),
            };
            if is_true(&eval_row(filter, &[binding], &env, &[])?)? {
                matched.push(row.rowid);
            }
        }
        Ok(matched)
    }

    /// `UPDATE table SET columns = params[..n] WHERE filter`.
    pub fn update(
        &mut self,
        table: &str,
        columns: &[String],
        filter: &Expr,
        params: &[Value],
        options: WriteOptions,
    ) -> Result<(u64, Vec<Undo>)> {
        let current = self.table(table)?;
        let def = &current.def;
        let mut assignments = Vec::with_capacity(columns.len());
        for (position, column) in columns.iter().enumerate() {
            let index = def.column_index(column)?;
            if def.columns[index].derived.is_some()
                || def.identity.is_some_and(|identity| identity.index == index)
            {
                return Err(rejected(
                    QueryErrorKind::Syntax,
                    format!("column {column} of {table} cannot be updated"),
                ));
            }
            let value = params.get(position).cloned().ok_or_else(|| {
                rejected(QueryErrorKind::Syntax, format!("no value bound for {column}"))
            })?;
            assignments.push((index, def.coerce(index, value)));
        }

        let matched = self.matching(current, filter, params, options.today)?;
        let mut changes = Vec::with_capacity(matched.len());
        for row in current.rows.iter().filter(|row| matched.contains(&row.rowid)) {
            let mut values = row.values.clone();
            for (index, value) in &assignments {
                values[*index] = value.clone();
            }
            Self::compute_derived(def, &mut values, options.today)?;
            self.check_row(def, &values, Some(row.rowid), options.enforce_foreign_keys)?;
            changes.push((row.rowid, values));
        }

        let target = self.table_mut(table)?;
        let mut undo = Vec::with_capacity(changes.len());
        for (rowid, values) in changes {
            if let Some(row) = target.rows.iter_mut().find(|row| row.rowid == rowid) {
                let old = std::mem::replace(&mut row.values, values);
                undo.push(Undo::Updated {
                    table: table.to_string(),
                    rowid,
                    old,
                });
            }
        }
        Ok((undo.len() as u64, undo))
    }

    /// `DELETE FROM table WHERE filter`, restricted by referencing rows.
    pub fn delete(
        &mut self,
        table: &str,
        filter: &Expr,
        params: &[Value],
        options: WriteOptions,
    ) -> Result<(u64, Vec<Undo>)> {
        let current = self.table(table)?;
        let matched = self.matching(current, filter, params, options.today)?;

        if options.enforce_foreign_keys && current.def.identity.is_some() {
            for row in current.rows.iter().filter(|row| matched.contains(&row.rowid)) {
                let Some(id) = current.identity_of(row) else {
                    continue;
                };
                self.check_unreferenced(table, id, &matched)?;
            }
        }

        let target = self.table_mut(table)?;
        let mut undo = Vec::with_capacity(matched.len());
        let mut index = 0;
        while index < target.rows.len() {
            if matched.contains(&target.rows[index].rowid) {
                let row = target.rows.remove(index);
                undo.push(Undo::Deleted {
                    table: table.to_string(),
                    index,
                    row,
                });
            } else {
                index += 1;
            }
        }
        Ok((undo.len() as u64, undo))
    }

    fn check_unreferenced(&self, table: &str, id: i64, deleting: &[u64]) -> Result<()> {
        for other in self.tables.values() {
            for (index, column) in other.def.columns.iter().enumerate() {
                if column.references.as_deref() != Some(table) {
                    continue;
                }
                let referenced = other.rows.iter().any(|row| {
                    !(other.def.name == table && deleting.contains(&row.rowid))
                        && row.values[index].same_as(&Value::BigInt(id))
                });
                if referenced {
                    return Err(violation(
                        ConstraintKind::ForeignKey,
                        &other.def.name,
                        Some(&column.name),
                        format!(
                            "delete on \"{table}\" violates foreign key: key {id} is still referenced from \"{}\".\"{}\"",
                            other.def.name, column.name
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Verify every foreign key in the database.
    pub fn check_all_foreign_keys(&self) -> Result<()> {
        for table in self.tables.values() {
            for row in &table.rows {
                self.check_row(&table.def, &row.values, Some(row.rowid), true)?;
            }
        }
        Ok(())
    }

    /// Revert one change. Undo records are applied newest first.
    pub fn apply_undo(&mut self, undo: Undo) {
        match undo {
            Undo::Inserted { table, rowid } => {
                if let Some(table) = self.tables.get_mut(&table) {
                    table.rows.retain(|row| row.rowid != rowid);
                }
            }
            Undo::Updated { table, rowid, old } => {
                if let Some(row) = self
                    .tables
                    .get_mut(&table)
                    .and_then(|t| t.rows.iter_mut().find(|row| row.rowid == rowid))
                {
                    row.values = old;
                }
            }
            Undo::Deleted { table, index, row } => {
                if let Some(table) = self.tables.get_mut(&table) {
                    let index = index.min(table.rows.len());
                    table.rows.insert(index, row);
                }
            }
        }
    }

    /// Every row of `table` with its column names.
    pub fn dump(&self, table: &str) -> Result<Vec<Row>> {
        let table = self.table(table)?;
        let columns = Arc::new(ColumnInfo::new(table.def.column_names()));
        Ok(table
            .rows
            .iter()
            .map(|row| Row::with_columns(Arc::clone(&columns), row.values.clone()))
            .collect())
    }

    /// Run a SELECT: joins, filter, grouping, having, ordering, distinct, limit.
    pub fn select(&self, select: &SelectStatement, params: &[Value], today: Date) -> Result<Vec<Row>> {
        let env = Env { params, today };
        let base = self.table(&select.from.table)?;
        let mut frames: Vec<Vec<Binding<'_>>> = base
            .rows
            .iter()
            .map(|row| {
                vec![Binding {
                    alias: &select.from.alias,
                    def: &base.def,
                    values: Some(&row.values),
                }]
            })
            .collect();

        for join in &select.joins {
            let joined = self.table(&join.table.table)?;
            let mut next = Vec::new();
            for frame in frames {
                let mut matched = false;
                for row in &joined.rows {
                    let mut candidate = frame.clone();
                    candidate.push(Binding {
                        alias: &join.table.alias,
                        def: &joined.def,
                        values: Some(&row.values),
                    });
                    if is_true(&eval_row(&join.on, &candidate, &env, &[])?)? {
                        next.push(candidate);
                        matched = true;
                    }
                }
                if !matched && join.kind == JoinKind::Left {
                    let mut candidate = frame;
                    candidate.push(Binding {
                        alias: &join.table.alias,
                        def: &joined.def,
                        values: None,
                    });
                    next.push(candidate);
                }
            }
            frames = next;
        }

        if let Some(filter) = &select.filter {
            let mut kept = Vec::with_capacity(frames.len());
            for frame in frames {
                if is_true(&eval_row(filter, &frame, &env, &[])?)? {
                    kept.push(frame);
                }
            }
            frames = kept;
        }

        let grouped = !select.group_by.is_empty()
            || select.having.is_some()
            || select.columns.iter().any(|item| item.expr.is_aggregate());

        // (output values, sort keys)
        let mut results: Vec<(Vec<(String, Value)>, Vec<Value>)> = Vec::new();
        if grouped {
            let mut groups: Vec<(Vec<Value>, Vec<Vec<Binding<'_>>>)> = Vec::new();
            for frame in frames {
                let mut key = Vec::with_capacity(select.group_by.len());
                for expr in &select.group_by {
                    key.push(eval_row(expr, &frame, &env, &[])?);
                }
                match groups.iter_mut().find(|(existing, _)| same_key(existing, &key)) {
                    Some((_, members)) => members.push(frame),
                    None => groups.push((key, vec![frame])),
                }
            }
            if groups.is_empty() && select.group_by.is_empty() {
                groups.push((Vec::new(), Vec::new()));
            }
            for (_, members) in &groups {
                let mut outputs = Vec::with_capacity(select.columns.len());
                for item in &select.columns {
                    let value = eval_group(&item.expr, members, &env, &outputs)?;
                    outputs.push((item.alias.clone(), value));
                }
                if let Some(having) = &select.having {
                    if !is_true(&eval_group(having, members, &env, &outputs)?)? {
                        continue;
                    }
                }
                let mut keys = Vec::with_capacity(select.order_by.len());
                for order in &select.order_by {
                    keys.push(eval_group(&order.expr, members, &env, &outputs)?);
                }
                results.push((outputs, keys));
            }
        } else {
            for frame in &frames {
                let mut outputs = Vec::with_capacity(select.columns.len());
                for item in &select.columns {
                    let value = eval_row(&item.expr, frame, &env, &outputs)?;
                    outputs.push((item.alias.clone(), value));
                }
                let mut keys = Vec::with_capacity(select.order_by.len());
                for order in &select.order_by {
                    keys.push(eval_row(&order.expr, frame, &env, &outputs)?);
                }
                results.push((outputs, keys));
            }
        }

        // Stable: ties keep storage order.
        results.sort_by(|(_, a), (_, b)| {
            for ((left, right), order) in a.iter().zip(b).zip(&select.order_by) {
                let ordering = match order.direction {
                    OrderDirection::Asc => left.sort_cmp(right),
                    OrderDirection::Desc => right.sort_cmp(left),
                };
                if ordering.is_ne() {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });

        let mut rows: Vec<Vec<Value>> = Vec::with_capacity(results.len());
        for (outputs, _) in results {
            let values: Vec<Value> = outputs.into_iter().map(|(_, value)| value).collect();
            if select.distinct && rows.iter().any(|existing| same_key(existing, &values)) {
                continue;
            }
            rows.push(values);
        }
        if let Some(limit) = select.limit {
            rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }

        let columns = Arc::new(ColumnInfo::new(
            select.columns.iter().map(|item| item.alias.clone()).collect(),
        ));
        Ok(rows
            .into_iter()
            .map(|values| Row::with_columns(Arc::clone(&columns), values))
            .collect())
    }
}

/// Grouping/distinct equality: NULLs are equal to each other.
fn same_key(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(x, y)| (x.is_null() && y.is_null()) || x.same_as(y))
}
