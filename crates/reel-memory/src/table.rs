//! Table definitions derived from the metadata registry.

use reel_core::{
    Error, Formula, IdGeneration, QueryError, QueryErrorKind, Registry, Result, SqlType, Value,
};

#[derive(Debug, Clone)]
pub(crate) struct ColumnDef {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub max_length: Option<usize>,
    pub unique: bool,
    /// Generated column, recomputed on every write.
    pub derived: Option<Formula>,
    /// Table whose identity this column references.
    pub references: Option<String>,
}

impl ColumnDef {
    fn new(name: &str, sql_type: SqlType) -> Self {
        Self {
            name: name.to_string(),
            sql_type,
            nullable: false,
            max_length: None,
            unique: false,
            derived: None,
            references: None,
        }
    }

    fn references(mut self, table: &str) -> Self {
        self.references = Some(table.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct IdentityColumn {
    pub index: usize,
    /// Filled from the table counter when an insert omits it.
    pub auto: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub identity: Option<IdentityColumn>,
    /// Sequence feeding the identity, if any.
    pub sequence: Option<String>,
    /// Composite unique keys (column indexes).
    pub unique_sets: Vec<Vec<usize>>,
}

impl TableDef {
    pub fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == column)
    }

    pub fn column_index(&self, column: &str) -> Result<usize> {
        self.index_of(column).ok_or_else(|| {
            let mut err = QueryError::new(
                QueryErrorKind::NotFound,
                format!("column {} does not exist on {}", column, self.name),
            );
            err.table = Some(self.name.clone());
            err.column = Some(column.to_string());
            Error::Query(err)
        })
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Bring `value` to the column's storage width.
    pub fn coerce(&self, index: usize, value: Value) -> Value {
        match (self.columns[index].sql_type, value) {
            (SqlType::BigInt, Value::Int(v)) => Value::BigInt(i64::from(v)),
            (SqlType::Integer, Value::BigInt(v)) => {
                i32::try_from(v).map_or(Value::BigInt(v), Value::Int)
            }
            (SqlType::Double, Value::Int(v)) => Value::Double(f64::from(v)),
            #[allow(clippy::cast_precision_loss)]
            (SqlType::Double, Value::BigInt(v)) => Value::Double(v as f64),
            (_, other) => other,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StoredRow {
    pub rowid: u64,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone)]
pub(crate) struct Table {
    pub def: TableDef,
    pub rows: Vec<StoredRow>,
    pub next_id: i64,
    pub next_rowid: u64,
}

impl Table {
    fn new(def: TableDef) -> Self {
        Self {
            def,
            rows: Vec::new(),
            next_id: 1,
            next_rowid: 1,
        }
    }

    pub fn identity_of(&self, row: &StoredRow) -> Option<i64> {
        self.def
            .identity
            .and_then(|identity| row.values[identity.index].as_i64())
    }

    pub fn max_identity(&self) -> Option<i64> {
        self.rows.iter().filter_map(|row| self.identity_of(row)).max()
    }
}

/// Build one table per entity, join table and element collection.
pub(crate) fn tables_from_registry(registry: &Registry) -> Result<(Vec<Table>, Vec<String>)> {
    let mut tables = Vec::new();
    let mut sequences = Vec::new();

    for schema in registry.entities() {
        let mut columns = vec![ColumnDef {
            unique: true,
            ..ColumnDef::new(schema.identity.column, SqlType::BigInt)
        }];
        for field in &schema.fields {
            columns.push(ColumnDef {
                name: field.column.to_string(),
                sql_type: field.sql_type,
                nullable: field.nullable,
                max_length: field.max_length,
                unique: field.unique,
                derived: field.derived,
                references: None,
            });
        }
        for edge in schema.foreign_keys() {
            let target = registry.describe(edge.target)?;
            if let Some(column) = edge.fk_column() {
                columns.push(ColumnDef {
                    nullable: edge.fk_nullable(),
                    ..ColumnDef::new(column, SqlType::BigInt).references(target.table)
                });
            }
        }
        let sequence = match schema.identity.generation {
            IdGeneration::Identity => None,
            IdGeneration::Sequence(name) => {
                sequences.push(name.to_string());
                Some(name.to_string())
            }
        };
        tables.push(Table::new(TableDef {
            name: schema.table.to_string(),
            columns,
            identity: Some(IdentityColumn {
                index: 0,
                auto: sequence.is_none(),
            }),
            sequence,
            unique_sets: Vec::new(),
        }));

        for edge in &schema.edges {
            if let Some((table, owner_column, target_column)) = edge.join_table() {
                let target = registry.describe(edge.target)?;
                tables.push(Table::new(TableDef {
                    name: table.to_string(),
                    columns: vec![
                        ColumnDef::new(owner_column, SqlType::BigInt).references(schema.table),
                        ColumnDef::new(target_column, SqlType::BigInt).references(target.table),
                    ],
                    identity: None,
                    sequence: None,
                    unique_sets: vec![vec![0, 1]],
                }));
            }
        }

        for collection in &schema.elements {
            tables.push(Table::new(TableDef {
                name: collection.table.to_string(),
                columns: vec![
                    ColumnDef::new(collection.owner_column, SqlType::BigInt)
                        .references(schema.table),
                    ColumnDef::new(collection.value_column, collection.sql_type),
                ],
                identity: None,
                sequence: None,
                unique_sets: vec![vec![0, 1]],
            }));
        }
    }
    Ok((tables, sequences))
}
