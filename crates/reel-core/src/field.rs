//! Field and column definitions.

use crate::statement::Expr;
use crate::value::Value;

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Boolean,
    Integer,
    BigInt,
    Double,
    Text,
    Date,
}

impl SqlType {
    pub const fn as_sql(self) -> &'static str {
        match self {
            SqlType::Boolean => "BOOLEAN",
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Double => "DOUBLE PRECISION",
            SqlType::Text => "TEXT",
            SqlType::Date => "DATE",
        }
    }

    /// Does `value` fit this column type? NULL fits every type.
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (SqlType::Boolean, Value::Bool(_))
                | (SqlType::Integer | SqlType::BigInt, Value::Int(_) | Value::BigInt(_))
                | (SqlType::Double, Value::Double(_) | Value::Int(_) | Value::BigInt(_))
                | (SqlType::Text, Value::Text(_))
                | (SqlType::Date, Value::Date(_))
        )
    }
}

/// A store-computed expression backing a read-only field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Formula {
    /// Calendar year of a date column.
    YearOf(&'static str),
}

impl Formula {
    /// Expression computing the formula over the row aliased `table`.
    pub fn to_expr(self, table: Option<&str>) -> Expr {
        let column = |name: &str| match table {
            Some(t) => Expr::qualified(t, name),
            None => Expr::col(name),
        };
        match self {
            Formula::YearOf(source) => column(source).year(),
        }
    }
}

/// How an entity's identity is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdGeneration {
    /// Assigned by the store on insert and read back.
    Identity,
    /// Drawn from a named sequence when the entity is registered.
    Sequence(&'static str),
}

/// The identity field of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentitySchema {
    pub field: &'static str,
    pub column: &'static str,
    pub generation: IdGeneration,
}

impl IdentitySchema {
    pub const fn new(field: &'static str, generation: IdGeneration) -> Self {
        Self {
            field,
            column: field,
            generation,
        }
    }

    pub const fn column(mut self, column: &'static str) -> Self {
        self.column = column;
        self
    }
}

/// Metadata about a persistent scalar field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    /// Rust field name
    pub name: &'static str,
    /// Column name (may differ from field name)
    pub column: &'static str,
    pub sql_type: SqlType,
    pub nullable: bool,
    /// Length bound enforced by the store for text columns
    pub max_length: Option<usize>,
    /// Write an empty string as NULL
    pub empty_as_null: bool,
    pub unique: bool,
    /// Read-only, store-computed value
    pub derived: Option<Formula>,
}

impl FieldSchema {
    /// A required field stored in a column of the same name.
    pub const fn new(name: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            column: name,
            sql_type,
            nullable: false,
            max_length: None,
            empty_as_null: false,
            unique: false,
            derived: None,
        }
    }

    pub const fn column(mut self, column: &'static str) -> Self {
        self.column = column;
        self
    }

    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub const fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    pub const fn empty_as_null(mut self) -> Self {
        self.empty_as_null = true;
        self
    }

    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// A nullable field computed by the store and never written.
    pub const fn derived(mut self, formula: Formula) -> Self {
        self.derived = Some(formula);
        self.nullable = true;
        self
    }

    pub const fn is_writable(&self) -> bool {
        self.derived.is_none()
    }

    /// Apply write-side normalization (empty text becomes NULL when flagged).
    pub fn normalize(&self, value: Value) -> Value {
        match value {
            Value::Text(s) if self.empty_as_null && s.is_empty() => Value::Null,
            other => other,
        }
    }
}
