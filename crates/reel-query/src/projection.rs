//! Tuple and projection result shapes.
//!
//! Neither shape is an entity: results are plain values, never tracked by a
//! session and never written back.

use reel_core::{Expr, FromValue, Result, Row, Value};

/// One result row of a tuple query, readable by position or by name.
#[derive(Debug, Clone)]
pub struct Tuple {
    row: Row,
}

impl Tuple {
    pub fn new(row: Row) -> Self {
        Self { row }
    }

    pub fn len(&self) -> usize {
        self.row.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row.is_empty()
    }

    /// Value at `index`, converted.
    pub fn get<T: FromValue>(&self, index: usize) -> Result<T> {
        self.row.get_as(index)
    }

    /// Value of the expression selected as `name`, converted.
    pub fn get_named<T: FromValue>(&self, name: &str) -> Result<T> {
        self.row.get_named(name)
    }

    pub fn value(&self, index: usize) -> Option<&Value> {
        self.row.get(index)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.row.column_names()
    }

    pub fn into_row(self) -> Row {
        self.row
    }
}

impl From<Row> for Tuple {
    fn from(row: Row) -> Self {
        Self::new(row)
    }
}

/// A caller-defined value object built from selected expressions.
///
/// `columns` declares the expressions in order; `from_tuple` receives them
/// in that same order. Mapping is by position, never by name.
///
/// ```ignore
/// struct TitleYear { title: String, year: i32 }
///
/// impl Projection for TitleYear {
///     fn columns() -> Vec<(&'static str, Expr)> {
///         vec![("title", Expr::path("title")), ("year", Expr::path("year"))]
///     }
///
///     fn from_tuple(tuple: &Tuple) -> Result<Self> {
///         Ok(Self { title: tuple.get(0)?, year: tuple.get(1)? })
///     }
/// }
/// ```
pub trait Projection: Sized + Send + 'static {
    fn columns() -> Vec<(&'static str, Expr)>;

    fn from_tuple(tuple: &Tuple) -> Result<Self>;
}

/// Name/expression pairs a projection selects.
pub(crate) fn projection_columns<P: Projection>() -> Vec<(String, Expr)> {
    P::columns()
        .into_iter()
        .map(|(name, expr)| (name.to_string(), expr))
        .collect()
}
