//! The executor seam between the persistence core and a store.
//!
//! The core never speaks a SQL dialect itself: it hands dialect-neutral
//! [`Statement`]s plus positional parameters to an [`Executor`]. All
//! operations integrate with asupersync's structured concurrency via `Cx`
//! for cancellation.

use asupersync::{Cx, Outcome};

use crate::error::Result;
use crate::row::Row;
use crate::statement::Statement;
use crate::value::Value;

/// Result of a write statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    /// Identity generated by the store for an INSERT with `returning`.
    pub generated_id: Option<i64>,
}

/// A single-pass sequence of rows.
///
/// Produced lazily by the executor; it cannot be restarted.
pub struct RowStream {
    inner: Box<dyn Iterator<Item = Result<Row>> + Send>,
}

impl RowStream {
    pub fn new(inner: impl Iterator<Item = Result<Row>> + Send + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    /// Stream over rows that are already materialized.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self::new(rows.into_iter().map(Ok))
    }
}

impl Iterator for RowStream {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl std::fmt::Debug for RowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream").finish_non_exhaustive()
    }
}

/// Runs parameterized statements against a store.
///
/// Transactions are connection-scoped: `begin` opens one, `savepoint`
/// nests inside it, `commit`/`rollback` end it.
pub trait Executor: Send + Sync {
    /// Execute an INSERT, UPDATE or DELETE.
    fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<ExecResult, crate::Error>> + Send;

    /// Execute a SELECT and return all rows.
    fn query(
        &self,
        cx: &Cx,
        statement: &Statement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Execute a SELECT and return its rows as a single-pass stream.
    fn query_stream(
        &self,
        cx: &Cx,
        statement: &Statement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<RowStream, crate::Error>> + Send {
        async move {
            match self.query(cx, statement, params).await {
                Outcome::Ok(rows) => Outcome::Ok(RowStream::from_rows(rows)),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
    }

    /// Draw the next value of a named sequence.
    fn next_sequence_value(
        &self,
        cx: &Cx,
        sequence: &str,
    ) -> impl Future<Output = Outcome<i64, crate::Error>> + Send;

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    fn savepoint(
        &self,
        cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    fn rollback_to(
        &self,
        cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    fn release(
        &self,
        cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;
}

/// Unwrap an `Outcome`, returning early from the enclosing function on
/// anything but `Ok`.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(e) => return $crate::Outcome::Err(e),
            $crate::Outcome::Cancelled(r) => return $crate::Outcome::Cancelled(r),
            $crate::Outcome::Panicked(p) => return $crate::Outcome::Panicked(p),
        }
    };
}

/// Unwrap a `Result` inside a function returning `Outcome`.
#[macro_export]
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(e) => return $crate::Outcome::Err(::std::convert::From::from(e)),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_stream_is_single_pass() {
        let rows = vec![
            Row::new(vec!["id".into()], vec![Value::BigInt(1)]),
            Row::new(vec!["id".into()], vec![Value::BigInt(2)]),
        ];
        let mut stream = RowStream::from_rows(rows);
        assert_eq!(
            stream.next().unwrap().unwrap().get_named::<i64>("id").unwrap(),
            1
        );
        assert_eq!(stream.by_ref().count(), 1);
        assert!(stream.next().is_none());
    }

    fn doubled(input: Outcome<i32, crate::Error>) -> Outcome<i32, crate::Error> {
        let v = crate::try_outcome!(input);
        let parsed: i32 = crate::try_result!("3".parse::<i32>().map_err(|e| {
            crate::Error::Custom(e.to_string())
        }));
        Outcome::Ok(v * 2 + parsed)
    }

    #[test]
    fn outcome_macros_short_circuit() {
        assert!(matches!(doubled(Outcome::Ok(2)), Outcome::Ok(7)));
        assert!(matches!(
            doubled(Outcome::Err(crate::Error::Cancelled)),
            Outcome::Err(crate::Error::Cancelled)
        ));
    }
}
