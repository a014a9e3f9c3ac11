//! Grouped aggregate queries.

use std::marker::PhantomData;

use reel_core::{Entity, Expr, OrderBy, Registry, Result, SelectItem, Statement};

use crate::compile::PathCompiler;
use crate::projection::{Projection, projection_columns};

/// A group-by specification over entity `T` whose rows map to a projection.
///
/// Without an explicit ordering, results are ordered by the first aggregate
/// column of the projection, descending, then by the group keys.
///
/// ```ignore
/// let stats = Aggregate::<Movie>::new()
///     .group_by(Expr::path("director.name"))
///     .having(Expr::count_star().ge(2));
/// let rows: Vec<DirectorStats> = session.aggregate(cx, &stats).await;
/// ```
#[derive(Debug)]
pub struct Aggregate<T: Entity> {
    filter: Option<Expr>,
    group_by: Vec<Expr>,
    having: Option<Expr>,
    order_by: Vec<OrderBy>,
    limit: Option<u64>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> Aggregate<T> {
    pub fn new() -> Self {
        Self {
            filter: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn filter(mut self, predicate: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }

    #[must_use]
    pub fn group_by(mut self, key: Expr) -> Self {
        self.group_by.push(key);
        self
    }

    /// Keep only groups satisfying `predicate`, e.g. a count threshold.
    #[must_use]
    pub fn having(mut self, predicate: Expr) -> Self {
        self.having = Some(match self.having.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }

    /// Order groups explicitly; `Expr::alias` names a projection column.
    #[must_use]
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Compile to a statement whose rows map onto projection `P`.
    pub fn compile<P: Projection>(&self, registry: &Registry) -> Result<Statement> {
        let root = registry.describe_type::<T>()?;
        let mut compiler = PathCompiler::new(registry, root);
        let declared = projection_columns::<P>();

        let mut columns = Vec::with_capacity(declared.len());
        for (alias, expr) in &declared {
            columns.push(SelectItem {
                expr: compiler.rewrite(expr.clone())?,
                alias: alias.clone(),
            });
        }
        let group_by = self
            .group_by
            .iter()
            .map(|key| compiler.rewrite(key.clone()))
            .collect::<Result<Vec<_>>>()?;
        let filter = self
            .filter
            .clone()
            .map(|f| compiler.rewrite(f))
            .transpose()?;
        let having = self
            .having
            .clone()
            .map(|h| compiler.rewrite(h))
            .transpose()?;

        let mut order_by = self
            .order_by
            .iter()
            .map(|o| {
                Ok(OrderBy {
                    expr: compiler.rewrite(o.expr.clone())?,
                    direction: o.direction,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if order_by.is_empty() {
            if let Some((alias, _)) = declared.iter().find(|(_, expr)| expr.is_aggregate()) {
                order_by.push(Expr::alias(alias.clone()).desc());
            }
        }
        order_by.extend(group_by.iter().cloned().map(OrderBy::asc));

        let mut select = compiler.finish(columns);
        select.filter = filter;
        select.group_by = group_by;
        select.having = having;
        select.order_by = order_by;
        select.limit = self.limit;
        tracing::trace!(entity = T::NAME, groups = select.group_by.len(), "Compiled aggregate");
        Ok(Statement::Select(select))
    }
}

impl<T: Entity> Default for Aggregate<T> {
    fn default() -> Self {
        Self::new()
    }
}
