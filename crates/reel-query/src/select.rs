//! Entity, tuple and count query specifications.

use std::marker::PhantomData;

use reel_core::{
    Entity, Expr, OrderBy, OrderDirection, Registry, Result, SelectItem, Statement,
};

use crate::compile::{PathCompiler, ROOT_ALIAS, entity_columns};
use crate::projection::{Projection, projection_columns};
use crate::sort::Sort;

/// A predicate/order/limit specification over entity `T`.
///
/// Predicates and orderings name fields by path (`Expr::path("director.name")`).
/// The same specification compiles to any result shape.
///
/// ```ignore
/// let recent = Select::<Movie>::new()
///     .filter(Expr::path("director.name").eq("Ridley Scott"))
///     .order_by(Expr::path("year").desc());
/// let movies = session.query(cx, &recent).await;
/// ```
#[derive(Debug)]
pub struct Select<T: Entity> {
    filter: Option<Expr>,
    order_by: Vec<OrderBy>,
    limit: Option<u64>,
    fetch: Vec<&'static str>,
    _marker: PhantomData<fn() -> T>,
}

/// An entity query ready to execute.
#[derive(Debug, Clone)]
pub struct CompiledSelect {
    pub statement: Statement,
    /// To-one edges whose targets were selected alongside the root, each
    /// under the column prefix `edge.`.
    pub fetched: Vec<&'static str>,
}

/// A count query ready to execute.
#[derive(Debug, Clone)]
pub enum CompiledCount {
    /// Returns one row holding the count in its first column.
    Scalar(Statement),
    /// Returns one row per distinct root entity; count the rows.
    Rows(Statement),
}

impl<T: Entity> Select<T> {
    pub fn new() -> Self {
        Self {
            filter: None,
            order_by: Vec::new(),
            limit: None,
            fetch: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Add a WHERE condition (ANDed with any existing one).
    #[must_use]
    pub fn filter(mut self, predicate: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }

    /// Add an OR WHERE condition.
    #[must_use]
    pub fn or_filter(mut self, predicate: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.or(predicate),
            None => predicate,
        });
        self
    }

    #[must_use]
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    /// Append a caller-supplied sort after the existing ordering.
    #[must_use]
    pub fn sort(mut self, sort: Sort) -> Self {
        self.order_by.extend(sort.into_orders());
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Load the target of a to-one edge in the same statement.
    #[must_use]
    pub fn fetch(mut self, edge: &'static str) -> Self {
        if !self.fetch.contains(&edge) {
            self.fetch.push(edge);
        }
        self
    }

    pub fn predicate(&self) -> Option<&Expr> {
        self.filter.as_ref()
    }

    pub fn orders(&self) -> &[OrderBy] {
        &self.order_by
    }

    fn compile_with(
        &self,
        registry: &Registry,
        columns: impl FnOnce(&mut PathCompiler<'_>) -> Result<Vec<SelectItem>>,
        tiebreak: bool,
    ) -> Result<(reel_core::SelectStatement, bool)> {
        let root = registry.describe_type::<T>()?;
        let mut compiler = PathCompiler::new(registry, root);
        let columns = columns(&mut compiler)?;
        let filter = self
            .filter
            .clone()
            .map(|f| compiler.rewrite(f))
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
        if tiebreak {
            let identity = Expr::qualified(ROOT_ALIAS, root.identity.column);
            if !order_by.iter().any(|o| o.expr == identity) {
                order_by.push(OrderBy {
                    expr: identity,
                    direction: OrderDirection::Asc,
                });
            }
        }
        let fans_out = compiler.fans_out();
        let mut select = compiler.finish(columns);
        select.filter = filter;
        select.order_by = order_by;
        select.limit = self.limit;
        Ok((select, fans_out))
    }

    /// Compile to a statement selecting whole entities.
    ///
    /// Results are ordered by the declared terms, then by identity, so
    /// repeated runs over unchanged data return the same sequence.
    pub fn compile(&self, registry: &Registry) -> Result<CompiledSelect> {
        let root = registry.describe_type::<T>()?;
        let (mut select, fans_out) = self.compile_with(
            registry,
            |compiler| {
                let mut columns = entity_columns(root, ROOT_ALIAS, "");
                for edge in &self.fetch {
                    columns.extend(compiler.fetch(edge)?);
                }
                Ok(columns)
            },
            true,
        )?;
        select.distinct = fans_out;
        Ok(CompiledSelect {
            statement: Statement::Select(select),
            fetched: self.fetch.clone(),
        })
    }

    /// Compile to a statement selecting named expressions.
    pub fn compile_tuple(&self, registry: &Registry, columns: &[(String, Expr)]) -> Result<Statement> {
        let (select, _) = self.compile_with(
            registry,
            |compiler| {
                columns
                    .iter()
                    .map(|(alias, expr)| {
                        Ok(SelectItem {
                            expr: compiler.rewrite(expr.clone())?,
                            alias: alias.clone(),
                        })
                    })
                    .collect()
            },
            true,
        )?;
        Ok(Statement::Select(select))
    }

    /// Compile to a statement selecting the columns of projection `P`.
    pub fn compile_projection<P: Projection>(&self, registry: &Registry) -> Result<Statement> {
        self.compile_tuple(registry, &projection_columns::<P>())
    }

    /// Compile to a statement counting matching entities.
    pub fn compile_count(&self, registry: &Registry) -> Result<CompiledCount> {
        let root = registry.describe_type::<T>()?;
        let identity = Expr::qualified(ROOT_ALIAS, root.identity.column);
        let (mut select, fans_out) = self.compile_with(
            registry,
            |_| {
                Ok(vec![SelectItem {
                    expr: identity.clone(),
                    alias: root.identity.field.to_string(),
                }])
            },
            false,
        )?;
        select.order_by.clear();
        select.limit = None;
        if fans_out {
            select.distinct = true;
            return Ok(CompiledCount::Rows(Statement::Select(select)));
        }
        select.columns = vec![SelectItem {
            expr: Expr::count_star(),
            alias: "count".to_string(),
        }];
        Ok(CompiledCount::Scalar(Statement::Select(select)))
    }
}

impl<T: Entity> Default for Select<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> Clone for Select<T> {
    fn clone(&self) -> Self {
        Self {
            filter: self.filter.clone(),
            order_by: self.order_by.clone(),
            limit: self.limit,
            fetch: self.fetch.clone(),
            _marker: PhantomData,
        }
    }
}
