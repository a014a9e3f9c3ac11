//! Caller-supplied sort specifications.

use reel_core::{Expr, OrderBy, OrderDirection};

/// An ordered list of field paths and directions.
///
/// ```ignore
/// let sort = Sort::desc("year").then_asc("title");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sort {
    orders: Vec<OrderBy>,
}

impl Sort {
    /// No ordering.
    pub fn unsorted() -> Self {
        Self::default()
    }

    pub fn asc(path: &str) -> Self {
        Self::unsorted().then_asc(path)
    }

    pub fn desc(path: &str) -> Self {
        Self::unsorted().then_desc(path)
    }

    #[must_use]
    pub fn then_asc(mut self, path: &str) -> Self {
        self.orders.push(OrderBy::asc(Expr::path(path)));
        self
    }

    #[must_use]
    pub fn then_desc(mut self, path: &str) -> Self {
        self.orders.push(OrderBy::desc(Expr::path(path)));
        self
    }

    #[must_use]
    pub fn then(mut self, path: &str, direction: OrderDirection) -> Self {
        self.orders.push(OrderBy {
            expr: Expr::path(path),
            direction,
        });
        self
    }

    /// Append another sort's terms after this one's.
    #[must_use]
    pub fn and(mut self, other: Sort) -> Self {
        self.orders.extend(other.orders);
        self
    }

    pub fn is_unsorted(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn orders(&self) -> &[OrderBy] {
        &self.orders
    }

    pub fn into_orders(self) -> Vec<OrderBy> {
        self.orders
    }
}
