//! Read-only projections of [`Movie`](crate::Movie) rows.
//!
//! Projections are plain values: they never enter a session's identity map
//! and are never written back.

use reel_core::{Expr, Result};
use reel_query::{Projection, Tuple};
use serde::Serialize;

/// Title, running time and age in years of a movie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TitleDurationAge {
    pub title: String,
    pub duration: Option<i32>,
    pub age: i32,
}

impl Projection for TitleDurationAge {
    fn columns() -> Vec<(&'static str, Expr)> {
        vec![
            ("title", Expr::path("title")),
            ("duration", Expr::path("duration")),
            ("age", Expr::current_year().sub(Expr::path("year"))),
        ]
    }

    fn from_tuple(tuple: &Tuple) -> Result<Self> {
        Ok(Self {
            title: tuple.get(0)?,
            duration: tuple.get(1)?,
            age: tuple.get(2)?,
        })
    }
}

/// Per-director totals: number of movies and their summed running time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectorStats {
    pub name: String,
    pub movie_count: i64,
    /// Minutes; movies without a duration count as zero.
    pub duration_total: i64,
}

impl Projection for DirectorStats {
    fn columns() -> Vec<(&'static str, Expr)> {
        vec![
            ("name", Expr::path("director.name")),
            ("movie_count", Expr::count_star()),
            (
                "duration_total",
                Expr::coalesce(vec![Expr::path("duration").sum(), Expr::lit(0_i64)]),
            ),
        ]
    }

    fn from_tuple(tuple: &Tuple) -> Result<Self> {
        Ok(Self {
            name: tuple.get(0)?,
            movie_count: tuple.get(1)?,
            duration_total: tuple.get(2)?,
        })
    }
}
