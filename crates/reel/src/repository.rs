//! Repositories: entity-typed query entry points over a [`Session`].
//!
//! A repository holds no session of its own. Each call borrows the caller's
//! session, so entities it returns are managed there and repeat reads
//! compose with the identity map.

use std::marker::PhantomData;

use reel_core::{
    Cx, Entity, Error, Executor, Expr, Outcome, Ref, Registry, Value, try_outcome, try_result,
};
use reel_query::{Aggregate, Select, Sort};
use reel_session::Session;

use crate::dto::{DirectorStats, TitleDurationAge};
use crate::example::Example;
use crate::finder::{Finder, FinderKind};
use crate::model::Movie;

/// Generic operations for entity type `T`.
#[derive(Debug)]
pub struct Repository<T: Entity> {
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> Default for Repository<T> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T: Entity> Repository<T> {
    /// Fails unless `T` is registered.
    pub fn new(registry: &Registry) -> reel_core::Result<Self> {
        registry.describe_type::<T>()?;
        Ok(Self::default())
    }

    /// Parse a finder over `T`.
    pub fn finder(&self, registry: &Registry, name: &str) -> reel_core::Result<Finder> {
        Finder::parse(registry, T::NAME, name)
    }

    pub async fn find_by_id<E: Executor>(
        &self,
        session: &mut Session<E>,
        cx: &Cx,
        id: i64,
    ) -> Outcome<Option<Ref<T>>, Error> {
        session.find::<T>(cx, id).await
    }

    pub async fn find_all<E: Executor>(
        &self,
        session: &mut Session<E>,
        cx: &Cx,
        sort: Sort,
    ) -> Outcome<Vec<Ref<T>>, Error> {
        session.query(cx, &Select::new().sort(sort)).await
    }

    /// Entities matching `example`.
    pub async fn find_all_by_example<E: Executor>(
        &self,
        session: &mut Session<E>,
        cx: &Cx,
        example: &Example<T>,
        sort: Sort,
    ) -> Outcome<Vec<Ref<T>>, Error> {
        let select = try_result!(example.select(session.registry())).sort(sort);
        session.query(cx, &select).await
    }

    /// Run a `find…By` finder.
    pub async fn find_by<E: Executor>(
        &self,
        session: &mut Session<E>,
        cx: &Cx,
        finder: &Finder,
        args: &[Value],
        sort: Sort,
    ) -> Outcome<Vec<Ref<T>>, Error> {
        if finder.kind() != FinderKind::Find {
            return Outcome::Err(Error::Custom(format!("'{finder}' does not return entities")));
        }
        let select = try_result!(finder.select::<T>(args, sort));
        session.query(cx, &select).await
    }

    /// Run a `count…By` finder.
    pub async fn count_by<E: Executor>(
        &self,
        session: &mut Session<E>,
        cx: &Cx,
        finder: &Finder,
        args: &[Value],
    ) -> Outcome<u64, Error> {
        if finder.kind() != FinderKind::Count {
            return Outcome::Err(Error::Custom(format!("'{finder}' does not count")));
        }
        let select = try_result!(finder.select::<T>(args, Sort::unsorted()));
        session.count(cx, &select).await
    }

    pub async fn count<E: Executor>(
        &self,
        session: &mut Session<E>,
        cx: &Cx,
    ) -> Outcome<u64, Error> {
        session.count(cx, &Select::<T>::new()).await
    }

    /// Register `entity` when it is new, merge it otherwise.
    pub async fn save<E: Executor>(
        &self,
        session: &mut Session<E>,
        cx: &Cx,
        entity: &Ref<T>,
    ) -> Outcome<Ref<T>, Error> {
        if entity.identity().is_none() || session.contains(entity) {
            session.register(cx, entity).await
        } else {
            session.merge(cx, entity).await
        }
    }

    pub async fn delete<E: Executor>(
        &self,
        session: &mut Session<E>,
        cx: &Cx,
        entity: &Ref<T>,
    ) -> Outcome<(), Error> {
        session.remove(cx, entity).await
    }
}

// ============================================================================
// Movies
// ============================================================================

/// Movie queries used by the application.
#[derive(Debug)]
pub struct MovieRepository {
    movies: Repository<Movie>,
    by_director_newest_first: Finder,
    by_director: Finder,
    by_title_and_years: Finder,
}

impl MovieRepository {
    pub fn new(registry: &Registry) -> reel_core::Result<Self> {
        let movies = Repository::new(registry)?;
        Ok(Self {
            by_director_newest_first: movies
                .finder(registry, "findByDirectorNameOrderByYearDesc")?,
            by_director: movies.finder(registry, "findByDirectorName")?,
            by_title_and_years: movies.finder(registry, "findByTitleAndYearBetween")?,
            movies,
        })
    }

    pub fn movies(&self) -> &Repository<Movie> {
        &self.movies
    }

    /// Filmography of a director, most recent first.
    pub async fn find_by_director_name_order_by_year_desc<E: Executor>(
        &self,
        session: &mut Session<E>,
        cx: &Cx,
        name: &str,
    ) -> Outcome<Vec<Ref<Movie>>, Error> {
        let args = [Value::from(name)];
        self.movies
            .find_by(session, cx, &self.by_director_newest_first, &args, Sort::unsorted())
            .await
    }

    /// Filmography of a director in the caller's order.
    pub async fn find_by_director_name<E: Executor>(
        &self,
        session: &mut Session<E>,
        cx: &Cx,
        name: &str,
        sort: Sort,
    ) -> Outcome<Vec<Ref<Movie>>, Error> {
        let args = [Value::from(name)];
        self.movies
            .find_by(session, cx, &self.by_director, &args, sort)
            .await
    }

    /// Movies titled `title` released between `from` and `to`, inclusive.
    pub async fn find_by_title_range_year<E: Executor>(
        &self,
        session: &mut Session<E>,
        cx: &Cx,
        title: &str,
        from: i32,
        to: i32,
    ) -> Outcome<Vec<Ref<Movie>>, Error> {
        let args = [Value::from(title), Value::from(from), Value::from(to)];
        self.movies
            .find_by(session, cx, &self.by_title_and_years, &args, Sort::unsorted())
            .await
    }

    /// Movies of `year`, directors loaded in the same statement.
    pub async fn find_by_year_with_director<E: Executor>(
        &self,
        session: &mut Session<E>,
        cx: &Cx,
        year: i32,
    ) -> Outcome<Vec<Ref<Movie>>, Error> {
        let select = Select::<Movie>::new()
            .fetch("director")
            .filter(Expr::path("year").eq(year));
        session.query(cx, &select).await
    }

    /// Movies released in the last `years` years.
    pub async fn find_released_within<E: Executor>(
        &self,
        session: &mut Session<E>,
        cx: &Cx,
        years: i32,
    ) -> Outcome<Vec<Ref<Movie>>, Error> {
        let select = Select::<Movie>::new()
            .filter(Expr::path("year").ge(Expr::current_year().sub(years)))
            .order_by(Expr::path("year").asc());
        session.query(cx, &select).await
    }

    /// Title, duration and age of every movie lasting at least
    /// `min_duration` minutes.
    pub async fn find_title_duration_age<E: Executor>(
        &self,
        session: &mut Session<E>,
        cx: &Cx,
        min_duration: i32,
    ) -> Outcome<Vec<TitleDurationAge>, Error> {
        let select = Select::<Movie>::new()
            .filter(Expr::path("duration").ge(min_duration))
            .order_by(Expr::path("title").asc());
        session.query_as::<Movie, TitleDurationAge>(cx, &select).await
    }

    /// Directors with at least `min_movies` movies, most prolific first.
    pub async fn find_stat_movie_by_director<E: Executor>(
        &self,
        session: &mut Session<E>,
        cx: &Cx,
        min_movies: i64,
    ) -> Outcome<Vec<DirectorStats>, Error> {
        let aggregate = Aggregate::<Movie>::new()
            .filter(Expr::path("director").is_not_null())
            .group_by(Expr::path("director.id"))
            .group_by(Expr::path("director.name"))
            .having(Expr::count_star().ge(min_movies));
        session
            .aggregate::<Movie, DirectorStats>(cx, &aggregate)
            .await
    }

    pub async fn find_all<E: Executor>(
        &self,
        session: &mut Session<E>,
        cx: &Cx,
        example: &Example<Movie>,
    ) -> Outcome<Vec<Ref<Movie>>, Error> {
        self.movies
            .find_all_by_example(session, cx, example, Sort::unsorted())
            .await
    }

    pub async fn count<E: Executor>(
        &self,
        session: &mut Session<E>,
        cx: &Cx,
    ) -> Outcome<u64, Error> {
        let total = try_outcome!(self.movies.count(session, cx).await);
        tracing::debug!(total, "Counted movies");
        Outcome::Ok(total)
    }
}
