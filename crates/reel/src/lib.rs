//! reel - an object-relational persistence core.
//!
//! reel keeps a graph of plain Rust values synchronized with a relational
//! store:
//!
//! - One managed instance per stored row per session (identity map)
//! - Persist and remove cascades across associations that ask for them
//! - Lazy associations that resolve only through their open session
//! - Snapshot-based change detection and ordered, savepoint-guarded flushes
//! - Entity, tuple, projection and aggregate queries over field paths
//!
//! This crate bundles the layers and carries the movie domain used
//! throughout the documentation and tests.
//!
//! # Quick Start
//!
//! ```ignore
//! use reel::prelude::*;
//!
//! let registry = reel::model::registry()?;
//! let store = MemoryStore::from_registry(&registry)?;
//! let mut session = Session::new(store.connect(), registry.clone());
//!
//! let mut movie = Movie::new("Pulp Fiction", 1994).with_duration(154);
//! movie.director.set(Some(&Ref::new(Person::new("Quentin Tarantino"))));
//! let movie = session.register(&cx, &Ref::new(movie)).await?;
//! session.commit(&cx).await?;
//!
//! let repository = MovieRepository::new(&registry)?;
//! let films = repository
//!     .find_by_director_name_order_by_year_desc(&mut session, &cx, "Quentin Tarantino")
//!     .await?;
//! ```

pub use reel_core::{
    AnyRef, Association, Cardinality, CascadePolicy, ConstraintKind, ConstraintViolation, Cx,
    Date, DetachedLazyAccess, Dialect, EdgeSchema, ElementCollectionSchema, Entity, EntitySchema,
    Error, Executor, Expr, FieldSchema, Formula, IdGeneration, IdentitySchema, Inverse,
    NotManaged, OrderBy, OrderDirection, Outcome, Ref, Registry, RegistryBuilder, Related,
    RelatedSet, Result, Row, SqlType, StaleState, Statement, UnpersistedReference,
    ValidationError, Value, WriteKind, try_outcome, try_result,
};
pub use reel_memory::{MemoryConnection, MemoryStore, MemoryStoreConfig};
pub use reel_query::{Aggregate, Projection, Select, Sort, Tuple};
pub use reel_session::{
    EntityState, EntityStream, FlushResult, PendingCounts, ProjectionStream, Session,
    SessionConfig, SessionEvent,
};

pub mod dto;
pub mod example;
pub mod finder;
pub mod model;
pub mod repository;

pub use dto::{DirectorStats, TitleDurationAge};
pub use example::{Example, ExampleMatcher, StringMatcher};
pub use finder::{Finder, FinderKind, Operator};
pub use model::{Color, Movie, Person};
pub use repository::{MovieRepository, Repository};

/// Everything needed to model, persist and query entities.
pub mod prelude {
    pub use crate::{
        // Core types
        Cx,
        Date,
        Entity,
        Error,
        // Queries
        Example,
        ExampleMatcher,
        Expr,
        // Store
        MemoryStore,
        // Domain
        Movie,
        MovieRepository,
        Outcome,
        Person,
        Projection,
        Ref,
        Registry,
        Result,
        Select,
        // Session
        Session,
        SessionConfig,
        Sort,
        StringMatcher,
        Value,
    };
}
