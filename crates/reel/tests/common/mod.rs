//! Shared setup for the movie integration tests.

#![allow(dead_code)]

use asupersync::runtime::RuntimeBuilder;
use reel::prelude::*;
use reel::{MemoryConnection, MemoryStoreConfig};

/// Year the seeded store treats as the current one.
pub const CURRENT_YEAR: i32 = 2020;

pub const MOVIES: &str = include_str!("../fixtures/movies.json");

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error, got a value"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn run<F: std::future::Future>(future: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(future)
}

/// A seeded store and a session over it.
pub fn seeded() -> (MemoryStore, Session<MemoryConnection>) {
    let registry = reel::model::registry().expect("movie registry");
    let store = MemoryStore::with_config(
        &registry,
        MemoryStoreConfig::new().current_year(CURRENT_YEAR),
    )
    .expect("create memory store");
    let seeded = store.seed_json(MOVIES).expect("seed movies");
    assert_eq!(seeded, 40);
    let session = Session::new(store.connect(), registry);
    (store, session)
}

pub fn titles(movies: &[Ref<Movie>]) -> Vec<String> {
    movies.iter().map(|m| m.read().title.clone()).collect()
}

pub fn ids(movies: &[Ref<Movie>]) -> Vec<i64> {
    movies.iter().filter_map(Ref::identity).collect()
}
