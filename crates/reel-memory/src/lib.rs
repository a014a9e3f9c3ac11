//! In-memory relational executor for reel.
//!
//! `reel-memory` implements the `Executor` trait from `reel-core` over a
//! store that lives entirely in process memory. Tables are derived from a
//! metadata [`Registry`](reel_core::Registry): one per entity, join table and
//! element collection.
//!
//! # Role In The Architecture
//!
//! - Enforces the constraints a relational store would: NOT NULL, length
//!   bounds, uniqueness and foreign keys, reporting each with its SQLSTATE
//! - Computes derived columns on every write and rejects writes to them
//! - Evaluates the dialect-neutral statement AST, including joins, grouping
//!   and three-valued logic
//! - Supports transactions and named savepoints per connection
//!
//! # Example
//!
//! ```ignore
//! let store = MemoryStore::from_registry(&registry)?;
//! store.seed_json(include_str!("fixtures.json"))?;
//! let conn = store.connect();
//! let rows = conn.query(&cx, &statement, &[]).await;
//! ```

mod config;
mod database;
mod eval;
mod store;
mod table;

pub use config::MemoryStoreConfig;
pub use store::{MemoryConnection, MemoryStore};

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use reel_core::{
        ConstraintKind, Cx, Date, EdgeSchema, ElementCollectionSchema, Entity, EntitySchema,
        Error, Executor, Expr, FieldSchema, Formula, IdGeneration, IdentitySchema, Join,
        JoinKind, Outcome, Registry, Result, SelectStatement, SqlType, Statement, TableRef, Value,
        unknown_field,
    };

    macro_rules! bare_entity {
        ($ty:ident, $name:literal) => {
            #[derive(Debug, Default)]
            struct $ty;

            impl Entity for $ty {
                const NAME: &'static str = $name;

                fn schema() -> EntitySchema {
                    EntitySchema::new($name, $name, IdentitySchema::new("id", IdGeneration::Identity))
                }

                fn identity(&self) -> Option<i64> {
                    None
                }

                fn set_identity(&mut self, _identity: Option<i64>) {}

                fn scalars(&self) -> Vec<(&'static str, Value)> {
                    Vec::new()
                }

                fn set_scalar(&mut self, field: &str, _value: Value) -> Result<()> {
                    Err(unknown_field(Self::NAME, field))
                }
            }
        };
    }

    bare_entity!(Film, "film");
    bare_entity!(Person, "person");

    fn registry() -> Registry {
        let person = EntitySchema::new(
            "person",
            "person",
            IdentitySchema::new("id", IdGeneration::Sequence("person_seq")),
        )
        .field(FieldSchema::new("name", SqlType::Text).max_length(20).unique())
        .field(FieldSchema::new("birthdate", SqlType::Date).nullable())
        .field(FieldSchema::new("birth_year", SqlType::Integer).derived(Formula::YearOf("birthdate")));
        let film = EntitySchema::new("film", "film", IdentitySchema::new("id", IdGeneration::Identity))
            .field(FieldSchema::new("title", SqlType::Text))
            .field(FieldSchema::new("year", SqlType::Integer))
            .edge(EdgeSchema::many_to_one("director", "person", "director_id"))
            .edge(EdgeSchema::many_to_many(
                "cast",
                "person",
                "film_cast",
                "film_id",
                "person_id",
            ))
            .element_collection(ElementCollectionSchema::new(
                "tags",
                "film_tags",
                "film_id",
                "tag",
                SqlType::Text,
            ));
        Registry::builder()
            .register_with::<Person>(person)
            .register_with::<Film>(film)
            .build()
            .unwrap()
    }

    const FIXTURES: &str = r#"{
        "person": [
            {"id": 1, "name": "Ridley", "birthdate": "1937-11-30"},
            {"id": 2, "name": "Sigourney", "birthdate": "1949-10-08"}
        ],
        "film": [
            {"id": 1, "title": "Alien", "year": 1979, "director_id": 1},
            {"id": 2, "title": "Gladiator", "year": 2000, "director_id": 1},
            {"id": 3, "title": "Unknown", "year": 1990, "director_id": null}
        ],
        "film_cast": [{"film_id": 1, "person_id": 2}],
        "film_tags": [{"film_id": 1, "tag": "space"}, {"film_id": 1, "tag": "horror"}]
    }"#;

    fn store() -> MemoryStore {
        let store = MemoryStore::with_config(&registry(), MemoryStoreConfig::new().current_year(2020))
            .unwrap();
        assert_eq!(store.seed_json(FIXTURES).unwrap(), 8);
        store
    }

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
        match outcome {
            Outcome::Err(e) => e,
            Outcome::Ok(_) => panic!("expected an error"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn insert(table: &str, columns: &[&str], returning: Option<&str>) -> Statement {
        Statement::Insert {
            table: table.to_string(),
            columns: columns.iter().map(ToString::to_string).collect(),
            returning: returning.map(str::to_string),
        }
    }

    fn titles(store: &MemoryStore) -> Vec<String> {
        store
            .rows("film")
            .unwrap()
            .iter()
            .map(|row| row.get_named::<String>("title").unwrap())
            .collect()
    }

    #[test]
    fn seeding_computes_derived_columns_and_advances_counters() {
        let store = store();
        let people = store.rows("person").unwrap();
        assert_eq!(people[0].get_named::<i32>("birth_year").unwrap(), 1937);
        assert_eq!(store.row_count("film_tags").unwrap(), 2);

        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let conn = store.connect();
            assert_eq!(unwrap_outcome(conn.next_sequence_value(&cx, "person_seq").await), 3);

            let result = unwrap_outcome(
                conn.execute(
                    &cx,
                    &insert("film", &["title", "year"], Some("id")),
                    &[Value::from("Prometheus"), Value::Int(2012)],
                )
                .await,
            );
            assert_eq!(result.generated_id, Some(4));
        });
    }

    #[test]
    fn seeding_rejects_dangling_foreign_keys() {
        let store = MemoryStore::from_registry(&registry()).unwrap();
        let err = store
            .seed_json(r#"{"film": [{"id": 1, "title": "Orphan", "year": 2009, "director_id": 7}]}"#)
            .unwrap_err();
        assert_eq!(err.constraint_kind(), Some(ConstraintKind::ForeignKey));
        assert_eq!(store.row_count("film").unwrap(), 0);
    }

    #[test]
    fn constraint_violations_carry_sqlstate() {
        let store = store();
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let conn = store.connect();
            let person = insert("person", &["id", "name"], None);

            let err = expect_err(conn.execute(&cx, &person, &[Value::BigInt(9), Value::Null]).await);
            assert_eq!(err.sqlstate(), Some("23502"));

            let long = "x".repeat(21);
            let err = expect_err(
                conn.execute(&cx, &person, &[Value::BigInt(9), Value::from(long)]).await,
            );
            assert_eq!(err.sqlstate(), Some("22001"));

            let err = expect_err(
                conn.execute(&cx, &person, &[Value::BigInt(9), Value::from("Ridley")]).await,
            );
            assert_eq!(err.sqlstate(), Some("23505"));

            let err = expect_err(
                conn.execute(
                    &cx,
                    &insert("film_cast", &["film_id", "person_id"], None),
                    &[Value::BigInt(1), Value::BigInt(2)],
                )
                .await,
            );
            assert_eq!(err.sqlstate(), Some("23505"));

            let derived = insert("person", &["id", "name", "birth_year"], None);
            let err = expect_err(
                conn.execute(
                    &cx,
                    &derived,
                    &[Value::BigInt(9), Value::from("Zoe"), Value::Int(1990)],
                )
                .await,
            );
            assert!(matches!(err, Error::Query(_)));

            let delete = Statement::Delete {
                table: "person".into(),
                filter: Expr::col("id").eq(Expr::placeholder(1)),
            };
            let err = expect_err(conn.execute(&cx, &delete, &[Value::BigInt(1)]).await);
            assert_eq!(err.sqlstate(), Some("23503"));
        });
        assert_eq!(store.row_count("person").unwrap(), 2);
    }

    #[test]
    fn updates_recompute_derived_columns() {
        let store = store();
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let conn = store.connect();
            let update = Statement::Update {
                table: "person".into(),
                columns: vec!["birthdate".into()],
                filter: Expr::col("id").eq(Expr::placeholder(2)),
            };
            let result = unwrap_outcome(
                conn.execute(
                    &cx,
                    &update,
                    &[Value::Date(Date::from_ymd(1950, 1, 2).unwrap()), Value::BigInt(2)],
                )
                .await,
            );
            assert_eq!(result.rows_affected, 1);

            let missing = unwrap_outcome(
                conn.execute(&cx, &update, &[Value::Null, Value::BigInt(99)]).await,
            );
            assert_eq!(missing.rows_affected, 0);
        });
        let people = store.rows("person").unwrap();
        assert_eq!(people[1].get_named::<i32>("birth_year").unwrap(), 1950);
    }

    #[test]
    fn rollback_and_savepoints_restore_rows() {
        let store = store();
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let conn = store.connect();
            let film = insert("film", &["title", "year"], Some("id"));

            unwrap_outcome(conn.begin(&cx).await);
            assert!(matches!(conn.begin(&cx).await, Outcome::Err(_)));
            unwrap_outcome(conn.execute(&cx, &film, &[Value::from("A"), Value::Int(1)]).await);
            unwrap_outcome(conn.savepoint(&cx, "flush").await);
            unwrap_outcome(conn.execute(&cx, &film, &[Value::from("B"), Value::Int(2)]).await);
            let delete = Statement::Delete {
                table: "film".into(),
                filter: Expr::col("title").eq("Alien"),
            };
            unwrap_outcome(conn.execute(&cx, &delete, &[]).await);
            assert_eq!(store.row_count("film").unwrap(), 4);

            unwrap_outcome(conn.rollback_to(&cx, "flush").await);
            assert_eq!(titles(&store), ["Alien", "Gladiator", "Unknown", "A"]);
            unwrap_outcome(conn.release(&cx, "flush").await);
            assert!(matches!(conn.rollback_to(&cx, "flush").await, Outcome::Err(_)));

            unwrap_outcome(conn.rollback(&cx).await);
            assert_eq!(titles(&store), ["Alien", "Gladiator", "Unknown"]);
            assert!(matches!(conn.commit(&cx).await, Outcome::Err(_)));
        });
    }

    #[test]
    fn dropping_a_connection_rolls_back() {
        let store = store();
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let conn = store.connect();
            unwrap_outcome(conn.begin(&cx).await);
            let delete = Statement::Delete {
                table: "film_tags".into(),
                filter: Expr::col("film_id").eq(1_i64),
            };
            let result = unwrap_outcome(conn.execute(&cx, &delete, &[]).await);
            assert_eq!(result.rows_affected, 2);
            drop(conn);
        });
        assert_eq!(store.row_count("film_tags").unwrap(), 2);
    }

    #[test]
    fn select_joins_groups_and_orders() {
        let store = store();
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let conn = store.connect();
            let mut select = SelectStatement::new(TableRef::new("film", "t0"))
                .column(Expr::qualified("t1", "name"), "director")
                .column(Expr::count_star(), "films")
                .column(Expr::current_year().sub(Expr::qualified("t0", "year").min()), "span")
                .order_by(Expr::alias("films").desc());
            select.joins.push(Join {
                kind: JoinKind::Left,
                table: TableRef::new("person", "t1"),
                on: Expr::qualified("t1", "id").eq(Expr::qualified("t0", "director_id")),
            });
            select.group_by.push(Expr::qualified("t1", "name"));

            let rows = unwrap_outcome(conn.query(&cx, &Statement::Select(select), &[]).await);
            assert_eq!(rows.len(), 2);
            assert_eq!(rows[0].get_named::<String>("director").unwrap(), "Ridley");
            assert_eq!(rows[0].get_named::<i64>("films").unwrap(), 2);
            assert_eq!(rows[0].get_named::<i64>("span").unwrap(), 41);
            assert_eq!(rows[1].get_by_name("director"), Some(&Value::Null));

            let like = SelectStatement::new(TableRef::new("film", "t0"))
                .column(Expr::qualified("t0", "title"), "title")
                .filter(Expr::qualified("t0", "title").like("%a%"))
                .order_by(Expr::qualified("t0", "title").asc());
            let rows = unwrap_outcome(conn.query(&cx, &Statement::Select(like), &[]).await);
            let found: Vec<String> = rows
                .iter()
                .map(|r| r.get_named::<String>("title").unwrap())
                .collect();
            assert_eq!(found, ["Gladiator"]);
        });
    }

    #[test]
    fn statements_are_routed_by_kind() {
        let store = store();
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let conn = store.connect();
            let select = Statement::Select(
                SelectStatement::new(TableRef::new("film", "t0"))
                    .column(Expr::qualified("t0", "id"), "id"),
            );
            assert!(matches!(conn.execute(&cx, &select, &[]).await, Outcome::Err(_)));
            let write = insert("film", &["title", "year"], None);
            assert!(matches!(conn.query(&cx, &write, &[]).await, Outcome::Err(_)));
            let err = expect_err(conn.next_sequence_value(&cx, "film_seq").await);
            assert!(matches!(err, Error::Query(_)));
        });
        assert_eq!(store.statement_count(), 2);
        assert_eq!(store.row_count("film").unwrap(), 3);
    }
}
