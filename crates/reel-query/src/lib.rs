//! Query specifications and result shapes for reel.
//!
//! `reel-query` is the **query construction layer**. It turns declarative
//! specifications over entity field paths into dialect-neutral statements,
//! resolving paths like `"director.name"` into joins through the metadata
//! registry.
//!
//! # Role In The Architecture
//!
//! - **Entity queries**: [`Select`] compiles to a statement whose rows the
//!   session materializes through its identity map.
//! - **Tuples and projections**: [`Tuple`] and [`Projection`] map selected
//!   expressions by position; they are never managed.
//! - **Aggregates**: [`Aggregate`] adds grouping and a having threshold.
//! - **Sorting**: [`Sort`] carries caller-supplied orderings.
//!
//! Execution lives in `reel-session`; this crate never touches a store.

pub mod aggregate;
pub mod compile;
pub mod projection;
pub mod select;
pub mod sort;

pub use aggregate::Aggregate;
pub use compile::{PathCompiler, ROOT_ALIAS, RowImage, entity_columns};
pub use projection::{Projection, Tuple};
pub use select::{CompiledCount, CompiledSelect, Select};
pub use sort::Sort;

#[cfg(test)]
mod tests {
    use super::*;
    use reel_core::{
        Cardinality, Dialect, EdgeSchema, ElementCollectionSchema, Entity, EntitySchema, Expr,
        FieldSchema, Formula, IdGeneration, IdentitySchema, Registry, Result, Row, SqlType,
        Statement, Value, unknown_field,
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
        let identity = IdentitySchema::new("id", IdGeneration::Identity);
        let film = EntitySchema::new("film", "film", identity)
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
        let person = EntitySchema::new("person", "person", identity)
            .field(FieldSchema::new("name", SqlType::Text))
            .field(FieldSchema::new("birthdate", SqlType::Date).nullable())
            .field(FieldSchema::new("birth_year", SqlType::Integer).derived(Formula::YearOf("birthdate")))
            .edge(EdgeSchema::inverse("directed", "film", Cardinality::OneToMany, "director"))
            .edge(EdgeSchema::inverse("roles", "film", Cardinality::ManyToMany, "cast"));
        Registry::builder()
            .register_with::<Film>(film)
            .register_with::<Person>(person)
            .build()
            .unwrap()
    }

    fn sql(statement: &Statement) -> String {
        statement.to_sql(Dialect::Postgres, 0).0
    }

    fn select_of(statement: &Statement) -> &reel_core::SelectStatement {
        match statement {
            Statement::Select(select) => select,
            other => panic!("expected a SELECT, got {other:?}"),
        }
    }

    #[test]
    fn to_one_paths_share_one_join() {
        let registry = registry();
        let compiled = Select::<Film>::new()
            .filter(Expr::path("director.name").eq("Ridley"))
            .filter(Expr::path("director.birth_year").gt(1930))
            .order_by(Expr::path("year").desc())
            .compile(&registry)
            .unwrap();
        let text = sql(&compiled.statement);
        assert_eq!(text.matches("LEFT JOIN").count(), 1);
        assert!(text.contains("LEFT JOIN \"person\" \"t1\" ON (\"t1\".\"id\" = \"t0\".\"director_id\")"));
        assert!(text.contains("YEAR(\"t1\".\"birthdate\") > $2"));
        assert!(text.ends_with("ORDER BY \"t0\".\"year\" DESC, \"t0\".\"id\" ASC"));
        assert!(!select_of(&compiled.statement).distinct);
        assert!(text.contains("\"t0\".\"director_id\" AS \"director\""));
    }

    #[test]
    fn to_many_paths_make_entity_queries_distinct() {
        let registry = registry();
        let compiled = Select::<Film>::new()
            .filter(Expr::path("cast.name").eq("Sigourney"))
            .compile(&registry)
            .unwrap();
        let text = sql(&compiled.statement);
        assert!(text.starts_with("SELECT DISTINCT"));
        assert!(text.contains(
            "LEFT JOIN \"film_cast\" \"t2\" ON (\"t2\".\"film_id\" = \"t0\".\"id\") \
             LEFT JOIN \"person\" \"t1\" ON (\"t1\".\"id\" = \"t2\".\"person_id\")"
        ));
    }

    #[test]
    fn inverse_paths_walk_the_owning_side() {
        let registry = registry();
        let compiled = Select::<Person>::new()
            .filter(Expr::path("directed.year").lt(1980))
            .filter(Expr::path("roles.title").eq("Alien"))
            .compile(&registry)
            .unwrap();
        let text = sql(&compiled.statement);
        assert!(text.contains("LEFT JOIN \"film\" \"t1\" ON (\"t1\".\"director_id\" = \"t0\".\"id\")"));
        assert!(text.contains(
            "LEFT JOIN \"film_cast\" \"t3\" ON (\"t3\".\"person_id\" = \"t0\".\"id\") \
             LEFT JOIN \"film\" \"t2\" ON (\"t2\".\"id\" = \"t3\".\"film_id\")"
        ));
        assert!(text.contains("YEAR(\"t0\".\"birthdate\") AS \"birth_year\""));
    }

    #[test]
    fn element_collections_join_their_side_table() {
        let registry = registry();
        let statement = Select::<Film>::new()
            .filter(Expr::path("tags").eq("space"))
            .compile(&registry)
            .unwrap()
            .statement;
        let text = sql(&statement);
        assert!(text.contains("LEFT JOIN \"film_tags\" \"t1\" ON (\"t1\".\"film_id\" = \"t0\".\"id\")"));
        assert!(text.contains("WHERE (\"t1\".\"tag\" = $1)"));
    }

    #[test]
    fn fetch_selects_prefixed_target_columns() {
        let registry = registry();
        let compiled = Select::<Film>::new()
            .fetch("director")
            .fetch("director")
            .compile(&registry)
            .unwrap();
        assert_eq!(compiled.fetched, ["director"]);
        let aliases: Vec<_> = select_of(&compiled.statement)
            .columns
            .iter()
            .map(|c| c.alias.as_str())
            .collect();
        assert!(aliases.contains(&"director.name"));
        assert!(aliases.contains(&"director.birth_year"));

        assert!(Select::<Film>::new().fetch("cast").compile(&registry).is_err());
    }

    #[test]
    fn unknown_paths_are_rejected() {
        let registry = registry();
        for path in ["budget", "director.", "director.salary", "tags.name", ".title"] {
            let result = Select::<Film>::new()
                .filter(Expr::path(path).is_null())
                .compile(&registry);
            assert!(result.is_err(), "{path} should not resolve");
        }
    }

    #[test]
    fn counts_use_count_star_unless_rows_fan_out() {
        let registry = registry();
        let count = Select::<Film>::new()
            .filter(Expr::path("year").gt(1990))
            .order_by(Expr::path("title").asc())
            .compile_count(&registry)
            .unwrap();
        match count {
            CompiledCount::Scalar(statement) => {
                let text = sql(&statement);
                assert!(text.starts_with("SELECT COUNT(*) AS \"count\" FROM \"film\" \"t0\""));
                assert!(!text.contains("ORDER BY"));
            }
            CompiledCount::Rows(_) => panic!("expected a scalar count"),
        }

        let count = Select::<Film>::new()
            .filter(Expr::path("cast.name").eq("Sigourney"))
            .compile_count(&registry)
            .unwrap();
        assert!(matches!(count, CompiledCount::Rows(_)));
    }

    struct Output {
        director: Option<String>,
        films: i64,
    }

    impl Projection for Output {
        fn columns() -> Vec<(&'static str, Expr)> {
            vec![
                ("director", Expr::path("director.name")),
                ("films", Expr::count_star()),
                ("latest", Expr::path("year").max()),
            ]
        }

        fn from_tuple(tuple: &Tuple) -> Result<Self> {
            Ok(Self {
                director: tuple.get(0)?,
                films: tuple.get(1)?,
            })
        }
    }

    #[test]
    fn aggregates_default_to_ordering_by_the_first_aggregate() {
        let registry = registry();
        let statement = Aggregate::<Film>::new()
            .group_by(Expr::path("director.name"))
            .having(Expr::count_star().ge(2))
            .compile::<Output>(&registry)
            .unwrap();
        let text = sql(&statement);
        assert!(text.contains("GROUP BY \"t1\".\"name\""));
        assert!(text.contains("HAVING (COUNT(*) >= $1)"));
        assert!(text.ends_with("ORDER BY \"films\" DESC, \"t1\".\"name\" ASC"));

        let output = Output::from_tuple(&Tuple::new(Row::new(
            vec!["director".into(), "films".into(), "latest".into()],
            vec![Value::Null, Value::BigInt(3), Value::Int(2000)],
        )))
        .unwrap();
        assert_eq!(output.director, None);
        assert_eq!(output.films, 3);
    }

    #[test]
    fn tuples_map_declared_columns() {
        let registry = registry();
        let columns = vec![
            ("title".to_string(), Expr::path("title")),
            ("age".to_string(), Expr::current_year().sub(Expr::path("year"))),
        ];
        let statement = Select::<Film>::new()
            .sort(Sort::asc("title"))
            .limit(5)
            .compile_tuple(&registry, &columns)
            .unwrap();
        let text = sql(&statement);
        assert!(text.starts_with(
            "SELECT \"t0\".\"title\" AS \"title\", (YEAR(CURRENT_DATE) - \"t0\".\"year\") AS \"age\""
        ));
        assert!(text.ends_with("ORDER BY \"t0\".\"title\" ASC, \"t0\".\"id\" ASC LIMIT 5"));
    }

    #[test]
    fn row_images_read_prefixed_columns() {
        let registry = registry();
        let person = registry.describe("person").unwrap();
        let row = Row::new(
            vec![
                "director.id".into(),
                "director.name".into(),
                "director.birthdate".into(),
                "director.birth_year".into(),
            ],
            vec![Value::BigInt(4), Value::from("Ridley"), Value::Null, Value::Null],
        );
        let image = RowImage::from_row(&row, person, "director.").unwrap().unwrap();
        assert_eq!(image.identity, 4);
        assert_eq!(image.scalars[0], ("name", Value::from("Ridley")));
        assert!(image.keys.is_empty());

        let missing = Row::new(
            vec![
                "director.id".into(),
                "director.name".into(),
                "director.birthdate".into(),
                "director.birth_year".into(),
            ],
            vec![Value::Null; 4],
        );
        assert!(RowImage::from_row(&missing, person, "director.").unwrap().is_none());
        assert!(RowImage::from_row(&row, person, "").is_err());
    }
}
