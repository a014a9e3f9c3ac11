//! The movie domain: [`Movie`], [`Person`] and the registry that maps them.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use reel_core::{
    Association, Cardinality, CascadePolicy, Date, EdgeSchema, ElementCollectionSchema, Entity,
    EntitySchema, Error, FieldSchema, Formula, IdGeneration, IdentitySchema, Inverse, Registry,
    Related, RelatedSet, Result, SqlType, TypeError, Value, unknown_field,
};
use serde::{Deserialize, Serialize};

/// Longest title the `movie` table accepts.
pub const TITLE_MAX_LENGTH: usize = 250;

/// Build the registry holding [`Movie`] and [`Person`].
pub fn registry() -> Result<Registry> {
    Registry::builder()
        .register::<Movie>()
        .register::<Person>()
        .build()
}

// ============================================================================
// Color
// ============================================================================

/// Film stock, stored by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Color {
    Color,
    BlackAndWhite,
}

impl Color {
    pub const ALL: [Color; 2] = [Color::Color, Color::BlackAndWhite];

    pub const fn as_str(self) -> &'static str {
        match self {
            Color::Color => "COLOR",
            Color::BlackAndWhite => "BLACK_AND_WHITE",
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Color {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Color::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| {
                Error::Type(TypeError {
                    expected: "Color",
                    actual: format!("'{s}'"),
                    column: Some("color".to_string()),
                })
            })
    }
}

// ============================================================================
// Movie
// ============================================================================

/// A film, its director and its cast.
#[derive(Debug, Default)]
pub struct Movie {
    pub id: Option<i64>,
    pub title: String,
    pub year: i32,
    /// Running time in minutes.
    pub duration: Option<i32>,
    pub color: Option<Color>,
    /// Kept in memory only.
    pub synopsis: Option<String>,
    pub genres: BTreeSet<String>,
    pub director: Related<Person>,
    pub actors: RelatedSet<Person>,
}

impl Movie {
    pub fn new(title: impl Into<String>, year: i32) -> Self {
        Self {
            title: title.into(),
            year,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_duration(mut self, minutes: i32) -> Self {
        self.duration = Some(minutes);
        self
    }

    #[must_use]
    pub fn with_color(mut self, color: Color) -> Self {
        self.color = Some(color);
        self
    }
}

impl fmt::Display for Movie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.title, self.year)?;
        if let Some(duration) = self.duration {
            write!(f, " {duration} min")?;
        }
        Ok(())
    }
}

impl Entity for Movie {
    const NAME: &'static str = "Movie";

    fn schema() -> EntitySchema {
        EntitySchema::new("Movie", "movie", IdentitySchema::new("id", IdGeneration::Identity))
            .field(
                FieldSchema::new("title", SqlType::Text)
                    .max_length(TITLE_MAX_LENGTH)
                    .empty_as_null(),
            )
            .field(FieldSchema::new("year", SqlType::Integer))
            .field(FieldSchema::new("duration", SqlType::Integer).nullable())
            .field(FieldSchema::new("color", SqlType::Text).nullable())
            .edge(
                EdgeSchema::many_to_one("director", "Person", "director_id")
                    .cascade(CascadePolicy::Persist),
            )
            .edge(EdgeSchema::many_to_many(
                "actors",
                "Person",
                "play",
                "movie_id",
                "person_id",
            ))
            .element_collection(ElementCollectionSchema::new(
                "genres",
                "movie_genres",
                "movie_id",
                "genre",
                SqlType::Text,
            ))
    }

    fn identity(&self) -> Option<i64> {
        self.id
    }

    fn set_identity(&mut self, identity: Option<i64>) {
        self.id = identity;
    }

    fn scalars(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("title", Value::from(&self.title)),
            ("year", Value::from(self.year)),
            ("duration", Value::from(self.duration)),
            ("color", Value::from(self.color.map(Color::as_str))),
        ]
    }

    fn set_scalar(&mut self, field: &str, value: Value) -> Result<()> {
        match field {
            "title" => self.title = Option::<String>::try_from(value)?.unwrap_or_default(),
            "year" => self.year = value.try_into()?,
            "duration" => self.duration = value.try_into()?,
            "color" => {
                self.color = Option::<String>::try_from(value)?
                    .map(|name| name.parse())
                    .transpose()?;
            }
            other => return Err(unknown_field(Self::NAME, other)),
        }
        Ok(())
    }

    fn association(&self, edge: &str) -> Option<&dyn Association> {
        match edge {
            "director" => Some(&self.director),
            "actors" => Some(&self.actors),
            _ => None,
        }
    }

    fn association_mut(&mut self, edge: &str) -> Option<&mut dyn Association> {
        match edge {
            "director" => Some(&mut self.director),
            "actors" => Some(&mut self.actors),
            _ => None,
        }
    }

    fn elements(&self, collection: &str) -> Option<Vec<Value>> {
        match collection {
            "genres" => Some(self.genres.iter().map(Value::from).collect()),
            _ => None,
        }
    }

    fn set_elements(&mut self, collection: &str, values: Vec<Value>) -> Result<()> {
        match collection {
            "genres" => {
                self.genres = values
                    .into_iter()
                    .map(String::try_from)
                    .collect::<Result<_>>()?;
                Ok(())
            }
            other => Err(unknown_field(Self::NAME, other)),
        }
    }
}

// ============================================================================
// Person
// ============================================================================

/// Someone who directs or plays in movies.
///
/// `birth_year` is computed by the store from `birthdate` and has no setter;
/// it is refreshed whenever the person is loaded or flushed.
#[derive(Debug, Default)]
pub struct Person {
    pub id: Option<i64>,
    pub name: String,
    pub birthdate: Option<Date>,
    birth_year: Option<i32>,
    pub directed_movies: Inverse<Movie>,
    pub played_movies: Inverse<Movie>,
}

impl Person {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn born(mut self, birthdate: Date) -> Self {
        self.birthdate = Some(birthdate);
        self
    }

    pub fn birth_year(&self) -> Option<i32> {
        self.birth_year
    }
}

impl fmt::Display for Person {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.birth_year {
            Some(year) => write!(f, "{} ({year})", self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl Entity for Person {
    const NAME: &'static str = "Person";

    fn schema() -> EntitySchema {
        EntitySchema::new(
            "Person",
            "people",
            IdentitySchema::new("id", IdGeneration::Sequence("people_seq")),
        )
        .field(FieldSchema::new("name", SqlType::Text))
        .field(FieldSchema::new("birthdate", SqlType::Date).nullable())
        .field(
            FieldSchema::new("birth_year", SqlType::Integer).derived(Formula::YearOf("birthdate")),
        )
        .edge(EdgeSchema::inverse(
            "directed_movies",
            "Movie",
            Cardinality::OneToMany,
            "director",
        ))
        .edge(EdgeSchema::inverse(
            "played_movies",
            "Movie",
            Cardinality::ManyToMany,
            "actors",
        ))
    }

    fn identity(&self) -> Option<i64> {
        self.id
    }

    fn set_identity(&mut self, identity: Option<i64>) {
        self.id = identity;
    }

    fn scalars(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("name", Value::from(&self.name)),
            ("birthdate", Value::from(self.birthdate)),
            ("birth_year", Value::from(self.birth_year)),
        ]
    }

    fn set_scalar(&mut self, field: &str, value: Value) -> Result<()> {
        match field {
            "name" => self.name = value.try_into()?,
            "birthdate" => self.birthdate = value.try_into()?,
            "birth_year" => self.birth_year = value.try_into()?,
            other => return Err(unknown_field(Self::NAME, other)),
        }
        Ok(())
    }

    fn association(&self, edge: &str) -> Option<&dyn Association> {
        match edge {
            "directed_movies" => Some(&self.directed_movies),
            "played_movies" => Some(&self.played_movies),
            _ => None,
        }
    }

    fn association_mut(&mut self, edge: &str) -> Option<&mut dyn Association> {
        match edge {
            "directed_movies" => Some(&mut self.directed_movies),
            "played_movies" => Some(&mut self.played_movies),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_accepts_the_model() {
        let registry = registry().unwrap();
        let movie = registry.describe_type::<Movie>().unwrap();
        assert_eq!(movie.table, "movie");
        assert!(movie.field_named("synopsis").is_none());
        assert_eq!(
            registry.edge("Movie", "actors").unwrap().join_table(),
            Some(("play", "movie_id", "person_id"))
        );
        assert!(registry.edge("Person", "played_movies").unwrap().is_lazy());
    }

    #[test]
    fn color_is_stored_by_name() {
        let mut movie = Movie::new("Sin City", 2005).with_color(Color::BlackAndWhite);
        assert!(
            movie
                .scalars()
                .contains(&("color", Value::from("BLACK_AND_WHITE")))
        );
        movie.set_scalar("color", Value::from("COLOR")).unwrap();
        assert_eq!(movie.color, Some(Color::Color));
        assert!(movie.set_scalar("color", Value::from("SEPIA")).is_err());
        movie.set_scalar("color", Value::Null).unwrap();
        assert_eq!(movie.color, None);
    }

    #[test]
    fn synopsis_is_not_persistent() {
        let mut movie = Movie::new("Alien", 1979);
        movie.synopsis = Some("In space no one can hear you scream.".into());
        assert!(movie.scalars().iter().all(|(name, _)| *name != "synopsis"));
        assert!(movie.set_scalar("synopsis", Value::from("x")).is_err());
    }

    #[test]
    fn birth_year_has_no_public_setter() {
        let mut person = Person::new("Ridley Scott").born(Date::from_ymd(1937, 11, 30).unwrap());
        assert_eq!(person.birth_year(), None);
        person.set_scalar("birth_year", Value::Int(1937)).unwrap();
        assert_eq!(person.birth_year(), Some(1937));
        assert_eq!(person.to_string(), "Ridley Scott (1937)");
    }
}
