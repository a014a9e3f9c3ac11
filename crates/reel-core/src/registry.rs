//! The metadata registry.
//!
//! Built once at startup from explicit `register::<T>()` calls. Every other
//! component reads entity shape and association semantics from here; nothing
//! inspects entity structs directly.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::Result;
use crate::error::Error;
use crate::model::{AnyRef, Entity, EntitySchema, Ref};
use crate::relationship::{Cardinality, EdgeSchema, JoinSpec, Side};

/// Registered entity type: its schema and an erased constructor.
pub struct EntityMeta {
    pub schema: EntitySchema,
    type_id: TypeId,
    blank: fn() -> AnyRef,
}

impl EntityMeta {
    /// A fresh default instance, used to materialize rows.
    pub fn instantiate(&self) -> AnyRef {
        (self.blank)()
    }

    pub fn is<T: Entity>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl fmt::Debug for EntityMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityMeta")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

fn blank<T: Entity>() -> AnyRef {
    Ref::new(T::default()).erase()
}

/// Collects entity registrations.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    entries: Vec<EntityMeta>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` with the schema it declares.
    #[must_use]
    pub fn register<T: Entity>(self) -> Self {
        self.register_with::<T>(T::schema())
    }

    /// Register `T` with an explicit schema.
    #[must_use]
    pub fn register_with<T: Entity>(mut self, schema: EntitySchema) -> Self {
        self.entries.push(EntityMeta {
            schema,
            type_id: TypeId::of::<T>(),
            blank: blank::<T>,
        });
        self
    }

    /// Validate every registration and freeze the registry.
    #[tracing::instrument(level = "debug", skip(self), fields(entities = self.entries.len()))]
    pub fn build(self) -> Result<Registry> {
        let mut by_name = HashMap::new();
        let mut by_type = HashMap::new();
        let mut tables = HashSet::new();

        for (index, meta) in self.entries.iter().enumerate() {
            let schema = &meta.schema;
            if by_name.insert(schema.name, index).is_some() {
                return Err(Error::config(format!(
                    "entity {} registered twice",
                    schema.name
                )));
            }
            if by_type.insert(meta.type_id, index).is_some() {
                return Err(Error::config(format!(
                    "type of {} registered under two names",
                    schema.name
                )));
            }
            if !tables.insert(schema.table) {
                return Err(Error::config(format!(
                    "table {} is mapped by more than one entity",
                    schema.table
                )));
            }
            check_members(schema)?;
        }

        let registry = Registry {
            inner: Arc::new(RegistryInner {
                entities: self.entries,
                by_name,
                by_type,
            }),
        };
        for meta in &registry.inner.entities {
            for edge in &meta.schema.edges {
                registry.check_edge(&meta.schema, edge)?;
            }
        }
        tracing::debug!(
            entities = registry.inner.entities.len(),
            "Metadata registry built"
        );
        Ok(registry)
    }
}

fn check_members(schema: &EntitySchema) -> Result<()> {
    let name = schema.name;
    if schema.identity.field.is_empty() || schema.identity.column.is_empty() {
        return Err(Error::config(format!("{name} declares no identity field")));
    }

    let mut seen = HashSet::new();
    seen.insert(schema.identity.field);
    let members = schema
        .fields
        .iter()
        .map(|f| f.name)
        .chain(schema.edges.iter().map(|e| e.name))
        .chain(schema.elements.iter().map(|c| c.name));
    for member in members {
        if !seen.insert(member) {
            return Err(Error::config(format!(
                "{name}.{member} is declared more than once"
            )));
        }
    }

    let mut columns = HashSet::new();
    columns.insert(schema.identity.column);
    let owned_columns = schema
        .fields
        .iter()
        .map(|f| f.column)
        .chain(schema.foreign_keys().filter_map(EdgeSchema::fk_column));
    for column in owned_columns {
        if !columns.insert(column) {
            return Err(Error::config(format!(
                "{name} maps column {column} more than once"
            )));
        }
    }

    for field in &schema.fields {
        if field.derived.is_some() && !field.nullable {
            return Err(Error::config(format!(
                "{name}.{} is derived and cannot be required",
                field.name
            )));
        }
    }
    Ok(())
}

struct RegistryInner {
    entities: Vec<EntityMeta>,
    by_name: HashMap<&'static str, usize>,
    by_type: HashMap<TypeId, usize>,
}

/// Immutable, cheaply cloneable metadata registry.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn meta(&self, entity: &str) -> Result<&EntityMeta> {
        self.inner
            .by_name
            .get(entity)
            .map(|&i| &self.inner.entities[i])
            .ok_or_else(|| Error::config(format!("entity {entity} is not registered")))
    }

    pub fn describe(&self, entity: &str) -> Result<&EntitySchema> {
        self.meta(entity).map(|meta| &meta.schema)
    }

    pub fn describe_type<T: Entity>(&self) -> Result<&EntitySchema> {
        self.inner
            .by_type
            .get(&TypeId::of::<T>())
            .map(|&i| &self.inner.entities[i].schema)
            .ok_or_else(|| Error::config(format!("entity {} is not registered", T::NAME)))
    }

    pub fn associations_of(&self, entity: &str) -> Result<&[EdgeSchema]> {
        self.describe(entity).map(|schema| schema.edges.as_slice())
    }

    pub fn edge(&self, entity: &str, edge: &str) -> Result<&EdgeSchema> {
        self.describe(entity)?
            .edge_named(edge)
            .ok_or_else(|| Error::config(format!("{entity} has no association {edge}")))
    }

    /// The owning edge an inverse edge mirrors, or the inverse views that
    /// mirror an owning edge.
    pub fn inverse_of(&self, entity: &str, edge: &str) -> Result<Vec<(&EntitySchema, &EdgeSchema)>> {
        let edge = self.edge(entity, edge)?;
        let target = self.describe(edge.target)?;
        Ok(match edge.mapped_by() {
            Some(mapped_by) => target
                .edge_named(mapped_by)
                .map(|owning| vec![(target, owning)])
                .unwrap_or_default(),
            None => target
                .edges
                .iter()
                .filter(|e| e.target == entity && e.mapped_by() == Some(edge.name))
                .map(|inverse| (target, inverse))
                .collect(),
        })
    }

    /// Entity mapping `table`, if any.
    pub fn by_table(&self, table: &str) -> Option<&EntitySchema> {
        self.entities().find(|schema| schema.table == table)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntitySchema> {
        self.inner.entities.iter().map(|meta| &meta.schema)
    }

    fn check_edge(&self, owner: &EntitySchema, edge: &EdgeSchema) -> Result<()> {
        let here = format!("{}.{}", owner.name, edge.name);
        let target = self.describe(edge.target).map_err(|_| {
            Error::config(format!(
                "{here} targets {} which is not registered",
                edge.target
            ))
        })?;

        match edge.side {
            Side::Owning(JoinSpec::ForeignKey { .. }) => {
                if edge.cardinality != Cardinality::ManyToOne {
                    return Err(Error::config(format!(
                        "{here}: a foreign-key edge must be many-to-one"
                    )));
                }
            }
            Side::Owning(JoinSpec::JoinTable { .. }) => {
                if edge.cardinality != Cardinality::ManyToMany {
                    return Err(Error::config(format!(
                        "{here}: a join-table edge must be many-to-many"
                    )));
                }
                if edge.is_lazy() {
                    return Err(Error::config(format!(
                        "{here}: owning to-many edges must be eager"
                    )));
                }
            }
            Side::Inverse { mapped_by } => {
                if !edge.is_lazy() {
                    return Err(Error::config(format!(
                        "{here}: inverse edges must be lazy"
                    )));
                }
                let owning = target.edge_named(mapped_by).ok_or_else(|| {
                    Error::config(format!(
                        "{here} is mapped by {}.{mapped_by} which does not exist",
                        target.name
                    ))
                })?;
                if !owning.is_owning() || owning.target != owner.name {
                    return Err(Error::config(format!(
                        "{here} is mapped by {}.{mapped_by}, which is not an owning edge to {}",
                        target.name, owner.name
                    )));
                }
                if owning.cardinality.reversed() != edge.cardinality {
                    return Err(Error::config(format!(
                        "{here} is {:?} but {}.{mapped_by} is {:?}",
                        edge.cardinality, target.name, owning.cardinality
                    )));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entities().map(|schema| schema.name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldSchema, Formula, IdGeneration, IdentitySchema, SqlType};
    use crate::model::unknown_field;
    use crate::relationship::{CascadePolicy, Fetch};
    use crate::value::Value;

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
    bare_entity!(Actor, "actor");

    fn identity() -> IdentitySchema {
        IdentitySchema::new("id", IdGeneration::Identity)
    }

    fn film_schema() -> EntitySchema {
        EntitySchema::new("film", "film", identity())
            .field(FieldSchema::new("title", SqlType::Text))
            .edge(
                EdgeSchema::many_to_one("lead", "actor", "lead_id").cascade(CascadePolicy::Persist),
            )
            .edge(EdgeSchema::many_to_many(
                "cast",
                "actor",
                "film_cast",
                "film_id",
                "actor_id",
            ))
    }

    fn actor_schema() -> EntitySchema {
        EntitySchema::new("actor", "actor", identity())
            .field(FieldSchema::new("name", SqlType::Text))
            .edge(EdgeSchema::inverse("leads", "film", Cardinality::OneToMany, "lead"))
            .edge(EdgeSchema::inverse("roles", "film", Cardinality::ManyToMany, "cast"))
    }

    fn build(film: EntitySchema, actor: EntitySchema) -> Result<Registry> {
        Registry::builder()
            .register_with::<Film>(film)
            .register_with::<Actor>(actor)
            .build()
    }

    fn config_message(result: Result<Registry>) -> String {
        match result {
            Err(Error::Config(e)) => e.message,
            Err(other) => panic!("expected config error, got {other}"),
            Ok(_) => panic!("expected config error"),
        }
    }

    #[test]
    fn describes_registered_entities() {
        let registry = build(film_schema(), actor_schema()).unwrap();
        assert_eq!(registry.describe("film").unwrap().table, "film");
        assert_eq!(registry.describe_type::<Actor>().unwrap().name, "actor");
        assert_eq!(registry.associations_of("film").unwrap().len(), 2);
        assert!(registry.meta("actor").unwrap().is::<Actor>());

        let inverse = registry.inverse_of("actor", "roles").unwrap();
        assert_eq!(inverse[0].1.name, "cast");
        let views = registry.inverse_of("film", "lead").unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].1.name, "leads");
        assert!(registry.describe("studio").is_err());
    }

    #[test]
    fn instantiates_erased_rows() {
        let registry = build(film_schema(), actor_schema()).unwrap();
        let blank = registry.meta("film").unwrap().instantiate();
        assert_eq!(blank.entity_name(), "film");
        assert!(blank.downcast::<Film>().is_some());
    }

    #[test]
    fn rejects_unknown_target() {
        let film = film_schema().edge(EdgeSchema::many_to_one("studio", "studio", "studio_id"));
        assert!(config_message(build(film, actor_schema())).contains("not registered"));
    }

    #[test]
    fn rejects_inconsistent_inverse() {
        let actor = actor_schema()
            .map_edge("roles", |_| EdgeSchema::inverse("roles", "film", Cardinality::ManyToMany, "crew"));
        assert!(config_message(build(film_schema(), actor)).contains("does not exist"));

        let actor = actor_schema()
            .map_edge("leads", |_| EdgeSchema::inverse("leads", "film", Cardinality::ManyToMany, "lead"));
        assert!(config_message(build(film_schema(), actor)).contains("lead is ManyToOne"));

        let actor = actor_schema().map_edge("leads", |e| e.fetch(Fetch::Eager));
        assert!(config_message(build(film_schema(), actor)).contains("must be lazy"));
    }

    #[test]
    fn rejects_lazy_owning_collection() {
        let film = film_schema().map_edge("cast", |e| e.fetch(Fetch::Lazy));
        assert!(config_message(build(film, actor_schema())).contains("must be eager"));
    }

    #[test]
    fn rejects_duplicates_and_required_derived() {
        let err = Registry::builder()
            .register_with::<Film>(film_schema())
            .register_with::<Actor>(film_schema())
            .build();
        assert!(config_message(err).contains("registered twice"));

        let film = film_schema().field(FieldSchema::new("title", SqlType::Text));
        assert!(config_message(build(film, actor_schema())).contains("more than once"));

        let mut derived = FieldSchema::new("title_year", SqlType::Integer)
            .derived(Formula::YearOf("released"));
        derived.nullable = false;
        let film = film_schema().field(derived);
        assert!(config_message(build(film, actor_schema())).contains("cannot be required"));

        let film = EntitySchema::new("film", "film", IdentitySchema::new("", IdGeneration::Identity));
        assert!(config_message(build(film, actor_schema())).contains("no identity"));
    }
}
