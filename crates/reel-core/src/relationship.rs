//! Association metadata and association field types.
//!
//! An association is described once by an [`EdgeSchema`] in the entity's
//! schema and held on the entity by one of three field types:
//!
//! - [`Related<T>`]: owning to-one reference (many-to-one)
//! - [`RelatedSet<T>`]: owning to-many reference set (many-to-many)
//! - [`Inverse<T>`]: the non-owning, mapped-by view of another entity's edge
//!
//! Owning fields hold [`Ref`] handles. Inverse views hold only the keys of
//! the related entities and resolve them through the session's identity map,
//! so an object graph never forms strong reference cycles.

use std::fmt;
use std::marker::PhantomData;

use crate::Result;
use crate::error::{Error, TypeError};
use crate::model::{AnyRef, Entity, Ref};

/// How many entities sit on each side of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    ManyToOne,
    OneToMany,
    ManyToMany,
}

impl Cardinality {
    pub const fn is_to_many(self) -> bool {
        matches!(self, Cardinality::OneToMany | Cardinality::ManyToMany)
    }

    /// Cardinality seen from the other end of the edge.
    pub const fn reversed(self) -> Self {
        match self {
            Cardinality::ManyToOne => Cardinality::OneToMany,
            Cardinality::OneToMany => Cardinality::ManyToOne,
            Cardinality::ManyToMany => Cardinality::ManyToMany,
        }
    }
}

/// Physical representation of an owning edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinSpec {
    /// A foreign-key column on the owner's table.
    ForeignKey { column: &'static str, nullable: bool },
    /// A join table holding (owner, target) key pairs.
    JoinTable {
        table: &'static str,
        owner_column: &'static str,
        target_column: &'static str,
    },
}

/// Which side of the edge writes its representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Owning(JoinSpec),
    /// Read-only view of the owning edge named `mapped_by` on the target.
    Inverse { mapped_by: &'static str },
}

/// Lifecycle operations propagated across an edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CascadePolicy {
    #[default]
    None,
    Persist,
    PersistRemove,
}

impl CascadePolicy {
    pub const fn cascades_persist(self) -> bool {
        matches!(self, CascadePolicy::Persist | CascadePolicy::PersistRemove)
    }

    pub const fn cascades_remove(self) -> bool {
        matches!(self, CascadePolicy::PersistRemove)
    }
}

/// When the related side is materialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Fetch {
    /// Loaded together with the owner.
    #[default]
    Eager,
    /// Represented by a placeholder until first access.
    Lazy,
}

/// A typed, named association from one entity type to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeSchema {
    pub name: &'static str,
    pub target: &'static str,
    pub cardinality: Cardinality,
    pub side: Side,
    pub cascade: CascadePolicy,
    pub fetch: Fetch,
}

impl EdgeSchema {
    /// Owning many-to-one edge stored in a nullable foreign-key column.
    pub const fn many_to_one(
        name: &'static str,
        target: &'static str,
        column: &'static str,
    ) -> Self {
        Self {
            name,
            target,
            cardinality: Cardinality::ManyToOne,
            side: Side::Owning(JoinSpec::ForeignKey {
                column,
                nullable: true,
            }),
            cascade: CascadePolicy::None,
            fetch: Fetch::Eager,
        }
    }

    /// Owning many-to-many edge stored in a join table.
    pub const fn many_to_many(
        name: &'static str,
        target: &'static str,
        table: &'static str,
        owner_column: &'static str,
        target_column: &'static str,
    ) -> Self {
        Self {
            name,
            target,
            cardinality: Cardinality::ManyToMany,
            side: Side::Owning(JoinSpec::JoinTable {
                table,
                owner_column,
                target_column,
            }),
            cascade: CascadePolicy::None,
            fetch: Fetch::Eager,
        }
    }

    /// Inverse view of `target.mapped_by`; lazy by default.
    pub const fn inverse(
        name: &'static str,
        target: &'static str,
        cardinality: Cardinality,
        mapped_by: &'static str,
    ) -> Self {
        Self {
            name,
            target,
            cardinality,
            side: Side::Inverse { mapped_by },
            cascade: CascadePolicy::None,
            fetch: Fetch::Lazy,
        }
    }

    pub const fn cascade(mut self, cascade: CascadePolicy) -> Self {
        self.cascade = cascade;
        self
    }

    pub const fn fetch(mut self, fetch: Fetch) -> Self {
        self.fetch = fetch;
        self
    }

    /// Make a foreign-key edge NOT NULL.
    pub const fn required(mut self) -> Self {
        if let Side::Owning(JoinSpec::ForeignKey { column, .. }) = self.side {
            self.side = Side::Owning(JoinSpec::ForeignKey {
                column,
                nullable: false,
            });
        }
        self
    }

    pub const fn is_owning(&self) -> bool {
        matches!(self.side, Side::Owning(_))
    }

    pub const fn is_lazy(&self) -> bool {
        matches!(self.fetch, Fetch::Lazy)
    }

    /// Foreign-key column for owning to-one edges.
    pub const fn fk_column(&self) -> Option<&'static str> {
        match self.side {
            Side::Owning(JoinSpec::ForeignKey { column, .. }) => Some(column),
            _ => None,
        }
    }

    pub const fn fk_nullable(&self) -> bool {
        matches!(
            self.side,
            Side::Owning(JoinSpec::ForeignKey { nullable: true, .. })
        )
    }

    /// (table, owner_column, target_column) for join-table edges.
    pub const fn join_table(&self) -> Option<(&'static str, &'static str, &'static str)> {
        match self.side {
            Side::Owning(JoinSpec::JoinTable {
                table,
                owner_column,
                target_column,
            }) => Some((table, owner_column, target_column)),
            _ => None,
        }
    }

    pub const fn mapped_by(&self) -> Option<&'static str> {
        match self.side {
            Side::Inverse { mapped_by } => Some(mapped_by),
            Side::Owning(_) => None,
        }
    }
}

/// A set of scalar values stored in a side table keyed by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementCollectionSchema {
    pub name: &'static str,
    pub table: &'static str,
    pub owner_column: &'static str,
    pub value_column: &'static str,
    pub sql_type: crate::field::SqlType,
}

impl ElementCollectionSchema {
    pub const fn new(
        name: &'static str,
        table: &'static str,
        owner_column: &'static str,
        value_column: &'static str,
        sql_type: crate::field::SqlType,
    ) -> Self {
        Self {
            name,
            table,
            owner_column,
            value_column,
            sql_type,
        }
    }
}

/// Identifies one session generation; placeholders minted under a token are
/// only honored by a session that still carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken {
    pub session: u64,
    pub epoch: u64,
}

/// Stand-in for a lazy association that has not been loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LazyPlaceholder {
    pub owner_entity: &'static str,
    pub owner_identity: Option<i64>,
    pub edge: &'static str,
    pub token: SessionToken,
}

/// What the session can observe about an association field.
#[derive(Debug, Clone)]
pub enum Targets {
    /// Materialized handles.
    Loaded(Vec<AnyRef>),
    /// Only the stored keys are known (read from a row, not yet resolved).
    Keys(Vec<i64>),
    /// Lazy placeholder; nothing loaded.
    Placeholder(LazyPlaceholder),
    /// Inverse view resolved to the keys of related entities.
    Resolved {
        placeholder: LazyPlaceholder,
        keys: Vec<i64>,
    },
    /// Inverse view of an entity no session has seen.
    Unattached,
}

/// State the session pushes into an association field.
#[derive(Debug, Clone)]
pub enum Install {
    Refs(Vec<AnyRef>),
    /// Stored keys of an unresolved to-one edge.
    Keys(Vec<i64>),
    Placeholder(LazyPlaceholder),
    Resolved {
        placeholder: LazyPlaceholder,
        keys: Vec<i64>,
    },
}

/// Type-erased access to an association field.
pub trait Association: Send + Sync {
    fn targets(&self) -> Targets;

    fn install(&mut self, install: Install) -> Result<()>;
}

fn downcast_all<T: Entity>(refs: Vec<AnyRef>) -> Result<Vec<Ref<T>>> {
    refs.into_iter()
        .map(|any| {
            any.downcast::<T>().ok_or_else(|| {
                Error::Type(TypeError {
                    expected: T::NAME,
                    actual: any.entity_name().to_string(),
                    column: None,
                })
            })
        })
        .collect()
}

fn unsupported(field: &'static str, install: &Install) -> Error {
    Error::Custom(format!("{field} cannot accept {install:?}"))
}

enum RelatedState<T: Entity> {
    /// Key read from a row; resolution pending.
    Key(Option<i64>),
    Lazy {
        key: Option<i64>,
        placeholder: LazyPlaceholder,
    },
    Loaded(Option<Ref<T>>),
}

/// Owning to-one association.
pub struct Related<T: Entity> {
    state: RelatedState<T>,
}

impl<T: Entity> Related<T> {
    /// No related entity.
    pub fn empty() -> Self {
        Self {
            state: RelatedState::Loaded(None),
        }
    }

    pub fn to(target: &Ref<T>) -> Self {
        Self {
            state: RelatedState::Loaded(Some(target.clone())),
        }
    }

    /// Replace the related entity. Works whether or not the edge was loaded.
    pub fn set(&mut self, target: Option<&Ref<T>>) {
        self.state = RelatedState::Loaded(target.cloned());
    }

    /// The related entity, once loaded.
    pub fn get(&self) -> Option<&Ref<T>> {
        match &self.state {
            RelatedState::Loaded(target) => target.as_ref(),
            _ => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, RelatedState::Loaded(_))
    }

    /// Identity of the related entity whether or not it is loaded.
    pub fn key(&self) -> Option<i64> {
        match &self.state {
            RelatedState::Key(key) | RelatedState::Lazy { key, .. } => *key,
            RelatedState::Loaded(target) => target.as_ref().and_then(Ref::identity),
        }
    }
}

impl<T: Entity> Association for Related<T> {
    fn targets(&self) -> Targets {
        match &self.state {
            RelatedState::Key(key) => Targets::Keys(key.iter().copied().collect()),
            RelatedState::Lazy { placeholder, .. } => Targets::Placeholder(placeholder.clone()),
            RelatedState::Loaded(target) => {
                Targets::Loaded(target.iter().map(Ref::erase).collect())
            }
        }
    }

    fn install(&mut self, install: Install) -> Result<()> {
        match install {
            Install::Refs(refs) => {
                let target = downcast_all::<T>(refs)?.into_iter().next();
                self.state = RelatedState::Loaded(target);
                Ok(())
            }
            Install::Keys(keys) => {
                self.state = RelatedState::Key(keys.first().copied());
                Ok(())
            }
            Install::Placeholder(placeholder) => {
                // A reference assigned in memory wins over a placeholder.
                if !self.is_loaded() {
                    self.state = RelatedState::Lazy {
                        key: self.key(),
                        placeholder,
                    };
                }
                Ok(())
            }
            other @ Install::Resolved { .. } => Err(unsupported("Related", &other)),
        }
    }
}

impl<T: Entity> Default for Related<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Entity> Clone for Related<T> {
    fn clone(&self) -> Self {
        let state = match &self.state {
            RelatedState::Key(key) => RelatedState::Key(*key),
            RelatedState::Lazy { key, placeholder } => RelatedState::Lazy {
                key: *key,
                placeholder: placeholder.clone(),
            },
            RelatedState::Loaded(target) => RelatedState::Loaded(target.clone()),
        };
        Self { state }
    }
}

impl<T: Entity> fmt::Debug for Related<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            RelatedState::Key(key) => write!(f, "Related<{}>(key {:?})", T::NAME, key),
            RelatedState::Lazy { key, .. } => write!(f, "Related<{}>(lazy {:?})", T::NAME, key),
            RelatedState::Loaded(target) => {
                write!(f, "Related<{}>({:?})", T::NAME, target.as_ref().map(Ref::identity))
            }
        }
    }
}

/// Owning to-many association with set semantics.
///
/// Membership is decided by object identity or, for persisted entities, by
/// identity key; inserting an entity already present is a no-op.
pub struct RelatedSet<T: Entity> {
    items: Vec<Ref<T>>,
}

impl<T: Entity> RelatedSet<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Add `target`; returns false when it was already a member.
    pub fn insert(&mut self, target: &Ref<T>) -> bool {
        if self.contains(target) {
            return false;
        }
        self.items.push(target.clone());
        true
    }

    /// Remove `target`; returns false when it was not a member.
    pub fn remove(&mut self, target: &Ref<T>) -> bool {
        let before = self.items.len();
        let key = target.identity();
        self.items
            .retain(|item| !(Ref::ptr_eq(item, target) || (key.is_some() && item.identity() == key)));
        self.items.len() != before
    }

    pub fn contains(&self, target: &Ref<T>) -> bool {
        let key = target.identity();
        self.items
            .iter()
            .any(|item| Ref::ptr_eq(item, target) || (key.is_some() && item.identity() == key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ref<T>> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Entity> Association for RelatedSet<T> {
    fn targets(&self) -> Targets {
        Targets::Loaded(self.items.iter().map(Ref::erase).collect())
    }

    fn install(&mut self, install: Install) -> Result<()> {
        match install {
            Install::Refs(refs) => {
                self.items.clear();
                for target in downcast_all::<T>(refs)? {
                    self.insert(&target);
                }
                Ok(())
            }
            other => Err(unsupported("RelatedSet", &other)),
        }
    }
}

impl<T: Entity> Default for RelatedSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> Clone for RelatedSet<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<T: Entity> fmt::Debug for RelatedSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.items.iter().map(Ref::identity))
            .finish()
    }
}

impl<'a, T: Entity> FromIterator<&'a Ref<T>> for RelatedSet<T> {
    fn from_iter<I: IntoIterator<Item = &'a Ref<T>>>(iter: I) -> Self {
        let mut set = Self::new();
        for target in iter {
            set.insert(target);
        }
        set
    }
}

#[derive(Debug, Clone)]
enum InverseState {
    Unattached,
    Pending(LazyPlaceholder),
    Resolved {
        placeholder: LazyPlaceholder,
        keys: Vec<i64>,
    },
}

/// Read-only, mapped-by view of another entity's owning edge.
///
/// Only the owning side drives writes; the view reflects the store as of its
/// last resolution and is reset by every flush.
pub struct Inverse<T: Entity> {
    state: InverseState,
    _target: PhantomData<fn() -> T>,
}

impl<T: Entity> Inverse<T> {
    pub fn new() -> Self {
        Self {
            state: InverseState::Unattached,
            _target: PhantomData,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, InverseState::Resolved { .. })
    }

    /// Keys of the related entities, once resolved.
    pub fn loaded_keys(&self) -> Option<&[i64]> {
        match &self.state {
            InverseState::Resolved { keys, .. } => Some(keys),
            _ => None,
        }
    }

    pub fn placeholder(&self) -> Option<&LazyPlaceholder> {
        match &self.state {
            InverseState::Unattached => None,
            InverseState::Pending(p) | InverseState::Resolved { placeholder: p, .. } => Some(p),
        }
    }
}

impl<T: Entity> Association for Inverse<T> {
    fn targets(&self) -> Targets {
        match &self.state {
            InverseState::Unattached => Targets::Unattached,
            InverseState::Pending(p) => Targets::Placeholder(p.clone()),
            InverseState::Resolved { placeholder, keys } => Targets::Resolved {
                placeholder: placeholder.clone(),
                keys: keys.clone(),
            },
        }
    }

    fn install(&mut self, install: Install) -> Result<()> {
        match install {
            Install::Placeholder(p) => {
                self.state = InverseState::Pending(p);
                Ok(())
            }
            Install::Resolved { placeholder, keys } => {
                self.state = InverseState::Resolved { placeholder, keys };
                Ok(())
            }
            other @ (Install::Refs(_) | Install::Keys(_)) => Err(unsupported("Inverse", &other)),
        }
    }
}

impl<T: Entity> Default for Inverse<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> Clone for Inverse<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            _target: PhantomData,
        }
    }
}

impl<T: Entity> fmt::Debug for Inverse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            InverseState::Unattached => write!(f, "Inverse<{}>(unattached)", T::NAME),
            InverseState::Pending(_) => write!(f, "Inverse<{}>(lazy)", T::NAME),
            InverseState::Resolved { keys, .. } => write!(f, "Inverse<{}>({:?})", T::NAME, keys),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{IdGeneration, IdentitySchema};
    use crate::model::EntitySchema;
    use crate::value::Value;

    #[derive(Debug, Default)]
    struct Tag {
        id: Option<i64>,
    }

    impl Entity for Tag {
        const NAME: &'static str = "Tag";

        fn schema() -> EntitySchema {
            EntitySchema::new(
                "Tag",
                "tags",
                IdentitySchema::new("id", IdGeneration::Identity),
            )
        }

        fn identity(&self) -> Option<i64> {
            self.id
        }

        fn set_identity(&mut self, id: Option<i64>) {
            self.id = id;
        }

        fn scalars(&self) -> Vec<(&'static str, Value)> {
            Vec::new()
        }

        fn set_scalar(&mut self, field: &str, _value: Value) -> Result<()> {
            Err(crate::model::unknown_field(Self::NAME, field))
        }
    }

    fn token() -> SessionToken {
        SessionToken {
            session: 1,
            epoch: 0,
        }
    }

    #[test]
    fn edge_builders() {
        let director = EdgeSchema::many_to_one("director", "Person", "director_id")
            .cascade(CascadePolicy::Persist);
        assert!(director.is_owning());
        assert_eq!(director.fk_column(), Some("director_id"));
        assert!(director.fk_nullable());
        assert!(!director.required().fk_nullable());
        assert!(director.cascade.cascades_persist());
        assert!(!director.cascade.cascades_remove());

        let played = EdgeSchema::inverse("played_movies", "Movie", Cardinality::ManyToMany, "actors");
        assert_eq!(played.mapped_by(), Some("actors"));
        assert!(played.is_lazy());
        assert_eq!(Cardinality::ManyToOne.reversed(), Cardinality::OneToMany);
    }

    #[test]
    fn related_set_is_idempotent() {
        let a = Ref::new(Tag { id: Some(1) });
        let same_row = Ref::new(Tag { id: Some(1) });
        let b = Ref::new(Tag::default());

        let mut set = RelatedSet::new();
        assert!(set.insert(&a));
        assert!(!set.insert(&a));
        assert!(!set.insert(&same_row));
        assert!(set.insert(&b));
        assert_eq!(set.len(), 2);
        assert!(set.remove(&same_row));
        assert!(!set.contains(&a));
    }

    #[test]
    fn related_placeholder_does_not_override_assignment() {
        let a = Ref::new(Tag { id: Some(4) });
        let mut related = Related::to(&a);
        related
            .install(Install::Placeholder(LazyPlaceholder {
                owner_entity: "Tag",
                owner_identity: Some(1),
                edge: "parent",
                token: token(),
            }))
            .unwrap();
        assert!(related.is_loaded());
        assert_eq!(related.key(), Some(4));
    }

    #[test]
    fn related_key_survives_lazy_install() {
        let mut related = Related::<Tag>::empty();
        related.install(Install::Keys(vec![9])).unwrap();
        assert!(matches!(related.targets(), Targets::Keys(ref k) if k == &[9]));
        related
            .install(Install::Placeholder(LazyPlaceholder {
                owner_entity: "Tag",
                owner_identity: Some(1),
                edge: "parent",
                token: token(),
            }))
            .unwrap();
        assert_eq!(related.key(), Some(9));
        assert!(related.get().is_none());

        let target = Ref::new(Tag { id: Some(9) });
        related.install(Install::Refs(vec![target.erase()])).unwrap();
        assert!(Ref::ptr_eq(related.get().unwrap(), &target));
    }

    #[test]
    fn inverse_tracks_resolution() {
        let mut inverse = Inverse::<Tag>::new();
        assert!(matches!(inverse.targets(), Targets::Unattached));
        let placeholder = LazyPlaceholder {
            owner_entity: "Tag",
            owner_identity: Some(1),
            edge: "children",
            token: token(),
        };
        inverse
            .install(Install::Placeholder(placeholder.clone()))
            .unwrap();
        assert!(!inverse.is_loaded());
        inverse
            .install(Install::Resolved {
                placeholder,
                keys: vec![3, 5],
            })
            .unwrap();
        assert_eq!(inverse.loaded_keys(), Some(&[3, 5][..]));
        assert!(inverse.install(Install::Refs(Vec::new())).is_err());
    }
}
