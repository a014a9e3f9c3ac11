//! Entity trait and managed handles.
//!
//! An [`Entity`] describes itself with an [`EntitySchema`] and exposes its
//! persistent state as column values, association fields and element
//! collections. Applications and the session share entities through
//! [`Ref<T>`] handles: two handles to the same instance compare equal, and
//! every mutation made through one is observed through the other.
//!
//! The session holds handles type-erased as [`AnyRef`], which drives the
//! entity through the object-safe [`ManagedCell`] interface.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::Result;
use crate::error::Error;
use crate::field::{FieldSchema, IdentitySchema};
use crate::relationship::{Association, EdgeSchema, ElementCollectionSchema, Install, Targets};
use crate::value::Value;

/// Full mapping of one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySchema {
    pub name: &'static str,
    pub table: &'static str,
    pub identity: IdentitySchema,
    pub fields: Vec<FieldSchema>,
    pub edges: Vec<EdgeSchema>,
    pub elements: Vec<ElementCollectionSchema>,
}

impl EntitySchema {
    pub fn new(name: &'static str, table: &'static str, identity: IdentitySchema) -> Self {
        Self {
            name,
            table,
            identity,
            fields: Vec::new(),
            edges: Vec::new(),
            elements: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldSchema) -> Self {
        self.fields.push(field);
        self
    }

    pub fn edge(mut self, edge: EdgeSchema) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn element_collection(mut self, collection: ElementCollectionSchema) -> Self {
        self.elements.push(collection);
        self
    }

    /// Rewrite one edge in place, e.g. to change its cascade policy.
    pub fn map_edge(mut self, name: &str, f: impl FnOnce(EdgeSchema) -> EdgeSchema) -> Self {
        if let Some(edge) = self.edges.iter_mut().find(|e| e.name == name) {
            *edge = f(*edge);
        }
        self
    }

    pub fn field_named(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn edge_named(&self, name: &str) -> Option<&EdgeSchema> {
        self.edges.iter().find(|e| e.name == name)
    }

    pub fn element_named(&self, name: &str) -> Option<&ElementCollectionSchema> {
        self.elements.iter().find(|c| c.name == name)
    }

    /// Fields written by inserts and updates.
    pub fn writable_fields(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields.iter().filter(|f| f.is_writable())
    }

    /// Fields computed by the store.
    pub fn derived_fields(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields.iter().filter(|f| !f.is_writable())
    }

    /// Owning edges stored as a foreign-key column.
    pub fn foreign_keys(&self) -> impl Iterator<Item = &EdgeSchema> {
        self.edges.iter().filter(|e| e.fk_column().is_some())
    }
}

/// A persistent domain type.
///
/// Implementations map between the struct and column values. The session
/// never inspects fields directly; everything flows through these methods.
pub trait Entity: Default + Send + Sync + 'static {
    /// Entity name used in metadata, errors and logs.
    const NAME: &'static str;

    fn schema() -> EntitySchema;

    fn identity(&self) -> Option<i64>;

    fn set_identity(&mut self, identity: Option<i64>);

    /// Persistent scalar values keyed by field name, including derived ones.
    fn scalars(&self) -> Vec<(&'static str, Value)>;

    fn set_scalar(&mut self, field: &str, value: Value) -> Result<()>;

    fn association(&self, _edge: &str) -> Option<&dyn Association> {
        None
    }

    fn association_mut(&mut self, _edge: &str) -> Option<&mut dyn Association> {
        None
    }

    /// Current members of an element collection.
    fn elements(&self, _collection: &str) -> Option<Vec<Value>> {
        None
    }

    fn set_elements(&mut self, collection: &str, _values: Vec<Value>) -> Result<()> {
        Err(unknown_field(Self::NAME, collection))
    }
}

/// Error for a field name an entity does not map.
pub fn unknown_field(entity: &'static str, field: &str) -> Error {
    Error::Custom(format!("{entity} has no persistent field '{field}'"))
}

/// Shared handle to an entity instance.
pub struct Ref<T: Entity> {
    cell: Arc<RwLock<T>>,
}

impl<T: Entity> Ref<T> {
    pub fn new(entity: T) -> Self {
        Self {
            cell: Arc::new(RwLock::new(entity)),
        }
    }

    /// Lock for reading. Guards must not be held across session calls.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.cell.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock for writing. Guards must not be held across session calls.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.cell.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn identity(&self) -> Option<i64> {
        self.read().identity()
    }

    /// Do both handles point at the same instance?
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.cell, &b.cell)
    }

    pub fn erase(&self) -> AnyRef {
        let cell: Arc<dyn ManagedCell> = self.cell.clone();
        AnyRef(cell)
    }
}

impl<T: Entity> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Entity> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        Ref::ptr_eq(self, other)
    }
}

impl<T: Entity> Eq for Ref<T> {}

impl<T: Entity> From<T> for Ref<T> {
    fn from(entity: T) -> Self {
        Ref::new(entity)
    }
}

impl<T: Entity> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cell.try_read() {
            Ok(entity) => write!(f, "Ref<{}>({:?})", T::NAME, entity.identity()),
            Err(_) => write!(f, "Ref<{}>(<locked>)", T::NAME),
        }
    }
}

/// Object-safe view of a managed entity cell.
pub trait ManagedCell: Send + Sync {
    fn entity_name(&self) -> &'static str;

    fn identity(&self) -> Option<i64>;

    fn set_identity(&self, identity: Option<i64>);

    fn scalars(&self) -> Vec<(&'static str, Value)>;

    fn set_scalar(&self, field: &str, value: Value) -> Result<()>;

    fn targets(&self, edge: &str) -> Option<Targets>;

    fn install(&self, edge: &str, install: Install) -> Result<()>;

    fn elements(&self, collection: &str) -> Option<Vec<Value>>;

    fn set_elements(&self, collection: &str, values: Vec<Value>) -> Result<()>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Entity> ManagedCell for RwLock<T> {
    fn entity_name(&self) -> &'static str {
        T::NAME
    }

    fn identity(&self) -> Option<i64> {
        self.read().unwrap_or_else(PoisonError::into_inner).identity()
    }

    fn set_identity(&self, identity: Option<i64>) {
        self.write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_identity(identity);
    }

    fn scalars(&self) -> Vec<(&'static str, Value)> {
        self.read().unwrap_or_else(PoisonError::into_inner).scalars()
    }

    fn set_scalar(&self, field: &str, value: Value) -> Result<()> {
        self.write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_scalar(field, value)
    }

    fn targets(&self, edge: &str) -> Option<Targets> {
        self.read()
            .unwrap_or_else(PoisonError::into_inner)
            .association(edge)
            .map(Association::targets)
    }

    fn install(&self, edge: &str, install: Install) -> Result<()> {
        let mut entity = self.write().unwrap_or_else(PoisonError::into_inner);
        match entity.association_mut(edge) {
            Some(association) => association.install(install),
            None => Err(unknown_field(T::NAME, edge)),
        }
    }

    fn elements(&self, collection: &str) -> Option<Vec<Value>> {
        self.read()
            .unwrap_or_else(PoisonError::into_inner)
            .elements(collection)
    }

    fn set_elements(&self, collection: &str, values: Vec<Value>) -> Result<()> {
        self.write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_elements(collection, values)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Type-erased entity handle.
#[derive(Clone)]
pub struct AnyRef(Arc<dyn ManagedCell>);

impl AnyRef {
    /// Address of the shared instance; stable for the handle's lifetime.
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>() as usize
    }

    pub fn ptr_eq(&self, other: &AnyRef) -> bool {
        self.addr() == other.addr()
    }

    pub fn downcast<T: Entity>(&self) -> Option<Ref<T>> {
        Arc::clone(&self.0)
            .into_any()
            .downcast::<RwLock<T>>()
            .ok()
            .map(|cell| Ref { cell })
    }
}

impl std::ops::Deref for AnyRef {
    type Target = dyn ManagedCell;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl fmt::Debug for AnyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnyRef<{}>@{:#x}", self.0.entity_name(), self.addr())
    }
}
