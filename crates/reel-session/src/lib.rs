//! Session and unit of work for reel.
//!
//! `reel-session` is the **unit-of-work layer**. A [`Session`] tracks managed
//! entities against one executor and turns in-memory changes into ordered
//! writes at flush time.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one managed instance per stored row and session.
//! - **Cascades**: persist and remove propagate across edges that ask for it.
//! - **Lazy loading**: placeholders resolve through the session that minted
//!   them, and only while it is open.
//! - **Change tracking**: snapshots taken at load time are diffed at flush.
//! - **Queries**: entity queries materialize through the identity map;
//!   tuples, projections and aggregates are plain values.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(store.connect(), registry);
//!
//! let movie = session.register(&cx, &Ref::new(movie)).await?;
//! session.flush(&cx).await?;
//!
//! let again = session.find::<Movie>(&cx, movie.identity().unwrap()).await?;
//! assert!(Ref::ptr_eq(&movie, &again.unwrap()));
//!
//! session.commit(&cx).await?;
//! ```

pub mod cascade;
pub mod change_tracker;
pub mod flush;
pub mod identity_map;
mod lazy;
mod load;

pub use cascade::{CascadeOp, Step, Visited};
pub use change_tracker::{Delta, Snapshot};
pub use flush::FlushResult;
pub use identity_map::{EntityKey, Entry, EntryState, IdentityMap, KeyId};

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use reel_core::{
    AnyRef, Cx, Dialect, Entity, Error, Executor, Expr, IdGeneration, Install, NotManaged,
    Outcome, Ref, Registry, RowStream, SessionToken, TypeError, ValidationError, try_outcome,
    try_result,
};
use reel_query::{Aggregate, CompiledCount, Projection, ROOT_ALIAS, RowImage, Select, Tuple};

use crate::load::load_statement;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Returning `Err` aborts the operation that fired the event.
type SessionEventFn = Box<dyn FnMut() -> Result<(), Error> + Send>;

/// Holds registered session-level event callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    #[allow(clippy::result_large_err)]
    fn fire(&mut self, event: SessionEvent) -> Result<(), Error> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush computes its writes.
    BeforeFlush,
    /// Fired after a flush succeeds.
    AfterFlush,
    /// Fired before commit (after flush).
    BeforeCommit,
    /// Fired after commit completes successfully.
    AfterCommit,
    /// Fired after rollback completes.
    AfterRollback,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Open a transaction at the first flush and keep it until commit or
    /// rollback. Otherwise each flush runs in its own transaction.
    pub auto_begin: bool,
    /// Flush before every entity query.
    pub auto_flush: bool,
    /// Dialect used when statements are rendered for logging.
    pub dialect: Dialect,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            auto_flush: false,
            dialect: Dialect::Postgres,
        }
    }
}

impl SessionConfig {
    /// Set the `auto_begin` option (builder pattern).
    #[must_use]
    pub fn auto_begin(mut self, value: bool) -> Self {
        self.auto_begin = value;
        self
    }

    /// Set the `auto_flush` option (builder pattern).
    #[must_use]
    pub fn auto_flush(mut self, value: bool) -> Self {
        self.auto_flush = value;
        self
    }

    #[must_use]
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }
}

/// Lifecycle state of an entity relative to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Never registered and holding no identity.
    Transient,
    /// Tracked by the session.
    Managed,
    /// Holds an identity but is not tracked by the session.
    Detached,
    /// Tracked and scheduled for deletion at the next flush.
    Removed,
}

/// Counts of pending work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub new: usize,
    pub dirty: usize,
    pub deleted: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

// ============================================================================
// Session
// ============================================================================

/// A unit of work over one executor.
///
/// Lifecycle operations take `&Ref<T>` handles; the session keeps its own
/// clones of every managed handle, so changes made through any clone are
/// seen at flush.
pub struct Session<E: Executor> {
    executor: E,
    registry: Registry,
    config: SessionConfig,
    map: IdentityMap,
    token: SessionToken,
    in_transaction: bool,
    flushes: u64,
    event_callbacks: SessionEventCallbacks,
}

impl<E: Executor> std::fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token)
            .field("tracked", &self.map.len())
            .field("in_transaction", &self.in_transaction)
            .field("config", &self.config)
            .field("event_callbacks", &self.event_callbacks)
            .finish_non_exhaustive()
    }
}

impl<E: Executor> Session<E> {
    /// Create a session with default configuration.
    pub fn new(executor: E, registry: Registry) -> Self {
        Self::with_config(executor, registry, SessionConfig::default())
    }

    pub fn with_config(executor: E, registry: Registry, config: SessionConfig) -> Self {
        let token = SessionToken {
            session: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            epoch: 0,
        };
        tracing::debug!(session = token.session, "Session opened");
        Self {
            executor,
            registry,
            config,
            map: IdentityMap::new(),
            token,
            in_transaction: false,
            flushes: 0,
            event_callbacks: SessionEventCallbacks::default(),
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    /// Register a callback to run before each flush.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.before_flush.push(Box::new(f));
    }

    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.after_flush.push(Box::new(f));
    }

    /// Register a callback to run before commit; returning `Err` aborts it.
    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.before_commit.push(Box::new(f));
    }

    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.after_commit.push(Box::new(f));
    }

    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.after_rollback.push(Box::new(f));
    }

    // ========================================================================
    // Object Operations
    // ========================================================================

    /// Make `entity` managed, cascading along persist edges.
    ///
    /// Every entity reached is validated before the store is touched. New
    /// entities with sequence identities draw them now; store-generated
    /// identities arrive at flush. If another instance already holds the
    /// identity of `entity`, that managed instance is returned instead.
    /// Registering an entity scheduled for removal cancels the removal.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(entity = T::NAME))]
    pub async fn register<T: Entity>(&mut self, cx: &Cx, entity: &Ref<T>) -> Outcome<Ref<T>, Error> {
        try_result!(self.registry.describe_type::<T>());
        let root = entity.erase();
        if self.map.key_of(&root).is_none() {
            if let Some(existing) = root
                .identity()
                .and_then(|id| self.map.get(&EntityKey::stored(T::NAME, id)))
            {
                return Outcome::Ok(try_result!(downcast::<T>(&existing.handle)));
            }
        }
        try_outcome!(self.persist_all(cx, vec![root], true).await);
        Outcome::Ok(entity.clone())
    }

    /// Track everything reachable from `roots` along persist edges.
    ///
    /// Entities scheduled for removal return to managed only when `revive`
    /// is set; the flush-time walk leaves them removed.
    pub(crate) async fn persist_all(
        &mut self,
        cx: &Cx,
        roots: Vec<AnyRef>,
        revive: bool,
    ) -> Outcome<(), Error> {
        let registry = self.registry.clone();
        let closure = try_result!(cascade::persist_closure(&registry, roots));

        let mut revived = Vec::new();
        let mut fresh = Vec::new();
        for handle in closure {
            let schema = try_result!(registry.describe(handle.entity_name()));
            if let Some(key) = self.map.key_of(&handle) {
                if revive && self.map.get(&key).is_some_and(|e| e.state == EntryState::Removed) {
                    revived.push(key);
                }
                continue;
            }
            if let Some(id) = handle.identity() {
                if self.map.contains_key(&EntityKey::stored(schema.name, id)) {
                    continue;
                }
                let mut err = ValidationError::new(schema.name);
                err.add_lifecycle(
                    schema.identity.field,
                    format!("{} #{id} is detached from this session; merge it instead", schema.name),
                );
                return Outcome::Err(Error::Validation(err));
            }
            let current = Snapshot::capture(schema, &handle, None);
            try_result!(reel_core::validate_scalars(schema, &current.scalars));
            fresh.push(handle);
        }

        for key in revived {
            if let Some(entry) = self.map.get_mut(&key) {
                entry.state = EntryState::Managed;
                tracing::debug!(key = %key, "Removal cancelled");
            }
        }
        for handle in fresh {
            let schema = try_result!(registry.describe(handle.entity_name()));
            let key = match schema.identity.generation {
                IdGeneration::Sequence(sequence) => {
                    let id = try_outcome!(self.executor.next_sequence_value(cx, sequence).await);
                    handle.set_identity(Some(id));
                    EntityKey::stored(schema.name, id)
                }
                IdGeneration::Identity => self.map.provisional_key(schema.name),
            };
            for edge in schema.edges.iter().filter(|e| e.is_lazy()) {
                try_result!(handle.install(
                    edge.name,
                    Install::Placeholder(self.placeholder(schema.name, handle.identity(), edge.name)),
                ));
            }
            tracing::debug!(key = %key, "Registered");
            self.map.insert(key, Entry::pending(handle));
        }
        Outcome::Ok(())
    }

    /// Look up an entity by identity, through the identity map.
    ///
    /// Returns `None` when no row exists or the entity is scheduled for
    /// removal in this session.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(entity = T::NAME))]
    pub async fn find<T: Entity>(&mut self, cx: &Cx, id: i64) -> Outcome<Option<Ref<T>>, Error> {
        try_result!(self.registry.describe_type::<T>());
        if let Some(entry) = self.map.get(&EntityKey::stored(T::NAME, id)) {
            if entry.state == EntryState::Removed {
                return Outcome::Ok(None);
            }
            return Outcome::Ok(Some(try_result!(downcast::<T>(&entry.handle))));
        }
        let found = try_outcome!(self.load_one(cx, T::NAME, id).await);
        match found {
            Some(handle) => Outcome::Ok(Some(try_result!(downcast::<T>(&handle)))),
            None => Outcome::Ok(None),
        }
    }

    /// Schedule a managed entity for deletion, cascading along remove edges.
    ///
    /// Lazy associations on remove edges are loaded so their targets can be
    /// scheduled too. Entities not yet inserted are simply forgotten.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(entity = T::NAME))]
    pub async fn remove<T: Entity>(&mut self, cx: &Cx, entity: &Ref<T>) -> Outcome<(), Error> {
        let root = entity.erase();
        let Some(key) = self.map.key_of(&root) else {
            return Outcome::Err(Error::NotManaged(NotManaged {
                entity: T::NAME,
                identity: root.identity(),
                operation: "remove",
            }));
        };
        if self.map.get(&key).is_some_and(|e| e.state == EntryState::Removed) {
            return Outcome::Ok(());
        }

        let registry = self.registry.clone();
        let mut visited = Visited::new();
        visited.first_visit(&root);
        let mut queue = vec![root];
        let mut doomed = Vec::new();
        while let Some(handle) = queue.pop() {
            let schema = try_result!(registry.describe(handle.entity_name()));
            for step in cascade::cascade_steps(schema, &handle, CascadeOp::Remove) {
                let targets = match step {
                    Step::Reached(target) => vec![target],
                    Step::Unloaded(edge) => {
                        try_outcome!(self.resolve_edge(cx, &handle, edge).await)
                    }
                };
                for target in targets {
                    let managed = if self.map.key_of(&target).is_some() {
                        target
                    } else if let Some(entry) = target
                        .identity()
                        .and_then(|id| self.map.get(&EntityKey::stored(target.entity_name(), id)))
                    {
                        entry.handle.clone()
                    } else {
                        continue;
                    };
                    if visited.first_visit(&managed) {
                        queue.push(managed);
                    }
                }
            }
            doomed.push(handle);
        }

        for handle in doomed {
            let Some(key) = self.map.key_of(&handle) else {
                continue;
            };
            let pending = self.map.get(&key).is_some_and(Entry::is_pending_insert);
            if pending {
                self.map.remove(&key);
                if key.is_provisional() {
                    handle.set_identity(None);
                }
            } else if let Some(entry) = self.map.get_mut(&key) {
                entry.state = EntryState::Removed;
            }
            tracing::debug!(key = %key, pending, "Scheduled for removal");
        }
        Outcome::Ok(())
    }

    /// Copy the state of a detached or transient entity into a managed one.
    ///
    /// With an identity, the stored entity is loaded (or taken from the map)
    /// and receives the writable scalar fields of `detached`; associations
    /// are not merged. Without one, a new managed instance is registered.
    /// `detached` itself never becomes managed.
    #[tracing::instrument(level = "debug", skip(self, cx, detached), fields(entity = T::NAME))]
    pub async fn merge<T: Entity>(&mut self, cx: &Cx, detached: &Ref<T>) -> Outcome<Ref<T>, Error> {
        let registry = self.registry.clone();
        let schema = try_result!(registry.describe_type::<T>());
        let handle = detached.erase();
        if self.map.key_of(&handle).is_some() {
            return Outcome::Ok(detached.clone());
        }
        let writable: Vec<_> = handle
            .scalars()
            .into_iter()
            .filter(|(name, _)| schema.field_named(name).is_some_and(|f| f.is_writable()))
            .collect();

        let managed = match handle.identity() {
            Some(id) => match try_outcome!(self.find::<T>(cx, id).await) {
                Some(managed) => managed,
                None => {
                    return Outcome::Err(Error::NotFound {
                        entity: T::NAME,
                        identity: id,
                    });
                }
            },
            None => {
                let fresh = Ref::new(T::default());
                for (field, value) in writable {
                    try_result!(fresh.erase().set_scalar(field, value));
                }
                return self.register(cx, &fresh).await;
            }
        };
        let target = managed.erase();
        for (field, value) in writable {
            try_result!(target.set_scalar(field, value));
        }
        Outcome::Ok(managed)
    }

    /// Stop tracking `entity`. Pending changes to it are discarded.
    pub fn detach<T: Entity>(&mut self, entity: &Ref<T>) -> bool {
        let handle = entity.erase();
        let Some(key) = self.map.key_of(&handle) else {
            return false;
        };
        self.map.remove(&key);
        if key.is_provisional() {
            handle.set_identity(None);
        }
        tracing::debug!(key = %key, "Detached");
        true
    }

    /// Detach every managed entity.
    ///
    /// Placeholders minted before the call can no longer be resolved.
    pub fn clear(&mut self) {
        let dropped = self.map.drain();
        self.token.epoch += 1;
        tracing::debug!(dropped = dropped.len(), epoch = self.token.epoch, "Session cleared");
    }

    /// Alias of [`Session::clear`].
    pub fn detach_all(&mut self) {
        self.clear();
    }

    /// Whether this exact instance is managed.
    pub fn contains<T: Entity>(&self, entity: &Ref<T>) -> bool {
        self.map.key_of(&entity.erase()).is_some()
    }

    pub fn state_of<T: Entity>(&self, entity: &Ref<T>) -> EntityState {
        let handle = entity.erase();
        match self.map.key_of(&handle).and_then(|key| self.map.get(&key)) {
            Some(entry) if entry.state == EntryState::Removed => EntityState::Removed,
            Some(_) => EntityState::Managed,
            None if handle.identity().is_some() => EntityState::Detached,
            None => EntityState::Transient,
        }
    }

    /// Whether a flush would write anything for `entity`.
    pub fn is_modified<T: Entity>(&self, entity: &Ref<T>) -> bool {
        let handle = entity.erase();
        let Some(entry) = self.map.key_of(&handle).and_then(|key| self.map.get(&key)) else {
            return false;
        };
        let Some(baseline) = &entry.baseline else {
            return true;
        };
        if entry.state == EntryState::Removed {
            return true;
        }
        let Ok(schema) = self.registry.describe_type::<T>() else {
            return false;
        };
        let current = Snapshot::capture(schema, &handle, Some(baseline));
        !Delta::between(schema, Some(baseline), &current).is_empty()
    }

    /// Re-read the scalar fields of a managed entity from the store,
    /// discarding unflushed scalar changes.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(entity = T::NAME))]
    pub async fn refresh<T: Entity>(&mut self, cx: &Cx, entity: &Ref<T>) -> Outcome<(), Error> {
        let handle = entity.erase();
        let Some(key) = self.map.key_of(&handle) else {
            return Outcome::Err(Error::NotManaged(NotManaged {
                entity: T::NAME,
                identity: handle.identity(),
                operation: "refresh",
            }));
        };
        let (Some(id), false) = (
            key.identity(),
            self.map.get(&key).is_some_and(Entry::is_pending_insert),
        ) else {
            tracing::debug!(key = %key, "Not inserted yet, nothing to refresh");
            return Outcome::Ok(());
        };

        let registry = self.registry.clone();
        let schema = try_result!(registry.describe_type::<T>());
        let filter = Expr::qualified(ROOT_ALIAS, schema.identity.column).eq(id);
        let rows = try_outcome!(self.rows(cx, &load_statement(schema, filter)).await);
        let image = match rows.first() {
            Some(row) => try_result!(RowImage::from_row(row, schema, "")),
            None => None,
        };
        let Some(image) = image else {
            return Outcome::Err(Error::NotFound {
                entity: T::NAME,
                identity: id,
            });
        };
        for (field, value) in &image.scalars {
            try_result!(handle.set_scalar(field, value.clone()));
        }
        if let Some(baseline) = self.map.get_mut(&key).and_then(|e| e.baseline.as_mut()) {
            baseline.set_scalars(&image.scalars);
        }
        Outcome::Ok(())
    }

    /// Counts of entities awaiting insert, update and delete.
    pub fn pending_counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for (key, entry) in self.map.iter() {
            match (entry.state, &entry.baseline) {
                (EntryState::Removed, _) => counts.deleted += 1,
                (EntryState::Managed, None) => counts.new += 1,
                (EntryState::Managed, Some(baseline)) => {
                    let Ok(schema) = self.registry.describe(key.entity) else {
                        continue;
                    };
                    let current = Snapshot::capture(schema, &entry.handle, Some(baseline));
                    if !Delta::between(schema, Some(baseline), &current).is_empty() {
                        counts.dirty += 1;
                    }
                }
            }
        }
        counts
    }

    /// Number of managed entities.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn managed_handles(&self) -> Vec<AnyRef> {
        self.map
            .keys_in_order()
            .into_iter()
            .filter_map(|key| self.map.get(&key))
            .filter(|entry| entry.state == EntryState::Managed)
            .map(|entry| entry.handle.clone())
            .collect()
    }

    pub(crate) fn is_scheduled_for_removal(&self, handle: &AnyRef) -> bool {
        self.map
            .key_of(handle)
            .and_then(|key| self.map.get(&key))
            .is_some_and(|entry| entry.state == EntryState::Removed)
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Begin a transaction.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.in_transaction {
            return Outcome::Ok(());
        }
        try_outcome!(self.executor.begin(cx).await);
        self.in_transaction = true;
        Outcome::Ok(())
    }

    /// Flush, then commit the current transaction.
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.flush(cx).await);

        if let Err(e) = self.event_callbacks.fire(SessionEvent::BeforeCommit) {
            return Outcome::Err(e);
        }
        if self.in_transaction {
            try_outcome!(self.executor.commit(cx).await);
            self.in_transaction = false;
        }
        tracing::debug!(session = self.token.session, "Committed");

        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterCommit) {
            return Outcome::Err(e);
        }
        Outcome::Ok(())
    }

    /// Roll back the current transaction and detach every managed entity,
    /// since their in-memory state may no longer match the store.
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.in_transaction {
            try_outcome!(self.executor.rollback(cx).await);
            self.in_transaction = false;
        }
        for (key, entry) in self.map.drain() {
            if key.is_provisional() {
                entry.handle.set_identity(None);
            }
        }
        self.token.epoch += 1;
        tracing::debug!(session = self.token.session, "Rolled back");

        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterRollback) {
            return Outcome::Err(e);
        }
        Outcome::Ok(())
    }

    /// End the session, rolling back any open transaction.
    ///
    /// Entities it managed become detached; their lazy placeholders can no
    /// longer be resolved.
    pub async fn close(mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.in_transaction {
            tracing::warn!(session = self.token.session, "Closing with an open transaction, rolling back");
            try_outcome!(self.executor.rollback(cx).await);
            self.in_transaction = false;
        }
        self.clear();
        Outcome::Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Run an entity query, materializing results through the identity map.
    ///
    /// Results are deduplicated by identity. Entities already managed keep
    /// their in-memory state, including unflushed changes.
    #[tracing::instrument(level = "debug", skip(self, cx, select), fields(entity = T::NAME))]
    pub async fn query<T: Entity>(&mut self, cx: &Cx, select: &Select<T>) -> Outcome<Vec<Ref<T>>, Error> {
        if self.config.auto_flush {
            try_outcome!(self.flush(cx).await);
        }
        let compiled = try_result!(select.compile(&self.registry));
        let rows = try_outcome!(self.rows(cx, &compiled.statement).await);
        let mut fresh = Vec::new();
        let handles = try_result!(self.adopt_rows(T::NAME, &rows, &compiled.fetched, &mut fresh));
        try_outcome!(self.resolve(cx, fresh).await);
        let mut out = Vec::with_capacity(handles.len());
        for handle in &handles {
            out.push(try_result!(downcast::<T>(handle)));
        }
        tracing::debug!(rows = rows.len(), results = out.len(), "Query complete");
        Outcome::Ok(out)
    }

    /// Run a query returning the given named expressions as tuples.
    pub async fn query_tuples<T: Entity>(
        &mut self,
        cx: &Cx,
        select: &Select<T>,
        columns: &[(&str, Expr)],
    ) -> Outcome<Vec<Tuple>, Error> {
        let columns: Vec<(String, Expr)> = columns
            .iter()
            .map(|(name, expr)| ((*name).to_string(), expr.clone()))
            .collect();
        let statement = try_result!(select.compile_tuple(&self.registry, &columns));
        let rows = try_outcome!(self.rows(cx, &statement).await);
        Outcome::Ok(rows.into_iter().map(Tuple::new).collect())
    }

    /// Run a query mapping each row onto projection `P`.
    pub async fn query_as<T: Entity, P: Projection>(
        &mut self,
        cx: &Cx,
        select: &Select<T>,
    ) -> Outcome<Vec<P>, Error> {
        let statement = try_result!(select.compile_projection::<P>(&self.registry));
        let rows = try_outcome!(self.rows(cx, &statement).await);
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(try_result!(P::from_tuple(&Tuple::new(row))));
        }
        Outcome::Ok(out)
    }

    /// Run a grouped aggregate mapping each group onto projection `P`.
    pub async fn aggregate<T: Entity, P: Projection>(
        &mut self,
        cx: &Cx,
        aggregate: &Aggregate<T>,
    ) -> Outcome<Vec<P>, Error> {
        let statement = try_result!(aggregate.compile::<P>(&self.registry));
        let rows = try_outcome!(self.rows(cx, &statement).await);
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(try_result!(P::from_tuple(&Tuple::new(row))));
        }
        Outcome::Ok(out)
    }

    /// Count the entities a query matches.
    pub async fn count<T: Entity>(&mut self, cx: &Cx, select: &Select<T>) -> Outcome<u64, Error> {
        match try_result!(select.compile_count(&self.registry)) {
            CompiledCount::Scalar(statement) => {
                let rows = try_outcome!(self.rows(cx, &statement).await);
                let count = match rows.first() {
                    Some(row) => try_result!(row.get_as::<i64>(0)),
                    None => 0,
                };
                Outcome::Ok(u64::try_from(count).unwrap_or_default())
            }
            CompiledCount::Rows(statement) => {
                let rows = try_outcome!(self.rows(cx, &statement).await);
                Outcome::Ok(rows.len() as u64)
            }
        }
    }

    /// Open a single-pass stream of query results.
    ///
    /// Each entity is materialized as it is pulled.
    pub async fn stream<T: Entity>(
        &mut self,
        cx: &Cx,
        select: &Select<T>,
    ) -> Outcome<EntityStream<'_, E, T>, Error> {
        if self.config.auto_flush {
            try_outcome!(self.flush(cx).await);
        }
        let compiled = try_result!(select.compile(&self.registry));
        let rows = try_outcome!(self.executor.query_stream(cx, &compiled.statement, &[]).await);
        Outcome::Ok(EntityStream {
            session: self,
            rows,
            fetched: compiled.fetched,
            seen: HashSet::new(),
            _marker: PhantomData,
        })
    }

    /// Open a single-pass stream of projections.
    pub async fn stream_as<T: Entity, P: Projection>(
        &mut self,
        cx: &Cx,
        select: &Select<T>,
    ) -> Outcome<ProjectionStream<P>, Error> {
        let statement = try_result!(select.compile_projection::<P>(&self.registry));
        let rows = try_outcome!(self.executor.query_stream(cx, &statement, &[]).await);
        Outcome::Ok(ProjectionStream {
            rows,
            _marker: PhantomData,
        })
    }
}

fn downcast<T: Entity>(handle: &AnyRef) -> Result<Ref<T>, Error> {
    handle.downcast::<T>().ok_or_else(|| {
        Error::Type(TypeError {
            expected: T::NAME,
            actual: handle.entity_name().to_string(),
            column: None,
        })
    })
}

// ============================================================================
// Streams
// ============================================================================

/// Entities of one query, materialized one row at a time.
///
/// Borrows the session mutably: each pulled entity joins its identity map.
pub struct EntityStream<'s, E: Executor, T: Entity> {
    session: &'s mut Session<E>,
    rows: RowStream,
    fetched: Vec<&'static str>,
    seen: HashSet<usize>,
    _marker: PhantomData<fn() -> T>,
}

impl<E: Executor, T: Entity> EntityStream<'_, E, T> {
    /// Pull the next entity, or `None` when the rows are exhausted.
    pub async fn next(&mut self, cx: &Cx) -> Outcome<Option<Ref<T>>, Error> {
        loop {
            let Some(row) = self.rows.next() else {
                return Outcome::Ok(None);
            };
            let row = try_result!(row);
            let mut fresh = Vec::new();
            let handles = try_result!(self.session.adopt_rows(
                T::NAME,
                std::slice::from_ref(&row),
                &self.fetched,
                &mut fresh,
            ));
            try_outcome!(self.session.resolve(cx, fresh).await);
            if let Some(handle) = handles.into_iter().next() {
                if self.seen.insert(handle.addr()) {
                    return Outcome::Ok(Some(try_result!(downcast::<T>(&handle))));
                }
            }
        }
    }

    /// Drain the remaining entities.
    pub async fn collect_all(mut self, cx: &Cx) -> Outcome<Vec<Ref<T>>, Error> {
        let mut out = Vec::new();
        while let Some(entity) = try_outcome!(self.next(cx).await) {
            out.push(entity);
        }
        Outcome::Ok(out)
    }
}

impl<E: Executor, T: Entity> std::fmt::Debug for EntityStream<'_, E, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStream")
            .field("entity", &T::NAME)
            .field("rows", &self.rows)
            .field("emitted", &self.seen.len())
            .finish()
    }
}

/// Projections of one query, mapped one row at a time.
pub struct ProjectionStream<P: Projection> {
    rows: RowStream,
    _marker: PhantomData<fn() -> P>,
}

impl<P: Projection> Iterator for ProjectionStream<P> {
    type Item = Result<P, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let row = self.rows.next()?;
        Some(row.and_then(|row| P::from_tuple(&Tuple::new(row))))
    }
}

impl<P: Projection> std::fmt::Debug for ProjectionStream<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionStream").field("rows", &self.rows).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use reel_core::{
        Association, Cardinality, CascadePolicy, ConstraintKind, Date, EdgeSchema,
        ElementCollectionSchema, EntitySchema, FieldSchema, Formula, IdentitySchema, Inverse,
        Related, RelatedSet, SqlType, Value, WriteKind, unknown_field,
    };
    use reel_memory::{MemoryConnection, MemoryStore};
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct Author {
        id: Option<i64>,
        name: String,
        pen_name: Option<String>,
        born: Option<Date>,
        born_year: Option<i32>,
        books: Inverse<Book>,
    }

    impl Entity for Author {
        const NAME: &'static str = "Author";

        fn schema() -> EntitySchema {
            EntitySchema::new(
                "Author",
                "authors",
                IdentitySchema::new("id", IdGeneration::Sequence("author_seq")),
            )
            .field(FieldSchema::new("name", SqlType::Text).max_length(20))
            .field(
                FieldSchema::new("pen_name", SqlType::Text)
                    .nullable()
                    .max_length(20)
                    .empty_as_null(),
            )
            .field(FieldSchema::new("born", SqlType::Date).nullable())
            .field(FieldSchema::new("born_year", SqlType::Integer).derived(Formula::YearOf("born")))
            .edge(EdgeSchema::inverse("books", "Book", Cardinality::OneToMany, "author"))
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
                ("pen_name", Value::from(self.pen_name.clone())),
                ("born", Value::from(self.born)),
                ("born_year", Value::from(self.born_year)),
            ]
        }

        fn set_scalar(&mut self, field: &str, value: Value) -> reel_core::Result<()> {
            match field {
                "name" => self.name = value.try_into()?,
                "pen_name" => self.pen_name = value.try_into()?,
                "born" => self.born = value.try_into()?,
                "born_year" => self.born_year = value.try_into()?,
                other => return Err(unknown_field(Self::NAME, other)),
            }
            Ok(())
        }

        fn association(&self, edge: &str) -> Option<&dyn Association> {
            match edge {
                "books" => Some(&self.books),
                _ => None,
            }
        }

        fn association_mut(&mut self, edge: &str) -> Option<&mut dyn Association> {
            match edge {
                "books" => Some(&mut self.books),
                _ => None,
            }
        }
    }

    #[derive(Debug, Default)]
    struct Book {
        id: Option<i64>,
        title: String,
        author: Related<Author>,
        readers: RelatedSet<Author>,
        reviews: Inverse<Review>,
        tags: Vec<String>,
    }

    impl Entity for Book {
        const NAME: &'static str = "Book";

        fn schema() -> EntitySchema {
            EntitySchema::new("Book", "books", IdentitySchema::new("id", IdGeneration::Identity))
                .field(
                    FieldSchema::new("title", SqlType::Text)
                        .max_length(30)
                        .empty_as_null(),
                )
                .edge(
                    EdgeSchema::many_to_one("author", "Author", "author_id")
                        .cascade(CascadePolicy::Persist),
                )
                .edge(EdgeSchema::many_to_many(
                    "readers",
                    "Author",
                    "book_readers",
                    "book_id",
                    "author_id",
                ))
                .edge(
                    EdgeSchema::inverse("reviews", "Review", Cardinality::OneToMany, "book")
                        .cascade(CascadePolicy::PersistRemove),
                )
                .element_collection(ElementCollectionSchema::new(
                    "tags",
                    "book_tags",
                    "book_id",
                    "tag",
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
            vec![("title", Value::from(&self.title))]
        }

        fn set_scalar(&mut self, field: &str, value: Value) -> reel_core::Result<()> {
            match field {
                "title" => self.title = Option::<String>::try_from(value)?.unwrap_or_default(),
                other => return Err(unknown_field(Self::NAME, other)),
            }
            Ok(())
        }

        fn association(&self, edge: &str) -> Option<&dyn Association> {
            match edge {
                "author" => Some(&self.author),
                "readers" => Some(&self.readers),
                "reviews" => Some(&self.reviews),
                _ => None,
            }
        }

        fn association_mut(&mut self, edge: &str) -> Option<&mut dyn Association> {
            match edge {
                "author" => Some(&mut self.author),
                "readers" => Some(&mut self.readers),
                "reviews" => Some(&mut self.reviews),
                _ => None,
            }
        }

        fn elements(&self, collection: &str) -> Option<Vec<Value>> {
            (collection == "tags").then(|| self.tags.iter().map(Value::from).collect())
        }

        fn set_elements(&mut self, collection: &str, values: Vec<Value>) -> reel_core::Result<()> {
            if collection != "tags" {
                return Err(unknown_field(Self::NAME, collection));
            }
            self.tags = values
                .into_iter()
                .map(String::try_from)
                .collect::<reel_core::Result<_>>()?;
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct Review {
        id: Option<i64>,
        text: String,
        book: Related<Book>,
    }

    impl Entity for Review {
        const NAME: &'static str = "Review";

        fn schema() -> EntitySchema {
            EntitySchema::new("Review", "reviews", IdentitySchema::new("id", IdGeneration::Identity))
                .field(FieldSchema::new("text", SqlType::Text))
                .edge(EdgeSchema::many_to_one("book", "Book", "book_id").required())
        }

        fn identity(&self) -> Option<i64> {
            self.id
        }

        fn set_identity(&mut self, identity: Option<i64>) {
            self.id = identity;
        }

        fn scalars(&self) -> Vec<(&'static str, Value)> {
            vec![("text", Value::from(&self.text))]
        }

        fn set_scalar(&mut self, field: &str, value: Value) -> reel_core::Result<()> {
            match field {
                "text" => self.text = value.try_into()?,
                other => return Err(unknown_field(Self::NAME, other)),
            }
            Ok(())
        }

        fn association(&self, edge: &str) -> Option<&dyn Association> {
            match edge {
                "book" => Some(&self.book),
                _ => None,
            }
        }

        fn association_mut(&mut self, edge: &str) -> Option<&mut dyn Association> {
            match edge {
                "book" => Some(&mut self.book),
                _ => None,
            }
        }
    }

    fn registry() -> Registry {
        Registry::builder()
            .register::<Author>()
            .register::<Book>()
            .register::<Review>()
            .build()
            .unwrap()
    }

    fn setup() -> (MemoryStore, Session<MemoryConnection>) {
        let registry = registry();
        let store = MemoryStore::from_registry(&registry).unwrap();
        let session = Session::new(store.connect(), registry);
        (store, session)
    }

    fn run<F: std::future::Future>(future: F) -> F::Output {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        rt.block_on(future)
    }

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
        match outcome {
            Outcome::Err(e) => e,
            other => std::panic::panic_any(format!("expected an error, got: {other:?}")),
        }
    }

    fn author(name: &str) -> Ref<Author> {
        Ref::new(Author {
            name: name.to_string(),
            ..Author::default()
        })
    }

    fn book(title: &str, by: &Ref<Author>) -> Ref<Book> {
        Ref::new(Book {
            title: title.to_string(),
            author: Related::to(by),
            ..Book::default()
        })
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert!(config.auto_begin);
        assert!(!config.auto_flush);
        assert_eq!(config.dialect, Dialect::Postgres);

        let config = SessionConfig::default()
            .auto_begin(false)
            .auto_flush(true)
            .dialect(Dialect::Sqlite);
        assert!(!config.auto_begin);
        assert!(config.auto_flush);
        assert_eq!(config.dialect, Dialect::Sqlite);
    }

    #[test]
    fn register_cascades_and_find_returns_the_managed_instance() {
        let (store, mut session) = setup();
        let cx = Cx::for_testing();
        run(async {
            let ursula = author("Ursula");
            let novel = book("The Dispossessed", &ursula);
            let managed = unwrap_outcome(session.register(&cx, &novel).await);
            assert!(Ref::ptr_eq(&managed, &novel));
            assert!(session.contains(&ursula));
            assert!(ursula.identity().is_some(), "sequence identities are drawn at registration");
            assert_eq!(novel.identity(), None);
            assert_eq!(session.pending_counts().new, 2);

            let result = unwrap_outcome(session.flush(&cx).await);
            assert_eq!(result.inserted, 2);
            let id = novel.identity().unwrap();

            let found = unwrap_outcome(session.find::<Book>(&cx, id).await).unwrap();
            assert!(Ref::ptr_eq(&found, &novel));
            let queried = unwrap_outcome(session.query(&cx, &Select::<Book>::new()).await);
            assert_eq!(queried.len(), 1);
            assert!(Ref::ptr_eq(&queried[0], &novel));

            let again = unwrap_outcome(session.register(&cx, &novel).await);
            assert!(Ref::ptr_eq(&again, &novel));
            assert!(session.pending_counts().is_empty());
        });
        assert_eq!(store.row_count("books").unwrap(), 1);
        assert_eq!(store.row_count("authors").unwrap(), 1);
    }

    #[test]
    fn validation_fails_before_any_store_access() {
        let (store, mut session) = setup();
        let cx = Cx::for_testing();
        let before = store.statement_count();
        run(async {
            let ursula = author("Ursula");
            let untitled = book("", &ursula);
            let err = expect_err(session.register(&cx, &untitled).await);
            match err {
                Error::Validation(validation) => {
                    assert_eq!(validation.entity, "Book");
                    assert_eq!(validation.fields(), ["title"]);
                }
                other => panic!("expected a validation error, got {other:?}"),
            }
            assert!(!session.contains(&untitled));
            assert!(!session.contains(&ursula));
            assert_eq!(ursula.identity(), None);
        });
        assert_eq!(store.statement_count(), before);
    }

    #[test]
    fn unpersisted_references_are_rejected() {
        let (store, mut session) = setup();
        let cx = Cx::for_testing();
        run(async {
            let ursula = author("Ursula");
            let novel = book("Lathe of Heaven", &ursula);
            let stranger = author("Stranger");
            novel.write().readers.insert(&stranger);
            unwrap_outcome(session.register(&cx, &novel).await);

            let err = expect_err(session.flush(&cx).await);
            match err {
                Error::UnpersistedReference(reference) => {
                    assert_eq!(reference.entity, "Book");
                    assert_eq!(reference.edge, "readers");
                    assert_eq!(reference.target, "Author");
                }
                other => panic!("expected an unpersisted reference, got {other:?}"),
            }
            assert_eq!(novel.identity(), None);

            unwrap_outcome(session.register(&cx, &stranger).await);
            unwrap_outcome(session.flush(&cx).await);
        });
        assert_eq!(store.row_count("book_readers").unwrap(), 1);
    }

    #[test]
    fn join_rows_and_elements_are_sets() {
        let (store, mut session) = setup();
        let cx = Cx::for_testing();
        run(async {
            let ursula = author("Ursula");
            let reader = author("Reader");
            let novel = book("Earthsea", &ursula);
            assert!(novel.write().readers.insert(&reader));
            assert!(!novel.write().readers.insert(&reader));
            novel.write().tags = vec!["magic".into(), "magic".into(), "sea".into()];
            unwrap_outcome(session.register(&cx, &reader).await);
            unwrap_outcome(session.register(&cx, &novel).await);

            let first = unwrap_outcome(session.flush(&cx).await);
            assert_eq!(first.linked, 3);
            let second = unwrap_outcome(session.flush(&cx).await);
            assert!(second.is_empty());

            novel.write().readers.remove(&reader);
            novel.write().tags.retain(|t| t != "sea");
            let third = unwrap_outcome(session.flush(&cx).await);
            assert_eq!(third.unlinked, 2);
            assert_eq!(third.updated, 0);
        });
        assert_eq!(store.row_count("book_readers").unwrap(), 0);
        assert_eq!(store.row_count("book_tags").unwrap(), 1);
    }

    #[test]
    fn merge_copies_scalars_into_the_managed_instance() {
        let (store, mut session) = setup();
        let cx = Cx::for_testing();
        run(async {
            let ursula = author("Ursula");
            let novel = book("Always Coming Home", &ursula);
            unwrap_outcome(session.register(&cx, &novel).await);
            unwrap_outcome(session.commit(&cx).await);
            let id = novel.identity().unwrap();
            session.clear();

            let detached = Ref::new(Book {
                id: Some(id),
                title: "Always Coming Home (2nd)".into(),
                ..Book::default()
            });
            assert_eq!(session.state_of(&detached), EntityState::Detached);
            let managed = unwrap_outcome(session.merge(&cx, &detached).await);
            assert!(!Ref::ptr_eq(&managed, &detached));
            assert!(!session.contains(&detached));
            assert_eq!(managed.read().title, "Always Coming Home (2nd)");
            assert_eq!(managed.read().author.key(), ursula.identity());
            assert!(session.is_modified(&managed));

            let missing = Ref::new(Book {
                id: Some(id + 100),
                title: "Nowhere".into(),
                ..Book::default()
            });
            assert!(matches!(
                expect_err(session.merge(&cx, &missing).await),
                Error::NotFound { entity: "Book", .. }
            ));
            unwrap_outcome(session.commit(&cx).await);
        });
        let rows = store.rows("books").unwrap();
        assert_eq!(rows[0].get_named::<String>("title").unwrap(), "Always Coming Home (2nd)");
        assert!(rows[0].get_named::<Option<i64>>("author_id").unwrap().is_some());
    }

    #[test]
    fn removing_a_referenced_row_fails_and_leaves_the_session_usable() {
        let (store, mut session) = setup();
        let cx = Cx::for_testing();
        run(async {
            let ursula = author("Ursula");
            let novel = book("Tehanu", &ursula);
            unwrap_outcome(session.register(&cx, &novel).await);
            unwrap_outcome(session.flush(&cx).await);

            unwrap_outcome(session.remove(&cx, &ursula).await);
            assert_eq!(session.state_of(&ursula), EntityState::Removed);
            let err = expect_err(session.flush(&cx).await);
            match err {
                Error::Constraint(violation) => {
                    assert_eq!(violation.entity, "Author");
                    assert_eq!(violation.operation, WriteKind::Delete);
                    assert_eq!(violation.kind, ConstraintKind::ForeignKey);
                }
                other => panic!("expected a constraint violation, got {other:?}"),
            }
            assert_eq!(session.state_of(&ursula), EntityState::Removed);

            unwrap_outcome(session.register(&cx, &ursula).await);
            assert_eq!(session.state_of(&ursula), EntityState::Managed);
            assert!(unwrap_outcome(session.flush(&cx).await).is_empty());
        });
        assert_eq!(store.row_count("authors").unwrap(), 1);
    }

    #[test]
    fn cascade_remove_loads_lazy_children() {
        let (store, mut session) = setup();
        let cx = Cx::for_testing();
        run(async {
            let ursula = author("Ursula");
            let novel = book("The Word for World", &ursula);
            novel.write().tags = vec!["forest".into()];
            unwrap_outcome(session.register(&cx, &novel).await);
            for text in ["Great", "Grim"] {
                let review = Ref::new(Review {
                    text: text.into(),
                    book: Related::to(&novel),
                    ..Review::default()
                });
                unwrap_outcome(session.register(&cx, &review).await);
            }
            unwrap_outcome(session.commit(&cx).await);
            let id = novel.identity().unwrap();
            session.clear();

            let loaded = unwrap_outcome(session.find::<Book>(&cx, id).await).unwrap();
            unwrap_outcome(session.remove(&cx, &loaded).await);
            assert_eq!(session.pending_counts().deleted, 3);
            let result = unwrap_outcome(session.flush(&cx).await);
            assert_eq!(result.deleted, 3);
            assert_eq!(loaded.identity(), None);
            assert!(unwrap_outcome(session.find::<Book>(&cx, id).await).is_none());
        });
        assert_eq!(store.row_count("reviews").unwrap(), 0);
        assert_eq!(store.row_count("books").unwrap(), 0);
        assert_eq!(store.row_count("book_tags").unwrap(), 0);
        assert_eq!(store.row_count("authors").unwrap(), 1);
    }

    #[test]
    fn derived_fields_are_read_back_after_flush() {
        let (_store, mut session) = setup();
        let cx = Cx::for_testing();
        run(async {
            let ursula = author("Ursula");
            ursula.write().born = Some(Date::from_ymd(1929, 10, 21).unwrap());
            unwrap_outcome(session.register(&cx, &ursula).await);
            unwrap_outcome(session.flush(&cx).await);
            assert_eq!(ursula.read().born_year, Some(1929));

            ursula.write().born = None;
            let result = unwrap_outcome(session.flush(&cx).await);
            assert_eq!(result.updated, 1);
            assert_eq!(ursula.read().born_year, None);
        });
    }

    #[test]
    fn empty_text_is_stored_and_reloaded_as_null() {
        let (store, mut session) = setup();
        let cx = Cx::for_testing();
        run(async {
            let ursula = author("Ursula");
            ursula.write().pen_name = Some(String::new());
            unwrap_outcome(session.register(&cx, &ursula).await);
            unwrap_outcome(session.commit(&cx).await);
            let id = ursula.identity().unwrap();
            assert!(unwrap_outcome(session.flush(&cx).await).is_empty());

            session.clear();
            let reloaded = unwrap_outcome(session.find::<Author>(&cx, id).await).unwrap();
            assert!(!Ref::ptr_eq(&reloaded, &ursula));
            assert_eq!(reloaded.read().pen_name, None);
        });
        let rows = store.rows("authors").unwrap();
        assert_eq!(rows[0].get_named::<Option<String>>("pen_name").unwrap(), None);
    }

    #[test]
    fn lazy_views_resolve_only_through_their_session() {
        let (_store, mut session) = setup();
        let cx = Cx::for_testing();
        run(async {
            let ursula = author("Ursula");
            let novel = book("Planet of Exile", &ursula);
            unwrap_outcome(session.register(&cx, &novel).await);
            unwrap_outcome(session.commit(&cx).await);
            let author_id = ursula.identity().unwrap();
            session.clear();

            let loaded = unwrap_outcome(session.find::<Author>(&cx, author_id).await).unwrap();
            assert!(!loaded.read().books.is_loaded());
            let books: Vec<Ref<Book>> =
                unwrap_outcome(session.fetch(&cx, &loaded, "books").await);
            assert_eq!(books.len(), 1);
            assert_eq!(books[0].read().title, "Planet of Exile");
            assert!(Ref::ptr_eq(books[0].read().author.get().unwrap(), &loaded));

            session.clear();
            let err = expect_err(session.fetch::<Author, Book>(&cx, &loaded, "books").await);
            assert!(matches!(err, Error::DetachedLazyAccess(_)));
        });
    }

    #[test]
    fn constraint_failure_rolls_back_the_whole_flush() {
        let (store, mut session) = setup();
        let cx = Cx::for_testing();
        run(async {
            let ursula = author("Ursula");
            let short = book("Rocannon", &ursula);
            let long = book("A Title Far Too Long For The Column", &ursula);
            unwrap_outcome(session.register(&cx, &short).await);
            unwrap_outcome(session.register(&cx, &long).await);

            let err = expect_err(session.flush(&cx).await);
            match err {
                Error::Constraint(violation) => {
                    assert_eq!(violation.entity, "Book");
                    assert_eq!(violation.kind, ConstraintKind::Length);
                    assert_eq!(violation.operation, WriteKind::Insert);
                }
                other => panic!("expected a constraint violation, got {other:?}"),
            }
            assert_eq!(short.identity(), None);
            assert!(ursula.identity().is_some());
            assert_eq!(store.row_count("books").unwrap(), 0);
            assert_eq!(store.row_count("authors").unwrap(), 0);

            long.write().title = "City of Illusions".into();
            let result = unwrap_outcome(session.flush(&cx).await);
            assert_eq!(result.inserted, 3);
        });
        assert_eq!(store.row_count("books").unwrap(), 2);
    }

    #[test]
    fn removed_entities_leave_queries_and_cancel_pending_inserts() {
        let (_store, mut session) = setup();
        let cx = Cx::for_testing();
        run(async {
            let ursula = author("Ursula");
            let kept = book("Lavinia", &ursula);
            let dropped = book("Gifts", &ursula);
            unwrap_outcome(session.register(&cx, &kept).await);
            unwrap_outcome(session.register(&cx, &dropped).await);
            unwrap_outcome(session.remove(&cx, &dropped).await);
            assert_eq!(session.state_of(&dropped), EntityState::Transient);
            unwrap_outcome(session.flush(&cx).await);

            unwrap_outcome(session.remove(&cx, &kept).await);
            let found = unwrap_outcome(session.query(&cx, &Select::<Book>::new()).await);
            assert!(found.is_empty());
            assert_eq!(unwrap_outcome(session.count(&cx, &Select::<Book>::new()).await), 1);

            let stranger = author("Stranger");
            assert!(matches!(
                expect_err(session.remove(&cx, &stranger).await),
                Error::NotManaged(_)
            ));
        });
    }

    #[test]
    fn events_fire_around_flush_and_commit() {
        let (_store, mut session) = setup();
        let cx = Cx::for_testing();
        let flushes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&flushes);
        session.on_before_flush(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        session.on_before_commit(|| Err(Error::Custom("vetoed".into())));
        run(async {
            unwrap_outcome(session.register(&cx, &author("Ursula")).await);
            let err = expect_err(session.commit(&cx).await);
            assert!(matches!(err, Error::Custom(ref m) if m == "vetoed"));
            assert!(session.in_transaction());
        });
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
    }
}
