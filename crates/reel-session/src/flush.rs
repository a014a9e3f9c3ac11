//! Flush scheduling and execution.
//!
//! A flush turns the tracked state of a session into writes, in this order:
//!
//! 1. **Inserts**, parents before the children that reference them. Cycles
//!    through nullable foreign keys are broken by inserting NULL and
//!    patching the key afterwards.
//! 2. **Updates** of changed columns.
//! 3. **Unlinks** then **links** of join-table rows and element values.
//! 4. **Deletes**, children before their parents.
//! 5. Readback of store-derived fields.
//!
//! The whole sequence runs under a savepoint. Any failure rolls the store
//! back to it and reverts identities assigned in memory, so the session can
//! be corrected and flushed again.

use std::collections::HashSet;

use reel_core::{
    AnyRef, ConstraintKind, ConstraintViolation, Cx, EntitySchema, Error, ExecResult, Executor,
    Expr, IdGeneration, Outcome, QueryErrorKind, Registry, Result, Statement, Targets,
    UnpersistedReference, Value, WriteKind, try_outcome, try_result,
};

use crate::change_tracker::{Delta, Snapshot};
use crate::identity_map::{EntityKey, EntryState};
use crate::{Session, SessionEvent};

/// Counts of the writes one flush performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Join-table rows and element values written.
    pub linked: usize,
    /// Join-table rows and element values removed.
    pub unlinked: usize,
}

impl FlushResult {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.linked + self.unlinked
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// One scheduled insert.
#[derive(Debug, Clone)]
pub(crate) struct InsertStep {
    pub key: EntityKey,
    pub handle: AnyRef,
    /// Foreign-key edges written as NULL and patched after every insert.
    pub deferred: Vec<&'static str>,
}

/// Bookkeeping needed to finish or undo a flush.
#[derive(Debug, Default)]
struct FlushWork {
    /// Provisional keys and the identities the store assigned them.
    assigned: Vec<(EntityKey, AnyRef)>,
    /// Inserted or updated instances with derived fields to read back.
    readback: Vec<AnyRef>,
    result: FlushResult,
}

/// Attribute a store constraint failure to the write that caused it.
fn attribute(err: Error, entity: &'static str, identity: Option<i64>, operation: WriteKind) -> Error {
    match err {
        Error::Query(source) if source.kind == QueryErrorKind::Constraint => {
            Error::Constraint(ConstraintViolation {
                entity,
                identity,
                operation,
                kind: ConstraintKind::from_sqlstate(source.sqlstate.as_deref()),
                source,
            })
        }
        other => other,
    }
}

fn stale(entity: &'static str, identity: i64, operation: WriteKind) -> Error {
    Error::StaleState(reel_core::StaleState {
        entity,
        identity,
        operation,
    })
}

fn by_identity(column: &str, index: usize) -> Expr {
    Expr::col(column).eq(Expr::placeholder(index))
}

/// Foreign-key targets of `handle` that are themselves awaiting insert.
fn pending_targets(
    schema: &EntitySchema,
    handle: &AnyRef,
    pending: &HashSet<usize>,
) -> Vec<(&'static str, usize, bool)> {
    let mut deps = Vec::new();
    for edge in schema.foreign_keys() {
        if let Some(Targets::Loaded(targets)) = handle.targets(edge.name) {
            for target in targets {
                if pending.contains(&target.addr()) {
                    deps.push((edge.name, target.addr(), edge.fk_nullable()));
                }
            }
        }
    }
    deps
}

/// Order pending inserts so every referenced row exists first.
///
/// Registration order is kept among independent entities. When only a cycle
/// remains, the first entity whose unmet references are all nullable goes
/// next with those references deferred.
pub(crate) fn order_inserts(
    registry: &Registry,
    pending: Vec<(EntityKey, AnyRef)>,
) -> Result<Vec<InsertStep>> {
    let mut remaining: Vec<(EntityKey, AnyRef, Vec<(&'static str, usize, bool)>)> = Vec::new();
    let addrs: HashSet<usize> = pending.iter().map(|(_, h)| h.addr()).collect();
    for (key, handle) in pending {
        let schema = registry.describe(key.entity)?;
        let deps = pending_targets(schema, &handle, &addrs);
        remaining.push((key, handle, deps));
    }

    let mut done: HashSet<usize> = HashSet::new();
    let mut steps = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let ready = remaining
            .iter()
            .position(|(_, _, deps)| deps.iter().all(|(_, addr, _)| done.contains(addr)));
        let (index, deferred) = match ready {
            Some(index) => (index, Vec::new()),
            None => {
                let breakable = remaining.iter().position(|(_, _, deps)| {
                    deps.iter()
                        .all(|(_, addr, nullable)| done.contains(addr) || *nullable)
                });
                let Some(index) = breakable else {
                    let names: Vec<String> =
                        remaining.iter().map(|(key, _, _)| key.to_string()).collect();
                    return Err(Error::Custom(format!(
                        "cannot order inserts: {} reference each other through required foreign keys",
                        names.join(", ")
                    )));
                };
                let deferred = remaining[index]
                    .2
                    .iter()
                    .filter(|(_, addr, _)| !done.contains(addr))
                    .map(|(edge, _, _)| *edge)
                    .collect();
                (index, deferred)
            }
        };
        let (key, handle, _) = remaining.remove(index);
        done.insert(handle.addr());
        steps.push(InsertStep {
            key,
            handle,
            deferred,
        });
    }
    Ok(steps)
}

/// Order removed entities so rows are deleted before the rows they reference.
pub(crate) fn order_deletes(
    registry: &Registry,
    removed: Vec<(EntityKey, AnyRef, Snapshot)>,
) -> Result<Vec<(EntityKey, AnyRef)>> {
    let mut remaining = removed;
    let mut ordered = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let mut next = 0;
        for (index, (candidate, _, _)) in remaining.iter().enumerate() {
            let mut referenced = false;
            for (other, _, baseline) in &remaining {
                if other == candidate {
                    continue;
                }
                let schema = registry.describe(other.entity)?;
                referenced |= schema.foreign_keys().any(|edge| {
                    edge.target == candidate.entity
                        && baseline.key(edge.name).is_some()
                        && baseline.key(edge.name) == candidate.identity()
                });
            }
            if !referenced {
                next = index;
                break;
            }
        }
        let (key, handle, _) = remaining.remove(next);
        ordered.push((key, handle));
    }
    Ok(ordered)
}

impl<E: Executor> Session<E> {
    // ========================================================================
    // Flush
    // ========================================================================

    /// Write every pending change to the store.
    ///
    /// Cascades persist through the managed graph, validates every managed
    /// entity, and checks that owning associations only point at managed
    /// or stored entities before any write is issued. Failures leave the
    /// store and the session as they were before the call.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        if let Err(e) = self.event_callbacks.fire(SessionEvent::BeforeFlush) {
            return Outcome::Err(e);
        }
        let registry = self.registry.clone();

        let roots = self.managed_handles();
        try_outcome!(self.persist_all(cx, roots, false).await);
        try_result!(self.validate_managed(&registry));
        try_result!(self.check_references(&registry));

        let mut pending = Vec::new();
        let mut removed = Vec::new();
        for key in self.map.keys_in_order() {
            let Some(entry) = self.map.get(&key) else {
                continue;
            };
            match (entry.state, &entry.baseline) {
                (EntryState::Managed, None) => pending.push((key, entry.handle.clone())),
                (EntryState::Removed, Some(baseline)) => {
                    removed.push((key, entry.handle.clone(), baseline.clone()));
                }
                _ => {}
            }
        }
        let inserts = try_result!(order_inserts(&registry, pending));
        let deletes = try_result!(order_deletes(&registry, removed));

        if inserts.is_empty() && deletes.is_empty() && !try_result!(self.has_changes(&registry)) {
            tracing::debug!("Nothing to flush");
            if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterFlush) {
                return Outcome::Err(e);
            }
            return Outcome::Ok(FlushResult::default());
        }

        tracing::info!(
            inserts = inserts.len(),
            deletes = deletes.len(),
            "Executing flush plan"
        );
        let start = std::time::Instant::now();

        let private = if self.in_transaction {
            false
        } else {
            try_outcome!(self.executor.begin(cx).await);
            if self.config.auto_begin {
                self.in_transaction = true;
                false
            } else {
                true
            }
        };
        self.flushes += 1;
        let savepoint = format!("reel_flush_{}", self.flushes);
        if let Outcome::Err(e) = self.executor.savepoint(cx, &savepoint).await {
            if private {
                if let Outcome::Err(rollback) = self.executor.rollback(cx).await {
                    tracing::warn!(error = %rollback, "Rollback after failed savepoint failed");
                }
            }
            return Outcome::Err(e);
        }

        let mut work = FlushWork::default();
        let outcome = self.write_all(cx, &registry, &inserts, &deletes, &mut work).await;
        let failure = match outcome {
            Outcome::Ok(()) => {
                try_outcome!(self.executor.release(cx, &savepoint).await);
                if private {
                    try_outcome!(self.executor.commit(cx).await);
                }
                try_result!(self.finish_flush(&registry, &deletes, &work));
                tracing::info!(
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    inserted = work.result.inserted,
                    updated = work.result.updated,
                    deleted = work.result.deleted,
                    linked = work.result.linked,
                    unlinked = work.result.unlinked,
                    "Flush complete"
                );
                if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterFlush) {
                    return Outcome::Err(e);
                }
                return Outcome::Ok(work.result);
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        };

        tracing::warn!(savepoint = %savepoint, "Flush failed, rolling back");
        if let Outcome::Err(e) = self.executor.rollback_to(cx, &savepoint).await {
            tracing::warn!(error = %e, "Rollback to savepoint failed");
        }
        if let Outcome::Err(e) = self.executor.release(cx, &savepoint).await {
            tracing::warn!(error = %e, "Releasing savepoint failed");
        }
        if private {
            if let Outcome::Err(e) = self.executor.rollback(cx).await {
                tracing::warn!(error = %e, "Rollback of flush transaction failed");
            }
        }
        for (_, handle) in &work.assigned {
            handle.set_identity(None);
        }
        failure
    }

    async fn write_all(
        &mut self,
        cx: &Cx,
        registry: &Registry,
        inserts: &[InsertStep],
        deletes: &[(EntityKey, AnyRef)],
        work: &mut FlushWork,
    ) -> Outcome<(), Error> {
        // Inserts
        for step in inserts {
            let schema = try_result!(registry.describe(step.key.entity));
            let current = Snapshot::capture(schema, &step.handle, None);
            let mut columns = Vec::new();
            let mut params = Vec::new();
            if let Some(id) = step.handle.identity() {
                columns.push(schema.identity.column.to_string());
                params.push(Value::BigInt(id));
            }
            for field in schema.writable_fields() {
                columns.push(field.column.to_string());
                params.push(current.scalar(field.name).cloned().unwrap_or(Value::Null));
            }
            for edge in schema.foreign_keys() {
                let Some(column) = edge.fk_column() else {
                    continue;
                };
                columns.push(column.to_string());
                params.push(if step.deferred.contains(&edge.name) {
                    Value::Null
                } else {
                    current.key(edge.name).map_or(Value::Null, Value::BigInt)
                });
            }
            let returning = matches!(schema.identity.generation, IdGeneration::Identity)
                .then(|| schema.identity.column.to_string());
            let statement = Statement::Insert {
                table: schema.table.to_string(),
                columns,
                returning,
            };
            let result = try_outcome!(
                self.execute(cx, &statement, &params, schema.name, step.handle.identity(), WriteKind::Insert)
                    .await
            );
            if step.handle.identity().is_none() {
                let Some(id) = result.generated_id else {
                    return Outcome::Err(Error::Custom(format!(
                        "store assigned no identity to inserted {}",
                        schema.name
                    )));
                };
                step.handle.set_identity(Some(id));
                work.assigned.push((step.key, step.handle.clone()));
            }
            if schema.derived_fields().next().is_some() {
                work.readback.push(step.handle.clone());
            }
            work.result.inserted += 1;
        }

        // Deferred foreign keys
        for step in inserts.iter().filter(|s| !s.deferred.is_empty()) {
            let schema = try_result!(registry.describe(step.key.entity));
            let current = Snapshot::capture(schema, &step.handle, None);
            let mut columns = Vec::new();
            let mut params = Vec::new();
            for edge in schema.foreign_keys().filter(|e| step.deferred.contains(&e.name)) {
                if let Some(column) = edge.fk_column() {
                    columns.push(column.to_string());
                    params.push(current.key(edge.name).map_or(Value::Null, Value::BigInt));
                }
            }
            let Some(id) = step.handle.identity() else {
                continue;
            };
            params.push(Value::BigInt(id));
            let statement = Statement::Update {
                table: schema.table.to_string(),
                filter: by_identity(schema.identity.column, columns.len() + 1),
                columns,
            };
            try_outcome!(
                self.execute(cx, &statement, &params, schema.name, Some(id), WriteKind::Update)
                    .await
            );
        }

        // Updates
        let mut deltas = Vec::new();
        for key in self.map.keys_in_order() {
            let Some(entry) = self.map.get(&key) else {
                continue;
            };
            if entry.state != EntryState::Managed {
                continue;
            }
            let handle = entry.handle.clone();
            let baseline = entry.baseline.clone();
            let Some(id) = handle.identity() else {
                continue;
            };
            let schema = try_result!(registry.describe(key.entity));
            let current = Snapshot::capture(schema, &handle, baseline.as_ref());
            let delta = Delta::between(schema, baseline.as_ref(), &current);
            if baseline.is_some() && delta.touches_row() {
                let mut params: Vec<Value> = delta.columns.iter().map(|(_, v)| v.clone()).collect();
                params.push(Value::BigInt(id));
                let statement = Statement::Update {
                    table: schema.table.to_string(),
                    columns: delta.columns.iter().map(|(c, _)| (*c).to_string()).collect(),
                    filter: by_identity(schema.identity.column, delta.columns.len() + 1),
                };
                let result = try_outcome!(
                    self.execute(cx, &statement, &params, schema.name, Some(id), WriteKind::Update)
                        .await
                );
                if result.rows_affected == 0 {
                    return Outcome::Err(stale(schema.name, id, WriteKind::Update));
                }
                if schema.derived_fields().next().is_some() {
                    work.readback.push(handle.clone());
                }
                work.result.updated += 1;
            }
            if !delta.is_empty() {
                deltas.push((schema.name, id, delta));
            }
        }

        // Unlinks, including every side row owned by a removed entity
        for (entity, id, delta) in &deltas {
            let schema = try_result!(registry.describe(entity));
            for (edge_name, target) in &delta.unlinked {
                let edge = try_result!(registry.edge(entity, edge_name));
                let Some((table, owner_column, target_column)) = edge.join_table() else {
                    continue;
                };
                let statement = Statement::Delete {
                    table: table.to_string(),
                    filter: by_identity(owner_column, 1).and(by_identity(target_column, 2)),
                };
                let params = [Value::BigInt(*id), Value::BigInt(*target)];
                let result = try_outcome!(
                    self.execute(cx, &statement, &params, entity, Some(*id), WriteKind::Unlink).await
                );
                work.result.unlinked += result.rows_affected as usize;
            }
            for (collection, value) in &delta.elements_removed {
                let Some(collection) = schema.element_named(collection) else {
                    continue;
                };
                let statement = Statement::Delete {
                    table: collection.table.to_string(),
                    filter: by_identity(collection.owner_column, 1)
                        .and(by_identity(collection.value_column, 2)),
                };
                let params = [Value::BigInt(*id), value.clone()];
                let result = try_outcome!(
                    self.execute(cx, &statement, &params, entity, Some(*id), WriteKind::Unlink).await
                );
                work.result.unlinked += result.rows_affected as usize;
            }
        }
        for (key, handle) in deletes {
            let Some(id) = handle.identity() else {
                continue;
            };
            let schema = try_result!(registry.describe(key.entity));
            let mut side_tables: Vec<(&str, &str)> = schema
                .edges
                .iter()
                .filter_map(|edge| edge.join_table().map(|(table, owner, _)| (table, owner)))
                .collect();
            side_tables.extend(schema.elements.iter().map(|c| (c.table, c.owner_column)));
            for (table, owner_column) in side_tables {
                let statement = Statement::Delete {
                    table: table.to_string(),
                    filter: by_identity(owner_column, 1),
                };
                let result = try_outcome!(
                    self.execute(cx, &statement, &[Value::BigInt(id)], schema.name, Some(id), WriteKind::Unlink)
                        .await
                );
                work.result.unlinked += result.rows_affected as usize;
            }
        }

        // Links
        for (entity, id, delta) in &deltas {
            let schema = try_result!(registry.describe(entity));
            for (edge_name, target) in &delta.linked {
                let edge = try_result!(registry.edge(entity, edge_name));
                let Some((table, owner_column, target_column)) = edge.join_table() else {
                    continue;
                };
                let statement = Statement::Insert {
                    table: table.to_string(),
                    columns: vec![owner_column.to_string(), target_column.to_string()],
                    returning: None,
                };
                let params = [Value::BigInt(*id), Value::BigInt(*target)];
                try_outcome!(
                    self.execute(cx, &statement, &params, entity, Some(*id), WriteKind::Link).await
                );
                work.result.linked += 1;
            }
            for (collection, value) in &delta.elements_added {
                let Some(collection) = schema.element_named(collection) else {
                    continue;
                };
                let statement = Statement::Insert {
                    table: collection.table.to_string(),
                    columns: vec![
                        collection.owner_column.to_string(),
                        collection.value_column.to_string(),
                    ],
                    returning: None,
                };
                let params = [Value::BigInt(*id), value.clone()];
                try_outcome!(
                    self.execute(cx, &statement, &params, entity, Some(*id), WriteKind::Link).await
                );
                work.result.linked += 1;
            }
        }

        // Deletes
        for (key, handle) in deletes {
            let Some(id) = handle.identity() else {
                continue;
            };
            let schema = try_result!(registry.describe(key.entity));
            let statement = Statement::Delete {
                table: schema.table.to_string(),
                filter: by_identity(schema.identity.column, 1),
            };
            let result = try_outcome!(
                self.execute(cx, &statement, &[Value::BigInt(id)], schema.name, Some(id), WriteKind::Delete)
                    .await
            );
            if result.rows_affected == 0 {
                return Outcome::Err(stale(schema.name, id, WriteKind::Delete));
            }
            work.result.deleted += 1;
        }

        // Derived fields
        for handle in &work.readback {
            try_outcome!(self.read_derived(cx, registry, handle).await);
        }
        Outcome::Ok(())
    }

    /// Re-read the store-derived fields of `handle`.
    async fn read_derived(&self, cx: &Cx, registry: &Registry, handle: &AnyRef) -> Outcome<(), Error> {
        let schema = try_result!(registry.describe(handle.entity_name()));
        let Some(id) = handle.identity() else {
            return Outcome::Ok(());
        };
        let mut select = reel_core::SelectStatement::new(reel_core::TableRef::new(
            schema.table,
            reel_query::ROOT_ALIAS,
        ));
        for field in schema.derived_fields() {
            if let Some(formula) = field.derived {
                select = select.column(formula.to_expr(Some(reel_query::ROOT_ALIAS)), field.name);
            }
        }
        let select = select.filter(
            Expr::qualified(reel_query::ROOT_ALIAS, schema.identity.column).eq(id),
        );
        let rows = try_outcome!(self.rows(cx, &Statement::Select(select)).await);
        let Some(row) = rows.first() else {
            return Outcome::Ok(());
        };
        for field in schema.derived_fields() {
            if let Some(value) = row.get_by_name(field.name) {
                try_result!(handle.set_scalar(field.name, value.clone()));
            }
        }
        Outcome::Ok(())
    }

    /// Apply the outcome of a successful flush to the identity map.
    fn finish_flush(
        &mut self,
        registry: &Registry,
        deletes: &[(EntityKey, AnyRef)],
        work: &FlushWork,
    ) -> Result<()> {
        for (key, handle) in &work.assigned {
            if let Some(id) = handle.identity() {
                self.map.rekey(key, id);
            }
        }
        for (key, handle) in deletes {
            let key = self.map.key_of(handle).unwrap_or(*key);
            self.map.remove(&key);
            handle.set_identity(None);
        }
        let keys = self.map.keys_in_order();
        for key in keys {
            let Some(entry) = self.map.get(&key) else {
                continue;
            };
            let handle = entry.handle.clone();
            let schema = registry.describe(key.entity)?;
            let baseline = Snapshot::capture(schema, &handle, entry.baseline.as_ref());
            if let Some(entry) = self.map.get_mut(&key) {
                entry.baseline = Some(baseline);
            }
            self.reset_inverse_views(&handle)?;
        }
        Ok(())
    }

    /// Whether any managed, stored entity differs from its baseline.
    fn has_changes(&self, registry: &Registry) -> Result<bool> {
        for (key, entry) in self.map.iter() {
            let Some(baseline) = &entry.baseline else {
                return Ok(true);
            };
            let schema = registry.describe(key.entity)?;
            let current = Snapshot::capture(schema, &entry.handle, Some(baseline));
            if !Delta::between(schema, Some(baseline), &current).is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Validate the scalars of every managed entity.
    fn validate_managed(&self, registry: &Registry) -> Result<()> {
        for key in self.map.keys_in_order() {
            let Some(entry) = self.map.get(&key) else {
                continue;
            };
            if entry.state != EntryState::Managed {
                continue;
            }
            let schema = registry.describe(key.entity)?;
            let current = Snapshot::capture(schema, &entry.handle, entry.baseline.as_ref());
            reel_core::validate_scalars(schema, &current.scalars)?;
        }
        Ok(())
    }

    /// Every owning association must point at a managed or stored entity.
    fn check_references(&self, registry: &Registry) -> Result<()> {
        for key in self.map.keys_in_order() {
            let Some(entry) = self.map.get(&key) else {
                continue;
            };
            if entry.state != EntryState::Managed {
                continue;
            }
            let schema = registry.describe(key.entity)?;
            for edge in schema.edges.iter().filter(|e| e.is_owning()) {
                let Some(Targets::Loaded(targets)) = entry.handle.targets(edge.name) else {
                    continue;
                };
                for target in targets {
                    let managed = self.map.key_of(&target).is_some();
                    if !managed && target.identity().is_none() {
                        return Err(Error::UnpersistedReference(UnpersistedReference {
                            entity: schema.name,
                            edge: edge.name,
                            target: target.entity_name(),
                        }));
                    }
                }
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
        params: &[Value],
        entity: &'static str,
        identity: Option<i64>,
        operation: WriteKind,
    ) -> Outcome<ExecResult, Error> {
        tracing::trace!(
            sql = %statement.to_sql(self.config.dialect, params.len()).0,
            params = params.len(),
            "Writing"
        );
        match self.executor.execute(cx, statement, params).await {
            Outcome::Err(e) => Outcome::Err(attribute(e, entity, identity, operation)),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_core::{Association, EdgeSchema, Entity, IdentitySchema, Ref, Related};

    #[derive(Debug, Default)]
    struct Link {
        id: Option<i64>,
        up: Related<Link>,
        peer: Related<Link>,
    }

    impl Entity for Link {
        const NAME: &'static str = "Link";

        fn schema() -> EntitySchema {
            EntitySchema::new("Link", "links", IdentitySchema::new("id", IdGeneration::Identity))
                .edge(EdgeSchema::many_to_one("up", "Link", "up_id").required())
                .edge(EdgeSchema::many_to_one("peer", "Link", "peer_id"))
        }

        fn identity(&self) -> Option<i64> {
            self.id
        }

        fn set_identity(&mut self, identity: Option<i64>) {
            self.id = identity;
        }

        fn scalars(&self) -> Vec<(&'static str, Value)> {
            Vec::new()
        }

        fn set_scalar(&mut self, field: &str, _value: Value) -> Result<()> {
            Err(reel_core::unknown_field(Self::NAME, field))
        }

        fn association(&self, edge: &str) -> Option<&dyn Association> {
            match edge {
                "up" => Some(&self.up),
                "peer" => Some(&self.peer),
                _ => None,
            }
        }

        fn association_mut(&mut self, edge: &str) -> Option<&mut dyn Association> {
            match edge {
                "up" => Some(&mut self.up),
                "peer" => Some(&mut self.peer),
                _ => None,
            }
        }
    }

    fn registry() -> Registry {
        Registry::builder().register::<Link>().build().unwrap()
    }

    fn pending(links: &[&Ref<Link>]) -> Vec<(EntityKey, AnyRef)> {
        links
            .iter()
            .enumerate()
            .map(|(n, link)| {
                (
                    EntityKey {
                        entity: "Link",
                        id: crate::identity_map::KeyId::Provisional(n as u64 + 1),
                    },
                    link.erase(),
                )
            })
            .collect()
    }

    #[test]
    fn parents_are_inserted_first() {
        let child = Ref::new(Link::default());
        let parent = Ref::new(Link::default());
        child.write().up.set(Some(&parent));
        parent.write().up.set(Some(&parent));

        let steps = order_inserts(&registry(), pending(&[&child, &parent])).unwrap_err();
        assert!(matches!(steps, Error::Custom(_)));

        parent.write().up.set(None);
        let steps = order_inserts(&registry(), pending(&[&child, &parent])).unwrap();
        assert!(steps[0].handle.ptr_eq(&parent.erase()));
        assert!(steps[1].handle.ptr_eq(&child.erase()));
        assert!(steps.iter().all(|s| s.deferred.is_empty()));
    }

    #[test]
    fn nullable_cycles_are_deferred() {
        let a = Ref::new(Link::default());
        let b = Ref::new(Link::default());
        a.write().peer.set(Some(&b));
        b.write().peer.set(Some(&a));

        let steps = order_inserts(&registry(), pending(&[&a, &b])).unwrap();
        assert!(steps[0].handle.ptr_eq(&a.erase()));
        assert_eq!(steps[0].deferred, ["peer"]);
        assert!(steps[1].deferred.is_empty());
    }

    #[test]
    fn referencing_rows_are_deleted_first() {
        let registry = registry();
        let schema = registry.describe("Link").unwrap();
        let parent = Ref::new(Link {
            id: Some(1),
            ..Link::default()
        });
        let child = Ref::new(Link {
            id: Some(2),
            ..Link::default()
        });
        child.write().up.set(Some(&parent));

        let parent_baseline = Snapshot::capture(schema, &parent.erase(), None);
        let child_baseline = Snapshot::capture(schema, &child.erase(), None);
        let ordered = order_deletes(
            &registry,
            vec![
                (EntityKey::stored("Link", 1), parent.erase(), parent_baseline),
                (EntityKey::stored("Link", 2), child.erase(), child_baseline),
            ],
        )
        .unwrap();
        assert_eq!(ordered[0].0, EntityKey::stored("Link", 2));
        assert_eq!(ordered[1].0, EntityKey::stored("Link", 1));
    }

    #[test]
    fn constraint_errors_name_the_entity() {
        let source = reel_core::QueryError::constraint(
            ConstraintKind::Length,
            "links",
            Some("title".into()),
            "value too long",
        );
        let err = attribute(Error::Query(source), "Link", Some(3), WriteKind::Update);
        match err {
            Error::Constraint(violation) => {
                assert_eq!(violation.entity, "Link");
                assert_eq!(violation.identity, Some(3));
                assert_eq!(violation.kind, ConstraintKind::Length);
                assert_eq!(violation.operation, WriteKind::Update);
            }
            other => panic!("expected a constraint violation, got {other:?}"),
        }
        assert!(matches!(
            attribute(Error::Cancelled, "Link", None, WriteKind::Insert),
            Error::Cancelled
        ));
    }
}
