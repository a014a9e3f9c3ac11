//! Materialization of stored rows into managed instances.
//!
//! A row is adopted at most once per session: if its identity is already in
//! the identity map, the managed instance is returned unchanged. Fresh
//! instances get their eager associations resolved in a worklist, so loading
//! a graph never recurses.

use reel_core::{
    AnyRef, Cx, EntitySchema, Error, Executor, Expr, Install, Outcome, Result, Row,
    SelectStatement, Statement, TableRef, Value, try_outcome, try_result,
};
use reel_query::{ROOT_ALIAS, RowImage, entity_columns};

use crate::Session;
use crate::change_tracker::{Snapshot, distinct};
use crate::identity_map::{EntityKey, Entry};

/// Statement reading every persistent column of `schema` for rows matching
/// `filter`, in identity order.
pub(crate) fn load_statement(schema: &EntitySchema, filter: Expr) -> Statement {
    let mut select = SelectStatement::new(TableRef::new(schema.table, ROOT_ALIAS));
    select.columns = entity_columns(schema, ROOT_ALIAS, "");
    Statement::Select(
        select
            .filter(filter)
            .order_by(Expr::qualified(ROOT_ALIAS, schema.identity.column).asc()),
    )
}

/// Statement reading `select_column` of `table` where `key_column = key`.
pub(crate) fn column_statement(
    table: &str,
    select_column: &str,
    key_column: &str,
    key: i64,
) -> Statement {
    Statement::Select(
        SelectStatement::new(TableRef::new(table, ROOT_ALIAS))
            .column(Expr::qualified(ROOT_ALIAS, select_column), select_column)
            .filter(Expr::qualified(ROOT_ALIAS, key_column).eq(key))
            .order_by(Expr::qualified(ROOT_ALIAS, select_column).asc()),
    )
}

impl<E: Executor> Session<E> {
    /// Adopt one row image, returning the managed instance for its identity.
    ///
    /// Newly created instances are appended to `fresh` for resolution.
    pub(crate) fn adopt(
        &mut self,
        schema: &EntitySchema,
        image: &RowImage,
        fresh: &mut Vec<AnyRef>,
    ) -> Result<AnyRef> {
        let key = EntityKey::stored(schema.name, image.identity);
        if let Some(entry) = self.map.get(&key) {
            return Ok(entry.handle.clone());
        }

        let handle = self.registry.meta(schema.name)?.instantiate();
        handle.set_identity(Some(image.identity));
        for (field, value) in &image.scalars {
            handle.set_scalar(field, value.clone())?;
        }
        for (edge_name, fk) in &image.keys {
            let Some(edge) = schema.edge_named(edge_name) else {
                continue;
            };
            if edge.is_lazy() {
                handle.install(edge.name, Install::Keys(fk.iter().copied().collect()))?;
                handle.install(
                    edge.name,
                    Install::Placeholder(self.placeholder(schema.name, Some(image.identity), edge.name)),
                )?;
                continue;
            }
            let install = match fk {
                None => Install::Refs(Vec::new()),
                Some(target) => match self.map.get(&EntityKey::stored(edge.target, *target)) {
                    Some(entry) => Install::Refs(vec![entry.handle.clone()]),
                    None => Install::Keys(vec![*target]),
                },
            };
            handle.install(edge.name, install)?;
        }
        for edge in schema.edges.iter().filter(|e| !e.is_owning()) {
            handle.install(
                edge.name,
                Install::Placeholder(self.placeholder(schema.name, Some(image.identity), edge.name)),
            )?;
        }

        self.map
            .insert(key, Entry::loaded(handle.clone(), Snapshot::from_image(schema, image)));
        fresh.push(handle.clone());
        Ok(handle)
    }

    /// Adopt every entity in `rows`: fetch-joined targets first, then the
    /// root. Returns root instances in row order, duplicates and entities
    /// scheduled for removal excluded.
    pub(crate) fn adopt_rows(
        &mut self,
        root: &'static str,
        rows: &[Row],
        fetched: &[&'static str],
        fresh: &mut Vec<AnyRef>,
    ) -> Result<Vec<AnyRef>> {
        let registry = self.registry.clone();
        let schema = registry.describe(root)?;
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for row in rows {
            for edge_name in fetched {
                let edge = registry.edge(root, edge_name)?;
                let target = registry.describe(edge.target)?;
                if let Some(image) = RowImage::from_row(row, target, &format!("{edge_name}."))? {
                    self.adopt(target, &image, fresh)?;
                }
            }
            let Some(image) = RowImage::from_row(row, schema, "")? else {
                continue;
            };
            let handle = self.adopt(schema, &image, fresh)?;
            if self.is_scheduled_for_removal(&handle) {
                continue;
            }
            if seen.insert(handle.addr()) {
                out.push(handle);
            }
        }
        Ok(out)
    }

    /// Resolve the eager associations and element collections of freshly
    /// adopted instances, adopting whatever they reach.
    pub(crate) async fn resolve(&mut self, cx: &Cx, mut fresh: Vec<AnyRef>) -> Outcome<(), Error> {
        let registry = self.registry.clone();
        while let Some(handle) = fresh.pop() {
            let schema = try_result!(registry.describe(handle.entity_name()));
            let Some(id) = handle.identity() else {
                continue;
            };
            let key = EntityKey::stored(schema.name, id);

            for edge in schema.edges.iter().filter(|e| e.is_owning() && !e.is_lazy()) {
                if edge.fk_column().is_some() {
                    if let Some(reel_core::Targets::Keys(keys)) = handle.targets(edge.name) {
                        let refs = try_outcome!(self.resolve_keys(cx, edge.target, &keys, &mut fresh).await);
                        try_result!(handle.install(edge.name, Install::Refs(refs)));
                    }
                } else if let Some((table, owner_column, target_column)) = edge.join_table() {
                    let statement = column_statement(table, target_column, owner_column, id);
                    let keys = try_outcome!(self.keys(cx, &statement).await);
                    let refs = try_outcome!(self.resolve_keys(cx, edge.target, &keys, &mut fresh).await);
                    try_result!(handle.install(edge.name, Install::Refs(refs)));
                    if let Some(baseline) = self.map.get_mut(&key).and_then(|e| e.baseline.as_mut()) {
                        baseline.links.insert(edge.name, keys.into_iter().collect());
                    }
                }
            }

            for collection in &schema.elements {
                let statement = column_statement(
                    collection.table,
                    collection.value_column,
                    collection.owner_column,
                    id,
                );
                let rows = try_outcome!(self.rows(cx, &statement).await);
                let values: Vec<Value> = rows.iter().filter_map(|r| r.get(0).cloned()).collect();
                try_result!(handle.set_elements(collection.name, values.clone()));
                if let Some(baseline) = self.map.get_mut(&key).and_then(|e| e.baseline.as_mut()) {
                    baseline.elements.insert(collection.name, distinct(values));
                }
            }
        }
        Outcome::Ok(())
    }

    /// Managed instances for `keys`, loading the ones not in the map.
    ///
    /// Keys with no stored row are skipped.
    pub(crate) async fn resolve_keys(
        &mut self,
        cx: &Cx,
        entity: &'static str,
        keys: &[i64],
        fresh: &mut Vec<AnyRef>,
    ) -> Outcome<Vec<AnyRef>, Error> {
        let registry = self.registry.clone();
        let schema = try_result!(registry.describe(entity));
        let missing: Vec<i64> = keys
            .iter()
            .copied()
            .filter(|k| !self.map.contains_key(&EntityKey::stored(entity, *k)))
            .collect();
        if !missing.is_empty() {
            let filter = Expr::qualified(ROOT_ALIAS, schema.identity.column).in_list(missing);
            let rows = try_outcome!(self.rows(cx, &load_statement(schema, filter)).await);
            for row in &rows {
                if let Some(image) = try_result!(RowImage::from_row(row, schema, "")) {
                    try_result!(self.adopt(schema, &image, fresh));
                }
            }
        }
        Outcome::Ok(
            keys.iter()
                .filter_map(|k| self.map.get(&EntityKey::stored(entity, *k)))
                .map(|entry| entry.handle.clone())
                .collect(),
        )
    }

    /// Load the instance stored under `identity`, through the map.
    pub(crate) async fn load_one(
        &mut self,
        cx: &Cx,
        entity: &'static str,
        identity: i64,
    ) -> Outcome<Option<AnyRef>, Error> {
        let mut fresh = Vec::new();
        let found = try_outcome!(self.resolve_keys(cx, entity, &[identity], &mut fresh).await);
        try_outcome!(self.resolve(cx, fresh).await);
        Outcome::Ok(found.into_iter().next())
    }

    /// Run a single-column key query.
    pub(crate) async fn keys(&self, cx: &Cx, statement: &Statement) -> Outcome<Vec<i64>, Error> {
        let rows = try_outcome!(self.rows(cx, statement).await);
        let mut keys = Vec::with_capacity(rows.len());
        for row in &rows {
            keys.push(try_result!(row.get_as::<i64>(0)));
        }
        Outcome::Ok(keys)
    }

    pub(crate) async fn rows(&self, cx: &Cx, statement: &Statement) -> Outcome<Vec<Row>, Error> {
        tracing::trace!(sql = %statement.to_sql(self.config.dialect, 0).0, "Reading");
        self.executor.query(cx, statement, &[]).await
    }
}
