//! Lazy association resolution.
//!
//! Lazy edges hold a [`LazyPlaceholder`] stamped with the session token that
//! minted it. Resolution goes through the owning session and is refused once
//! that session was cleared, closed, or never managed the owner.

use reel_core::{
    AnyRef, Cx, DetachedLazyAccess, EdgeSchema, Entity, Error, Executor, Install, LazyPlaceholder,
    Outcome, Ref, Targets, TypeError, try_outcome, try_result,
};

use crate::Session;
use crate::load::column_statement;

fn detached(entity: &'static str, edge: &str, reason: &'static str) -> Error {
    Error::DetachedLazyAccess(DetachedLazyAccess {
        entity,
        edge: edge.to_string(),
        reason,
    })
}

fn downcast_all<U: Entity>(handles: Vec<AnyRef>) -> Result<Vec<Ref<U>>, Error> {
    handles
        .into_iter()
        .map(|handle| {
            handle.downcast::<U>().ok_or_else(|| {
                Error::Type(TypeError {
                    expected: U::NAME,
                    actual: handle.entity_name().to_string(),
                    column: None,
                })
            })
        })
        .collect()
}

impl<E: Executor> Session<E> {
    /// Mint a placeholder for `edge` of an owner managed by this session.
    pub(crate) fn placeholder(
        &self,
        owner_entity: &'static str,
        owner_identity: Option<i64>,
        edge: &'static str,
    ) -> LazyPlaceholder {
        LazyPlaceholder {
            owner_entity,
            owner_identity,
            edge,
            token: self.token,
        }
    }

    fn check_token(&self, placeholder: &LazyPlaceholder) -> Result<(), Error> {
        if placeholder.token == self.token {
            Ok(())
        } else {
            Err(detached(
                placeholder.owner_entity,
                placeholder.edge,
                "session was cleared or closed",
            ))
        }
    }

    // ========================================================================
    // Lazy Loading
    // ========================================================================

    /// Resolve the association `edge` of `owner` and return its targets.
    ///
    /// Loaded associations are returned as they are. Lazy ones are read
    /// through this session, which must manage `owner` and must not have
    /// been cleared since the placeholder was installed. Inverse views
    /// reflect the store, so pending in-memory changes to the owning side
    /// show up only after a flush.
    #[tracing::instrument(level = "debug", skip(self, cx, owner), fields(entity = T::NAME))]
    pub async fn fetch<T: Entity, U: Entity>(
        &mut self,
        cx: &Cx,
        owner: &Ref<T>,
        edge: &str,
    ) -> Outcome<Vec<Ref<U>>, Error> {
        let targets = try_outcome!(self.resolve_edge(cx, &owner.erase(), edge).await);
        Outcome::Ok(try_result!(downcast_all::<U>(targets)))
    }

    /// [`Session::fetch`] for to-one edges.
    pub async fn fetch_one<T: Entity, U: Entity>(
        &mut self,
        cx: &Cx,
        owner: &Ref<T>,
        edge: &str,
    ) -> Outcome<Option<Ref<U>>, Error> {
        let targets = try_outcome!(self.fetch::<T, U>(cx, owner, edge).await);
        Outcome::Ok(targets.into_iter().next())
    }

    pub(crate) async fn resolve_edge(
        &mut self,
        cx: &Cx,
        owner: &AnyRef,
        edge_name: &str,
    ) -> Outcome<Vec<AnyRef>, Error> {
        let registry = self.registry.clone();
        let edge: EdgeSchema = *try_result!(registry.edge(owner.entity_name(), edge_name));
        let Some(key) = self.map.key_of(owner) else {
            return Outcome::Err(detached(
                owner.entity_name(),
                edge.name,
                "owner is not managed by this session",
            ));
        };
        let Some(targets) = owner.targets(edge.name) else {
            return Outcome::Err(reel_core::unknown_field(owner.entity_name(), edge.name));
        };

        let mut fresh = Vec::new();
        let resolved = match targets {
            Targets::Loaded(targets) => return Outcome::Ok(targets),
            Targets::Unattached => {
                return Outcome::Err(detached(
                    owner.entity_name(),
                    edge.name,
                    "association was never attached to a session",
                ));
            }
            Targets::Keys(keys) => {
                let refs =
                    try_outcome!(self.resolve_keys(cx, edge.target, &keys, &mut fresh).await);
                try_result!(owner.install(edge.name, Install::Refs(refs.clone())));
                refs
            }
            Targets::Resolved { placeholder, keys } => {
                try_result!(self.check_token(&placeholder));
                try_outcome!(self.resolve_keys(cx, edge.target, &keys, &mut fresh).await)
            }
            Targets::Placeholder(placeholder) => {
                try_result!(self.check_token(&placeholder));
                if edge.is_owning() {
                    let keys: Vec<i64> = self
                        .map
                        .get(&key)
                        .and_then(|entry| entry.baseline.as_ref())
                        .and_then(|baseline| baseline.key(edge.name))
                        .into_iter()
                        .collect();
                    let refs =
                        try_outcome!(self.resolve_keys(cx, edge.target, &keys, &mut fresh).await);
                    try_result!(owner.install(edge.name, Install::Refs(refs.clone())));
                    refs
                } else {
                    let keys = match placeholder.owner_identity {
                        Some(id) => try_outcome!(self.inverse_keys(cx, &edge, id).await),
                        None => Vec::new(),
                    };
                    let refs =
                        try_outcome!(self.resolve_keys(cx, edge.target, &keys, &mut fresh).await);
                    try_result!(owner.install(edge.name, Install::Resolved { placeholder, keys }));
                    refs
                }
            }
        };
        tracing::debug!(owner = %key, edge = edge.name, loaded = resolved.len(), "Resolved association");
        try_outcome!(self.resolve(cx, fresh).await);
        Outcome::Ok(resolved)
    }

    /// Keys of the entities whose owning side of `edge` points at `owner`.
    async fn inverse_keys(
        &self,
        cx: &Cx,
        edge: &EdgeSchema,
        owner: i64,
    ) -> Outcome<Vec<i64>, Error> {
        let registry = self.registry.clone();
        let Some(mapped_by) = edge.mapped_by() else {
            return Outcome::Ok(Vec::new());
        };
        let target = try_result!(registry.describe(edge.target));
        let owning = try_result!(registry.edge(edge.target, mapped_by));
        let statement = if let Some(column) = owning.fk_column() {
            column_statement(target.table, target.identity.column, column, owner)
        } else if let Some((table, owner_column, target_column)) = owning.join_table() {
            column_statement(table, owner_column, target_column, owner)
        } else {
            return Outcome::Ok(Vec::new());
        };
        self.keys(cx, &statement).await
    }

    /// Put fresh placeholders on the inverse edges of `handle`.
    pub(crate) fn reset_inverse_views(&self, handle: &AnyRef) -> reel_core::Result<()> {
        let schema = self.registry.describe(handle.entity_name())?;
        for edge in schema.edges.iter().filter(|e| !e.is_owning()) {
            handle.install(
                edge.name,
                Install::Placeholder(self.placeholder(schema.name, handle.identity(), edge.name)),
            )?;
        }
        Ok(())
    }
}
