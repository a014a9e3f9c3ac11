//! Cascade engine.
//!
//! Walks association edges whose cascade policy includes an operation and
//! collects the entities the operation reaches. Traversal is iterative and
//! cycle-safe: every entity is visited once, recognised either by instance
//! address or by `(entity, identity)`.
//!
//! Persist follows only targets already held in memory, since an unloaded
//! target is by definition stored. Remove must also reach unloaded targets;
//! those are reported as [`Step::Unloaded`] for the session to resolve.

use std::collections::HashSet;

use reel_core::{AnyRef, EntitySchema, Registry, Result, Targets};

/// The lifecycle operation being cascaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeOp {
    Persist,
    Remove,
}

/// One edge crossed from a visited entity.
#[derive(Debug, Clone)]
pub enum Step {
    /// A target already in memory.
    Reached(AnyRef),
    /// An edge whose targets must be loaded first.
    Unloaded(&'static str),
}

/// Entities already visited by a traversal.
#[derive(Debug, Default)]
pub struct Visited {
    addrs: HashSet<usize>,
    keys: HashSet<(&'static str, i64)>,
}

impl Visited {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `handle`; false when it, or another instance of the same row,
    /// was seen before.
    pub fn first_visit(&mut self, handle: &AnyRef) -> bool {
        if !self.addrs.insert(handle.addr()) {
            return false;
        }
        match handle.identity() {
            Some(id) => self.keys.insert((handle.entity_name(), id)),
            None => true,
        }
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

/// Edges of `handle` that cascade `op`, with whatever targets are loaded.
pub fn cascade_steps(schema: &EntitySchema, handle: &AnyRef, op: CascadeOp) -> Vec<Step> {
    let mut steps = Vec::new();
    for edge in &schema.edges {
        let applies = match op {
            CascadeOp::Persist => edge.cascade.cascades_persist(),
            CascadeOp::Remove => edge.cascade.cascades_remove(),
        };
        if !applies {
            continue;
        }
        match handle.targets(edge.name) {
            Some(Targets::Loaded(targets)) => {
                steps.extend(targets.into_iter().map(Step::Reached));
            }
            Some(Targets::Keys(_) | Targets::Placeholder(_) | Targets::Resolved { .. }) => {
                if op == CascadeOp::Remove {
                    steps.push(Step::Unloaded(edge.name));
                }
            }
            Some(Targets::Unattached) | None => {}
        }
    }
    steps
}

/// Every entity reached from `roots` through persist-cascading edges,
/// roots included, in discovery order.
pub fn persist_closure(registry: &Registry, roots: Vec<AnyRef>) -> Result<Vec<AnyRef>> {
    let mut visited = Visited::new();
    let mut reached = Vec::new();
    let mut queue: std::collections::VecDeque<AnyRef> = roots.into_iter().collect();
    while let Some(handle) = queue.pop_front() {
        if !visited.first_visit(&handle) {
            continue;
        }
        let schema = registry.describe(handle.entity_name())?;
        for step in cascade_steps(schema, &handle, CascadeOp::Persist) {
            if let Step::Reached(target) = step {
                queue.push_back(target);
            }
        }
        reached.push(handle);
    }
    tracing::trace!(reached = reached.len(), "Persist cascade walked");
    Ok(reached)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_core::{
        Association, CascadePolicy, EdgeSchema, Entity, IdGeneration, IdentitySchema, Ref,
        Related, Value,
    };

    #[derive(Debug, Default)]
    struct Node {
        id: Option<i64>,
        next: Related<Node>,
        other: Related<Node>,
    }

    impl Entity for Node {
        const NAME: &'static str = "Node";

        fn schema() -> EntitySchema {
            EntitySchema::new("Node", "nodes", IdentitySchema::new("id", IdGeneration::Identity))
                .edge(
                    EdgeSchema::many_to_one("next", "Node", "next_id")
                        .cascade(CascadePolicy::PersistRemove),
                )
                .edge(EdgeSchema::many_to_one("other", "Node", "other_id"))
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

        fn set_scalar(&mut self, field: &str, _value: Value) -> reel_core::Result<()> {
            Err(reel_core::unknown_field(Self::NAME, field))
        }

        fn association(&self, edge: &str) -> Option<&dyn Association> {
            match edge {
                "next" => Some(&self.next),
                "other" => Some(&self.other),
                _ => None,
            }
        }

        fn association_mut(&mut self, edge: &str) -> Option<&mut dyn Association> {
            match edge {
                "next" => Some(&mut self.next),
                "other" => Some(&mut self.other),
                _ => None,
            }
        }
    }

    fn registry() -> Registry {
        Registry::builder().register::<Node>().build().unwrap()
    }

    #[test]
    fn closure_follows_cascading_edges_and_stops_on_cycles() {
        let a = Ref::new(Node::default());
        let b = Ref::new(Node::default());
        let stranger = Ref::new(Node::default());
        a.write().next.set(Some(&b));
        b.write().next.set(Some(&a));
        a.write().other.set(Some(&stranger));

        let reached = persist_closure(&registry(), vec![a.erase()]).unwrap();
        assert_eq!(reached.len(), 2);
        assert!(reached[0].ptr_eq(&a.erase()));
        assert!(reached[1].ptr_eq(&b.erase()));
    }

    #[test]
    fn same_row_is_visited_once() {
        let mut visited = Visited::new();
        assert!(visited.first_visit(&Ref::new(Node { id: Some(1), ..Node::default() }).erase()));
        assert!(!visited.first_visit(&Ref::new(Node { id: Some(1), ..Node::default() }).erase()));
        assert!(visited.first_visit(&Ref::new(Node::default()).erase()));
    }

    #[test]
    fn remove_reports_unloaded_edges() {
        let node = Ref::new(Node::default());
        node.write()
            .next
            .install(reel_core::Install::Keys(vec![4]))
            .unwrap();
        let schema = Node::schema();
        let steps = cascade_steps(&schema, &node.erase(), CascadeOp::Remove);
        assert!(matches!(steps.as_slice(), [Step::Unloaded("next")]));
        assert!(cascade_steps(&schema, &node.erase(), CascadeOp::Persist).is_empty());
    }
}
