//! Change tracking and dirty detection.
//!
//! Every managed entity carries a baseline [`Snapshot`] of its last-known
//! persisted state: writable scalars, owning to-one keys, owning to-many key
//! sets and element sets. A flush captures the current state the same way
//! and writes only the [`Delta`] between the two.

use std::collections::{BTreeMap, BTreeSet};

use reel_core::{AnyRef, EntitySchema, Targets, Value};
use reel_query::RowImage;

/// Persistent state of one entity at a point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Writable scalar fields, normalized as they are written.
    pub scalars: Vec<(&'static str, Value)>,
    /// Foreign-key value per owning to-one edge.
    pub keys: BTreeMap<&'static str, Option<i64>>,
    /// Target keys per owning to-many edge.
    pub links: BTreeMap<&'static str, BTreeSet<i64>>,
    /// Members per element collection.
    pub elements: BTreeMap<&'static str, Vec<Value>>,
}

impl Snapshot {
    /// Baseline of an entity read from a row. Link and element sets start
    /// empty and are filled in as they are loaded.
    pub fn from_image(schema: &EntitySchema, image: &RowImage) -> Self {
        let scalars = schema
            .writable_fields()
            .map(|field| {
                let value = image
                    .scalars
                    .iter()
                    .find(|(name, _)| *name == field.name)
                    .map_or(Value::Null, |(_, v)| v.clone());
                (field.name, value)
            })
            .collect();
        Self {
            scalars,
            keys: image.keys.iter().copied().collect(),
            links: BTreeMap::new(),
            elements: BTreeMap::new(),
        }
    }

    /// Capture the current state of `handle`.
    ///
    /// Associations the entity has not loaded are taken from `baseline`:
    /// an untouched placeholder never reads as a change.
    pub fn capture(schema: &EntitySchema, handle: &AnyRef, baseline: Option<&Snapshot>) -> Self {
        let values = handle.scalars();
        let scalars = schema
            .writable_fields()
            .map(|field| {
                let value = values
                    .iter()
                    .find(|(name, _)| *name == field.name)
                    .map_or(Value::Null, |(_, v)| v.clone());
                (field.name, field.normalize(value))
            })
            .collect();

        let mut keys = BTreeMap::new();
        for edge in schema.foreign_keys() {
            let key = match handle.targets(edge.name) {
                Some(Targets::Loaded(refs)) => refs.first().and_then(|target| target.identity()),
                Some(Targets::Keys(stored)) => stored.first().copied(),
                _ => baseline.and_then(|b| b.key(edge.name)),
            };
            keys.insert(edge.name, key);
        }

        let mut links = BTreeMap::new();
        for edge in schema.edges.iter().filter(|e| e.join_table().is_some()) {
            let set = match handle.targets(edge.name) {
                Some(Targets::Loaded(refs)) => refs.iter().filter_map(|t| t.identity()).collect(),
                _ => baseline
                    .and_then(|b| b.links.get(edge.name).cloned())
                    .unwrap_or_default(),
            };
            links.insert(edge.name, set);
        }

        let mut elements = BTreeMap::new();
        for collection in &schema.elements {
            let members = match handle.elements(collection.name) {
                Some(values) => distinct(values),
                None => baseline
                    .and_then(|b| b.elements.get(collection.name).cloned())
                    .unwrap_or_default(),
            };
            elements.insert(collection.name, members);
        }

        Self {
            scalars,
            keys,
            links,
            elements,
        }
    }

    pub fn key(&self, edge: &str) -> Option<i64> {
        self.keys.get(edge).copied().flatten()
    }

    pub fn scalar(&self, field: &str) -> Option<&Value> {
        self.scalars
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, v)| v)
    }

    /// Overwrite the recorded scalars with freshly read values.
    pub fn set_scalars(&mut self, values: &[(&'static str, Value)]) {
        for (name, value) in &mut self.scalars {
            if let Some((_, fresh)) = values.iter().find(|(n, _)| *n == *name) {
                *value = fresh.clone();
            }
        }
    }
}

/// Drop repeated members, keeping first occurrences.
pub fn distinct(values: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(values.len());
    for value in values {
        if !out.iter().any(|v| v.same_as(&value)) {
            out.push(value);
        }
    }
    out
}

/// Writes needed to move an entity from its baseline to its current state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    /// Changed columns with their new values.
    pub columns: Vec<(&'static str, Value)>,
    /// Join-table rows to delete, by edge.
    pub unlinked: Vec<(&'static str, i64)>,
    /// Join-table rows to insert, by edge.
    pub linked: Vec<(&'static str, i64)>,
    pub elements_removed: Vec<(&'static str, Value)>,
    pub elements_added: Vec<(&'static str, Value)>,
}

impl Delta {
    /// Compare `current` against `baseline`; with no baseline every link and
    /// element is an addition.
    pub fn between(schema: &EntitySchema, baseline: Option<&Snapshot>, current: &Snapshot) -> Self {
        let mut delta = Delta::default();

        if let Some(baseline) = baseline {
            for field in schema.writable_fields() {
                let (Some(before), Some(after)) =
                    (baseline.scalar(field.name), current.scalar(field.name))
                else {
                    continue;
                };
                if before != after {
                    delta.columns.push((field.column, after.clone()));
                }
            }
            for edge in schema.foreign_keys() {
                let (Some(column), after) = (edge.fk_column(), current.key(edge.name)) else {
                    continue;
                };
                if baseline.key(edge.name) != after {
                    delta.columns.push((column, Value::from(after)));
                }
            }
        }

        let empty = BTreeSet::new();
        for (edge, now) in &current.links {
            let before = baseline
                .and_then(|b| b.links.get(edge))
                .unwrap_or(&empty);
            delta
                .unlinked
                .extend(before.difference(now).map(|key| (*edge, *key)));
            delta
                .linked
                .extend(now.difference(before).map(|key| (*edge, *key)));
        }

        for (collection, now) in &current.elements {
            let before: &[Value] = baseline
                .and_then(|b| b.elements.get(collection))
                .map_or(&[][..], Vec::as_slice);
            for value in before {
                if !now.iter().any(|v| v.same_as(value)) {
                    delta.elements_removed.push((*collection, value.clone()));
                }
            }
            for value in now {
                if !before.iter().any(|v| v.same_as(value)) {
                    delta.elements_added.push((*collection, value.clone()));
                }
            }
        }
        delta
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
            && self.unlinked.is_empty()
            && self.linked.is_empty()
            && self.elements_removed.is_empty()
            && self.elements_added.is_empty()
    }

    /// Does the delta need an UPDATE of the entity's own row?
    pub fn touches_row(&self) -> bool {
        !self.columns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_core::{
        Association, EdgeSchema, ElementCollectionSchema, Entity, FieldSchema, IdGeneration,
        IdentitySchema, Ref, Related, RelatedSet, Result, SqlType,
    };

    #[derive(Debug, Default)]
    struct Tag {
        id: Option<i64>,
    }

    impl Entity for Tag {
        const NAME: &'static str = "Tag";

        fn schema() -> EntitySchema {
            EntitySchema::new("Tag", "tags", IdentitySchema::new("id", IdGeneration::Identity))
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
    }

    #[derive(Debug, Default)]
    struct Post {
        id: Option<i64>,
        title: String,
        parent: Related<Tag>,
        tags: RelatedSet<Tag>,
        labels: Vec<String>,
    }

    impl Entity for Post {
        const NAME: &'static str = "Post";

        fn schema() -> EntitySchema {
            EntitySchema::new("Post", "posts", IdentitySchema::new("id", IdGeneration::Identity))
                .field(FieldSchema::new("title", SqlType::Text).empty_as_null().nullable())
                .edge(EdgeSchema::many_to_one("parent", "Tag", "parent_id"))
                .edge(EdgeSchema::many_to_many("tags", "Tag", "post_tags", "post_id", "tag_id"))
                .element_collection(ElementCollectionSchema::new(
                    "labels",
                    "post_labels",
                    "post_id",
                    "label",
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

        fn set_scalar(&mut self, field: &str, value: Value) -> Result<()> {
            match field {
                "title" => self.title = Option::<String>::try_from(value)?.unwrap_or_default(),
                other => return Err(reel_core::unknown_field(Self::NAME, other)),
            }
            Ok(())
        }

        fn association(&self, edge: &str) -> Option<&dyn Association> {
            match edge {
                "parent" => Some(&self.parent),
                "tags" => Some(&self.tags),
                _ => None,
            }
        }

        fn association_mut(&mut self, edge: &str) -> Option<&mut dyn Association> {
            match edge {
                "parent" => Some(&mut self.parent),
                "tags" => Some(&mut self.tags),
                _ => None,
            }
        }

        fn elements(&self, collection: &str) -> Option<Vec<Value>> {
            (collection == "labels").then(|| self.labels.iter().map(Value::from).collect())
        }
    }

    #[test]
    fn capture_normalizes_and_dedups() {
        let a = Ref::new(Tag { id: Some(1) });
        let post = Ref::new(Post {
            title: String::new(),
            labels: vec!["x".into(), "x".into(), "y".into()],
            ..Post::default()
        });
        post.write().tags.insert(&a);
        post.write().parent.set(Some(&a));

        let snapshot = Snapshot::capture(&Post::schema(), &post.erase(), None);
        assert_eq!(snapshot.scalar("title"), Some(&Value::Null));
        assert_eq!(snapshot.key("parent"), Some(1));
        assert_eq!(snapshot.links["tags"], BTreeSet::from([1]));
        assert_eq!(snapshot.elements["labels"].len(), 2);
    }

    #[test]
    fn delta_is_a_set_difference() {
        let schema = Post::schema();
        let a = Ref::new(Tag { id: Some(1) });
        let b = Ref::new(Tag { id: Some(2) });
        let post = Ref::new(Post {
            id: Some(5),
            title: "first".into(),
            labels: vec!["x".into()],
            ..Post::default()
        });
        post.write().tags.insert(&a);
        let baseline = Snapshot::capture(&schema, &post.erase(), None);

        {
            let mut p = post.write();
            p.title = "second".into();
            p.tags.remove(&a);
            p.tags.insert(&b);
            p.tags.insert(&b);
            p.labels = vec!["y".into()];
            p.parent.set(Some(&b));
        }
        let current = Snapshot::capture(&schema, &post.erase(), Some(&baseline));
        let delta = Delta::between(&schema, Some(&baseline), &current);
        assert_eq!(
            delta.columns,
            vec![("title", Value::from("second")), ("parent_id", Value::BigInt(2))]
        );
        assert_eq!(delta.unlinked, vec![("tags", 1)]);
        assert_eq!(delta.linked, vec![("tags", 2)]);
        assert_eq!(delta.elements_removed, vec![("labels", Value::from("x"))]);
        assert_eq!(delta.elements_added, vec![("labels", Value::from("y"))]);

        let unchanged = Delta::between(&schema, Some(&current), &current);
        assert!(unchanged.is_empty());
    }

    #[test]
    fn unloaded_associations_keep_their_baseline() {
        let schema = Post::schema();
        let mut baseline = Snapshot::default();
        baseline.keys.insert("parent", Some(9));
        baseline.links.insert("tags", BTreeSet::from([3, 4]));

        let post = Ref::new(Post::default());
        post.write()
            .parent
            .install(reel_core::Install::Keys(vec![9]))
            .unwrap();
        let mut current = Snapshot::capture(&schema, &post.erase(), Some(&baseline));
        assert_eq!(current.key("parent"), Some(9));
        // RelatedSet is always loaded: an empty set is a real change.
        assert!(current.links["tags"].is_empty());
        current.links.insert("tags", BTreeSet::from([3, 4]));
        let delta = Delta::between(&schema, Some(&baseline), &current);
        assert!(delta.columns.iter().all(|(c, _)| *c != "parent_id"));
    }
}
