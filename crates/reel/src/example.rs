//! Query by example.
//!
//! An [`Example`] pairs a probe entity with an [`ExampleMatcher`]. Every
//! non-null scalar of the probe becomes a condition, so fields that can
//! never be null (a plain `i32` year, say) take part unless their path is
//! ignored. Text fields are compared with the matcher's string mode.
//! Associations and element collections of the probe are not consulted.

use std::collections::{BTreeMap, BTreeSet};

use reel_core::{Entity, Error, Expr, Registry, Result, Value};
use reel_query::Select;

/// How a text field of the probe is compared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StringMatcher {
    #[default]
    Exact,
    Contains,
    StartsWith,
    EndsWith,
}

impl StringMatcher {
    fn apply(self, field: Expr, text: &str) -> Expr {
        match self {
            StringMatcher::Exact => field.eq(text),
            StringMatcher::Contains => field.contains(text),
            StringMatcher::StartsWith => field.starts_with(text),
            StringMatcher::EndsWith => field.ends_with(text),
        }
    }
}

/// Per-property rules of an example query.
#[derive(Debug, Clone, Default)]
pub struct ExampleMatcher {
    any: bool,
    default_matcher: StringMatcher,
    ignore_case: bool,
    matchers: BTreeMap<String, StringMatcher>,
    ignored: BTreeSet<String>,
}

impl ExampleMatcher {
    /// Every condition must hold.
    pub fn matching() -> Self {
        Self::default()
    }

    /// At least one condition must hold.
    pub fn matching_any() -> Self {
        Self {
            any: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_matcher(mut self, path: &str, matcher: StringMatcher) -> Self {
        self.matchers.insert(path.to_string(), matcher);
        self
    }

    /// Matcher for text fields without their own.
    #[must_use]
    pub fn with_string_matcher(mut self, matcher: StringMatcher) -> Self {
        self.default_matcher = matcher;
        self
    }

    #[must_use]
    pub fn with_ignore_case(mut self) -> Self {
        self.ignore_case = true;
        self
    }

    #[must_use]
    pub fn with_ignore_paths(mut self, paths: &[&str]) -> Self {
        self.ignored.extend(paths.iter().map(|p| (*p).to_string()));
        self
    }

    pub fn is_ignored(&self, path: &str) -> bool {
        self.ignored.contains(path)
    }
}

/// A probe entity and the rules for matching stored entities against it.
#[derive(Debug)]
pub struct Example<T: Entity> {
    probe: T,
    matcher: ExampleMatcher,
}

impl<T: Entity> Example<T> {
    /// Match every non-null field of `probe` exactly.
    pub fn of(probe: T) -> Self {
        Self::with_matcher(probe, ExampleMatcher::matching())
    }

    pub fn with_matcher(probe: T, matcher: ExampleMatcher) -> Self {
        Self { probe, matcher }
    }

    pub fn probe(&self) -> &T {
        &self.probe
    }

    pub fn matcher(&self) -> &ExampleMatcher {
        &self.matcher
    }

    /// The predicate this example stands for; `None` matches everything.
    pub fn predicate(&self, registry: &Registry) -> Result<Option<Expr>> {
        let schema = registry.describe_type::<T>()?;
        let known = |path: &str| {
            path == schema.identity.field || schema.field_named(path).is_some()
        };
        if let Some(path) = self
            .matcher
            .matchers
            .keys()
            .chain(&self.matcher.ignored)
            .find(|p| !known(p))
        {
            return Err(Error::Custom(format!(
                "example over {} names unknown property '{path}'",
                schema.name
            )));
        }

        let mut terms = Vec::new();
        if let Some(id) = self.probe.identity() {
            if !self.matcher.is_ignored(schema.identity.field) {
                terms.push(Expr::path(schema.identity.field).eq(id));
            }
        }
        for (name, value) in self.probe.scalars() {
            let Some(field) = schema.field_named(name) else {
                continue;
            };
            if self.matcher.is_ignored(name) {
                continue;
            }
            let term = match field.normalize(value) {
                Value::Null => continue,
                Value::Text(text) => {
                    let mode = self
                        .matcher
                        .matchers
                        .get(name)
                        .copied()
                        .unwrap_or(self.matcher.default_matcher);
                    if self.matcher.ignore_case {
                        mode.apply(Expr::path(name).lower(), &text.to_lowercase())
                    } else {
                        mode.apply(Expr::path(name), &text)
                    }
                }
                other => Expr::path(name).eq(other),
            };
            terms.push(term);
        }

        let any = self.matcher.any;
        let predicate = terms.into_iter().reduce(|acc, term| {
            if any { acc.or(term) } else { acc.and(term) }
        });
        tracing::trace!(entity = schema.name, matched = predicate.is_some(), "Example compiled");
        Ok(predicate)
    }

    /// An entity query selecting the matches.
    pub fn select(&self, registry: &Registry) -> Result<Select<T>> {
        let select = Select::new();
        Ok(match self.predicate(registry)? {
            Some(predicate) => select.filter(predicate),
            None => select,
        })
    }
}
