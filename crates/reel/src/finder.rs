//! Derived finders: query specifications named by their method.
//!
//! A finder name such as `findByDirectorNameOrderByYearDesc` is parsed once
//! against the registry into conditions over field paths and an ordering.
//! Each call then binds its arguments positionally and produces a
//! [`Select`] for the session to run.
//!
//! Grammar, after the `find…By` / `count…By` subject:
//!
//! - conditions joined by `And`, branches joined by `Or`
//! - a condition is a property path (`DirectorName` → `director.name`)
//!   followed by an optional operator: `Is`, `Equals`, `Not`, `Between`,
//!   `GreaterThan`, `GreaterThanEqual`, `LessThan`, `LessThanEqual`,
//!   `Containing`, `StartingWith`, `EndingWith`, `IsNull`, `IsNotNull`
//! - an optional `OrderBy` clause of paths each followed by `Asc` or `Desc`

use std::fmt;

use regex::Regex;
use reel_core::{
    Entity, EntitySchema, Error, Expr, OrderBy, OrderDirection, Registry, Result, Value,
};
use reel_query::{Select, Sort};

const SUBJECT: &str =
    r"^(find|read|get|query|stream|count)(?:[A-Z][A-Za-z0-9]*?)?By([A-Z][A-Za-z0-9]*)$";

const WORD: &str = r"[A-Z][a-z0-9]*";

fn pattern(source: &str) -> Result<Regex> {
    Regex::new(source).map_err(|e| Error::Custom(format!("finder pattern: {e}")))
}

/// What a finder returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinderKind {
    /// Matching entities.
    Find,
    /// The number of matching entities.
    Count,
}

/// Comparison applied by one condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    Not,
    Between,
    GreaterThan,
    GreaterThanEqual,
    LessThan,
    LessThanEqual,
    Containing,
    StartingWith,
    EndingWith,
    IsNull,
    IsNotNull,
}

/// Operator keywords, longest spelling first so suffixes match greedily.
const KEYWORDS: &[(&[&str], Operator)] = &[
    (&["Is", "Not", "Null"], Operator::IsNotNull),
    (&["Not", "Null"], Operator::IsNotNull),
    (&["Is", "Null"], Operator::IsNull),
    (&["Null"], Operator::IsNull),
    (&["Greater", "Than", "Equal"], Operator::GreaterThanEqual),
    (&["Greater", "Than"], Operator::GreaterThan),
    (&["Less", "Than", "Equal"], Operator::LessThanEqual),
    (&["Less", "Than"], Operator::LessThan),
    (&["Is", "Between"], Operator::Between),
    (&["Between"], Operator::Between),
    (&["Is", "Containing"], Operator::Containing),
    (&["Containing"], Operator::Containing),
    (&["Contains"], Operator::Containing),
    (&["Is", "Starting", "With"], Operator::StartingWith),
    (&["Starting", "With"], Operator::StartingWith),
    (&["Starts", "With"], Operator::StartingWith),
    (&["Is", "Ending", "With"], Operator::EndingWith),
    (&["Ending", "With"], Operator::EndingWith),
    (&["Ends", "With"], Operator::EndingWith),
    (&["Is", "Not"], Operator::Not),
    (&["Not"], Operator::Not),
    (&["Is"], Operator::Equals),
    (&["Equals"], Operator::Equals),
];

impl Operator {
    /// Number of arguments the operator consumes.
    pub const fn arity(self) -> usize {
        match self {
            Operator::IsNull | Operator::IsNotNull => 0,
            Operator::Between => 2,
            _ => 1,
        }
    }

    fn apply(self, path: &str, args: &[Value]) -> Result<Expr> {
        let field = Expr::path(path);
        let text = |value: &Value| {
            value.as_str().map(str::to_owned).ok_or_else(|| {
                Error::Custom(format!(
                    "{self:?} on '{path}' needs a text argument, got {}",
                    value.type_name()
                ))
            })
        };
        Ok(match (self, args) {
            (Operator::Equals, [v]) => field.eq(v.clone()),
            (Operator::Not, [v]) => field.ne(v.clone()),
            (Operator::Between, [low, high]) => field.between(low.clone(), high.clone()),
            (Operator::GreaterThan, [v]) => field.gt(v.clone()),
            (Operator::GreaterThanEqual, [v]) => field.ge(v.clone()),
            (Operator::LessThan, [v]) => field.lt(v.clone()),
            (Operator::LessThanEqual, [v]) => field.le(v.clone()),
            (Operator::Containing, [v]) => field.contains(text(v)?),
            (Operator::StartingWith, [v]) => field.starts_with(text(v)?),
            (Operator::EndingWith, [v]) => field.ends_with(text(v)?),
            (Operator::IsNull, []) => field.is_null(),
            (Operator::IsNotNull, []) => field.is_not_null(),
            (op, args) => {
                return Err(Error::Custom(format!(
                    "{op:?} takes {} argument(s), got {}",
                    op.arity(),
                    args.len()
                )));
            }
        })
    }
}

/// One `path operator` condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub path: String,
    pub operator: Operator,
}

/// A parsed finder, reusable for any number of calls.
#[derive(Debug, Clone)]
pub struct Finder {
    name: String,
    entity: &'static str,
    kind: FinderKind,
    /// Disjunction of conjunctions.
    branches: Vec<Vec<Condition>>,
    orders: Vec<OrderBy>,
}

impl Finder {
    /// Parse `name` as a finder over `entity`.
    pub fn parse(registry: &Registry, entity: &str, name: &str) -> Result<Self> {
        let schema = registry.describe(entity)?;
        let invalid = |why: &str| Error::Custom(format!("invalid finder '{name}': {why}"));

        let (subject, camel) = (pattern(SUBJECT)?, pattern(WORD)?);
        let captures = subject
            .captures(name)
            .ok_or_else(|| invalid("expected find…By or count…By"))?;
        let kind = if &captures[1] == "count" {
            FinderKind::Count
        } else {
            FinderKind::Find
        };
        let words: Vec<&str> = camel.find_iter(&captures[2]).map(|m| m.as_str()).collect();

        let (criteria, ordering) = match words
            .windows(2)
            .position(|pair| pair == ["Order", "By"])
        {
            Some(at) => (&words[..at], Some(&words[at + 2..])),
            None => (&words[..], None),
        };

        let mut branches = Vec::new();
        if !criteria.is_empty() {
            for branch in criteria.split(|w| *w == "Or") {
                let mut conditions = Vec::new();
                for part in branch.split(|w| *w == "And") {
                    conditions.push(condition(registry, schema, part).ok_or_else(|| {
                        invalid(&format!("no property matches '{}'", part.concat()))
                    })?);
                }
                branches.push(conditions);
            }
        }

        let mut orders = Vec::new();
        if let Some(ordering) = ordering {
            if ordering.is_empty() {
                return Err(invalid("OrderBy names no property"));
            }
            let mut property = Vec::new();
            for (i, word) in ordering.iter().enumerate() {
                let direction = match *word {
                    "Asc" => Some(OrderDirection::Asc),
                    "Desc" => Some(OrderDirection::Desc),
                    _ => None,
                };
                if direction.is_none() {
                    property.push(*word);
                    if i + 1 < ordering.len() {
                        continue;
                    }
                }
                let path = resolve_path(registry, schema, &property).ok_or_else(|| {
                    invalid(&format!("cannot order by '{}'", property.concat()))
                })?;
                orders.push(OrderBy {
                    expr: Expr::path(path),
                    direction: direction.unwrap_or(OrderDirection::Asc),
                });
                property.clear();
            }
        }

        let finder = Self {
            name: name.to_string(),
            entity: schema.name,
            kind,
            branches,
            orders,
        };
        tracing::debug!(finder = %finder.name, entity = finder.entity, arity = finder.arity(), "Parsed finder");
        Ok(finder)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FinderKind {
        self.kind
    }

    pub fn conditions(&self) -> impl Iterator<Item = &Condition> {
        self.branches.iter().flatten()
    }

    /// Total number of arguments a call must supply.
    pub fn arity(&self) -> usize {
        self.conditions().map(|c| c.operator.arity()).sum()
    }

    /// Bind `args` and build the query; `sort` orders after the finder's
    /// own `OrderBy` clause.
    pub fn select<T: Entity>(&self, args: &[Value], sort: Sort) -> Result<Select<T>> {
        if T::NAME != self.entity {
            return Err(Error::Custom(format!(
                "finder '{}' queries {}, not {}",
                self.name,
                self.entity,
                T::NAME
            )));
        }
        if args.len() != self.arity() {
            return Err(Error::Custom(format!(
                "finder '{}' takes {} argument(s), got {}",
                self.name,
                self.arity(),
                args.len()
            )));
        }

        let mut rest = args;
        let mut predicate: Option<Expr> = None;
        for branch in &self.branches {
            let mut conjunction: Option<Expr> = None;
            for condition in branch {
                let (bound, tail) = rest.split_at(condition.operator.arity());
                rest = tail;
                let expr = condition.operator.apply(&condition.path, bound)?;
                conjunction = Some(match conjunction {
                    Some(existing) => existing.and(expr),
                    None => expr,
                });
            }
            if let Some(conjunction) = conjunction {
                predicate = Some(match predicate {
                    Some(existing) => existing.or(conjunction),
                    None => conjunction,
                });
            }
        }

        let mut select = Select::new();
        if let Some(predicate) = predicate {
            select = select.filter(predicate);
        }
        for order in &self.orders {
            select = select.order_by(order.clone());
        }
        Ok(select.sort(sort))
    }
}

impl fmt::Display for Finder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn condition(registry: &Registry, schema: &EntitySchema, words: &[&str]) -> Option<Condition> {
    let (operator, property) = KEYWORDS
        .iter()
        .find_map(|(keyword, op)| {
            words
                .strip_suffix(*keyword)
                .filter(|rest| !rest.is_empty())
                .map(|rest| (*op, rest))
        })
        .unwrap_or((Operator::Equals, words));
    let path = resolve_path(registry, schema, property)?;
    Some(Condition { path, operator })
}

/// Match camel-case words to a dotted path, preferring the longest property
/// name at each hop.
fn resolve_path(registry: &Registry, schema: &EntitySchema, words: &[&str]) -> Option<String> {
    for split in (1..=words.len()).rev() {
        let name = snake_case(&words[..split]);
        if split == words.len() {
            let is_property = name == schema.identity.field
                || schema.field_named(&name).is_some()
                || schema.edge_named(&name).is_some()
                || schema.element_named(&name).is_some();
            if is_property {
                return Some(name);
            }
            continue;
        }
        let Some(edge) = schema.edge_named(&name) else {
            continue;
        };
        let Ok(target) = registry.describe(edge.target) else {
            continue;
        };
        if let Some(rest) = resolve_path(registry, target, &words[split..]) {
            return Some(format!("{name}.{rest}"));
        }
    }
    None
}

fn snake_case(words: &[&str]) -> String {
    words
        .iter()
        .map(|w| w.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}
