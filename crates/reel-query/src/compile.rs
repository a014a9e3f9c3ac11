//! Field-path compilation.
//!
//! Queries name fields by path relative to their root entity: `"title"`,
//! `"director.name"`, `"actors.name"`, `"genres"`. The compiler resolves
//! each path against the registry and adds the joins the path walks through.
//! Joins are shared: two predicates on `director.*` produce one join.

use reel_core::{
    EntitySchema, Error, Expr, Join, JoinKind, JoinSpec, QueryError, QueryErrorKind, Registry,
    Result, Row, SelectItem, SelectStatement, Side, TableRef, Value,
};

/// Alias of the root entity's table in every compiled statement.
pub const ROOT_ALIAS: &str = "t0";

fn unknown_path(entity: &str, path: &str) -> Error {
    Error::Query(QueryError::new(
        QueryErrorKind::Syntax,
        format!("{entity} has no field path '{path}'"),
    ))
}

#[derive(Debug)]
struct JoinedPath<'r> {
    path: String,
    alias: String,
    schema: &'r EntitySchema,
}

/// Resolves field paths into column references plus joins.
#[derive(Debug)]
pub struct PathCompiler<'r> {
    registry: &'r Registry,
    root: &'r EntitySchema,
    joins: Vec<Join>,
    joined: Vec<JoinedPath<'r>>,
    collections: Vec<(String, String)>,
    next_alias: usize,
    fans_out: bool,
}

impl<'r> PathCompiler<'r> {
    pub fn new(registry: &'r Registry, root: &'r EntitySchema) -> Self {
        Self {
            registry,
            root,
            joins: Vec::new(),
            joined: Vec::new(),
            collections: Vec::new(),
            next_alias: 1,
            fans_out: false,
        }
    }

    pub fn root(&self) -> &'r EntitySchema {
        self.root
    }

    /// Has a to-many join been added? Root rows may then repeat.
    pub fn fans_out(&self) -> bool {
        self.fans_out
    }

    fn alias(&mut self) -> String {
        let alias = format!("t{}", self.next_alias);
        self.next_alias += 1;
        alias
    }

    /// Replace every `Expr::Path` in `expr` with the column it names.
    pub fn rewrite(&mut self, expr: Expr) -> Result<Expr> {
        expr.try_map(&mut |node| match node {
            Expr::Path(path) => self.resolve(&path),
            other => Ok(other),
        })
    }

    /// Resolve one dotted path.
    pub fn resolve(&mut self, path: &str) -> Result<Expr> {
        let segments: Vec<&str> = path.split('.').collect();
        let Some((last, hops)) = segments.split_last() else {
            return Err(unknown_path(self.root.name, path));
        };
        if segments.iter().any(|s| s.is_empty()) {
            return Err(unknown_path(self.root.name, path));
        }

        let mut schema = self.root;
        let mut alias = ROOT_ALIAS.to_string();
        let mut prefix = String::new();
        for hop in hops {
            if !prefix.is_empty() {
                prefix.push('.');
            }
            prefix.push_str(hop);
            (alias, schema) = self.join_edge(&prefix, &alias, schema, hop, path)?;
        }

        if *last == schema.identity.field {
            return Ok(Expr::qualified(&alias, schema.identity.column));
        }
        if let Some(field) = schema.field_named(last) {
            return Ok(match field.derived {
                Some(formula) => formula.to_expr(Some(&alias)),
                None => Expr::qualified(&alias, field.column),
            });
        }
        if let Some(column) = schema.edge_named(last).and_then(|e| e.fk_column()) {
            return Ok(Expr::qualified(&alias, column));
        }
        if let Some(collection) = schema.element_named(last) {
            let key = if prefix.is_empty() {
                (*last).to_string()
            } else {
                format!("{prefix}.{last}")
            };
            let element_alias = match self.collections.iter().find(|(p, _)| *p == key) {
                Some((_, existing)) => existing.clone(),
                None => {
                    let element_alias = self.alias();
                    self.joins.push(Join {
                        kind: JoinKind::Left,
                        table: TableRef::new(collection.table, &element_alias),
                        on: Expr::qualified(&element_alias, collection.owner_column)
                            .eq(Expr::qualified(&alias, schema.identity.column)),
                    });
                    self.collections.push((key, element_alias.clone()));
                    self.fans_out = true;
                    element_alias
                }
            };
            return Ok(Expr::qualified(element_alias, collection.value_column));
        }
        Err(unknown_path(self.root.name, path))
    }

    fn join_edge(
        &mut self,
        prefix: &str,
        from_alias: &str,
        from: &'r EntitySchema,
        edge_name: &str,
        path: &str,
    ) -> Result<(String, &'r EntitySchema)> {
        if let Some(joined) = self.joined.iter().find(|j| j.path == prefix) {
            return Ok((joined.alias.clone(), joined.schema));
        }
        let edge = from
            .edge_named(edge_name)
            .ok_or_else(|| unknown_path(self.root.name, path))?;
        let target = self.registry.describe(edge.target)?;
        let from_id = Expr::qualified(from_alias, from.identity.column);
        let target_alias = self.alias();
        let target_id = Expr::qualified(&target_alias, target.identity.column);

        let side = match edge.side {
            Side::Owning(spec) => Some((spec, false)),
            Side::Inverse { mapped_by } => target
                .edge_named(mapped_by)
                .and_then(|owning| match owning.side {
                    Side::Owning(spec) => Some((spec, true)),
                    Side::Inverse { .. } => None,
                }),
        };
        let Some((spec, inverse)) = side else {
            return Err(Error::config(format!(
                "{}.{} has no owning side",
                from.name, edge.name
            )));
        };

        match (spec, inverse) {
            (JoinSpec::ForeignKey { column, .. }, false) => {
                self.joins.push(Join {
                    kind: JoinKind::Left,
                    table: TableRef::new(target.table, &target_alias),
                    on: target_id.eq(Expr::qualified(from_alias, column)),
                });
            }
            (JoinSpec::ForeignKey { column, .. }, true) => {
                self.joins.push(Join {
                    kind: JoinKind::Left,
                    table: TableRef::new(target.table, &target_alias),
                    on: Expr::qualified(&target_alias, column).eq(from_id),
                });
                self.fans_out = true;
            }
            (
                JoinSpec::JoinTable {
                    table,
                    owner_column,
                    target_column,
                },
                inverse,
            ) => {
                // The inverse side walks the join table from its far end.
                let (near, far) = if inverse {
                    (target_column, owner_column)
                } else {
                    (owner_column, target_column)
                };
                let link_alias = self.alias();
                self.joins.push(Join {
                    kind: JoinKind::Left,
                    table: TableRef::new(table, &link_alias),
                    on: Expr::qualified(&link_alias, near).eq(from_id),
                });
                self.joins.push(Join {
                    kind: JoinKind::Left,
                    table: TableRef::new(target.table, &target_alias),
                    on: target_id.eq(Expr::qualified(&link_alias, far)),
                });
                self.fans_out = true;
            }
        }

        self.joined.push(JoinedPath {
            path: prefix.to_string(),
            alias: target_alias.clone(),
            schema: target,
        });
        Ok((target_alias, target))
    }

    /// Join a to-one edge and select the target's columns under `edge.`.
    pub fn fetch(&mut self, edge_name: &str) -> Result<Vec<SelectItem>> {
        let edge = self
            .root
            .edge_named(edge_name)
            .ok_or_else(|| unknown_path(self.root.name, edge_name))?;
        if edge.fk_column().is_none() {
            return Err(Error::Query(QueryError::new(
                QueryErrorKind::Syntax,
                format!(
                    "{}.{} is not a to-one association and cannot be fetch-joined",
                    self.root.name, edge.name
                ),
            )));
        }
        let (alias, target) = self.join_edge(edge_name, ROOT_ALIAS, self.root, edge_name, edge_name)?;
        Ok(entity_columns(target, &alias, &format!("{edge_name}.")))
    }

    /// Assemble the statement from the joins collected so far.
    pub fn finish(self, columns: Vec<SelectItem>) -> SelectStatement {
        let mut select = SelectStatement::new(TableRef::new(self.root.table, ROOT_ALIAS));
        select.joins = self.joins;
        select.columns = columns;
        select
    }
}

/// Columns materializing `schema` from the table aliased `alias`, each named
/// `prefix` + field name. Foreign keys are named after their edge.
pub fn entity_columns(schema: &EntitySchema, alias: &str, prefix: &str) -> Vec<SelectItem> {
    let mut columns = Vec::with_capacity(1 + schema.fields.len() + schema.edges.len());
    columns.push(SelectItem {
        expr: Expr::qualified(alias, schema.identity.column),
        alias: format!("{prefix}{}", schema.identity.field),
    });
    for field in &schema.fields {
        columns.push(SelectItem {
            expr: match field.derived {
                Some(formula) => formula.to_expr(Some(alias)),
                None => Expr::qualified(alias, field.column),
            },
            alias: format!("{prefix}{}", field.name),
        });
    }
    for edge in schema.foreign_keys() {
        if let Some(column) = edge.fk_column() {
            columns.push(SelectItem {
                expr: Expr::qualified(alias, column),
                alias: format!("{prefix}{}", edge.name),
            });
        }
    }
    columns
}

/// Persistent state of one entity read from a row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowImage {
    pub identity: i64,
    pub scalars: Vec<(&'static str, Value)>,
    /// Foreign-key values per owning to-one edge.
    pub keys: Vec<(&'static str, Option<i64>)>,
}

impl RowImage {
    /// Read the columns [`entity_columns`] selected under `prefix`.
    ///
    /// Returns `None` when the identity is NULL, as for an outer-joined
    /// entity that does not exist.
    pub fn from_row(row: &Row, schema: &EntitySchema, prefix: &str) -> Result<Option<Self>> {
        let column = |name: &str| -> Result<Value> {
            let name = format!("{prefix}{name}");
            row.get_by_name(&name).cloned().ok_or_else(|| {
                Error::Query(QueryError::new(
                    QueryErrorKind::NotFound,
                    format!("result has no column {name}"),
                ))
            })
        };
        let Some(identity) = column(schema.identity.field)?.as_i64() else {
            return Ok(None);
        };
        let scalars = schema
            .fields
            .iter()
            .map(|field| Ok((field.name, column(field.name)?)))
            .collect::<Result<Vec<_>>>()?;
        let keys = schema
            .foreign_keys()
            .map(|edge| Ok((edge.name, column(edge.name)?.as_i64())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(Self {
            identity,
            scalars,
            keys,
        }))
    }
}
