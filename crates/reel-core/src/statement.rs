//! Dialect-neutral statements.
//!
//! The session and the query layer produce [`Statement`] values; executors
//! either interpret them directly (the in-memory store) or render them with
//! [`Statement::to_sql`] for a SQL driver.

use std::fmt::Write as _;

use crate::value::Value;

/// SQL dialect used when rendering statements to text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier, doubling embedded quote characters.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                format!("\"{}\"", name.replace('"', "\"\""))
            }
            Dialect::Mysql => format!("`{}`", name.replace('`', "``")),
        }
    }
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }

    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }
}

/// Built-in functions understood by every executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Coalesce,
    /// Calendar year of a date
    Year,
    CurrentDate,
    Lower,
    Upper,
}

impl Func {
    pub const fn name(self) -> &'static str {
        match self {
            Func::Count => "COUNT",
            Func::Sum => "SUM",
            Func::Avg => "AVG",
            Func::Min => "MIN",
            Func::Max => "MAX",
            Func::Coalesce => "COALESCE",
            Func::Year => "YEAR",
            Func::CurrentDate => "CURRENT_DATE",
            Func::Lower => "LOWER",
            Func::Upper => "UPPER",
        }
    }

    pub const fn is_aggregate(self) -> bool {
        matches!(
            self,
            Func::Count | Func::Sum | Func::Avg | Func::Min | Func::Max
        )
    }
}

/// An expression usable in projections, predicates, grouping and ordering.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Column reference with optional table alias
    Column { table: Option<String>, name: String },
    /// Entity field path such as `director.name`, resolved by the query compiler
    Path(String),
    /// Reference to a select-list alias (ORDER BY / HAVING over aggregates)
    Alias(String),
    Literal(Value),
    /// Bound parameter (1-based)
    Placeholder(usize),
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    IsNull { expr: Box<Expr>, negated: bool },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    In {
        expr: Box<Expr>,
        values: Vec<Expr>,
        negated: bool,
    },
    /// LIKE with `%` and `_` wildcards
    Like {
        expr: Box<Expr>,
        pattern: String,
        negated: bool,
    },
    Function { func: Func, args: Vec<Expr> },
    CountStar,
}

impl Expr {
    pub fn col(name: impl Into<String>) -> Self {
        Expr::Column {
            table: None,
            name: name.into(),
        }
    }

    pub fn qualified(table: impl Into<String>, column: impl Into<String>) -> Self {
        Expr::Column {
            table: Some(table.into()),
            name: column.into(),
        }
    }

    /// Entity field path, e.g. `"year"` or `"director.name"`.
    pub fn path(path: impl Into<String>) -> Self {
        Expr::Path(path.into())
    }

    pub fn alias(name: impl Into<String>) -> Self {
        Expr::Alias(name.into())
    }

    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn placeholder(index: usize) -> Self {
        Expr::Placeholder(index)
    }

    fn binary(self, op: BinaryOp, other: impl Into<Expr>) -> Self {
        Expr::Binary {
            left: Box::new(self),
            op,
            right: Box::new(other.into()),
        }
    }

    pub fn eq(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Eq, other)
    }

    pub fn ne(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ne, other)
    }

    pub fn lt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Lt, other)
    }

    pub fn le(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Le, other)
    }

    pub fn gt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Gt, other)
    }

    pub fn ge(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ge, other)
    }

    pub fn and(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::And, other)
    }

    pub fn or(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Or, other)
    }

    pub fn add(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Add, other)
    }

    pub fn sub(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Sub, other)
    }

    pub fn mul(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Mul, other)
    }

    pub fn div(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Div, other)
    }

    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    pub fn is_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    pub fn between(self, low: impl Into<Expr>, high: impl Into<Expr>) -> Self {
        Expr::Between {
            expr: Box::new(self),
            low: Box::new(low.into()),
            high: Box::new(high.into()),
            negated: false,
        }
    }

    pub fn in_list(self, values: Vec<impl Into<Expr>>) -> Self {
        Expr::In {
            expr: Box::new(self),
            values: values.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    pub fn like(self, pattern: impl Into<String>) -> Self {
        Expr::Like {
            expr: Box::new(self),
            pattern: pattern.into(),
            negated: false,
        }
    }

    pub fn not_like(self, pattern: impl Into<String>) -> Self {
        Expr::Like {
            expr: Box::new(self),
            pattern: pattern.into(),
            negated: true,
        }
    }

    /// `LIKE '%text%'` with wildcards in `text` escaped away.
    pub fn contains(self, text: impl AsRef<str>) -> Self {
        self.like(format!("%{}%", escape_like(text.as_ref())))
    }

    pub fn starts_with(self, text: impl AsRef<str>) -> Self {
        self.like(format!("{}%", escape_like(text.as_ref())))
    }

    pub fn ends_with(self, text: impl AsRef<str>) -> Self {
        self.like(format!("%{}", escape_like(text.as_ref())))
    }

    pub fn count_star() -> Self {
        Expr::CountStar
    }

    pub fn function(func: Func, args: Vec<Expr>) -> Self {
        Expr::Function { func, args }
    }

    pub fn count(self) -> Self {
        Expr::function(Func::Count, vec![self])
    }

    pub fn sum(self) -> Self {
        Expr::function(Func::Sum, vec![self])
    }

    pub fn avg(self) -> Self {
        Expr::function(Func::Avg, vec![self])
    }

    pub fn min(self) -> Self {
        Expr::function(Func::Min, vec![self])
    }

    pub fn max(self) -> Self {
        Expr::function(Func::Max, vec![self])
    }

    pub fn year(self) -> Self {
        Expr::function(Func::Year, vec![self])
    }

    pub fn lower(self) -> Self {
        Expr::function(Func::Lower, vec![self])
    }

    pub fn upper(self) -> Self {
        Expr::function(Func::Upper, vec![self])
    }

    pub fn coalesce(args: Vec<impl Into<Expr>>) -> Self {
        Expr::function(Func::Coalesce, args.into_iter().map(Into::into).collect())
    }

    pub fn current_date() -> Self {
        Expr::function(Func::CurrentDate, Vec::new())
    }

    /// `YEAR(CURRENT_DATE)`
    pub fn current_year() -> Self {
        Expr::current_date().year()
    }

    pub fn asc(self) -> OrderBy {
        OrderBy::asc(self)
    }

    pub fn desc(self) -> OrderBy {
        OrderBy::desc(self)
    }

    /// Does this expression contain an aggregate function?
    pub fn is_aggregate(&self) -> bool {
        match self {
            Expr::CountStar => true,
            Expr::Function { func, args } => {
                func.is_aggregate() || args.iter().any(Expr::is_aggregate)
            }
            Expr::Binary { left, right, .. } => left.is_aggregate() || right.is_aggregate(),
            Expr::Not(e) | Expr::IsNull { expr: e, .. } | Expr::Like { expr: e, .. } => {
                e.is_aggregate()
            }
            Expr::Between {
                expr, low, high, ..
            } => expr.is_aggregate() || low.is_aggregate() || high.is_aggregate(),
            Expr::In { expr, values, .. } => {
                expr.is_aggregate() || values.iter().any(Expr::is_aggregate)
            }
            _ => false,
        }
    }

    /// Rewrite every node bottom-up with `f`.
    pub fn try_map<E>(self, f: &mut impl FnMut(Expr) -> Result<Expr, E>) -> Result<Expr, E> {
        let mapped = match self {
            Expr::Binary { left, op, right } => Expr::Binary {
                left: Box::new(left.try_map(f)?),
                op,
                right: Box::new(right.try_map(f)?),
            },
            Expr::Not(e) => Expr::Not(Box::new(e.try_map(f)?)),
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: Box::new(expr.try_map(f)?),
                negated,
            },
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => Expr::Between {
                expr: Box::new(expr.try_map(f)?),
                low: Box::new(low.try_map(f)?),
                high: Box::new(high.try_map(f)?),
                negated,
            },
            Expr::In {
                expr,
                values,
                negated,
            } => Expr::In {
                expr: Box::new(expr.try_map(f)?),
                values: values
                    .into_iter()
                    .map(|v| v.try_map(f))
                    .collect::<Result<_, E>>()?,
                negated,
            },
            Expr::Like {
                expr,
                pattern,
                negated,
            } => Expr::Like {
                expr: Box::new(expr.try_map(f)?),
                pattern,
                negated,
            },
            Expr::Function { func, args } => Expr::Function {
                func,
                args: args
                    .into_iter()
                    .map(|a| a.try_map(f))
                    .collect::<Result<_, E>>()?,
            },
            leaf => leaf,
        };
        f(mapped)
    }

    /// Render this expression, pushing literals into `params`.
    pub fn build_with_dialect(&self, dialect: Dialect, params: &mut Vec<Value>) -> String {
        match self {
            Expr::Column { table, name } => match table {
                Some(t) => format!(
                    "{}.{}",
                    dialect.quote_identifier(t),
                    dialect.quote_identifier(name)
                ),
                None => dialect.quote_identifier(name),
            },
            Expr::Path(path) => path.clone(),
            Expr::Alias(name) => dialect.quote_identifier(name),
            Expr::Literal(value) => {
                params.push(value.clone());
                dialect.placeholder(params.len())
            }
            Expr::Placeholder(idx) => dialect.placeholder(*idx),
            Expr::Binary { left, op, right } => format!(
                "({} {} {})",
                left.build_with_dialect(dialect, params),
                op.as_str(),
                right.build_with_dialect(dialect, params)
            ),
            Expr::Not(e) => format!("NOT ({})", e.build_with_dialect(dialect, params)),
            Expr::IsNull { expr, negated } => format!(
                "{} IS {}NULL",
                expr.build_with_dialect(dialect, params),
                if *negated { "NOT " } else { "" }
            ),
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => format!(
                "{} {}BETWEEN {} AND {}",
                expr.build_with_dialect(dialect, params),
                if *negated { "NOT " } else { "" },
                low.build_with_dialect(dialect, params),
                high.build_with_dialect(dialect, params)
            ),
            Expr::In {
                expr,
                values,
                negated,
            } => {
                let head = expr.build_with_dialect(dialect, params);
                let items: Vec<String> = values
                    .iter()
                    .map(|v| v.build_with_dialect(dialect, params))
                    .collect();
                format!(
                    "{} {}IN ({})",
                    head,
                    if *negated { "NOT " } else { "" },
                    items.join(", ")
                )
            }
            Expr::Like {
                expr,
                pattern,
                negated,
            } => {
                let head = expr.build_with_dialect(dialect, params);
                params.push(Value::Text(pattern.clone()));
                format!(
                    "{} {}LIKE {}",
                    head,
                    if *negated { "NOT " } else { "" },
                    dialect.placeholder(params.len())
                )
            }
            Expr::Function {
                func: Func::CurrentDate,
                ..
            } => "CURRENT_DATE".to_string(),
            Expr::Function { func, args } => {
                let rendered: Vec<String> = args
                    .iter()
                    .map(|a| a.build_with_dialect(dialect, params))
                    .collect();
                format!("{}({})", func.name(), rendered.join(", "))
            }
            Expr::CountStar => "COUNT(*)".to_string(),
        }
    }
}

/// Escape `%`, `_` and `\` so `text` matches literally inside a LIKE pattern.
pub fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

impl From<Value> for Expr {
    fn from(v: Value) -> Self {
        Expr::Literal(v)
    }
}

impl From<&str> for Expr {
    fn from(s: &str) -> Self {
        Expr::Literal(Value::Text(s.to_string()))
    }
}

impl From<String> for Expr {
    fn from(s: String) -> Self {
        Expr::Literal(Value::Text(s))
    }
}

impl From<i32> for Expr {
    fn from(n: i32) -> Self {
        Expr::Literal(Value::Int(n))
    }
}

impl From<i64> for Expr {
    fn from(n: i64) -> Self {
        Expr::Literal(Value::BigInt(n))
    }
}

impl From<bool> for Expr {
    fn from(b: bool) -> Self {
        Expr::Literal(Value::Bool(b))
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

/// One ORDER BY term.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub expr: Expr,
    pub direction: OrderDirection,
}

impl OrderBy {
    pub fn asc(expr: impl Into<Expr>) -> Self {
        Self {
            expr: expr.into(),
            direction: OrderDirection::Asc,
        }
    }

    pub fn desc(expr: impl Into<Expr>) -> Self {
        Self {
            expr: expr.into(),
            direction: OrderDirection::Desc,
        }
    }
}

/// A table in a FROM or JOIN clause.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    pub table: String,
    pub alias: String,
}

impl TableRef {
    pub fn new(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: alias.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: TableRef,
    pub on: Expr,
}

/// One output column of a SELECT.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub from: TableRef,
    pub joins: Vec<Join>,
    pub columns: Vec<SelectItem>,
    pub distinct: bool,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
}

impl SelectStatement {
    pub fn new(from: TableRef) -> Self {
        Self {
            from,
            joins: Vec::new(),
            columns: Vec::new(),
            distinct: false,
            filter: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn column(mut self, expr: Expr, alias: impl Into<String>) -> Self {
        self.columns.push(SelectItem {
            expr,
            alias: alias.into(),
        });
        self
    }

    /// AND `predicate` into the WHERE clause.
    pub fn filter(mut self, predicate: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }
}

/// A parameterized statement; parameters are bound positionally at execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `INSERT INTO table (columns) VALUES ($1..$n)`; `returning` names the
    /// store-generated identity column, if any.
    Insert {
        table: String,
        columns: Vec<String>,
        returning: Option<String>,
    },
    /// `UPDATE table SET columns = $1..$n WHERE filter`
    Update {
        table: String,
        columns: Vec<String>,
        filter: Expr,
    },
    /// `DELETE FROM table WHERE filter`
    Delete { table: String, filter: Expr },
    Select(SelectStatement),
}

impl Statement {
    /// Target table of the statement.
    pub fn table(&self) -> &str {
        match self {
            Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => table,
            Statement::Select(select) => &select.from.table,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, Statement::Select(_))
    }

    /// Render SQL text and the literal parameters it introduces.
    ///
    /// Literal parameters are numbered after the `bound` positional
    /// parameters the caller passes at execution.
    pub fn to_sql(&self, dialect: Dialect, bound: usize) -> (String, Vec<Value>) {
        let mut params: Vec<Value> = vec![Value::Null; bound];
        let q = |name: &str| dialect.quote_identifier(name);
        let sql = match self {
            Statement::Insert {
                table,
                columns,
                returning,
            } => {
                let cols: Vec<String> = columns.iter().map(|c| q(c)).collect();
                let placeholders: Vec<String> =
                    (1..=columns.len()).map(|i| dialect.placeholder(i)).collect();
                let mut sql = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    q(table),
                    cols.join(", "),
                    placeholders.join(", ")
                );
                if let Some(col) = returning {
                    let _ = write!(sql, " RETURNING {}", q(col));
                }
                sql
            }
            Statement::Update {
                table,
                columns,
                filter,
            } => {
                let sets: Vec<String> = columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| format!("{} = {}", q(c), dialect.placeholder(i + 1)))
                    .collect();
                format!(
                    "UPDATE {} SET {} WHERE {}",
                    q(table),
                    sets.join(", "),
                    filter.build_with_dialect(dialect, &mut params)
                )
            }
            Statement::Delete { table, filter } => format!(
                "DELETE FROM {} WHERE {}",
                q(table),
                filter.build_with_dialect(dialect, &mut params)
            ),
            Statement::Select(select) => render_select(select, dialect, &mut params),
        };
        (sql, params.split_off(bound))
    }
}

fn render_select(select: &SelectStatement, dialect: Dialect, params: &mut Vec<Value>) -> String {
    let q = |name: &str| dialect.quote_identifier(name);
    let columns: Vec<String> = select
        .columns
        .iter()
        .map(|item| {
            format!(
                "{} AS {}",
                item.expr.build_with_dialect(dialect, params),
                q(&item.alias)
            )
        })
        .collect();
    let mut sql = format!(
        "SELECT {}{} FROM {} {}",
        if select.distinct { "DISTINCT " } else { "" },
        columns.join(", "),
        q(&select.from.table),
        q(&select.from.alias)
    );
    for join in &select.joins {
        let kind = match join.kind {
            JoinKind::Inner => "JOIN",
            JoinKind::Left => "LEFT JOIN",
        };
        let _ = write!(
            sql,
            " {} {} {} ON {}",
            kind,
            q(&join.table.table),
            q(&join.table.alias),
            join.on.build_with_dialect(dialect, params)
        );
    }
    if let Some(filter) = &select.filter {
        let _ = write!(sql, " WHERE {}", filter.build_with_dialect(dialect, params));
    }
    if !select.group_by.is_empty() {
        let groups: Vec<String> = select
            .group_by
            .iter()
            .map(|g| g.build_with_dialect(dialect, params))
            .collect();
        let _ = write!(sql, " GROUP BY {}", groups.join(", "));
    }
    if let Some(having) = &select.having {
        let _ = write!(sql, " HAVING {}", having.build_with_dialect(dialect, params));
    }
    if !select.order_by.is_empty() {
        let orders: Vec<String> = select
            .order_by
            .iter()
            .map(|o| {
                format!(
                    "{} {}",
                    o.expr.build_with_dialect(dialect, params),
                    match o.direction {
                        OrderDirection::Asc => "ASC",
                        OrderDirection::Desc => "DESC",
                    }
                )
            })
            .collect();
        let _ = write!(sql, " ORDER BY {}", orders.join(", "));
    }
    if let Some(limit) = select.limit {
        let _ = write!(sql, " LIMIT {}", limit);
    }
    sql
}
