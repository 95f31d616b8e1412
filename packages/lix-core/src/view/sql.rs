//! Minimal SQL syntax tree for generated views and triggers.
//!
//! Only the constructs the view compiler needs are modeled. Identifier and
//! literal escaping happens in the `Display` impls and nowhere else.

use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ident(String);

impl Ident {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.0.replace('"', "\"\""))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Literal {
    Null,
    Integer(i64),
    Text(String),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "'{}'", value.replace('\'', "''")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    IsNot,
    And,
    Concat,
}

impl BinaryOp {
    fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::IsNot => "IS NOT",
            Self::And => "AND",
            Self::Concat => "||",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Column(Ident),
    /// `NEW."col"` inside a trigger body.
    New(Ident),
    /// `OLD."col"` inside a trigger body.
    Old(Ident),
    Literal(Literal),
    Call {
        name: &'static str,
        args: Vec<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    IsNull(Box<Expr>),
    Case {
        branches: Vec<(Expr, Expr)>,
        otherwise: Box<Expr>,
    },
    Subquery(Box<Select>),
    CastText(Box<Expr>),
}

impl Expr {
    pub fn column(name: impl Into<String>) -> Self {
        Self::Column(Ident::new(name))
    }

    pub fn new_col(name: impl Into<String>) -> Self {
        Self::New(Ident::new(name))
    }

    pub fn old_col(name: impl Into<String>) -> Self {
        Self::Old(Ident::new(name))
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::Literal(Literal::Text(value.into()))
    }

    pub fn int(value: i64) -> Self {
        Self::Literal(Literal::Integer(value))
    }

    pub fn null() -> Self {
        Self::Literal(Literal::Null)
    }

    pub fn call(name: &'static str, args: Vec<Expr>) -> Self {
        Self::Call { name, args }
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Self::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn equals(self, other: Expr) -> Self {
        Self::binary(BinaryOp::Eq, self, other)
    }

    pub fn is_not(self, other: Expr) -> Self {
        Self::binary(BinaryOp::IsNot, self, other)
    }

    pub fn and(self, other: Expr) -> Self {
        Self::binary(BinaryOp::And, self, other)
    }

    pub fn concat(self, other: Expr) -> Self {
        Self::binary(BinaryOp::Concat, self, other)
    }

    /// Fold `exprs` with `AND`; `None` when empty.
    pub fn all(exprs: impl IntoIterator<Item = Expr>) -> Option<Self> {
        exprs.into_iter().reduce(Expr::and)
    }
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Column(ident) => write!(f, "{ident}"),
            Self::New(ident) => write!(f, "NEW.{ident}"),
            Self::Old(ident) => write!(f, "OLD.{ident}"),
            Self::Literal(literal) => write!(f, "{literal}"),
            Self::Call { name, args } => {
                write!(f, "{name}(")?;
                write_list(f, args)?;
                f.write_str(")")
            }
            Self::Binary { op, left, right } => write!(f, "({left} {} {right})", op.as_str()),
            Self::IsNull(expr) => write!(f, "({expr} IS NULL)"),
            Self::Case {
                branches,
                otherwise,
            } => {
                f.write_str("CASE")?;
                for (when, then) in branches {
                    write!(f, " WHEN {when} THEN {then}")?;
                }
                write!(f, " ELSE {otherwise} END")
            }
            Self::Subquery(select) => write!(f, "({select})"),
            Self::CastText(expr) => write!(f, "CAST({expr} AS TEXT)"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Projection {
    pub expr: Expr,
    pub alias: Option<Ident>,
}

impl Projection {
    pub fn aliased(expr: Expr, alias: impl Into<String>) -> Self {
        Self {
            expr,
            alias: Some(Ident::new(alias)),
        }
    }
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "{} AS {alias}", self.expr),
            None => write!(f, "{}", self.expr),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Select {
    pub projection: Vec<Projection>,
    pub from: Option<Ident>,
    pub filter: Option<Expr>,
}

impl fmt::Display for Select {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SELECT ")?;
        write_list(f, &self.projection)?;
        if let Some(from) = &self.from {
            write!(f, " FROM {from}")?;
        }
        if let Some(filter) = &self.filter {
            write!(f, " WHERE {filter}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum InsertSource {
    Values(Vec<Expr>),
    Select(Select),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Insert {
    pub or_replace: bool,
    pub table: Ident,
    pub columns: Vec<Ident>,
    pub source: InsertSource,
}

impl fmt::Display for Insert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("INSERT ")?;
        if self.or_replace {
            f.write_str("OR REPLACE ")?;
        }
        write!(f, "INTO {} (", self.table)?;
        write_list(f, &self.columns)?;
        f.write_str(") ")?;
        match &self.source {
            InsertSource::Values(values) => {
                f.write_str("VALUES (")?;
                write_list(f, values)?;
                f.write_str(")")
            }
            InsertSource::Select(select) => write!(f, "{select}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerEvent {
    Insert,
    Update,
    Delete,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Statement {
    CreateView {
        name: Ident,
        select: Select,
    },
    DropView {
        name: Ident,
    },
    /// `INSTEAD OF` trigger on a view.
    CreateTrigger {
        name: Ident,
        event: TriggerEvent,
        view: Ident,
        body: Vec<Insert>,
    },
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateView { name, select } => write!(f, "CREATE VIEW {name} AS {select}"),
            Self::DropView { name } => write!(f, "DROP VIEW IF EXISTS {name}"),
            Self::CreateTrigger {
                name,
                event,
                view,
                body,
            } => {
                let event = match event {
                    TriggerEvent::Insert => "INSERT",
                    TriggerEvent::Update => "UPDATE",
                    TriggerEvent::Delete => "DELETE",
                };
                write!(f, "CREATE TRIGGER {name} INSTEAD OF {event} ON {view} BEGIN ")?;
                for insert in body {
                    write!(f, "{insert}; ")?;
                }
                f.write_str("END")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_identifiers_and_literals() {
        assert_eq!(Ident::new("we\"ird").to_string(), "\"we\"\"ird\"");
        assert_eq!(Literal::Text("it's".into()).to_string(), "'it''s'");
        assert_eq!(Literal::Null.to_string(), "NULL");
    }

    #[test]
    fn renders_select_with_filter() {
        let select = Select {
            projection: vec![
                Projection::aliased(Expr::column("entity_id"), "id"),
                Projection {
                    expr: Expr::call(
                        "json_extract",
                        vec![Expr::column("snapshot_content"), Expr::text("$.\"text\"")],
                    ),
                    alias: Some(Ident::new("text")),
                },
            ],
            from: Some(Ident::new("state_all")),
            filter: Expr::all([
                Expr::column("schema_key").equals(Expr::text("note")),
                Expr::IsNull(Box::new(Expr::column("x"))),
            ]),
        };
        assert_eq!(
            select.to_string(),
            "SELECT \"entity_id\" AS \"id\", json_extract(\"snapshot_content\", '$.\"text\"') AS \"text\" \
             FROM \"state_all\" WHERE ((\"schema_key\" = 'note') AND (\"x\" IS NULL))"
        );
    }

    #[test]
    fn renders_trigger_bodies() {
        let trigger = Statement::CreateTrigger {
            name: Ident::new("note_delete"),
            event: TriggerEvent::Delete,
            view: Ident::new("note"),
            body: vec![Insert {
                or_replace: true,
                table: Ident::new("buffer"),
                columns: vec![Ident::new("entity_id")],
                source: InsertSource::Values(vec![Expr::old_col("lixcol_entity_id")]),
            }],
        };
        assert_eq!(
            trigger.to_string(),
            "CREATE TRIGGER \"note_delete\" INSTEAD OF DELETE ON \"note\" BEGIN \
             INSERT OR REPLACE INTO \"buffer\" (\"entity_id\") VALUES (OLD.\"lixcol_entity_id\"); END"
        );
    }
}
