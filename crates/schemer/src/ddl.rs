//! Statement building.
//!
//! Every DDL statement the engine sends is a [`Ddl`] value. Its identifiers are
//! [`Ident`]s and its column types are [`SqlType`]s, both of which can only be
//! constructed through validation, so rendering never interpolates unchecked
//! input. Identifiers are double-quoted on render on top of that.

use crate::{Error, Result};
use std::fmt;

/// Postgres truncates identifiers beyond this length (NAMEDATALEN - 1).
const PG_IDENT_MAX: usize = 63;

/// A validated SQL identifier.
///
/// Must start with an ASCII letter and contain only ASCII letters, digits and
/// underscores. `Display` writes it double-quoted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident(String);

impl Ident {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("must not be empty")
        } else if name.len() > PG_IDENT_MAX {
            Some("must be at most 63 bytes long")
        } else if !name.as_bytes()[0].is_ascii_alphabetic() {
            Some("must start with a letter")
        } else if !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            Some("may only contain letters, digits and underscores")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(Error::InvalidIdentifier { name, reason }),
            None => Ok(Self(name)),
        }
    }

    /// The default schema.
    pub fn public() -> Self {
        Ident("public".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"")?;
        for c in self.0.chars() {
            if c == '"' {
                write!(f, "\"\"")?;
            } else {
                write!(f, "{}", c)?;
            }
        }
        write!(f, "\"")
    }
}

/// A schema-qualified relation name, rendered as `"schema"."name"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    pub schema: Ident,
    pub name: Ident,
}

impl QualifiedName {
    pub fn new(schema: Ident, name: Ident) -> Self {
        Self { schema, name }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// A validated column type expression.
///
/// Accepted grammar (case-insensitive):
///
/// ```text
/// type := name [ "(" int [ "," int ] ")" ] [ zone ] [ "[]" ]
/// name := word | "double precision" | "character varying" | "bit varying"
/// zone := ( "with" | "without" ) " time zone"       (timestamp and time only)
/// word := letter { letter | digit | "_" }
/// ```
///
/// This covers `integer`, `varchar(255)`, `numeric(10, 2)`, `double precision`,
/// `timestamp(3) with time zone` and `text[]`. Words that open a constraint
/// (`primary`, `references`, `default`, ...) are not type names, so nothing
/// but a type reaches a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlType {
    head: String,
    args: Vec<u32>,
    tail: String,
    array: bool,
}

impl SqlType {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason| Error::InvalidType {
            ty: input.to_string(),
            reason,
        };

        let text = input.trim().to_ascii_lowercase();
        if text.is_empty() {
            return Err(invalid("must not be empty"));
        }

        let (rest, array) = match text.strip_suffix("[]") {
            Some(stripped) => (stripped.trim_end(), true),
            None => (text.as_str(), false),
        };

        let (head, args, tail) = match (rest.find('('), rest.find(')')) {
            (None, None) => (rest, None, ""),
            (Some(open), Some(close)) if open < close => {
                let tail = &rest[close + 1..];
                if tail.contains('(') || tail.contains(')') {
                    return Err(invalid("only one argument list is allowed"));
                }
                (&rest[..open], Some(&rest[open + 1..close]), tail)
            }
            _ => return Err(invalid("unbalanced parentheses")),
        };

        let mut head = words(head).ok_or_else(|| invalid("expected a type name"))?;
        let mut tail = words(tail).ok_or_else(|| invalid("unexpected text after arguments"))?;
        if head.is_empty() {
            return Err(invalid("expected a type name"));
        }
        // `timestamp with time zone` has no argument list to split on
        if tail.is_empty()
            && head.len() == 4
            && matches!(head[1], "with" | "without")
            && head[2..] == ["time", "zone"]
        {
            tail = head.split_off(1);
        }

        let head = head.join(" ");
        let tail = tail.join(" ");
        if !tail.is_empty() {
            let zoned = matches!(head.as_str(), "timestamp" | "time")
                && matches!(tail.as_str(), "with time zone" | "without time zone");
            if !zoned {
                return Err(invalid("only time zone qualifiers may follow a type"));
            }
        }
        if head.contains(' ') {
            if !MULTI_WORD_TYPES.contains(&head.as_str()) {
                return Err(invalid("unknown multi-word type"));
            }
        } else if RESERVED_WORDS.contains(&head.as_str()) {
            return Err(invalid("type name is a reserved word"));
        }

        let args = match args {
            None => Vec::new(),
            Some(args) => {
                let parsed: Option<Vec<u32>> = args
                    .split(',')
                    .map(|a| {
                        let a = a.trim();
                        if a.is_empty() || !a.bytes().all(|b| b.is_ascii_digit()) {
                            return None;
                        }
                        a.parse().ok()
                    })
                    .collect();
                match parsed {
                    Some(parsed) if (1..=2).contains(&parsed.len()) => parsed,
                    _ => return Err(invalid("arguments must be one or two unsigned integers")),
                }
            }
        };

        Ok(Self {
            head,
            args,
            tail,
            array,
        })
    }

    /// Serial pseudo-types always create a `NOT NULL` column.
    pub fn is_serial(&self) -> bool {
        !self.array
            && matches!(
                self.head.as_str(),
                "serial" | "serial4" | "bigserial" | "serial8" | "smallserial" | "serial2"
            )
    }

    /// The name Postgres' `format_type` reports for this type.
    ///
    /// Synonyms collapse onto one spelling (`int4` and `int` become `integer`,
    /// `varchar(50)` becomes `character varying(50)`, serial pseudo-types become
    /// their underlying integer type) so comparing a declared type against an
    /// introspected one does not flag spurious changes.
    pub fn canonical(&self) -> String {
        let args = &self.args;
        let mut out = match self.head.as_str() {
            "int" | "int4" | "integer" | "serial" | "serial4" => "integer".to_string(),
            "int8" | "bigint" | "bigserial" | "serial8" => "bigint".to_string(),
            "int2" | "smallint" | "smallserial" | "serial2" => "smallint".to_string(),
            "bool" | "boolean" => "boolean".to_string(),
            "float4" | "real" => "real".to_string(),
            "float8" | "double precision" => "double precision".to_string(),
            "float" => match args.first() {
                Some(p) if *p <= 24 => "real".to_string(),
                _ => "double precision".to_string(),
            },
            "varchar" | "character varying" => {
                format!("character varying{}", render_args(args))
            }
            "char" | "character" | "bpchar" => {
                if args.is_empty() {
                    "character(1)".to_string()
                } else {
                    format!("character{}", render_args(args))
                }
            }
            "bit" if args.is_empty() => "bit(1)".to_string(),
            "varbit" | "bit varying" => format!("bit varying{}", render_args(args)),
            "decimal" | "numeric" => format!("numeric{}", render_args(args)),
            "timestamp" | "time" => {
                let zone = if self.tail == "with time zone" {
                    "with time zone"
                } else {
                    "without time zone"
                };
                format!("{}{} {}", self.head, render_args(args), zone)
            }
            "timestamptz" => format!("timestamp{} with time zone", render_args(args)),
            "timetz" => format!("time{} with time zone", render_args(args)),
            other => {
                let mut s = format!("{}{}", other, render_args(args));
                if !self.tail.is_empty() {
                    s.push(' ');
                    s.push_str(&self.tail);
                }
                s
            }
        };
        if self.array {
            out.push_str("[]");
        }
        out
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.head, render_args(&self.args))?;
        if !self.tail.is_empty() {
            write!(f, " {}", self.tail)?;
        }
        if self.array {
            write!(f, "[]")?;
        }
        Ok(())
    }
}

/// Normalize a type name reported by the catalog so it compares equal to
/// [`SqlType::canonical`]. Falls back to lowercase/whitespace folding for
/// types outside the grammar (e.g. user-defined types with quoted names).
pub fn canonical_type_name(reported: &str) -> String {
    match SqlType::parse(reported) {
        Ok(ty) => ty.canonical(),
        Err(_) => reported.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_lowercase(),
    }
}

/// Type names made of more than one word.
const MULTI_WORD_TYPES: &[&str] = &["double precision", "character varying", "bit varying"];

/// Words that start a constraint or clause rather than name a type.
const RESERVED_WORDS: &[&str] = &[
    "as", "check", "collate", "constraint", "default", "generated", "key", "not", "null", "on",
    "primary", "references", "unique", "with", "without", "zone",
];

fn words(s: &str) -> Option<Vec<&str>> {
    let words: Vec<&str> = s.split_whitespace().collect();
    let valid = words.iter().all(|w| {
        let bytes = w.as_bytes();
        bytes[0].is_ascii_alphabetic()
            && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'_')
    });
    valid.then_some(words)
}

fn render_args(args: &[u32]) -> String {
    if args.is_empty() {
        return String::new();
    }
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    format!("({})", args.join(","))
}

/// Sort direction of an index key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    /// Parse a declared direction. Missing or empty means ascending.
    pub fn parse(s: Option<&str>) -> Option<Self> {
        match s.map(str::trim) {
            None | Some("") => Some(Direction::Asc),
            Some(s) if s.eq_ignore_ascii_case("asc") => Some(Direction::Asc),
            Some(s) if s.eq_ignore_ascii_case("desc") => Some(Direction::Desc),
            Some(_) => None,
        }
    }

    pub fn to_sql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_sql())
    }
}

/// A column definition inside `CREATE TABLE` or `ADD COLUMN`.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: Ident,
    pub ty: SqlType,
    pub not_null: bool,
}

impl fmt::Display for ColumnDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.ty)?;
        if self.not_null {
            write!(f, " NOT NULL")?;
        }
        Ok(())
    }
}

/// One key of an index being created.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPart {
    pub column: Ident,
    pub direction: Direction,
}

/// A single schema-altering statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Ddl {
    CreateTable {
        table: QualifiedName,
        columns: Vec<ColumnDef>,
    },
    DropTable {
        table: QualifiedName,
    },
    AddColumn {
        table: QualifiedName,
        column: ColumnDef,
    },
    AlterColumnType {
        table: QualifiedName,
        column: Ident,
        ty: SqlType,
    },
    SetNotNull {
        table: QualifiedName,
        column: Ident,
        not_null: bool,
    },
    DropColumn {
        table: QualifiedName,
        column: Ident,
    },
    RenameColumn {
        table: QualifiedName,
        from: Ident,
        to: Ident,
    },
    CreateIndex {
        name: Ident,
        table: QualifiedName,
        unique: bool,
        keys: Vec<KeyPart>,
    },
    DropIndex {
        /// Index names live in the table's schema.
        name: QualifiedName,
    },
}

impl Ddl {
    /// Render the statement.
    pub fn to_sql(&self) -> String {
        match self {
            Ddl::CreateTable { table, columns } => {
                let cols: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
                format!("CREATE TABLE {} ({})", table, cols.join(", "))
            }
            Ddl::DropTable { table } => format!("DROP TABLE {}", table),
            Ddl::AddColumn { table, column } => {
                format!("ALTER TABLE {} ADD COLUMN {}", table, column)
            }
            Ddl::AlterColumnType { table, column, ty } => {
                // serial & co. only exist at CREATE time, so cast to the real type
                let ty = ty.canonical();
                format!(
                    "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{}",
                    table, column, ty, column, ty
                )
            }
            Ddl::SetNotNull {
                table,
                column,
                not_null,
            } => {
                let op = if *not_null { "SET" } else { "DROP" };
                format!("ALTER TABLE {} ALTER COLUMN {} {} NOT NULL", table, column, op)
            }
            Ddl::DropColumn { table, column } => {
                format!("ALTER TABLE {} DROP COLUMN {}", table, column)
            }
            Ddl::RenameColumn { table, from, to } => {
                format!("ALTER TABLE {} RENAME COLUMN {} TO {}", table, from, to)
            }
            Ddl::CreateIndex {
                name,
                table,
                unique,
                keys,
            } => {
                let unique = if *unique { "UNIQUE " } else { "" };
                let keys: Vec<String> = keys
                    .iter()
                    .map(|k| format!("{} {}", k.column, k.direction))
                    .collect();
                format!(
                    "CREATE {}INDEX {} ON {} ({})",
                    unique,
                    name,
                    table,
                    keys.join(", ")
                )
            }
            Ddl::DropIndex { name } => format!("DROP INDEX {}", name),
        }
    }
}

impl fmt::Display for Ddl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}
