//! Facet types for `.config/schemer.styx`.
//!
//! ```styx
//! connection {
//!   host "db.internal"
//!   port 5433
//!   user app
//!   password hunter2
//!   database app
//!   schema app
//!   sslmode "verify-full"
//! }
//! declaration "db/schema.styx"
//! column_update alter
//! ```
//!
//! Every field is optional; the accessors fill in the defaults.

use facet::Facet;

pub const DEFAULT_DECLARATION: &str = "schema.styx";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Facet)]
pub struct Config {
    /// Where and how to connect.
    #[facet(default)]
    pub connection: ConnectionConfig,

    /// Path of the declaration file, relative to the project root.
    #[facet(default)]
    pub declaration: Option<String>,

    /// `alter` (default) or `recreate`.
    #[facet(default)]
    pub column_update: Option<String>,
}

impl Config {
    pub fn declaration(&self) -> &str {
        self.declaration.as_deref().unwrap_or(DEFAULT_DECLARATION)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
pub struct ConnectionConfig {
    #[facet(default)]
    pub host: Option<String>,

    #[facet(default)]
    pub port: Option<u16>,

    #[facet(default)]
    pub user: Option<String>,

    #[facet(default)]
    pub password: Option<String>,

    #[facet(default)]
    pub database: Option<String>,

    /// Schema (namespace) to reconcile.
    #[facet(default)]
    pub schema: Option<String>,

    /// `disable` (default), `require` or `verify-full`.
    #[facet(default)]
    pub sslmode: Option<String>,
}

impl ConnectionConfig {
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("localhost")
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(5432)
    }

    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or("postgres")
    }

    pub fn password(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }

    pub fn database(&self) -> &str {
        self.database.as_deref().unwrap_or("postgres")
    }

    pub fn schema(&self) -> &str {
        self.schema.as_deref().unwrap_or("public")
    }

    pub fn sslmode(&self) -> &str {
        self.sslmode.as_deref().unwrap_or("disable")
    }

    /// A libpq-style `key=value` connection string.
    pub fn to_conn_string(&self) -> String {
        let mut parts = vec![
            format!("host={}", conn_value(self.host())),
            format!("port={}", self.port()),
            format!("user={}", conn_value(self.user())),
            format!("dbname={}", conn_value(self.database())),
        ];
        if !self.password().is_empty() {
            parts.push(format!("password={}", conn_value(self.password())));
        }
        parts.join(" ")
    }
}

/// Quote a connection string value when it needs it.
fn conn_value(value: &str) -> String {
    let plain = !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if plain {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}
