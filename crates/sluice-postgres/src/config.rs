//! Postgres destination configuration

use schemars::JsonSchema;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

/// Mask used wherever a [`DbSecret`] would otherwise leak.
const SECRET_MASK: &str = "****";

/// A database credential.
///
/// The value is masked in `Debug`, `Display` and serialized output, so a
/// config echoed to logs or dumped back to YAML never carries the password.
/// The adapter reads it through [`DbSecret::reveal`] exactly once, while
/// rendering the connection string.
#[derive(Clone)]
pub struct DbSecret(SecretString);

impl DbSecret {
    /// The raw credential. Only the connection-string builder should need
    /// this.
    pub fn reveal(&self) -> &str {
        self.0.expose_secret()
    }

    /// The credential as a quoted libpq value: wrapped in single quotes,
    /// with backslashes and quotes escaped, so passwords containing spaces
    /// or `'` survive `key=value` connection strings.
    pub fn libpq_quoted(&self) -> String {
        let raw = self.reveal();
        let mut quoted = String::with_capacity(raw.len() + 2);
        quoted.push('\'');
        for c in raw.chars() {
            if c == '\'' || c == '\\' {
                quoted.push('\\');
            }
            quoted.push(c);
        }
        quoted.push('\'');
        quoted
    }
}

impl From<String> for DbSecret {
    fn from(value: String) -> Self {
        Self(SecretString::new(value.into_boxed_str()))
    }
}

impl From<&str> for DbSecret {
    fn from(value: &str) -> Self {
        value.to_string().into()
    }
}

impl std::fmt::Debug for DbSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DbSecret({SECRET_MASK})")
    }
}

impl std::fmt::Display for DbSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(SECRET_MASK)
    }
}

impl Serialize for DbSecret {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(SECRET_MASK)
    }
}

impl<'de> Deserialize<'de> for DbSecret {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(String::deserialize(deserializer)?.into())
    }
}

impl JsonSchema for DbSecret {
    fn schema_name() -> String {
        "DbSecret".to_string()
    }

    fn json_schema(_gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        use schemars::schema::{InstanceType, SchemaObject};
        let mut schema = SchemaObject {
            instance_type: Some(InstanceType::String.into()),
            format: Some("password".to_string()),
            ..Default::default()
        };
        schema.metadata().write_only = true;
        schemars::schema::Schema::Object(schema)
    }
}

/// Connection settings for a Postgres destination.
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct PostgresConfig {
    /// Server host name or address.
    #[validate(length(min = 1, max = 255))]
    pub host: String,

    /// Server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Database name.
    #[validate(length(min = 1, max = 255))]
    pub database: String,

    /// Schema that receives the destination tables.
    #[serde(default = "default_schema")]
    #[validate(length(min = 1, max = 255))]
    pub schema: String,

    /// Username for authentication.
    #[validate(length(min = 1, max = 255))]
    pub username: String,

    /// Password for authentication.
    #[serde(default)]
    pub password: Option<DbSecret>,

    /// Extra libpq-style connection parameters, appended verbatim.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

fn default_port() -> u16 {
    5432
}

fn default_schema() -> String {
    "public".to_string()
}

impl PostgresConfig {
    /// Render the libpq-style connection string.
    pub fn connection_string(&self) -> String {
        let mut parts = vec![
            format!("host={}", self.host),
            format!("port={}", self.port),
            format!("dbname={}", self.database),
            format!("user={}", self.username),
        ];
        if let Some(password) = &self.password {
            parts.push(format!("password={}", password.libpq_quoted()));
        }
        for (key, value) in &self.parameters {
            parts.push(format!("{key}={value}"));
        }
        parts.join(" ")
    }
}
