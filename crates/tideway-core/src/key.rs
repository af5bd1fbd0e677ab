//! Environment-namespaced cache keys.
//!
//! Every key has the shape `{resource}:{environment}:{identifier}`. Resources
//! are restricted to `[a-z0-9_.-]`, so the environment always sits in the
//! second segment. Identifier parts are percent-encoded before being joined,
//! which keeps composite identifiers like `("a:b")` and `("a", "b")` apart.

use std::fmt;

use crate::environment::Environment;
use crate::error::{Error, Result};

/// An immutable, fully rendered cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    resource: String,
    environment: Environment,
    identifier: String,
    rendered: String,
}

impl CacheKey {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// The encoded identifier segment.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.rendered
    }
}

/// Builds keys for a single deployment environment.
///
/// The environment is fixed at construction from the startup configuration;
/// the builder never reads ambient process state.
#[derive(Debug, Clone, Copy)]
pub struct KeyBuilder {
    environment: Environment,
}

impl KeyBuilder {
    pub fn new(environment: Environment) -> Self {
        Self { environment }
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Build a key for a single identifier.
    pub fn build(&self, resource: &str, identifier: &str) -> Result<CacheKey> {
        self.build_composite(resource, &[identifier])
    }

    /// Build a key whose identifier is a tuple, e.g. `(user_id, ip)`.
    pub fn build_composite(&self, resource: &str, parts: &[&str]) -> Result<CacheKey> {
        validate_resource(resource)?;

        if parts.is_empty() {
            return Err(Error::invalid_key(format!(
                "identifier for resource '{resource}' must not be empty"
            )));
        }

        let mut encoded = Vec::with_capacity(parts.len());
        for part in parts {
            if part.is_empty() {
                return Err(Error::invalid_key(format!(
                    "identifier part for resource '{resource}' must not be empty"
                )));
            }
            encoded.push(urlencoding::encode(part).into_owned());
        }
        let identifier = encoded.join(":");

        let rendered = format!("{}:{}:{}", resource, self.environment, identifier);
        Ok(CacheKey {
            resource: resource.to_string(),
            environment: self.environment,
            identifier,
            rendered,
        })
    }
}

fn validate_resource(resource: &str) -> Result<()> {
    if resource.is_empty() {
        return Err(Error::invalid_key("resource must not be empty"));
    }
    let valid = resource
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'-' | b'.'));
    if !valid {
        return Err(Error::invalid_key(format!(
            "resource '{resource}' may only contain [a-z0-9_.-]"
        )));
    }
    Ok(())
}
