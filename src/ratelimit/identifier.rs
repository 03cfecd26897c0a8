//! Caller identification.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::host::RequestContext;

/// Criteria used to pick the bucket a request counts against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitBy {
    /// Limit by the caller's network address
    #[default]
    Ip,
    /// Limit by the value of a configured request header
    Header,
    /// Limit requests to one exact path
    Path,
}

/// Opaque bucket key derived from a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier(String);

impl Identifier {
    /// Create an identifier from a raw value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty (every such request shares one bucket).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the identifier for a request.
///
/// Header and path modes fall back to the client address when they yield
/// nothing. A missing client address becomes the empty identifier.
pub fn resolve<C>(
    limit_by: LimitBy,
    header_name: Option<&str>,
    path: Option<&str>,
    ctx: &C,
) -> Identifier
where
    C: RequestContext + ?Sized,
{
    let selected = match limit_by {
        LimitBy::Header => header_name
            .and_then(|name| ctx.header(name))
            .filter(|value| !value.is_empty()),
        LimitBy::Path => match (path, ctx.path()) {
            (Some(expected), Some(actual)) if actual == expected => Some(actual),
            _ => None,
        },
        LimitBy::Ip => None,
    };

    match selected {
        Some(value) => Identifier(value),
        None => Identifier(ctx.client_address().unwrap_or_default()),
    }
}
