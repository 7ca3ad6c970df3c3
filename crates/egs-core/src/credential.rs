//! Opaque credential handle

use std::fmt;
use std::sync::Arc;

/// Credential supplied by the session/auth provider.
///
/// The engine never inspects it; it is only handed through to the workspace
/// registry on behalf of the caller.
#[derive(Clone)]
pub struct Credential(Arc<str>);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::from(token.into()))
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Credential {}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}
