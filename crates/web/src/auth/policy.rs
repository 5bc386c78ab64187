//! Operation allow-list enforcement.

use tracing::warn;

use vmctl_common::{AllowList, Claims, Error, Result};

/// Gate between verified claims and the executor
#[derive(Debug, Clone, Default)]
pub struct OperationPolicy {
    allow: AllowList,
}

impl OperationPolicy {
    pub fn new(allow: AllowList) -> Self {
        Self { allow }
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow
    }

    pub fn authorize(&self, claims: &Claims) -> Result<()> {
        if self.allow.contains(&claims.operation) {
            return Ok(());
        }
        warn!(vm = %claims.vm_name, "Forbidden operation requested: {}", claims.operation);
        Err(Error::Forbidden(claims.operation.clone()))
    }
}
