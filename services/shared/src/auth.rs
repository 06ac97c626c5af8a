use serde::{Deserialize, Serialize};

/// Claims extracted from a verified bearer token.
///
/// The verifier contract guarantees `exp` and `iat` were already checked;
/// everything else is carried through as-is for downstream decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Arbitrary provider metadata; may carry a nested `tenant_id`.
    #[serde(default)]
    pub app_metadata: Option<serde_json::Value>,
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
}

impl Claims {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// The tenant claim, checking the top-level claim first and then
    /// `app_metadata.tenant_id`.
    pub fn tenant_claim(&self) -> Option<&str> {
        if let Some(id) = self.tenant_id.as_deref() {
            return Some(id);
        }
        self.app_metadata
            .as_ref()
            .and_then(|m| m.get("tenant_id"))
            .and_then(|v| v.as_str())
    }
}
