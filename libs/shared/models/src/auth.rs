use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct JwtHeader {
    pub alg: String,
    pub typ: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub exp: Option<u64>,
    pub email: Option<String>,
    pub role: Option<String>,
    pub app_metadata: Option<serde_json::Value>,
    pub aud: Option<String>,
    pub iat: Option<u64>,
}

impl JwtClaims {
    /// Collects the primary `role` claim plus any `app_metadata.roles` entries.
    pub fn role_set(&self) -> Vec<String> {
        let mut roles: Vec<String> = self.role.iter().cloned().collect();

        if let Some(extra) = self
            .app_metadata
            .as_ref()
            .and_then(|meta| meta.get("roles"))
            .and_then(|value| value.as_array())
        {
            for role in extra.iter().filter_map(|r| r.as_str()) {
                if !roles.iter().any(|existing| existing == role) {
                    roles.push(role.to_string());
                }
            }
        }

        roles
    }
}

/// Verified caller identity handed to the booking core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub roles: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role("admin")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn role_set_merges_metadata_roles_without_duplicates() {
        let claims = JwtClaims {
            sub: "user-1".to_string(),
            exp: None,
            email: None,
            role: Some("patient".to_string()),
            app_metadata: Some(json!({ "roles": ["patient", "admin"] })),
            aud: None,
            iat: None,
        };

        assert_eq!(claims.role_set(), vec!["patient".to_string(), "admin".to_string()]);
    }
}
