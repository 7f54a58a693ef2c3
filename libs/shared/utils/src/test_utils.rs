use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use uuid::Uuid;

use shared_config::AppConfig;

pub struct TestConfig {
    pub jwt_secret: String,
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub webhook_url: String,
    pub webhook_secret: String,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "test-secret-key-for-jwt-validation-must-be-long-enough".to_string(),
            supabase_url: "http://localhost:54321".to_string(),
            supabase_anon_key: "test-anon-key".to_string(),
            webhook_url: "http://localhost:9999/webhook".to_string(),
            webhook_secret: "test-webhook-secret".to_string(),
        }
    }
}

impl TestConfig {
    pub fn with_supabase_url(url: &str) -> Self {
        Self {
            supabase_url: url.to_string(),
            ..Self::default()
        }
    }

    pub fn to_app_config(&self) -> AppConfig {
        AppConfig {
            supabase_url: self.supabase_url.clone(),
            supabase_anon_key: self.supabase_anon_key.clone(),
            supabase_jwt_secret: self.jwt_secret.clone(),
            webhook_url: self.webhook_url.clone(),
            webhook_secret: self.webhook_secret.clone(),
            ..AppConfig::default()
        }
    }

    pub fn to_arc(&self) -> Arc<AppConfig> {
        Arc::new(self.to_app_config())
    }
}

/// Caller identity used to mint test tokens. The first role goes into the
/// `role` claim, the rest into `app_metadata.roles`.
pub struct TestUser {
    pub id: String,
    pub email: String,
    pub roles: Vec<String>,
}

impl Default for TestUser {
    fn default() -> Self {
        Self::new("test@example.com", "patient")
    }
}

impl TestUser {
    pub fn new(email: &str, role: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            roles: vec![role.to_string()],
        }
    }

    /// A caller whose token subject is an existing patient or professional id.
    pub fn with_id(id: Uuid, role: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::new(&format!("{}@example.com", role), role)
        }
    }

    pub fn patient(email: &str) -> Self {
        Self::new(email, "patient")
    }

    pub fn admin(email: &str) -> Self {
        Self::new(email, "admin")
    }

    pub fn with_extra_role(mut self, role: &str) -> Self {
        self.roles.push(role.to_string());
        self
    }

    fn claims(&self, issued_at: i64, expires_at: i64) -> Value {
        let (primary, extra) = self.roles.split_first().map_or((None, &[][..]), |(p, rest)| (Some(p), rest));
        json!({
            "sub": self.id,
            "email": self.email,
            "role": primary,
            "app_metadata": { "roles": extra },
            "aud": "authenticated",
            "iat": issued_at,
            "exp": expires_at
        })
    }
}

pub struct JwtTestUtils;

impl JwtTestUtils {
    /// HS256 token for `user`, valid for `exp_hours` (default 24, negative for expired).
    pub fn create_test_token(user: &TestUser, secret: &str, exp_hours: Option<i64>) -> String {
        let now = Utc::now();
        let expires_at = now + Duration::hours(exp_hours.unwrap_or(24));
        Self::sign(&user.claims(now.timestamp(), expires_at.timestamp()), secret)
    }

    pub fn create_expired_token(user: &TestUser, secret: &str) -> String {
        Self::create_test_token(user, secret, Some(-1))
    }

    pub fn create_invalid_signature_token(user: &TestUser) -> String {
        Self::create_test_token(user, "wrong-secret", None)
    }

    pub fn create_malformed_token() -> String {
        "invalid.token.format".to_string()
    }

    pub fn sign(claims: &Value, secret: &str) -> String {
        let header = encode_segment(&json!({ "alg": "HS256", "typ": "JWT" }));
        let signing_input = format!("{}.{}", header, encode_segment(claims));

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
        mac.update(signing_input.as_bytes());

        format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }
}

fn encode_segment(value: &Value) -> String {
    URL_SAFE_NO_PAD.encode(value.to_string())
}

/// PostgREST-shaped rows for the booking tables.
pub struct MockSupabaseResponses;

impl MockSupabaseResponses {
    pub fn patient_response(patient_id: &str, email: &str, first_name: &str, last_name: &str) -> serde_json::Value {
        json!({
            "id": patient_id,
            "first_name": first_name,
            "last_name": last_name,
            "email": email
        })
    }

    pub fn professional_response(professional_id: &str, first_name: &str, last_name: &str, specialty: &str) -> serde_json::Value {
        json!({
            "id": professional_id,
            "first_name": first_name,
            "last_name": last_name,
            "specialty": specialty
        })
    }

    pub fn slot_response(slot_id: &str, professional_id: &str, date: &str, start_time: &str, end_time: &str) -> serde_json::Value {
        json!({
            "id": slot_id,
            "professional_id": professional_id,
            "date": date,
            "start_time": start_time,
            "end_time": end_time,
            "is_available": true,
            "is_locked": false,
            "lock_expires_at": null
        })
    }

    pub fn appointment_response(
        appointment_id: &str,
        patient_id: &str,
        professional_id: &str,
        date: &str,
        start_time: &str,
        end_time: &str,
        status: &str,
    ) -> serde_json::Value {
        json!({
            "id": appointment_id,
            "patient_id": patient_id,
            "professional_id": professional_id,
            "date": date,
            "start_time": start_time,
            "end_time": end_time,
            "status": status,
            "reason": "Routine check-up",
            "confirmation_sent": false,
            "confirmation_attempts": 0,
            "last_confirmation_response": null,
            "last_attempt_at": null,
            "created_at": "2025-01-20T09:00:00Z",
            "updated_at": "2025-01-20T09:00:00Z"
        })
    }
}
