use std::env;
use std::str::FromStr;
use tracing::warn;

const DEFAULT_WEBHOOK_SECRET: &str = "default-webhook-secret-change-in-production";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_service_role_key: String,
    pub supabase_jwt_secret: String,
    pub redis_url: Option<String>,
    pub webhook_url: String,
    pub webhook_secret: String,
    pub webhook_timeout_seconds: u64,
    pub confirmation_max_retries: u32,
    pub retry_delay_ms: u64,
    pub slot_lock_minutes: i64,
    pub bus_max_deliveries: u32,
    pub worker_concurrency: u32,
    /// Stable prefix for consumer names; a restarted worker recovers the
    /// unacked messages of the consumers it had under the same id.
    pub worker_id: String,
    pub server_port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            supabase_service_role_key: String::new(),
            supabase_jwt_secret: String::new(),
            redis_url: None,
            webhook_url: "http://httpbin.org/post".to_string(),
            webhook_secret: DEFAULT_WEBHOOK_SECRET.to_string(),
            webhook_timeout_seconds: 10,
            confirmation_max_retries: 3,
            retry_delay_ms: 60_000,
            slot_lock_minutes: 5,
            bus_max_deliveries: 5,
            worker_concurrency: 4,
            worker_id: "confirmation-worker".to_string(),
            server_port: 3000,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_service_role_key: env::var("SUPABASE_SERVICE_ROLE_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_SERVICE_ROLE_KEY not set, store calls will use the anon key");
                    String::new()
                }),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            redis_url: env::var("REDIS_URL").ok(),
            webhook_url: env::var("WEBHOOK_URL")
                .unwrap_or_else(|_| {
                    warn!("WEBHOOK_URL not set, using default");
                    defaults.webhook_url.clone()
                }),
            webhook_secret: env::var("WEBHOOK_SECRET")
                .unwrap_or_else(|_| {
                    warn!("WEBHOOK_SECRET not set, using the insecure default secret");
                    defaults.webhook_secret.clone()
                }),
            webhook_timeout_seconds: parse_env("WEBHOOK_TIMEOUT_SECONDS", defaults.webhook_timeout_seconds),
            confirmation_max_retries: parse_env("CONFIRMATION_MAX_RETRIES", defaults.confirmation_max_retries),
            retry_delay_ms: parse_env("RETRY_DELAY_MS", defaults.retry_delay_ms),
            slot_lock_minutes: parse_env("SLOT_LOCK_MINUTES", defaults.slot_lock_minutes),
            bus_max_deliveries: parse_env("BUS_MAX_DELIVERIES", defaults.bus_max_deliveries),
            worker_concurrency: parse_env("WORKER_CONCURRENCY", defaults.worker_concurrency),
            worker_id: env::var("WORKER_ID").unwrap_or_else(|_| defaults.worker_id.clone()),
            server_port: parse_env("SERVER_PORT", defaults.server_port),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }

    pub fn redis_url_or_default(&self) -> String {
        self.redis_url
            .clone()
            .unwrap_or_else(|| "redis://localhost:6379".to_string())
    }

    /// Key used for store writes: the service role key when present.
    pub fn store_api_key(&self) -> &str {
        if self.supabase_service_role_key.is_empty() {
            &self.supabase_anon_key
        } else {
            &self.supabase_service_role_key
        }
    }

    pub fn uses_default_webhook_secret(&self) -> bool {
        self.webhook_secret == DEFAULT_WEBHOOK_SECRET
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has an invalid value '{}', using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}
