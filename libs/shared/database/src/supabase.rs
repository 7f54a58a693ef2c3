use anyhow::{anyhow, Result};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client, Method, StatusCode,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use shared_config::AppConfig;

/// Failure reported by PostgREST, keeping the SQLSTATE so callers can
/// tell constraint violations from transport problems.
#[derive(Error, Debug)]
pub enum SupabaseError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid header value: {0}")]
    Header(String),

    #[error("API error ({status}) {code:?}: {message}")]
    Api {
        status: StatusCode,
        code: Option<String>,
        message: String,
    },
}

impl SupabaseError {
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            SupabaseError::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

pub struct SupabaseClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl SupabaseClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.supabase_url.trim_end_matches('/').to_string(),
            api_key: config.store_api_key().to_string(),
        }
    }

    fn get_headers(&self, auth_token: Option<&str>) -> Result<HeaderMap, SupabaseError> {
        let mut headers = HeaderMap::new();

        headers.insert(
            "apikey",
            HeaderValue::from_str(&self.api_key).map_err(|e| SupabaseError::Header(e.to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let bearer = auth_token.unwrap_or(&self.api_key);
        if !bearer.is_empty() {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", bearer))
                    .map_err(|e| SupabaseError::Header(e.to_string()))?,
            );
        }

        Ok(headers)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        auth_token: Option<&str>,
        body: Option<Value>,
        extra_headers: Option<HeaderMap>,
    ) -> Result<reqwest::Response, SupabaseError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making request to {}", url);

        let mut headers = self.get_headers(auth_token)?;
        if let Some(extra) = extra_headers {
            headers.extend(extra);
        }

        let mut req = self.client.request(method, &url).headers(headers);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_text = response.text().await.unwrap_or_default();
        let parsed: Option<Value> = serde_json::from_str(&error_text).ok();
        let code = parsed
            .as_ref()
            .and_then(|v| v.get("code"))
            .and_then(|c| c.as_str())
            .map(str::to_string);
        let message = parsed
            .as_ref()
            .and_then(|v| v.get("message"))
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or(error_text);

        if status.is_server_error() {
            error!("API error ({}): {}", status, message);
        } else {
            debug!("API rejected request ({}): {}", status, message);
        }

        Err(SupabaseError::Api { status, code, message })
    }

    pub async fn request<T>(
        &self,
        method: Method,
        path: &str,
        auth_token: Option<&str>,
        body: Option<Value>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let response = self
            .send(method, path, auth_token, body, None)
            .await
            .map_err(|e| match &e {
                SupabaseError::Api { status, .. } => match status.as_u16() {
                    401 | 403 => anyhow!("Authentication error: {}", e),
                    404 => anyhow!("Resource not found: {}", e),
                    _ => anyhow!(e),
                },
                _ => anyhow!(e),
            })?;

        let data = response.json::<T>().await?;
        Ok(data)
    }

    /// PATCH/POST returning the affected rows (`Prefer: return=representation`).
    pub async fn request_returning<T>(
        &self,
        method: Method,
        path: &str,
        body: Value,
    ) -> Result<Vec<T>, SupabaseError>
    where
        T: DeserializeOwned,
    {
        let mut prefer = HeaderMap::new();
        prefer.insert("Prefer", HeaderValue::from_static("return=representation"));

        let response = self.send(method, path, None, Some(body), Some(prefer)).await?;
        Ok(response.json::<Vec<T>>().await?)
    }

    /// Calls a Postgres function through `/rest/v1/rpc/{name}`; the function
    /// body runs inside a single database transaction.
    pub async fn rpc<T>(&self, function: &str, args: Value) -> Result<T, SupabaseError>
    where
        T: DeserializeOwned,
    {
        let path = format!("/rest/v1/rpc/{}", function);
        let response = self.send(Method::POST, &path, None, Some(args), None).await?;
        Ok(response.json::<T>().await?)
    }

    pub fn get_base_url(&self) -> &str {
        &self.base_url
    }
}
