//! Fetching a service's schema at registration time

use async_trait::async_trait;
use rungate::SchemaError;
use rungate::schema::introspection::IntrospectionResponse;
use rungate::schema::{INTROSPECTION_QUERY, sdl_from_introspection};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntrospectionError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} answered introspection with status {status}")]
    Status { url: String, status: u16 },
    #[error("{0}")]
    Schema(#[from] SchemaError),
}

/// Source of a service's SDL.
#[async_trait]
pub trait Introspector: Send + Sync {
    async fn introspect(&self, url: &str) -> Result<String, IntrospectionError>;
}

/// Runs the standard introspection query against the service's GraphQL endpoint.
pub struct HttpIntrospector {
    client: reqwest::Client,
}

impl HttpIntrospector {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl Introspector for HttpIntrospector {
    async fn introspect(&self, url: &str) -> Result<String, IntrospectionError> {
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "query": INTROSPECTION_QUERY }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(IntrospectionError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let body: IntrospectionResponse = response.json().await?;
        let schema = body.into_schema()?;
        Ok(sdl_from_introspection(&schema)?)
    }
}
