//! Confluent-compatible schema registry client.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::time::Duration;
use tracing::debug;

use crate::error::{
    RegistryClientSnafu, RegistryError, RegistryHttpSnafu, RegistryRejectedSnafu,
    RegistryUnavailableSnafu, SchemaExistsSnafu, SchemaIdNotFoundSnafu, SubjectNotFoundSnafu,
};

use super::{RegisteredSchema, SchemaRegistry};

const CONTENT_TYPE: &str = "application/vnd.schemaregistry.v1+json";

/// Confluent error code for a missing schema id.
const SCHEMA_NOT_FOUND: i64 = 40403;

#[derive(Serialize)]
struct RegisterRequest<'a> {
    schema: &'a str,
}

#[derive(Deserialize)]
struct RegisterResponse {
    id: u32,
}

#[derive(Deserialize)]
struct SubjectVersionResponse {
    subject: String,
    id: u32,
    version: u32,
    schema: String,
}

#[derive(Deserialize)]
struct SchemaResponse {
    schema: String,
}

#[derive(Deserialize)]
struct SubjectVersion {
    subject: String,
    version: u32,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    message: String,
}

/// What a failed request was looking for, to pick the not-found variant.
enum Lookup<'a> {
    Subject(&'a str),
    Id(u32),
}

/// HTTP client for a Confluent-compatible registry.
#[derive(Debug, Clone)]
pub struct HttpSchemaRegistry {
    client: Client,
    base_url: String,
}

impl HttpSchemaRegistry {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, RegistryError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context(RegistryClientSnafu)?;

        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_owned(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn check(response: Response, lookup: Lookup<'_>) -> Result<Response, RegistryError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body: ErrorBody = response.json().await.unwrap_or_default();
        debug!(
            status = status.as_u16(),
            error_code = body.error_code,
            message = %body.message,
            "Registry request failed"
        );

        match status {
            StatusCode::NOT_FOUND => match lookup {
                Lookup::Id(id) => SchemaIdNotFoundSnafu { id }.fail(),
                // 40403 on a subject route means the request itself was malformed.
                Lookup::Subject(_) if body.error_code == SCHEMA_NOT_FOUND => RegistryRejectedSnafu {
                    status: status.as_u16(),
                    code: body.error_code,
                    message: body.message,
                }
                .fail(),
                Lookup::Subject(subject) => SubjectNotFoundSnafu { subject }.fail(),
            },
            StatusCode::CONFLICT if body.message.to_ascii_lowercase().contains("already exists") => {
                let subject = match lookup {
                    Lookup::Subject(subject) => subject.to_string(),
                    Lookup::Id(id) => id.to_string(),
                };
                SchemaExistsSnafu { subject }.fail()
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                RegistryUnavailableSnafu {
                    message: format!("{status}: {}", body.message),
                }
                .fail()
            }
            status if status.is_server_error() => RegistryUnavailableSnafu {
                message: format!("{status}: {}", body.message),
            }
            .fail(),
            status => RegistryRejectedSnafu {
                status: status.as_u16(),
                code: body.error_code,
                message: body.message,
            }
            .fail(),
        }
    }
}

#[async_trait]
impl SchemaRegistry for HttpSchemaRegistry {
    async fn register(&self, subject: &str, schema: &str) -> Result<u32, RegistryError> {
        let url = format!("{}/subjects/{}/versions", self.base_url, subject);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .json(&RegisterRequest { schema })
            .send()
            .await
            .context(RegistryHttpSnafu)?;

        let response = Self::check(response, Lookup::Subject(subject)).await?;
        let body: RegisterResponse = response.json().await.context(RegistryHttpSnafu)?;
        Ok(body.id)
    }

    async fn latest(&self, subject: &str) -> Result<RegisteredSchema, RegistryError> {
        let url = format!("{}/subjects/{}/versions/latest", self.base_url, subject);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context(RegistryHttpSnafu)?;

        let response = Self::check(response, Lookup::Subject(subject)).await?;
        let body: SubjectVersionResponse = response.json().await.context(RegistryHttpSnafu)?;
        Ok(RegisteredSchema {
            subject: body.subject,
            id: body.id,
            version: body.version,
            schema: body.schema,
        })
    }

    async fn by_id(&self, id: u32) -> Result<RegisteredSchema, RegistryError> {
        let url = format!("{}/schemas/ids/{}", self.base_url, id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context(RegistryHttpSnafu)?;
        let response = Self::check(response, Lookup::Id(id)).await?;
        let schema: SchemaResponse = response.json().await.context(RegistryHttpSnafu)?;

        let url = format!("{}/schemas/ids/{}/versions", self.base_url, id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context(RegistryHttpSnafu)?;
        let response = Self::check(response, Lookup::Id(id)).await?;
        let versions: Vec<SubjectVersion> = response.json().await.context(RegistryHttpSnafu)?;

        // A schema shared by several subjects: prefer the record-value subject.
        let entry = versions
            .iter()
            .find(|v| v.subject.ends_with("-value"))
            .or_else(|| versions.first())
            .context(SchemaIdNotFoundSnafu { id })?;

        Ok(RegisteredSchema {
            subject: entry.subject.clone(),
            id,
            version: entry.version,
            schema: schema.schema,
        })
    }
}
