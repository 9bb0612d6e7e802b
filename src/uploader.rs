// Copyright (c) 2024-2025 Federico G. Schwindt <fgsch@lodoss.net>
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use async_trait::async_trait;
use reqwest::{
    header::{self, HeaderMap, HeaderValue},
    Body, StatusCode,
};
use std::{error::Error as _, time::Duration};
use thiserror::Error;
use tokio::time::sleep;

use crate::{
    config::{ConfigError, UploaderConfig},
    segment::Segment,
};

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("read of segment {key} failed: {source}")]
    Read {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Client error {status_code} for key {key}: not retrying")]
    Client { key: String, status_code: StatusCode },
    #[error("HTTP error {status_code} for key {key}: failed after {retries} retries")]
    Http {
        key: String,
        status_code: StatusCode,
        retries: usize,
    },
    #[error("Network error {error} for key {key}: failed after {retries} retries")]
    Network {
        key: String,
        error: String,
        retries: usize,
    },
}

impl UploadError {
    pub fn key(&self) -> &str {
        match self {
            UploadError::Read { key, .. }
            | UploadError::Client { key, .. }
            | UploadError::Http { key, .. }
            | UploadError::Network { key, .. } => key,
        }
    }

    fn with_retries(mut self, attempts: usize) -> Self {
        match &mut self {
            UploadError::Http { retries, .. } | UploadError::Network { retries, .. } => {
                *retries = attempts
            }
            _ => {}
        }
        self
    }
}

/// Capability that stores a segment in the remote blob store.
///
/// The segment stays valid for the whole call, so implementations may read it
/// as many times as their retry policy requires. An `Err` is final: the
/// caller does not retry.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, bucket: &str, segment: &Segment) -> Result<(), UploadError>;
}

/// Internal error classification for retry logic
#[derive(Debug)]
enum AttemptError {
    Fatal(UploadError),
    Retriable(UploadError),
}

/// Uploads segments with a plain `PUT {endpoint}/{bucket}/{key}`.
#[derive(Clone, Debug)]
pub struct HttpUploader {
    client: reqwest::Client,
    endpoint: String,
    max_retries: usize,
}

impl HttpUploader {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, max_retries: usize) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            max_retries: max_retries.max(1),
        }
    }

    pub fn from_config(config: &UploaderConfig) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.bearer_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| ConfigError::Invalid("bearer token is not a valid header".into()))?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self::new(client, &config.endpoint, config.max_retries))
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{bucket}/{key}", self.endpoint)
    }

    async fn upload_once(&self, bucket: &str, segment: &Segment) -> Result<(), AttemptError> {
        let key = segment.key();
        let body = match segment.spill_path() {
            // Buffer in memory already; hand it over without a stream wrapper.
            None => Body::from(segment.bytes().await.map_err(|source| {
                AttemptError::Fatal(UploadError::Read {
                    key: key.to_string(),
                    source,
                })
            })?),
            Some(_) => Body::wrap_stream(segment.stream().map_err(|source| {
                AttemptError::Fatal(UploadError::Read {
                    key: key.to_string(),
                    source,
                })
            })?),
        };

        let request = self
            .client
            .put(self.object_url(bucket, key))
            .header(header::CONTENT_LENGTH, segment.len())
            .body(body);

        match request.send().await {
            Ok(response) => match response.status() {
                status_code if status_code.is_success() => Ok(()),
                status_code if status_code.is_client_error() => {
                    Err(AttemptError::Fatal(UploadError::Client {
                        key: key.to_string(),
                        status_code,
                    }))
                }
                status_code => Err(AttemptError::Retriable(UploadError::Http {
                    key: key.to_string(),
                    status_code,
                    retries: 0,
                })),
            },
            Err(err) => Err(AttemptError::Retriable(UploadError::Network {
                key: key.to_string(),
                error: err
                    .source()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| err.to_string()),
                retries: 0,
            })),
        }
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, bucket: &str, segment: &Segment) -> Result<(), UploadError> {
        let mut retry = 1;
        loop {
            match self.upload_once(bucket, segment).await {
                Ok(()) => return Ok(()),
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Retriable(err)) => {
                    if retry >= self.max_retries {
                        return Err(err.with_retries(self.max_retries));
                    }
                    tracing::warn!("{err}, retrying (attempt {retry}/{})", self.max_retries);
                    // Exponential backoff before retry
                    sleep(Duration::from_secs(u64::pow(2, (retry - 1) as u32))).await;
                    retry += 1;
                }
            }
        }
    }
}
