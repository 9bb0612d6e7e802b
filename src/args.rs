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

use blob_buffer::{BufferConfig, Config, ConfigError, StorageConfig, UploaderConfig};
use clap::{
    error::{Error, ErrorKind},
    Parser,
};
use std::{path::PathBuf, time::Duration};

#[derive(Parser, Debug, Clone, Default)]
#[command(
    version,
    about,
    long_about = "Read lines from standard input and upload them in large chunks to a blob store"
)]
pub struct Args {
    /// TOML configuration file; other flags override its values
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Key prefix for uploaded objects
    #[arg(long, short)]
    pub name: Option<String>,

    /// Destination bucket
    #[arg(long, short)]
    pub bucket: Option<String>,

    /// Base URL of the S3-compatible endpoint
    #[arg(long, short)]
    pub endpoint: Option<String>,

    /// Upload once the buffer holds this many bytes
    #[arg(long, value_parser = parse_greater_than_zero::<u64>)]
    pub max_size: Option<u64>,

    /// Text written at the start of every uploaded object
    #[arg(long)]
    pub header: Option<String>,

    /// Buffer in temporary files inside this directory instead of memory
    #[arg(long)]
    pub spill_directory: Option<PathBuf>,

    /// Maximum number of concurrent uploads
    #[arg(long, value_parser = parse_greater_than_zero::<usize>)]
    pub max_concurrent_uploads: Option<usize>,

    /// Number of attempts for each upload
    #[arg(long, value_parser = parse_greater_than_zero::<usize>)]
    pub max_retries: Option<usize>,

    /// Request timeout in seconds
    #[arg(long, value_parser = parse_duration_seconds)]
    pub request_timeout: Option<Duration>,

    /// User-Agent string for HTTP requests
    #[arg(long, short)]
    pub user_agent: Option<String>,
}

fn parse_greater_than_zero<T>(s: &str) -> Result<T, Error>
where
    T: std::str::FromStr + PartialEq + Default,
{
    let v: T = s.parse().map_err(|_| {
        Error::raw(
            ErrorKind::InvalidValue,
            format!("`{s}` isn't a valid integer"),
        )
    })?;
    if v == T::default() {
        Err(Error::raw(
            ErrorKind::InvalidValue,
            "Value must be greater than 0",
        ))
    } else {
        Ok(v)
    }
}

fn parse_duration_seconds(s: &str) -> Result<Duration, Error> {
    let seconds = parse_greater_than_zero(s)?;
    Ok(Duration::from_secs(seconds))
}

fn required(value: Option<String>, flag: &str) -> Result<String, ConfigError> {
    value.ok_or_else(|| ConfigError::Invalid(format!("--{flag} is required without --config")))
}

impl Args {
    /// Build the effective configuration from the config file and flags.
    pub async fn into_config(self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::load(path).await?,
            None => Config {
                buffer: BufferConfig::new(
                    required(self.name.clone(), "name")?,
                    required(self.bucket.clone(), "bucket")?,
                ),
                uploader: UploaderConfig::new(required(self.endpoint.clone(), "endpoint")?),
            },
        };

        if let Some(name) = self.name {
            config.buffer.name = name;
        }
        if let Some(bucket) = self.bucket {
            config.buffer.bucket = bucket;
        }
        if let Some(max_size) = self.max_size {
            config.buffer.max_size = max_size;
        }
        if let Some(header) = self.header {
            config.buffer.header = header;
        }
        if let Some(directory) = self.spill_directory {
            config.buffer.storage = StorageConfig::File {
                directory: Some(directory),
            };
        }
        if let Some(max_concurrent_uploads) = self.max_concurrent_uploads {
            config.buffer.max_concurrent_uploads = max_concurrent_uploads;
        }
        if let Some(endpoint) = self.endpoint {
            config.uploader.endpoint = endpoint;
        }
        if let Some(max_retries) = self.max_retries {
            config.uploader.max_retries = max_retries;
        }
        if let Some(timeout) = self.request_timeout {
            config.uploader.request_timeout_secs = timeout.as_secs();
        }
        if let Some(user_agent) = self.user_agent {
            config.uploader.user_agent = user_agent;
        }

        config.validate()?;
        Ok(config)
    }
}
