/*
Copyright 2025 The Skylet Authors.
Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at
    http://www.apache.org/licenses/LICENSE-2.0
Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

pub mod ctx;
pub mod quantity;

use std::fmt::Display;

use stdng::StdngError;
use thiserror::Error;
use time::macros::format_description;
use tracing_subscriber::filter::{FromEnvError, ParseError};
use tracing_subscriber::fmt::time::LocalTime;

pub const DEFAULT_NAMESPACE: &str = "default";

/// Failures reported by a cloud backend, classified by how the caller
/// should react to them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Network errors, 5xx responses and throttling; worth retrying.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// Validation errors and other 4xx responses; retrying will not help.
    #[error("permanent backend error: {0}")]
    Permanent(String),

    #[error("'{0}' not found in backend")]
    NotFound(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }
}

#[derive(Error, Debug, Clone)]
pub enum SkyletError {
    #[error("{0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Translation(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("'{0}' not found")]
    NotFound(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("'{0}' was cancelled")]
    Cancelled(String),

    #[error("{0}")]
    Internal(String),

    #[error("failed to {op} pod <{pod}>: {source}")]
    Operation {
        op: String,
        pod: String,
        source: Box<SkyletError>,
    },
}

impl SkyletError {
    /// Attaches the lifecycle operation and pod to the error; errors that
    /// already carry that context are returned unchanged.
    pub fn with_pod(self, op: &str, pod: &impl Display) -> Self {
        match self {
            SkyletError::Operation { .. } => self,
            _ => SkyletError::Operation {
                op: op.to_string(),
                pod: pod.to_string(),
                source: Box::new(self),
            },
        }
    }

    /// The underlying error, without operation context.
    pub fn root(&self) -> &SkyletError {
        match self {
            SkyletError::Operation { source, .. } => source.root(),
            _ => self,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root(),
            SkyletError::NotFound(_) | SkyletError::Backend(BackendError::NotFound(_))
        )
    }
}

impl From<StdngError> for SkyletError {
    fn from(value: StdngError) -> Self {
        SkyletError::Internal(value.to_string())
    }
}

impl From<StdngError> for BackendError {
    fn from(value: StdngError) -> Self {
        BackendError::Permanent(value.to_string())
    }
}

impl From<std::io::Error> for SkyletError {
    fn from(value: std::io::Error) -> Self {
        SkyletError::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for SkyletError {
    fn from(value: serde_json::Error) -> Self {
        SkyletError::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for SkyletError {
    fn from(value: serde_yaml::Error) -> Self {
        SkyletError::InvalidConfig(value.to_string())
    }
}

impl From<toml::de::Error> for SkyletError {
    fn from(value: toml::de::Error) -> Self {
        SkyletError::InvalidConfig(value.to_string())
    }
}

impl From<ParseError> for SkyletError {
    fn from(value: ParseError) -> Self {
        SkyletError::InvalidConfig(value.to_string())
    }
}

impl From<FromEnvError> for SkyletError {
    fn from(value: FromEnvError) -> Self {
        SkyletError::InvalidConfig(value.to_string())
    }
}

pub fn init_logger() -> Result<(), SkyletError> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("h2=error".parse()?)
        .add_directive("hyper=warn".parse()?)
        .add_directive("hyper_util=error".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("rustls=warn".parse()?);

    let time_format = LocalTime::new(format_description!(
        "[hour repr:24]:[minute]:[second].[subsecond digits:3]"
    ));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(time_format)
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .map_err(|e| SkyletError::Internal(format!("failed to init logger: {e}")))?;

    Ok(())
}
