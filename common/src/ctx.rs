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

use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde_derive::{Deserialize, Serialize};
use strum_macros::{Display as StrumDisplay, EnumString};

use crate::quantity;
use crate::SkyletError;

const DEFAULT_BACKEND: &str = "ecs";
const DEFAULT_CLUSTER: &str = "default";
const DEFAULT_CPU: &str = "20";
const DEFAULT_MEMORY: &str = "100Gi";
const DEFAULT_PODS: &str = "20";
const DEFAULT_OPERATING_SYSTEM: &str = "Linux";
const DEFAULT_LOG_GROUP_PREFIX: &str = "/skylet";

pub const ENV_AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const ENV_AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const ENV_AWS_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
pub const ENV_AWS_REGION: &str = "AWS_REGION";
pub const ENV_AZURE_ACCESS_TOKEN: &str = "AZURE_ACCESS_TOKEN";
pub const ENV_AZURE_SUBSCRIPTION_ID: &str = "AZURE_SUBSCRIPTION_ID";
pub const ENV_ACI_REGION: &str = "ACI_REGION";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, StrumDisplay, EnumString, Serialize, Deserialize,
)]
pub enum OperatingSystem {
    #[default]
    Linux,
    Windows,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, StrumDisplay, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BackendKind {
    #[default]
    Ecs,
    Aci,
}

/// The raw settings as written in the config file; every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProviderConfigFile {
    pub backend: Option<String>,
    pub region: Option<String>,
    pub cluster: Option<String>,
    #[serde(rename = "SubscriptionID")]
    pub subscription_id: Option<String>,
    #[serde(rename = "CPU")]
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub pods: Option<String>,
    pub operating_system: Option<String>,
    pub log_group: Option<String>,
    pub execution_role_arn: Option<String>,
}

/// A snapshot of the process environment, taken once at startup.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: HashMap<String, String>,
}

impl Environment {
    pub fn capture() -> Self {
        std::env::vars().collect()
    }

    /// Returns the variable when it is set to a non-empty value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Environment {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub session_token: Option<String>,
    pub azure_token: Option<String>,
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "***");
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &redact(&self.secret_key))
            .field("session_token", &redact(&self.session_token))
            .field("azure_token", &redact(&self.azure_token))
            .finish()
    }
}

/// The resolved, immutable provider configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub backend: BackendKind,
    pub region: String,
    /// The ECS cluster, or the ACI resource group.
    pub cluster: String,
    pub subscription_id: Option<String>,
    pub cpu: String,
    pub memory: String,
    pub pods: String,
    pub operating_system: OperatingSystem,
    pub log_group: String,
    pub execution_role_arn: Option<String>,
    pub credentials: Credentials,
}

impl Display for ProviderConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "backend: {}, region: {}, cluster: {}, os: {}",
            self.backend, self.region, self.cluster, self.operating_system
        )
    }
}

impl ProviderConfig {
    /// Loads the configuration; `None` resolves the defaults only.
    /// Files ending in `.yaml`/`.yml` are read as YAML, everything else as TOML.
    pub fn from_file(fp: Option<String>, env: &Environment) -> Result<Self, SkyletError> {
        let Some(fp) = fp else {
            return ProviderConfig::resolve(ProviderConfigFile::default(), env);
        };

        if !Path::new(&fp).is_file() {
            return Err(SkyletError::InvalidConfig(format!("<{fp}> is not a file")));
        }

        let contents = fs::read_to_string(&fp)?;
        let is_yaml = Path::new(&fp)
            .extension()
            .map(|ext| ext == "yaml" || ext == "yml")
            .unwrap_or(false);

        let raw: ProviderConfigFile = if is_yaml {
            serde_yaml::from_str(&contents)?
        } else {
            toml::from_str(&contents)?
        };

        tracing::debug!("Load ProviderConfig from <{fp}>: {raw:?}");

        ProviderConfig::resolve(raw, env)
    }

    pub fn from_toml(contents: &str, env: &Environment) -> Result<Self, SkyletError> {
        let raw: ProviderConfigFile = toml::from_str(contents)?;
        ProviderConfig::resolve(raw, env)
    }

    fn resolve(raw: ProviderConfigFile, env: &Environment) -> Result<Self, SkyletError> {
        let backend_name = raw.backend.unwrap_or(DEFAULT_BACKEND.to_string());
        let backend = BackendKind::from_str(&backend_name).map_err(|_| {
            SkyletError::InvalidConfig(format!("\"{backend_name}\" is not a valid backend"))
        })?;

        let os_name = raw
            .operating_system
            .unwrap_or(DEFAULT_OPERATING_SYSTEM.to_string());
        let operating_system = OperatingSystem::from_str(&os_name).map_err(|_| {
            SkyletError::InvalidConfig(format!("\"{os_name}\" is not a valid operating system"))
        })?;

        let cpu = raw.cpu.unwrap_or(DEFAULT_CPU.to_string());
        quantity::cpu_millis(&cpu)?;
        let memory = raw.memory.unwrap_or(DEFAULT_MEMORY.to_string());
        quantity::memory_bytes(&memory)?;
        let pods = raw.pods.unwrap_or(DEFAULT_PODS.to_string());
        quantity::count(&pods)?;

        let region_var = match backend {
            BackendKind::Ecs => ENV_AWS_REGION,
            BackendKind::Aci => ENV_ACI_REGION,
        };
        let region = env
            .get(region_var)
            .map(str::to_string)
            .or(raw.region)
            .unwrap_or_default();

        let subscription_id = env
            .get(ENV_AZURE_SUBSCRIPTION_ID)
            .map(str::to_string)
            .or(raw.subscription_id);

        let cluster = raw.cluster.unwrap_or(DEFAULT_CLUSTER.to_string());
        let log_group = raw
            .log_group
            .unwrap_or(format!("{DEFAULT_LOG_GROUP_PREFIX}/{cluster}"));

        let credentials = Credentials {
            access_key: env.get(ENV_AWS_ACCESS_KEY_ID).map(str::to_string),
            secret_key: env.get(ENV_AWS_SECRET_ACCESS_KEY).map(str::to_string),
            session_token: env.get(ENV_AWS_SESSION_TOKEN).map(str::to_string),
            azure_token: env.get(ENV_AZURE_ACCESS_TOKEN).map(str::to_string),
        };

        Ok(ProviderConfig {
            backend,
            region,
            cluster,
            subscription_id,
            cpu,
            memory,
            pods,
            operating_system,
            log_group,
            execution_role_arn: raw.execution_role_arn,
            credentials,
        })
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            backend: BackendKind::default(),
            region: String::new(),
            cluster: DEFAULT_CLUSTER.to_string(),
            subscription_id: None,
            cpu: DEFAULT_CPU.to_string(),
            memory: DEFAULT_MEMORY.to_string(),
            pods: DEFAULT_PODS.to_string(),
            operating_system: OperatingSystem::default(),
            log_group: format!("{DEFAULT_LOG_GROUP_PREFIX}/{DEFAULT_CLUSTER}"),
            execution_role_arn: None,
            credentials: Credentials::default(),
        }
    }
}
