//! The `deckhouse-registry` pull secret consumed by the rest of the platform
//!
//! [`DeckhouseRegistryConfig`] is built either for the embedded registry
//! (managed) or for a user supplied upstream (unmanaged) and compared by
//! value, raw docker config bytes included.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Error, Result};
use crate::helpers;

pub const KEY_ADDRESS: &str = "address";
pub const KEY_PATH: &str = "path";
pub const KEY_SCHEME: &str = "scheme";
pub const KEY_CA: &str = "ca";
pub const KEY_IMAGES_REGISTRY: &str = "imagesRegistry";
pub const KEY_DOCKER_CONFIG: &str = ".dockerconfigjson";

pub const SECRET_TYPE: &str = "kubernetes.io/dockerconfigjson";

/// An upstream registry reachable as `images_repo` (`host[/path]`)
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamParams {
    pub images_repo: String,
    pub scheme: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Credentials for the embedded registry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedParams {
    pub ca: String,
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeckhouseRegistryConfig {
    pub address: String,
    pub path: String,
    pub scheme: String,
    pub ca: String,
    pub images_registry: String,
    pub docker_config: Vec<u8>,
}

impl DeckhouseRegistryConfig {
    pub fn managed(params: &ManagedParams) -> Result<Self> {
        let address = constants::HOST.to_string();
        let path = constants::PATH.to_string();
        Ok(Self {
            images_registry: format!("{address}{path}"),
            docker_config: helpers::docker_config_json(
                &address,
                &params.username,
                &params.password,
            )?,
            address,
            path,
            scheme: constants::SCHEME.to_string(),
            ca: params.ca.clone(),
        })
    }

    pub fn unmanaged(params: &UpstreamParams) -> Result<Self> {
        let (address, path) = helpers::registry_address_and_path(&params.images_repo);
        Ok(Self {
            images_registry: format!("{address}{path}"),
            docker_config: helpers::docker_config_json(
                &address,
                &params.username,
                &params.password,
            )?,
            address,
            path,
            scheme: params.scheme.to_lowercase(),
            ca: params.ca.clone(),
        })
    }

    /// Decode from Secret data; absent keys become empty
    pub fn from_secret_data(data: &BTreeMap<String, ByteString>) -> Self {
        let text = |key: &str| {
            data.get(key)
                .map(|v| String::from_utf8_lossy(&v.0).into_owned())
                .unwrap_or_default()
        };
        Self {
            address: text(KEY_ADDRESS),
            path: text(KEY_PATH),
            scheme: text(KEY_SCHEME),
            ca: text(KEY_CA),
            images_registry: text(KEY_IMAGES_REGISTRY),
            docker_config: data
                .get(KEY_DOCKER_CONFIG)
                .map(|v| v.0.clone())
                .unwrap_or_default(),
        }
    }

    /// Decode the `deckhouse-registry` Secret, which must carry an address
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let data = secret.data.as_ref().filter(|d| !d.is_empty()).ok_or_else(|| {
            Error::ConfigError(format!(
                "secret {} has no data",
                constants::DECKHOUSE_REGISTRY_SECRET
            ))
        })?;
        let config = Self::from_secret_data(data);
        if config.address.is_empty() {
            return Err(Error::ConfigError(format!(
                "secret {} has no {KEY_ADDRESS}",
                constants::DECKHOUSE_REGISTRY_SECRET
            )));
        }
        Ok(config)
    }

    pub fn to_secret_data(&self) -> BTreeMap<String, ByteString> {
        BTreeMap::from([
            (KEY_ADDRESS.to_string(), ByteString(self.address.clone().into_bytes())),
            (KEY_PATH.to_string(), ByteString(self.path.clone().into_bytes())),
            (KEY_SCHEME.to_string(), ByteString(self.scheme.clone().into_bytes())),
            (KEY_CA.to_string(), ByteString(self.ca.clone().into_bytes())),
            (
                KEY_IMAGES_REGISTRY.to_string(),
                ByteString(self.images_registry.clone().into_bytes()),
            ),
            (KEY_DOCKER_CONFIG.to_string(), ByteString(self.docker_config.clone())),
        ])
    }

    /// The upstream this config points at, with credentials pulled from the
    /// docker config
    pub fn to_upstream(&self) -> Result<UpstreamParams> {
        let (username, password) =
            helpers::creds_from_docker_config(&self.docker_config, &self.address)?;
        Ok(UpstreamParams {
            images_repo: format!("{}{}", self.address, self.path),
            scheme: self.scheme.to_lowercase(),
            ca: self.ca.clone(),
            username,
            password,
        })
    }

    /// True when the config points at the embedded registry
    pub fn is_embedded(&self) -> bool {
        self.address == constants::HOST
    }

    pub fn global_values(&self) -> GlobalRegistryValues {
        GlobalRegistryValues {
            address: self.address.clone(),
            path: self.path.clone(),
            scheme: self.scheme.clone(),
            ca: self.ca.clone(),
        }
    }

    /// Content version used to roll downstream deployments
    pub fn version(&self) -> Result<String> {
        helpers::compute_hash(self)
    }
}

/// The subset of `global.modulesImages.registry` the switcher waits on
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalRegistryValues {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub scheme: String,
    #[serde(default, rename = "CA")]
    pub ca: String,
}
