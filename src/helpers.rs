//! Small shared helpers: content hashing, credential generation and
//! docker-config parsing.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub const PASSWORD_LENGTH: usize = 16;
pub const SECRET_LENGTH: usize = 25;

/// SHA-256 over the canonical JSON form of `value`.
///
/// The value is first converted to a `serde_json::Value`, whose object map
/// keeps keys sorted, so field and map ordering never changes the digest.
pub fn compute_hash<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let canonical = serde_json::to_value(value)?;
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Alphanumeric (`[A-Za-z0-9]`) string drawn from the OS CSPRNG
pub fn generate_random_string(length: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

pub fn dedup_and_sort(mut items: Vec<String>) -> Vec<String> {
    items.sort();
    items.dedup();
    items
}

/// Split `host/path/...` on the first `/`. The path keeps its leading slash.
pub fn registry_address_and_path(images_repo: &str) -> (String, String) {
    let trimmed = images_repo.trim().trim_end_matches('/');
    match trimmed.split_once('/') {
        Some((host, path)) => (host.to_string(), format!("/{path}")),
        None => (trimmed.to_string(), String::new()),
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: BTreeMap<String, DockerAuth>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DockerAuth {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth: String,
}

/// Docker config JSON for a single registry address
pub fn docker_config_json(address: &str, username: &str, password: &str) -> Result<Vec<u8>> {
    let mut auths = BTreeMap::new();
    let entry = if username.is_empty() && password.is_empty() {
        DockerAuth::default()
    } else {
        DockerAuth {
            username: username.to_string(),
            password: password.to_string(),
            auth: BASE64.encode(format!("{username}:{password}")),
        }
    };
    auths.insert(address.to_string(), entry);
    Ok(serde_json::to_vec(&DockerConfig { auths })?)
}

/// Extract `(username, password)` for `address` from docker config JSON.
///
/// A registry without an entry (or with an empty entry) is anonymous and
/// yields empty credentials. Malformed JSON or a malformed `auth` field is
/// an error.
pub fn creds_from_docker_config(docker_config: &[u8], address: &str) -> Result<(String, String)> {
    if docker_config.is_empty() {
        return Ok((String::new(), String::new()));
    }

    let config: DockerConfig = serde_json::from_slice(docker_config)?;
    let Some(entry) = config.auths.get(address) else {
        return Ok((String::new(), String::new()));
    };

    if !entry.username.is_empty() || !entry.password.is_empty() {
        return Ok((entry.username.clone(), entry.password.clone()));
    }

    if entry.auth.is_empty() {
        return Ok((String::new(), String::new()));
    }

    let decoded = BASE64
        .decode(entry.auth.as_bytes())
        .map_err(|e| Error::ConfigError(format!("cannot decode auth for {address}: {e}")))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|e| Error::ConfigError(format!("auth for {address} is not UTF-8: {e}")))?;

    match decoded.split_once(':') {
        Some((user, pass)) => Ok((user.to_string(), pass.to_string())),
        None => Err(Error::ConfigError(format!(
            "auth for {address} is not in user:password form"
        ))),
    }
}

/// Truncate long versions in human readable messages
pub fn trim_with_ellipsis(s: &str) -> String {
    const LIMIT: usize = 15;
    if s.chars().count() <= LIMIT {
        return s.to_string();
    }
    let mut out: String = s.chars().take(LIMIT).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_ignores_map_order() {
        let a = json!({"b": 1, "a": [1, 2]});
        let mut m = serde_json::Map::new();
        m.insert("a".into(), json!([1, 2]));
        m.insert("b".into(), json!(1));
        assert_eq!(compute_hash(&a).unwrap(), compute_hash(&m).unwrap());
        assert_eq!(compute_hash(&a).unwrap().len(), 64);
    }

    #[test]
    fn random_string_is_alphanumeric() {
        let s = generate_random_string(SECRET_LENGTH);
        assert_eq!(s.len(), SECRET_LENGTH);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(s, generate_random_string(SECRET_LENGTH));
    }

    #[test]
    fn split_images_repo() {
        assert_eq!(
            registry_address_and_path("registry.example.com/deckhouse/ee"),
            ("registry.example.com".to_string(), "/deckhouse/ee".to_string())
        );
        assert_eq!(
            registry_address_and_path("registry.example.com:5000"),
            ("registry.example.com:5000".to_string(), String::new())
        );
    }

    #[test]
    fn docker_config_roundtrip_credentials() {
        let raw = docker_config_json("r.example.com", "user", "pa:ss").unwrap();
        let (u, p) = creds_from_docker_config(&raw, "r.example.com").unwrap();
        assert_eq!(u, "user");
        assert_eq!(p, "pa:ss");
    }

    #[test]
    fn creds_from_auth_field_only() {
        let raw = format!(
            r#"{{"auths":{{"r.example.com":{{"auth":"{}"}}}}}}"#,
            BASE64.encode("alice:secret")
        );
        let (u, p) = creds_from_docker_config(raw.as_bytes(), "r.example.com").unwrap();
        assert_eq!((u.as_str(), p.as_str()), ("alice", "secret"));
    }

    #[test]
    fn anonymous_registry_has_empty_creds() {
        let raw = br#"{"auths":{"r.example.com":{}}}"#;
        let (u, p) = creds_from_docker_config(raw, "r.example.com").unwrap();
        assert!(u.is_empty() && p.is_empty());
    }

    #[test]
    fn malformed_docker_config_fails() {
        assert!(creds_from_docker_config(b"{not json", "r").is_err());
    }

    #[test]
    fn ellipsis_only_for_long_strings() {
        assert_eq!(trim_with_ellipsis("short"), "short");
        assert_eq!(trim_with_ellipsis("0123456789abcdefXYZ"), "0123456789abcde…");
    }
}
