//! HTTPS client for the per-node static pod agents

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Certificate, Client};
use tracing::debug;

use crate::constants::NODE_AGENT_PORT;
use crate::error::{Error, Result};
use crate::orchestrator::node_services::NodeServicesConfig;
use crate::orchestrator::StaticPodClient;

pub const CREATE_PATH: &str = "/staticpod/create";
pub const DELETE_PATH: &str = "/staticpod/delete";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct NodeAgentConfig {
    /// `https` in clusters, `http` only for tests
    pub scheme: String,
    pub port: u16,
    /// PEM bundle verifying the agents' serving certificates
    pub ca_file: Option<PathBuf>,
    /// File holding the bearer token sent to the agents
    pub token_file: Option<PathBuf>,
    pub insecure: bool,
}

impl Default for NodeAgentConfig {
    fn default() -> Self {
        Self {
            scheme: "https".to_string(),
            port: NODE_AGENT_PORT,
            ca_file: None,
            token_file: None,
            insecure: false,
        }
    }
}

pub struct NodeAgentClient {
    http: Client,
    scheme: String,
    port: u16,
    token: Option<String>,
}

impl NodeAgentClient {
    pub fn new(config: &NodeAgentConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .use_rustls_tls()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(config.insecure);

        if let Some(path) = &config.ca_file {
            let pem = std::fs::read(path).map_err(|e| {
                Error::ConfigError(format!("cannot read node agent CA {}: {e}", path.display()))
            })?;
            for cert in Certificate::from_pem_bundle(&pem)? {
                builder = builder.add_root_certificate(cert);
            }
        }

        let token = match &config.token_file {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .map_err(|e| {
                        Error::ConfigError(format!("cannot read node agent token {}: {e}", path.display()))
                    })?
                    .trim()
                    .to_string(),
            ),
            None => None,
        };

        Ok(Self {
            http: builder.build()?,
            scheme: config.scheme.clone(),
            port: config.port,
            token,
        })
    }

    fn url(&self, pod_ip: &str, path: &str) -> String {
        format!("{}://{}:{}{}", self.scheme, pod_ip, self.port, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<()> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        request.send().await?.error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl StaticPodClient for NodeAgentClient {
    async fn create(&self, pod_ip: &str, config: &NodeServicesConfig) -> Result<()> {
        let url = self.url(pod_ip, CREATE_PATH);
        debug!(url = %url, version = %config.version, "Creating static pods");
        self.send(self.http.post(url).json(config)).await
    }

    async fn delete(&self, pod_ip: &str) -> Result<()> {
        let url = self.url(pod_ip, DELETE_PATH);
        debug!(url = %url, "Deleting static pods");
        self.send(self.http.delete(url)).await
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::orchestrator::node_services::Config;
    use crate::orchestrator::users::User;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, token_file: Option<PathBuf>) -> (NodeAgentClient, String) {
        let address = server.address();
        let client = NodeAgentClient::new(&NodeAgentConfig {
            scheme: "http".to_string(),
            port: address.port(),
            token_file,
            ..Default::default()
        })
        .unwrap();
        (client, address.ip().to_string())
    }

    fn node_config() -> NodeServicesConfig {
        NodeServicesConfig {
            version: "abc123".to_string(),
            config: Config {
                ca_cert: "ca".to_string(),
                token_cert: "token".to_string(),
                token_key: "token-key".to_string(),
                auth_cert: "auth".to_string(),
                auth_key: "auth-key".to_string(),
                distribution_cert: "dist".to_string(),
                distribution_key: "dist-key".to_string(),
                http_secret: "http".to_string(),
                user_ro: User {
                    name: "ro".to_string(),
                    password: "secret".to_string(),
                    hashed_password: "$2a$10$hash".to_string(),
                },
                local_mode: None,
                proxy_mode: None,
            },
        }
    }

    #[tokio::test]
    async fn create_posts_config_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CREATE_PATH))
            .and(header("authorization", "Bearer agent-token"))
            .and(body_partial_json(serde_json::json!({ "version": "abc123" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut token = tempfile::NamedTempFile::new().unwrap();
        writeln!(token, "agent-token").unwrap();
        let (client, ip) = client_for(&server, Some(token.path().to_path_buf()));

        client.create(&ip, &node_config()).await.unwrap();
    }

    #[tokio::test]
    async fn delete_accepts_success() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path(DELETE_PATH))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let (client, ip) = client_for(&server, None);
        client.delete(&ip).await.unwrap();
    }

    #[tokio::test]
    async fn server_error_is_retriable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CREATE_PATH))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (client, ip) = client_for(&server, None);
        let err = client.create(&ip, &node_config()).await.unwrap_err();
        assert!(matches!(err, Error::HttpError(_)));
        assert!(err.is_retriable());
    }

    #[test]
    fn missing_ca_file_is_a_config_error() {
        let result = NodeAgentClient::new(&NodeAgentConfig {
            ca_file: Some(PathBuf::from("/nonexistent/ca.crt")),
            ..Default::default()
        });
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }
}
