//! Broker API client and the announce/withdraw helper run by leaf services.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ClientError;
use crate::types::{
    DeregisterRequest, DeregistrationResponse, ErrorResponse, RegisterRequest,
    RegistrationResponse, ServiceEntry,
};

/// Client for the broker's HTTP surface.
#[derive(Clone)]
pub struct BrokerClient {
    client: reqwest::Client,
    base_url: String,
}

impl BrokerClient {
    pub fn new(broker_url: &str) -> Self {
        Self::with_timeout(broker_url, Duration::from_secs(10))
    }

    pub fn with_timeout(broker_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: broker_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn register(
        &self,
        request: &RegisterRequest,
    ) -> Result<RegistrationResponse, ClientError> {
        let response = self
            .client
            .post(format!("{}/register", self.base_url))
            .json(request)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn deregister(
        &self,
        request: &DeregisterRequest,
    ) -> Result<DeregistrationResponse, ClientError> {
        let response = self
            .client
            .post(format!("{}/deregister", self.base_url))
            .json(request)
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Active service list of a gateway.
    pub async fn schemas(&self, gateway: &str) -> Result<Vec<ServiceEntry>, ClientError> {
        let response = self
            .client
            .get(format!("{}/schemas/{}", self.base_url, gateway))
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Pending successor of an active hash, if a rollout is staged.
    pub async fn triage(
        &self,
        gateway: &str,
        parent_hash: &str,
    ) -> Result<Option<ServiceEntry>, ClientError> {
        let response = self
            .client
            .get(format!(
                "{}/schemas/{}/triage/{}",
                self.base_url, gateway, parent_hash
            ))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::decode(response).await.map(Some)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        if response.status().is_success() {
            return Ok(response.json().await?);
        }

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(err) => err.error,
            Err(_) => body,
        };
        Err(ClientError::Broker { status, message })
    }
}

/// Identity a leaf service announces to the broker.
#[derive(Debug, Clone)]
pub struct AnnouncerConfig {
    pub name: String,
    pub url: String,
    pub gateway: String,
    pub broker_url: String,
    pub hash: String,
}

impl AnnouncerConfig {
    /// Read `SERVICE_NAME`, `SERVICE_URL`, `SERVICE_GATEWAY`, `SERVICE_GATEWAY_URL`
    /// and `SERVICE_HASH`. Without a hash the revision checked out in the
    /// working directory is used.
    pub fn from_env() -> Result<Self, ClientError> {
        let hash = match std::env::var("SERVICE_HASH") {
            Ok(hash) if !hash.is_empty() => hash,
            _ => git_revision(&std::env::current_dir()?)?,
        };

        Ok(Self {
            name: required_var("SERVICE_NAME")?,
            url: required_var("SERVICE_URL")?,
            gateway: required_var("SERVICE_GATEWAY")?,
            broker_url: required_var("SERVICE_GATEWAY_URL")?,
            hash,
        })
    }
}

fn required_var(name: &str) -> Result<String, ClientError> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ClientError::Config(format!("{} must be set", name))),
    }
}

/// Commit checked out in the repository containing `start`.
///
/// Walks up to the nearest `.git` directory and resolves `HEAD`, following a
/// symbolic ref through loose refs and then `packed-refs`.
pub fn git_revision(start: &Path) -> Result<String, ClientError> {
    let git_dir = find_git_dir(start).ok_or_else(|| {
        ClientError::Config(format!(
            "SERVICE_HASH is not set and no git repository contains {}",
            start.display()
        ))
    })?;

    let head = std::fs::read_to_string(git_dir.join("HEAD"))?;
    let head = head.trim();
    let Some(reference) = head.strip_prefix("ref:").map(str::trim) else {
        return Ok(head.to_string());
    };

    if let Ok(revision) = std::fs::read_to_string(git_dir.join(reference)) {
        return Ok(revision.trim().to_string());
    }

    let packed = std::fs::read_to_string(git_dir.join("packed-refs")).unwrap_or_default();
    packed
        .lines()
        .filter(|line| !line.starts_with('#') && !line.starts_with('^'))
        .find_map(|line| {
            let (revision, name) = line.split_once(' ')?;
            (name == reference).then(|| revision.to_string())
        })
        .ok_or_else(|| ClientError::Config(format!("Cannot resolve git ref {}", reference)))
}

fn find_git_dir(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(".git"))
        .find(|candidate| candidate.join("HEAD").is_file())
}

/// Registers a leaf service at startup and deregisters it at shutdown.
pub struct Announcer {
    client: BrokerClient,
    config: AnnouncerConfig,
}

impl Announcer {
    pub fn new(config: AnnouncerConfig) -> Self {
        Self {
            client: BrokerClient::new(&config.broker_url),
            config,
        }
    }

    pub fn config(&self) -> &AnnouncerConfig {
        &self.config
    }

    pub async fn announce(&self) -> Result<RegistrationResponse, ClientError> {
        let request = RegisterRequest {
            name: self.config.name.clone(),
            url: self.config.url.clone(),
            hash: self.config.hash.clone(),
            gateway: self.config.gateway.clone(),
        };
        let response = self.client.register(&request).await?;
        tracing::info!(
            "Announced {} ({}) to gateway {}: {:?}",
            self.config.name,
            self.config.hash,
            self.config.gateway,
            response.outcome
        );
        Ok(response)
    }

    pub async fn withdraw(&self) -> Result<DeregistrationResponse, ClientError> {
        let request = DeregisterRequest {
            name: self.config.name.clone(),
            hash: self.config.hash.clone(),
            gateway: self.config.gateway.clone(),
            url: Some(self.config.url.clone()),
        };
        let response = self.client.deregister(&request).await?;
        tracing::info!(
            "Withdrew {} ({}) from gateway {}: {:?}",
            self.config.name,
            self.config.hash,
            self.config.gateway,
            response.outcome
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScratchRepo(PathBuf);

    impl ScratchRepo {
        fn new() -> Self {
            let root = std::env::temp_dir().join(format!("rungate-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(root.join(".git/refs/heads")).unwrap();
            std::fs::create_dir_all(root.join("src/nested")).unwrap();
            Self(root)
        }

        fn write(&self, path: &str, contents: &str) {
            std::fs::write(self.0.join(path), contents).unwrap();
        }
    }

    impl Drop for ScratchRepo {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let client = BrokerClient::new("http://broker:3001/");
        assert_eq!(client.base_url(), "http://broker:3001");
    }

    #[test]
    fn test_git_revision_detached_head() {
        let repo = ScratchRepo::new();
        repo.write(".git/HEAD", "0123abcd\n");
        assert_eq!(git_revision(&repo.0).unwrap(), "0123abcd");
    }

    #[test]
    fn test_git_revision_loose_ref_from_subdirectory() {
        let repo = ScratchRepo::new();
        repo.write(".git/HEAD", "ref: refs/heads/main\n");
        repo.write(".git/refs/heads/main", "feedbeef\n");
        assert_eq!(git_revision(&repo.0.join("src/nested")).unwrap(), "feedbeef");
    }

    #[test]
    fn test_git_revision_packed_ref() {
        let repo = ScratchRepo::new();
        repo.write(".git/HEAD", "ref: refs/heads/release\n");
        repo.write(
            ".git/packed-refs",
            "# pack-refs with: peeled fully-peeled sorted\ncafe0001 refs/heads/main\ncafe0002 refs/heads/release\n",
        );
        assert_eq!(git_revision(&repo.0).unwrap(), "cafe0002");
    }

    #[test]
    fn test_git_revision_unresolvable_ref() {
        let repo = ScratchRepo::new();
        repo.write(".git/HEAD", "ref: refs/heads/gone\n");
        assert!(matches!(git_revision(&repo.0), Err(ClientError::Config(_))));
    }
}
