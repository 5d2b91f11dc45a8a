//! Collaborators the service calls out to: the host application and the
//! media library.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::torrent::InfoHash;

/// Severity of a host notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// The host application embedding the daemon.
#[async_trait]
pub trait HostBridge: Send + Sync {
    async fn push_notification(&self, level: NotificationLevel, message: &str);

    /// A host-side setting value, `None` when unset or unavailable.
    async fn fetch_setting(&self, name: &str) -> Option<String>;

    /// Maps a host path (for example a special:// URL) to a local path.
    async fn translate_path(&self, path: &str) -> PathBuf;

    /// Asks the user to pick one of `options`; `None` when dismissed.
    async fn prompt_user(&self, title: &str, options: &[String]) -> Option<usize>;
}

/// Headless host: no notifications, no settings, identity paths and
/// dismissed prompts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

#[async_trait]
impl HostBridge for NullHost {
    async fn push_notification(&self, level: NotificationLevel, message: &str) {
        tracing::debug!(?level, "Host notification: {message}");
    }

    async fn fetch_setting(&self, _name: &str) -> Option<String> {
        None
    }

    async fn translate_path(&self, path: &str) -> PathBuf {
        PathBuf::from(path)
    }

    async fn prompt_user(&self, _title: &str, _options: &[String]) -> Option<usize> {
        None
    }
}

/// Host reached over HTTP at its callback address.
///
/// Every call degrades to the [`NullHost`] answer when the host is
/// unreachable or replies with an error.
#[derive(Debug, Clone)]
pub struct RemoteHost {
    base: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct Notification<'a> {
    level: NotificationLevel,
    message: &'a str,
}

#[derive(Serialize)]
struct Prompt<'a> {
    title: &'a str,
    options: &'a [String],
}

#[derive(Deserialize)]
struct PromptAnswer {
    choice: Option<usize>,
}

impl RemoteHost {
    const TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(address: SocketAddr) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Self::TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base: format!("http://{address}"),
            client,
        }
    }

    async fn get_text(&self, path: &str, query: &[(&str, &str)]) -> Option<String> {
        let response = self
            .client
            .get(format!("{}{path}", self.base))
            .query(query)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        match response {
            Ok(response) => response.text().await.ok(),
            Err(e) => {
                tracing::debug!(path, "Host call failed: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl HostBridge for RemoteHost {
    async fn push_notification(&self, level: NotificationLevel, message: &str) {
        let result = self
            .client
            .post(format!("{}/notify", self.base))
            .json(&Notification { level, message })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        if let Err(e) = result {
            tracing::debug!(?level, "Host notification not delivered: {e}");
        }
    }

    async fn fetch_setting(&self, name: &str) -> Option<String> {
        self.get_text("/setting", &[("name", name)])
            .await
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    async fn translate_path(&self, path: &str) -> PathBuf {
        match self.get_text("/translate", &[("path", path)]).await {
            Some(translated) if !translated.trim().is_empty() => PathBuf::from(translated.trim()),
            _ => PathBuf::from(path),
        }
    }

    async fn prompt_user(&self, title: &str, options: &[String]) -> Option<usize> {
        let response = self
            .client
            .post(format!("{}/prompt", self.base))
            .json(&Prompt { title, options })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .ok()?;
        let answer: PromptAnswer = response.json().await.ok()?;
        answer.choice.filter(|choice| *choice < options.len())
    }
}

/// Answers whether the media library still references a torrent.
#[async_trait]
pub trait LibraryIndex: Send + Sync {
    async fn references(&self, info_hash: InfoHash) -> bool;
}

/// No library: nothing is referenced.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLibrary;

#[async_trait]
impl LibraryIndex for NoLibrary {
    async fn references(&self, _info_hash: InfoHash) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;

    fn unreachable() -> RemoteHost {
        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        RemoteHost::new(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)))
    }

    #[tokio::test]
    async fn test_unreachable_host_degrades_to_defaults() {
        let host = unreachable();
        host.push_notification(NotificationLevel::Warning, "stalled").await;
        assert_eq!(host.fetch_setting("buffer_size").await, None);
        assert_eq!(
            host.translate_path("/media/movies").await,
            PathBuf::from("/media/movies")
        );
        assert_eq!(host.prompt_user("Pick", &["a".to_string()]).await, None);
    }

    #[tokio::test]
    async fn test_null_host_answers() {
        assert_eq!(NullHost.fetch_setting("anything").await, None);
        assert_eq!(NullHost.prompt_user("Pick", &[]).await, None);
        assert!(!NoLibrary.references(InfoHash::new([1; 20])).await);
    }
}
