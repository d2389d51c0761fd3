//! Network Status Implementation

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    network::{NetworkChangeStream, NetworkInfo, NetworkStatus, NetworkStatusSource, NetworkType},
};
use std::time::Duration;
use tracing::debug;

const DEFAULT_PROBE_ADDR: &str = "8.8.8.8:53";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Desktop network status source
///
/// Reports reachability by opening a TCP connection to a well-known address.
/// The change stream polls and only yields when the status flips.
#[derive(Debug, Clone)]
pub struct DesktopNetworkSource {
    probe_addr: String,
    poll_interval: Duration,
}

impl DesktopNetworkSource {
    pub fn new() -> Self {
        Self {
            probe_addr: DEFAULT_PROBE_ADDR.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Probe a specific host (e.g. the clinic's API server) instead of public DNS
    pub fn with_probe_addr(mut self, addr: impl Into<String>) -> Self {
        self.probe_addr = addr.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn check_connectivity(&self) -> NetworkStatus {
        match tokio::time::timeout(
            PROBE_TIMEOUT,
            tokio::net::TcpStream::connect(self.probe_addr.as_str()),
        )
        .await
        {
            Ok(Ok(_)) => NetworkStatus::Connected,
            Ok(Err(_)) | Err(_) => NetworkStatus::Disconnected,
        }
    }
}

impl Default for DesktopNetworkSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkStatusSource for DesktopNetworkSource {
    async fn get_network_info(&self) -> Result<NetworkInfo> {
        let status = self.check_connectivity().await;
        debug!(status = ?status, probe = %self.probe_addr, "Network probe finished");

        Ok(NetworkInfo {
            status,
            // Interface type is not visible through a TCP probe
            network_type: (status == NetworkStatus::Connected).then_some(NetworkType::Other),
        })
    }

    async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>> {
        Ok(Box::new(DesktopNetworkChangeStream {
            source: self.clone(),
            last_status: None,
        }))
    }
}

/// Network change stream that polls for changes
struct DesktopNetworkChangeStream {
    source: DesktopNetworkSource,
    last_status: Option<NetworkStatus>,
}

#[async_trait]
impl NetworkChangeStream for DesktopNetworkChangeStream {
    async fn next(&mut self) -> Option<NetworkInfo> {
        loop {
            tokio::time::sleep(self.source.poll_interval).await;

            if let Ok(info) = self.source.get_network_info().await {
                if self.last_status != Some(info.status) {
                    self.last_status = Some(info.status);
                    return Some(info);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_probe_reports_disconnected() {
        // Port 9 on localhost is almost never listening
        let source = DesktopNetworkSource::new().with_probe_addr("127.0.0.1:9");
        let info = source.get_network_info().await.unwrap();

        assert_eq!(info.status, NetworkStatus::Disconnected);
        assert_eq!(info.network_type, None);
        assert!(!source.is_connected().await);
    }

    #[tokio::test]
    async fn test_local_listener_reports_connected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let source = DesktopNetworkSource::new().with_probe_addr(addr.to_string());
        let info = source.get_network_info().await.unwrap();

        assert_eq!(info.status, NetworkStatus::Connected);
    }

    #[tokio::test]
    async fn test_change_stream_yields_first_status() {
        let source = DesktopNetworkSource::new()
            .with_probe_addr("127.0.0.1:9")
            .with_poll_interval(Duration::from_millis(10));

        let mut stream = source.subscribe_changes().await.unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(first.status, NetworkStatus::Disconnected);
    }
}
