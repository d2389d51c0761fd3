//! Network Status Abstraction
//!
//! Provides the raw connectivity signal that the core's connectivity monitor
//! consumes.

use async_trait::async_trait;

use crate::error::Result;

/// Network connection type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    /// Cellular/mobile data connection
    Cellular,
    /// WiFi connection
    WiFi,
    /// Ethernet connection
    Ethernet,
    /// Other or unknown connection type
    Other,
}

/// Network connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    /// Connected to network
    Connected,
    /// Not connected to any network
    Disconnected,
    /// Connection status unknown or indeterminate
    Indeterminate,
}

/// Network information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub status: NetworkStatus,
    pub network_type: Option<NetworkType>,
}

impl NetworkInfo {
    pub fn connected(network_type: NetworkType) -> Self {
        Self {
            status: NetworkStatus::Connected,
            network_type: Some(network_type),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            status: NetworkStatus::Disconnected,
            network_type: None,
        }
    }

    /// `Some(true|false)` for a definite status, `None` when indeterminate
    pub fn reachable(&self) -> Option<bool> {
        match self.status {
            NetworkStatus::Connected => Some(true),
            NetworkStatus::Disconnected => Some(false),
            NetworkStatus::Indeterminate => None,
        }
    }
}

/// Network status source trait
///
/// Supplies connectivity information so the core can:
/// - Skip queue processing while offline
/// - Flush the offline queue when connectivity returns
///
/// # Platform Support
///
/// - **Desktop**: TCP reachability probe
/// - **iOS**: Network framework, Reachability
/// - **Android**: ConnectivityManager
/// - **React Native hosts**: NetInfo
///
/// # Example
///
/// ```ignore
/// use bridge_traits::network::NetworkStatusSource;
///
/// async fn can_upload(source: &dyn NetworkStatusSource) -> bool {
///     source.is_connected().await
/// }
/// ```
#[async_trait]
pub trait NetworkStatusSource: Send + Sync {
    /// Get current network information
    async fn get_network_info(&self) -> Result<NetworkInfo>;

    /// Check if currently connected to any network
    async fn is_connected(&self) -> bool {
        matches!(
            self.get_network_info().await,
            Ok(NetworkInfo {
                status: NetworkStatus::Connected,
                ..
            })
        )
    }

    /// Subscribe to network status changes
    ///
    /// Returns a stream of network info updates. Implementations should
    /// emit an event whenever network status changes.
    async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>>;
}

/// Stream of network status changes
#[async_trait]
pub trait NetworkChangeStream: Send {
    /// Get the next network info update
    ///
    /// Returns `None` when the stream is closed.
    async fn next(&mut self) -> Option<NetworkInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_info() {
        let info = NetworkInfo::connected(NetworkType::WiFi);

        assert_eq!(info.status, NetworkStatus::Connected);
        assert_eq!(info.network_type, Some(NetworkType::WiFi));
        assert_eq!(info.reachable(), Some(true));
    }

    #[test]
    fn test_indeterminate_is_not_reachable_signal() {
        let info = NetworkInfo {
            status: NetworkStatus::Indeterminate,
            network_type: None,
        };
        assert_eq!(info.reachable(), None);
        assert_eq!(NetworkInfo::disconnected().reachable(), Some(false));
    }
}
