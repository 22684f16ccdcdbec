//! Config to runtime settings.

use roomlink_config::{Config, DeviceIdentity};
use roomlink_net::{SocketConfig, TransportConfig};
use roomlink_session::{SessionConfig, SyncSettings};

pub fn transport_config(config: &Config) -> TransportConfig {
    let network = &config.network;
    TransportConfig {
        host: network.server_address.clone(),
        port: network.server_port,
        connect_timeout: network.connect_timeout(),
        hello_interval: network.udp_hello_interval(),
        inbox_capacity: network.inbox_capacity,
        socket: SocketConfig::default(),
    }
}

pub fn session_config(config: &Config, identity: &DeviceIdentity) -> SessionConfig {
    let network = &config.network;
    SessionConfig {
        app_name: network.app_name.clone(),
        app_version: network.app_version.clone(),
        device_id: identity.login_hash(&network.app_name),
        auto_login: network.auto_login,
        only_same_version: network.only_connect_to_same_version,
        reconnect_interval: network.reconnect_interval(),
        keepalive_interval: network.keepalive_interval(),
    }
}

pub fn sync_settings(config: &Config) -> SyncSettings {
    SyncSettings {
        rate_hz: config.sync.default_rate_hz,
        hybrid_on_change: config.sync.hybrid_on_change,
        idle_resend: config.sync.idle_resend(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_settings_follow_config() {
        let mut config = Config::default();
        config.network.server_address = "10.1.2.3".to_string();
        config.network.server_port = 6100;
        config.network.only_connect_to_same_version = true;
        config.network.keepalive_interval_ms = 750;
        config.sync.default_rate_hz = 10.0;

        let transport = transport_config(&config);
        assert_eq!(transport.host, "10.1.2.3");
        assert_eq!(transport.port, 6100);
        assert_eq!(transport.hello_interval, Duration::from_millis(100));

        let identity = DeviceIdentity::generate();
        let session = session_config(&config, &identity);
        assert_eq!(session.device_id, identity.login_hash("roomlink"));
        assert!(session.app_id().starts_with("roomlink_"));
        assert_eq!(session.keepalive_interval, Some(Duration::from_millis(750)));

        assert_eq!(sync_settings(&config).rate_hz, 10.0);
    }
}
