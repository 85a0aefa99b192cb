pub mod socks5;

use std::time::Duration;

use crate::config::{MiscConfig, Socks5Config, UdpMode};

/// Runtime view of the upstream proxy settings shared by every session.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub server: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub udp_mode: UdpMode,
    pub connect_timeout: Duration,
    pub rw_timeout: Duration,
    pub udp_idle_timeout: Duration,
    /// Upstream read timeout inside session loops; doubles as the loop's
    /// wait primitive so sessions never sleep while holding the stack lock.
    pub poll_interval: Duration,
}

impl RelaySettings {
    pub fn from_config(socks5: &Socks5Config, misc: &MiscConfig) -> Self {
        Self {
            server: socks5.address.clone(),
            port: socks5.port,
            username: socks5.username.clone(),
            password: socks5.password.clone(),
            udp_mode: socks5.udp,
            connect_timeout: Duration::from_millis(misc.connect_timeout_ms),
            rw_timeout: Duration::from_millis(misc.read_write_timeout_ms),
            udp_idle_timeout: Duration::from_millis(misc.udp_idle_timeout_ms),
            poll_interval: Duration::from_millis(10),
        }
    }
}
