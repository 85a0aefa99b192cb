use std::net::Ipv4Addr;

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    pub socks5: Socks5Config,
    #[serde(default)]
    pub mapdns: Option<MapDnsConfig>,
    #[serde(default)]
    pub misc: MiscConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.socks5.address.is_empty() {
            anyhow::bail!("socks5.address is required");
        }
        if self.socks5.port == 0 {
            anyhow::bail!("socks5.port is required");
        }
        if self.tunnel.mtu < 576 {
            anyhow::bail!("tunnel.mtu {} is below the IPv4 minimum", self.tunnel.mtu);
        }
        if let Some(ipv4) = &self.tunnel.ipv4 {
            ipv4.parse::<ipnet::Ipv4Net>()
                .map_err(|e| anyhow::anyhow!("tunnel.ipv4 '{}' is invalid: {}", ipv4, e))?;
        }
        if let Some(ipv6) = &self.tunnel.ipv6 {
            ipv6.parse::<ipnet::Ipv6Net>()
                .map_err(|e| anyhow::anyhow!("tunnel.ipv6 '{}' is invalid: {}", ipv6, e))?;
        }
        if let Some(mapdns) = &self.mapdns {
            mapdns.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_tun_name")]
    pub name: String,
    /// 隧道 IPv4 地址（CIDR，如 "198.18.0.1/32"）
    pub ipv4: Option<String>,
    /// 隧道 IPv6 地址（CIDR，如 "fc00::1/128"）
    pub ipv6: Option<String>,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// 设备就绪后执行的 shell 命令（通常写路由）
    #[serde(rename = "post-up")]
    pub post_up: Option<String>,
    /// 关闭设备前执行的 shell 命令
    #[serde(rename = "pre-down")]
    pub pre_down: Option<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            name: default_tun_name(),
            ipv4: None,
            ipv6: None,
            mtu: default_mtu(),
            post_up: None,
            pre_down: None,
        }
    }
}

fn default_tun_name() -> String {
    "tunbridge0".to_string()
}

fn default_mtu() -> u16 {
    8500
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UdpMode {
    /// SOCKS5 UDP ASSOCIATE：数据报走 UDP 中继
    #[default]
    Udp,
    /// UDP-in-TCP：数据报带长度前缀走单条 TCP 连接
    Tcp,
}

#[derive(Debug, Default, Deserialize)]
pub struct Socks5Config {
    pub address: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub udp: UdpMode,
}

#[derive(Debug, Deserialize)]
pub struct MapDnsConfig {
    /// 虚拟网段网络地址（如 198.19.0.0）
    pub network: Ipv4Addr,
    /// 虚拟网段掩码（如 255.255.0.0）
    pub netmask: Ipv4Addr,
    #[serde(default = "default_dns_cache_size", rename = "cache-size")]
    pub cache_size: usize,
    /// 拦截地址：发往该地址/端口的 UDP DNS 查询由映射表直接应答
    pub address: Ipv4Addr,
    #[serde(default = "default_dns_port")]
    pub port: u16,
}

impl MapDnsConfig {
    fn validate(&self) -> Result<()> {
        let prefix = ipv4_prefix_len(self.netmask)
            .ok_or_else(|| anyhow::anyhow!("mapdns.netmask {} is not contiguous", self.netmask))?;
        let net = ipnet::Ipv4Net::new(self.network, prefix)
            .map_err(|e| anyhow::anyhow!("mapdns network is invalid: {}", e))?;
        if net.network() != self.network {
            anyhow::bail!(
                "mapdns.network {} is not the base of {}/{}",
                self.network,
                net.network(),
                prefix
            );
        }
        if self.cache_size == 0 {
            anyhow::bail!("mapdns.cache-size must be at least 1");
        }
        Ok(())
    }

    pub fn subnet(&self) -> ipnet::Ipv4Net {
        // validate() has established the mask is contiguous
        let prefix = ipv4_prefix_len(self.netmask).unwrap_or(32);
        ipnet::Ipv4Net::new(self.network, prefix).unwrap_or_else(|_| {
            ipnet::Ipv4Net::new(self.network, 32).expect("/32 is always valid")
        })
    }
}

pub fn ipv4_prefix_len(netmask: Ipv4Addr) -> Option<u8> {
    let bits = u32::from(netmask);
    let prefix = bits.leading_ones();
    let contiguous = match bits.checked_shl(prefix) {
        Some(rest) => rest == 0,
        None => true, // prefix == 32
    };
    if contiguous {
        Some(prefix as u8)
    } else {
        None
    }
}

fn default_dns_cache_size() -> usize {
    256
}

fn default_dns_port() -> u16 {
    53
}

#[derive(Debug, Deserialize)]
pub struct MiscConfig {
    /// 会话上限，0 表示不限制；超限时终止最旧会话
    #[serde(default, rename = "max-session-count")]
    pub max_session_count: usize,
    #[serde(default = "default_connect_timeout", rename = "connect-timeout-ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_rw_timeout", rename = "read-write-timeout-ms")]
    pub read_write_timeout_ms: u64,
    #[serde(default = "default_udp_idle_timeout", rename = "udp-idle-timeout-ms")]
    pub udp_idle_timeout_ms: u64,
    /// RLIMIT_NOFILE，0 表示保持系统默认
    #[serde(default, rename = "limit-nofile")]
    pub limit_nofile: u64,
    /// 线程池工作线程栈大小，0 表示系统默认
    #[serde(default, rename = "worker-stack-size")]
    pub worker_stack_size: usize,
}

impl Default for MiscConfig {
    fn default() -> Self {
        Self {
            max_session_count: 0,
            connect_timeout_ms: default_connect_timeout(),
            read_write_timeout_ms: default_rw_timeout(),
            udp_idle_timeout_ms: default_udp_idle_timeout(),
            limit_nofile: 0,
            worker_stack_size: 0,
        }
    }
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_rw_timeout() -> u64 {
    60_000
}

fn default_udp_idle_timeout() -> u64 {
    30_000
}
