pub mod types;

use std::path::Path;

use anyhow::{Context, Result};

pub use types::{
    Config, LogConfig, MapDnsConfig, MiscConfig, Socks5Config, TunnelConfig, UdpMode,
};

pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file '{}'", path.display()))?;
    let config: Config = serde_yml::from_str(&content)
        .with_context(|| format!("failed to parse config file '{}'", path.display()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "socks5:\n  address: \"127.0.0.1\"\n  port: 1080\n"
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.socks5.address, "127.0.0.1");
        assert_eq!(config.socks5.port, 1080);
    }

    #[test]
    fn load_config_missing_file() {
        assert!(load_config("/nonexistent/tunbridge.yaml").is_err());
    }

    #[test]
    fn load_config_invalid_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "socks5: [not a map").unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn load_config_fails_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "socks5:\n  address: \"\"\n  port: 1080\n").unwrap();
        assert!(load_config(file.path()).is_err());
    }
}
