//! TUN device lifecycle.
//!
//! Opens the kernel TUN interface (Linux: `/dev/net/tun` + ioctl(TUNSETIFF)
//! with IFF_TUN | IFF_NO_PI), assigns addresses and MTU through `ip`, and
//! hands the non-blocking file descriptor to the I/O engine. An externally
//! supplied descriptor can be adopted instead, in which case the tunnel does
//! not own it and will not close it.

use std::process::Command;

use tracing::{debug, info};

use crate::common::{Error, Result};
use crate::config::TunnelConfig;

pub type RawFd = i32;

pub struct TunDevice {
    name: String,
    fd: RawFd,
    mtu: u16,
    owned: bool,
}

impl TunDevice {
    /// Create and configure the platform TUN interface.
    #[cfg(target_os = "linux")]
    pub fn open(config: &TunnelConfig) -> Result<Self> {
        let fd = open_tun_fd(&config.name)?;
        let device = Self {
            name: config.name.clone(),
            fd,
            mtu: config.mtu,
            owned: true,
        };
        if let Err(e) = device.configure(config) {
            unsafe { libc::close(fd) };
            return Err(e);
        }
        info!(device = %device.name, mtu = device.mtu, "tun device created");
        Ok(device)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn open(_config: &TunnelConfig) -> Result<Self> {
        Err(Error::Unsupported(
            "tun device creation is only implemented on linux; pass an external fd".into(),
        ))
    }

    /// Adopt a descriptor the embedder already opened (e.g. handed over by a
    /// VPN service). The fd is switched to non-blocking and left open at
    /// teardown.
    pub fn adopt(fd: RawFd, mtu: u16) -> Result<Self> {
        set_nonblocking(fd)?;
        debug!(fd, mtu, "adopted external tun fd");
        Ok(Self {
            name: format!("extern-fd-{}", fd),
            fd,
            mtu,
            owned: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn owns_fd(&self) -> bool {
        self.owned
    }

    #[cfg(target_os = "linux")]
    fn configure(&self, config: &TunnelConfig) -> Result<()> {
        if let Some(ipv4) = &config.ipv4 {
            run_ip_command(&["addr", "replace", ipv4, "dev", &self.name])?;
        }
        if let Some(ipv6) = &config.ipv6 {
            run_ip_command(&["-6", "addr", "replace", ipv6, "dev", &self.name])?;
        }
        let mtu_text = self.mtu.to_string();
        run_ip_command(&["link", "set", "dev", &self.name, "mtu", &mtu_text])?;
        run_ip_command(&["link", "set", "dev", &self.name, "up"])?;
        Ok(())
    }

    /// Close the descriptor if this tunnel opened it.
    pub fn close(&mut self) {
        if self.owned && self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            debug!(device = %self.name, "tun device closed");
            self.fd = -1;
        }
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        self.close();
    }
}

/// Run a user-supplied hook command (`tunnel.post-up` / `tunnel.pre-down`)
/// through the shell. Failure is reported but non-fatal for pre-down.
pub fn run_script(label: &str, script: &str) -> Result<()> {
    debug!(label, script, "running tunnel script");
    let status = Command::new("sh").arg("-c").arg(script).status()?;
    if !status.success() {
        return Err(Error::Config(format!(
            "{} script failed (status={}): {}",
            label, status, script
        )));
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
const IFNAMSIZ: usize = 16;

#[cfg(target_os = "linux")]
#[repr(C)]
struct IfReq {
    ifr_name: [u8; IFNAMSIZ],
    ifr_flags: i16,
    ifr_pad: [u8; 22],
}

#[cfg(target_os = "linux")]
fn open_tun_fd(name: &str) -> Result<RawFd> {
    const TUNSETIFF: libc::c_ulong = 0x400454CA;
    const IFF_TUN: i16 = 0x0001;
    const IFF_NO_PI: i16 = 0x1000;

    if name.len() >= IFNAMSIZ {
        return Err(Error::Config(format!(
            "tun interface name too long: {}",
            name
        )));
    }

    let fd = unsafe {
        libc::open(
            b"/dev/net/tun\0".as_ptr().cast(),
            libc::O_RDWR | libc::O_NONBLOCK,
        )
    };
    if fd < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    let mut ifr = IfReq {
        ifr_name: [0u8; IFNAMSIZ],
        ifr_flags: IFF_TUN | IFF_NO_PI,
        ifr_pad: [0u8; 22],
    };
    ifr.ifr_name[..name.len()].copy_from_slice(name.as_bytes());

    let ret = unsafe { libc::ioctl(fd, TUNSETIFF, &mut ifr) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(Error::Io(err));
    }

    Ok(fd)
}

#[cfg(target_os = "linux")]
fn run_ip_command(args: &[&str]) -> Result<()> {
    let status = Command::new("ip").args(args).status()?;
    if !status.success() {
        return Err(Error::Config(format!(
            "ip command failed (status={}): ip {}",
            status,
            args.join(" ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adopt_marks_fd_unowned() {
        // A pipe read end stands in for an external tun fd.
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0);

        let device = TunDevice::adopt(fds[0], 1500).unwrap();
        assert!(!device.owns_fd());
        assert_eq!(device.mtu(), 1500);
        assert_eq!(device.fd(), fds[0]);
        drop(device);

        // The fd stays open after drop because the tunnel does not own it.
        let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL) };
        assert!(flags >= 0);
        assert_ne!(flags & libc::O_NONBLOCK, 0);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn run_script_reports_failure() {
        assert!(run_script("post-up", "true").is_ok());
        assert!(run_script("post-up", "exit 3").is_err());
    }
}
