//! Tunnel controller.
//!
//! Owns every runtime component and exposes the embedding API:
//! `init` builds the TUN device, stack, pool and dispatcher without starting
//! any thread; `run` starts the timer and I/O threads and blocks until
//! `stop`; `fini` tears the rest down in reverse order of init.

pub mod dispatcher;

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::common::{StatsSnapshot, TunnelStats};
use crate::config::Config;
use crate::dns::MappedDns;
use crate::pool::ThreadPool;
use crate::proxy::RelaySettings;
use crate::session::SessionRegistry;
use crate::stack::{SharedStack, StackState};
use crate::tun::device::{run_script, RawFd, TunDevice};
use crate::tun::TunIoEngine;

pub use dispatcher::Dispatcher;

/// Stack timer cadence: drives TCP retransmission, delayed ACKs and
/// reassembly inside the embedded stack.
const TIMER_INTERVAL: Duration = Duration::from_millis(250);

pub struct Tunnel {
    config: Config,
    stats: Arc<TunnelStats>,
    registry: Arc<SessionRegistry>,
    device: Mutex<Option<TunDevice>>,
    engine: Arc<TunIoEngine>,
    stack: SharedStack,
    pool: Arc<ThreadPool>,
    running: Arc<AtomicBool>,
    stopped: Mutex<bool>,
    stop_cond: Condvar,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Tunnel {
    /// Build the tunnel. `extern_tun_fd` adopts a descriptor the embedder
    /// opened (set non-blocking, never closed by us); otherwise the TUN
    /// device is created from the configuration. No threads are started.
    pub fn init(config: Config, extern_tun_fd: Option<RawFd>) -> Result<Self> {
        config.validate()?;

        if config.misc.limit_nofile > 0 {
            raise_nofile_limit(config.misc.limit_nofile);
        }

        let device = match extern_tun_fd {
            Some(fd) if fd >= 0 => TunDevice::adopt(fd, config.tunnel.mtu)?,
            _ => TunDevice::open(&config.tunnel)?,
        };
        if let Some(script) = &config.tunnel.post_up {
            run_script("post-up", script).context("post-up script failed")?;
        }

        let stats = Arc::new(TunnelStats::new());
        let engine = Arc::new(TunIoEngine::new(device.fd(), device.mtu(), Arc::clone(&stats)));

        // The stack terminates flows for arbitrary destinations (any_ip);
        // its own interface address is plain loopback so it never collides
        // with the host-side TUN address.
        let stack = StackState::new(
            Ipv4Addr::LOCALHOST,
            Some(Ipv6Addr::LOCALHOST),
            device.mtu(),
            engine.sender(),
        )
        .shared();

        let mapdns = config.mapdns.as_ref().map(|c| Arc::new(MappedDns::new(c)));
        let registry = Arc::new(SessionRegistry::new(config.misc.max_session_count));
        let pool = Arc::new(ThreadPool::new(0, config.misc.worker_stack_size));
        let settings = Arc::new(RelaySettings::from_config(&config.socks5, &config.misc));

        let dispatcher = Dispatcher::new(
            Arc::clone(&stack),
            Arc::clone(&registry),
            Arc::clone(&pool),
            engine.sender(),
            mapdns,
            settings,
        );
        {
            let dispatcher = Arc::clone(&dispatcher);
            engine.set_ingest(Arc::new(move |packet| dispatcher.ingest(packet)));
        }

        info!(device = device.name(), mtu = device.mtu(), "tunnel initialized");

        Ok(Self {
            config,
            stats,
            registry,
            device: Mutex::new(Some(device)),
            engine,
            stack,
            pool,
            running: Arc::new(AtomicBool::new(false)),
            stopped: Mutex::new(false),
            stop_cond: Condvar::new(),
            timer: Mutex::new(None),
        })
    }

    /// Start the timer and I/O threads, then block until `stop`. On return
    /// all I/O, worker and timer threads have been joined.
    pub fn run(&self) -> Result<()> {
        *self.stopped.lock().unwrap_or_else(|e| e.into_inner()) = false;
        if self.running.swap(true, Ordering::AcqRel) {
            anyhow::bail!("tunnel is already running");
        }

        self.engine.start();
        self.start_timer();
        info!("tunnel running");

        // Block until stop() is signaled.
        let mut stopped = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        while !*stopped {
            stopped = self
                .stop_cond
                .wait(stopped)
                .unwrap_or_else(|e| e.into_inner());
        }
        drop(stopped);

        // Shutdown order: I/O first, then sessions and their workers, then
        // the timer.
        self.engine.stop();
        self.registry.cancel_all();
        self.pool.shutdown();
        if let Some(timer) = self
            .timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = timer.join();
        }

        info!("tunnel stopped");
        Ok(())
    }

    /// Signal every thread to exit. Idempotent; safe from signal watchers.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let mut stopped = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        if !*stopped {
            *stopped = true;
            self.stop_cond.notify_all();
        }
    }

    /// Tear down everything `init` created, in reverse order.
    pub fn fini(self) {
        self.stop();
        // When run() was never entered (or already returned) these are
        // no-ops; otherwise they finish the job here.
        self.engine.stop();
        self.registry.cancel_all();
        self.pool.shutdown();
        if let Some(timer) = self
            .timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = timer.join();
        }

        if let Some(script) = &self.config.tunnel.pre_down {
            if let Err(e) = run_script("pre-down", script) {
                warn!(error = %e, "pre-down script failed");
            }
        }
        if let Some(mut device) = self
            .device
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            device.close();
        }
        info!("tunnel finalized");
    }

    /// Snapshot of the TUN byte/packet counters. Never fails.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn start_timer(&self) {
        let running = Arc::clone(&self.running);
        let stack = Arc::clone(&self.stack);
        let handle = std::thread::Builder::new()
            .name("tb-timer".to_string())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    {
                        let mut stack = stack.lock().unwrap_or_else(|e| e.into_inner());
                        stack.poll();
                    }
                    // never hold the stack lock across the sleep
                    std::thread::sleep(TIMER_INTERVAL);
                }
            })
            .expect("failed to spawn timer thread");
        *self.timer.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }
}

#[cfg(unix)]
fn raise_nofile_limit(limit: u64) {
    let rlim = libc::rlimit {
        rlim_cur: limit as libc::rlim_t,
        rlim_max: limit as libc::rlim_t,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) };
    if ret != 0 {
        warn!(
            limit,
            error = %std::io::Error::last_os_error(),
            "failed to raise RLIMIT_NOFILE"
        );
    }
}

#[cfg(not(unix))]
fn raise_nofile_limit(_limit: u64) {}

