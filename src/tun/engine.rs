//! TUN packet I/O engine.
//!
//! Reader threads pull raw IP packets off the TUN descriptor and hand each
//! one to the registered ingest callback; writer threads drain the bounded
//! packet queue back onto the descriptor. The same descriptor is shared by
//! every thread — concurrent read/write on a TUN device is permitted by the
//! kernel — so packet order across threads is not preserved, which the
//! network stack tolerates like any reordering IP path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error, trace, warn};

use crate::common::TunnelStats;
use crate::tun::device::RawFd;

/// Bounded packet queue between the stack's emit path and the writers.
pub const PACKET_QUEUE_CAPACITY: usize = 4096;
/// Packets a writer moves per wakeup.
const WRITE_BATCH: usize = 16;
/// Writer wait for the queue to become non-empty.
const WRITE_POLL: Duration = Duration::from_millis(1);
/// Reader backoff when the descriptor has nothing to deliver.
const READ_IDLE: Duration = Duration::from_micros(100);

pub type IngestFn = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Handle for enqueueing outbound packets. Cloned into the network stack's
/// virtual device (its emit path) and the mapped-DNS responder.
#[derive(Clone)]
pub struct PacketSender {
    tx: Sender<Vec<u8>>,
    dropped: Arc<AtomicU64>,
}

impl PacketSender {
    #[cfg(test)]
    pub(crate) fn for_queue(tx: Sender<Vec<u8>>) -> Self {
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Non-blocking enqueue. A full queue drops the packet — the stack's
    /// emit callback must never block — and the loss is surfaced through a
    /// rate-limited warning.
    pub fn push(&self, packet: Vec<u8>) -> bool {
        match self.tx.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1024 == 0 {
                    warn!(dropped, "packet queue full, dropping outbound packet");
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn queued(&self) -> usize {
        self.tx.len()
    }
}

pub struct TunIoEngine {
    fd: RawFd,
    mtu: usize,
    running: Arc<AtomicBool>,
    packets_tx: Sender<Vec<u8>>,
    packets_rx: Receiver<Vec<u8>>,
    dropped: Arc<AtomicU64>,
    ingest: Arc<Mutex<Option<IngestFn>>>,
    stats: Arc<TunnelStats>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TunIoEngine {
    pub fn new(fd: RawFd, mtu: u16, stats: Arc<TunnelStats>) -> Self {
        let (packets_tx, packets_rx) = channel::bounded(PACKET_QUEUE_CAPACITY);
        Self {
            fd,
            mtu: mtu as usize,
            running: Arc::new(AtomicBool::new(false)),
            packets_tx,
            packets_rx,
            dropped: Arc::new(AtomicU64::new(0)),
            ingest: Arc::new(Mutex::new(None)),
            stats,
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Swap the callback that receives every inbound packet. Held under its
    /// own short-lived lock so it can be replaced while readers run.
    pub fn set_ingest(&self, ingest: IngestFn) {
        *self.ingest.lock().unwrap_or_else(|e| e.into_inner()) = Some(ingest);
    }

    pub fn sender(&self) -> PacketSender {
        PacketSender {
            tx: self.packets_tx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }

    pub fn stats(&self) -> Arc<TunnelStats> {
        Arc::clone(&self.stats)
    }

    fn num_readers() -> usize {
        if cpu_count() >= 4 {
            2
        } else {
            1
        }
    }

    fn num_writers() -> usize {
        if cpu_count() >= 4 {
            2
        } else {
            1
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());

        for i in 0..Self::num_readers() {
            let fd = self.fd;
            let mtu = self.mtu;
            let running = Arc::clone(&self.running);
            let ingest = Arc::clone(&self.ingest);
            let stats = Arc::clone(&self.stats);
            let handle = std::thread::Builder::new()
                .name(format!("tb-reader-{}", i))
                .spawn(move || reader_loop(fd, mtu, running, ingest, stats))
                .expect("failed to spawn tun reader");
            threads.push(handle);
        }

        for i in 0..Self::num_writers() {
            let fd = self.fd;
            let running = Arc::clone(&self.running);
            let rx = self.packets_rx.clone();
            let stats = Arc::clone(&self.stats);
            let handle = std::thread::Builder::new()
                .name(format!("tb-writer-{}", i))
                .spawn(move || writer_loop(fd, running, rx, stats))
                .expect("failed to spawn tun writer");
            threads.push(handle);
        }

        debug!(
            readers = Self::num_readers(),
            writers = Self::num_writers(),
            "tun i/o engine started"
        );
    }

    /// Stop and join every reader and writer, then drop whatever is left in
    /// the packet queue.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let handles = std::mem::take(
            &mut *self.threads.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for handle in handles {
            let _ = handle.join();
        }
        let mut residual = 0usize;
        while self.packets_rx.try_recv().is_ok() {
            residual += 1;
        }
        if residual > 0 {
            debug!(residual, "drained packet queue on engine stop");
        }
        debug!("tun i/o engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn reader_loop(
    fd: RawFd,
    mtu: usize,
    running: Arc<AtomicBool>,
    ingest: Arc<Mutex<Option<IngestFn>>>,
    stats: Arc<TunnelStats>,
) {
    let mut buf = vec![0u8; mtu + 4];

    while running.load(Ordering::Acquire) {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n > 0 {
            let n = n as usize;
            stats.add_rx(n as u64);
            let packet = buf[..n].to_vec();
            let callback = ingest
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(callback) = callback {
                callback(packet);
            }
            continue;
        }
        if n == 0 {
            std::thread::sleep(READ_IDLE);
            continue;
        }

        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => std::thread::sleep(READ_IDLE),
            Some(libc::EINTR) => continue,
            _ => {
                error!(error = %err, "tun read failed, reader exiting");
                break;
            }
        }
    }
    trace!("tun reader exited");
}

fn writer_loop(
    fd: RawFd,
    running: Arc<AtomicBool>,
    rx: Receiver<Vec<u8>>,
    stats: Arc<TunnelStats>,
) {
    let mut batch: Vec<Vec<u8>> = Vec::with_capacity(WRITE_BATCH);

    loop {
        if !running.load(Ordering::Acquire) && rx.is_empty() {
            break;
        }

        batch.clear();
        match rx.recv_timeout(WRITE_POLL) {
            Ok(packet) => batch.push(packet),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
        while batch.len() < WRITE_BATCH {
            match rx.try_recv() {
                Ok(packet) => batch.push(packet),
                Err(_) => break,
            }
        }

        for packet in batch.drain(..) {
            write_packet(fd, &packet, &stats);
        }
    }
    trace!("tun writer exited");
}

fn write_packet(fd: RawFd, packet: &[u8], stats: &TunnelStats) {
    loop {
        let n = unsafe { libc::write(fd, packet.as_ptr().cast(), packet.len()) };
        if n >= 0 {
            stats.add_tx(n as u64);
            return;
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            // Transient pressure: the packet is expendable, drop it.
            Some(libc::EAGAIN) => return,
            Some(libc::EINTR) => continue,
            _ => {
                error!(error = %err, len = packet.len(), "tun write failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// A SOCK_DGRAM socketpair preserves packet boundaries the way a TUN fd
    /// does, which makes it a faithful stand-in for the device.
    fn dgram_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(ret, 0);
        for fd in fds {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        }
        (fds[0], fds[1])
    }

    fn close_pair(pair: (RawFd, RawFd)) {
        unsafe {
            libc::close(pair.0);
            libc::close(pair.1);
        }
    }

    #[test]
    fn reader_delivers_packets_to_ingest() {
        let (engine_fd, peer_fd) = dgram_pair();
        let stats = Arc::new(TunnelStats::new());
        let engine = TunIoEngine::new(engine_fd, 1500, Arc::clone(&stats));

        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        engine.set_ingest(Arc::new(move |pkt| {
            let _ = tx.send(pkt);
        }));
        engine.start();

        let payload = b"\x45fake-ip-packet";
        let n = unsafe { libc::write(peer_fd, payload.as_ptr().cast(), payload.len()) };
        assert_eq!(n as usize, payload.len());

        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, payload);

        engine.stop();
        let snap = stats.snapshot();
        assert_eq!(snap.rx_packets, 1);
        assert_eq!(snap.rx_bytes, payload.len() as u64);
        close_pair((engine_fd, peer_fd));
    }

    #[test]
    fn writer_drains_queue_to_fd() {
        let (engine_fd, peer_fd) = dgram_pair();
        let stats = Arc::new(TunnelStats::new());
        let engine = TunIoEngine::new(engine_fd, 1500, Arc::clone(&stats));
        engine.start();

        let sender = engine.sender();
        assert!(sender.push(b"one".to_vec()));
        assert!(sender.push(b"two".to_vec()));

        let mut seen = Vec::new();
        let mut buf = [0u8; 64];
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while seen.len() < 2 && std::time::Instant::now() < deadline {
            let n = unsafe { libc::read(peer_fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n > 0 {
                seen.push(buf[..n as usize].to_vec());
            } else {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        assert_eq!(seen.len(), 2);

        engine.stop();
        let snap = stats.snapshot();
        assert_eq!(snap.tx_packets, 2);
        assert_eq!(snap.tx_bytes, 6);
        close_pair((engine_fd, peer_fd));
    }

    #[test]
    fn push_fails_when_queue_full_without_losing_existing() {
        let (engine_fd, peer_fd) = dgram_pair();
        let stats = Arc::new(TunnelStats::new());
        // Engine never started: nothing drains the queue.
        let engine = TunIoEngine::new(engine_fd, 1500, stats);
        let sender = engine.sender();

        for i in 0..PACKET_QUEUE_CAPACITY {
            assert!(sender.push(vec![i as u8]), "queue filled early at {}", i);
        }
        assert!(!sender.push(vec![0xFF]));
        assert_eq!(sender.queued(), PACKET_QUEUE_CAPACITY);

        close_pair((engine_fd, peer_fd));
    }

    #[test]
    fn stop_without_start_is_harmless() {
        let (engine_fd, peer_fd) = dgram_pair();
        let engine = TunIoEngine::new(engine_fd, 1500, Arc::new(TunnelStats::new()));
        engine.stop();
        assert!(!engine.is_running());
        close_pair((engine_fd, peer_fd));
    }
}
