//! Virtual network device backing the embedded stack.
//!
//! The RX side is fed with raw IP packets read from the TUN; the TX side is
//! the stack's emit path and pushes every produced packet straight onto the
//! bounded packet queue for the TUN writers. Emit never blocks: when the
//! queue is full the packet is dropped and TCP's own retransmission recovers.

use std::collections::VecDeque;

use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;

use crate::tun::PacketSender;

pub struct VirtualDevice {
    rx_queue: VecDeque<Vec<u8>>,
    tx: PacketSender,
    mtu: usize,
}

impl VirtualDevice {
    pub fn new(mtu: usize, tx: PacketSender) -> Self {
        Self {
            rx_queue: VecDeque::new(),
            tx,
            mtu,
        }
    }

    /// Queue one inbound packet for the next stack poll.
    pub fn inject(&mut self, packet: Vec<u8>) {
        self.rx_queue.push_back(packet);
    }
}

pub struct VirtualRxToken {
    data: Vec<u8>,
}

impl RxToken for VirtualRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.data)
    }
}

pub struct VirtualTxToken<'a> {
    tx: &'a PacketSender,
}

impl<'a> TxToken for VirtualTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let result = f(&mut buf);
        self.tx.push(buf);
        result
    }
}

impl Device for VirtualDevice {
    type RxToken<'a> = VirtualRxToken;
    type TxToken<'a> = VirtualTxToken<'a>;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        self.rx_queue
            .pop_front()
            .map(|data| (VirtualRxToken { data }, VirtualTxToken { tx: &self.tx }))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(VirtualTxToken { tx: &self.tx })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}
