pub mod device;
pub mod engine;
pub mod packet;

pub use device::{RawFd, TunDevice};
pub use engine::{IngestFn, PacketSender, TunIoEngine, PACKET_QUEUE_CAPACITY};
