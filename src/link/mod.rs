//! Decoded-packet plumbing between the radio task and its consumers
//!
//! The radio task publishes every accepted packet on a broadcast channel
//! and drains a command channel of frames to transmit. Group-parity
//! filtering happens here, before full decode: the two parity bits in the
//! first payload byte reject cross-group collisions cheaply, since the
//! sync bytes themselves are outside the packet CRC.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::pubsub::PubSubChannel;
use embassy_time::Instant;
use heapless::Vec;
use log::debug;

use crate::config::packet::MAX_LEN;
use crate::protocol::jeelabs::{self, Packet};
use crate::radio::traits::RxQuality;

/// A decoded packet with locally-measured link quality attached.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedPacket {
    pub packet: Packet,
    /// Raw payload bytes as they came off the radio.
    pub raw: Vec<u8, MAX_LEN>,
    /// Local measurements for this packet; the codec never sees these.
    pub quality: RxQuality,
    /// Arrival timestamp of the payload-ready interrupt.
    pub at: Instant,
}

/// One outbound frame, ready for the radio FIFO.
pub type TxFrame = Vec<u8, MAX_LEN>;

const TX_QUEUE_SIZE: usize = 4;

/// Frames queued for transmission.
///
/// Multiple producers, single consumer (the radio task).
pub static TX_CHANNEL: Channel<CriticalSectionRawMutex, TxFrame, TX_QUEUE_SIZE> = Channel::new();

/// Received packets, broadcast to every subscriber.
///
/// Parameters: CAP=4 messages, SUBS=2 subscribers, PUBS=1 publisher (the
/// radio task).
pub static RX_PACKET_CHANNEL: PubSubChannel<CriticalSectionRawMutex, ReceivedPacket, 4, 2, 1> =
    PubSubChannel::new();

/// Filter and decode one received payload.
///
/// `parity` is the expected group parity from `gen_sync_bytes`. Returns
/// `None` for cross-group packets and anything the codec rejects; both are
/// routine on a shared band and only worth a debug trace.
pub fn accept(raw: &[u8], parity: u8, quality: RxQuality, at: Instant) -> Option<ReceivedPacket> {
    let got = raw.first()? & 0xc0;
    if got != parity {
        debug!("jeelink: bad group parity {got:#04x} != {parity:#04x}");
        return None;
    }
    let packet = jeelabs::decode(raw)?;
    Some(ReceivedPacket {
        packet,
        raw: Vec::from_slice(raw).ok()?,
        quality,
        at,
    })
}
