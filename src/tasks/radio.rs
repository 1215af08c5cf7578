//! Radio task: event pump between the driver and the link channels
//!
//! Waits on radio events, drains received packets through the parity
//! filter and codec, and broadcasts the survivors. Outbound frames are
//! accepted from the TX channel only while the transmitter is free, so a
//! frame is never dropped against the driver's overlap rejection.

use embassy_futures::select::{select, Either};
use log::{debug, error, warn};

use crate::link::{self, RX_PACKET_CHANNEL, TX_CHANNEL};
use crate::radio::traits::{FskRadio, RadioEvent, RadioOptions};
use crate::tasks::led::{LedFlash, LedSender};

/// Run the radio. `parity` is the group parity matching the configured
/// sync bytes; `options` is applied through `init` at startup.
pub async fn radio_task<R: FskRadio>(
    mut radio: R,
    options: RadioOptions,
    parity: u8,
    led_sender: LedSender,
) -> ! {
    if let Err(e) = radio.init(&options).await {
        // no chip, no radio: report once and park
        error!("jeelink: radio init failed: {:?}", e);
        core::future::pending::<()>().await;
    }
    debug!("jeelink: radio ready");

    let publisher = RX_PACKET_CHANNEL.immediate_publisher();
    let mut tx_free = true;

    loop {
        let event = if tx_free {
            match select(radio.wait_event(), TX_CHANNEL.receive()).await {
                Either::First(event) => event,
                Either::Second(frame) => {
                    match radio.write(&frame).await {
                        Ok(()) => {
                            tx_free = false;
                            let _ = led_sender.try_send(LedFlash::Default);
                        }
                        Err(e) => warn!("jeelink: transmit failed: {:?}", e),
                    }
                    continue;
                }
            }
        } else {
            radio.wait_event().await
        };

        match event {
            Ok(RadioEvent::SyncMatch) => {
                // quality captured inside the driver; the packet follows
            }
            Ok(RadioEvent::PacketReady { at, .. }) => match radio.read().await {
                Ok(Some(raw)) => {
                    let quality = radio.quality();
                    debug!(
                        "jeelink: rx {} bytes {}dBm {}dB {}Hz",
                        raw.len(),
                        quality.rssi_dbm,
                        quality.margin_db,
                        quality.fei_hz
                    );
                    if let Some(rx) = link::accept(&raw, parity, quality, at) {
                        let _ = led_sender.try_send(LedFlash::Default);
                        publisher.publish_immediate(rx);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("jeelink: read failed: {:?}", e),
            },
            Ok(RadioEvent::TxDone) => {
                debug!("jeelink: tx done");
                tx_free = true;
            }
            Err(e) => warn!("jeelink: radio error: {:?}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{RX_PACKET_CHANNEL, TX_CHANNEL};
    use crate::protocol::jeelabs::gen_sync_bytes;
    use crate::radio::traits::mock::MockFskRadio;
    use crate::radio::traits::RxQuality;
    use crate::tasks::led::LED_CHANNEL;
    use embassy_time::Instant;
    use futures::executor::block_on;
    use heapless::Vec;

    /// One pump pass: an accepted packet reaches the broadcast channel and
    /// a queued frame reaches the transmitter. A single test keeps the
    /// static channels free of cross-test traffic.
    #[test]
    fn test_pump_publishes_and_transmits() {
        let radio = MockFskRadio::new();
        let (_, parity) = gen_sync_bytes(6);
        let raw = [parity | 0x02, 0, 0, 0, 9, 0x03, 0x82];
        radio.set_quality(RxQuality {
            rssi_dbm: -80,
            lna_db: 6,
            fei_hz: 122,
            margin_db: 2,
        });
        radio.queue_event(RadioEvent::SyncMatch);
        radio.queue_event(RadioEvent::PacketReady {
            length: raw.len() as u8,
            at: Instant::from_ticks(0),
        });
        radio.queue_rx(&raw);

        let frame: crate::link::TxFrame =
            Vec::from_slice(&[0x02, 0, 0, 0, 9, 0x03, 0x84]).unwrap();
        TX_CHANNEL.try_send(frame).unwrap();

        let mut packets = RX_PACKET_CHANNEL.subscriber().unwrap();
        let rx = block_on(async {
            match select(
                radio_task(&radio, RadioOptions::default(), parity, LED_CHANNEL.sender()),
                packets.next_message_pure(),
            )
            .await
            {
                Either::First(_) => unreachable!("the pump never returns"),
                Either::Second(rx) => rx,
            }
        });

        assert!(radio.is_initialised());
        assert_eq!(rx.packet.node, Some(9));
        assert_eq!(rx.packet.data.as_slice(), &[1]);
        assert_eq!(rx.quality.rssi_dbm, -80);
        assert_eq!(rx.raw.as_slice(), &raw);
        // the queued frame was handed to the transmitter, not dropped
        let sent = radio.tx_history();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].as_slice(), &[0x02, 0, 0, 0, 9, 0x03, 0x84]);
    }
}
