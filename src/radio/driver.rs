//! Semtech sx1276 FSK driver
//!
//! Drives the transceiver through its SPI register interface: reset and
//! chip identification, packet RX with interrupt-driven link-quality
//! capture, FIFO-burst TX, and a background estimator that keeps the RSSI
//! squelch tracking ambient noise.
//!
//! Interrupt wiring: DIO0 rises on payload-ready in RX and on packet-sent
//! in TX (one physical pin, resolved by the transmit-in-flight flag);
//! DIO2 rises on sync-address match, which is the earliest moment the
//! signal-quality registers can be sampled before FIFO traffic disturbs
//! them.

use embassy_futures::select::{select4, Either4};
use embassy_time::{Duration, Instant, Ticker, Timer};
use embedded_hal::digital::OutputPin;
use embedded_hal_async::digital::Wait;
use embedded_hal_async::spi::SpiBus;
use heapless::Vec;
use log::{debug, trace, warn};

use crate::config::packet::MAX_LEN;
use crate::config::timing;
use crate::radio::estimator::{self, NoiseTracker};
use crate::radio::registers::{self as regs, irq1, Mode};
use crate::radio::traits::{FskRadio, RadioError, RadioEvent, RadioOptions, RxQuality};

/// Driver defaults applied by `init` for options the caller leaves unset.
const DEFAULT_FREQUENCY: u32 = 915;
const DEFAULT_BIT_RATE: u32 = 50_000;

/// Control pins for the sx1276.
pub struct Sx1276Pins<Sel, Rst, Dio0, Dio2> {
    pub select: Sel,
    pub reset: Rst,
    pub dio0: Dio0,
    pub dio2: Dio2,
}

/// Which arm of the event multiplex fired.
enum Wake {
    Dio0,
    Dio2,
    SyncTimeout,
    BgTick,
}

/// sx1276 FSK driver.
///
/// Owns the bus and pins exclusively; every register access goes through
/// `&mut self`, so transactions cannot interleave.
pub struct Sx1276Fsk<Spi, Sel, Rst, Dio0, Dio2>
where
    Spi: SpiBus,
    Sel: OutputPin,
    Rst: OutputPin,
    Dio0: Wait,
    Dio2: Wait,
{
    spi: Spi,
    select: Sel,
    reset: Rst,
    dio0: Dio0,
    dio2: Dio2,
    /// Top bits for the opmode register (low-frequency-range select).
    opbits: u8,
    /// Fixed packet length, 0 for variable-length framing.
    fixed_len: u8,
    /// Whether RX is re-entered whenever the radio goes idle.
    rx_cont: bool,
    /// Length of the packet waiting in the FIFO, 0 when none.
    rx_len: u8,
    tx_active: bool,
    /// Raw -RSSI*2 of the last packet.
    rx_rssi: u8,
    /// RSSI threshold register at capture time.
    rx_thres: u8,
    /// LNA gain in dB at capture time.
    rx_lna: u8,
    /// AFC frequency correction in Hz at capture time.
    rx_fei: i32,
    /// Deadline for payload-ready after a sync match.
    sync_deadline: Option<Instant>,
    /// Worst-case sync-match-to-payload window at the configured bit rate.
    sync_timeout: Duration,
    noise: NoiseTracker,
    bg_ticker: Ticker,
}

impl<Spi, Sel, Rst, Dio0, Dio2> Sx1276Fsk<Spi, Sel, Rst, Dio0, Dio2>
where
    Spi: SpiBus,
    Sel: OutputPin,
    Rst: OutputPin,
    Dio0: Wait,
    Dio2: Wait,
{
    /// Create a new driver. No bus traffic happens until `init`.
    pub fn new(spi: Spi, pins: Sx1276Pins<Sel, Rst, Dio0, Dio2>) -> Self {
        Self {
            spi,
            select: pins.select,
            reset: pins.reset,
            dio0: pins.dio0,
            dio2: pins.dio2,
            opbits: 0,
            fixed_len: 0,
            rx_cont: false,
            rx_len: 0,
            tx_active: false,
            rx_rssi: 0,
            rx_thres: 0,
            rx_lna: 0,
            rx_fei: 0,
            sync_deadline: None,
            sync_timeout: packet_timeout(DEFAULT_BIT_RATE),
            noise: NoiseTracker::new(),
            bg_ticker: Ticker::every(Duration::from_secs(timing::BG_POLL_SECS)),
        }
    }

    /// Reset, identify and initialise the chip, then apply `options` with
    /// driver defaults filled in for anything unset.
    pub async fn init(&mut self, options: &RadioOptions) -> Result<(), RadioError> {
        self.reset_chip().await;

        // confirm the right chip answers before touching anything else
        let mut found = false;
        for _ in 0..timing::VERSION_RETRIES {
            if matches!(
                self.read_reg(regs::REG_VERSION).await,
                Ok(regs::CHIP_REV_A) | Ok(regs::CHIP_REV_B)
            ) {
                found = true;
                break;
            }
            Timer::after(Duration::from_millis(timing::VERSION_RETRY_DELAY_MS)).await;
        }
        if !found {
            return Err(RadioError::ChipNotFound);
        }

        // scratch write-verify with two patterns proves the bus works in
        // both directions, not just that MISO idles at the right level
        self.write_reg(regs::REG_SYNCVALUE1, 0xaa).await?;
        self.write_reg(regs::REG_SYNCVALUE1, 0xaa).await?;
        if self.read_reg(regs::REG_SYNCVALUE1).await? != 0xaa {
            return Err(RadioError::NotResponding);
        }
        self.write_reg(regs::REG_SYNCVALUE1, 0x55).await?;
        if self.read_reg(regs::REG_SYNCVALUE1).await? != 0x55 {
            return Err(RadioError::NotResponding);
        }

        for &(reg, value) in regs::CONFIG_REGS.iter() {
            self.write_reg(reg, value).await?;
        }

        self.configure(&with_defaults(options)).await
    }

    /// Apply a partial configuration; unset options leave prior register
    /// state untouched.
    pub async fn configure(&mut self, options: &RadioOptions) -> Result<(), RadioError> {
        if let Some(f) = options.frequency {
            let hz = regs::normalize_freq(f);
            let frf = regs::frf_from_hz(hz);
            self.write_reg(regs::REG_FRF_MSB, (frf >> 16) as u8).await?;
            self.write_reg(regs::REG_FRF_MID, (frf >> 8) as u8).await?;
            self.write_reg(regs::REG_FRF_LSB, frf as u8).await?;
            if hz < 525_000_000 {
                let mode = self.current_mode().await?;
                self.opbits = regs::OPMODE_LOW_FREQ;
                self.write_reg(regs::REG_OPMODE, self.opbits | mode).await?;
            }
            self.image_calibrate().await?;
        }

        if let Some(rate) = options.bit_rate {
            let (msb, lsb, frac) = regs::bit_rate_regs(rate);
            self.write_reg(regs::REG_BITRATE_MSB, msb).await?;
            self.write_reg(regs::REG_BITRATE_LSB, lsb).await?;
            self.write_reg(regs::REG_BITRATE_FRAC, frac).await?;
            self.sync_timeout = packet_timeout(rate);
        }

        if let Some(dev) = options.deviation_hz {
            let (msb, lsb) = regs::deviation_regs(dev);
            self.write_reg(regs::REG_FDEV_MSB, msb).await?;
            self.write_reg(regs::REG_FDEV_LSB, lsb).await?;
        }

        if let Some(bw) = options.bandwidth_hz {
            self.write_reg(regs::REG_RXBW, regs::bandwidth_reg(bw)).await?;
        }

        if let Some(bw) = options.afc_bandwidth_hz {
            self.write_reg(regs::REG_AFCBW, regs::bandwidth_reg(bw)).await?;
        }

        if let Some(len) = options.preamble {
            self.write_reg(regs::REG_PREAMBLE_LSB, len).await?;
            let detector = len.min(3).saturating_sub(1);
            self.write_reg(regs::REG_PREAMBLE_DETECT, 0x80 | (detector << 5) | 0x0a)
                .await?;
        }

        if let Some(sync) = options.sync.as_ref().filter(|s| !s.is_empty()) {
            for (i, b) in sync.iter().enumerate() {
                self.write_reg(regs::REG_SYNCVALUE1 + i as u8, *b).await?;
            }
            let cfg = self.read_reg(regs::REG_SYNCCONFIG).await?;
            self.write_reg(
                regs::REG_SYNCCONFIG,
                (cfg & 0xf4) | ((sync.len() as u8 - 1) & 0x7),
            )
            .await?;
        }

        if let Some(len) = options.fixed_length {
            // fixed length, no whitening, no crc
            self.write_reg(regs::REG_PACKETCONFIG1, 0x00).await?;
            self.write_reg(regs::REG_PAYLOAD_LENGTH, len).await?;
            self.fixed_len = len;
        }

        // any RF parameter change invalidates the learned noise floor
        if options.frequency.is_some()
            || options.bit_rate.is_some()
            || options.deviation_hz.is_some()
            || options.bandwidth_hz.is_some()
        {
            let thres = self.noise.reseed();
            self.write_reg(regs::REG_RSSITHRES, thres).await?;
        }

        if let Some(rx) = options.enable_receiver {
            self.rx_cont = rx;
            if rx {
                self.set_mode(Mode::Receive).await?;
            }
        }

        Ok(())
    }

    /// Wait for the next radio event.
    ///
    /// Stuck-RX recovery and the background estimator run inside this
    /// loop; they never surface as events.
    pub async fn wait_event(&mut self) -> Result<RadioEvent, RadioError> {
        loop {
            let wake = match select4(
                self.dio0.wait_for_rising_edge(),
                self.dio2.wait_for_rising_edge(),
                deadline_wait(self.sync_deadline),
                self.bg_ticker.next(),
            )
            .await
            {
                Either4::First(_) => Wake::Dio0,
                Either4::Second(_) => Wake::Dio2,
                Either4::Third(()) => Wake::SyncTimeout,
                Either4::Fourth(()) => Wake::BgTick,
            };

            match wake {
                Wake::Dio0 if self.tx_active => {
                    self.on_tx_complete().await?;
                    return Ok(RadioEvent::TxDone);
                }
                Wake::Dio0 => return self.on_packet_ready().await,
                Wake::Dio2 => {
                    self.on_sync_match().await?;
                    return Ok(RadioEvent::SyncMatch);
                }
                Wake::SyncTimeout => self.restart_rx().await?,
                Wake::BgTick => self.background_poll().await?,
            }
        }
    }

    /// Drain the pending packet, if any, into a fresh buffer.
    pub async fn read(&mut self) -> Result<Option<Vec<u8, MAX_LEN>>, RadioError> {
        let len = usize::from(self.rx_len).min(MAX_LEN);
        if len == 0 {
            return Ok(None);
        }
        let mut buf = [0u8; MAX_LEN + 1];
        self.read_burst(regs::REG_FIFO, &mut buf[..len + 1]).await?;
        self.rx_len = 0;
        if self.rx_cont {
            self.set_mode(Mode::Receive).await?;
        }
        let mut out = Vec::new();
        let _ = out.extend_from_slice(&buf[1..len + 1]);
        Ok(Some(out))
    }

    /// Drain the pending packet into `dest`; rejects outright when the
    /// packet would not fit, leaving it pending.
    pub async fn read_into(&mut self, dest: &mut [u8]) -> Result<Option<usize>, RadioError> {
        let len = usize::from(self.rx_len).min(MAX_LEN);
        if len == 0 {
            return Ok(None);
        }
        if len > dest.len() {
            return Err(RadioError::PacketTooBig);
        }
        let mut buf = [0u8; MAX_LEN + 1];
        self.read_burst(regs::REG_FIFO, &mut buf[..len + 1]).await?;
        self.rx_len = 0;
        if self.rx_cont {
            self.set_mode(Mode::Receive).await?;
        }
        dest[..len].copy_from_slice(&buf[1..len + 1]);
        Ok(Some(len))
    }

    /// Transmit one packet. Rejects while a previous transmission has not
    /// completed; nothing is queued.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), RadioError> {
        if self.tx_active {
            return Err(RadioError::TxBusy);
        }
        if data.len() > MAX_LEN {
            return Err(RadioError::PacketTooBig);
        }
        self.tx_active = true;
        let res = self.start_tx(data).await;
        if res.is_err() {
            self.tx_active = false;
        }
        res
    }

    /// RSSI of the last packet in dBm.
    pub fn rx_rssi(&self) -> i16 {
        -i16::from(self.rx_rssi >> 1)
    }

    /// LNA gain the last packet was received at, in dB.
    pub fn rx_lna(&self) -> u8 {
        self.rx_lna
    }

    /// AFC frequency correction for the last packet, in Hz.
    pub fn rx_afc(&self) -> i32 {
        self.rx_fei
    }

    /// Decoding margin of the last packet, clamped to 0..=20 dB.
    pub fn rx_margin(&self) -> u8 {
        estimator::rx_margin(self.rx_thres, self.rx_rssi)
    }

    /// Snapshot of all last-packet quality readings.
    pub fn quality(&self) -> RxQuality {
        RxQuality {
            rssi_dbm: self.rx_rssi(),
            lna_db: self.rx_lna,
            fei_hz: self.rx_fei,
            margin_db: self.rx_margin(),
        }
    }

    /// Put the chip to sleep and release the bus and pins.
    pub async fn close(mut self) -> Result<(), RadioError> {
        self.set_mode(Mode::Sleep).await
    }

    /// Log the full register file, 16 registers per line.
    pub async fn dump_registers(&mut self) -> Result<(), RadioError> {
        for base in (0x00u8..0x70).step_by(16) {
            let mut row = [0u8; 16];
            for (i, slot) in row.iter_mut().enumerate() {
                *slot = self.read_reg(base + i as u8).await?;
            }
            debug!("sx1276-fsk: {:02x}: {:02x?}", base, row);
        }
        Ok(())
    }

    // ===== interrupt handlers

    /// Sync match: grab the signal-quality registers in one burst before
    /// FIFO traffic disturbs them, then arm the payload deadline to catch
    /// a receiver that detected a preamble but never delivers a packet.
    async fn on_sync_match(&mut self) -> Result<(), RadioError> {
        self.capture_rssi().await?;
        self.sync_deadline = Some(Instant::now() + self.sync_timeout);
        Ok(())
    }

    async fn capture_rssi(&mut self) -> Result<(), RadioError> {
        // one burst covering 0x0c..=0x1f
        let mut buf = [0u8; 0x15];
        self.read_burst(regs::REG_LNAVALUE, &mut buf).await?;
        let reg = |r: u8| buf[usize::from(r - regs::REG_LNAVALUE) + 1];
        self.rx_rssi = reg(regs::REG_RSSIVALUE);
        self.rx_thres = reg(regs::REG_RSSITHRES);
        self.rx_lna = regs::lna_db(reg(regs::REG_LNAVALUE));
        self.rx_fei = regs::afc_hz(reg(regs::REG_AFC_MSB), reg(regs::REG_AFC_LSB));
        Ok(())
    }

    async fn on_packet_ready(&mut self) -> Result<RadioEvent, RadioError> {
        let at = Instant::now();
        self.sync_deadline = None;
        self.rx_len = if self.fixed_len != 0 {
            self.fixed_len
        } else {
            // first FIFO byte is the packet length
            self.read_reg(regs::REG_FIFO).await?
        };
        // late sample, but better than the one captured at sync time
        self.rx_rssi = self.read_reg(regs::REG_RSSIVALUE).await?;
        Ok(RadioEvent::PacketReady {
            length: self.rx_len,
            at,
        })
    }

    async fn on_tx_complete(&mut self) -> Result<(), RadioError> {
        let mode = if self.rx_cont { Mode::Receive } else { Mode::Standby };
        self.set_mode(mode).await?;
        self.tx_active = false;
        Ok(())
    }

    /// Sync matched but no payload arrived inside the window: the RX chain
    /// is wedged or the detection was spurious. Kick it the same way the
    /// chip restarts itself between packets.
    async fn restart_rx(&mut self) -> Result<(), RadioError> {
        self.sync_deadline = None;
        warn!(
            "sx1276-fsk: no payload after sync match, restarting rx (threshold {})",
            self.rx_thres
        );
        self.write_reg(regs::REG_RXCONFIG, regs::RXCONFIG_BASE | regs::RXCONFIG_RESTART)
            .await
    }

    /// Periodic estimator tick: track the noise floor, verify the chip is
    /// still in the mode we expect, and clear a wedged AFC.
    async fn background_poll(&mut self) -> Result<(), RadioError> {
        if let Ok(v) = self.read_reg(regs::REG_RSSIVALUE).await {
            if let Some(thres) = self.noise.observe_rssi(v) {
                trace!(
                    "sx1276-fsk: bgRssi {}dBm, threshold -> {}",
                    self.noise.floor_dbm(),
                    thres
                );
                self.write_reg(regs::REG_RSSITHRES, thres).await?;
            }
        }

        let mode = self.current_mode().await?;
        let afc = self.read_afc().await?;
        let stuck = self.noise.afc_stuck(afc);
        let drifted = self.rx_cont && !self.tx_active && mode != Mode::Receive as u8;
        if drifted {
            trace!("sx1276-fsk: mode {} but receiver expected, correcting", mode);
            self.set_mode(Mode::Receive).await?;
        } else if stuck {
            trace!("sx1276-fsk: AFC stuck at {}Hz, clearing", i32::from(afc) * 61);
            self.write_reg(regs::REG_AFCFEI, regs::AFCFEI_CLEAR).await?;
        }
        Ok(())
    }

    // ===== mode and TX internals

    async fn start_tx(&mut self, data: &[u8]) -> Result<(), RadioError> {
        self.set_mode(Mode::FsTx).await?;
        // stuffing the FIFO before mode-ready can lose bytes
        self.wait_mode_ready().await?;

        // length byte plus payload in a single FIFO burst
        let mut buf = [0u8; MAX_LEN + 2];
        buf[0] = 0x80 | regs::REG_FIFO;
        buf[1] = data.len() as u8;
        buf[2..2 + data.len()].copy_from_slice(data);
        self.write_burst(&buf[..data.len() + 2]).await?;

        self.set_mode(Mode::Transmit).await
    }

    async fn wait_mode_ready(&mut self) -> Result<(), RadioError> {
        let deadline = Instant::now() + Duration::from_millis(timing::COMMAND_TIMEOUT_MS);
        loop {
            // transient read failures retry within the budget
            if let Ok(flags) = self.read_reg(regs::REG_IRQFLAGS1).await {
                if flags & irq1::MODE_READY != 0 {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(RadioError::ModeTimeout);
            }
            Timer::after(Duration::from_micros(100)).await;
        }
    }

    /// Image and RSSI calibration after a frequency change, ~10ms.
    async fn image_calibrate(&mut self) -> Result<(), RadioError> {
        let mode = self.current_mode().await?;
        self.set_mode(Mode::Standby).await?;
        let cal = self.read_reg(regs::REG_IMAGECAL).await?;
        self.write_reg(regs::REG_IMAGECAL, cal | regs::IMAGECAL_START)
            .await?;
        let deadline = Instant::now() + Duration::from_millis(timing::COMMAND_TIMEOUT_MS);
        loop {
            match self.read_reg(regs::REG_IMAGECAL).await {
                Ok(v) if v & regs::IMAGECAL_RUNNING == 0 => break,
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(RadioError::ModeTimeout);
            }
            Timer::after(Duration::from_millis(1)).await;
        }
        self.write_reg(regs::REG_OPMODE, self.opbits | mode).await
    }

    async fn set_mode(&mut self, mode: Mode) -> Result<(), RadioError> {
        self.write_reg(regs::REG_OPMODE, self.opbits | mode as u8).await
    }

    async fn current_mode(&mut self) -> Result<u8, RadioError> {
        Ok(self.read_reg(regs::REG_OPMODE).await? & 0x07)
    }

    /// Signed 16-bit AFC register pair.
    async fn read_afc(&mut self) -> Result<i16, RadioError> {
        let msb = self.read_reg(regs::REG_AFC_MSB).await?;
        let lsb = self.read_reg(regs::REG_AFC_LSB).await?;
        Ok(((u16::from(msb) << 8) | u16::from(lsb)) as i16)
    }

    async fn reset_chip(&mut self) {
        let _ = self.reset.set_low();
        Timer::after(Duration::from_millis(timing::RESET_HOLD_MS)).await;
        let _ = self.reset.set_high();
        Timer::after(Duration::from_millis(timing::RESET_SETTLE_MS)).await;
    }

    // ===== register access

    async fn read_reg(&mut self, reg: u8) -> Result<u8, RadioError> {
        let mut buf = [reg & 0x7f, 0xff];
        let _ = self.select.set_low();
        let res = self.spi.transfer_in_place(&mut buf).await;
        let _ = self.select.set_high();
        res.map_err(|_| RadioError::Spi)?;
        Ok(buf[1])
    }

    async fn write_reg(&mut self, reg: u8, value: u8) -> Result<(), RadioError> {
        let buf = [0x80 | reg, value];
        let _ = self.select.set_low();
        let res = self.spi.write(&buf).await;
        let _ = self.select.set_high();
        res.map_err(|_| RadioError::Spi)
    }

    /// Burst read starting at `start`; `buf[0]` carries the address out,
    /// data lands in `buf[1..]`.
    async fn read_burst(&mut self, start: u8, buf: &mut [u8]) -> Result<(), RadioError> {
        buf[0] = start & 0x7f;
        let _ = self.select.set_low();
        let res = self.spi.transfer_in_place(buf).await;
        let _ = self.select.set_high();
        res.map_err(|_| RadioError::Spi)
    }

    async fn write_burst(&mut self, buf: &[u8]) -> Result<(), RadioError> {
        let _ = self.select.set_low();
        let res = self.spi.write(buf).await;
        let _ = self.select.set_high();
        res.map_err(|_| RadioError::Spi)
    }
}

impl<Spi, Sel, Rst, Dio0, Dio2> FskRadio for Sx1276Fsk<Spi, Sel, Rst, Dio0, Dio2>
where
    Spi: SpiBus,
    Sel: OutputPin,
    Rst: OutputPin,
    Dio0: Wait,
    Dio2: Wait,
{
    async fn init(&mut self, options: &RadioOptions) -> Result<(), RadioError> {
        Sx1276Fsk::init(self, options).await
    }

    async fn wait_event(&mut self) -> Result<RadioEvent, RadioError> {
        Sx1276Fsk::wait_event(self).await
    }

    async fn read(&mut self) -> Result<Option<Vec<u8, MAX_LEN>>, RadioError> {
        Sx1276Fsk::read(self).await
    }

    async fn read_into(&mut self, dest: &mut [u8]) -> Result<Option<usize>, RadioError> {
        Sx1276Fsk::read_into(self, dest).await
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), RadioError> {
        Sx1276Fsk::write(self, data).await
    }

    async fn configure(&mut self, options: &RadioOptions) -> Result<(), RadioError> {
        Sx1276Fsk::configure(self, options).await
    }

    fn quality(&self) -> RxQuality {
        Sx1276Fsk::quality(self)
    }
}

/// Fill in the defaults `init` promises for unset options.
fn with_defaults(options: &RadioOptions) -> RadioOptions {
    let mut o = options.clone();
    o.frequency.get_or_insert(DEFAULT_FREQUENCY);
    let rate = *o.bit_rate.get_or_insert(DEFAULT_BIT_RATE);
    o.deviation_hz.get_or_insert(rate);
    let bw = *o.bandwidth_hz.get_or_insert(rate * 2);
    o.afc_bandwidth_hz.get_or_insert(bw + (bw >> 2));
    o.enable_receiver.get_or_insert(true);
    o
}

/// Worst-case time from sync match to payload-ready: a maximum-length
/// packet (length byte, payload, CRC) plus scheduling slack.
fn packet_timeout(bit_rate: u32) -> Duration {
    let bits = (MAX_LEN as u64 + 4) * 8;
    Duration::from_micros(bits * 1_000_000 / u64::from(bit_rate.max(1)) + 2_000)
}

async fn deadline_wait(deadline: Option<Instant>) {
    match deadline {
        Some(at) => Timer::at(at).await,
        None => core::future::pending().await,
    }
}
