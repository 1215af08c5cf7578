//! Background noise-floor estimation
//!
//! The receiver squelch is an absolute RSSI threshold, so a static value
//! either drowns in urban noise or wastes sensitivity in a quiet band. The
//! driver samples the RSSI register every few seconds while the channel is
//! idle and keeps the threshold a couple of dB above the smoothed floor.
//! All RSSI values here are raw register units: -2 x dBm.

/// Threshold offset above the noise floor (unit: 1/2 dB).
pub const THRESHOLD_ADJUST: u8 = 4;

/// Demodulator SNR requirement in dB. From SX1231 sec 3.5.3.2 "AGC
/// Reference": 8dB + log10(2*RxBw).
pub const DEMOD_SNR_DB: u8 = 10;

/// Initial noise-floor assumption: -90 dBm.
const FLOOR_SEED: u16 = 2 * 90;

/// Idle samples below -100 dBm or above -70 dBm are measurement glitches.
const FLOOR_MIN: u16 = 2 * 70;
const FLOOR_MAX: u16 = 2 * 100;

/// Tracks the ambient noise floor and watches the AFC for lock-up.
pub struct NoiseTracker {
    bg_rssi: u16,
    idle_afc: i16,
}

impl NoiseTracker {
    pub fn new() -> Self {
        Self {
            bg_rssi: FLOOR_SEED,
            idle_afc: 0,
        }
    }

    /// Forget the learned floor after an RF reconfiguration; returns the
    /// threshold register value to start from.
    pub fn reseed(&mut self) -> u8 {
        self.bg_rssi = FLOOR_SEED;
        self.threshold()
    }

    /// Current threshold register value: floor minus the adjustment.
    pub fn threshold(&self) -> u8 {
        (self.bg_rssi - u16::from(THRESHOLD_ADJUST)) as u8
    }

    /// Smoothed noise floor in dBm, for diagnostics.
    pub fn floor_dbm(&self) -> i16 {
        -((self.bg_rssi >> 1) as i16)
    }

    /// Feed one idle RSSI sample. Returns the new threshold register value
    /// when the smoothed floor moved, `None` when nothing changed or the
    /// sample was implausible.
    pub fn observe_rssi(&mut self, raw: u8) -> Option<u8> {
        let v = u16::from(raw);
        if v <= FLOOR_MIN || v >= FLOOR_MAX {
            return None;
        }
        let prev = self.bg_rssi;
        self.bg_rssi = (self.bg_rssi * 15 + v) >> 4;
        (self.bg_rssi != prev).then(|| self.threshold())
    }

    /// Feed one idle AFC sample; true when the value repeated non-zero,
    /// which means the AFC block stopped updating and needs a clear.
    pub fn afc_stuck(&mut self, afc: i16) -> bool {
        let stuck = afc != 0 && afc == self.idle_afc;
        self.idle_afc = afc;
        stuck
    }
}

impl Default for NoiseTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoding margin of the last packet: how far the signal sat above what
/// the demodulator needs, clamped to 0..=20 dB for display sanity.
/// `threshold` and `rssi` are raw register units.
pub fn rx_margin(threshold: u8, rssi: u8) -> u8 {
    let limit =
        i16::from(threshold) + i16::from(THRESHOLD_ADJUST) - 2 * i16::from(DEMOD_SNR_DB);
    let margin = if i16::from(rssi) > limit {
        0
    } else {
        (limit - i16::from(rssi)) >> 1
    };
    margin.min(20) as u8
}
