//! Hardware configuration constants for the ESP32-S3 with an sx1276 radio

/// LED pin
pub mod led {
    pub const PIN: u8 = 48;
}

/// SPI pins for the radio module
pub mod spi {
    pub const SCLK: u8 = 7;
    pub const MISO: u8 = 8;
    pub const MOSI: u8 = 9;

    /// During bulk FIFO reads MISO changes ~90ns after SCK falls, and the
    /// GPIO matrix adds another ~25ns of delay, so the bus must stay at or
    /// below 3 MHz.
    pub const MAX_CLOCK_HZ: u32 = 3_000_000;
}

/// Radio control pins
pub mod radio_pins {
    pub const SELECT: u8 = 41;
    pub const RESET: u8 = 42;
    /// Payload-ready / packet-sent interrupt
    pub const DIO0: u8 = 39;
    /// Sync-address-match interrupt
    pub const DIO2: u8 = 38;
}

/// Default RF configuration
pub mod rf_defaults {
    /// US ISM band, offset below the 915 MHz gateway centre
    pub const FREQUENCY_HZ: u32 = 912_500_000;
    pub const BIT_RATE: u32 = 50_000;
    /// Network group id (0-63), selects the third sync byte
    pub const GROUP: u8 = 6;
}

/// Packet limits
pub mod packet {
    /// Maximum RX payload the radio accepts (register 0x32)
    pub const MAX_LEN: usize = 64;

    /// Upper bound on varint values in one payload (each takes at least one byte)
    pub const MAX_VALUES: usize = 64;
}

/// Timing budgets for bounded polls and recovery timers
pub mod timing {
    /// Reset line held low, then settle time after release
    pub const RESET_HOLD_MS: u64 = 10;
    pub const RESET_SETTLE_MS: u64 = 10;

    /// Chip version probe at construction
    pub const VERSION_RETRIES: u32 = 10;
    pub const VERSION_RETRY_DELAY_MS: u64 = 2;

    /// Budget for bounded register polls (mode-ready, image calibration)
    pub const COMMAND_TIMEOUT_MS: u64 = 100;

    /// Background RSSI estimator period
    pub const BG_POLL_SECS: u64 = 11;
}
