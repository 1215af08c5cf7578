//! LED flash task
//!
//! Blinks the status LED on request without blocking any other task.
//! The LED is active low and normally on; a flash turns it off briefly.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};
use embassy_time::{Duration, Timer};
use embedded_hal::digital::OutputPin;

/// Default flash duration in milliseconds
const LED_FLASH_MS: u64 = 50;

/// LED flash duration configuration
#[derive(Clone, Copy)]
pub enum LedFlash {
    /// Use the default flash duration
    Default,
    /// Use a custom flash duration in milliseconds
    Ms(u64),
}

/// Channel for LED flash signals
pub static LED_CHANNEL: Channel<CriticalSectionRawMutex, LedFlash, 4> = Channel::new();

pub type LedSender = Sender<'static, CriticalSectionRawMutex, LedFlash, 4>;
pub type LedReceiver = Receiver<'static, CriticalSectionRawMutex, LedFlash, 4>;

/// Task that handles LED flashing without blocking other operations
pub async fn led_task<P: OutputPin>(mut led: P, receiver: LedReceiver) -> ! {
    loop {
        let flash = receiver.receive().await;
        let duration_ms = match flash {
            LedFlash::Default => LED_FLASH_MS,
            LedFlash::Ms(ms) => ms,
        };

        // Flash LED (turn off then back on, since active low)
        let _ = led.set_high();
        Timer::after(Duration::from_millis(duration_ms)).await;
        let _ = led.set_low();
    }
}
