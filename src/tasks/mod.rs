//! Embassy tasks
//!
//! Contains the async tasks for the firmware, organised by functionality.

pub mod led;
pub mod radio;

pub use led::{led_task, LedFlash, LedReceiver, LedSender, LED_CHANNEL};
pub use radio::radio_task;
