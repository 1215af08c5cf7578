//! sx1276 FSK radio driver and supporting pieces

pub mod driver;
pub mod estimator;
pub mod registers;
pub mod traits;

pub use driver::{Sx1276Fsk, Sx1276Pins};
pub use traits::{FskRadio, RadioError, RadioEvent, RadioOptions, RxQuality};
