#![no_std]
#![no_main]

// Required for ESP-IDF bootloader compatibility
// Use explicit parameters to ensure correct efuse block revision values
esp_bootloader_esp_idf::esp_app_desc!(
    env!("CARGO_PKG_VERSION"),  // version
    env!("CARGO_PKG_NAME"),     // project_name
    "00:00:00",                 // build_time
    "2025-01-01",               // build_date
    "0.0.0",                    // idf_ver (not using IDF)
    0x10000,                    // mmu_page_size (64KB)
    0,                          // min_efuse_blk_rev_full (accept all)
    u16::MAX                    // max_efuse_blk_rev_full (accept all)
);

use embassy_executor::Spawner;
use esp_backtrace as _;
use esp_hal::gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull};
use esp_hal::spi::master::{Config as SpiConfig, Spi};
use esp_hal::spi::Mode as SpiMode;
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::Async;
use heapless::Vec;
use log::info;
use static_cell::StaticCell;

mod config;
mod link;
mod protocol;
mod radio;
mod tasks;

use link::RX_PACKET_CHANNEL;
use protocol::jeelabs::gen_sync_bytes;
use radio::driver::{Sx1276Fsk, Sx1276Pins};
use radio::traits::RadioOptions;
use tasks::{led_task, radio_task, LedReceiver, LedSender, LED_CHANNEL};

/// Static executor for embassy
static EXECUTOR: StaticCell<esp_rtos::embassy::Executor> = StaticCell::new();

type Radio = Sx1276Fsk<
    Spi<'static, Async>,
    Output<'static>,
    Output<'static>,
    Input<'static>,
    Input<'static>,
>;

#[esp_hal::main]
fn main() -> ! {
    let peripherals = esp_hal::init(esp_hal::Config::default());

    esp_println::logger::init_logger_from_env();

    // Turn on LED (active low)
    let led = Output::new(peripherals.GPIO48, Level::Low, OutputConfig::default());

    // Initialise the RTOS scheduler with timer - MUST be done before any async operations
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    // Configure SPI for the radio; see config::spi for the clock ceiling
    let spi = Spi::new(
        peripherals.SPI2,
        SpiConfig::default()
            .with_frequency(Rate::from_mhz(3))
            .with_mode(SpiMode::_0),
    )
    .unwrap()
    .with_sck(peripherals.GPIO7)
    .with_miso(peripherals.GPIO8)
    .with_mosi(peripherals.GPIO9)
    .into_async();

    // Radio control pins
    let select = Output::new(peripherals.GPIO41, Level::High, OutputConfig::default());
    let reset = Output::new(peripherals.GPIO42, Level::High, OutputConfig::default());
    let dio0 = Input::new(
        peripherals.GPIO39,
        InputConfig::default().with_pull(Pull::Down),
    );
    let dio2 = Input::new(
        peripherals.GPIO38,
        InputConfig::default().with_pull(Pull::Down),
    );

    let radio = Sx1276Fsk::new(
        spi,
        Sx1276Pins {
            select,
            reset,
            dio0,
            dio2,
        },
    );

    // Create and run the embassy executor
    let executor = EXECUTOR.init(esp_rtos::embassy::Executor::new());
    executor.run(|spawner| {
        spawner.must_spawn(async_main(spawner, radio, led));
    })
}

#[embassy_executor::task]
async fn async_main(spawner: Spawner, radio: Radio, led: Output<'static>) {
    let led_sender = LED_CHANNEL.sender();
    let led_receiver = LED_CHANNEL.receiver();

    let (sync, parity) = gen_sync_bytes(config::rf_defaults::GROUP);
    let options = RadioOptions {
        frequency: Some(config::rf_defaults::FREQUENCY_HZ),
        bit_rate: Some(config::rf_defaults::BIT_RATE),
        sync: Vec::from_slice(&sync).ok(),
        ..RadioOptions::default()
    };

    spawner.spawn(led_flash_task(led, led_receiver)).unwrap();
    spawner.spawn(packet_report_task()).unwrap();
    spawner
        .spawn(radio_pump_task(radio, options, parity, led_sender))
        .unwrap();
}

/// Task that drives the radio event pump
#[embassy_executor::task]
async fn radio_pump_task(
    radio: Radio,
    options: RadioOptions,
    parity: u8,
    led_sender: LedSender,
) {
    radio_task(radio, options, parity, led_sender).await
}

/// Task that flashes the status LED on request
#[embassy_executor::task]
async fn led_flash_task(led: Output<'static>, receiver: LedReceiver) {
    led_task(led, receiver).await
}

/// Task that logs one line per accepted packet
#[embassy_executor::task]
async fn packet_report_task() {
    let mut packets = RX_PACKET_CHANNEL.subscriber().unwrap();
    loop {
        let rx = packets.next_message_pure().await;
        let p = &rx.packet;
        let dir = if p.from_gw { "TX" } else { "RX" };
        let ack = if p.want_ack { "A" } else { "-" };
        let info = if p.remote_margin.is_some() { "I" } else { "-" };
        info!(
            "PKT {} {:?}: {} vals T{} {}{} {}dBm {}dB {}Hz rem {:?}dB {:?}Hz",
            dir,
            p.node,
            p.data.len(),
            p.msg_type,
            ack,
            info,
            rx.quality.rssi_dbm,
            rx.quality.margin_db,
            rx.quality.fei_hz,
            p.remote_margin,
            p.remote_fei,
        );
    }
}
