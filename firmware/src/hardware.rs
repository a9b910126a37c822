//! ハードウェア初期化
//!
//! - パルス入力: GPIO4 立ち下がりエッジ割り込み。ハンドラはタイムスタンプを取って
//!   `CAPTURE` に渡すだけ（ブロックしない・確保しない・I/Oしない）
//! - アナログ入力: GPIO3 を ADC1 で単発変換

use core::cell::RefCell;

use critical_section::Mutex;
use embassy_time::Instant;
use esp_hal::analog::adc::{Adc, AdcConfig, AdcPin, Attenuation};
use esp_hal::gpio::{Event, Input, InputConfig, Io, Pull};
use esp_hal::handler;
use esp_hal::peripherals::{ADC1, GPIO3, GPIO4};
use esp_hal::Blocking;

use crate::state::CAPTURE;

/// 割り込みハンドラと共有するパルス入力ピン
static PULSE_INPUT: Mutex<RefCell<Option<Input<'static>>>> = Mutex::new(RefCell::new(None));

/// パルス入力ピンを設定する（割り込みはまだ有効にしない）
pub fn init_pulse_input(io: &mut Io<'static>, pin: GPIO4<'static>) {
    io.set_interrupt_handler(pulse_edge_handler);

    let input = Input::new(pin, InputConfig::default().with_pull(Pull::Up));
    critical_section::with(|cs| PULSE_INPUT.borrow_ref_mut(cs).replace(input));

    info!("Pulse input configured on GPIO4");
}

/// パルス割り込みを有効化
///
/// パルス集計タスクの初期化完了後に呼ぶ。ピンが設定されていなければ `false`。
pub fn arm_pulse_input() -> bool {
    critical_section::with(|cs| match PULSE_INPUT.borrow_ref_mut(cs).as_mut() {
        Some(input) => {
            input.listen(Event::FallingEdge);
            true
        }
        None => false,
    })
}

#[handler]
fn pulse_edge_handler() {
    let timestamp_us = Instant::now().as_micros();

    critical_section::with(|cs| {
        if let Some(input) = PULSE_INPUT.borrow_ref_mut(cs).as_mut() {
            if input.is_interrupt_set() {
                input.clear_interrupt();
                CAPTURE.on_edge(timestamp_us);
            }
        }
    });
}

/// 充電検出用アナログ入力
pub struct AnalogInput {
    adc: Adc<'static, ADC1<'static>, Blocking>,
    pin: AdcPin<GPIO3<'static>, ADC1<'static>>,
}

impl AnalogInput {
    pub fn new(adc1: ADC1<'static>, pin: GPIO3<'static>) -> Self {
        let mut config = AdcConfig::new();
        let pin = config.enable_pin(pin, Attenuation::_11dB);
        let adc = Adc::new(adc1, config);

        info!("Analog input configured on GPIO3 (ADC1, 11dB)");
        Self { adc, pin }
    }

    /// ADC生値（0-4095）を読み取る
    pub fn read(&mut self) -> Option<u16> {
        nb::block!(self.adc.read_oneshot(&mut self.pin)).ok()
    }
}
