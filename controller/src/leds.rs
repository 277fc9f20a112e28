use std::{thread, time::Duration};

use anyhow::Context;
use esp_idf_hal::{
    gpio::OutputPin,
    peripheral::Peripheral,
    rmt::{
        config::TransmitConfig, PinState, Pulse, PulseTicks, RmtChannel, TxRmtDriver,
        VariableLengthSignal,
    },
};
use log::warn;
use smart_leds::RGB8;

use wordclock_common::{LedSink, LED_COUNT};

/// 80 MHz APB clock / 2 = 25 ns per tick.
const WS2812_TICK_DIVIDER: u8 = 2;
const T0H_TICKS: u16 = 16;
const T0L_TICKS: u16 = 34;
const T1H_TICKS: u16 = 32;
const T1L_TICKS: u16 = 18;
const LATCH_US: u64 = 80;
const PULSES_PER_FRAME: usize = LED_COUNT * 24 * 2;

enum StripBackend {
    Rmt {
        tx: TxRmtDriver<'static>,
        zero: [Pulse; 2],
        one: [Pulse; 2],
    },
    Disabled,
}

/// WS2812 chain on one RMT channel, GRB order.
pub struct LedStrip {
    backend: StripBackend,
    pixels: [RGB8; LED_COUNT],
    failed_frames: u64,
}

impl LedStrip {
    pub fn new<C, P>(
        channel: impl Peripheral<P = C> + 'static,
        pin: impl Peripheral<P = P> + 'static,
    ) -> anyhow::Result<Self>
    where
        C: RmtChannel,
        P: OutputPin,
    {
        let config = TransmitConfig::new()
            .clock_divider(WS2812_TICK_DIVIDER)
            .idle(Some(PinState::Low));
        let tx = TxRmtDriver::new(channel, pin, &config).context("failed to init RMT LED driver")?;

        let pulse = |level, ticks| -> anyhow::Result<Pulse> {
            Ok(Pulse::new(
                level,
                PulseTicks::new(ticks).context("invalid WS2812 pulse width")?,
            ))
        };
        let zero = [pulse(PinState::High, T0H_TICKS)?, pulse(PinState::Low, T0L_TICKS)?];
        let one = [pulse(PinState::High, T1H_TICKS)?, pulse(PinState::Low, T1L_TICKS)?];

        Ok(Self {
            backend: StripBackend::Rmt { tx, zero, one },
            pixels: [RGB8::default(); LED_COUNT],
            failed_frames: 0,
        })
    }

    pub fn disabled() -> Self {
        Self {
            backend: StripBackend::Disabled,
            pixels: [RGB8::default(); LED_COUNT],
            failed_frames: 0,
        }
    }

    fn transmit(&mut self) -> anyhow::Result<()> {
        let StripBackend::Rmt { tx, zero, one } = &mut self.backend else {
            return Ok(());
        };

        let mut signal = VariableLengthSignal::with_capacity(PULSES_PER_FRAME);
        for pixel in &self.pixels {
            for byte in [pixel.g, pixel.r, pixel.b] {
                for bit in (0..8).rev() {
                    let symbol = if (byte >> bit) & 1 == 1 { &*one } else { &*zero };
                    signal
                        .push(symbol.iter())
                        .context("failed to encode LED frame")?;
                }
            }
        }

        tx.start_blocking(&signal)
            .context("failed to transmit LED frame over RMT")?;
        thread::sleep(Duration::from_micros(LATCH_US));
        Ok(())
    }
}

impl LedSink for LedStrip {
    fn set_pixel(&mut self, index: usize, color: RGB8) {
        if let Some(pixel) = self.pixels.get_mut(index) {
            *pixel = color;
        }
    }

    fn flush(&mut self) {
        if let Err(err) = self.transmit() {
            self.failed_frames = self.failed_frames.saturating_add(1);
            if self.failed_frames == 1 || self.failed_frames % 100 == 0 {
                warn!("LED frame dropped ({} so far): {err:#}", self.failed_frames);
            }
        }
    }
}
