use smart_leds::{
    brightness, colors,
    hsv::{hsv2rgb, Hsv},
    RGB8,
};

use crate::{time::Ticker, words::SegmentSet};

pub const LED_COUNT: usize = 56;

const HUE_GREEN: u8 = 96;
const HUE_YELLOW: u8 = 64;
const HUE_BLUE: u8 = 160;
const HUE_AMBER: u8 = 24;

/// Output side of the LED strip.
pub trait LedSink {
    fn set_pixel(&mut self, index: usize, color: RGB8);
    fn flush(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pixels: [RGB8; LED_COUNT],
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            pixels: [RGB8::default(); LED_COUNT],
        }
    }
}

impl Frame {
    pub fn clear(&mut self) {
        self.pixels = [RGB8::default(); LED_COUNT];
    }

    pub fn set(&mut self, index: usize, color: RGB8) {
        if let Some(pixel) = self.pixels.get_mut(index) {
            *pixel = color;
        }
    }

    pub fn fill(&mut self, color: RGB8) {
        self.pixels = [color; LED_COUNT];
    }

    pub fn pixels(&self) -> &[RGB8] {
        &self.pixels
    }

    pub fn lit_count(&self) -> usize {
        self.pixels.iter().filter(|p| **p != RGB8::default()).count()
    }

    /// Paints the words of `segments`; the lead-in words are yellow, the rest white.
    pub fn paint_segments(&mut self, segments: &SegmentSet) {
        for segment in segments.iter() {
            let color = if segment.is_lead_in() {
                colors::YELLOW
            } else {
                colors::WHITE
            };
            for led in segment.leds() {
                self.set(*led, color);
            }
        }
    }

    pub fn write_to<S: LedSink + ?Sized>(&self, sink: &mut S, level: u8) {
        for (index, color) in brightness(self.pixels.iter().copied(), level).enumerate() {
            sink.set_pixel(index, color);
        }
        sink.flush();
    }
}

/// Maps a 12-bit light sensor reading onto 10..=255.
pub fn ambient_brightness(raw: u16) -> u8 {
    let raw = u32::from(raw.min(4_095));
    (10 + raw * 245 / 4_095) as u8
}

fn hue(hue: u8, val: u8) -> RGB8 {
    hsv2rgb(Hsv { hue, sat: 255, val })
}

/// Triangle wave over 0..=255 stepping `step` per tick.
fn breathe(tick: u32, step: u32) -> u8 {
    let phase = tick.wrapping_mul(step) % 510;
    if phase > 255 {
        (510 - phase) as u8
    } else {
        phase as u8
    }
}

/// Whole-face blue pulse shown while the setup portal is open.
pub fn portal_frame(tick: u32) -> Frame {
    let mut frame = Frame::default();
    frame.fill(hue(HUE_BLUE, breathe(tick, 10)));
    frame
}

/// Slow amber pulse: a downloaded image is waiting to be installed by hand.
pub fn manual_update_frame(tick: u32) -> Frame {
    let mut frame = Frame::default();
    frame.fill(hue(HUE_AMBER, breathe(tick, 4).max(24)));
    frame
}

/// Green bar with a yellow head proportional to `percent`.
pub fn progress_frame(percent: u8) -> Frame {
    let mut frame = Frame::default();
    let lit = usize::from(percent.min(100)) * LED_COUNT / 100;
    for index in 0..lit {
        frame.set(index, hue(HUE_GREEN, 255));
    }
    if lit < LED_COUNT {
        frame.set(lit, hue(HUE_YELLOW, 255));
    }
    frame
}

pub fn flash<L, T>(
    sink: &mut L,
    ticker: &mut T,
    color: RGB8,
    times: u32,
    on_ms: u64,
    off_ms: u64,
    level: u8,
)
where
    L: LedSink + ?Sized,
    T: Ticker + ?Sized,
{
    let mut frame = Frame::default();
    for _ in 0..times {
        frame.fill(color);
        frame.write_to(sink, level);
        ticker.sleep_ms(on_ms);
        frame.clear();
        frame.write_to(sink, level);
        ticker.sleep_ms(off_ms);
    }
}

pub fn success_flash<L, T>(sink: &mut L, ticker: &mut T, level: u8)
where
    L: LedSink + ?Sized,
    T: Ticker + ?Sized,
{
    flash(sink, ticker, colors::GREEN, 3, 500, 200, level);
}

pub fn failure_flash<L, T>(sink: &mut L, ticker: &mut T, level: u8)
where
    L: LedSink + ?Sized,
    T: Ticker + ?Sized,
{
    flash(sink, ticker, colors::RED, 5, 300, 200, level);
}

/// Rainbow fill one LED at a time, then a fade out.
pub fn startup_sweep<L, T>(sink: &mut L, ticker: &mut T, level: u8)
where
    L: LedSink + ?Sized,
    T: Ticker + ?Sized,
{
    let mut frame = Frame::default();
    for index in 0..LED_COUNT {
        frame.set(index, hue((index * 256 / LED_COUNT) as u8, 255));
        frame.write_to(sink, level);
        ticker.sleep_ms(20);
    }
    for step in (0..8u8).rev() {
        frame.write_to(sink, level / 8 * step);
        ticker.sleep_ms(40);
    }
    Frame::default().write_to(sink, level);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::words::{render, Segment};

    #[derive(Default)]
    struct RecordingStrip {
        pixels: Vec<RGB8>,
        flushes: usize,
    }

    #[derive(Default)]
    struct SleepCounter {
        slept_ms: u64,
    }

    impl LedSink for RecordingStrip {
        fn set_pixel(&mut self, index: usize, color: RGB8) {
            if self.pixels.len() <= index {
                self.pixels.resize(index + 1, RGB8::default());
            }
            self.pixels[index] = color;
        }

        fn flush(&mut self) {
            self.flushes += 1;
        }
    }

    impl Ticker for SleepCounter {
        fn now_ms(&self) -> u64 {
            self.slept_ms
        }

        fn sleep_ms(&mut self, ms: u64) {
            self.slept_ms += ms;
        }
    }

    #[test]
    fn lead_in_words_are_yellow_and_others_white() {
        let mut frame = Frame::default();
        frame.paint_segments(&render(14, 30));

        for led in Segment::Het.leds() {
            assert_eq!(frame.pixels()[*led], colors::YELLOW);
        }
        for led in Segment::Half.leds() {
            assert_eq!(frame.pixels()[*led], colors::WHITE);
        }
        for led in Segment::Over.leds() {
            assert_eq!(frame.pixels()[*led], RGB8::default());
        }
    }

    #[test]
    fn full_brightness_writes_frame_unchanged() {
        let mut frame = Frame::default();
        frame.paint_segments(&render(8, 0));
        let mut strip = RecordingStrip::default();

        frame.write_to(&mut strip, 255);
        assert_eq!(strip.pixels.as_slice(), frame.pixels());
        assert_eq!(strip.flushes, 1);
    }

    #[test]
    fn zero_brightness_blanks_output() {
        let mut frame = Frame::default();
        frame.fill(colors::WHITE);
        let mut strip = RecordingStrip::default();

        frame.write_to(&mut strip, 0);
        assert!(strip.pixels.iter().all(|p| *p == RGB8::default()));
    }

    #[test]
    fn ambient_reading_maps_to_brightness_range() {
        assert_eq!(ambient_brightness(0), 10);
        assert_eq!(ambient_brightness(4_095), 255);
        assert_eq!(ambient_brightness(u16::MAX), 255);
    }

    #[test]
    fn progress_bar_grows_with_percent() {
        assert_eq!(progress_frame(0).lit_count(), 1);
        assert_eq!(progress_frame(50).lit_count(), LED_COUNT / 2 + 1);
        assert_eq!(progress_frame(100).lit_count(), LED_COUNT);
    }

    #[test]
    fn failure_flash_blinks_five_times() {
        let mut strip = RecordingStrip::default();
        let mut ticker = SleepCounter::default();
        failure_flash(&mut strip, &mut ticker, 255);
        assert_eq!(strip.flushes, 10);
        assert_eq!(ticker.slept_ms, 5 * 500);
    }

    #[test]
    fn portal_pulse_breathes() {
        assert_eq!(breathe(0, 10), 0);
        assert_eq!(breathe(25, 10), 250);
        assert_eq!(breathe(30, 10), 210);
        assert_ne!(portal_frame(10), portal_frame(11));
    }
}
