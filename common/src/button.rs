/// Edge + duration debounce for the setup button. A hold fires once, on
/// release, and only if it lasted at least `hold_ms`.
#[derive(Debug, Clone)]
pub struct HoldButton {
    hold_ms: u64,
    pressed_since: Option<u64>,
}

impl HoldButton {
    pub fn new(hold_ms: u64) -> Self {
        Self {
            hold_ms,
            pressed_since: None,
        }
    }

    pub fn sample(&mut self, pressed: bool, now_ms: u64) -> bool {
        match (pressed, self.pressed_since) {
            (true, None) => {
                self.pressed_since = Some(now_ms);
                false
            }
            (false, Some(since)) => {
                self.pressed_since = None;
                now_ms.saturating_sub(since) >= self.hold_ms
            }
            _ => false,
        }
    }

    pub fn reset(&mut self) {
        self.pressed_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_press_is_ignored() {
        let mut button = HoldButton::new(3_000);
        assert!(!button.sample(true, 100));
        assert!(!button.sample(true, 2_000));
        assert!(!button.sample(false, 3_099));
    }

    #[test]
    fn long_press_fires_on_release_only() {
        let mut button = HoldButton::new(3_000);
        assert!(!button.sample(true, 100));
        assert!(!button.sample(true, 5_000));
        assert!(button.sample(false, 5_050));
        assert!(!button.sample(false, 5_100));
    }

    #[test]
    fn reset_drops_a_press_in_progress() {
        let mut button = HoldButton::new(3_000);
        button.sample(true, 0);
        button.reset();
        assert!(!button.sample(false, 4_000));
    }
}
