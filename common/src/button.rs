use crate::state::StateFlags;

pub const SAMPLE_PERIOD_MS: u64 = 100;
pub const LONG_PRESS_MS: u64 = 10_000;
pub const LONG_PRESS_SAMPLES: u32 = (LONG_PRESS_MS / SAMPLE_PERIOD_MS) as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEvent {
    Toggle,
    FactoryReset,
}

/// Front-panel button, sampled at 10 Hz.
///
/// A pressed sample toggles the relay only when the previous sample armed
/// `DEBOUNCE_TIMEOUT` by reading released; holding the button for
/// [`LONG_PRESS_SAMPLES`] consecutive samples requests a factory reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Button {
    held: u32,
}

impl Button {
    pub fn held_samples(&self) -> u32 {
        self.held
    }

    pub fn sample(&mut self, pressed: bool, flags: &mut StateFlags) -> Option<ButtonEvent> {
        if !pressed {
            self.held = 0;
            flags.insert(StateFlags::DEBOUNCE_TIMEOUT);
            return None;
        }

        self.held = self.held.saturating_add(1);

        if flags.contains(StateFlags::DEBOUNCE_TIMEOUT) {
            flags.remove(StateFlags::DEBOUNCE_TIMEOUT);
            return Some(ButtonEvent::Toggle);
        }

        (self.held == LONG_PRESS_SAMPLES).then_some(ButtonEvent::FactoryReset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn press_after_release_toggles_once() {
        let mut button = Button::default();
        let mut flags = StateFlags::empty();

        assert_eq!(button.sample(false, &mut flags), None);
        assert!(flags.contains(StateFlags::DEBOUNCE_TIMEOUT));
        assert_eq!(button.sample(true, &mut flags), Some(ButtonEvent::Toggle));
        assert_eq!(button.sample(true, &mut flags), None);
        assert_eq!(button.sample(true, &mut flags), None);
        assert_eq!(button.sample(false, &mut flags), None);
        assert_eq!(button.sample(true, &mut flags), Some(ButtonEvent::Toggle));
    }

    #[test]
    fn press_held_through_boot_does_not_toggle() {
        let mut button = Button::default();
        let mut flags = StateFlags::empty();
        assert_eq!(button.sample(true, &mut flags), None);
    }

    #[test]
    fn long_press_requests_factory_reset_once() {
        let mut button = Button::default();
        let mut flags = StateFlags::empty();
        button.sample(false, &mut flags);

        let events: Vec<_> = (0..150)
            .filter_map(|_| button.sample(true, &mut flags))
            .collect();
        assert_eq!(events, vec![ButtonEvent::Toggle, ButtonEvent::FactoryReset]);
        assert_eq!(button.held_samples(), 150);
    }

    #[test]
    fn release_restarts_long_press_count() {
        let mut button = Button::default();
        let mut flags = StateFlags::empty();
        for _ in 0..99 {
            button.sample(true, &mut flags);
        }
        button.sample(false, &mut flags);
        assert_eq!(button.held_samples(), 0);

        let resets = (0..99)
            .filter_map(|_| button.sample(true, &mut flags))
            .filter(|event| *event == ButtonEvent::FactoryReset)
            .count();
        assert_eq!(resets, 0);
    }
}
