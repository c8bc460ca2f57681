use core::ops::{BitOr, BitOrAssign};

/// Runtime state bits shared by every periodic callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateFlags(u8);

impl StateFlags {
    pub const RELAY: Self = Self(0x01);
    pub const DEBOUNCE_TIMEOUT: Self = Self(0x02);
    pub const FRAM_PRESENT: Self = Self(0x04);
    pub const OTA_OR_REBOOT: Self = Self(0x08);
    pub const GOT_IP_ADDRESS: Self = Self(0x10);
    pub const NTP_GOT_TIME: Self = Self(0x20);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: Self, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl BitOr for StateFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for StateFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}
