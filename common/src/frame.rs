//! Decoder for the periodic 24-byte packet emitted by the CSE7759B metering
//! front-end at 4800 baud.
//!
//! Layout (big-endian multi-byte fields):
//!
//! | bytes  | field |
//! |--------|-------|
//! | 0      | status (`0x55` calibrated, `0xAA` uncalibrated, `0xFx` abnormal + cycle-exceeded bits) |
//! | 1      | `0x5A` |
//! | 2..=4  | kV voltage coefficient |
//! | 5..=7  | tV voltage period |
//! | 8..=10 | kI current coefficient |
//! | 11..=13| tI current period |
//! | 14..=16| kP power coefficient |
//! | 17..=19| tP power period |
//! | 20     | adjustment status |
//! | 21..=22| CF pulse counter |
//! | 23     | checksum of bytes 2..=22 |

use thiserror::Error;

use crate::config::Calibration;

pub const FRAME_LEN: usize = 24;

const HEADER_SECOND: u8 = 0x5A;

pub const STATUS_CALIBRATED: u8 = 0x55;
pub const STATUS_UNCALIBRATED: u8 = 0xAA;
const STATUS_ABNORMAL: u8 = 0xF0;
const STATUS_POWER_CYCLE_EXCEEDED: u8 = 0x02;
const STATUS_VOLTAGE_CYCLE_EXCEEDED: u8 = 0x08;

pub const ADJ_CAL_SEL_MASK: u8 = 0x07;
pub const ADJ_POWER_CYCLE_COMPLETE: u8 = 0x10;
pub const ADJ_CURRENT_CYCLE_COMPLETE: u8 = 0x20;
pub const ADJ_VOLTAGE_CYCLE_COMPLETE: u8 = 0x40;
pub const ADJ_PULSE_OVERFLOW: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame checksum mismatch")]
    Crc,
    #[error("metering front-end reports uncalibrated status")]
    Calibration,
    #[error("measurement out of range")]
    OutOfRange,
    #[error("no complete frame available")]
    Timeout,
    #[error("unknown front-end identifier")]
    UnknownId,
    #[error("unspecified front-end error")]
    Other,
}

/// Byte-stream framer. Synchronizes on `{0x55 | 0xF0..=0xFF, 0x5A}` and
/// hands out aligned 24-byte frames; validation happens in [`Frame::parse`].
#[derive(Debug, Clone)]
pub struct FrameSync {
    buf: [u8; FRAME_LEN],
    index: usize,
}

impl Default for FrameSync {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSync {
    pub fn new() -> Self {
        Self {
            buf: [0; FRAME_LEN],
            index: 0,
        }
    }

    /// Bytes held toward the next frame.
    pub fn pending(&self) -> usize {
        self.index
    }

    pub fn push(&mut self, byte: u8) -> Option<[u8; FRAME_LEN]> {
        match self.index {
            0 if byte != STATUS_CALIBRATED && byte < STATUS_ABNORMAL => return None,
            1 if byte != HEADER_SECOND => {
                self.index = 0;
                return None;
            }
            _ => {}
        }

        self.buf[self.index] = byte;
        self.index += 1;

        if self.index == FRAME_LEN {
            self.index = 0;
            Some(self.buf)
        } else {
            None
        }
    }

    /// Consumes bytes until the first complete frame. Returns the frame and
    /// the number of bytes consumed; trailing bytes are left to the caller.
    pub fn feed(&mut self, bytes: &[u8]) -> (Option<[u8; FRAME_LEN]>, usize) {
        for (consumed, byte) in bytes.iter().enumerate() {
            if let Some(frame) = self.push(*byte) {
                return (Some(frame), consumed + 1);
            }
        }
        (None, bytes.len())
    }
}

/// A checksum-valid frame from a calibrated front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    bytes: [u8; FRAME_LEN],
}

/// Quantities derived from one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Measurement {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub pulses: u16,
    pub overflow_bit: bool,
    pub kp: u32,
}

impl Frame {
    pub fn parse(bytes: &[u8; FRAME_LEN]) -> Result<Self, FrameError> {
        if checksum(bytes) != bytes[FRAME_LEN - 1] {
            return Err(FrameError::Crc);
        }
        if bytes[0] == STATUS_UNCALIBRATED {
            return Err(FrameError::Calibration);
        }
        Ok(Self { bytes: *bytes })
    }

    pub fn status(&self) -> u8 {
        self.bytes[0]
    }

    pub fn adjustment(&self) -> u8 {
        self.bytes[20]
    }

    pub fn kv(&self) -> u32 {
        be24(&self.bytes[2..5])
    }

    pub fn tv(&self) -> u32 {
        be24(&self.bytes[5..8])
    }

    pub fn ki(&self) -> u32 {
        be24(&self.bytes[8..11])
    }

    pub fn ti(&self) -> u32 {
        be24(&self.bytes[11..14])
    }

    pub fn kp(&self) -> u32 {
        be24(&self.bytes[14..17])
    }

    pub fn tp(&self) -> u32 {
        be24(&self.bytes[17..20])
    }

    pub fn pulses(&self) -> u16 {
        u16::from_be_bytes([self.bytes[21], self.bytes[22]])
    }

    pub fn overflow_bit(&self) -> bool {
        self.adjustment() & ADJ_PULSE_OVERFLOW != 0
    }

    fn exceeded(&self, flag: u8) -> bool {
        let status = self.status();
        status & STATUS_ABNORMAL != 0 && status & flag != 0
    }

    fn complete(&self, flag: u8) -> bool {
        self.adjustment() & flag != 0
    }

    /// Applies the per-unit calibration and the cycle-complete / cycle-exceeded
    /// gating: an unavailable voltage zeroes V, an unavailable power cycle
    /// zeroes both P and I.
    pub fn measure(&self, calibration: &Calibration) -> Measurement {
        let mut measurement = Measurement {
            pulses: self.pulses(),
            overflow_bit: self.overflow_bit(),
            kp: self.kp(),
            ..Measurement::default()
        };

        if !self.exceeded(STATUS_VOLTAGE_CYCLE_EXCEEDED)
            && self.complete(ADJ_VOLTAGE_CYCLE_COMPLETE)
        {
            measurement.voltage = scaled(calibration.voltage, self.kv(), self.tv());
        }

        if !self.exceeded(STATUS_POWER_CYCLE_EXCEEDED) && self.complete(ADJ_POWER_CYCLE_COMPLETE)
        {
            measurement.power = scaled(calibration.power, self.kp(), self.tp());

            if self.complete(ADJ_CURRENT_CYCLE_COMPLETE) {
                measurement.current = scaled(calibration.current, self.ki(), self.ti());
            }
        }

        measurement
    }
}

fn scaled(factor: f32, coefficient: u32, period: u32) -> f64 {
    if period == 0 {
        return 0.0;
    }
    f64::from(factor) * f64::from(coefficient) / f64::from(period)
}

fn be24(bytes: &[u8]) -> u32 {
    u32::from(bytes[0]) << 16 | u32::from(bytes[1]) << 8 | u32::from(bytes[2])
}

pub fn checksum(bytes: &[u8; FRAME_LEN]) -> u8 {
    bytes[2..FRAME_LEN - 1]
        .iter()
        .fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// Field values for building a frame, used by the host simulator and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFields {
    pub status: u8,
    pub kv: u32,
    pub tv: u32,
    pub ki: u32,
    pub ti: u32,
    pub kp: u32,
    pub tp: u32,
    pub adjustment: u8,
    pub pulses: u16,
}

impl Default for FrameFields {
    fn default() -> Self {
        Self {
            status: STATUS_CALIBRATED,
            kv: 0,
            tv: 0,
            ki: 0,
            ti: 0,
            kp: 0,
            tp: 0,
            adjustment: ADJ_VOLTAGE_CYCLE_COMPLETE
                | ADJ_CURRENT_CYCLE_COMPLETE
                | ADJ_POWER_CYCLE_COMPLETE,
            pulses: 0,
        }
    }
}

impl FrameFields {
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut bytes = [0u8; FRAME_LEN];
        bytes[0] = self.status;
        bytes[1] = HEADER_SECOND;
        for (start, value) in [
            (2, self.kv),
            (5, self.tv),
            (8, self.ki),
            (11, self.ti),
            (14, self.kp),
            (17, self.tp),
        ] {
            bytes[start..start + 3].copy_from_slice(&value.to_be_bytes()[1..]);
        }
        bytes[20] = self.adjustment;
        bytes[21..23].copy_from_slice(&self.pulses.to_be_bytes());
        bytes[FRAME_LEN - 1] = checksum(&bytes);
        bytes
    }
}
