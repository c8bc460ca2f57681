//! Persistent energy counters and power history in byte-addressable FRAM.
//!
//! Offset 0 holds a 16-byte CRC-protected [`NvHeader`]; from offset 128 a
//! ring of 12-byte [`LogEntry`] records fills the rest of the 32 KiB part.

use log::{debug, warn};
use thiserror::Error;

use crate::crc::crc16_ccitt;
use crate::energy;

pub const NV_SIZE: u32 = 32 * 1024;
pub const NV_VERSION: u8 = 1;
pub const HEADER_OFFSET: u32 = 0;
pub const LOG_OFFSET: u32 = 128;
pub const LOG_CAPACITY: u16 = ((NV_SIZE - LOG_OFFSET) / LogEntry::LEN as u32) as u16;

#[derive(Debug, Error)]
pub enum NvError {
    #[error("nvram bus error: {0}")]
    Bus(String),
    #[error("nvram access of {len} bytes at {offset:#06x} is out of range")]
    OutOfRange { offset: u32, len: usize },
}

/// Raw byte access to the non-volatile part.
pub trait Nvram {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), NvError>;
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), NvError>;
}

impl<T: Nvram + ?Sized> Nvram for &mut T {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), NvError> {
        (**self).read(offset, buf)
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), NvError> {
        (**self).write(offset, data)
    }
}

/// RAM-backed part, used by tests and as the host simulator's image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemNvram {
    bytes: Vec<u8>,
}

impl MemNvram {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    pub fn from_bytes(mut bytes: Vec<u8>, size: usize) -> Self {
        bytes.resize(size, 0);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn range(&self, offset: u32, len: usize) -> Result<std::ops::Range<usize>, NvError> {
        let start = offset as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.bytes.len() => Ok(start..end),
            _ => Err(NvError::OutOfRange { offset, len }),
        }
    }
}

impl Default for MemNvram {
    fn default() -> Self {
        Self::new(NV_SIZE as usize)
    }
}

impl Nvram for MemNvram {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), NvError> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), NvError> {
        let range = self.range(offset, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NvHeader {
    pub version: u8,
    pub state: u8,
    pub first: u16,
    pub last: u16,
    pub ovflow: u32,
    pub pulses: u16,
    pub restored_pulses: u16,
    pub crc: u16,
}

impl NvHeader {
    pub const LEN: usize = 16;

    pub fn fresh() -> Self {
        Self {
            version: NV_VERSION,
            ..Self::default()
        }
    }

    pub fn from_bytes(bytes: &[u8; Self::LEN]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        Self {
            version: bytes[0],
            state: bytes[1],
            first: u16_at(2),
            last: u16_at(4),
            ovflow: u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
            pulses: u16_at(10),
            restored_pulses: u16_at(12),
            crc: u16_at(14),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];
        bytes[0] = self.version;
        bytes[1] = self.state;
        bytes[2..4].copy_from_slice(&self.first.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.last.to_le_bytes());
        bytes[6..10].copy_from_slice(&self.ovflow.to_le_bytes());
        bytes[10..12].copy_from_slice(&self.pulses.to_le_bytes());
        bytes[12..14].copy_from_slice(&self.restored_pulses.to_le_bytes());
        bytes[14..16].copy_from_slice(&self.crc.to_le_bytes());
        bytes
    }

    pub fn compute_crc(&self) -> u16 {
        crc16_ccitt(&self.to_bytes()[..Self::LEN - 2])
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogEntry {
    pub time: i64,
    pub power: f32,
}

impl LogEntry {
    pub const LEN: usize = 12;

    pub fn from_bytes(bytes: &[u8; Self::LEN]) -> Self {
        let mut time = [0u8; 8];
        time.copy_from_slice(&bytes[..8]);
        Self {
            time: i64::from_le_bytes(time),
            power: f32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];
        bytes[..8].copy_from_slice(&self.time.to_le_bytes());
        bytes[8..].copy_from_slice(&self.power.to_le_bytes());
        bytes
    }
}

/// Owner of the FRAM part: header bookkeeping plus the history ring.
#[derive(Debug)]
pub struct NvStore<N> {
    nv: N,
    header: NvHeader,
    capacity: u16,
    reinitialized: bool,
}

impl<N: Nvram> NvStore<N> {
    pub fn open(nv: N) -> Result<Self, NvError> {
        Self::with_capacity(nv, LOG_CAPACITY)
    }

    /// Reads and validates the header. A version or CRC mismatch, or ring
    /// indices beyond `capacity`, reinitializes the header in place.
    pub fn with_capacity(mut nv: N, capacity: u16) -> Result<Self, NvError> {
        let mut raw = [0u8; NvHeader::LEN];
        nv.read(HEADER_OFFSET, &mut raw)?;
        let header = NvHeader::from_bytes(&raw);

        let valid = header.version == NV_VERSION
            && header.crc == header.compute_crc()
            && header.first < capacity
            && header.last < capacity;

        let mut store = Self {
            nv,
            header,
            capacity,
            reinitialized: false,
        };

        if !valid {
            warn!(
                "nv header invalid (version {}, crc {:#06x}); reinitializing",
                header.version, header.crc
            );
            store.header = NvHeader::fresh();
            store.reinitialized = true;
            store.flush_header()?;
        }
        Ok(store)
    }

    pub fn header(&self) -> &NvHeader {
        &self.header
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// True when `open` found no valid header.
    pub fn reinitialized(&self) -> bool {
        self.reinitialized
    }

    /// Mirrors the live counters into the header; written on the next flush.
    pub fn set_counters(&mut self, ovflow: u32, pulses: u16) {
        self.header.ovflow = ovflow;
        self.header.pulses = pulses;
    }

    /// Folds the last-seen pulse count into `restored_pulses` after a
    /// power-on reset. Returns `(ovflow, restored_pulses)`.
    pub fn restore_after_power_on(&mut self) -> (u32, u16) {
        let (ovflow, restored) = energy::restore_after_power_on(
            self.header.ovflow,
            self.header.pulses,
            self.header.restored_pulses,
        );
        debug!(
            "cold boot: pulses {} + restored {} -> restored {}, ovflow {}",
            self.header.pulses, self.header.restored_pulses, restored, ovflow
        );
        self.header.ovflow = ovflow;
        self.header.restored_pulses = restored;
        (ovflow, restored)
    }

    pub fn flush_header(&mut self) -> Result<(), NvError> {
        self.header.crc = self.header.compute_crc();
        self.nv.write(HEADER_OFFSET, &self.header.to_bytes())
    }

    pub fn append(&mut self, entry: LogEntry) -> Result<(), NvError> {
        self.nv
            .write(self.slot_offset(self.header.last), &entry.to_bytes())?;
        self.header.last = (self.header.last + 1) % self.capacity;
        if self.header.last == self.header.first {
            self.header.first = (self.header.first + 1) % self.capacity;
        }
        self.flush_header()
    }

    pub fn len(&self) -> u16 {
        (self.header.last + self.capacity - self.header.first) % self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.header.first == self.header.last
    }

    /// Oldest-first walk over the ring.
    pub fn entries(&mut self) -> Entries<'_, N> {
        Entries {
            store: self,
            index: 0,
        }
    }

    fn slot_offset(&self, slot: u16) -> u32 {
        LOG_OFFSET + u32::from(slot) * LogEntry::LEN as u32
    }

    fn read_slot(&mut self, slot: u16) -> Result<LogEntry, NvError> {
        let mut raw = [0u8; LogEntry::LEN];
        self.nv.read(self.slot_offset(slot), &mut raw)?;
        Ok(LogEntry::from_bytes(&raw))
    }

    pub fn into_inner(self) -> N {
        self.nv
    }
}

pub struct Entries<'a, N> {
    store: &'a mut NvStore<N>,
    index: u16,
}

impl<N: Nvram> Iterator for Entries<'_, N> {
    type Item = Result<LogEntry, NvError>;

    fn next(&mut self) -> Option<Self::Item> {
        let capacity = self.store.capacity;
        if self.index >= capacity {
            return None;
        }
        let slot = ((u32::from(self.index) + u32::from(self.store.header.first))
            % u32::from(capacity)) as u16;
        if slot == self.store.header.last {
            return None;
        }
        self.index += 1;
        Some(self.store.read_slot(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(n: i64) -> LogEntry {
        LogEntry {
            time: 1_700_000_000 + n * 10,
            power: n as f32,
        }
    }

    fn collect<N: Nvram>(store: &mut NvStore<N>) -> Vec<LogEntry> {
        store.entries().collect::<Result<_, _>>().unwrap()
    }

    #[test]
    fn capacity_matches_part_size() {
        assert_eq!(LOG_CAPACITY, 2720);
    }

    #[test]
    fn blank_part_is_reinitialized_with_valid_crc() {
        let mut nv = MemNvram::default();
        let store = NvStore::open(&mut nv).unwrap();
        assert!(store.reinitialized());
        assert_eq!(store.header().version, NV_VERSION);
        assert!(store.is_empty());

        let mut raw = [0u8; NvHeader::LEN];
        raw.copy_from_slice(&nv.as_bytes()[..NvHeader::LEN]);
        let header = NvHeader::from_bytes(&raw);
        assert_eq!(header.crc, crc16_ccitt(&raw[..NvHeader::LEN - 2]));
    }

    #[test]
    fn valid_header_survives_reopen() {
        let mut nv = MemNvram::default();
        {
            let mut store = NvStore::open(&mut nv).unwrap();
            store.set_counters(7, 1234);
            store.append(entry(1)).unwrap();
        }
        let store = NvStore::open(&mut nv).unwrap();
        assert!(!store.reinitialized());
        assert_eq!(store.header().ovflow, 7);
        assert_eq!(store.header().pulses, 1234);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn corrupted_header_loses_history() {
        let mut nv = MemNvram::default();
        {
            let mut store = NvStore::open(&mut nv).unwrap();
            store.set_counters(3, 99);
            store.append(entry(1)).unwrap();
        }
        nv.write(6, &[0xFF]).unwrap();

        let mut store = NvStore::open(&mut nv).unwrap();
        assert!(store.reinitialized());
        assert_eq!(*store.header(), {
            let mut fresh = NvHeader::fresh();
            fresh.crc = fresh.compute_crc();
            fresh
        });
        assert_eq!(collect(&mut store), Vec::<LogEntry>::new());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut nv = MemNvram::default();
        let mut header = NvHeader {
            version: 2,
            ovflow: 11,
            ..NvHeader::default()
        };
        header.crc = header.compute_crc();
        nv.write(0, &header.to_bytes()).unwrap();

        let store = NvStore::open(&mut nv).unwrap();
        assert!(store.reinitialized());
        assert_eq!(store.header().ovflow, 0);
    }

    #[test]
    fn appends_in_order_before_wrap() {
        let mut store = NvStore::with_capacity(MemNvram::default(), 5).unwrap();
        for n in 1..=4 {
            store.append(entry(n)).unwrap();
        }
        assert_eq!(store.header().first, 0);
        assert_eq!(store.header().last, 4);
        assert_eq!(collect(&mut store), (1..=4).map(entry).collect::<Vec<_>>());
    }

    #[test]
    fn wrap_keeps_capacity_minus_one_entries() {
        let mut store = NvStore::with_capacity(MemNvram::default(), 3).unwrap();
        for n in 1..=5 {
            store.append(entry(n)).unwrap();
        }
        assert_eq!(store.len(), 2);
        assert_eq!(collect(&mut store), vec![entry(4), entry(5)]);
    }

    #[test]
    fn header_crc_holds_after_every_append() {
        let mut nv = MemNvram::default();
        let mut store = NvStore::with_capacity(&mut nv, 4).unwrap();
        for n in 0..9 {
            store.append(entry(n)).unwrap();
            let header = *store.header();
            assert_eq!(header.crc, header.compute_crc());
        }
        drop(store);
        let reopened = NvStore::with_capacity(&mut nv, 4).unwrap();
        assert!(!reopened.reinitialized());
    }

    #[test]
    fn cold_boot_restore_folds_pulses() {
        let mut store = NvStore::open(MemNvram::default()).unwrap();
        store.set_counters(5, 60_000);
        store.header.restored_pulses = 10_000;

        assert_eq!(store.restore_after_power_on(), (6, 4464));
        assert_eq!(store.header().ovflow, 6);
        assert_eq!(store.header().restored_pulses, 4464);
        assert_eq!(store.header().pulses, 60_000);
    }

    #[test]
    fn log_entry_layout_is_packed_little_endian() {
        let bytes = LogEntry {
            time: 0x0102_0304,
            power: 1.5,
        }
        .to_bytes();
        assert_eq!(&bytes[..8], &[0x04, 0x03, 0x02, 0x01, 0, 0, 0, 0]);
        assert_eq!(&bytes[8..], &1.5f32.to_le_bytes());
    }

    #[test]
    fn out_of_range_access_fails() {
        let mut nv = MemNvram::new(16);
        let mut buf = [0u8; 4];
        assert!(matches!(
            nv.read(14, &mut buf),
            Err(NvError::OutOfRange { offset: 14, len: 4 })
        ));
    }
}
