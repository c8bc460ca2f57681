pub mod button;
pub mod config;
pub mod crc;
pub mod device;
pub mod dispatch;
pub mod energy;
pub mod form;
pub mod frame;
pub mod nvram;
pub mod pages;
pub mod rng;
pub mod schedule;
pub mod state;
pub mod types;
pub mod tz;

pub use button::{Button, ButtonEvent};
pub use config::{Calibration, ConfigError, ConfigStore, DeviceConfig, Eeprom, MemEeprom};
pub use device::{Board, Device, MeterPort, SettingsChange, Task};
pub use dispatch::Dispatcher;
pub use energy::{EnergyAccumulator, OverflowToggle, PowerAverage, Toggle};
pub use form::FormFields;
pub use frame::{Frame, FrameError, FrameFields, FrameSync, Measurement, FRAME_LEN};
pub use nvram::{LogEntry, MemNvram, NvError, NvHeader, NvStore, Nvram};
pub use rng::Drand48;
pub use schedule::{DayOfWeek, DaySchedule, RelayCommand, Scheduler, WeeklySchedule};
pub use state::StateFlags;
pub use types::{BootReason, Readings, StatusSnapshot};
pub use tz::{TimeZone, TzError};
