use chrono::{Datelike, Timelike, Weekday};
use log::info;

use crate::rng::Drand48;
use crate::tz::TimeZone;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DayOfWeek {
    Sun,
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
}

impl DayOfWeek {
    pub const ALL: [Self; 7] = [
        Self::Sun,
        Self::Mon,
        Self::Tue,
        Self::Wed,
        Self::Thu,
        Self::Fri,
        Self::Sat,
    ];

    /// 0 = Sunday, as stored in the configuration record.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Self {
        Self::ALL[index % 7]
    }

    pub fn from_chrono(weekday: Weekday) -> Self {
        Self::from_index(weekday.num_days_from_sunday() as usize)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Sun => "Sunday",
            Self::Mon => "Monday",
            Self::Tue => "Tuesday",
            Self::Wed => "Wednesday",
            Self::Thu => "Thursday",
            Self::Fri => "Friday",
            Self::Sat => "Saturday",
        }
    }
}

const SCHED_ON_ENABLED: u8 = 0x01;
const SCHED_OFF_ENABLED: u8 = 0x02;
const SCHED_RANDOM: u8 = 0x04;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DaySchedule {
    pub on_enabled: bool,
    pub off_enabled: bool,
    pub randomize: bool,
    pub on_hour: u8,
    pub on_minute: u8,
    pub off_hour: u8,
    pub off_minute: u8,
}

impl DaySchedule {
    pub const LEN: usize = 5;

    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.on_enabled {
            flags |= SCHED_ON_ENABLED;
        }
        if self.off_enabled {
            flags |= SCHED_OFF_ENABLED;
        }
        if self.randomize {
            flags |= SCHED_RANDOM;
        }
        flags
    }

    pub fn from_bytes(bytes: &[u8; Self::LEN]) -> Self {
        Self {
            on_enabled: bytes[0] & SCHED_ON_ENABLED != 0,
            off_enabled: bytes[0] & SCHED_OFF_ENABLED != 0,
            randomize: bytes[0] & SCHED_RANDOM != 0,
            on_hour: bytes[1],
            on_minute: bytes[2],
            off_hour: bytes[3],
            off_minute: bytes[4],
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        [
            self.flags(),
            self.on_hour,
            self.on_minute,
            self.off_hour,
            self.off_minute,
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeeklySchedule {
    pub days: [DaySchedule; 7],
}

impl WeeklySchedule {
    pub fn day(&self, day: DayOfWeek) -> &DaySchedule {
        &self.days[day.index()]
    }

    pub fn day_mut(&mut self, day: DayOfWeek) -> &mut DaySchedule {
        &mut self.days[day.index()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayCommand {
    On,
    Off,
}

pub const JITTER_LOW: i64 = -900;
pub const JITTER_SPAN: u32 = 1800;

/// Per-day state of the weekly switch. Offsets are redrawn whenever the
/// local weekday changes and shift the configured trigger times by
/// `[-900, 900)` seconds on randomized days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduler {
    wday: Option<DayOfWeek>,
    offset_on: i64,
    offset_off: i64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            wday: None,
            offset_on: 0,
            offset_off: 0,
        }
    }

    pub fn offsets(&self) -> (i64, i64) {
        (self.offset_on, self.offset_off)
    }

    pub fn tick(
        &mut self,
        now: i64,
        tz: &TimeZone,
        schedule: &WeeklySchedule,
        relay_on: bool,
        rng: &mut Drand48,
    ) -> Option<RelayCommand> {
        let local = tz.local(now);
        let today = DayOfWeek::from_chrono(local.weekday());

        if self.wday != Some(today) {
            self.offset_on = rng.next_offset(JITTER_LOW, JITTER_SPAN);
            self.offset_off = rng.next_offset(JITTER_LOW, JITTER_SPAN);
            self.wday = Some(today);
        }

        let day = schedule.day(today);
        let (on_time, off_time) = if day.randomize {
            (
                tz.local(now - self.offset_on),
                tz.local(now - self.offset_off),
            )
        } else {
            (local, local)
        };

        let matches = |time: chrono::NaiveDateTime, hour: u8, minute: u8| {
            time.hour() == u32::from(hour) && time.minute() == u32::from(minute)
        };

        if !relay_on && day.on_enabled && matches(on_time, day.on_hour, day.on_minute) {
            info!("schedule: {} on at {}", today.name(), local.format("%H:%M:%S"));
            Some(RelayCommand::On)
        } else if relay_on && day.off_enabled && matches(off_time, day.off_hour, day.off_minute)
        {
            info!("schedule: {} off at {}", today.name(), local.format("%H:%M:%S"));
            Some(RelayCommand::Off)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    // 2026-10-18 is a Sunday.
    fn at(hour: u32, minute: u32, second: u32) -> i64 {
        NaiveDate::from_ymd_opt(2026, 10, 18)
            .unwrap()
            .and_hms_opt(hour, minute, second)
            .unwrap()
            .and_utc()
            .timestamp()
    }

    fn evening_schedule(randomize: bool) -> WeeklySchedule {
        let mut week = WeeklySchedule::default();
        *week.day_mut(DayOfWeek::Sun) = DaySchedule {
            on_enabled: true,
            off_enabled: true,
            randomize,
            on_hour: 8,
            on_minute: 0,
            off_hour: 22,
            off_minute: 0,
        };
        week
    }

    #[test]
    fn sunday_is_zero() {
        assert_eq!(DayOfWeek::from_chrono(Weekday::Sun).index(), 0);
        assert_eq!(DayOfWeek::from_chrono(Weekday::Sat).index(), 6);
        assert_eq!(DayOfWeek::from_index(8), DayOfWeek::Mon);
    }

    #[test]
    fn day_record_layout() {
        let day = DaySchedule {
            on_enabled: true,
            off_enabled: false,
            randomize: true,
            on_hour: 6,
            on_minute: 30,
            off_hour: 23,
            off_minute: 5,
        };
        assert_eq!(day.to_bytes(), [0x05, 6, 30, 23, 5]);
        assert_eq!(DaySchedule::from_bytes(&day.to_bytes()), day);
    }

    #[test]
    fn fixed_times_trigger_within_the_minute() {
        let tz = TimeZone::default();
        let week = evening_schedule(false);
        let mut rng = Drand48::seed(1);
        let mut scheduler = Scheduler::new();

        assert_eq!(scheduler.tick(at(7, 59, 59), &tz, &week, false, &mut rng), None);
        assert_eq!(
            scheduler.tick(at(8, 0, 0), &tz, &week, false, &mut rng),
            Some(RelayCommand::On)
        );
        // Relay now on: the rest of the minute is quiet.
        assert_eq!(scheduler.tick(at(8, 0, 1), &tz, &week, true, &mut rng), None);
        assert_eq!(scheduler.tick(at(8, 0, 59), &tz, &week, true, &mut rng), None);
        assert_eq!(
            scheduler.tick(at(22, 0, 30), &tz, &week, true, &mut rng),
            Some(RelayCommand::Off)
        );
        assert_eq!(scheduler.tick(at(22, 1, 0), &tz, &week, false, &mut rng), None);
    }

    #[test]
    fn randomized_offsets_shift_trigger_times() {
        let tz = TimeZone::default();
        let week = evening_schedule(true);
        let mut rng = Drand48::seed(1);
        let mut scheduler = Scheduler {
            wday: Some(DayOfWeek::Sun),
            offset_on: -300,
            offset_off: 600,
        };

        assert_eq!(scheduler.tick(at(7, 54, 59), &tz, &week, false, &mut rng), None);
        assert_eq!(
            scheduler.tick(at(7, 55, 0), &tz, &week, false, &mut rng),
            Some(RelayCommand::On)
        );
        assert_eq!(scheduler.tick(at(8, 0, 0), &tz, &week, false, &mut rng), None);
        assert_eq!(scheduler.tick(at(22, 0, 0), &tz, &week, true, &mut rng), None);
        assert_eq!(
            scheduler.tick(at(22, 10, 0), &tz, &week, true, &mut rng),
            Some(RelayCommand::Off)
        );
        assert_eq!(scheduler.offsets(), (-300, 600));
    }

    #[test]
    fn offsets_redrawn_once_per_day_within_window() {
        let tz = TimeZone::default();
        let week = WeeklySchedule::default();
        let mut rng = Drand48::seed(1_760_000_000);
        let mut scheduler = Scheduler::new();

        scheduler.tick(at(0, 0, 5), &tz, &week, false, &mut rng);
        let first = scheduler.offsets();
        for second in [60, 3600, 43_200, 86_000] {
            scheduler.tick(at(0, 0, 5) + second, &tz, &week, false, &mut rng);
            assert_eq!(scheduler.offsets(), first);
        }
        for offset in [first.0, first.1] {
            assert!((JITTER_LOW..JITTER_LOW + i64::from(JITTER_SPAN)).contains(&offset));
        }

        // Monday draws a fresh pair from the same stream.
        let mut replay = Drand48::seed(1_760_000_000);
        replay.next_f64();
        replay.next_f64();
        let expected = (
            replay.next_offset(JITTER_LOW, JITTER_SPAN),
            replay.next_offset(JITTER_LOW, JITTER_SPAN),
        );
        scheduler.tick(at(0, 0, 5) + 86_400, &tz, &week, false, &mut rng);
        assert_eq!(scheduler.offsets(), expected);
    }

    #[test]
    fn disabled_edges_never_fire() {
        let tz = TimeZone::default();
        let mut week = evening_schedule(false);
        week.day_mut(DayOfWeek::Sun).on_enabled = false;
        let mut rng = Drand48::default();
        let mut scheduler = Scheduler::new();

        assert_eq!(scheduler.tick(at(8, 0, 0), &tz, &week, false, &mut rng), None);
    }
}
