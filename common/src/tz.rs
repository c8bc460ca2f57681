//! Local time for the scheduler and the history export.
//!
//! The stored timezone string is either an IANA name (`Europe/Berlin`) or a
//! POSIX TZ rule (`EST5EDT,M3.2.0,M11.1.0`). POSIX offsets are hours *west*
//! of UTC; transition times are local wall-clock times in the offset in
//! effect just before the transition.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime};
use chrono_tz::Tz;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TzError {
    #[error("empty timezone")]
    Empty,
    #[error("invalid timezone '{0}'")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimeZone {
    Iana(Tz),
    Posix(PosixTz),
}

impl Default for TimeZone {
    fn default() -> Self {
        Self::Posix(PosixTz::utc())
    }
}

impl TimeZone {
    pub fn parse(input: &str) -> Result<Self, TzError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(TzError::Empty);
        }
        if let Ok(tz) = input.parse::<Tz>() {
            return Ok(Self::Iana(tz));
        }
        PosixTz::parse(input)
            .map(Self::Posix)
            .ok_or_else(|| TzError::Invalid(input.to_string()))
    }

    /// Seconds to add to UTC to get local time at `unix`.
    pub fn offset_seconds(&self, unix: i64) -> i64 {
        match self {
            Self::Iana(tz) => {
                let utc = DateTime::from_timestamp(unix, 0).unwrap_or_default();
                (utc.with_timezone(tz).naive_local() - utc.naive_utc()).num_seconds()
            }
            Self::Posix(rule) => rule.offset_seconds(unix),
        }
    }

    pub fn local(&self, unix: i64) -> NaiveDateTime {
        let local = unix.saturating_add(self.offset_seconds(unix));
        DateTime::from_timestamp(local, 0)
            .unwrap_or_default()
            .naive_utc()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PosixTz {
    std_name: String,
    std_offset: i64,
    dst: Option<DstRule>,
}

#[derive(Debug, Clone, PartialEq)]
struct DstRule {
    name: String,
    offset: i64,
    start: Transition,
    end: Transition,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Transition {
    day: DayRule,
    time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DayRule {
    /// `Jn`: 1..=365, February 29 is never counted.
    Julian1(u16),
    /// `n`: 0..=365, February 29 counted in leap years.
    Julian0(u16),
    /// `Mm.w.d`: weekday `d` (0 = Sunday) of week `w` (5 = last) in month `m`.
    MonthWeekDay { month: u32, week: u32, weekday: u32 },
}

const DEFAULT_TRANSITION_TIME: i64 = 2 * 3600;

impl PosixTz {
    pub fn utc() -> Self {
        Self {
            std_name: "UTC".into(),
            std_offset: 0,
            dst: None,
        }
    }

    pub fn std_name(&self) -> &str {
        &self.std_name
    }

    pub fn dst_name(&self) -> Option<&str> {
        self.dst.as_ref().map(|dst| dst.name.as_str())
    }

    pub fn parse(input: &str) -> Option<Self> {
        let mut p = Cursor::new(input);

        let std_name = p.name()?;
        let std_offset = -p.signed_hms()?;

        if p.at_end() {
            return Some(Self {
                std_name,
                std_offset,
                dst: None,
            });
        }

        let dst_name = p.name()?;
        let dst_offset = if p.peek().is_some_and(|c| c != b',') {
            -p.signed_hms()?
        } else {
            std_offset + 3600
        };

        let (start, end) = if p.at_end() {
            // US rules when a DST name is given without transitions.
            (
                Transition {
                    day: DayRule::MonthWeekDay {
                        month: 3,
                        week: 2,
                        weekday: 0,
                    },
                    time: DEFAULT_TRANSITION_TIME,
                },
                Transition {
                    day: DayRule::MonthWeekDay {
                        month: 11,
                        week: 1,
                        weekday: 0,
                    },
                    time: DEFAULT_TRANSITION_TIME,
                },
            )
        } else {
            p.expect(b',')?;
            let start = p.transition()?;
            p.expect(b',')?;
            let end = p.transition()?;
            (start, end)
        };

        if !p.at_end() {
            return None;
        }

        Some(Self {
            std_name,
            std_offset,
            dst: Some(DstRule {
                name: dst_name,
                offset: dst_offset,
                start,
                end,
            }),
        })
    }

    pub fn offset_seconds(&self, unix: i64) -> i64 {
        let Some(dst) = &self.dst else {
            return self.std_offset;
        };

        let year = DateTime::from_timestamp(unix.saturating_add(self.std_offset), 0)
            .unwrap_or_default()
            .year();

        let (Some(start), Some(end)) = (
            dst.start.utc_instant(year, self.std_offset),
            dst.end.utc_instant(year, dst.offset),
        ) else {
            return self.std_offset;
        };

        let in_dst = if start < end {
            start <= unix && unix < end
        } else {
            unix < end || unix >= start
        };

        if in_dst {
            dst.offset
        } else {
            self.std_offset
        }
    }
}

impl Transition {
    fn utc_instant(&self, year: i32, offset_before: i64) -> Option<i64> {
        let date = self.day.date(year)?;
        let midnight = date.and_hms_opt(0, 0, 0)?.and_utc().timestamp();
        Some(midnight + self.time - offset_before)
    }
}

impl DayRule {
    fn date(&self, year: i32) -> Option<NaiveDate> {
        let jan1 = NaiveDate::from_ymd_opt(year, 1, 1)?;
        match *self {
            Self::Julian1(n) => {
                let mut days = i64::from(n) - 1;
                if jan1.leap_year() && n >= 60 {
                    days += 1;
                }
                jan1.checked_add_signed(Duration::days(days))
            }
            Self::Julian0(n) => jan1.checked_add_signed(Duration::days(i64::from(n))),
            Self::MonthWeekDay {
                month,
                week,
                weekday,
            } => {
                let first = NaiveDate::from_ymd_opt(year, month, 1)?;
                let first_weekday = first.weekday().num_days_from_sunday();
                let mut day = 1 + (weekday + 7 - first_weekday) % 7 + (week - 1) * 7;
                while NaiveDate::from_ymd_opt(year, month, day).is_none() {
                    day -= 7;
                }
                NaiveDate::from_ymd_opt(year, month, day)
            }
        }
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(s: &'a str) -> Self {
        Self {
            bytes: s.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn expect(&mut self, c: u8) -> Option<()> {
        (self.peek() == Some(c)).then(|| self.pos += 1)
    }

    fn take_while(&mut self, f: impl Fn(u8) -> bool) -> &'a [u8] {
        let bytes = self.bytes;
        let start = self.pos;
        while self.peek().is_some_and(&f) {
            self.pos += 1;
        }
        &bytes[start..self.pos]
    }

    fn name(&mut self) -> Option<String> {
        let raw = if self.expect(b'<').is_some() {
            let raw = self.take_while(|c| c != b'>');
            self.expect(b'>')?;
            raw
        } else {
            self.take_while(|c| c.is_ascii_alphabetic())
        };
        if raw.len() < 3 {
            return None;
        }
        std::str::from_utf8(raw).ok().map(str::to_string)
    }

    fn number(&mut self, max_digits: usize) -> Option<u32> {
        let digits = self.take_while(|c| c.is_ascii_digit());
        if digits.is_empty() || digits.len() > max_digits {
            return None;
        }
        std::str::from_utf8(digits).ok()?.parse().ok()
    }

    /// `[+-]hh[:mm[:ss]]` in seconds.
    fn signed_hms(&mut self) -> Option<i64> {
        let sign = match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                -1
            }
            Some(b'+') => {
                self.pos += 1;
                1
            }
            _ => 1,
        };
        let hours = i64::from(self.number(3)?);
        let mut seconds = hours * 3600;
        if self.expect(b':').is_some() {
            seconds += i64::from(self.number(2)?) * 60;
            if self.expect(b':').is_some() {
                seconds += i64::from(self.number(2)?);
            }
        }
        (hours <= 167).then_some(sign * seconds)
    }

    fn transition(&mut self) -> Option<Transition> {
        let day = match self.peek()? {
            b'M' => {
                self.pos += 1;
                let month = self.number(2)?;
                self.expect(b'.')?;
                let week = self.number(1)?;
                self.expect(b'.')?;
                let weekday = self.number(1)?;
                if !(1..=12).contains(&month) || !(1..=5).contains(&week) || weekday > 6 {
                    return None;
                }
                DayRule::MonthWeekDay {
                    month,
                    week,
                    weekday,
                }
            }
            b'J' => {
                self.pos += 1;
                let n = self.number(3)?;
                if !(1..=365).contains(&n) {
                    return None;
                }
                DayRule::Julian1(n as u16)
            }
            _ => {
                let n = self.number(3)?;
                if n > 365 {
                    return None;
                }
                DayRule::Julian0(n as u16)
            }
        };
        let time = if self.expect(b'/').is_some() {
            self.signed_hms()?
        } else {
            DEFAULT_TRANSITION_TIME
        };
        Some(Transition { day, time })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn ymd_hms(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn us_eastern_spring_forward() {
        let tz = TimeZone::parse("EST5EDT,M3.2.0,M11.1.0").unwrap();
        // 2026-03-08 07:00:00Z
        let change = 1_772_953_200;
        assert_eq!(tz.offset_seconds(change - 1), -5 * 3600);
        assert_eq!(tz.offset_seconds(change), -4 * 3600);
        assert_eq!(tz.local(change - 1), ymd_hms(2026, 3, 8, 1, 59, 59));
        assert_eq!(tz.local(change), ymd_hms(2026, 3, 8, 3, 0, 0));
    }

    #[test]
    fn us_eastern_fall_back() {
        let tz = TimeZone::parse("EST5EDT,M3.2.0,M11.1.0").unwrap();
        // 2026-11-01 06:00:00Z
        let change = 1_793_512_800;
        assert_eq!(tz.offset_seconds(change - 1), -4 * 3600);
        assert_eq!(tz.offset_seconds(change), -5 * 3600);
    }

    #[test]
    fn southern_hemisphere_wraps_year_end() {
        let tz = TimeZone::parse("AEST-10AEDT,M10.1.0,M4.1.0/3").unwrap();
        // 2026-01-15 12:00Z and 2026-07-15 12:00Z
        assert_eq!(tz.offset_seconds(1_768_478_400), 11 * 3600);
        assert_eq!(tz.offset_seconds(1_784_116_800), 10 * 3600);
        // DST ends 2026-04-05 03:00 AEDT = 2026-04-04 16:00Z
        assert_eq!(tz.offset_seconds(1_775_318_400 - 1), 11 * 3600);
        assert_eq!(tz.offset_seconds(1_775_318_400), 10 * 3600);
    }

    #[test]
    fn fixed_offsets_and_quoted_names() {
        let tz = TimeZone::parse("<+0530>-5:30").unwrap();
        assert_eq!(tz.offset_seconds(0), 5 * 3600 + 30 * 60);

        let TimeZone::Posix(rule) = TimeZone::parse("CET-1CEST,M3.5.0,M10.5.0/3").unwrap() else {
            panic!("expected a POSIX rule");
        };
        assert_eq!(rule.std_name(), "CET");
        assert_eq!(rule.dst_name(), Some("CEST"));
    }

    #[test]
    fn last_week_rule_picks_last_weekday() {
        let rule = DayRule::MonthWeekDay {
            month: 3,
            week: 5,
            weekday: 0,
        };
        assert_eq!(rule.date(2026), NaiveDate::from_ymd_opt(2026, 3, 29));
        assert_eq!(DayRule::Julian1(60).date(2024), NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(DayRule::Julian0(59).date(2024), NaiveDate::from_ymd_opt(2024, 2, 29));
    }

    #[test]
    fn iana_names_resolve() {
        let tz = TimeZone::parse("Europe/London").unwrap();
        assert!(matches!(tz, TimeZone::Iana(_)));
        // 2026-07-15 12:00Z is BST.
        assert_eq!(tz.offset_seconds(1_784_116_800), 3600);
    }

    #[test]
    fn rejects_malformed_rules() {
        assert_eq!(TimeZone::parse(""), Err(TzError::Empty));
        for bad in ["E5", "EST5EDT,M13.1.0,M11.1.0", "EST5EDT,M3.2.0", "EST5x", "XYZ"] {
            assert!(TimeZone::parse(bad).is_err(), "{bad}");
        }
    }
}
