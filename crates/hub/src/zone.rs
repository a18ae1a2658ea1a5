//! The hub's local time zone.  Light windows are wall-clock hours, so the
//! offset is resolved per instant from the tz database and follows DST.

use anyhow::{anyhow, Result};
use chrono::{Offset, TimeZone};
use chrono_tz::Tz;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocalZone {
    /// A fixed offset such as "+02:00".  Never observes DST.
    Fixed(UtcOffset),
    /// An IANA zone such as "Europe/Berlin".
    Named(Tz),
}

impl Default for LocalZone {
    fn default() -> Self {
        LocalZone::Named(Tz::UTC)
    }
}

impl LocalZone {
    /// Accepts an IANA zone name or a signed "+HH:MM" offset.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.starts_with(['+', '-']) {
            let offset = UtcOffset::parse(
                s,
                format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
            )
            .map_err(|e| anyhow!("invalid offset '{s}' (expected e.g. +02:00): {e}"))?;
            return Ok(LocalZone::Fixed(offset));
        }
        let tz: Tz = s
            .parse()
            .map_err(|e| anyhow!("unknown time zone '{s}': {e}"))?;
        Ok(LocalZone::Named(tz))
    }

    /// UTC offset in effect at `at`.
    pub fn offset_at(&self, at: OffsetDateTime) -> UtcOffset {
        match self {
            LocalZone::Fixed(offset) => *offset,
            LocalZone::Named(tz) => {
                let Some(utc) = chrono::DateTime::from_timestamp(at.unix_timestamp(), 0) else {
                    return UtcOffset::UTC;
                };
                let secs = tz.offset_from_utc_datetime(&utc.naive_utc()).fix().local_minus_utc();
                UtcOffset::from_whole_seconds(secs).unwrap_or(UtcOffset::UTC)
            }
        }
    }

    /// `at` expressed in local wall-clock time.
    pub fn localize(&self, at: OffsetDateTime) -> OffsetDateTime {
        at.to_offset(self.offset_at(at))
    }

    pub fn now(&self) -> OffsetDateTime {
        self.localize(OffsetDateTime::now_utc())
    }

    /// Interpret a wall-clock time in this zone.  Inside a DST gap or
    /// overlap one of the two neighbouring offsets is used.
    pub fn assume_local(&self, local: PrimitiveDateTime) -> OffsetDateTime {
        let guess = local.assume_utc();
        let first = self.offset_at(guess);
        let offset = self.offset_at(guess - Duration::seconds(i64::from(first.whole_seconds())));
        local.assume_offset(offset)
    }

    /// Parse an ISO 8601 timestamp.  RFC 3339 values keep their offset;
    /// `YYYY-MM-DD` (local midnight) and offset-less
    /// `YYYY-MM-DDTHH:MM[:SS[.fff]]` are taken as local time.
    pub fn parse_timestamp(&self, s: &str) -> Result<OffsetDateTime> {
        let s = s.trim();
        if let Ok(t) = OffsetDateTime::parse(s, &Rfc3339) {
            return Ok(t);
        }
        let naive = PrimitiveDateTime::parse(
            s,
            format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
        )
        .or_else(|_| {
            PrimitiveDateTime::parse(s, format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"))
        })
        .or_else(|_| {
            PrimitiveDateTime::parse(s, format_description!("[year]-[month]-[day]T[hour]:[minute]"))
        })
        .ok()
        .or_else(|| {
            Date::parse(s, format_description!("[year]-[month]-[day]"))
                .ok()
                .map(Date::midnight)
        });
        naive.map(|n| self.assume_local(n)).ok_or_else(|| {
            anyhow!("invalid timestamp '{s}' (expected RFC 3339, YYYY-MM-DD or YYYY-MM-DDTHH:MM[:SS])")
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
