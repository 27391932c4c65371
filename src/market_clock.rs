//! IST wall-clock classification (§4.1).
//!
//! All internal timestamps are UTC-aware; IST is computed only here, at the
//! MarketClock boundary, and at trade_date bucketing (`ist_date_of`). Every
//! predicate is a pure function of its input timestamp (Testable Property
//! #10): same input, same classification, always.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};

/// UTC+05:30, applied once at the IST boundary and nowhere else.
pub const IST_OFFSET: Duration = Duration::minutes(5 * 60 + 30);

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// IST wall-clock naive datetime for a UTC instant.
pub fn to_ist(ts: DateTime<Utc>) -> chrono::NaiveDateTime {
    ts.naive_utc() + IST_OFFSET
}

/// The IST calendar date of a UTC signal timestamp (PickEvent.trade_date).
pub fn ist_date_of(ts: DateTime<Utc>) -> NaiveDate {
    to_ist(ts).date()
}

/// Inverse of `to_ist`: the UTC instant for a given IST wall-clock time of day.
pub fn ist_naive_to_utc(date: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    let naive = date.and_hms_opt(hour, minute, 0).expect("valid time of day");
    chrono::TimeZone::from_utc_datetime(&Utc, &(naive - IST_OFFSET))
}

/// True for Mon-Fri in IST.
pub fn is_weekday_ist_date(date: NaiveDate) -> bool {
    date.weekday().num_days_from_monday() < 5
}

fn is_trading_weekday(ist: chrono::NaiveDateTime) -> bool {
    ist.weekday().num_days_from_monday() < 5
}

fn minutes_of_day(ist: chrono::NaiveDateTime) -> i64 {
    i64::from(ist.hour()) * 60 + i64::from(ist.minute())
}

/// Cash market open: 09:15 <= t < 15:30 IST, Mon-Fri.
pub fn is_cash_market_open(ts: DateTime<Utc>) -> bool {
    let ist = to_ist(ts);
    if !is_trading_weekday(ist) {
        return false;
    }
    let m = minutes_of_day(ist);
    (9 * 60 + 15..15 * 60 + 30).contains(&m)
}

/// Scalping cycle window: 09:20 <= t <= 15:30 IST, Mon-Fri.
pub fn is_scalping_cycle_window(ts: DateTime<Utc>) -> bool {
    let ist = to_ist(ts);
    if !is_trading_weekday(ist) {
        return false;
    }
    let m = minutes_of_day(ist);
    m >= 9 * 60 + 20 && m <= 15 * 60 + 30
}

/// EOD window: 15:30 <= t <= 15:45 IST, Mon-Fri.
pub fn is_eod_window(ts: DateTime<Utc>) -> bool {
    let ist = to_ist(ts);
    if !is_trading_weekday(ist) {
        return false;
    }
    ist.hour() == 15 && (30..=45).contains(&ist.minute())
}

/// Hard intraday cutoff: after 15:15 IST, Scalping/Intraday/Options/Futures
/// refreshes are skipped unless the trigger is `backfill`.
pub fn is_past_hard_cutoff(ts: DateTime<Utc>) -> bool {
    let ist = to_ist(ts);
    minutes_of_day(ist) > 15 * 60 + 15
}

pub fn is_trading_weekday_ist(ts: DateTime<Utc>) -> bool {
    is_trading_weekday(to_ist(ts))
}
