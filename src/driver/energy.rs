//! Daily, monthly and yearly energy derived from the cumulative counter
//!
//! Each period keeps a baseline of the cumulative register taken at the
//! first reading inside the period. Period boundaries are evaluated in the
//! configured local timezone.

use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;

/// Derived counters for one connector
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EnergyCounters {
    pub daily_kwh: f64,
    pub monthly_kwh: f64,
    pub yearly_kwh: f64,
}

/// Selection of counters for a manual reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterPeriods {
    pub daily: bool,
    pub monthly: bool,
    pub yearly: bool,
}

impl CounterPeriods {
    pub const ALL: CounterPeriods = CounterPeriods {
        daily: true,
        monthly: true,
        yearly: true,
    };

    pub fn is_empty(self) -> bool {
        !(self.daily || self.monthly || self.yearly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Period {
    Day,
    Month,
    Year,
}

impl Period {
    fn key(self, local: &DateTime<Tz>) -> (i32, u32) {
        match self {
            Period::Day => (local.year(), local.ordinal()),
            Period::Month => (local.year(), local.month()),
            Period::Year => (local.year(), 0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PeriodCounter {
    key: (i32, u32),
    baseline_wh: u64,
    /// Energy accumulated before the device counter last went backwards
    carried_wh: u64,
}

impl PeriodCounter {
    fn value_wh(&self, total_wh: u64) -> u64 {
        self.carried_wh + total_wh.saturating_sub(self.baseline_wh)
    }
}

/// Baselines for one connector
#[derive(Debug, Clone)]
pub struct EnergyTracker {
    tz: Tz,
    last_total_wh: Option<u64>,
    day: Option<PeriodCounter>,
    month: Option<PeriodCounter>,
    year: Option<PeriodCounter>,
}

impl EnergyTracker {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            last_total_wh: None,
            day: None,
            month: None,
            year: None,
        }
    }

    /// Feed the cumulative register and get the derived counters
    pub fn update(&mut self, total_wh: u64, now: DateTime<Utc>) -> EnergyCounters {
        let local = now.with_timezone(&self.tz);

        // Cumulative counter went backwards: device reset or replaced meter
        if let Some(last) = self.last_total_wh
            && total_wh < last
        {
            for counter in [&mut self.day, &mut self.month, &mut self.year]
                .into_iter()
                .flatten()
            {
                counter.carried_wh = counter.value_wh(last);
                counter.baseline_wh = 0;
            }
        }

        for (period, slot) in [
            (Period::Day, &mut self.day),
            (Period::Month, &mut self.month),
            (Period::Year, &mut self.year),
        ] {
            let key = period.key(&local);
            if slot.is_none_or(|c| c.key != key) {
                *slot = Some(PeriodCounter {
                    key,
                    baseline_wh: total_wh,
                    carried_wh: 0,
                });
            }
        }

        self.last_total_wh = Some(total_wh);
        self.counters()
    }

    /// Zero the selected counters at the current reading
    pub fn reset(&mut self, periods: CounterPeriods) -> EnergyCounters {
        if let Some(total) = self.last_total_wh {
            for (selected, slot) in [
                (periods.daily, &mut self.day),
                (periods.monthly, &mut self.month),
                (periods.yearly, &mut self.year),
            ] {
                if selected && let Some(counter) = slot.as_mut() {
                    counter.baseline_wh = total;
                    counter.carried_wh = 0;
                }
            }
        }
        self.counters()
    }

    pub fn counters(&self) -> EnergyCounters {
        let Some(total) = self.last_total_wh else {
            return EnergyCounters::default();
        };
        let kwh = |slot: &Option<PeriodCounter>| {
            slot.map_or(0.0, |c| c.value_wh(total) as f64 / 1000.0)
        };
        EnergyCounters {
            daily_kwh: kwh(&self.day),
            monthly_kwh: kwh(&self.month),
            yearly_kwh: kwh(&self.year),
        }
    }
}
