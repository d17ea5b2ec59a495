//! The typed result of one poll cycle, published to external consumers.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// Battery telemetry. Only materialized when all five registers decoded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Battery {
    pub voltage: f32,
    pub current: f32,
    pub power: i32,
    pub soc: i32,
    pub temperature: i32,
}

/// PV string telemetry. Any field may be absent depending on which groups
/// came back and which the active model supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Pv {
    pub total_power: Option<i32>,
    pub charging_power: Option<i32>,
    pub charging_current: Option<f32>,
    pub temperature: Option<i32>,
    pub pv1_voltage: Option<f32>,
    pub pv1_current: Option<f32>,
    pub pv1_power: Option<i32>,
    pub pv2_voltage: Option<f32>,
    pub pv2_current: Option<f32>,
    pub pv2_power: Option<i32>,
    pub energy_today: Option<f32>,
    pub energy_total: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Grid {
    pub voltage: Option<f32>,
    pub power: Option<i32>,
    /// Centihertz, as decoded off the wire (e.g. 5000 == 50.00 Hz).
    pub frequency: Option<i32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Output {
    pub voltage: Option<f32>,
    pub current: Option<f32>,
    pub power: Option<i32>,
    pub apparent_power: Option<i32>,
    pub load_percentage: Option<i32>,
    /// Centihertz, as decoded off the wire.
    pub frequency: Option<i32>,
}

/// Operating mode as reported by the inverter. Any raw value other than the
/// two known ones is a [`OperatingMode::Fault`], never a decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperatingMode {
    Sub,
    Sbu,
    Fault(u16),
}

impl OperatingMode {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            2 => OperatingMode::Sub,
            3 => OperatingMode::Sbu,
            other => OperatingMode::Fault(other),
        }
    }

    /// The mode's name the way consumers expect to see it, e.g. `"SUB"` or
    /// `"UNKNOWN(7)"` for an unrecognized raw value.
    pub fn name(&self) -> String {
        match self {
            OperatingMode::Sub => "SUB".to_string(),
            OperatingMode::Sbu => "SBU".to_string(),
            OperatingMode::Fault(raw) => format!("UNKNOWN({raw})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub operating_mode: OperatingMode,
    pub mode_name: String,
    pub inverter_time: Option<DateTime<Utc>>,
}

/// Builds an inverter-local timestamp from the six raw time registers, or
/// `None` if they don't form a valid calendar date/time.
pub fn inverter_timestamp(year: u16, month: u16, day: u16, hour: u16, minute: u16, second: u16) -> Option<DateTime<Utc>> {
    let date = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)?;
    let time = date.and_hms_opt(hour as u32, minute as u32, second as u32)?;
    Some(DateTime::<Utc>::from_naive_utc_and_offset(time, Utc))
}

/// The immutable, typed result of one poll. Any of the five records may be
/// absent; a snapshot with every record absent still publishes (the
/// coordinator treats that case as a failure for backoff purposes, but the
/// snapshot type itself has no such concept).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub battery: Option<Battery>,
    pub pv: Option<Pv>,
    pub grid: Option<Grid>,
    pub output: Option<Output>,
    pub system: Option<SystemStatus>,
    pub polled_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn empty(polled_at: DateTime<Utc>) -> Self {
        Self {
            battery: None,
            pv: None,
            grid: None,
            output: None,
            system: None,
            polled_at,
        }
    }

    /// True iff none of the five records were materialized — the condition
    /// the coordinator treats as a failed poll for backoff purposes.
    pub fn is_empty(&self) -> bool {
        self.battery.is_none()
            && self.pv.is_none()
            && self.grid.is_none()
            && self.output.is_none()
            && self.system.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_mode_is_fault_with_preserved_raw() {
        let mode = OperatingMode::from_raw(7);
        assert_eq!(mode, OperatingMode::Fault(7));
        assert_eq!(mode.name(), "UNKNOWN(7)");
    }

    #[test]
    fn known_modes_map_by_number() {
        assert_eq!(OperatingMode::from_raw(2), OperatingMode::Sub);
        assert_eq!(OperatingMode::from_raw(3), OperatingMode::Sbu);
    }

    #[test]
    fn invalid_calendar_date_yields_no_timestamp() {
        assert!(inverter_timestamp(2024, 2, 30, 0, 0, 0).is_none());
    }

    #[test]
    fn valid_calendar_date_round_trips() {
        let ts = inverter_timestamp(2024, 3, 15, 10, 30, 5).unwrap();
        assert_eq!(ts.format("%Y-%m-%d %H:%M:%S").to_string(), "2024-03-15 10:30:05");
    }

    #[test]
    fn empty_snapshot_has_all_records_absent() {
        let snap = Snapshot::empty(Utc::now());
        assert!(snap.is_empty());
    }
}
