//! Charging session (transaction) tracking and energy accounting

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use crate::ocpp::messages::{Measurand, MeterValue, Phase, Reason};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session already active")]
    AlreadyActive,
    #[error("invalid transaction id {0:?}")]
    InvalidTransactionId(String),
    #[error("invalid tag id {0:?}")]
    InvalidTagId(String),
}

/// One charging session. Ending it clears the identity but keeps the
/// samples and the time window so the final energy can still be computed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub is_active: bool,
    pub transaction_id: String,
    pub tag_id: String,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Energy register at the start, in Wh
    #[serde(default)]
    pub meter_start: f64,
    #[serde(default)]
    pub consumption: Vec<MeterValue>,
}

impl Session {
    pub fn start(&mut self, transaction_id: &str, tag_id: &str, now: DateTime<Utc>) -> Result<(), SessionError> {
        if self.is_active {
            return Err(SessionError::AlreadyActive);
        }
        if transaction_id.is_empty() || !transaction_id.chars().all(char::is_alphanumeric) {
            return Err(SessionError::InvalidTransactionId(transaction_id.to_string()));
        }
        if tag_id.trim().is_empty() || tag_id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(SessionError::InvalidTagId(tag_id.to_string()));
        }

        debug!(transaction_id, tag_id, "session started");
        *self = Session {
            is_active: true,
            transaction_id: transaction_id.to_string(),
            tag_id: tag_id.to_string(),
            started_at: Some(now),
            ended_at: None,
            meter_start: 0.0,
            consumption: Vec::new(),
        };
        Ok(())
    }

    /// Clear the identity, keep the samples and the window.
    pub fn end(&mut self, now: DateTime<Utc>) {
        if !self.is_active {
            return;
        }
        debug!(transaction_id = %self.transaction_id, "session ended");
        self.is_active = false;
        self.transaction_id.clear();
        self.tag_id.clear();
        self.ended_at = Some(now);
    }

    /// Samples are only kept while the session is active.
    pub fn add_sample(&mut self, value: MeterValue) -> bool {
        if !self.is_active {
            return false;
        }
        self.consumption.push(value);
        true
    }

    pub fn duration(&self, now: DateTime<Utc>) -> chrono::Duration {
        match self.started_at {
            Some(started) => self.ended_at.unwrap_or(now) - started,
            None => chrono::Duration::zero(),
        }
    }

    /// Sum of positive Energy.Active.Import.Interval samples, in Wh
    pub fn energy_from_intervals(&self) -> Option<f64> {
        let values: Vec<f64> = self
            .samples(Measurand::EnergyActiveImportInterval)
            .filter(|v| *v > 0.0)
            .collect();
        (!values.is_empty()).then(|| values.iter().sum())
    }

    /// Register delta between the first and the last Energy.Active.Import.Register sample, in Wh
    pub fn energy_from_register(&self) -> Option<f64> {
        let mut values = self.samples(Measurand::EnergyActiveImportRegister);
        let first = values.next()?;
        let last = values.last()?;
        (last >= first).then(|| last - first)
    }

    /// Mean active power over the samples that carry power or a voltage/current pair, in W
    pub fn average_power(&self) -> f64 {
        let powers: Vec<f64> = self.consumption.iter().filter_map(sample_power).collect();
        if powers.is_empty() {
            return 0.0;
        }
        powers.iter().sum::<f64>() / powers.len() as f64
    }

    /// Average power times the session length, in Wh. Sub-second sessions count as zero.
    pub fn energy_from_average_power(&self, now: DateTime<Utc>) -> f64 {
        let seconds = self.duration(now).num_milliseconds() as f64 / 1000.0;
        if seconds < 1.0 {
            return 0.0;
        }
        self.average_power() * seconds / 3600.0
    }

    /// Best available estimate of delivered energy, in Wh
    pub fn energy_consumed(&self, now: DateTime<Utc>) -> f64 {
        self.energy_from_intervals()
            .or_else(|| self.energy_from_register())
            .unwrap_or_else(|| self.energy_from_average_power(now))
    }

    fn samples(&self, measurand: Measurand) -> impl Iterator<Item = f64> + '_ {
        self.consumption
            .iter()
            .flat_map(|mv| mv.sampled_value.iter())
            .filter(move |sv| sv.measurand() == measurand)
            .filter_map(|sv| sv.base_value())
    }
}

/// Power for one meter value: the reported active power, else the per-phase V x I sum.
fn sample_power(value: &MeterValue) -> Option<f64> {
    let mut voltages: HashMap<Option<Phase>, f64> = HashMap::new();
    let mut currents: HashMap<Option<Phase>, f64> = HashMap::new();

    for sample in &value.sampled_value {
        let Some(reading) = sample.base_value() else { continue };
        let phase = sample.phase.map(Phase::normalized);
        match sample.measurand() {
            Measurand::PowerActiveImport => return Some(reading),
            Measurand::Voltage => {
                voltages.insert(phase, reading);
            }
            Measurand::CurrentImport => {
                currents.insert(phase, reading);
            }
            _ => {}
        }
    }

    let mut total = None;
    for (phase, current) in &currents {
        if let Some(voltage) = voltages.get(phase) {
            *total.get_or_insert(0.0) += voltage * current;
        }
    }
    total
}

/// Final state of a session, captured when it stops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub evse_id: i32,
    pub transaction_id: String,
    pub tag_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: DateTime<Utc>,
    pub reason: Reason,
    #[serde(default)]
    pub meter_start: f64,
    pub energy_wh: f64,
    pub meter_values: Vec<MeterValue>,
}

impl SessionSummary {
    /// Capture `session` before it is ended.
    pub fn capture(evse_id: i32, session: &Session, reason: Reason, now: DateTime<Utc>) -> Self {
        Self {
            evse_id,
            transaction_id: session.transaction_id.clone(),
            tag_id: session.tag_id.clone(),
            started_at: session.started_at,
            stopped_at: now,
            reason,
            meter_start: session.meter_start,
            energy_wh: session.energy_consumed(now),
            meter_values: session.consumption.clone(),
        }
    }

    /// Meter stop for StopTransaction: the start register plus the delivered energy, in whole Wh
    pub fn meter_stop(&self) -> i32 {
        (self.meter_start + self.energy_wh).round().clamp(0.0, i32::MAX as f64) as i32
    }

    pub fn has_transaction(&self) -> bool {
        !self.transaction_id.is_empty()
    }
}
