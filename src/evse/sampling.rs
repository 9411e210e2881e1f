use chrono::Utc;
use tracing::debug;

use super::{Evse, Notification};
use crate::ocpp::messages::{Measurand, MeterValue, Phase, SampledValue, UnitOfMeasure};

const PHASES: [u8; 3] = [1, 2, 3];

impl Evse {
    /// Read the requested measurands from the power meter.
    ///
    /// Failed readings are left out. The result is attached to the
    /// active session, if any, and announced as a meter values notification.
    pub async fn sample_power_meter(&self, measurands: &[Measurand]) -> Option<MeterValue> {
        let meter = self.power_meter.as_ref()?;
        let mut samples = Vec::new();

        for measurand in measurands {
            match measurand {
                Measurand::EnergyActiveImportRegister => {
                    push_reading(&mut samples, *measurand, meter.energy().await, UnitOfMeasure::Wh, None)
                }
                Measurand::PowerActiveImport => {
                    push_reading(&mut samples, *measurand, meter.power().await, UnitOfMeasure::W, None)
                }
                Measurand::CurrentImport => {
                    for phase in PHASES {
                        let reading = meter.current(phase).await;
                        push_reading(&mut samples, *measurand, reading, UnitOfMeasure::A, Phase::line(phase));
                    }
                }
                Measurand::Voltage => {
                    for phase in PHASES {
                        let reading = meter.voltage(phase).await;
                        push_reading(&mut samples, *measurand, reading, UnitOfMeasure::V, Phase::line(phase));
                    }
                }
                other => debug!(evse_id = self.id(), measurand = %other, "measurand not sampled"),
            }
        }

        if samples.is_empty() {
            return None;
        }
        let value = MeterValue {
            timestamp: Utc::now(),
            sampled_value: samples,
        };

        let mut state = self.state.lock().await;
        let transaction_id = if state.session.add_sample(value.clone()) {
            Some(state.session.transaction_id.clone())
        } else {
            None
        };
        self.emit(Notification::MeterValues {
            evse_id: self.id(),
            transaction_id,
            meter_values: vec![value.clone()],
        })
        .await;
        drop(state);

        Some(value)
    }

    /// Periodic sampling; does nothing once the session is over.
    pub(super) async fn sample_session(&self, measurands: &[Measurand]) {
        if !self.has_active_session().await {
            return;
        }
        self.sample_power_meter(measurands).await;
    }
}

fn push_reading<E: std::fmt::Display>(
    samples: &mut Vec<SampledValue>,
    measurand: Measurand,
    reading: Result<f64, E>,
    unit: UnitOfMeasure,
    phase: Option<Phase>,
) {
    match reading {
        Ok(value) => {
            let sample = SampledValue::new(measurand, value, unit);
            samples.push(match phase {
                Some(phase) => sample.with_phase(phase),
                None => sample,
            });
        }
        Err(e) => debug!(%measurand, ?phase, error = %e, "reading skipped"),
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::{DummyEvcc, DummyPowerMeter};
    use crate::evse::{Evse, EvseSettings, Notification, Notifier};
    use crate::ocpp::messages::{Measurand, Phase};
    use crate::ocpp::OcppConfiguration;
    use crate::scheduler::Scheduler;
    use std::sync::Arc;
    use std::time::Duration;

    fn evse_with_meter(meter: Arc<DummyPowerMeter>) -> (Arc<Evse>, tokio::sync::mpsc::Receiver<Notification>) {
        let evse = Evse::new(
            EvseSettings::new(2),
            Arc::new(DummyEvcc::new()),
            Some(meter),
            Scheduler::new(),
            Arc::new(OcppConfiguration::new()),
        )
        .unwrap();
        let (notifier, rx) = Notifier::channel(16, Duration::from_millis(100));
        evse.set_notifier(notifier);
        (Arc::new(evse), rx)
    }

    #[tokio::test]
    async fn test_single_phase_meter_expands_available_phases() {
        let meter = Arc::new(DummyPowerMeter::new(1, 0.0));
        meter.set_load(10.0, 230.0);
        meter.advance(500.0);
        let (evse, mut rx) = evse_with_meter(meter);

        let value = evse
            .sample_power_meter(&[
                Measurand::EnergyActiveImportRegister,
                Measurand::PowerActiveImport,
                Measurand::CurrentImport,
                Measurand::Voltage,
                Measurand::SoC,
            ])
            .await
            .unwrap();

        assert_eq!(value.sampled_value.len(), 4);
        assert_eq!(value.sampled_value[0].value, "500.000");
        assert_eq!(value.sampled_value[2].phase, Some(Phase::L1));

        match rx.recv().await.unwrap() {
            Notification::MeterValues {
                evse_id,
                transaction_id,
                meter_values,
            } => {
                assert_eq!(evse_id, 2);
                assert_eq!(transaction_id, None);
                assert_eq!(meter_values.len(), 1);
            }
            other => panic!("unexpected notification {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_samples_join_active_session() {
        let meter = Arc::new(DummyPowerMeter::new(3, 0.0));
        meter.set_load(16.0, 230.0);
        let (evse, _rx) = evse_with_meter(meter);

        evse.start_charging("11", "TAG").await.unwrap();
        evse.sample_power_meter(&[Measurand::PowerActiveImport]).await.unwrap();
        evse.sample_power_meter(&[Measurand::Voltage, Measurand::CurrentImport]).await.unwrap();

        let session = evse.session().await;
        assert_eq!(session.consumption.len(), 2);
        assert!((session.average_power() - 11040.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_idle_meter_still_reports_zero() {
        let (evse, mut rx) = evse_with_meter(Arc::new(DummyPowerMeter::default()));
        let value = evse.sample_power_meter(&[Measurand::PowerActiveImport]).await.unwrap();
        assert_eq!(value.sampled_value.len(), 1);
        assert_eq!(value.sampled_value[0].value, "0.000");
        assert!(matches!(rx.try_recv(), Ok(Notification::MeterValues { .. })));
    }

    #[tokio::test]
    async fn test_nothing_sampled_produces_nothing() {
        let (evse, mut rx) = evse_with_meter(Arc::new(DummyPowerMeter::default()));
        assert!(evse.sample_power_meter(&[Measurand::SoC]).await.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_register_delta_counts_from_zero() {
        let meter = Arc::new(DummyPowerMeter::default());
        let (evse, _rx) = evse_with_meter(meter.clone());
        evse.start_charging("21", "TAG").await.unwrap();

        let register = [Measurand::EnergyActiveImportRegister];
        evse.sample_power_meter(&register).await.unwrap();
        meter.advance(100.0);
        evse.sample_power_meter(&register).await.unwrap();
        meter.advance(200.0);
        evse.sample_power_meter(&register).await.unwrap();

        let session = evse.session().await;
        assert_eq!(session.consumption.len(), 3);
        assert_eq!(session.consumption[0].sampled_value[0].value, "0.000");
        assert_eq!(session.energy_from_register(), Some(300.0));
    }
}
