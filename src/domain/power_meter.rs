use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PowerMeterError {
    #[error("Communication error: {0}")]
    Communication(String),
    #[error("Phase {0} not available on this meter")]
    PhaseUnavailable(u8),
    #[error("Measurement not supported: {0}")]
    NotSupported(&'static str),
}

/// Energy metering chip. Every read is independent and may fail on its own.
#[async_trait]
pub trait PowerMeter: Send + Sync {
    async fn init(&self) -> Result<(), PowerMeterError>;
    /// Import register in Wh
    async fn energy(&self) -> Result<f64, PowerMeterError>;
    /// Active import power in W
    async fn power(&self) -> Result<f64, PowerMeterError>;
    /// Current in A for phase 1..=3
    async fn current(&self, phase: u8) -> Result<f64, PowerMeterError>;
    /// Voltage in V for phase 1..=3
    async fn voltage(&self, phase: u8) -> Result<f64, PowerMeterError>;
    async fn cleanup(&self) -> Result<(), PowerMeterError>;
    fn kind(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy)]
struct Readings {
    energy_wh: f64,
    power_w: f64,
    current_a: f64,
    voltage_v: f64,
}

/// Simulated meter with optional measurement noise
#[derive(Debug)]
pub struct DummyPowerMeter {
    readings: Mutex<Readings>,
    phases: u8,
    jitter: f64,
}

impl Default for DummyPowerMeter {
    fn default() -> Self {
        Self::new(1, 0.0)
    }
}

impl DummyPowerMeter {
    pub fn new(phases: u8, jitter: f64) -> Self {
        Self {
            readings: Mutex::new(Readings {
                energy_wh: 0.0,
                power_w: 0.0,
                current_a: 0.0,
                voltage_v: 230.0,
            }),
            phases: phases.clamp(1, 3),
            jitter: jitter.max(0.0),
        }
    }

    /// Set the instantaneous load
    pub fn set_load(&self, current_a: f64, voltage_v: f64) {
        let mut readings = self.readings.lock();
        readings.current_a = current_a;
        readings.voltage_v = voltage_v;
        readings.power_w = current_a * voltage_v * f64::from(self.phases);
    }

    /// Move the energy register forward
    pub fn advance(&self, wh: f64) {
        self.readings.lock().energy_wh += wh;
    }

    fn noisy(&self, value: f64) -> f64 {
        if self.jitter == 0.0 || value == 0.0 {
            return value;
        }
        let factor = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        value * (1.0 + factor)
    }

    fn check_phase(&self, phase: u8) -> Result<(), PowerMeterError> {
        if phase == 0 || phase > self.phases {
            return Err(PowerMeterError::PhaseUnavailable(phase));
        }
        Ok(())
    }
}

#[async_trait]
impl PowerMeter for DummyPowerMeter {
    async fn init(&self) -> Result<(), PowerMeterError> {
        Ok(())
    }

    async fn energy(&self) -> Result<f64, PowerMeterError> {
        Ok(self.readings.lock().energy_wh)
    }

    async fn power(&self) -> Result<f64, PowerMeterError> {
        let power = self.readings.lock().power_w;
        Ok(self.noisy(power))
    }

    async fn current(&self, phase: u8) -> Result<f64, PowerMeterError> {
        self.check_phase(phase)?;
        let current = self.readings.lock().current_a;
        Ok(self.noisy(current))
    }

    async fn voltage(&self, phase: u8) -> Result<f64, PowerMeterError> {
        self.check_phase(phase)?;
        let voltage = self.readings.lock().voltage_v;
        Ok(self.noisy(voltage))
    }

    async fn cleanup(&self) -> Result<(), PowerMeterError> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "dummy"
    }
}
