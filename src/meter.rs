use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Measurement {
    /// Instantaneous current (A)
    pub current: f64,
    /// Instantaneous voltage (V)
    pub voltage: f64,
    /// Instantaneous active power (W)
    pub power: f64,
    /// Cumulative energy since the plug's counter was reset (kWh)
    pub total_energy: f64,
}

/// Anything that can produce one snapshot from a power meter.
pub trait MeterSource {
    fn read(&mut self) -> Result<Measurement>;
}
