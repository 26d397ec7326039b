use crate::config::MeterConfig;

/// A published measurement.
///
/// `Unavailable` means the hardware has no such counter; it is published as
/// null, which consumers read as "not applicable" rather than "measured zero".
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Metric {
    Value(f64),
    Unavailable,
}

impl Metric {
    pub const ZERO: Metric = Metric::Value(0.0);

    pub fn value(&self) -> Option<f64> {
        match self {
            Metric::Value(v) => Some(*v),
            Metric::Unavailable => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseSample {
    pub voltage: Metric,
    pub current: Metric,
    pub power: Metric,
    /// kWh
    pub energy_forward: Metric,
    /// kWh
    pub energy_reverse: Metric,
}

impl Default for PhaseSample {
    fn default() -> Self {
        Self {
            voltage: Metric::ZERO,
            current: Metric::ZERO,
            power: Metric::ZERO,
            energy_forward: Metric::ZERO,
            energy_reverse: Metric::ZERO,
        }
    }
}

impl PhaseSample {
    /// A phase the meter does not have: no voltage, current or power, and no counters.
    pub fn absent() -> Self {
        Self {
            energy_forward: Metric::Unavailable,
            energy_reverse: Metric::Unavailable,
            ..Self::default()
        }
    }
}

/// The canonical metric set published after each successful poll.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedSample {
    /// W; positive is consumption, negative is feed-in
    pub power: f64,
    pub current: Metric,
    pub frequency: Metric,
    /// kWh bought from the grid
    pub energy_forward: f64,
    /// kWh sold to the grid
    pub energy_reverse: f64,
    pub phases: [PhaseSample; 3],
    pub update_index: u8,
    /// Smoothed acquisition latency in milliseconds
    pub latency_ms: f64,
}

impl Default for NormalizedSample {
    fn default() -> Self {
        Self {
            power: 0.0,
            current: Metric::ZERO,
            frequency: Metric::ZERO,
            energy_forward: 0.0,
            energy_reverse: 0.0,
            phases: [PhaseSample::default(); 3],
            update_index: 0,
            latency_ms: 0.0,
        }
    }
}

impl NormalizedSample {
    /// Phase `line` (1..=3).
    pub fn phase(&self, line: usize) -> &PhaseSample {
        &self.phases[line - 1]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseLayout {
    Single,
    Three,
}

/// Per-model capabilities of the supported meters.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    single_phase: Vec<String>,
    no_phase_energy: Vec<String>,
}

impl ModelCatalog {
    pub fn new(single_phase: Vec<String>, no_phase_energy: Vec<String>) -> Self {
        Self {
            single_phase,
            no_phase_energy,
        }
    }

    pub fn from_config(cfg: &MeterConfig) -> Self {
        Self::new(
            cfg.single_phase_models.clone(),
            cfg.no_phase_energy_models.clone(),
        )
    }

    /// Unknown models are treated as three-phase.
    pub fn layout(&self, model: &str) -> PhaseLayout {
        if self.single_phase.iter().any(|m| m == model) {
            PhaseLayout::Single
        } else {
            PhaseLayout::Three
        }
    }

    pub fn reports_phase_energy(&self, model: &str) -> bool {
        !self.no_phase_energy.iter().any(|m| m == model)
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::from_config(&MeterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_defaults() {
        let catalog = ModelCatalog::default();
        assert_eq!(catalog.layout("Smart Meter TS 100A-1"), PhaseLayout::Single);
        assert_eq!(catalog.layout("Smart Meter 63A-1"), PhaseLayout::Single);
        assert_eq!(catalog.layout("Smart Meter 63A"), PhaseLayout::Three);
        assert_eq!(catalog.layout("something new"), PhaseLayout::Three);
        assert!(!catalog.reports_phase_energy("Smart Meter TS 65A-3"));
        assert!(catalog.reports_phase_energy("Smart Meter 63A"));
    }

    #[test]
    fn test_absent_phase() {
        let p = PhaseSample::absent();
        assert_eq!(p.voltage, Metric::ZERO);
        assert_eq!(p.power.value(), Some(0.0));
        assert_eq!(p.energy_forward, Metric::Unavailable);
        assert_eq!(p.energy_reverse.value(), None);
    }
}
