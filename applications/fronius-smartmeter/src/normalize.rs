use crate::error::NormalizationError;
use crate::model::{Metric, ModelCatalog, NormalizedSample, PhaseLayout, PhaseSample};
use crate::payload::{MeterData, RawPhase};

/// Map one payload onto the canonical metric set.
///
/// Fields the payload omits keep the value from `previous` (some firmware
/// versions drop the energy counters on individual responses). Nothing is
/// returned unless every mandatory field is present.
pub fn normalize(
    data: &MeterData,
    previous: &NormalizedSample,
    latency_ms: f64,
    catalog: &ModelCatalog,
) -> Result<NormalizedSample, NormalizationError> {
    let power = data
        .power_sum
        .ok_or(NormalizationError::MissingField("PowerReal_P_Sum"))?;
    let model = data
        .model()
        .ok_or(NormalizationError::MissingField("Details.Model"))?;
    let consumed = data
        .energy_consumed_sum
        .ok_or(NormalizationError::MissingField("EnergyReal_WAC_Sum_Consumed"))?;
    let produced = data
        .energy_produced_sum
        .ok_or(NormalizationError::MissingField("EnergyReal_WAC_Sum_Produced"))?;

    let mut next = previous.clone();

    if !catalog.reports_phase_energy(model) {
        for phase in next.phases.iter_mut() {
            phase.energy_forward = Metric::Unavailable;
            phase.energy_reverse = Metric::Unavailable;
        }
    }

    next.phases[0] = merge_phase(&next.phases[0], &data.phase(1));
    match catalog.layout(model) {
        PhaseLayout::Single => {
            next.phases[1] = PhaseSample::absent();
            next.phases[2] = PhaseSample::absent();
        }
        PhaseLayout::Three => {
            next.phases[1] = merge_phase(&next.phases[1], &data.phase(2));
            next.phases[2] = merge_phase(&next.phases[2], &data.phase(3));
        }
    }

    next.current = carry(next.current, data.current_sum);
    next.frequency = carry(next.frequency, data.frequency);
    next.power = power;
    next.energy_forward = wh_to_kwh(consumed);
    next.energy_reverse = wh_to_kwh(produced);
    next.update_index = previous.update_index.wrapping_add(1);
    next.latency_ms = latency_ms;

    Ok(next)
}

/// Take `incoming` when present, else keep `previous`.
pub fn carry(previous: Metric, incoming: Option<f64>) -> Metric {
    incoming.map(Metric::Value).unwrap_or(previous)
}

fn merge_phase(previous: &PhaseSample, raw: &RawPhase) -> PhaseSample {
    PhaseSample {
        voltage: carry(previous.voltage, raw.voltage),
        current: carry(previous.current, raw.current),
        power: carry(previous.power, raw.power),
        energy_forward: carry(previous.energy_forward, raw.energy_consumed.map(wh_to_kwh)),
        energy_reverse: carry(previous.energy_reverse, raw.energy_produced.map(wh_to_kwh)),
    }
}

fn wh_to_kwh(wh: f64) -> f64 {
    wh / 1000.0
}
