use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::warn;

/// One `Body.Data` object of `GetMeterRealtimeData.cgi`.
///
/// Every field is optional at this layer; which ones are mandatory is decided
/// by the normalizer. Numeric fields accept JSON numbers and numeric strings.
/// A garbled mandatory counter fails the parse; any other garbled reading is
/// dropped, so the previously published value stays.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MeterData {
    #[serde(rename = "PowerReal_P_Sum", default, deserialize_with = "strict_f64")]
    pub power_sum: Option<f64>,
    #[serde(rename = "Current_AC_Sum", default, deserialize_with = "lenient_f64")]
    pub current_sum: Option<f64>,
    #[serde(
        rename = "Frequency_Phase_Average",
        default,
        deserialize_with = "lenient_f64"
    )]
    pub frequency: Option<f64>,
    #[serde(
        rename = "EnergyReal_WAC_Sum_Consumed",
        default,
        deserialize_with = "strict_f64"
    )]
    pub energy_consumed_sum: Option<f64>,
    #[serde(
        rename = "EnergyReal_WAC_Sum_Produced",
        default,
        deserialize_with = "strict_f64"
    )]
    pub energy_produced_sum: Option<f64>,

    #[serde(rename = "Voltage_AC_Phase_1", default, deserialize_with = "lenient_f64")]
    pub voltage_l1: Option<f64>,
    #[serde(rename = "Voltage_AC_Phase_2", default, deserialize_with = "lenient_f64")]
    pub voltage_l2: Option<f64>,
    #[serde(rename = "Voltage_AC_Phase_3", default, deserialize_with = "lenient_f64")]
    pub voltage_l3: Option<f64>,

    #[serde(rename = "Current_AC_Phase_1", default, deserialize_with = "lenient_f64")]
    pub current_l1: Option<f64>,
    #[serde(rename = "Current_AC_Phase_2", default, deserialize_with = "lenient_f64")]
    pub current_l2: Option<f64>,
    #[serde(rename = "Current_AC_Phase_3", default, deserialize_with = "lenient_f64")]
    pub current_l3: Option<f64>,

    #[serde(rename = "PowerReal_P_Phase_1", default, deserialize_with = "lenient_f64")]
    pub power_l1: Option<f64>,
    #[serde(rename = "PowerReal_P_Phase_2", default, deserialize_with = "lenient_f64")]
    pub power_l2: Option<f64>,
    #[serde(rename = "PowerReal_P_Phase_3", default, deserialize_with = "lenient_f64")]
    pub power_l3: Option<f64>,

    #[serde(
        rename = "EnergyReal_WAC_Phase_1_Consumed",
        default,
        deserialize_with = "lenient_f64"
    )]
    pub energy_consumed_l1: Option<f64>,
    #[serde(
        rename = "EnergyReal_WAC_Phase_2_Consumed",
        default,
        deserialize_with = "lenient_f64"
    )]
    pub energy_consumed_l2: Option<f64>,
    #[serde(
        rename = "EnergyReal_WAC_Phase_3_Consumed",
        default,
        deserialize_with = "lenient_f64"
    )]
    pub energy_consumed_l3: Option<f64>,

    #[serde(
        rename = "EnergyReal_WAC_Phase_1_Produced",
        default,
        deserialize_with = "lenient_f64"
    )]
    pub energy_produced_l1: Option<f64>,
    #[serde(
        rename = "EnergyReal_WAC_Phase_2_Produced",
        default,
        deserialize_with = "lenient_f64"
    )]
    pub energy_produced_l2: Option<f64>,
    #[serde(
        rename = "EnergyReal_WAC_Phase_3_Produced",
        default,
        deserialize_with = "lenient_f64"
    )]
    pub energy_produced_l3: Option<f64>,

    #[serde(rename = "Details", default)]
    pub details: MeterDetails,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MeterDetails {
    #[serde(rename = "Model")]
    pub model: Option<String>,
    #[serde(rename = "Manufacturer")]
    pub manufacturer: Option<String>,
    #[serde(rename = "Serial")]
    pub serial: Option<String>,
}

/// The raw readings of a single phase, energies still in Wh.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawPhase {
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub energy_consumed: Option<f64>,
    pub energy_produced: Option<f64>,
}

impl MeterData {
    /// Readings of phase `line` (1..=3). Any other line number has no readings.
    pub fn phase(&self, line: usize) -> RawPhase {
        match line {
            1 => RawPhase {
                voltage: self.voltage_l1,
                current: self.current_l1,
                power: self.power_l1,
                energy_consumed: self.energy_consumed_l1,
                energy_produced: self.energy_produced_l1,
            },
            2 => RawPhase {
                voltage: self.voltage_l2,
                current: self.current_l2,
                power: self.power_l2,
                energy_consumed: self.energy_consumed_l2,
                energy_produced: self.energy_produced_l2,
            },
            3 => RawPhase {
                voltage: self.voltage_l3,
                current: self.current_l3,
                power: self.power_l3,
                energy_consumed: self.energy_consumed_l3,
                energy_produced: self.energy_produced_l3,
            },
            _ => RawPhase::default(),
        }
    }

    pub fn model(&self) -> Option<&str> {
        self.details.model.as_deref()
    }

    /// "{Manufacturer} {Model}", falling back to whichever part is known.
    pub fn product_name(&self) -> Option<String> {
        match (&self.details.manufacturer, &self.details.model) {
            (Some(m), Some(model)) => Some(format!("{m} {model}")),
            (None, Some(model)) => Some(model.clone()),
            (Some(m), None) => Some(m.clone()),
            (None, None) => None,
        }
    }
}

fn strict_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(v) => number(&v)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("not a number: {v}"))),
    }
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => return Ok(None),
        Some(v) => v,
    };
    let parsed = number(&value);
    if parsed.is_none() {
        warn!(value = %value, "ignoring unreadable meter reading");
    }
    Ok(parsed)
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}
