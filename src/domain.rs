use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// which stream flavour an endpoint serves
///
/// the field sets differ per kind but the hub treats every numeric field the
/// same way, so the kind is only used for labelling and link tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// pi-pulse: cpu, cpu_freq, mem, temp, net_rx_bps_total, ...
    SystemMetrics,
    /// sen66 main stream: temperature_c, humidity_rh, co2_ppm, voc/nox, pm mass
    SensorMain,
    /// sen66 number-concentration stream: nc_pm0_5_pcm3 ... nc_pm10_0_pcm3
    SensorNumberConcentration,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::SystemMetrics => "system_metrics",
            EndpointKind::SensorMain => "sensor_main",
            EndpointKind::SensorNumberConcentration => "sensor_number_concentration",
        }
    }

    pub fn is_sensor(&self) -> bool {
        !matches!(self, EndpointKind::SystemMetrics)
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// one configured sse source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointDescriptor {
    /// device key from the config (e.g. "11")
    pub device_id: String,
    /// human label (e.g. "11 (192.168.121.11)")
    pub label: String,
    pub kind: EndpointKind,
    pub url: String,
}

impl EndpointDescriptor {
    /// short tag used in log lines, e.g. "sen66-nc-11"
    pub fn tag(&self) -> String {
        let prefix = match self.kind {
            EndpointKind::SystemMetrics => "pulse",
            EndpointKind::SensorMain => "sen66",
            EndpointKind::SensorNumberConcentration => "sen66-nc",
        };
        format!("{}-{}", prefix, self.device_id)
    }
}

/// a single numeric reading extracted from one sse payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub device_id: String,
    /// stream the sample arrived on
    pub source: EndpointKind,
    /// json field name, e.g. "cpu" or "co2_ppm"
    pub metric: String,
    pub value: f64,
    pub received_at: DateTime<Utc>,
}
