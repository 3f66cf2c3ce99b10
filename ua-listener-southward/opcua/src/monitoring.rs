use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};
use ua_listener_sdk::{ListenerError, ListenerResult};

/// Queue size requested when the node does not set one.
pub const DEFAULT_QUEUE_SIZE: u32 = 10;
/// Discard policy requested when the node does not set one.
pub const DEFAULT_DISCARD_OLDEST: bool = true;

/// Per-node monitoring parameters as written in the configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringParameters {
    /// Sampling interval; zero lets the server sample as fast as it can
    #[serde(with = "humantime_serde")]
    pub sampling_interval: Duration,
    pub queue_size: Option<u32>,
    pub discard_oldest: Option<bool>,
    pub data_change_filter: Option<DataChangeFilter>,
}

/// Data-change filter settings as written in the configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataChangeFilter {
    pub trigger: String,
    pub deadband_type: String,
    pub deadband_value: Option<f64>,
}

/// Condition that makes the server report a data change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChangeTrigger {
    Status,
    StatusValue,
    StatusValueTimestamp,
}

impl DataChangeTrigger {
    /// Wire enumeration value.
    #[inline]
    pub fn code(self) -> u32 {
        match self {
            DataChangeTrigger::Status => 0,
            DataChangeTrigger::StatusValue => 1,
            DataChangeTrigger::StatusValueTimestamp => 2,
        }
    }
}

impl FromStr for DataChangeTrigger {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Status" => Ok(DataChangeTrigger::Status),
            "StatusValue" => Ok(DataChangeTrigger::StatusValue),
            "StatusValueTimestamp" => Ok(DataChangeTrigger::StatusValueTimestamp),
            _ => Err(()),
        }
    }
}

impl fmt::Display for DataChangeTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DataChangeTrigger::Status => "Status",
            DataChangeTrigger::StatusValue => "StatusValue",
            DataChangeTrigger::StatusValueTimestamp => "StatusValueTimestamp",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadbandKind {
    None,
    Absolute,
    Percent,
}

impl DeadbandKind {
    /// Wire enumeration value.
    #[inline]
    pub fn code(self) -> u32 {
        match self {
            DeadbandKind::None => 0,
            DeadbandKind::Absolute => 1,
            DeadbandKind::Percent => 2,
        }
    }
}

impl FromStr for DeadbandKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(DeadbandKind::None),
            "Absolute" => Ok(DeadbandKind::Absolute),
            "Percent" => Ok(DeadbandKind::Percent),
            _ => Err(()),
        }
    }
}

/// Validated data-change filter ready to be encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WireDataChangeFilter {
    pub trigger: DataChangeTrigger,
    pub deadband_type: DeadbandKind,
    pub deadband_value: f64,
}

/// Monitoring parameters after validation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompiledMonitoringParams {
    /// Sampling interval in milliseconds, sub-millisecond part kept
    pub sampling_interval_ms: f64,
    pub queue_size: u32,
    pub discard_oldest: bool,
    pub filter: Option<WireDataChangeFilter>,
}

impl Default for CompiledMonitoringParams {
    fn default() -> Self {
        Self {
            sampling_interval_ms: 0.0,
            queue_size: DEFAULT_QUEUE_SIZE,
            discard_oldest: DEFAULT_DISCARD_OLDEST,
            filter: None,
        }
    }
}

/// Validate `params` for the node `node_id` and compile them into their wire form.
pub fn compile(
    params: &MonitoringParameters,
    node_id: &str,
) -> ListenerResult<CompiledMonitoringParams> {
    let filter = match &params.data_change_filter {
        Some(f) => Some(compile_filter(f, node_id)?),
        None => None,
    };

    Ok(CompiledMonitoringParams {
        sampling_interval_ms: params.sampling_interval.as_nanos() as f64 / 1_000_000.0,
        queue_size: params.queue_size.unwrap_or(DEFAULT_QUEUE_SIZE),
        discard_oldest: params.discard_oldest.unwrap_or(DEFAULT_DISCARD_OLDEST),
        filter,
    })
}

fn compile_filter(filter: &DataChangeFilter, node_id: &str) -> ListenerResult<WireDataChangeFilter> {
    let trigger = filter.trigger.parse::<DataChangeTrigger>().map_err(|_| {
        ListenerError::ConfigurationError(format!(
            "trigger '{}' not supported, node '{node_id}'",
            filter.trigger
        ))
    })?;

    let deadband_type = filter.deadband_type.parse::<DeadbandKind>().map_err(|_| {
        ListenerError::ConfigurationError(format!(
            "deadband_type '{}' not supported, node '{node_id}'",
            filter.deadband_type
        ))
    })?;

    let deadband_value = filter.deadband_value.ok_or_else(|| {
        ListenerError::ConfigurationError(format!("deadband_value was not set, node '{node_id}'"))
    })?;
    if deadband_value < 0.0 {
        return Err(ListenerError::ConfigurationError(format!(
            "negative deadband_value not supported, node '{node_id}'"
        )));
    }

    Ok(WireDataChangeFilter {
        trigger,
        deadband_type,
        deadband_value,
    })
}
