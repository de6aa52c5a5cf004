use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

use crate::monitor::TelemetryError;

// One poll of every device, built fresh on each successful query
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub driver_version: String,
    pub query_time: DateTime<Utc>,
    #[serde(rename = "gpus")]
    pub devices: Vec<DeviceReading>,
}

impl DeviceSnapshot {
    /// Render the JSON text pushed to subscribers.
    pub fn to_payload(&self) -> Result<String, TelemetryError> {
        serde_json::to_string(self)
            .map_err(|e| TelemetryError::Internal(format!("snapshot serialization: {e}")))
    }
}

// Readings for a single device, in device index order
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceReading {
    pub index: u32,
    pub name: String,
    pub memory: MemoryInfo,
    pub utilization: UtilizationInfo,
    pub processes: Vec<ProcessInfo>,
}

// Bytes as reported by the driver; used + free == total is not enforced here
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemoryInfo {
    pub total: u64,
    pub free: u64,
    pub used: u64,
}

// Percentages, passed through unchecked
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UtilizationInfo {
    pub gpu: u32,
    pub memory: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessDetails {
    pub name: String,
    pub command: String,
    pub username: String,
}

/// Host-side metadata of a GPU process.
///
/// `NotFound` means the process exited between the driver listing it and the
/// lookup. That race is expected and is not an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessMetadata {
    Found(ProcessDetails),
    NotFound,
}

impl From<Option<ProcessDetails>> for ProcessMetadata {
    fn from(details: Option<ProcessDetails>) -> Self {
        details.map_or(ProcessMetadata::NotFound, ProcessMetadata::Found)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub gpu_memory_bytes: u64,
    pub metadata: ProcessMetadata,
}

impl ProcessInfo {
    pub fn found(&self) -> bool {
        matches!(self.metadata, ProcessMetadata::Found(_))
    }

    pub fn details(&self) -> Option<&ProcessDetails> {
        match &self.metadata {
            ProcessMetadata::Found(details) => Some(details),
            ProcessMetadata::NotFound => None,
        }
    }
}

impl Serialize for ProcessInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let details = self.details();
        let len = if details.is_some() { 6 } else { 3 };
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry("pid", &self.pid)?;
        map.serialize_entry("memory", &self.gpu_memory_bytes)?;
        map.serialize_entry("found", &details.is_some())?;
        if let Some(details) = details {
            map.serialize_entry("name", &details.name)?;
            map.serialize_entry("command", &details.command)?;
            map.serialize_entry("username", &details.username)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::*;

    fn snapshot(processes: Vec<ProcessInfo>) -> DeviceSnapshot {
        DeviceSnapshot {
            driver_version: "535.10".to_string(),
            query_time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap(),
            devices: vec![DeviceReading {
                index: 0,
                name: "NVIDIA A100".to_string(),
                memory: MemoryInfo {
                    total: 100,
                    free: 60,
                    used: 40,
                },
                utilization: UtilizationInfo {
                    gpu: 12,
                    memory: 7,
                },
                processes,
            }],
        }
    }

    #[test]
    fn payload_uses_wire_field_names() {
        let value = serde_json::to_value(snapshot(vec![])).unwrap();

        assert_eq!(
            value,
            json!({
                "driver_version": "535.10",
                "query_time": "2024-03-01T12:30:05Z",
                "gpus": [{
                    "index": 0,
                    "name": "NVIDIA A100",
                    "memory": {"total": 100, "free": 60, "used": 40},
                    "utilization": {"gpu": 12, "memory": 7},
                    "processes": []
                }]
            })
        );
    }

    #[test]
    fn missing_process_omits_metadata_keys() {
        let processes = vec![
            ProcessInfo {
                pid: 10,
                gpu_memory_bytes: 2048,
                metadata: ProcessMetadata::Found(ProcessDetails {
                    name: "python".to_string(),
                    command: "python train.py --epochs 3".to_string(),
                    username: "alice".to_string(),
                }),
            },
            ProcessInfo {
                pid: 11,
                gpu_memory_bytes: 512,
                metadata: ProcessMetadata::NotFound,
            },
        ];
        let value = serde_json::to_value(snapshot(processes)).unwrap();

        assert_eq!(
            value["gpus"][0]["processes"],
            json!([
                {
                    "pid": 10,
                    "memory": 2048,
                    "found": true,
                    "name": "python",
                    "command": "python train.py --epochs 3",
                    "username": "alice"
                },
                {"pid": 11, "memory": 512, "found": false}
            ])
        );
    }

    #[test]
    fn metadata_from_lookup_result() {
        assert_eq!(ProcessMetadata::from(None), ProcessMetadata::NotFound);
        let info = ProcessInfo {
            pid: 1,
            gpu_memory_bytes: 0,
            metadata: ProcessMetadata::NotFound,
        };
        assert!(!info.found());
        assert!(info.details().is_none());
    }

    #[test]
    fn payload_is_json_text() {
        let payload = snapshot(vec![]).to_payload().unwrap();
        assert!(payload.starts_with("{\"driver_version\":\"535.10\""));
    }
}
