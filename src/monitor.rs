use std::fmt;

use chrono::Utc;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use sysinfo::{Pid, ProcessRefreshKind, System, Users};
use thiserror::Error;

use crate::data::{
    DeviceReading, DeviceSnapshot, MemoryInfo, ProcessDetails, ProcessInfo, UtilizationInfo,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("telemetry provider initialization failed: {0}")]
    ProviderInit(String),
    #[error("telemetry query failed: {0}")]
    Query(String),
    #[error("unexpected telemetry failure: {0}")]
    Internal(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    ProviderInit,
    Query,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::ProviderInit => "provider_init",
            FailureKind::Query => "query",
            FailureKind::Internal => "internal",
        })
    }
}

impl TelemetryError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TelemetryError::ProviderInit(_) => FailureKind::ProviderInit,
            TelemetryError::Query(_) => FailureKind::Query,
            TelemetryError::Internal(_) => FailureKind::Internal,
        }
    }

    /// Only driver-side failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TelemetryError::Internal(_))
    }
}

/// Creates sessions against the telemetry driver.
///
/// Acquiring is expensive (driver init and device enumeration), so the
/// caller decides when a session is worth holding.
pub trait TelemetrySource: Send {
    type Session: TelemetrySession;

    fn acquire(&mut self) -> Result<Self::Session, TelemetryError>;
}

/// An open handle on the telemetry driver.
///
/// `release` consumes the session, so a released handle can never be queried
/// or released twice.
pub trait TelemetrySession: Send {
    fn query_all(&mut self) -> Result<DeviceSnapshot, TelemetryError>;
    fn release(self);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawProcess {
    pub pid: u32,
    pub used_gpu_memory: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawDevice {
    pub name: String,
    pub memory: MemoryInfo,
    pub utilization: UtilizationInfo,
    pub processes: Vec<RawProcess>,
}

/// Device-level reads against an initialized driver.
pub trait DeviceQuery {
    fn driver_version(&self) -> Result<String, TelemetryError>;
    fn device_count(&self) -> u32;
    fn read_device(&self, index: u32) -> Result<RawDevice, TelemetryError>;
}

/// Best-effort PID to process metadata lookup.
pub trait ProcessInspector: Send {
    /// Returns `None` when the process no longer exists.
    fn lookup(&mut self, pid: u32) -> Option<ProcessDetails>;
}

/// Build a snapshot from one pass over every device.
///
/// Device failures propagate; a process that vanished before its metadata
/// could be read is kept with `found = false`.
pub fn assemble_snapshot<Q>(
    query: &Q,
    inspector: &mut dyn ProcessInspector,
) -> Result<DeviceSnapshot, TelemetryError>
where
    Q: DeviceQuery + ?Sized,
{
    let driver_version = query.driver_version()?;
    let query_time = Utc::now();

    let mut devices = Vec::with_capacity(query.device_count() as usize);
    for index in 0..query.device_count() {
        let raw = query.read_device(index)?;
        let processes = raw
            .processes
            .into_iter()
            .map(|p| ProcessInfo {
                pid: p.pid,
                gpu_memory_bytes: p.used_gpu_memory,
                metadata: inspector.lookup(p.pid).into(),
            })
            .collect();
        devices.push(DeviceReading {
            index,
            name: raw.name,
            memory: raw.memory,
            utilization: raw.utilization,
            processes,
        });
    }

    Ok(DeviceSnapshot {
        driver_version,
        query_time,
        devices,
    })
}

pub struct SysinfoInspector {
    system: System,
    users: Users,
}

impl SysinfoInspector {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            users: Users::new_with_refreshed_list(),
        }
    }

    fn username(&mut self, uid: &sysinfo::Uid) -> String {
        if self.users.get_user_by_id(uid).is_none() {
            // user may have been created after startup
            self.users.refresh_list();
        }
        self.users
            .get_user_by_id(uid)
            .map(|user| user.name().to_string())
            .unwrap_or_default()
    }
}

impl Default for SysinfoInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessInspector for SysinfoInspector {
    fn lookup(&mut self, pid: u32) -> Option<ProcessDetails> {
        let pid = Pid::from_u32(pid);
        if !self
            .system
            .refresh_process_specifics(pid, ProcessRefreshKind::everything())
        {
            return None;
        }
        let process = self.system.process(pid)?;
        let name = process.name().to_string();
        let command = process.cmd().join(" ");
        let uid = process.user_id().cloned();
        let username = match uid {
            Some(uid) => self.username(&uid),
            None => String::new(),
        };
        Some(ProcessDetails {
            name,
            command,
            username,
        })
    }
}

fn classify(context: &str, err: NvmlError) -> TelemetryError {
    match err {
        NvmlError::Utf8Error(_) | NvmlError::UnexpectedVariant(_) => {
            TelemetryError::Internal(format!("{context}: {err}"))
        }
        other => TelemetryError::Query(format!("{context}: {other}")),
    }
}

pub struct NvmlQuery {
    nvml: Nvml,
    device_count: u32,
}

impl DeviceQuery for NvmlQuery {
    fn driver_version(&self) -> Result<String, TelemetryError> {
        self.nvml
            .sys_driver_version()
            .map_err(|e| classify("driver version", e))
    }

    fn device_count(&self) -> u32 {
        self.device_count
    }

    fn read_device(&self, index: u32) -> Result<RawDevice, TelemetryError> {
        let device = self
            .nvml
            .device_by_index(index)
            .map_err(|e| classify(&format!("device {index}"), e))?;

        let name = device
            .name()
            .map_err(|e| classify(&format!("device {index} name"), e))?;
        let mem = device
            .memory_info()
            .map_err(|e| classify(&format!("device {index} memory"), e))?;
        let util = device
            .utilization_rates()
            .map_err(|e| classify(&format!("device {index} utilization"), e))?;
        let processes = device
            .running_compute_processes()
            .map_err(|e| classify(&format!("device {index} processes"), e))?
            .into_iter()
            .map(|proc| RawProcess {
                pid: proc.pid,
                used_gpu_memory: match proc.used_gpu_memory {
                    UsedGpuMemory::Used(v) => v,
                    UsedGpuMemory::Unavailable => 0,
                },
            })
            .collect();

        Ok(RawDevice {
            name,
            memory: MemoryInfo {
                total: mem.total,
                free: mem.free,
                used: mem.used,
            },
            utilization: UtilizationInfo {
                gpu: util.gpu,
                memory: util.memory,
            },
            processes,
        })
    }
}

/// Production source backed by NVML.
#[derive(Debug, Default)]
pub struct NvmlSource;

impl NvmlSource {
    pub fn new() -> Self {
        Self
    }
}

impl TelemetrySource for NvmlSource {
    type Session = NvmlSession;

    fn acquire(&mut self) -> Result<NvmlSession, TelemetryError> {
        let nvml = Nvml::init().map_err(|e| TelemetryError::ProviderInit(e.to_string()))?;
        let device_count = nvml
            .device_count()
            .map_err(|e| TelemetryError::ProviderInit(format!("device enumeration: {e}")))?;
        tracing::info!(device_count, "NVML initialized");
        Ok(NvmlSession {
            query: NvmlQuery { nvml, device_count },
            inspector: SysinfoInspector::new(),
        })
    }
}

pub struct NvmlSession {
    query: NvmlQuery,
    inspector: SysinfoInspector,
}

impl TelemetrySession for NvmlSession {
    fn query_all(&mut self) -> Result<DeviceSnapshot, TelemetryError> {
        assemble_snapshot(&self.query, &mut self.inspector)
    }

    fn release(self) {
        match self.query.nvml.shutdown() {
            Ok(()) => tracing::info!("NVML shut down"),
            Err(e) => tracing::warn!("NVML shutdown failed: {}", e),
        }
    }
}
