//! Host and process telemetry read from `/proc`.
//!
//! Every reader degrades to zeroed fields when its source is unavailable, so
//! a snapshot is always produced.

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::pending::PendingJob;
use crate::error::{PyplnError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSnapshot {
    #[serde(rename = "created at")]
    pub created_at: DateTime<Utc>,
    pub host: HostInfo,
    /// The broker first, then one entry per running worker.
    pub processes: Vec<ProcessInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    pub network: NetworkInfo,
    /// Keyed by device.
    pub storage: BTreeMap<String, StorageInfo>,
    /// Seconds since boot.
    pub uptime: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuInfo {
    #[serde(rename = "cpu percent")]
    pub cpu_percent: f64,
    #[serde(rename = "number of cpus")]
    pub number_of_cpus: usize,
}

/// Sizes in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub buffers: u64,
    pub cached: u64,
    pub free: u64,
    #[serde(rename = "free virtual")]
    pub free_virtual: u64,
    pub percent: f64,
    #[serde(rename = "real free")]
    pub real_free: u64,
    #[serde(rename = "real percent")]
    pub real_percent: f64,
    #[serde(rename = "real used")]
    pub real_used: u64,
    pub total: u64,
    #[serde(rename = "total virtual")]
    pub total_virtual: u64,
    pub used: u64,
    #[serde(rename = "used virtual")]
    pub used_virtual: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Address this host uses to reach the manager.
    #[serde(rename = "cluster ip")]
    pub cluster_ip: Option<String>,
    pub interfaces: BTreeMap<String, InterfaceInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    #[serde(rename = "bytes received")]
    pub bytes_received: u64,
    #[serde(rename = "bytes sent")]
    pub bytes_sent: u64,
    #[serde(rename = "packets received")]
    pub packets_received: u64,
    #[serde(rename = "packets sent")]
    pub packets_sent: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageInfo {
    #[serde(rename = "file system")]
    pub file_system: String,
    #[serde(rename = "mount point")]
    pub mount_point: String,
    #[serde(rename = "percent used")]
    pub percent_used: f64,
    #[serde(rename = "total bytes")]
    pub total_bytes: u64,
    #[serde(rename = "total free bytes")]
    pub total_free_bytes: u64,
    #[serde(rename = "total used bytes")]
    pub total_used_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    Broker,
    Worker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    #[serde(rename = "type")]
    pub kind: ProcessKind,
    #[serde(rename = "cpu percent")]
    pub cpu_percent: f64,
    /// Bytes.
    #[serde(rename = "resident memory")]
    pub resident_memory: u64,
    /// Bytes.
    #[serde(rename = "virtual memory")]
    pub virtual_memory: u64,
    #[serde(rename = "started at")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "active workers", skip_serializing_if = "Option::is_none", default)]
    pub active_workers: Option<usize>,
    #[serde(rename = "job id", skip_serializing_if = "Option::is_none", default)]
    pub job_id: Option<String>,
    #[serde(rename = "document id", skip_serializing_if = "Option::is_none", default)]
    pub document_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub worker: Option<String>,
}

/// Produces [`MonitoringSnapshot`]s for one broker.
#[derive(Debug, Clone)]
pub struct Monitor {
    cluster_ip: Option<IpAddr>,
    started_at: DateTime<Utc>,
    /// (busy, total) jiffies at the previous snapshot.
    last_cpu: Option<(u64, u64)>,
}

impl Monitor {
    pub fn new(cluster_ip: Option<IpAddr>) -> Self {
        Self {
            cluster_ip,
            started_at: Utc::now(),
            last_cpu: None,
        }
    }

    /// [`snapshot`](Self::snapshot) on the blocking pool. Walking `/proc` and
    /// every mount can take a while and must not hold up an async worker
    /// thread.
    pub async fn snapshot_blocking(&mut self, pending: Vec<PendingJob>) -> Result<MonitoringSnapshot> {
        let mut monitor = self.clone();
        let (monitor, snapshot) = tokio::task::spawn_blocking(move || {
            let snapshot = monitor.snapshot(pending.iter());
            (monitor, snapshot)
        })
        .await
        .map_err(|e| PyplnError::Supervision(format!("snapshot task failed: {}", e)))?;
        self.last_cpu = monitor.last_cpu;
        Ok(snapshot)
    }

    /// Snapshot the host, this process and every pending worker.
    pub fn snapshot<'a>(&mut self, pending: impl Iterator<Item = &'a PendingJob>) -> MonitoringSnapshot {
        let pending: Vec<&PendingJob> = pending.collect();
        let uptime = read_uptime();

        let mut broker = process_info(std::process::id(), ProcessKind::Broker, uptime)
            .unwrap_or_else(|| ProcessInfo::empty(std::process::id(), ProcessKind::Broker, self.started_at));
        broker.active_workers = Some(pending.len());

        let mut processes = vec![broker];
        for job in pending {
            let mut info = process_info(job.pid, ProcessKind::Worker, uptime)
                .unwrap_or_else(|| ProcessInfo::empty(job.pid, ProcessKind::Worker, job.started_at));
            info.job_id = Some(job.job_id.to_string());
            info.document_id = Some(job.document.clone());
            info.worker = Some(job.worker.clone());
            processes.push(info);
        }

        MonitoringSnapshot {
            created_at: Utc::now(),
            host: HostInfo {
                cpu: CpuInfo {
                    cpu_percent: self.cpu_percent(),
                    number_of_cpus: crate::config::default_concurrency(),
                },
                memory: read_memory(),
                network: NetworkInfo {
                    cluster_ip: self.cluster_ip.map(|ip| ip.to_string()),
                    interfaces: read_interfaces(),
                },
                storage: read_storage(),
                uptime,
            },
            processes,
        }
    }

    /// Busy share of all CPU time since the previous snapshot (since boot on
    /// the first one).
    fn cpu_percent(&mut self) -> f64 {
        let Some((busy, total)) = read_cpu_jiffies() else {
            return 0.0;
        };
        let (last_busy, last_total) = self.last_cpu.replace((busy, total)).unwrap_or((0, 0));
        let total_delta = total.saturating_sub(last_total);
        if total_delta == 0 {
            return 0.0;
        }
        busy.saturating_sub(last_busy) as f64 / total_delta as f64 * 100.0
    }
}

impl ProcessInfo {
    fn empty(pid: u32, kind: ProcessKind, started_at: DateTime<Utc>) -> Self {
        Self {
            pid,
            kind,
            cpu_percent: 0.0,
            resident_memory: 0,
            virtual_memory: 0,
            started_at,
            active_workers: None,
            job_id: None,
            document_id: None,
            worker: None,
        }
    }
}

fn process_info(pid: u32, kind: ProcessKind, uptime: f64) -> Option<ProcessInfo> {
    let process = procfs::process::Process::new(i32::try_from(pid).ok()?).ok()?;
    let stat = process.stat().ok()?;

    let ticks = procfs::ticks_per_second() as f64;
    let started_secs = stat.starttime as f64 / ticks;
    let elapsed = uptime - started_secs;
    let cpu_percent = if elapsed > 0.0 {
        (stat.utime + stat.stime) as f64 / ticks / elapsed * 100.0
    } else {
        0.0
    };
    let since_start = ChronoDuration::milliseconds((elapsed.max(0.0) * 1000.0) as i64);

    Some(ProcessInfo {
        cpu_percent,
        resident_memory: stat.rss * procfs::page_size(),
        virtual_memory: stat.vsize,
        started_at: Utc::now() - since_start,
        ..ProcessInfo::empty(pid, kind, Utc::now())
    })
}

fn read_uptime() -> f64 {
    std::fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|content| content.split_whitespace().next()?.parse().ok())
        .unwrap_or(0.0)
}

/// Aggregate `cpu` line of /proc/stat as (busy, total).
fn read_cpu_jiffies() -> Option<(u64, u64)> {
    let content = std::fs::read_to_string("/proc/stat").ok()?;
    parse_cpu_line(content.lines().next()?)
}

fn parse_cpu_line(line: &str) -> Option<(u64, u64)> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields.filter_map(|v| v.parse().ok()).collect();
    if values.len() < 4 {
        return None;
    }
    let total: u64 = values.iter().sum();
    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some((total - idle, total))
}

fn read_memory() -> MemoryInfo {
    std::fs::read_to_string("/proc/meminfo")
        .map(|content| parse_meminfo(&content))
        .unwrap_or_default()
}

fn parse_meminfo(content: &str) -> MemoryInfo {
    let fields: BTreeMap<&str, u64> = content
        .lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
            Some((key.trim(), kb * 1024))
        })
        .collect();
    let get = |key: &str| fields.get(key).copied().unwrap_or(0);

    let total = get("MemTotal");
    let free = get("MemFree");
    let buffers = get("Buffers");
    let cached = get("Cached");
    let real_free = match fields.get("MemAvailable") {
        Some(available) => *available,
        None => free + buffers + cached,
    };
    let used = total.saturating_sub(free);
    let real_used = total.saturating_sub(real_free);
    let total_virtual = get("SwapTotal");
    let free_virtual = get("SwapFree");

    MemoryInfo {
        buffers,
        cached,
        free,
        free_virtual,
        percent: percent(used, total),
        real_free,
        real_percent: percent(real_used, total),
        real_used,
        total,
        total_virtual,
        used,
        used_virtual: total_virtual.saturating_sub(free_virtual),
    }
}

fn read_interfaces() -> BTreeMap<String, InterfaceInfo> {
    std::fs::read_to_string("/proc/net/dev")
        .map(|content| parse_net_dev(&content))
        .unwrap_or_default()
}

fn parse_net_dev(content: &str) -> BTreeMap<String, InterfaceInfo> {
    content
        .lines()
        .filter_map(|line| {
            let (name, counters) = line.split_once(':')?;
            let counters: Vec<u64> = counters
                .split_whitespace()
                .filter_map(|v| v.parse().ok())
                .collect();
            if counters.len() < 10 {
                return None;
            }
            Some((
                name.trim().to_string(),
                InterfaceInfo {
                    bytes_received: counters[0],
                    packets_received: counters[1],
                    bytes_sent: counters[8],
                    packets_sent: counters[9],
                },
            ))
        })
        .collect()
}

fn read_storage() -> BTreeMap<String, StorageInfo> {
    let Ok(mounts) = std::fs::read_to_string("/proc/mounts") else {
        return BTreeMap::new();
    };
    let mut storage = BTreeMap::new();
    for (device, mount_point, file_system) in parse_mounts(&mounts) {
        if storage.contains_key(device) {
            continue;
        }
        let Ok(stat) = nix::sys::statvfs::statvfs(mount_point) else {
            continue;
        };
        let block = stat.fragment_size() as u64;
        let total_bytes = stat.blocks() as u64 * block;
        let total_free_bytes = stat.blocks_available() as u64 * block;
        let total_used_bytes = total_bytes.saturating_sub(stat.blocks_free() as u64 * block);
        storage.insert(
            device.to_string(),
            StorageInfo {
                file_system: file_system.to_string(),
                mount_point: mount_point.to_string(),
                percent_used: percent(total_used_bytes, total_used_bytes + total_free_bytes),
                total_bytes,
                total_free_bytes,
                total_used_bytes,
            },
        );
    }
    storage
}

/// (device, mount point, file system) of block-device mounts.
fn parse_mounts(content: &str) -> Vec<(&str, &str, &str)> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let file_system = fields.next()?;
            device
                .starts_with("/dev/")
                .then_some((device, mount_point, file_system))
        })
        .collect()
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}
