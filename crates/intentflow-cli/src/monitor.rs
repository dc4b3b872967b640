//! Background process/host utilization sampler writing CSV rows.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sysinfo::{Networks, Pid, ProcessesToUpdate, System};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const CSV_HEADER: [&str; 12] = [
    "timestamp",
    "elapsed_s",
    "pid",
    "proc_cpu_percent",
    "proc_mem_percent",
    "proc_rss_bytes",
    "sys_cpu_percent",
    "sys_mem_percent",
    "disk_read_bytes",
    "disk_write_bytes",
    "net_bytes_sent",
    "net_bytes_recv",
];

/// One CSV row. Byte counters are cumulative since process/interface start.
#[derive(Debug, Clone, PartialEq)]
pub struct UtilizationSample {
    pub timestamp: DateTime<Utc>,
    pub elapsed: Duration,
    pub pid: u32,
    pub proc_cpu_percent: f32,
    pub proc_mem_percent: f64,
    pub proc_rss_bytes: u64,
    pub sys_cpu_percent: f32,
    pub sys_mem_percent: f64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    pub net_bytes_sent: u64,
    pub net_bytes_recv: u64,
}

impl UtilizationSample {
    pub fn to_record(&self) -> [String; 12] {
        [
            format!(
                "{}.{:06}",
                self.timestamp.timestamp(),
                self.timestamp.timestamp_subsec_micros()
            ),
            format!("{:.3}", self.elapsed.as_secs_f64()),
            self.pid.to_string(),
            format!("{:.2}", self.proc_cpu_percent),
            format!("{:.2}", self.proc_mem_percent),
            self.proc_rss_bytes.to_string(),
            format!("{:.2}", self.sys_cpu_percent),
            format!("{:.2}", self.sys_mem_percent),
            self.disk_read_bytes.to_string(),
            self.disk_write_bytes.to_string(),
            self.net_bytes_sent.to_string(),
            self.net_bytes_recv.to_string(),
        ]
    }
}

/// Reads counters for the current process and the host.
struct Probe {
    system: System,
    pid: Pid,
    started: Instant,
}

impl Probe {
    fn new() -> Result<Self> {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| anyhow::anyhow!("cannot determine current pid: {e}"))?;
        let mut system = System::new();
        // Prime the CPU counters so the first sample has a baseline.
        system.refresh_cpu_all();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        Ok(Self {
            system,
            pid,
            started: Instant::now(),
        })
    }

    fn sample(&mut self) -> UtilizationSample {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);

        let total_memory = self.system.total_memory();
        let percent_of_total = |bytes: u64| {
            if total_memory == 0 {
                0.0
            } else {
                bytes as f64 / total_memory as f64 * 100.0
            }
        };

        let (proc_cpu, rss, disk_read, disk_write) = match self.system.process(self.pid) {
            Some(p) => {
                let disk = p.disk_usage();
                (p.cpu_usage(), p.memory(), disk.total_read_bytes, disk.total_written_bytes)
            }
            None => (0.0, 0, 0, 0),
        };

        let networks = Networks::new_with_refreshed_list();
        let (sent, recv) = networks.iter().fold((0u64, 0u64), |(s, r), (_, data)| {
            (s + data.total_transmitted(), r + data.total_received())
        });

        UtilizationSample {
            timestamp: Utc::now(),
            elapsed: self.started.elapsed(),
            pid: self.pid.as_u32(),
            proc_cpu_percent: proc_cpu,
            proc_mem_percent: percent_of_total(rss),
            proc_rss_bytes: rss,
            sys_cpu_percent: self.system.global_cpu_usage(),
            sys_mem_percent: percent_of_total(self.system.used_memory()),
            disk_read_bytes: disk_read,
            disk_write_bytes: disk_write,
            net_bytes_sent: sent,
            net_bytes_recv: recv,
        }
    }
}

/// Opens `path` for appending; writes the header only when the file is new.
pub fn open_sink(path: &Path) -> Result<csv::Writer<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let is_new = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening utilization log {}", path.display()))?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    if is_new {
        writer.write_record(CSV_HEADER)?;
        writer.flush()?;
    }
    Ok(writer)
}

pub struct UtilizationSampler {
    path: PathBuf,
    interval: Duration,
}

impl UtilizationSampler {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
        }
    }

    /// Spawn the sampling task. Each iteration waits one interval, then
    /// samples and flushes a row, unless shutdown was signalled first.
    pub fn start(self) -> Result<SamplerHandle> {
        let mut writer = open_sink(&self.path)?;
        let mut probe = Probe::new()?;
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let path = self.path.clone();
        let interval = self.interval;

        let task = tokio::spawn(async move {
            info!(path = %path.display(), interval_ms = interval.as_millis() as u64, "Utilization sampler started");
            let mut rows = 0u64;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let sample = probe.sample();
                        writer.write_record(sample.to_record())?;
                        writer.flush()?;
                        rows += 1;
                        debug!(
                            proc_cpu = sample.proc_cpu_percent,
                            sys_cpu = sample.sys_cpu_percent,
                            rss = sample.proc_rss_bytes,
                            "Utilization sampled"
                        );
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            info!(rows, "Utilization sampler stopped");
            Ok(rows)
        });

        Ok(SamplerHandle {
            shutdown: shutdown_tx,
            task,
            path: self.path,
        })
    }
}

pub struct SamplerHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<u64>>,
    path: PathBuf,
}

impl SamplerHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Signal shutdown and wait for the task. Returns the number of rows written.
    pub async fn stop(self) -> Result<u64> {
        if self.shutdown.send(()).is_err() {
            warn!("Utilization sampler already exited");
        }
        self.task.await.context("utilization sampler task panicked")?
    }
}
