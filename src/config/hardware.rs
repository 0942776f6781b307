//! Host hardware probing and the defaulting rules for "auto" settings.
//!
//! Every probe goes through [`HardwareProbe`] so the resolution rules can be
//! exercised without a GPU or a particular core count.

use std::{
    cell::OnceCell,
    io::Read,
    process::{Command, ExitStatus, Stdio},
    sync::mpsc,
    time::Duration,
};

use thiserror::Error;

use crate::config::settings::{ComputeType, Device, RequestedComputeType, RequestedDevice};

/// VRAM at or above this threshold keeps full half-precision weights.
const FLOAT16_MIN_VRAM_MB: u64 = 8000;
const CUDA_MAX_WORKERS: usize = 1;
const CPU_MAX_WORKERS: usize = 2;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Arm64,
    X86_64,
}

impl Arch {
    pub fn current() -> Self {
        match std::env::consts::ARCH {
            "aarch64" | "arm64" => Arch::Arm64,
            _ => Arch::X86_64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl OsFamily {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => OsFamily::Linux,
            "macos" => OsFamily::MacOs,
            "windows" => OsFamily::Windows,
            _ => OsFamily::Other,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe command failed to run: {0}")]
    Io(#[from] std::io::Error),
    #[error("probe command exited with {0}")]
    Status(ExitStatus),
    #[error("probe command timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected probe output: {0:?}")]
    Malformed(String),
}

/// Narrow capability interface over the host.
pub trait HardwareProbe {
    fn arch(&self) -> Arch;
    fn os(&self) -> OsFamily;
    /// Whether a CUDA inference backend is usable.
    fn cuda_available(&self) -> bool;
    /// Total memory of the first GPU, in MB.
    fn vram_total_mb(&self) -> Result<u64, ProbeError>;
    fn physical_cores(&self) -> usize;
}

/// Snapshot of what the probes reported, for the startup summary.
#[derive(Debug, Clone, PartialEq)]
pub struct HardwareProfile {
    pub arch: Arch,
    pub os: OsFamily,
    /// A CUDA device is present, whichever device was configured.
    pub gpu: bool,
    /// `None` when VRAM was never queried or the query failed.
    pub vram_mb: Option<u64>,
    pub physical_cores: usize,
}

/// Probes the machine the process runs on.
#[derive(Debug, Default)]
pub struct SystemProbe;

impl HardwareProbe for SystemProbe {
    fn arch(&self) -> Arch {
        Arch::current()
    }

    fn os(&self) -> OsFamily {
        OsFamily::current()
    }

    fn cuda_available(&self) -> bool {
        // The CUDA backend only exists when whisper.cpp was built with it.
        if !cfg!(feature = "cuda") {
            return false;
        }
        match command_output("nvidia-smi", &["-L"]) {
            Ok(out) => out.lines().any(|l| l.starts_with("GPU")),
            Err(e) => {
                tracing::debug!(error = %e, "nvidia-smi -L failed, no CUDA device");
                false
            }
        }
    }

    fn vram_total_mb(&self) -> Result<u64, ProbeError> {
        let out = command_output(
            "nvidia-smi",
            &["--query-gpu=memory.total", "--format=csv,noheader,nounits"],
        )?;
        parse_vram_mb(&out)
    }

    fn physical_cores(&self) -> usize {
        sysinfo::System::physical_core_count()
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(4)
    }
}

/// Parses `nvidia-smi` csv output; the first line is the first GPU.
pub fn parse_vram_mb(output: &str) -> Result<u64, ProbeError> {
    let first = output.trim().lines().next().unwrap_or_default().trim();
    first
        .parse()
        .map_err(|_| ProbeError::Malformed(first.to_owned()))
}

fn command_output(program: &str, args: &[&str]) -> Result<String, ProbeError> {
    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProbeError::Malformed("no stdout".into()))?;

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut buf = String::new();
        let res = stdout.read_to_string(&mut buf).map(|_| buf);
        let _ = tx.send(res);
    });

    match rx.recv_timeout(PROBE_TIMEOUT) {
        Ok(read) => {
            let status = child.wait()?;
            if !status.success() {
                return Err(ProbeError::Status(status));
            }
            Ok(read?)
        }
        Err(_) => {
            let _ = child.kill();
            let _ = child.wait();
            Err(ProbeError::Timeout(PROBE_TIMEOUT))
        }
    }
}

/// Applies the defaulting rules for fields left as "auto" / 0.
///
/// Each probe runs at most once per resolver; later reads use the recorded
/// result.
pub struct HardwareResolver<'a> {
    probe: &'a dyn HardwareProbe,
    cuda: OnceCell<bool>,
    vram_mb: OnceCell<Option<u64>>,
    cores: OnceCell<usize>,
}

impl<'a> HardwareResolver<'a> {
    pub fn new(probe: &'a dyn HardwareProbe) -> Self {
        Self {
            probe,
            cuda: OnceCell::new(),
            vram_mb: OnceCell::new(),
            cores: OnceCell::new(),
        }
    }

    fn cuda_available(&self) -> bool {
        *self.cuda.get_or_init(|| self.probe.cuda_available())
    }

    fn vram_mb(&self) -> Option<u64> {
        *self.vram_mb.get_or_init(|| match self.probe.vram_total_mb() {
            Ok(mb) => Some(mb),
            Err(e) => {
                tracing::warn!(error = %e, "VRAM query failed");
                None
            }
        })
    }

    fn physical_cores(&self) -> usize {
        *self.cores.get_or_init(|| self.probe.physical_cores())
    }

    pub fn resolve_device(&self, requested: RequestedDevice) -> Device {
        match requested {
            RequestedDevice::Cpu => return Device::Cpu,
            RequestedDevice::Cuda => return Device::Cuda,
            RequestedDevice::Auto => {}
        }

        if self.cuda_available() {
            return Device::Cuda;
        }

        // Apple Silicon has a GPU, but whisper-rs is only built against CUDA here.
        if self.probe.os() == OsFamily::MacOs && self.probe.arch() == Arch::Arm64 {
            tracing::info!("Apple Silicon detected, using cpu (Metal backend not enabled)");
        }
        Device::Cpu
    }

    pub fn resolve_compute_type(
        &self,
        requested: RequestedComputeType,
        device: Device,
    ) -> ComputeType {
        match requested {
            RequestedComputeType::Float16 => return ComputeType::Float16,
            RequestedComputeType::Int8Float16 => return ComputeType::Int8Float16,
            RequestedComputeType::Int8 => return ComputeType::Int8,
            RequestedComputeType::Float32 => return ComputeType::Float32,
            RequestedComputeType::Auto => {}
        }

        match device {
            Device::Cpu => ComputeType::Int8,
            Device::Cuda => match self.vram_mb() {
                Some(vram_mb) if vram_mb >= FLOAT16_MIN_VRAM_MB => ComputeType::Float16,
                Some(vram_mb) => {
                    tracing::info!(vram_mb, "VRAM below 8GB, using int8_float16 to save memory");
                    ComputeType::Int8Float16
                }
                None => {
                    tracing::warn!("VRAM unknown, defaulting to float16");
                    ComputeType::Float16
                }
            },
        }
    }

    pub fn resolve_cpu_threads(&self, requested: usize) -> usize {
        if requested != 0 {
            return requested;
        }
        // Half the physical cores.
        let cores = self.physical_cores();
        let resolved = (cores / 2).max(1);
        tracing::info!(cores, cpu_threads = resolved, "resolved cpu_threads from physical cores");
        resolved
    }

    pub fn resolve_max_workers(&self, requested: usize, device: Device) -> usize {
        if requested != 0 {
            return requested;
        }
        match device {
            // GPU execution is serialized anyway
            Device::Cuda => CUDA_MAX_WORKERS,
            Device::Cpu => CPU_MAX_WORKERS,
        }
    }

    /// What resolution observed. VRAM is reported only if it was queried.
    pub fn profile(&self) -> HardwareProfile {
        HardwareProfile {
            arch: self.probe.arch(),
            os: self.probe.os(),
            gpu: self.cuda_available(),
            vram_mb: self.vram_mb.get().copied().flatten(),
            physical_cores: self.physical_cores(),
        }
    }
}
