//! Host load probes: CPU and memory utilisation of the local machine.

/// Source of host CPU/memory readings for the metrics collector.
pub trait HostStats: Send + Sync {
    /// CPU utilisation, percent 0–100.
    fn cpu_usage(&self) -> f64;
    /// Memory utilisation, percent 0–100.
    fn memory_usage(&self) -> f64;
}

/// Reads the running machine through libc.
///
/// CPU is the 1-minute load average divided by online cores, which is
/// cheap to read and needs no sampling state. Both values are clamped to
/// 0–100. Platforms without the calls report 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl HostStats for SystemHost {
    fn cpu_usage(&self) -> f64 {
        let mut loads = [0f64; 3];
        let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
        if n < 1 {
            return 0.0;
        }
        let cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        let cpus = if cpus > 0 { cpus as f64 } else { 1.0 };
        (loads[0] / cpus * 100.0).clamp(0.0, 100.0)
    }

    #[cfg(target_os = "linux")]
    fn memory_usage(&self) -> f64 {
        let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
        if unsafe { libc::sysinfo(&mut info) } != 0 || info.totalram == 0 {
            return 0.0;
        }
        let total = info.totalram as f64;
        let free = (info.freeram as f64) + (info.bufferram as f64);
        ((total - free) / total * 100.0).clamp(0.0, 100.0)
    }

    #[cfg(not(target_os = "linux"))]
    fn memory_usage(&self) -> f64 {
        0.0
    }
}

/// Fixed readings.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedHost {
    pub cpu: f64,
    pub memory: f64,
}

impl HostStats for FixedHost {
    fn cpu_usage(&self) -> f64 {
        self.cpu
    }

    fn memory_usage(&self) -> f64 {
        self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_readings_are_percentages() {
        let host = SystemHost;
        let cpu = host.cpu_usage();
        let mem = host.memory_usage();
        assert!((0.0..=100.0).contains(&cpu), "cpu {cpu}");
        assert!((0.0..=100.0).contains(&mem), "mem {mem}");
    }
}
