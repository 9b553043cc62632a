use castor_contracts::SystemStats;
use sysinfo::{Pid, ProcessRefreshKind, System};

/// Samples host CPU and memory for heartbeats. CPU usage needs two refresh
/// points, so the sampler keeps its `System` alive between calls.
pub struct SystemSampler {
    system: System,
}

impl std::fmt::Debug for SystemSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemSampler").finish_non_exhaustive()
    }
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self { system }
    }

    pub fn sample(&mut self) -> SystemStats {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let cpus = self.system.cpus();
        let cpu_percent = if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
        };

        SystemStats {
            cpu_percent,
            memory_used_mb: self.system.used_memory() / (1024 * 1024),
            memory_total_mb: self.system.total_memory() / (1024 * 1024),
            load_avg: System::load_average().one as f32,
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.system.cpus().len().max(1)
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// CPU and resident-memory meter for a single encoder process.
pub struct ProcessMeter {
    system: System,
    pid: Pid,
}

impl std::fmt::Debug for ProcessMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessMeter")
            .field("pid", &self.pid)
            .finish()
    }
}

impl ProcessMeter {
    pub fn new(pid: u32) -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(pid),
        }
    }

    /// `(cpu_percent, resident_mb)`, zeros once the process is gone.
    pub fn sample(&mut self) -> (f32, u64) {
        self.system.refresh_process_specifics(
            self.pid,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );
        match self.system.process(self.pid) {
            Some(process) => (process.cpu_usage(), process.memory() / (1024 * 1024)),
            None => (0.0, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_reports_plausible_memory() {
        let mut sampler = SystemSampler::new();
        let stats = sampler.sample();
        assert!(stats.memory_total_mb > 0);
        assert!(stats.memory_used_mb <= stats.memory_total_mb);
    }
}
