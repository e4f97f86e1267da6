//! Concurrency planning
//!
//! Derives how many jobs may run at once, and how many encoder threads each
//! gets, from the CPU core count and configuration.

use crate::config::JobsConfig;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of jobs in Probing, Planning or Running at once
    pub max_concurrent_jobs: u32,
    /// Encoder threads handed to each job
    pub threads_per_job: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan, detecting cores via num_cpus
    pub fn derive(cfg: &JobsConfig) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    /// Derive a concurrency plan for a known core count
    ///
    /// - an explicit non-zero `max_concurrent_jobs` is used unchanged
    /// - otherwise 1 job below 8 cores, 2 below 16, 3 from 16 up
    /// - cores are split evenly across jobs, at least one thread each
    pub fn derive_with_cores(cfg: &JobsConfig, cores: u32) -> Self {
        let total_cores = cores.max(1);

        let max_concurrent_jobs = if cfg.max_concurrent_jobs > 0 {
            cfg.max_concurrent_jobs
        } else {
            derive_max_jobs(total_cores)
        };

        let threads_per_job = (total_cores / max_concurrent_jobs).max(1);

        Self {
            total_cores,
            max_concurrent_jobs,
            threads_per_job,
        }
    }
}

fn derive_max_jobs(cores: u32) -> u32 {
    if cores < 8 {
        1
    } else if cores < 16 {
        2
    } else {
        3
    }
}
