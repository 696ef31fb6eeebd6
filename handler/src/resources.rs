//! microVM resource sizing.
//!
//! Resolution order: an explicit pair from the override file wins
//! (validated in [`VmResources::validated`]); otherwise the vCPU count is
//! derived from the host CPU affinity set and the RAM size from the
//! container's OCI memory limit.

use crate::error::HandlerError;
use nix::sched::{CpuSet, sched_getaffinity};
use nix::unistd::Pid;
use oci_spec::runtime::Spec;
use tracing::debug;

/// libkrun hard limit of vCPUs per microVM.
pub const MAX_VCPUS: u8 = 16;

/// RAM size used when neither the override file nor the OCI spec sizes
/// the guest.
pub const DEFAULT_RAM_MIB: u32 = 2048;

/// Resolved microVM sizing, produced once per launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmResources {
    pub vcpus: u8,
    pub ram_mib: u32,
}

impl VmResources {
    /// Checks an explicit resource pair against the backend limits.
    pub fn validated(cpus: u32, ram_mib: u32) -> Result<Self, HandlerError> {
        if cpus < 1 || cpus > MAX_VCPUS as u32 {
            return Err(HandlerError::InvalidVmConfig(format!(
                "cpus must be between 1 and {MAX_VCPUS}, got {cpus}"
            )));
        }
        if ram_mib == 0 {
            return Err(HandlerError::InvalidVmConfig(
                "ram_mib must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            vcpus: cpus as u8,
            ram_mib,
        })
    }

    /// Derives sizing from the host and the container spec.
    pub fn heuristic(spec: &Spec) -> Self {
        let vcpus = vcpus_for(affinity_cpu_count());
        let ram_mib = memory_limit_mib(spec).unwrap_or(DEFAULT_RAM_MIB);
        debug!(vcpus, ram_mib, "derived microVM resources from host state");
        Self { vcpus, ram_mib }
    }
}

fn affinity_cpu_count() -> Option<usize> {
    let set = sched_getaffinity(Pid::this()).ok()?;
    Some(
        (0..CpuSet::count())
            .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
            .count(),
    )
}

/// vCPU count from the affinity set size, clamped to the backend limit.
/// An unqueryable or empty affinity set means a single vCPU.
pub(crate) fn vcpus_for(affinity: Option<usize>) -> u8 {
    match affinity {
        Some(count) if count >= 1 => count.min(MAX_VCPUS as usize) as u8,
        _ => 1,
    }
}

/// The container's memory limit converted to MiB, if the spec carries one.
pub(crate) fn memory_limit_mib(spec: &Spec) -> Option<u32> {
    let limit = spec
        .linux()
        .as_ref()?
        .resources()
        .as_ref()?
        .memory()
        .as_ref()?
        .limit()?;
    if limit <= 0 {
        return None;
    }
    Some((limit / (1024 * 1024)) as u32)
}
