//! cgroup v1/v2 resource reading used by the Sandbox Lifecycle (C5) to turn a
//! `CgroupParent` path into vCPU/memory limits for the hypervisor backend.
//! Grounded in the teacher's `linux.rs` `read_cpu_metrics`/`read_memory_metrics`:
//! same "try the real file, fall back to a conservative default on any error"
//! policy, generalized from a pid-derived cgroup path to a caller-supplied one.

use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_VCPU: u32 = 1;
pub const DEFAULT_MEMORY_BYTES: u64 = 64 * 1024 * 1024;
const MEMORY_FLOOR_BYTES: u64 = 64 * 1024 * 1024;

const CGROUP_ROOT_V1_CPU: &str = "/sys/fs/cgroup/cpu";
const CGROUP_ROOT_V1_MEMORY: &str = "/sys/fs/cgroup/memory";
const CGROUP_ROOT_V2: &str = "/sys/fs/cgroup";

fn cgroup_v2_enabled() -> bool {
    Path::new(CGROUP_ROOT_V2).join("cgroup.controllers").exists()
}

/// Reads `cpu.cfs_quota_us`/`cpu.cfs_period_us` (v1) or `cpu.max` (v2) under
/// `cgroup_parent` and returns the number of whole vCPUs implied, rounding up.
/// `BestEffort` parents, an empty path, or any read/parse failure fall back
/// to `DEFAULT_VCPU`.
pub fn read_cpu_metrics(cgroup_parent: &str) -> u32 {
    if cgroup_parent.is_empty() || cgroup_parent.contains("BestEffort") {
        return DEFAULT_VCPU;
    }

    let result = if cgroup_v2_enabled() {
        read_cpu_v2(cgroup_parent)
    } else {
        read_cpu_v1(cgroup_parent)
    };
    result.unwrap_or(DEFAULT_VCPU)
}

fn read_cpu_v1(cgroup_parent: &str) -> Option<u32> {
    let base = PathBuf::from(CGROUP_ROOT_V1_CPU).join(cgroup_parent.trim_start_matches('/'));
    let quota: i64 = fs::read_to_string(base.join("cpu.cfs_quota_us")).ok()?.trim().parse().ok()?;
    let period: i64 = fs::read_to_string(base.join("cpu.cfs_period_us")).ok()?.trim().parse().ok()?;
    if quota <= 0 || period <= 0 {
        return None;
    }
    Some(((quota as f64 / period as f64).ceil() as u32).max(1))
}

fn read_cpu_v2(cgroup_parent: &str) -> Option<u32> {
    let base = PathBuf::from(CGROUP_ROOT_V2).join(cgroup_parent.trim_start_matches('/'));
    let raw = fs::read_to_string(base.join("cpu.max")).ok()?;
    let mut parts = raw.split_whitespace();
    let quota = parts.next()?;
    let period: i64 = parts.next()?.parse().ok()?;
    if quota == "max" {
        return None;
    }
    let quota: i64 = quota.parse().ok()?;
    if quota <= 0 || period <= 0 {
        return None;
    }
    Some(((quota as f64 / period as f64).ceil() as u32).max(1))
}

/// Reads `memory.limit_in_bytes` (v1) or `memory.max` (v2), enforcing a 64 MiB
/// floor. Falls back to `DEFAULT_MEMORY_BYTES` under the same conditions as
/// `read_cpu_metrics`.
pub fn read_memory_metrics(cgroup_parent: &str) -> u64 {
    if cgroup_parent.is_empty() || cgroup_parent.contains("BestEffort") {
        return DEFAULT_MEMORY_BYTES;
    }

    let raw = if cgroup_v2_enabled() {
        let base = PathBuf::from(CGROUP_ROOT_V2).join(cgroup_parent.trim_start_matches('/'));
        fs::read_to_string(base.join("memory.max")).ok()
    } else {
        let base = PathBuf::from(CGROUP_ROOT_V1_MEMORY).join(cgroup_parent.trim_start_matches('/'));
        fs::read_to_string(base.join("memory.limit_in_bytes")).ok()
    };

    let limit = raw
        .as_deref()
        .map(str::trim)
        .and_then(|s| if s == "max" { None } else { s.parse::<u64>().ok() });

    match limit {
        Some(bytes) if bytes > 0 => bytes.max(MEMORY_FLOOR_BYTES),
        _ => DEFAULT_MEMORY_BYTES,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_parent_uses_defaults() {
        assert_eq!(read_cpu_metrics(""), DEFAULT_VCPU);
        assert_eq!(read_memory_metrics(""), DEFAULT_MEMORY_BYTES);
    }

    #[test]
    fn besteffort_parent_uses_defaults() {
        assert_eq!(read_cpu_metrics("/kubepods/besteffort/BestEffort-x"), DEFAULT_VCPU);
        assert_eq!(
            read_memory_metrics("/kubepods/besteffort/BestEffort-x"),
            DEFAULT_MEMORY_BYTES
        );
    }

    #[test]
    fn unreadable_real_looking_parent_falls_back() {
        assert_eq!(read_cpu_metrics("/kubepods/does-not-exist-xyz"), DEFAULT_VCPU);
        assert_eq!(
            read_memory_metrics("/kubepods/does-not-exist-xyz"),
            DEFAULT_MEMORY_BYTES
        );
    }
}
