//! Virtualization device plumbing for the container.
//!
//! Two concerns: materializing the device nodes inside the container's
//! `/dev`, and appending the matching rules to the OCI device-cgroup
//! allow-list. Both are required; a node without a cgroup rule is still
//! denied by the kernel.

use crate::error::HandlerError;
use crate::handler::HostPaths;
use crate::rootfs;
use nix::errno::Errno;
use nix::mount::{MsFlags, mount};
use nix::sys::stat::{major, makedev, minor};
use oci_spec::runtime::{
    LinuxDeviceCgroup, LinuxDeviceCgroupBuilder, LinuxDeviceType, Spec,
};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A device node to materialize in the container's device tree.
#[derive(Debug, Clone, Copy)]
pub struct DeviceSpec {
    pub path: &'static str,
    pub kind: char,
    pub major: u64,
    pub minor: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

pub const KVM_DEVICE: DeviceSpec = DeviceSpec {
    path: "/dev/kvm",
    kind: 'c',
    major: 10,
    minor: 232,
    mode: 0o666,
    uid: 0,
    gid: 0,
};

pub const SEV_DEVICE: DeviceSpec = DeviceSpec {
    path: "/dev/sev",
    kind: 'c',
    major: 10,
    minor: 124,
    mode: 0o666,
    uid: 0,
    gid: 0,
};

impl DeviceSpec {
    fn node_name(&self) -> &'static str {
        self.path.rsplit('/').next().unwrap_or(self.path)
    }
}

/// Creates the virtualization device nodes in the container's `/dev`.
///
/// A `/dev/kvm` entry already declared in the spec wins: the user asked
/// for their own configuration and nothing is touched. `/dev/sev` is
/// added only when the confidential backend actually loaded, with its own
/// already-declared check.
pub(crate) fn inject(
    spec: &Spec,
    rootfs_path: &Path,
    confidential_loaded: bool,
) -> Result<(), HandlerError> {
    if spec_declares_device(spec, KVM_DEVICE.path) {
        debug!("{} already declared in spec, skipping device injection", KVM_DEVICE.path);
        return Ok(());
    }
    let create_sev = confidential_loaded && !spec_declares_device(spec, SEV_DEVICE.path);

    let rootfs_fd = rootfs::open_tree(rootfs_path)?;
    let dev_fd = rootfs::open_dir_at(&rootfs_fd, "dev")?;
    let user_namespace = rootfs::running_in_user_namespace();

    create_device_node(&dev_fd, &KVM_DEVICE, user_namespace)?;
    if create_sev {
        create_device_node(&dev_fd, &SEV_DEVICE, user_namespace)?;
    }
    Ok(())
}

/// Appends the device-cgroup allow rules for the virtualization devices.
///
/// No-op when the spec does not configure a device-cgroup list at all.
/// The primary device must be stat-able on the host; an absent
/// confidential device only omits its rule. This is a host-support check,
/// independent from whether the confidential backend loaded.
pub(crate) fn allow_cgroup_devices(
    spec: &mut Spec,
    paths: &HostPaths,
) -> Result<(), HandlerError> {
    let Some(linux) = spec.linux().clone() else {
        return Ok(());
    };
    let Some(resources) = linux.resources().clone() else {
        return Ok(());
    };
    let Some(mut rules) = resources.devices().clone() else {
        return Ok(());
    };

    let kvm = stat_device(&paths.kvm_device)?;
    rules.push(wildcard_rule(kvm)?);

    match stat_device(&paths.sev_device) {
        Ok(sev) => rules.push(wildcard_rule(sev)?),
        Err(HandlerError::HostDevice { errno: Errno::ENOENT, .. }) => {
            debug!(path = %paths.sev_device.display(), "host has no confidential device, omitting cgroup rule");
        }
        Err(err) => return Err(err),
    }

    let mut resources = resources;
    resources.set_devices(Some(rules));
    let mut linux = linux;
    linux.set_resources(Some(resources));
    spec.set_linux(Some(linux));
    Ok(())
}

fn stat_device(path: &Path) -> Result<libc::dev_t, HandlerError> {
    let st = nix::sys::stat::stat(path).map_err(|errno| HandlerError::HostDevice {
        path: path.to_path_buf(),
        errno,
    })?;
    Ok(st.st_rdev)
}

fn wildcard_rule(rdev: libc::dev_t) -> Result<LinuxDeviceCgroup, HandlerError> {
    Ok(LinuxDeviceCgroupBuilder::default()
        .allow(true)
        .typ(LinuxDeviceType::A)
        .major(major(rdev) as i64)
        .minor(minor(rdev) as i64)
        .access("rwm")
        .build()?)
}

fn spec_declares_device(spec: &Spec, path: &str) -> bool {
    spec.linux()
        .as_ref()
        .and_then(|linux| linux.devices().as_ref())
        .is_some_and(|devices| devices.iter().any(|d| d.path() == Path::new(path)))
}

fn create_device_node(
    dev_fd: &OwnedFd,
    device: &DeviceSpec,
    user_namespace: bool,
) -> Result<(), HandlerError> {
    debug!(path = device.path, user_namespace, "creating device node");
    if user_namespace {
        bind_device_node(dev_fd, device)
    } else {
        mknod_device_node(dev_fd, device)
    }
}

fn mknod_device_node(dev_fd: &OwnedFd, device: &DeviceSpec) -> Result<(), HandlerError> {
    let name = rootfs::cstring(device.node_name())?;
    let node_err = |errno| HandlerError::DeviceNode {
        path: PathBuf::from(device.path),
        errno,
    };

    let ret = unsafe {
        libc::mknodat(
            dev_fd.as_raw_fd(),
            name.as_ptr(),
            libc::S_IFCHR | device.mode,
            makedev(device.major, device.minor),
        )
    };
    if ret < 0 {
        return Err(node_err(Errno::last()));
    }

    // mknod is subject to the umask; restore the intended mode.
    let ret = unsafe { libc::fchmodat(dev_fd.as_raw_fd(), name.as_ptr(), device.mode, 0) };
    if ret < 0 {
        return Err(node_err(Errno::last()));
    }

    let ret = unsafe {
        libc::fchownat(
            dev_fd.as_raw_fd(),
            name.as_ptr(),
            device.uid,
            device.gid,
            0,
        )
    };
    if ret < 0 {
        return Err(node_err(Errno::last()));
    }
    Ok(())
}

/// Inside a user namespace mknod is not permitted, so the host node is
/// bind mounted over an empty file created below `/dev`.
fn bind_device_node(dev_fd: &OwnedFd, device: &DeviceSpec) -> Result<(), HandlerError> {
    let name = rootfs::cstring(device.node_name())?;
    let fd = unsafe {
        libc::openat(
            dev_fd.as_raw_fd(),
            name.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            device.mode as libc::c_uint,
        )
    };
    if fd < 0 {
        return Err(HandlerError::DeviceNode {
            path: PathBuf::from(device.path),
            errno: Errno::last(),
        });
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let target = format!("/proc/self/fd/{}", fd.as_raw_fd());
    mount(
        Some(device.path),
        target.as_str(),
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|errno| HandlerError::DeviceNode {
        path: PathBuf::from(device.path),
        errno,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::runtime::{
        LinuxBuilder, LinuxDeviceBuilder, LinuxDeviceCgroupBuilder, LinuxResourcesBuilder,
        SpecBuilder,
    };
    use tempfile::TempDir;

    fn spec_with_device(path: &str) -> Spec {
        let device = LinuxDeviceBuilder::default()
            .path(path)
            .typ(LinuxDeviceType::C)
            .major(10i64)
            .minor(232i64)
            .build()
            .unwrap();
        let linux = LinuxBuilder::default().devices(vec![device]).build().unwrap();
        SpecBuilder::default().linux(linux).build().unwrap()
    }

    fn spec_with_cgroup_devices() -> Spec {
        let rule = LinuxDeviceCgroupBuilder::default()
            .allow(false)
            .typ(LinuxDeviceType::A)
            .access("rwm")
            .build()
            .unwrap();
        let resources = LinuxResourcesBuilder::default()
            .devices(vec![rule])
            .build()
            .unwrap();
        let linux = LinuxBuilder::default().resources(resources).build().unwrap();
        SpecBuilder::default().linux(linux).build().unwrap()
    }

    fn cgroup_rules(spec: &Spec) -> &Vec<LinuxDeviceCgroup> {
        spec.linux()
            .as_ref()
            .unwrap()
            .resources()
            .as_ref()
            .unwrap()
            .devices()
            .as_ref()
            .unwrap()
    }

    #[test]
    fn declared_kvm_device_wins() {
        let spec = spec_with_device("/dev/kvm");
        // A bogus rootfs proves nothing is opened on the no-op path.
        inject(&spec, Path::new("/nonexistent-rootfs"), true).unwrap();
    }

    #[test]
    fn missing_dev_directory_is_fatal() {
        let rootfs = TempDir::new().unwrap();
        let spec = Spec::default();
        assert!(matches!(
            inject(&spec, rootfs.path(), false),
            Err(HandlerError::Open { .. })
        ));
    }

    #[test]
    fn mutator_is_noop_without_cgroup_list() {
        let host = TempDir::new().unwrap();
        let paths = HostPaths {
            kvm_device: host.path().join("kvm"),
            sev_device: host.path().join("sev"),
            ..HostPaths::default()
        };
        let mut spec = Spec::default();
        allow_cgroup_devices(&mut spec, &paths).unwrap();
        assert!(spec.linux().is_none());
    }

    #[test]
    fn mutator_requires_primary_device() {
        let host = TempDir::new().unwrap();
        let paths = HostPaths {
            kvm_device: host.path().join("kvm"),
            sev_device: host.path().join("sev"),
            ..HostPaths::default()
        };
        let mut spec = spec_with_cgroup_devices();
        assert!(matches!(
            allow_cgroup_devices(&mut spec, &paths),
            Err(HandlerError::HostDevice { .. })
        ));
    }

    #[test]
    fn mutator_omits_rule_for_absent_confidential_device() {
        let host = TempDir::new().unwrap();
        std::fs::write(host.path().join("kvm"), b"").unwrap();
        let paths = HostPaths {
            kvm_device: host.path().join("kvm"),
            sev_device: host.path().join("sev"),
            ..HostPaths::default()
        };

        let mut spec = spec_with_cgroup_devices();
        allow_cgroup_devices(&mut spec, &paths).unwrap();
        let rules = cgroup_rules(&spec);
        assert_eq!(rules.len(), 2);
        assert!(rules[1].allow());
        assert_eq!(rules[1].access().as_deref(), Some("rwm"));
    }

    #[test]
    fn mutator_appends_both_rules_when_host_has_sev() {
        let host = TempDir::new().unwrap();
        std::fs::write(host.path().join("kvm"), b"").unwrap();
        std::fs::write(host.path().join("sev"), b"").unwrap();
        let paths = HostPaths {
            kvm_device: host.path().join("kvm"),
            sev_device: host.path().join("sev"),
            ..HostPaths::default()
        };

        let mut spec = spec_with_cgroup_devices();
        allow_cgroup_devices(&mut spec, &paths).unwrap();
        assert_eq!(cgroup_rules(&spec).len(), 3);
    }

    #[test]
    fn device_node_names() {
        assert_eq!(KVM_DEVICE.node_name(), "kvm");
        assert_eq!(SEV_DEVICE.node_name(), "sev");
        assert_eq!(KVM_DEVICE.kind, 'c');
    }
}
