//! The optional per-container microVM override file.
//!
//! A JSON object at a fixed path below the container root lets the image
//! author pin an external kernel and explicit VM resources. Every key is
//! optional and unknown keys are ignored; incomplete field groups simply
//! fall back to the defaults described on the accessors.

use crate::error::HandlerError;
use crate::resources::VmResources;
use serde::Deserialize;
use std::path::Path;

/// Fixed path of the override file, resolved after the runtime pivoted
/// into the container root.
pub const VM_CONFIG_FILE: &str = "/.krun_vm.json";

/// An external kernel for the microVM, used instead of the firmware
/// bundled with the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSpec {
    pub path: String,
    /// Backend-defined kernel image format code.
    pub format: u32,
    pub initrd: Option<String>,
    pub cmdline: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct VmFileConfig {
    kernel_path: Option<String>,
    kernel_format: Option<u32>,
    initrd_path: Option<String>,
    kernel_cmdline: Option<String>,
    cpus: Option<u32>,
    ram_mib: Option<u32>,
}

impl VmFileConfig {
    pub fn parse(raw: &str) -> Result<Self, HandlerError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Reads the override file. An absent file is not an error.
    pub fn load(path: &Path) -> Result<Option<Self>, HandlerError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(Some(Self::parse(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The external kernel, if the file declares one. `kernel_path` and
    /// `kernel_format` are only valid together; initrd and cmdline are
    /// independently optional.
    pub fn kernel(&self) -> Option<KernelSpec> {
        let path = self.kernel_path.clone()?;
        let format = self.kernel_format?;
        Some(KernelSpec {
            path,
            format,
            initrd: self.initrd_path.clone(),
            cmdline: self.kernel_cmdline.clone(),
        })
    }

    /// The explicit resource pair. `cpus` and `ram_mib` are only honored
    /// together; a lone field falls through to the host heuristics.
    /// Values violating the backend limits are fatal.
    pub fn resources(&self) -> Result<Option<VmResources>, HandlerError> {
        match (self.cpus, self.ram_mib) {
            (Some(cpus), Some(ram_mib)) => VmResources::validated(cpus, ram_mib).map(Some),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_kernel_group() {
        let config =
            VmFileConfig::parse(r#"{"kernel_path": "/boot/vmlinux", "kernel_format": 1}"#).unwrap();
        let kernel = config.kernel().unwrap();
        assert_eq!(kernel.path, "/boot/vmlinux");
        assert_eq!(kernel.format, 1);
        assert_eq!(kernel.initrd, None);
        assert_eq!(kernel.cmdline, None);
    }

    #[test]
    fn kernel_path_without_format_is_skipped() {
        let config = VmFileConfig::parse(r#"{"kernel_path": "/boot/vmlinux"}"#).unwrap();
        assert!(config.kernel().is_none());
    }

    #[test]
    fn kernel_format_without_path_is_skipped() {
        let config = VmFileConfig::parse(r#"{"kernel_format": 1}"#).unwrap();
        assert!(config.kernel().is_none());
    }

    #[test]
    fn initrd_and_cmdline_are_independent() {
        let config = VmFileConfig::parse(
            r#"{"kernel_path": "/k", "kernel_format": 0, "kernel_cmdline": "console=hvc0"}"#,
        )
        .unwrap();
        let kernel = config.kernel().unwrap();
        assert_eq!(kernel.initrd, None);
        assert_eq!(kernel.cmdline.as_deref(), Some("console=hvc0"));
    }

    #[test]
    fn complete_resource_pair() {
        let config = VmFileConfig::parse(r#"{"cpus": 4, "ram_mib": 1024}"#).unwrap();
        let resources = config.resources().unwrap().unwrap();
        assert_eq!(resources.vcpus, 4);
        assert_eq!(resources.ram_mib, 1024);
    }

    #[test]
    fn lone_resource_field_falls_through() {
        let config = VmFileConfig::parse(r#"{"cpus": 4}"#).unwrap();
        assert!(config.resources().unwrap().is_none());

        let config = VmFileConfig::parse(r#"{"ram_mib": 1024}"#).unwrap();
        assert!(config.resources().unwrap().is_none());
    }

    #[test]
    fn out_of_range_cpus_is_fatal() {
        let config = VmFileConfig::parse(r#"{"cpus": 17, "ram_mib": 1024}"#).unwrap();
        assert!(matches!(
            config.resources(),
            Err(HandlerError::InvalidVmConfig(_))
        ));

        let config = VmFileConfig::parse(r#"{"cpus": 0, "ram_mib": 1024}"#).unwrap();
        assert!(config.resources().is_err());
    }

    #[test]
    fn zero_ram_is_fatal() {
        let config = VmFileConfig::parse(r#"{"cpus": 1, "ram_mib": 0}"#).unwrap();
        assert!(config.resources().is_err());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let config = VmFileConfig::parse(r#"{"cpus": 2, "ram_mib": 512, "flavor": "large"}"#)
            .unwrap();
        assert!(config.resources().unwrap().is_some());
    }

    #[test]
    fn absent_file_is_not_an_error() {
        assert!(
            VmFileConfig::load(Path::new("/nonexistent/.krun_vm.json"))
                .unwrap()
                .is_none()
        );
    }
}
