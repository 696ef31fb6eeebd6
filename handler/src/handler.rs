//! Backend lifecycle orchestration.
//!
//! The surrounding runtime drives a fixed contract: `load` the backend
//! once per invocation, `configure` at fixed points of container setup,
//! `exec` the workload, `unload` at teardown. This module sequences the
//! binding, mode selection, device, relay and resource pieces into those
//! four calls and validates their ordering with an explicit state machine.

use crate::backend::{
    BackendInstance, BackendLoader, DynamicBackend, DynamicLoader, LIBKRUN, LIBKRUN_SEV, VmBackend,
};
use crate::devices;
use crate::error::HandlerError;
use crate::relay;
use crate::resources::VmResources;
use crate::vmfile::{VM_CONFIG_FILE, VmFileConfig};
use oci_spec::runtime::Spec;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Presence of this file on the host selects confidential mode for the
/// container. Its content is consumed by the backend, never read here.
pub const SEV_MARKER_FILE: &str = "/krun-sev.json";

/// Root disk image the confidential backend boots from.
pub const ROOT_DISK_FILE: &str = "/disk.img";

/// libkrun log level 1 = error.
const LOG_LEVEL_ERROR: u32 = 1;

/// Fixed host-side locations the handler consults. `Default` yields the
/// well-known paths; tests relocate them.
#[derive(Debug, Clone)]
pub struct HostPaths {
    pub sev_marker: PathBuf,
    pub tee_config: PathBuf,
    pub vm_config: PathBuf,
    pub kvm_device: PathBuf,
    pub sev_device: PathBuf,
    pub root_disk: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            sev_marker: PathBuf::from(SEV_MARKER_FILE),
            tee_config: PathBuf::from(SEV_MARKER_FILE),
            vm_config: PathBuf::from(VM_CONFIG_FILE),
            kvm_device: PathBuf::from(devices::KVM_DEVICE.path),
            sev_device: PathBuf::from(devices::SEV_DEVICE.path),
            root_disk: PathBuf::from(ROOT_DISK_FILE),
        }
    }
}

/// Per-call context handed in by the surrounding runtime.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeContext<'a> {
    /// Root of the runtime's private state area.
    pub state_root: &'a Path,
    pub container_id: &'a str,
}

/// Points of container setup at which the runtime calls back into the
/// handler. Only `BeforeMounts` and `AfterMounts` trigger work here; any
/// other phase passes through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurePhase {
    BeforeMounts,
    Mounts,
    AfterMounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Loaded,
    BeforeMountsConfigured,
    AfterMountsConfigured,
    Executing,
    Unloaded,
}

impl LifecycleState {
    fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Loaded => "loaded",
            LifecycleState::BeforeMountsConfigured => "before-mounts-configured",
            LifecycleState::AfterMountsConfigured => "after-mounts-configured",
            LifecycleState::Executing => "executing",
            LifecycleState::Unloaded => "unloaded",
        }
    }
}

/// Which backend serves this container. Decided once, at exec time, from
/// the host marker; the chosen handle moves into the variant so the two
/// modes cannot be active at the same time.
#[derive(Debug)]
enum Selected<B: VmBackend> {
    Standard(BackendInstance<B>),
    Confidential(BackendInstance<B>),
}

impl<B: VmBackend> Selected<B> {
    fn instance(&self) -> &BackendInstance<B> {
        match self {
            Selected::Standard(instance) | Selected::Confidential(instance) => instance,
        }
    }

    fn into_instance(self) -> BackendInstance<B> {
        match self {
            Selected::Standard(instance) | Selected::Confidential(instance) => instance,
        }
    }
}

/// The per-invocation backend state: both library handles, the mode
/// selection and the lifecycle position. Created by [`KrunHandler::load`]
/// and threaded through every later call.
#[derive(Debug)]
pub struct KrunHandler<B: VmBackend = DynamicBackend> {
    standard: Option<BackendInstance<B>>,
    confidential: Option<BackendInstance<B>>,
    selected: Option<Selected<B>>,
    state: LifecycleState,
    paths: HostPaths,
}

impl KrunHandler<DynamicBackend> {
    /// Opens the backend libraries through the host dynamic linker.
    pub fn load() -> Result<Self, HandlerError> {
        Self::load_with(&DynamicLoader, HostPaths::default())
    }
}

impl<B: VmBackend> KrunHandler<B> {
    /// Opens the standard and confidential backends independently; at
    /// least one must be usable.
    ///
    /// Execution contexts are acquired here, before the runtime performs
    /// any namespace transition: newer backends resolve their bundled
    /// firmware from the mount context they were opened in.
    pub fn load_with<L>(loader: &L, paths: HostPaths) -> Result<Self, HandlerError>
    where
        L: BackendLoader<Backend = B>,
    {
        let standard = loader.open(LIBKRUN);
        let confidential = loader.open(LIBKRUN_SEV);

        if let (Err(standard_err), Err(confidential_err)) = (&standard, &confidential) {
            return Err(HandlerError::NoBackend {
                standard: standard_err.to_string(),
                confidential: confidential_err.to_string(),
            });
        }

        let standard_opened = standard.is_ok();
        let confidential_opened = confidential.is_ok();
        let standard = Self::instantiate(standard.ok(), confidential_opened)?;
        let confidential = Self::instantiate(confidential.ok(), standard.is_some())?;
        if standard.is_none() && confidential.is_none() {
            // Both opened but neither produced a context.
            return Err(HandlerError::NoBackend {
                standard: format!("`{LIBKRUN}` produced no execution context"),
                confidential: format!("`{LIBKRUN_SEV}` produced no execution context"),
            });
        }
        debug!(
            standard = standard_opened,
            confidential = confidential_opened,
            "loaded krun backend"
        );

        Ok(Self {
            standard,
            confidential,
            selected: None,
            state: LifecycleState::Loaded,
            paths,
        })
    }

    /// Acquires a context for an opened backend. A failure is fatal only
    /// when no other backend can take over.
    fn instantiate(
        backend: Option<B>,
        other_usable: bool,
    ) -> Result<Option<BackendInstance<B>>, HandlerError> {
        match backend {
            None => Ok(None),
            Some(backend) => match BackendInstance::new(backend) {
                Ok(instance) => {
                    debug!(
                        library = instance.name(),
                        ctx = instance.ctx(),
                        "created execution context"
                    );
                    Ok(Some(instance))
                }
                Err(err) if other_usable => {
                    warn!(error = %err, "dropping backend without execution context");
                    Ok(None)
                }
                Err(err) => Err(err),
            },
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Phase callback from the surrounding runtime.
    ///
    /// `BeforeMounts` relays the container configuration into the rootfs;
    /// `AfterMounts` injects the virtualization device nodes. Everything
    /// else is a no-op.
    pub fn configure(
        &mut self,
        phase: ConfigurePhase,
        ctx: &RuntimeContext<'_>,
        spec: &Spec,
        rootfs: &Path,
    ) -> Result<(), HandlerError> {
        match phase {
            ConfigurePhase::BeforeMounts => {
                self.expect_state(LifecycleState::Loaded, "configure(before-mounts)")?;
                relay::copy_container_config(ctx, rootfs)?;
                self.state = LifecycleState::BeforeMountsConfigured;
            }
            ConfigurePhase::AfterMounts => {
                self.expect_state(
                    LifecycleState::BeforeMountsConfigured,
                    "configure(after-mounts)",
                )?;
                devices::inject(spec, rootfs, self.confidential.is_some())?;
                self.state = LifecycleState::AfterMountsConfigured;
            }
            _ => {}
        }
        Ok(())
    }

    /// Appends the device-cgroup allow rules before the runtime finalizes
    /// the OCI configuration.
    pub fn modify_oci_configuration(&self, spec: &mut Spec) -> Result<(), HandlerError> {
        devices::allow_cgroup_devices(spec, &self.paths)
    }

    /// Configures the selected backend and enters the microVM.
    ///
    /// Blocks for the lifetime of the workload; a non-negative return is
    /// the guest result, a negative backend code surfaces as an error.
    pub fn exec(&mut self, spec: &Spec) -> Result<i32, HandlerError> {
        self.expect_state(LifecycleState::AfterMountsConfigured, "exec")?;
        self.select_backend()?;

        {
            let selected = self.selected()?;
            let backend = selected.instance();
            backend.set_log_level(LOG_LEVEL_ERROR)?;

            match selected {
                Selected::Confidential(backend) => {
                    backend.set_root_disk(&self.paths.root_disk)?;
                    backend.set_tee_config_file(&self.paths.tee_config)?;
                }
                Selected::Standard(backend) => {
                    backend.set_root(Path::new("/"))?;
                    if let Some(process) = spec.process().as_ref() {
                        if !process.cwd().as_os_str().is_empty() {
                            backend.set_workdir(process.cwd())?;
                        }
                    }
                }
            }

            let configured = match self.configure_vm_from_file(backend) {
                Ok(configured) => configured,
                Err(err) => {
                    warn!(error = %err, "microVM override configuration failed");
                    return Err(err);
                }
            };
            if !configured {
                let resources = VmResources::heuristic(spec);
                backend.set_vm_config(resources.vcpus, resources.ram_mib)?;
            }
        }

        self.state = LifecycleState::Executing;
        let backend = self.selected()?.instance();
        info!(library = backend.name(), ctx = backend.ctx(), "entering microVM");
        backend.start_enter()
    }

    /// Closes every backend handle, best effort: both are attempted and
    /// the first failure is reported. Safe to call again once unloaded.
    pub fn unload(&mut self) -> Result<(), HandlerError> {
        let mut first_error = None;
        for instance in self
            .selected
            .take()
            .map(Selected::into_instance)
            .into_iter()
            .chain(self.standard.take())
            .chain(self.confidential.take())
        {
            debug!(library = instance.name(), "closing backend");
            if let Err(err) = instance.close() {
                warn!(error = %err, "closing backend failed");
                first_error.get_or_insert(err);
            }
        }
        self.state = LifecycleState::Unloaded;
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Applies the marker-file decision: the chosen handle moves out of
    /// the loaded pool into [`Selected`]. Selecting a mode whose backend
    /// did not load is fatal; the workload must not run under weaker
    /// guarantees than it asked for.
    fn select_backend(&mut self) -> Result<(), HandlerError> {
        if self.paths.sev_marker.exists() {
            let instance = self
                .confidential
                .take()
                .ok_or(HandlerError::BackendNotLoaded {
                    library: LIBKRUN_SEV,
                })?;
            debug!("confidential marker present, selecting {LIBKRUN_SEV}");
            self.selected = Some(Selected::Confidential(instance));
        } else {
            let instance = self
                .standard
                .take()
                .ok_or(HandlerError::BackendNotLoaded { library: LIBKRUN })?;
            self.selected = Some(Selected::Standard(instance));
        }
        Ok(())
    }

    fn selected(&self) -> Result<&Selected<B>, HandlerError> {
        self.selected.as_ref().ok_or(HandlerError::LifecycleOrder {
            operation: "backend access",
            state: self.state.as_str(),
        })
    }

    /// Applies the override file, if present. Returns whether the file
    /// fully configured the VM resources.
    fn configure_vm_from_file(
        &self,
        backend: &BackendInstance<B>,
    ) -> Result<bool, HandlerError> {
        let Some(file) = VmFileConfig::load(&self.paths.vm_config)? else {
            return Ok(false);
        };
        // No kernel declared means the backend falls back to its bundled
        // firmware; not an error.
        if let Some(kernel) = file.kernel() {
            debug!(path = %kernel.path, format = kernel.format, "configuring external kernel");
            backend.set_kernel(&kernel)?;
        }
        let Some(resources) = file.resources()? else {
            return Ok(false);
        };
        backend.set_vm_config(resources.vcpus, resources.ram_mib)?;
        Ok(true)
    }

    fn expect_state(
        &self,
        expected: LifecycleState,
        operation: &'static str,
    ) -> Result<(), HandlerError> {
        if self.state != expected {
            return Err(HandlerError::LifecycleOrder {
                operation,
                state: self.state.as_str(),
            });
        }
        Ok(())
    }
}
