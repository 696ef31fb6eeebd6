mod backend;
mod devices;
mod error;
mod handler;
mod relay;
mod resources;
mod rootfs;
mod vmfile;

pub use backend::{
    BackendInstance, BackendLoader, DynamicBackend, DynamicLoader, LIBKRUN, LIBKRUN_SEV, VmBackend,
};
pub use devices::{DeviceSpec, KVM_DEVICE, SEV_DEVICE};
pub use error::HandlerError;
pub use handler::{
    ConfigurePhase, HostPaths, KrunHandler, LifecycleState, ROOT_DISK_FILE, RuntimeContext,
    SEV_MARKER_FILE,
};
pub use relay::CONFIG_RELAY_FILE;
pub use resources::{DEFAULT_RAM_MIB, MAX_VCPUS, VmResources};
pub use vmfile::{KernelSpec, VM_CONFIG_FILE, VmFileConfig};
