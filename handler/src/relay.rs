//! Relays the validated container configuration into the rootfs.
//!
//! The runtime has already persisted and validated the container's
//! configuration document in its private state area. A copy is placed at a
//! fixed name inside the rootfs so the in-guest agent can read it once the
//! VM has booted. The rootfs content is workload controlled, so the write
//! must not be redirectable by a planted symlink.

use crate::error::HandlerError;
use crate::handler::RuntimeContext;
use crate::rootfs;
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Name of the relayed configuration file at the rootfs root.
pub const CONFIG_RELAY_FILE: &str = ".krun_config.json";

/// Copies the container configuration from the runtime state area to
/// `.krun_config.json` below the rootfs, read-only, refusing to follow
/// anything the workload may have planted at the target.
pub(crate) fn copy_container_config(
    ctx: &RuntimeContext<'_>,
    rootfs_path: &Path,
) -> Result<(), HandlerError> {
    let source = ctx
        .state_root
        .join(ctx.container_id)
        .join("config.json");
    let config = std::fs::read(&source)?;

    let rootfs_fd = rootfs::open_tree(rootfs_path)?;
    let fd = rootfs::create_beneath(&rootfs_fd, CONFIG_RELAY_FILE).map_err(|errno| {
        HandlerError::RelayTarget {
            path: rootfs_path.join(CONFIG_RELAY_FILE),
            errno,
        }
    })?;

    let mut file = std::fs::File::from(fd);
    file.write_all(&config)?;
    debug!(
        source = %source.display(),
        bytes = config.len(),
        "relayed container configuration into rootfs"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state_with_config(state_root: &Path, id: &str, content: &[u8]) {
        let dir = state_root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.json"), content).unwrap();
    }

    #[test]
    fn relays_byte_for_byte_copy() {
        let state = TempDir::new().unwrap();
        let rootfs = TempDir::new().unwrap();
        let content = br#"{"ociVersion":"1.0.2","process":{"args":["/bin/sh"]}}"#;
        state_with_config(state.path(), "cafe", content);

        let ctx = RuntimeContext {
            state_root: state.path(),
            container_id: "cafe",
        };
        copy_container_config(&ctx, rootfs.path()).unwrap();

        let copied = std::fs::read(rootfs.path().join(CONFIG_RELAY_FILE)).unwrap();
        assert_eq!(copied, content);
    }

    #[test]
    fn symlink_at_target_aborts_the_write() {
        let state = TempDir::new().unwrap();
        let rootfs = TempDir::new().unwrap();
        state_with_config(state.path(), "cafe", b"{}");

        let outside = state.path().join("outside");
        std::os::unix::fs::symlink(&outside, rootfs.path().join(CONFIG_RELAY_FILE)).unwrap();

        let ctx = RuntimeContext {
            state_root: state.path(),
            container_id: "cafe",
        };
        let err = copy_container_config(&ctx, rootfs.path()).unwrap_err();
        assert!(matches!(err, HandlerError::RelayTarget { .. }));
        assert!(!outside.exists());
    }

    #[test]
    fn missing_state_config_is_fatal() {
        let state = TempDir::new().unwrap();
        let rootfs = TempDir::new().unwrap();
        let ctx = RuntimeContext {
            state_root: state.path(),
            container_id: "missing",
        };
        assert!(copy_container_config(&ctx, rootfs.path()).is_err());
        assert_eq!(
            std::fs::read_dir(rootfs.path()).unwrap().count(),
            0,
            "nothing may be written on failure"
        );
    }
}
