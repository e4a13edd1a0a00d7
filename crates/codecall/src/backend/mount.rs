//! Host bind mounts for container workers.
//!
//! The container's `/course` is bound (with slave propagation) to a per-worker
//! host directory. Switching courses re-mounts that directory instead of
//! recreating the container.

use std::path::Path;

use crate::error::{CallError, Result};

#[cfg(target_os = "linux")]
pub fn bind(source: &Path, target: &Path) -> Result<()> {
    use nix::mount::{mount, MsFlags};

    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| {
        CallError::Backend(format!(
            "failed to bind {} onto {}: {e}",
            source.display(),
            target.display()
        ))
    })
}

#[cfg(target_os = "linux")]
pub fn unbind(target: &Path) -> Result<()> {
    nix::mount::umount(target)
        .map_err(|e| CallError::Backend(format!("failed to unmount {}: {e}", target.display())))
}

#[cfg(not(target_os = "linux"))]
pub fn bind(_source: &Path, _target: &Path) -> Result<()> {
    Err(CallError::Backend(
        "course bind mounts are only supported on Linux".to_string(),
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn unbind(_target: &Path) -> Result<()> {
    Ok(())
}

/// Docker bind specification for the per-worker mount directory
pub fn course_bind_spec(host_dir: &Path) -> String {
    // Slave propagation lets later host-side mounts show up inside the container
    let propagation = if cfg!(target_os = "linux") {
        ",slave"
    } else {
        ""
    };
    format!("{}:/course:ro{}", host_dir.display(), propagation)
}
