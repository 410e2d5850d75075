use anyhow::{Result, bail};
use std::path::Path;

pub fn is_namespace_supported(ns: &str) -> bool {
    Path::new(&format!("/proc/self/ns/{}", ns)).exists()
}

/// Both the sandbox and its undo path rely on `/proc/self/ns/mnt`.
pub fn ensure_mount_namespaces() -> Result<()> {
    if !is_namespace_supported("mnt") {
        bail!("Kernel doesn't support mount namespaces (no /proc/self/ns/mnt)");
    }
    Ok(())
}
