//! Host workspace path resolution.
//!
//! Every sandbox bind-mounts `<root>/<tenant_id>/<session_id>`. The path is
//! only ever derived here, from integer identifiers, and re-checked against
//! the canonical root on every call.

use std::fs;
use std::path::{Component, Path, PathBuf};

use log::{debug, warn};

use super::{SandboxError, SandboxResult};

/// Maps (tenant, session) to a directory under a fixed root.
#[derive(Debug, Clone)]
pub struct WorkspaceResolver {
    root: PathBuf,
}

impl WorkspaceResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the canonical workspace path without touching the filesystem.
    ///
    /// Symlinks and `..` are resolved through the deepest existing ancestor,
    /// so a link planted inside the root that points elsewhere is rejected.
    pub fn resolve(&self, tenant_id: i64, session_id: i64) -> SandboxResult<PathBuf> {
        let root = fs::canonicalize(&self.root).map_err(|e| {
            SandboxError::InvalidInput(format!(
                "workspace root {} is not accessible: {}",
                self.root.display(),
                e
            ))
        })?;

        let candidate = self
            .root
            .join(tenant_id.to_string())
            .join(session_id.to_string());
        let resolved = canonicalize_existing_prefix(&candidate)?;

        if resolved == root || !resolved.starts_with(&root) {
            warn!(
                "workspace for tenant {} session {} resolved outside root: {}",
                tenant_id,
                session_id,
                resolved.display()
            );
            return Err(SandboxError::SecurityViolation(format!(
                "workspace path {} escapes {}",
                resolved.display(),
                root.display()
            )));
        }

        Ok(resolved)
    }

    /// Resolve and create the workspace directory if it does not exist yet.
    pub fn ensure(&self, tenant_id: i64, session_id: i64) -> SandboxResult<PathBuf> {
        let path = self.resolve(tenant_id, session_id)?;
        if !path.exists() {
            debug!("creating workspace {}", path.display());
            fs::create_dir_all(&path)?;
        }
        // Resolve again so a link swapped in during creation is still caught.
        self.resolve(tenant_id, session_id)
    }
}

/// Canonicalize the longest existing prefix of `path` and append the rest.
fn canonicalize_existing_prefix(path: &Path) -> SandboxResult<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut rest: Vec<PathBuf> = Vec::new();

    loop {
        match fs::canonicalize(&existing) {
            Ok(mut canonical) => {
                for part in rest.iter().rev() {
                    canonical.push(part);
                }
                return Ok(canonical);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let name = match existing.components().next_back() {
                    Some(Component::Normal(name)) => PathBuf::from(name),
                    _ => return Err(SandboxError::Io(err)),
                };
                rest.push(name);
                if !existing.pop() {
                    return Err(SandboxError::Io(err));
                }
            }
            Err(err) => return Err(SandboxError::Io(err)),
        }
    }
}
