//! Session- and agent-scoped filesystem with permission-gated access.
//!
//! The workspace root is laid out as:
//!
//! ```text
//! {root}/shared/sessions/{sessionId}/specs/
//! {root}/shared/sessions/{sessionId}/outputs/{agentName}/...
//! {root}/shared/persistent/...
//! {root}/{agentName}/drafts/...
//! {root}/{agentName}/temp/...
//! ```
//!
//! The core policy of this module is containment: every relative write path
//! is resolved against its target base directory and the resolved absolute
//! path must still begin with that base after canonicalisation. `..`
//! segments, absolute paths, and separators that escape the base are all
//! rejected as path traversal. Cross-agent reads require the reader's
//! profile to whitelist the owner; shared writes require
//! `can_write_to_shared`.

use crate::agentmux::profile::AgentProfile;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Default cap on one written file, in bytes of encoded content.
pub const DEFAULT_MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

/// Errors surfaced by workspace operations.
#[derive(Debug)]
pub enum WorkspaceError {
    /// The path escapes its base directory.
    PathTraversal(String),
    /// The reader or writer lacks the required permission.
    PermissionDenied(String),
    /// The content exceeds the configured file size cap.
    FileTooLarge {
        /// Encoded content size.
        size: usize,
        /// Configured cap.
        max: usize,
    },
    /// The requested file does not exist.
    NotFound(String),
    /// Underlying filesystem failure.
    Io(std::io::Error),
}

impl std::fmt::Display for WorkspaceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkspaceError::PathTraversal(path) => write!(f, "path_traversal: {}", path),
            WorkspaceError::PermissionDenied(message) => {
                write!(f, "Permission denied: {}", message)
            }
            WorkspaceError::FileTooLarge { size, max } => {
                write!(f, "File too large: {} bytes (max {})", size, max)
            }
            WorkspaceError::NotFound(path) => write!(f, "Workspace file not found: {}", path),
            WorkspaceError::Io(e) => write!(f, "Workspace I/O error: {}", e),
        }
    }
}

impl std::error::Error for WorkspaceError {}

impl From<std::io::Error> for WorkspaceError {
    fn from(e: std::io::Error) -> Self {
        WorkspaceError::Io(e)
    }
}

/// Manages the workspace tree under one root directory.
///
/// # Example
///
/// ```rust,no_run
/// use agentmux::workspace::WorkspaceManager;
/// use agentmux::profile::{AgentProfile, OrchestrationSettings};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let workspace = WorkspaceManager::init("workspaces")?;
///
/// workspace.write_to_session("session-1", "backend", "api.md", "# API draft")?;
///
/// let reader = AgentProfile::new("reviewer", "You review designs.")
///     .with_orchestration(
///         OrchestrationSettings::default().with_readable_workspace("backend"),
///     );
/// let draft = workspace.read_from_agent_workspace(&reader, "backend", "session-1", "api.md")?;
/// assert!(draft.starts_with("# API"));
/// # Ok(())
/// # }
/// ```
pub struct WorkspaceManager {
    root: PathBuf,
    max_file_size: usize,
}

impl WorkspaceManager {
    /// Create the workspace skeleton under `root` and return the manager.
    pub fn init(root: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
        let root = root.into();
        fs::create_dir_all(root.join("shared").join("sessions"))?;
        fs::create_dir_all(root.join("shared").join("persistent"))?;
        Ok(Self {
            root,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        })
    }

    /// Override the per-file size cap (builder pattern).
    pub fn with_max_file_size(mut self, max_file_size: usize) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    /// The workspace root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the `specs/` and `outputs/` directories for a session.
    pub fn ensure_session(&self, session_id: &str) -> Result<PathBuf, WorkspaceError> {
        let session_dir = self.session_dir(session_id)?;
        fs::create_dir_all(session_dir.join("specs"))?;
        fs::create_dir_all(session_dir.join("outputs"))?;
        Ok(session_dir)
    }

    /// Create the private `drafts/` and `temp/` directories for an agent.
    pub fn ensure_agent(&self, agent_name: &str) -> Result<PathBuf, WorkspaceError> {
        let agent_dir = contained_join(&self.root, agent_name)?;
        fs::create_dir_all(agent_dir.join("drafts"))?;
        fs::create_dir_all(agent_dir.join("temp"))?;
        Ok(agent_dir)
    }

    /// Write a file into an agent's per-session output area, creating
    /// intermediate directories.
    pub fn write_to_session(
        &self,
        session_id: &str,
        agent_name: &str,
        rel_path: &str,
        content: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        self.check_size(content)?;
        let base = self.agent_outputs_dir(session_id, agent_name)?;
        fs::create_dir_all(&base)?;
        let target = contained_join(&base, rel_path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, content)?;
        Ok(target)
    }

    /// Read a file from another agent's session output area.
    ///
    /// Succeeds only when the reader's profile whitelists `owner_agent` in
    /// `orchestration.can_read_workspaces`.
    pub fn read_from_agent_workspace(
        &self,
        reader: &AgentProfile,
        owner_agent: &str,
        session_id: &str,
        rel_path: &str,
    ) -> Result<String, WorkspaceError> {
        if !reader
            .orchestration
            .can_read_workspaces
            .iter()
            .any(|name| name == owner_agent)
        {
            return Err(WorkspaceError::PermissionDenied(format!(
                "agent '{}' may not read the workspace of '{}'",
                reader.name, owner_agent
            )));
        }

        let base = self.agent_outputs_dir(session_id, owner_agent)?;
        let target = contained_join(&base, rel_path)?;
        if !target.exists() {
            return Err(WorkspaceError::NotFound(rel_path.to_string()));
        }
        Ok(fs::read_to_string(target)?)
    }

    /// Write a file into the cross-session shared area.
    ///
    /// Requires `orchestration.can_write_to_shared`.
    pub fn write_to_shared(
        &self,
        agent: &AgentProfile,
        rel_path: &str,
        content: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        if !agent.orchestration.can_write_to_shared {
            return Err(WorkspaceError::PermissionDenied(format!(
                "agent '{}' may not write to the shared workspace",
                agent.name
            )));
        }
        self.check_size(content)?;

        let base = self.root.join("shared").join("persistent");
        fs::create_dir_all(&base)?;
        let target = contained_join(&base, rel_path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, content)?;
        Ok(target)
    }

    /// Write a file into an agent's private drafts area.
    pub fn write_draft(
        &self,
        agent_name: &str,
        rel_path: &str,
        content: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        self.check_size(content)?;
        let base = self.ensure_agent(agent_name)?.join("drafts");
        let target = contained_join(&base, rel_path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, content)?;
        Ok(target)
    }

    /// Recursively list files in an agent's session output area, relative to
    /// that area.
    pub fn list_session_files(
        &self,
        session_id: &str,
        agent_name: &str,
    ) -> Result<Vec<PathBuf>, WorkspaceError> {
        let base = self.agent_outputs_dir(session_id, agent_name)?;
        let mut files = Vec::new();
        if base.exists() {
            collect_files(&base, &base, &mut files)?;
        }
        files.sort();
        Ok(files)
    }

    /// Remove session directories whose id is not listed in `active_ids`.
    /// Returns the number removed.
    pub fn cleanup_sessions(&self, active_ids: &[String]) -> Result<usize, WorkspaceError> {
        let sessions_dir = self.root.join("shared").join("sessions");
        if !sessions_dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for dir_entry in fs::read_dir(&sessions_dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if !active_ids.iter().any(|id| *id == name) {
                fs::remove_dir_all(dir_entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, WorkspaceError> {
        let base = self.root.join("shared").join("sessions");
        contained_join(&base, session_id)
    }

    fn agent_outputs_dir(
        &self,
        session_id: &str,
        agent_name: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        let outputs = self.session_dir(session_id)?.join("outputs");
        contained_join(&outputs, agent_name)
    }

    fn check_size(&self, content: &str) -> Result<(), WorkspaceError> {
        let size = content.as_bytes().len();
        if size > self.max_file_size {
            return Err(WorkspaceError::FileTooLarge {
                size,
                max: self.max_file_size,
            });
        }
        Ok(())
    }
}

/// Join `rel` onto `base`, rejecting anything that would escape the base.
///
/// The relative path is rejected when it is absolute, contains `..` or root
/// components, or uses backslash separators that would survive as literal
/// filename characters on Unix while acting as separators elsewhere. The
/// joined path is then verified (after canonicalising the base) to still
/// start with the base.
fn contained_join(base: &Path, rel: &str) -> Result<PathBuf, WorkspaceError> {
    if rel.is_empty() {
        return Err(WorkspaceError::PathTraversal(rel.to_string()));
    }
    if rel.contains('\\') {
        return Err(WorkspaceError::PathTraversal(rel.to_string()));
    }

    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return Err(WorkspaceError::PathTraversal(rel.to_string()));
    }
    for component in rel_path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(WorkspaceError::PathTraversal(rel.to_string())),
        }
    }

    // Canonicalise whatever prefix of the base already exists so symlinked
    // roots cannot be used to escape.
    let canonical_base = match base.canonicalize() {
        Ok(canonical) => canonical,
        Err(_) => base.to_path_buf(),
    };
    let target = canonical_base.join(rel_path);
    if !target.starts_with(&canonical_base) {
        return Err(WorkspaceError::PathTraversal(rel.to_string()));
    }
    Ok(target)
}

fn collect_files(
    root: &Path,
    dir: &Path,
    files: &mut Vec<PathBuf>,
) -> Result<(), WorkspaceError> {
    for dir_entry in fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        let path = dir_entry.path();
        if path.is_dir() {
            collect_files(root, &path, files)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            files.push(rel.to_path_buf());
        }
    }
    Ok(())
}
