use std::{
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use tokio::{fs, io::AsyncWriteExt};

use crate::engine::{error::EngineError, sandbox::language::LanguageSpec};

pub const STDIN_FILE: &str = "stdin.txt";

/// Numeric identity the sandboxed program runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    /// Parses `uid[:gid]`. Named users cannot be resolved here and yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (uid, gid) = match raw.split_once(':') {
            Some((uid, gid)) => (uid.trim(), gid.trim()),
            None => (raw.trim(), raw.trim()),
        };
        Some(Self {
            uid: uid.parse().ok()?,
            gid: gid.parse().ok()?,
        })
    }
}

/// A session's private directory holding the source, its stdin and, after
/// compiling, the artifact.
#[derive(Debug, Clone)]
pub struct Workspace {
    dir: PathBuf,
    source: PathBuf,
    stdin: PathBuf,
    artifact: Option<PathBuf>,
}

impl Workspace {
    /// Creates `base/name` and writes the session files into it. The leaf
    /// directory must not exist yet; nothing already on disk is reused. On
    /// failure the partially written directory is removed.
    pub async fn create(
        base: &Path,
        name: &str,
        language: &LanguageSpec,
        code: &str,
        stdin: &str,
        owner: Option<Owner>,
    ) -> Result<Self, EngineError> {
        fs::create_dir_all(base)
            .await
            .map_err(|err| provisioning("create sandbox root", base, err))?;

        let dir = base.join(name);
        fs::DirBuilder::new()
            .mode(0o700)
            .create(&dir)
            .await
            .map_err(|err| provisioning("create workspace", &dir, err))?;

        let source = language.source_path(&dir);
        let workspace = Self {
            artifact: language.artifact_path(&source),
            stdin: dir.join(STDIN_FILE),
            source,
            dir,
        };

        if let Err(err) = workspace.populate(code, stdin, owner).await {
            workspace.discard().await;
            return Err(err);
        }
        Ok(workspace)
    }

    async fn populate(&self, code: &str, stdin: &str, owner: Option<Owner>) -> Result<(), EngineError> {
        write_private(&self.source, code.as_bytes()).await?;
        write_private(&self.stdin, stdin.as_bytes()).await?;

        let Some(owner) = owner else {
            return Ok(());
        };

        let handover = [&self.dir, &self.source, &self.stdin]
            .into_iter()
            .try_for_each(|path| std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid)));
        if let Err(err) = handover {
            if err.kind() != io::ErrorKind::PermissionDenied {
                return Err(provisioning("chown workspace", &self.dir, err));
            }
            // Not running privileged: widen access so the sandbox user can
            // still write the artifact next to the source.
            tracing::warn!(
                workspace = %self.dir.display(),
                uid = owner.uid,
                "cannot hand workspace to sandbox user; widening permissions"
            );
            set_mode(&self.dir, 0o777).await?;
            set_mode(&self.source, 0o644).await?;
            set_mode(&self.stdin, 0o644).await?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn stdin(&self) -> &Path {
        &self.stdin
    }

    pub fn artifact(&self) -> Option<&Path> {
        self.artifact.as_deref()
    }

    /// Best-effort removal after a failed provision. Returns whether the
    /// directory is gone; a failure is logged, not raised.
    pub(crate) async fn discard(&self) -> bool {
        match self.remove().await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    workspace = %self.dir.display(),
                    error = %err,
                    "failed to remove partially written workspace"
                );
                false
            }
        }
    }

    /// Removes the session files and the directory. Missing entries are fine.
    pub async fn remove(&self) -> io::Result<()> {
        let files = [Some(&self.source), self.artifact.as_ref(), Some(&self.stdin)];
        for file in files.into_iter().flatten() {
            ignore_missing(fs::remove_file(file).await)?;
        }
        ignore_missing(fs::remove_dir_all(&self.dir).await)
    }
}

async fn write_private(path: &Path, contents: &[u8]) -> Result<(), EngineError> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .await
        .map_err(|err| provisioning("create file", path, err))?;
    file.write_all(contents)
        .await
        .map_err(|err| provisioning("write file", path, err))?;
    file.flush()
        .await
        .map_err(|err| provisioning("flush file", path, err))
}

async fn set_mode(path: &Path, mode: u32) -> Result<(), EngineError> {
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|err| provisioning("set permissions", path, err))
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn provisioning(action: &str, path: &Path, err: io::Error) -> EngineError {
    EngineError::ProvisioningFailed(format!("{action} {}: {err}", path.display()))
}
