//! File bridge between the host and a tenant's data volumes.
//!
//! Small payloads move inline as tar archives uploaded to or downloaded from
//! the data holder. Everything else (existence checks, listings, directory
//! changes, staged copies) runs as a filesystem command inside a one-shot
//! helper container that mounts the data holder's volumes and, for staged
//! copies, the host staging area.
//!
//! Every caller-supplied path is confined under the user home (or the
//! staging mount) before it reaches the engine.

pub mod staging;

pub use staging::{Direction, StagedTransfer};

use crate::config::{BridgeConfig, SandboxdConfig};
use crate::container::archive::{self, ArchiveEntry, EntryKind};
use crate::container::{Engine, EngineError, ExecOutput, FsCommand, HelperJob, Owner};
use crate::naming::{self, ResourceNames, TenantId};
use crate::sandbox::{Result, SandboxError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Tar framing allowance on top of an inline payload.
const ARCHIVE_OVERHEAD: usize = 16 * 1024;

/// Largest secret accepted from the data holder.
const MAX_SECRET_BYTES: usize = 64 * 1024;

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

/// Host ↔ container file operations for every tenant.
pub struct FileBridge {
    engine: Arc<dyn Engine>,
    names: ResourceNames,
    config: BridgeConfig,
    transfer_root: PathBuf,
}

impl FileBridge {
    pub fn new(engine: Arc<dyn Engine>, config: &SandboxdConfig, transfer_root: PathBuf) -> Self {
        Self {
            engine,
            names: ResourceNames::new(config.naming.prefix.clone()),
            config: config.bridge.clone(),
            transfer_root,
        }
    }

    /// Host staging root.
    pub fn transfer_root(&self) -> &Path {
        &self.transfer_root
    }

    /// Full content of one file under the user home.
    pub async fn read(&self, tenant: &TenantId, path: &str) -> Result<Vec<u8>> {
        let target = self.home_path(path)?;
        let limit = self.config.max_inline_bytes;

        let ceiling = limit + ARCHIVE_OVERHEAD;
        let Some(entries) = self
            .download(tenant, &target, ceiling)
            .await
            .map_err(|e| self.report("read", tenant, e))?
        else {
            // Transfer was cut short; the true size is at least the ceiling.
            return Err(SandboxError::PayloadTooLarge {
                size: ceiling,
                limit,
            });
        };

        match entries.into_iter().next().map(|entry| entry.kind) {
            Some(EntryKind::File(data)) if data.len() > limit => Err(SandboxError::PayloadTooLarge {
                size: data.len(),
                limit,
            }),
            Some(EntryKind::File(data)) => Ok(data),
            Some(EntryKind::Directory) => Err(SandboxError::IsDirectory(target)),
            None => Err(SandboxError::NotFound(target)),
        }
    }

    /// Write one file under the user home, creating its parents.
    ///
    /// The file and any directories created for it belong to `owner_uid`
    /// (the configured owner when `None`).
    pub async fn write(
        &self,
        tenant: &TenantId,
        path: &str,
        data: Vec<u8>,
        owner_uid: Option<u32>,
    ) -> Result<()> {
        let limit = self.config.max_inline_bytes;
        if data.len() > limit {
            return Err(SandboxError::PayloadTooLarge {
                size: data.len(),
                limit,
            });
        }

        let target = self.home_path(path)?;
        let relative = self.home_relative(&target);
        if relative.is_empty() {
            return Err(SandboxError::IsDirectory(target));
        }

        let owner = self.owner(owner_uid);
        let size = data.len();
        let mut entries: Vec<ArchiveEntry> = ancestors(relative)
            .map(|dir| ArchiveEntry::directory(dir, owner, DIR_MODE))
            .collect();
        entries.push(ArchiveEntry::file(relative, data, owner, FILE_MODE));

        let tar = archive::pack(&entries)?;
        self.engine
            .upload_archive(&self.names.data(tenant), &self.config.user_home, tar)
            .await
            .map_err(|e| self.report("write", tenant, e))?;

        debug!("Wrote {} bytes to {} for {}", size, target, tenant);
        Ok(())
    }

    /// Whether a path exists under the user home.
    pub async fn exists(&self, tenant: &TenantId, path: &str) -> Result<bool> {
        let target = self.home_path(path)?;
        let output = self
            .run(tenant, FsCommand::Exists { path: target.clone() }, false)
            .await?;

        if output.success() {
            Ok(true)
        } else if output.not_found() {
            Ok(false)
        } else {
            Err(file_operation("exists", target, &output))
        }
    }

    /// Create a directory; with `recursive`, create missing parents too.
    pub async fn make_dir(&self, tenant: &TenantId, path: &str, recursive: bool) -> Result<()> {
        let target = self.home_path(path)?;
        let dirs = if recursive {
            ancestors(self.home_relative(&target))
                .map(|dir| format!("{}/{}", self.config.user_home, dir))
                .chain(std::iter::once(target.clone()))
                .collect()
        } else {
            vec![target.clone()]
        };
        let command = FsCommand::MakeDir {
            dirs,
            owner: self.owner(None),
        };

        let output = self.run(tenant, command, false).await?;
        check("mkdir", target, &output)
    }

    /// Remove a file or directory. Removing an absent path succeeds.
    pub async fn remove(&self, tenant: &TenantId, path: &str, recursive: bool) -> Result<()> {
        let target = self.home_path(path)?;
        if self.home_relative(&target).is_empty() {
            return Err(SandboxError::FileOperation {
                operation: "rm",
                path: target,
                message: "refusing to remove the home directory".to_string(),
            });
        }

        let output = self
            .run(
                tenant,
                FsCommand::Remove {
                    path: target.clone(),
                    recursive,
                },
                false,
            )
            .await?;
        check("rm", target, &output)
    }

    /// Entries under a directory, sorted, relative to it. Directories end in `/`.
    pub async fn list(&self, tenant: &TenantId, path: &str, recursive: bool) -> Result<Vec<String>> {
        let target = self.home_path(path)?;
        let output = self
            .run(
                tenant,
                FsCommand::List {
                    path: target.clone(),
                    recursive,
                },
                false,
            )
            .await?;
        check("ls", target, &output)?;

        let mut entries: Vec<String> = output
            .stdout
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .map(|line| line.strip_prefix("./").unwrap_or(line))
            .filter(|line| !line.is_empty() && *line != "/")
            .map(str::to_string)
            .collect();
        entries.sort();
        Ok(entries)
    }

    /// Hand a path (and with `recursive`, everything below it) to `uid`.
    pub async fn chown(&self, tenant: &TenantId, path: &str, uid: u32, recursive: bool) -> Result<()> {
        let target = self.home_path(path)?;
        let command = FsCommand::Chown {
            path: target.clone(),
            owner: Owner::new(uid),
            recursive,
        };

        let output = self.run(tenant, command, false).await?;
        check("chown", target, &output)
    }

    /// The tenant's authentication secret.
    pub async fn read_secret(&self, tenant: &TenantId) -> Result<String> {
        let path = self.config.secret_path.clone();
        let entries = self
            .download(tenant, &path, MAX_SECRET_BYTES + ARCHIVE_OVERHEAD)
            .await
            .map_err(|e| self.report("read_secret", tenant, e))?
            .ok_or(SandboxError::PayloadTooLarge {
                size: MAX_SECRET_BYTES + ARCHIVE_OVERHEAD,
                limit: MAX_SECRET_BYTES,
            })?;

        let data = match entries.into_iter().next().map(|entry| entry.kind) {
            Some(EntryKind::File(data)) => data,
            Some(EntryKind::Directory) => return Err(SandboxError::IsDirectory(path)),
            None => return Err(SandboxError::NotFound(path)),
        };

        String::from_utf8(data).map_err(|e| SandboxError::FileOperation {
            operation: "read_secret",
            path,
            message: e.to_string(),
        })
    }

    /// Replace the tenant's authentication secret.
    pub async fn write_secret(&self, tenant: &TenantId, secret: &str) -> Result<()> {
        let (dir, name) = naming::split_parent(&self.config.secret_path).ok_or_else(|| {
            SandboxError::FileOperation {
                operation: "write_secret",
                path: self.config.secret_path.clone(),
                message: "secret path has no parent directory".to_string(),
            }
        })?;

        let entry = ArchiveEntry::file(name, secret.as_bytes().to_vec(), Owner::root(), FILE_MODE);
        let tar = archive::pack(&[entry])?;
        self.engine
            .upload_archive(&self.names.data(tenant), dir, tar)
            .await
            .map_err(|e| self.report("write_secret", tenant, e))?;

        info!("Secret of {} updated", tenant);
        Ok(())
    }

    /// Copy a staged file or tree into the user home.
    pub async fn large_write(&self, tenant: &TenantId, staged_source: &str, target: &str) -> Result<()> {
        let transfer = self.staged(staged_source, target, Direction::ToContainer)?;
        self.transfer(tenant, &transfer).await
    }

    /// Copy a file or tree from the user home into the staging area.
    pub async fn large_read(&self, tenant: &TenantId, source: &str, staged_target: &str) -> Result<()> {
        let transfer = self.staged(staged_target, source, Direction::FromContainer)?;
        self.transfer(tenant, &transfer).await
    }

    /// Give the host staging root to the configured owner.
    pub async fn set_staging_writeable(&self) -> Result<()> {
        let root = self.transfer_root.clone();
        let uid = self.config.owner_uid;

        tokio::task::spawn_blocking(move || std::os::unix::fs::chown(&root, Some(uid), Some(uid)))
            .await
            .map_err(|e| SandboxError::Io(std::io::Error::other(e)))?
            .inspect_err(|e| error!("Failed to chown {}: {}", self.transfer_root.display(), e))?;

        info!(
            "Staging root {} now owned by {}",
            self.transfer_root.display(),
            uid
        );
        Ok(())
    }

    fn home_path(&self, path: &str) -> Result<String> {
        Ok(naming::confine(&self.config.user_home, path)?)
    }

    /// `target` relative to the user home; empty for the home itself.
    fn home_relative<'a>(&self, target: &'a str) -> &'a str {
        target
            .strip_prefix(self.config.user_home.trim_end_matches('/'))
            .unwrap_or(target)
            .trim_start_matches('/')
    }

    fn owner(&self, uid: Option<u32>) -> Owner {
        Owner::new(uid.unwrap_or(self.config.owner_uid))
    }

    fn staged(&self, staged: &str, container_path: &str, direction: Direction) -> Result<StagedTransfer> {
        Ok(StagedTransfer::resolve(
            &self.config.staging_mount,
            &self.config.user_home,
            staged,
            container_path,
            direction,
        )?)
    }

    async fn transfer(&self, tenant: &TenantId, transfer: &StagedTransfer) -> Result<()> {
        let command = transfer.command(self.owner(None));
        let output = self.run(tenant, command, true).await?;
        check("cp", transfer.source().to_string(), &output)?;

        info!(
            "Copied {} to {} for {}",
            transfer.source(),
            transfer.target(),
            tenant
        );
        Ok(())
    }

    async fn download(
        &self,
        tenant: &TenantId,
        path: &str,
        ceiling: usize,
    ) -> std::result::Result<Option<Vec<ArchiveEntry>>, EngineError> {
        let stream = self
            .engine
            .download_archive(&self.names.data(tenant), path)
            .await?;
        archive::collect(stream, ceiling)
            .await?
            .map(|tar| archive::unpack(&tar))
            .transpose()
    }

    async fn run(&self, tenant: &TenantId, command: FsCommand, staging: bool) -> Result<ExecOutput> {
        let binds = if staging {
            vec![staging::staging_bind(
                &self.transfer_root,
                &self.config.staging_mount,
            )]
        } else {
            Vec::new()
        };
        let job = HelperJob {
            name: self.names.helper(tenant),
            image: self.config.helper_image.clone(),
            volumes_from: self.names.data(tenant),
            binds,
            command,
        };

        debug!("Running `{}` for {} in {}", job.command, tenant, job.name);
        self.engine
            .run_helper(&job)
            .await
            .map_err(|e| self.report(job.command.operation(), tenant, e))
    }

    fn report(&self, operation: &str, tenant: &TenantId, err: EngineError) -> SandboxError {
        error!("{} failed for tenant {}: {}", operation, tenant, err);
        err.into()
    }
}

/// Proper ancestors of a relative path, outermost first.
fn ancestors(relative: &str) -> impl Iterator<Item = &str> {
    relative
        .match_indices('/')
        .map(move |(idx, _)| &relative[..idx])
}

fn check(operation: &'static str, path: String, output: &ExecOutput) -> Result<()> {
    if output.success() {
        Ok(())
    } else if output.not_found() {
        Err(SandboxError::NotFound(path))
    } else {
        Err(file_operation(operation, path, output))
    }
}

fn file_operation(operation: &'static str, path: String, output: &ExecOutput) -> SandboxError {
    SandboxError::FileOperation {
        operation,
        path,
        message: output.combined().trim().to_string(),
    }
}
