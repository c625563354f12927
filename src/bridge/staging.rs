//! Staged transfers through the shared host staging area.
//!
//! The staging directory on the host is bind-mounted into helper containers;
//! a staged copy is a single `cp -r` inside such a helper, so payload bytes
//! never pass through the daemon. The helper resolves symlinks on both sides
//! and refuses a copy whose source or target leaves its root.

use crate::container::{FsCommand, Owner};
use crate::naming::{self, PathError};
use std::path::Path;

/// Direction of a staged copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Staging area to container
    ToContainer,
    /// Container to staging area
    FromContainer,
}

/// One staged copy: a path in the staging area and a path in the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedTransfer {
    /// Confined path under the staging mount, as seen by the helper
    pub staged: String,
    /// Confined path under the user home
    pub container_path: String,
    pub direction: Direction,
    staging_root: String,
    home_root: String,
}

impl StagedTransfer {
    /// Confine both sides of a copy.
    pub fn resolve(
        staging_mount: &str,
        user_home: &str,
        staged: &str,
        container_path: &str,
        direction: Direction,
    ) -> Result<Self, PathError> {
        Ok(Self {
            staged: naming::confine(staging_mount, staged)?,
            container_path: naming::confine(user_home, container_path)?,
            direction,
            staging_root: root(staging_mount),
            home_root: root(user_home),
        })
    }

    /// Source of the copy.
    pub fn source(&self) -> &str {
        match self.direction {
            Direction::ToContainer => &self.staged,
            Direction::FromContainer => &self.container_path,
        }
    }

    /// Target of the copy.
    pub fn target(&self) -> &str {
        match self.direction {
            Direction::ToContainer => &self.container_path,
            Direction::FromContainer => &self.staged,
        }
    }

    fn roots(&self) -> (&str, &str) {
        match self.direction {
            Direction::ToContainer => (&self.staging_root, &self.home_root),
            Direction::FromContainer => (&self.home_root, &self.staging_root),
        }
    }

    /// Helper command performing the copy; the result belongs to `owner`.
    pub fn command(&self, owner: Owner) -> FsCommand {
        let (source_root, target_root) = self.roots();
        FsCommand::Copy {
            source: self.source().to_string(),
            target: self.target().to_string(),
            source_root: source_root.to_string(),
            target_root: target_root.to_string(),
            owner,
        }
    }
}

fn root(mount: &str) -> String {
    match mount.trim_end_matches('/') {
        "" => "/".to_string(),
        trimmed => trimmed.to_string(),
    }
}

/// Bind mount exposing the host staging root at `staging_mount`.
pub fn staging_bind(transfer_root: &Path, staging_mount: &str) -> String {
    format!("{}:{}", transfer_root.display(), staging_mount)
}
