//! One-shot helper containers.
//!
//! The data volume holder never runs, so filesystem work on a tenant's volumes
//! happens in a short-lived helper container that mounts the holder's volumes
//! (and the staging area), runs a single [`FsCommand`] and is removed again.
//!
//! Commands are typed; the Docker engine renders them to a `sh -c` script
//! whose paths are passed as positional arguments, never spliced into the
//! script text.

use crate::env::EXIT_NOT_FOUND;
use std::borrow::Cow;
use std::fmt;

/// Output from a helper run.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Exit code (None if not available)
    pub exit_code: Option<i64>,
}

impl ExecOutput {
    /// Successful run with the given stdout.
    pub fn ok<S: Into<String>>(stdout: S) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    /// Failed run with the given exit code and stderr.
    pub fn failed<S: Into<String>>(exit_code: i64, stderr: S) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(exit_code),
        }
    }

    /// Check if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Whether the command reported a missing path.
    pub fn not_found(&self) -> bool {
        self.exit_code == Some(EXIT_NOT_FOUND)
    }

    /// Get combined output (stdout + stderr).
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Numeric owner applied to files written on a tenant's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    /// User id
    pub uid: u32,
    /// Group id
    pub gid: u32,
}

impl Owner {
    /// Owner with matching uid and gid.
    pub fn new(uid: u32) -> Self {
        Self { uid, gid: uid }
    }

    /// The superuser.
    pub fn root() -> Self {
        Self { uid: 0, gid: 0 }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

/// A filesystem command run inside a helper container.
///
/// Every command exits with [`EXIT_NOT_FOUND`] when the path it needs is
/// missing, `0` on success and any other code on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsCommand {
    /// Succeed if `path` exists
    Exists {
        /// Absolute container path
        path: String,
    },
    /// Create each directory of `dirs` in order, skipping existing ones
    MakeDir {
        /// Absolute container paths, parents first
        dirs: Vec<String>,
        /// Owner of newly created directories
        owner: Owner,
    },
    /// Remove a path; an absent path is not an error
    Remove {
        /// Absolute container path
        path: String,
        /// Remove directories with their contents
        recursive: bool,
    },
    /// Print the entries under a directory, one `./relative` path per line,
    /// directories with a trailing `/`
    List {
        /// Absolute container path of the directory
        path: String,
        /// Descend into subdirectories
        recursive: bool,
    },
    /// Change ownership of a path
    Chown {
        /// Absolute container path
        path: String,
        /// New owner
        owner: Owner,
        /// Apply to the whole tree
        recursive: bool,
    },
    /// Copy a file or tree, creating the target's parents, then hand the
    /// copy to `owner`.
    ///
    /// Both paths are resolved through symlinks first; the copy fails unless
    /// the source stays under `source_root` and the deepest existing part of
    /// the target stays under `target_root`.
    Copy {
        /// Absolute container path of the source
        source: String,
        /// Absolute container path of the target
        target: String,
        /// Directory the resolved source must stay under
        source_root: String,
        /// Directory the resolved target must stay under
        target_root: String,
        /// Owner of the copied tree
        owner: Owner,
    },
}

const EXISTS_SCRIPT: &str = r#"[ -e "$1" ] || [ -L "$1" ] || exit 44"#;

const MAKE_DIR_SCRIPT: &str = r#"owner="$1"; shift
for d in "$@"; do
  [ -d "$d" ] && continue
  [ -d "$(dirname "$d")" ] || exit 44
  mkdir "$d" && chown "$owner" "$d" || exit 1
done"#;

const REMOVE_SCRIPT: &str = r#"[ -e "$1" ] || [ -L "$1" ] || exit 0
if [ -d "$1" ] && [ ! -L "$1" ]; then rmdir "$1"; else rm -f "$1"; fi"#;

const REMOVE_RECURSIVE_SCRIPT: &str = r#"rm -rf "$1""#;

const LIST_SCRIPT: &str = r#"[ -e "$1" ] || exit 44
[ -d "$1" ] || { echo "not a directory: $1" >&2; exit 1; }
cd "$1" || exit 1
find . -mindepth 1 $2 -type d | sed 's|$|/|'
find . -mindepth 1 $2 ! -type d"#;

const CHOWN_SCRIPT: &str = r#"[ -e "$1" ] || exit 44
chown $3 "$2" "$1""#;

const COPY_SCRIPT: &str = r#"inside() {
  r=$(readlink -f "$1") || { echo "cp: cannot resolve $1" >&2; exit 1; }
  case "$r/" in "${2%/}"/*) ;; *) echo "cp: $1 resolves outside $2" >&2; exit 1 ;; esac
}
existing() {
  p="$1"
  while [ ! -e "$p" ] && [ ! -L "$p" ]; do p=$(dirname "$p"); done
  echo "$p"
}
[ -e "$1" ] || exit 44
inside "$1" "$4"
inside "$(existing "$2")" "$5"
mkdir -p "$(dirname "$2")" && cp -r "$1" "$2" && chown -hR "$3" "$2""#;

impl FsCommand {
    /// Short name used in logs and error messages.
    pub fn operation(&self) -> &'static str {
        match self {
            FsCommand::Exists { .. } => "exists",
            FsCommand::MakeDir { .. } => "mkdir",
            FsCommand::Remove { .. } => "rm",
            FsCommand::List { .. } => "ls",
            FsCommand::Chown { .. } => "chown",
            FsCommand::Copy { .. } => "cp",
        }
    }

    /// The helper's command line.
    pub fn argv(&self) -> Vec<String> {
        let (script, args): (&str, Vec<String>) = match self {
            FsCommand::Exists { path } => (EXISTS_SCRIPT, vec![path.clone()]),
            FsCommand::MakeDir { dirs, owner } => {
                let mut args = vec![owner.to_string()];
                args.extend(dirs.iter().cloned());
                (MAKE_DIR_SCRIPT, args)
            }
            FsCommand::Remove { path, recursive } => {
                let script = if *recursive {
                    REMOVE_RECURSIVE_SCRIPT
                } else {
                    REMOVE_SCRIPT
                };
                (script, vec![path.clone()])
            }
            FsCommand::List { path, recursive } => {
                // $2 stays unquoted in the script so an empty value vanishes.
                let depth = if *recursive { "" } else { "-maxdepth 1" };
                (LIST_SCRIPT, vec![path.clone(), depth.to_string()])
            }
            FsCommand::Chown {
                path,
                owner,
                recursive,
            } => {
                let flag = if *recursive { "-R" } else { "" };
                (
                    CHOWN_SCRIPT,
                    vec![path.clone(), owner.to_string(), flag.to_string()],
                )
            }
            FsCommand::Copy {
                source,
                target,
                source_root,
                target_root,
                owner,
            } => (
                COPY_SCRIPT,
                vec![
                    source.clone(),
                    target.clone(),
                    owner.to_string(),
                    source_root.clone(),
                    target_root.clone(),
                ],
            ),
        };

        let mut argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "sh".to_string(),
        ];
        argv.extend(args);
        argv
    }
}

impl fmt::Display for FsCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let quote = |s: &str| shell_escape::escape(Cow::Borrowed(s)).into_owned();
        match self {
            FsCommand::Exists { path } => write!(f, "test -e {}", quote(path)),
            FsCommand::MakeDir { dirs, owner } => {
                let last = dirs.last().map(String::as_str).unwrap_or_default();
                write!(f, "mkdir {} (owner {})", quote(last), owner)
            }
            FsCommand::Remove { path, recursive } => {
                let flag = if *recursive { "-rf" } else { "-f" };
                write!(f, "rm {} {}", flag, quote(path))
            }
            FsCommand::List { path, recursive } => {
                let flag = if *recursive { " -R" } else { "" };
                write!(f, "ls{} {}", flag, quote(path))
            }
            FsCommand::Chown {
                path,
                owner,
                recursive,
            } => {
                let flag = if *recursive { " -R" } else { "" };
                write!(f, "chown{} {} {}", flag, owner, quote(path))
            }
            FsCommand::Copy {
                source,
                target,
                owner,
                ..
            } => write!(
                f,
                "cp -r {} {} (owner {})",
                quote(source),
                quote(target),
                owner
            ),
        }
    }
}

/// A helper container run: one command against one tenant's volumes.
#[derive(Debug, Clone)]
pub struct HelperJob {
    /// Helper container name
    pub name: String,
    /// Helper image
    pub image: String,
    /// Container whose volumes are mounted (the data holder)
    pub volumes_from: String,
    /// Host bind mounts (the staging area)
    pub binds: Vec<String>,
    /// Command to run
    pub command: FsCommand,
}

#[cfg(feature = "docker")]
pub(crate) use docker::run_helper;

#[cfg(feature = "docker")]
mod docker {
    use super::{ExecOutput, HelperJob};
    use crate::container::{ContainerSpec, Result};
    use bollard::Docker;
    use bollard::container::LogOutput;
    use bollard::query_parameters::{
        CreateContainerOptionsBuilder, LogsOptionsBuilder, RemoveContainerOptionsBuilder,
        StartContainerOptions, WaitContainerOptionsBuilder,
    };
    use futures::stream::StreamExt;
    use tracing::{debug, warn};

    /// Run a helper container to completion and collect its output.
    ///
    /// The helper is force-removed whatever the outcome.
    pub(crate) async fn run_helper(docker: &Docker, job: &HelperJob) -> Result<ExecOutput> {
        debug!("Running helper {}: {}", job.name, job.command);

        let mut builder = ContainerSpec::builder()
            .name(&job.name)
            .image(&job.image)
            .cmd(job.command.argv())
            .volumes_from(&job.volumes_from)
            .network_mode("none");
        for bind in &job.binds {
            builder = builder.bind(bind);
        }
        let spec = builder.build()?;

        let options = CreateContainerOptionsBuilder::new().name(&job.name).build();
        docker
            .create_container(Some(options), spec.to_create_body())
            .await?;

        let outcome = collect(docker, &job.name).await;

        let remove = RemoveContainerOptionsBuilder::new().force(true).v(true).build();
        if let Err(e) = docker.remove_container(&job.name, Some(remove)).await {
            warn!("Failed to remove helper {}: {}", job.name, e);
        }

        outcome
    }

    async fn collect(docker: &Docker, name: &str) -> Result<ExecOutput> {
        docker
            .start_container(name, None::<StartContainerOptions>)
            .await?;

        let wait = WaitContainerOptionsBuilder::new()
            .condition("not-running")
            .build();
        let mut waits = docker.wait_container(name, Some(wait));
        let mut exit_code = None;
        while let Some(result) = waits.next().await {
            match result {
                Ok(response) => exit_code = Some(response.status_code),
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    exit_code = Some(code)
                }
                Err(e) => return Err(e.into()),
            }
        }

        let logs = LogsOptionsBuilder::new().stdout(true).stderr(true).build();
        let mut stream = docker.logs(name, Some(logs));
        let mut output = ExecOutput {
            exit_code,
            ..Default::default()
        };
        while let Some(result) = stream.next().await {
            match result? {
                LogOutput::StdOut { message } => {
                    output.stdout.push_str(&String::from_utf8_lossy(&message))
                }
                LogOutput::StdErr { message } => {
                    output.stderr.push_str(&String::from_utf8_lossy(&message))
                }
                _ => {}
            }
        }

        debug!("Helper {} exited with code: {:?}", name, output.exit_code);
        Ok(output)
    }
}
