//! In-process container engine.
//!
//! `MemoryEngine` keeps containers, networks and volume contents in memory
//! and interprets [`FsCommand`]s directly instead of running a shell. Bind
//! mounts of helper jobs point at real host directories, so staged copies
//! move real bytes between a host directory and the in-memory volumes.
//!
//! Every engine call is appended to a journal that tests inspect to assert
//! call ordering, and one-shot failures can be injected per operation.

use crate::container::archive::{self, ArchiveEntry, EntryKind};
use crate::container::{
    ArchiveStream, ContainerDetails, ContainerSpec, ContainerSummary, Effect, Engine, EngineError,
    ExecOutput, FsCommand, HelperJob, NetworkSpec, Owner, Result,
};
use crate::env::EXIT_NOT_FOUND;
use async_trait::async_trait;
use futures::stream;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const ARCHIVE_CHUNK: usize = 64 * 1024;

/// One recorded engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Engine operation, e.g. `create_container`
    pub op: &'static str,
    /// Container or network the call addressed
    pub target: String,
}

#[derive(Debug, Clone)]
enum Node {
    File {
        data: Vec<u8>,
        owner: Owner,
        mode: u32,
    },
    Dir {
        owner: Owner,
        mode: u32,
    },
    Link {
        target: String,
    },
}

impl Node {
    fn is_dir(&self) -> bool {
        matches!(self, Node::Dir { .. })
    }

    fn set_owner(&mut self, new: Owner) {
        match self {
            Node::File { owner, .. } | Node::Dir { owner, .. } => *owner = new,
            Node::Link { .. } => {}
        }
    }
}

/// Absolute path → node, for everything below the declared volume roots.
type Volume = BTreeMap<String, Node>;

#[derive(Debug)]
struct MemContainer {
    id: String,
    spec: ContainerSpec,
    running: bool,
    ip_address: Option<String>,
    networks: BTreeMap<String, String>,
    logs: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    containers: BTreeMap<String, MemContainer>,
    networks: BTreeMap<String, NetworkSpec>,
    volumes: HashMap<String, Volume>,
    journal: Vec<Call>,
    failures: HashMap<&'static str, String>,
    unavailable: bool,
    next_id: u64,
    next_host: u8,
}

impl State {
    fn record(&mut self, op: &'static str, target: &str) -> Result<()> {
        self.journal.push(Call {
            op,
            target: target.to_string(),
        });
        if self.unavailable {
            return Err(EngineError::Unavailable("engine offline".to_string()));
        }
        if let Some(message) = self.failures.remove(op) {
            return Err(EngineError::Api {
                status: 500,
                message,
            });
        }
        Ok(())
    }

    fn container(&self, name: &str) -> Result<&MemContainer> {
        self.containers
            .get(name)
            .ok_or_else(|| no_such_container(name))
    }

    /// Name of the container whose volumes `name` sees.
    fn volume_owner(&self, name: &str) -> Result<String> {
        let container = self.container(name)?;
        Ok(container
            .spec
            .volumes_from
            .first()
            .cloned()
            .unwrap_or_else(|| name.to_string()))
    }

    fn volume_mut(&mut self, owner: &str) -> Result<&mut Volume> {
        self.volumes
            .get_mut(owner)
            .ok_or_else(|| no_such_container(owner))
    }

    fn assign_address(&mut self, subnet: &str) -> String {
        self.next_host = self.next_host.wrapping_add(1).max(2);
        format!("{}.{}", subnet, self.next_host)
    }
}

/// In-memory [`Engine`] implementation.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    state: Mutex<State>,
}

impl MemoryEngine {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every call made so far.
    pub fn calls(&self) -> Vec<Call> {
        self.lock().journal.clone()
    }

    /// Number of calls of one operation.
    pub fn count(&self, op: &str) -> usize {
        self.lock().journal.iter().filter(|c| c.op == op).count()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.lock().journal.clear();
    }

    /// Make the next call of `op` fail with an API error.
    pub fn fail_next(&self, op: &'static str, message: &str) {
        self.lock().failures.insert(op, message.to_string());
    }

    /// Make every call fail as if the engine socket were gone.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Names of all containers.
    pub fn container_names(&self) -> Vec<String> {
        self.lock().containers.keys().cloned().collect()
    }

    /// Creation spec of a container.
    pub fn spec_of(&self, name: &str) -> Option<ContainerSpec> {
        self.lock().containers.get(name).map(|c| c.spec.clone())
    }

    /// Whether a container exists and runs.
    pub fn is_running(&self, name: &str) -> bool {
        self.lock()
            .containers
            .get(name)
            .is_some_and(|c| c.running)
    }

    /// Containers attached to a network.
    pub fn network_members(&self, network: &str) -> Vec<String> {
        self.lock()
            .containers
            .iter()
            .filter(|(_, c)| c.networks.contains_key(network))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Append a line to a container's output.
    pub fn push_log(&self, name: &str, line: &str) {
        if let Some(c) = self.lock().containers.get_mut(name) {
            c.logs.push(line.to_string());
        }
    }

    /// Content of a file in the volumes `container` sees.
    pub fn file(&self, container: &str, path: &str) -> Option<Vec<u8>> {
        let state = self.lock();
        let owner = state.volume_owner(container).ok()?;
        match state.volumes.get(&owner)?.get(path)? {
            Node::File { data, .. } => Some(data.clone()),
            Node::Dir { .. } | Node::Link { .. } => None,
        }
    }

    /// Owner and mode of a path in the volumes `container` sees.
    pub fn metadata(&self, container: &str, path: &str) -> Option<(Owner, u32)> {
        let state = self.lock();
        let owner = state.volume_owner(container).ok()?;
        match state.volumes.get(&owner)?.get(path)? {
            Node::File { owner, mode, .. } | Node::Dir { owner, mode } => Some((*owner, *mode)),
            Node::Link { .. } => None,
        }
    }

    /// Place a symlink at `path` in the volumes `container` sees, as a tenant
    /// process inside the sandbox could.
    pub fn symlink(&self, container: &str, path: &str, target: &str) -> Result<()> {
        let mut state = self.lock();
        let owner = state.volume_owner(container)?;
        let volume = state.volume_mut(&owner)?;
        ensure_parents(volume, path);
        volume.insert(
            path.to_string(),
            Node::Link {
                target: target.to_string(),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    async fn ping(&self) -> Result<()> {
        self.lock().record("ping", "")
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        state.record("list_containers", "")?;

        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| all || c.running)
            .map(|(name, c)| ContainerSummary {
                id: c.id.clone(),
                names: vec![format!("/{name}")],
                image: c.spec.image.clone(),
                state: if c.running { "running" } else { "exited" }.to_string(),
            })
            .collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        state.record("create_container", &spec.name)?;

        if state.containers.contains_key(&spec.name) {
            return Err(EngineError::Conflict(format!(
                "container name {} is already in use",
                spec.name
            )));
        }
        for source in &spec.volumes_from {
            state.container(source)?;
        }
        let mut networks = BTreeMap::new();
        if let Some(network) = user_network(spec) {
            if !state.networks.contains_key(network) {
                return Err(EngineError::NotFound(format!("network {network} not found")));
            }
            networks.insert(network.to_string(), String::new());
        }

        if spec.volumes_from.is_empty() {
            let volume = spec
                .volumes
                .iter()
                .map(|root| {
                    let node = Node::Dir {
                        owner: Owner::root(),
                        mode: 0o755,
                    };
                    (root.clone(), node)
                })
                .collect();
            state.volumes.insert(spec.name.clone(), volume);
        }

        state.next_id += 1;
        let id = format!("{:012x}", state.next_id);
        state.containers.insert(
            spec.name.clone(),
            MemContainer {
                id: id.clone(),
                spec: spec.clone(),
                running: false,
                ip_address: None,
                networks,
                logs: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        state.record("start_container", name)?;
        let on_bridge = user_network(&state.container(name)?.spec).is_none();

        let bridge = on_bridge.then(|| state.assign_address("172.17.0"));
        let attached: Vec<String> = state.containers[name].networks.keys().cloned().collect();
        let addresses: Vec<(String, String)> = attached
            .into_iter()
            .map(|net| {
                let ip = state.assign_address("10.10.0");
                (net, ip)
            })
            .collect();

        if let Some(c) = state.containers.get_mut(name) {
            c.running = true;
            c.ip_address = bridge;
            c.networks.extend(addresses);
        }
        Ok(())
    }

    async fn stop_container(&self, name: &str, _timeout: Duration) -> Result<Effect> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        state.record("stop_container", name)?;

        match state.containers.get_mut(name) {
            Some(c) if c.running => {
                c.running = false;
                c.ip_address = None;
                c.networks.values_mut().for_each(String::clear);
                Ok(Effect::Applied)
            }
            _ => Ok(Effect::Absent),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<Effect> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        state.record("remove_container", name)?;

        match state.containers.remove(name) {
            Some(_) => {
                state.volumes.remove(name);
                Ok(Effect::Applied)
            }
            None => Ok(Effect::Absent),
        }
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerDetails> {
        let mut state = self.lock();
        state.record("inspect_container", name)?;
        let c = state.container(name)?;

        Ok(ContainerDetails {
            id: c.id.clone(),
            image: c.spec.image.clone(),
            env: c.spec.env.clone(),
            running: c.running,
            ip_address: c.ip_address.clone(),
            networks: c.networks.clone(),
        })
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        let mut state = self.lock();
        state.record("network_exists", name)?;
        Ok(state.networks.contains_key(name))
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<Effect> {
        let mut state = self.lock();
        state.record("create_network", &spec.name)?;

        if state.networks.contains_key(&spec.name) {
            return Ok(Effect::Absent);
        }
        state.networks.insert(spec.name.clone(), spec.clone());
        Ok(Effect::Applied)
    }

    async fn connect_network(&self, network: &str, container: &str) -> Result<Effect> {
        let mut state = self.lock();
        state.record("connect_network", network)?;

        if !state.networks.contains_key(network) {
            return Err(EngineError::NotFound(format!("network {network} not found")));
        }
        let running = state.container(container)?.running;
        if state.containers[container].networks.contains_key(network) {
            return Ok(Effect::Absent);
        }
        let ip = if running {
            state.assign_address("10.10.0")
        } else {
            String::new()
        };
        if let Some(c) = state.containers.get_mut(container) {
            c.networks.insert(network.to_string(), ip);
        }
        Ok(Effect::Applied)
    }

    async fn upload_archive(&self, container: &str, dir: &str, tar: Vec<u8>) -> Result<()> {
        let mut state = self.lock();
        state.record("upload_archive", container)?;

        let owner = state.volume_owner(container)?;
        let entries = archive::unpack(&tar)?;
        let volume = state.volume_mut(&owner)?;
        if !volume.get(dir).is_some_and(Node::is_dir) {
            return Err(EngineError::NotFound(format!(
                "Could not find the file {dir} in container {container}"
            )));
        }

        for entry in entries {
            let path = join(dir, &entry.path);
            ensure_parents(volume, &path);
            let owner = Owner {
                uid: entry.uid,
                gid: entry.gid,
            };
            let node = match entry.kind {
                EntryKind::File(data) => Node::File {
                    data,
                    owner,
                    mode: entry.mode,
                },
                EntryKind::Directory => Node::Dir {
                    owner,
                    mode: entry.mode,
                },
            };
            volume.insert(path, node);
        }
        Ok(())
    }

    async fn download_archive(&self, container: &str, path: &str) -> Result<ArchiveStream> {
        let mut state = self.lock();
        state.record("download_archive", container)?;

        let owner = state.volume_owner(container)?;
        let volume = state.volume_mut(&owner)?;
        let tree = subtree(volume, path).ok_or_else(|| {
            EngineError::NotFound(format!(
                "Could not find the file {path} in container {container}"
            ))
        })?;

        let entries: Vec<ArchiveEntry> = tree
            .into_iter()
            .filter_map(|(relative, node)| to_entry(relative, node))
            .collect();
        let bytes = archive::pack(&entries)?;
        let chunks: Vec<Result<Vec<u8>>> = bytes
            .chunks(ARCHIVE_CHUNK)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();

        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn run_helper(&self, job: &HelperJob) -> Result<ExecOutput> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        state.record("run_helper", &job.name)?;

        if job.image.is_empty() {
            return Err(EngineError::ConfigError("Image is required".to_string()));
        }
        state.container(&job.volumes_from)?;
        let owner = state.volume_owner(&job.volumes_from)?;
        let volume = state.volume_mut(&owner)?;
        let mounts = Mounts::parse(&job.binds);

        Ok(execute(volume, &mounts, &job.command))
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<String> {
        let mut state = self.lock();
        state.record("logs", name)?;
        let c = state.container(name)?;

        let skip = c.logs.len().saturating_sub(tail);
        Ok(c.logs[skip..]
            .iter()
            .map(|line| format!("{line}\n"))
            .collect())
    }
}

/// The user-defined network a container is created on, if any.
fn user_network(spec: &ContainerSpec) -> Option<&str> {
    spec.network_mode
        .as_deref()
        .filter(|mode| !matches!(*mode, "bridge" | "default" | "host" | "none"))
        .filter(|mode| !mode.starts_with("container:"))
}

fn no_such_container(name: &str) -> EngineError {
    EngineError::NotFound(format!("No such container: {name}"))
}

fn join(dir: &str, relative: &str) -> String {
    let relative = relative.trim_matches('/');
    match (dir.trim_end_matches('/'), relative) {
        (base, "") => base.to_string(),
        ("", rel) => format!("/{rel}"),
        (base, rel) => format!("{base}/{rel}"),
    }
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => "",
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_under(path: &str, root: &str) -> bool {
    path.strip_prefix(root)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Create missing ancestors of `path` the way an archive extraction does.
fn ensure_parents(volume: &mut Volume, path: &str) {
    let mut missing = Vec::new();
    let mut current = parent(path);
    while !current.is_empty() && current != "/" && !volume.contains_key(current) {
        missing.push(current.to_string());
        current = parent(current);
    }
    for dir in missing.into_iter().rev() {
        volume.insert(
            dir,
            Node::Dir {
                owner: Owner::root(),
                mode: 0o755,
            },
        );
    }
}

/// `path` and everything below it, keyed by path relative to `parent(path)`.
fn subtree(volume: &Volume, path: &str) -> Option<Vec<(String, Node)>> {
    let root = volume.get(path)?;
    let base = basename(path).to_string();
    let mut tree = vec![(base.clone(), root.clone())];
    if root.is_dir() {
        tree.extend(
            volume
                .iter()
                .filter(|(p, _)| is_under(p, path))
                .map(|(p, node)| (format!("{base}{}", &p[path.len()..]), node.clone())),
        );
    }
    Some(tree)
}

/// Symlinks are left out of archives.
fn to_entry(path: String, node: Node) -> Option<ArchiveEntry> {
    match node {
        Node::File { data, owner, mode } => Some(ArchiveEntry::file(path, data, owner, mode)),
        Node::Dir { owner, mode } => Some(ArchiveEntry::directory(path, owner, mode)),
        Node::Link { .. } => None,
    }
}

/// `path` with every symlink in the volume followed, like `readlink -f`.
///
/// Components missing from the volume are kept literally, so a link into a
/// bind mount resolves to the mounted path. `None` on a link loop.
fn resolve_links(volume: &Volume, path: &str) -> Option<String> {
    let mut pending: Vec<String> = path
        .split('/')
        .rev()
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect();
    let mut resolved = String::from("/");
    let mut hops = 0;

    while let Some(part) = pending.pop() {
        match part.as_str() {
            "." => continue,
            ".." => {
                resolved = parent(&resolved).to_string();
                continue;
            }
            _ => {}
        }
        let next = join(&resolved, &part);
        match volume.get(&next) {
            Some(Node::Link { target }) => {
                hops += 1;
                if hops > 40 {
                    return None;
                }
                if target.starts_with('/') {
                    resolved = String::from("/");
                }
                pending.extend(
                    target
                        .split('/')
                        .rev()
                        .filter(|part| !part.is_empty())
                        .map(str::to_string),
                );
            }
            _ => resolved = next,
        }
    }
    Some(resolved)
}

fn is_within(path: &str, root: &str) -> bool {
    root == "/" || path == root || is_under(path, root)
}

/// Resolve one side of a copy and make sure it stays under `root`.
///
/// Bind-mounted paths are resolved on the host against the mounted root.
fn confine_side(
    volume: &Volume,
    mounts: &Mounts,
    path: &str,
    root: &str,
) -> std::result::Result<String, ExecOutput> {
    let outside = || ExecOutput::failed(1, format!("cp: {path} resolves outside {root}\n"));
    let resolved = resolve_links(volume, path).ok_or_else(outside)?;
    if !is_within(&resolved, root) {
        return Err(outside());
    }
    if let (Some(host), Some(host_root)) = (mounts.host_path(&resolved), mounts.host_path(root)) {
        let mut existing = host.as_path();
        while !existing.exists() {
            existing = existing.parent().ok_or_else(outside)?;
        }
        let (Ok(real), Ok(real_root)) = (existing.canonicalize(), host_root.canonicalize()) else {
            return Err(outside());
        };
        if !real.starts_with(&real_root) {
            return Err(outside());
        }
    }
    Ok(resolved)
}

/// Host bind mounts of a helper job.
struct Mounts {
    binds: Vec<(String, PathBuf)>,
}

impl Mounts {
    fn parse(binds: &[String]) -> Self {
        let binds = binds
            .iter()
            .filter_map(|bind| {
                let mut parts = bind.splitn(3, ':');
                let host = parts.next()?;
                let target = parts.next()?;
                Some((target.to_string(), PathBuf::from(host)))
            })
            .collect();
        Self { binds }
    }

    /// Host location of a container path under a bind mount.
    fn host_path(&self, path: &str) -> Option<PathBuf> {
        self.binds.iter().find_map(|(target, host)| {
            if path == target {
                Some(host.clone())
            } else if is_under(path, target) {
                Some(host.join(&path[target.len() + 1..]))
            } else {
                None
            }
        })
    }
}

fn not_found() -> ExecOutput {
    ExecOutput::failed(EXIT_NOT_FOUND, "")
}

fn execute(volume: &mut Volume, mounts: &Mounts, command: &FsCommand) -> ExecOutput {
    match command {
        FsCommand::Exists { path } => {
            if volume.contains_key(path) {
                ExecOutput::ok("")
            } else {
                not_found()
            }
        }
        FsCommand::MakeDir { dirs, owner } => {
            for dir in dirs {
                match volume.get(dir) {
                    Some(node) if node.is_dir() => continue,
                    Some(_) => return ExecOutput::failed(1, format!("mkdir: can't create directory '{dir}': File exists\n")),
                    None => {}
                }
                if !volume.get(parent(dir)).is_some_and(Node::is_dir) {
                    return not_found();
                }
                volume.insert(
                    dir.clone(),
                    Node::Dir {
                        owner: *owner,
                        mode: 0o755,
                    },
                );
            }
            ExecOutput::ok("")
        }
        FsCommand::Remove { path, recursive } => {
            let Some(node) = volume.get(path) else {
                return ExecOutput::ok("");
            };
            let has_children = volume.keys().any(|p| is_under(p, path));
            if node.is_dir() && has_children && !recursive {
                return ExecOutput::failed(1, format!("rmdir: '{path}': Directory not empty\n"));
            }
            volume.retain(|p, _| p != path && !is_under(p, path));
            ExecOutput::ok("")
        }
        FsCommand::List { path, recursive } => {
            match volume.get(path) {
                None => return not_found(),
                Some(node) if !node.is_dir() => {
                    return ExecOutput::failed(1, format!("not a directory: {path}\n"));
                }
                Some(_) => {}
            }
            let mut dirs = String::new();
            let mut files = String::new();
            for (p, node) in volume.iter().filter(|(p, _)| is_under(p, path)) {
                let relative = &p[path.len() + 1..];
                if !recursive && relative.contains('/') {
                    continue;
                }
                if node.is_dir() {
                    dirs.push_str(&format!("./{relative}/\n"));
                } else {
                    files.push_str(&format!("./{relative}\n"));
                }
            }
            ExecOutput::ok(dirs + &files)
        }
        FsCommand::Chown {
            path,
            owner,
            recursive,
        } => {
            if !volume.contains_key(path) {
                return not_found();
            }
            for (p, node) in volume.iter_mut() {
                if p == path || (*recursive && is_under(p, path)) {
                    node.set_owner(*owner);
                }
            }
            ExecOutput::ok("")
        }
        FsCommand::Copy {
            source,
            target,
            source_root,
            target_root,
            owner,
        } => {
            let source = match confine_side(volume, mounts, source, source_root) {
                Ok(resolved) => resolved,
                Err(refused) => return refused,
            };
            let target = match confine_side(volume, mounts, target, target_root) {
                Ok(resolved) => resolved,
                Err(refused) => return refused,
            };
            copy(volume, mounts, &source, &target, *owner)
        }
    }
}

fn copy(volume: &mut Volume, mounts: &Mounts, source: &str, target: &str, owner: Owner) -> ExecOutput {
    // Read the source tree, relative to its own root ("" is the root).
    let tree: Vec<(String, Node)> = match mounts.host_path(source) {
        Some(host) => match read_host_tree(&host) {
            Ok(Some(tree)) => tree,
            Ok(None) => return not_found(),
            Err(e) => return ExecOutput::failed(1, format!("cp: {e}\n")),
        },
        None => match subtree(volume, source) {
            Some(tree) => {
                let base = basename(source).len();
                tree.into_iter()
                    .map(|(p, node)| (p[base..].trim_start_matches('/').to_string(), node))
                    .collect()
            }
            None => return not_found(),
        },
    };

    match mounts.host_path(target) {
        Some(host) => {
            let host = if host.is_dir() {
                host.join(basename(source))
            } else {
                host
            };
            match write_host_tree(&host, tree) {
                Ok(()) => ExecOutput::ok(""),
                Err(e) => ExecOutput::failed(1, format!("cp: {e}\n")),
            }
        }
        None => {
            let target = if volume.get(target).is_some_and(Node::is_dir) {
                join(target, basename(source))
            } else {
                target.to_string()
            };
            ensure_parents(volume, &target);
            for (relative, mut node) in tree {
                node.set_owner(owner);
                volume.insert(join(&target, &relative), node);
            }
            ExecOutput::ok("")
        }
    }
}

fn read_host_tree(root: &Path) -> std::io::Result<Option<Vec<(String, Node)>>> {
    if !root.exists() {
        return Ok(None);
    }
    let mut tree = Vec::new();
    let mut pending = vec![(root.to_path_buf(), String::new())];
    while let Some((path, relative)) = pending.pop() {
        if path.is_dir() {
            tree.push((
                relative.clone(),
                Node::Dir {
                    owner: Owner::root(),
                    mode: 0o755,
                },
            ));
            for entry in std::fs::read_dir(&path)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let child = if relative.is_empty() {
                    name
                } else {
                    format!("{relative}/{name}")
                };
                pending.push((entry.path(), child));
            }
        } else {
            let data = std::fs::read(&path)?;
            tree.push((
                relative,
                Node::File {
                    data,
                    owner: Owner::root(),
                    mode: 0o644,
                },
            ));
        }
    }
    Ok(Some(tree))
}

fn write_host_tree(root: &Path, mut tree: Vec<(String, Node)>) -> std::io::Result<()> {
    tree.sort_by(|a, b| a.0.cmp(&b.0));
    if let Some(dir) = root.parent() {
        std::fs::create_dir_all(dir)?;
    }
    for (relative, node) in tree {
        let path = if relative.is_empty() {
            root.to_path_buf()
        } else {
            root.join(relative)
        };
        match node {
            Node::Dir { .. } => std::fs::create_dir_all(&path)?,
            Node::File { data, .. } => std::fs::write(&path, data)?,
            Node::Link { .. } => {}
        }
    }
    Ok(())
}
