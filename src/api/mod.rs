//! Request front end.
//!
//! One [`Request`] per call, tagged by `method`. Tenant identifiers and
//! paths arrive as plain strings and are validated here, so a bad name is
//! reported with the `validation` code instead of a decode error. Binary
//! payloads are base64.

pub mod server;

use crate::bridge::FileBridge;
use crate::naming::{DataSourceRef, NamingError, TenantId};
use crate::sandbox::{SandboxError, SandboxManager};
use crate::watchdog::IdleTimers;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

/// Code of a request that could not be decoded.
pub const BAD_REQUEST: &str = "bad_request";

/// Every call the daemon accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    StartSandbox {
        tenant: String,
        data_source: String,
        image: String,
        version: String,
    },
    CreateDataHolder {
        tenant: String,
    },
    StopSandbox {
        tenant: String,
    },
    IsRunning {
        tenant: String,
        /// Also require the container to run this image
        #[serde(default)]
        image: Option<String>,
    },
    GetAddress {
        tenant: String,
    },
    /// Push the tenant's idle deadline out by a full window
    Refresh {
        tenant: String,
    },
    ReadFile {
        tenant: String,
        path: String,
    },
    WriteFile {
        tenant: String,
        path: String,
        /// Base64 content
        data: String,
        #[serde(default)]
        owner_uid: Option<u32>,
    },
    ReadSecret {
        tenant: String,
    },
    WriteSecret {
        tenant: String,
        secret: String,
    },
    Exists {
        tenant: String,
        path: String,
    },
    MakeDir {
        tenant: String,
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    Remove {
        tenant: String,
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    List {
        tenant: String,
        #[serde(default)]
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    Chown {
        tenant: String,
        path: String,
        uid: u32,
        #[serde(default)]
        recursive: bool,
    },
    LargeRead {
        tenant: String,
        source: String,
        staged_target: String,
    },
    LargeWrite {
        tenant: String,
        staged_source: String,
        target: String,
    },
    SetStagingWriteable,
    ContainerEnv {
        tenant: String,
        key: String,
    },
    ContainerLogs {
        tenant: String,
        #[serde(default)]
        tail: Option<usize>,
    },
}

impl Request {
    /// Wire name of the call.
    pub fn method(&self) -> &'static str {
        match self {
            Request::StartSandbox { .. } => "start_sandbox",
            Request::CreateDataHolder { .. } => "create_data_holder",
            Request::StopSandbox { .. } => "stop_sandbox",
            Request::IsRunning { .. } => "is_running",
            Request::GetAddress { .. } => "get_address",
            Request::Refresh { .. } => "refresh",
            Request::ReadFile { .. } => "read_file",
            Request::WriteFile { .. } => "write_file",
            Request::ReadSecret { .. } => "read_secret",
            Request::WriteSecret { .. } => "write_secret",
            Request::Exists { .. } => "exists",
            Request::MakeDir { .. } => "make_dir",
            Request::Remove { .. } => "remove",
            Request::List { .. } => "list",
            Request::Chown { .. } => "chown",
            Request::LargeRead { .. } => "large_read",
            Request::LargeWrite { .. } => "large_write",
            Request::SetStagingWriteable => "set_staging_writeable",
            Request::ContainerEnv { .. } => "container_env",
            Request::ContainerLogs { .. } => "container_logs",
        }
    }
}

/// Error half of a [`Response`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable code
    pub code: String,
    pub message: String,
}

/// Reply to one [`Request`]: `{"ok": …}` or `{"error": {"code", "message"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Ok(Value),
    Error(ErrorBody),
}

impl Response {
    pub fn ok<T: Serialize>(value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => Response::Ok(value),
            Err(e) => Response::error("internal", e.to_string()),
        }
    }

    pub fn error<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        Response::Error(ErrorBody {
            code: code.into(),
            message: message.into(),
        })
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }
}

impl From<SandboxError> for Response {
    fn from(err: SandboxError) -> Self {
        Response::error(err.code(), err.to_string())
    }
}

/// Everything a request needs, shared by all connections.
#[derive(Clone)]
pub struct SandboxService {
    pub manager: Arc<SandboxManager>,
    pub bridge: Arc<FileBridge>,
    pub timers: Arc<IdleTimers>,
}

impl SandboxService {
    pub fn new(manager: Arc<SandboxManager>, bridge: Arc<FileBridge>, timers: Arc<IdleTimers>) -> Self {
        Self {
            manager,
            bridge,
            timers,
        }
    }
}

/// Run one request to completion.
pub async fn dispatch(service: &SandboxService, request: Request) -> Response {
    let method = request.method();
    debug!("Dispatching {}", method);

    match handle(service, request).await {
        Ok(value) => Response::Ok(value),
        Err(DispatchError::Sandbox(e)) => e.into(),
        Err(DispatchError::BadRequest(message)) => Response::error(BAD_REQUEST, message),
    }
}

/// Decode one JSON request and run it.
pub async fn dispatch_json(service: &SandboxService, line: &str) -> Response {
    match serde_json::from_str::<Request>(line) {
        Ok(request) => dispatch(service, request).await,
        Err(e) => Response::error(BAD_REQUEST, format!("invalid request: {e}")),
    }
}

enum DispatchError {
    Sandbox(SandboxError),
    BadRequest(String),
}

impl From<SandboxError> for DispatchError {
    fn from(err: SandboxError) -> Self {
        DispatchError::Sandbox(err)
    }
}

impl From<NamingError> for DispatchError {
    fn from(err: NamingError) -> Self {
        DispatchError::Sandbox(err.into())
    }
}

async fn handle(service: &SandboxService, request: Request) -> Result<Value, DispatchError> {
    let SandboxService {
        manager,
        bridge,
        timers,
    } = service;

    let value = match request {
        Request::StartSandbox {
            tenant,
            data_source,
            image,
            version,
        } => {
            let data_source = DataSourceRef::parse(&data_source)?;
            manager
                .start_sandbox(&tenant_id(&tenant)?, &data_source, &image, &version)
                .await?;
            Value::Null
        }
        Request::CreateDataHolder { tenant } => {
            json!(manager.create_data_holder(&tenant_id(&tenant)?).await?)
        }
        Request::StopSandbox { tenant } => json!(manager.stop_sandbox(&tenant_id(&tenant)?).await?),
        Request::IsRunning { tenant, image } => {
            let tenant = tenant_id(&tenant)?;
            let running = match image {
                Some(image) => manager.is_running_image(&tenant, &image).await?,
                None => manager.is_running(&tenant).await?,
            };
            json!(running)
        }
        Request::GetAddress { tenant } => json!(manager.get_address(&tenant_id(&tenant)?).await?),
        Request::Refresh { tenant } => {
            timers
                .refresh(&tenant_id(&tenant)?, manager.idle_window())
                .await;
            Value::Null
        }
        Request::ReadFile { tenant, path } => {
            let data = bridge.read(&tenant_id(&tenant)?, &path).await?;
            json!(BASE64.encode(data))
        }
        Request::WriteFile {
            tenant,
            path,
            data,
            owner_uid,
        } => {
            let data = BASE64
                .decode(data.as_bytes())
                .map_err(|e| DispatchError::BadRequest(format!("data is not base64: {e}")))?;
            bridge
                .write(&tenant_id(&tenant)?, &path, data, owner_uid)
                .await?;
            Value::Null
        }
        Request::ReadSecret { tenant } => json!(bridge.read_secret(&tenant_id(&tenant)?).await?),
        Request::WriteSecret { tenant, secret } => {
            bridge.write_secret(&tenant_id(&tenant)?, &secret).await?;
            Value::Null
        }
        Request::Exists { tenant, path } => json!(bridge.exists(&tenant_id(&tenant)?, &path).await?),
        Request::MakeDir {
            tenant,
            path,
            recursive,
        } => {
            bridge
                .make_dir(&tenant_id(&tenant)?, &path, recursive)
                .await?;
            Value::Null
        }
        Request::Remove {
            tenant,
            path,
            recursive,
        } => {
            bridge.remove(&tenant_id(&tenant)?, &path, recursive).await?;
            Value::Null
        }
        Request::List {
            tenant,
            path,
            recursive,
        } => json!(bridge.list(&tenant_id(&tenant)?, &path, recursive).await?),
        Request::Chown {
            tenant,
            path,
            uid,
            recursive,
        } => {
            bridge
                .chown(&tenant_id(&tenant)?, &path, uid, recursive)
                .await?;
            Value::Null
        }
        Request::LargeRead {
            tenant,
            source,
            staged_target,
        } => {
            bridge
                .large_read(&tenant_id(&tenant)?, &source, &staged_target)
                .await?;
            Value::Null
        }
        Request::LargeWrite {
            tenant,
            staged_source,
            target,
        } => {
            bridge
                .large_write(&tenant_id(&tenant)?, &staged_source, &target)
                .await?;
            Value::Null
        }
        Request::SetStagingWriteable => {
            bridge.set_staging_writeable().await?;
            Value::Null
        }
        Request::ContainerEnv { tenant, key } => {
            json!(manager.container_env(&tenant_id(&tenant)?, &key).await?)
        }
        Request::ContainerLogs { tenant, tail } => {
            json!(manager.container_logs(&tenant_id(&tenant)?, tail).await?)
        }
    };

    Ok(value)
}

fn tenant_id(raw: &str) -> Result<TenantId, SandboxError> {
    Ok(TenantId::parse(raw)?)
}
