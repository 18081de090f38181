//! Dashboard API server
//!
//! JSON endpoints for supervising frps/frpc, managing instances and
//! directories, and editing config files. A front-end polls `/services`
//! for the status table.

use crate::error::{error_response, json_error_response, ApiErrorCode};
use crate::settings::{SettingsStore, SERVER_ID};
use crate::supervisor::{Supervisor, SupervisorError};
use crate::workspace::{self, Workspace};
use anyhow::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the dashboard
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Request to set the frp binary paths
#[derive(Debug, Deserialize)]
pub struct BinaryPathsRequest {
    #[serde(default)]
    pub frpc_path: String,
    #[serde(default)]
    pub frps_path: String,
}

/// Request to register a client instance
#[derive(Debug, Deserialize)]
pub struct AddInstanceRequest {
    pub id: Option<String>,
    pub config_path: Option<String>,
}

/// Request to rebind an instance's config
#[derive(Debug, Deserialize)]
pub struct SetInstanceConfigRequest {
    pub config_path: String,
}

/// Request to add, create or remove a managed directory
#[derive(Debug, Deserialize)]
pub struct DirRequest {
    pub path: String,
    #[serde(default)]
    pub create: bool,
}

/// Request to create a config file from the client template
#[derive(Debug, Deserialize)]
pub struct CreateFileRequest {
    pub name: String,
}

/// Successful API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// Dashboard API server
pub struct DashboardApi {
    supervisor: Arc<Supervisor>,
    settings: Arc<SettingsStore>,
    auth_token: String,
    shutdown_rx: watch::Receiver<bool>,
}

impl DashboardApi {
    pub fn new(
        supervisor: Arc<Supervisor>,
        settings: Arc<SettingsStore>,
        auth_token: String,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            supervisor,
            settings,
            auth_token,
            shutdown_rx,
        }
    }

    /// Bind `addr` and serve until shutdown
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Dashboard API listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = api.serve_connection(stream, addr).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Dashboard API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S, _addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let api = Arc::clone(&self);
            async move { api.handle_request(req).await }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    fn check_auth(&self, req: &Request<Incoming>) -> bool {
        req.headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(&self.auth_token))
            .unwrap_or(false)
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(%method, %path, "API request");

        // Health and version need no auth
        if method == Method::GET && path == "/health" {
            return Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#));
        }
        if method == Method::GET && path == "/version" {
            let version = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return Ok(json_response(StatusCode::OK, version.to_string()));
        }

        if !self.check_auth(&req) {
            warn!(%path, "Unauthorized API request");
            return Ok(json_error_response(ApiErrorCode::Unauthorized, "unauthorized"));
        }

        let segments = match path_segments(&path) {
            Some(segments) => segments,
            None => {
                return Ok(json_error_response(
                    ApiErrorCode::BadRequest,
                    "Invalid percent-encoding in path",
                ))
            }
        };
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

        let response = match (&method, segments.as_slice()) {
            // Supervision
            (&Method::GET, ["services"]) => self.list_services(),
            (&Method::GET, ["services", id]) => self.service_status(id),
            (&Method::POST, ["services", id, action]) => self.service_action(id, action),

            // Settings and instances
            (&Method::GET, ["settings"]) => self.get_settings(),
            (&Method::PUT, ["settings", "binaries"]) => self.set_binaries(req).await,
            (&Method::POST, ["instances"]) => self.add_instance(req).await,
            (&Method::DELETE, ["instances", id]) => self.remove_instance(id),
            (&Method::PUT, ["instances", id, "config"]) => self.set_instance_config(id, req).await,
            (&Method::DELETE, ["instances", id, "config"]) => self.delete_instance_config(id),

            // Managed directories
            (&Method::GET, ["dirs"]) => self.list_dirs(),
            (&Method::POST, ["dirs"]) => self.add_dir(req).await,
            (&Method::DELETE, ["dirs"]) => self.remove_dir(req).await,

            // Config files in the current directory
            (&Method::GET, ["files"]) => self.list_files(),
            (&Method::POST, ["files"]) => self.create_file(req).await,
            (&Method::GET, ["files", name]) => self.read_file(name),
            (&Method::PUT, ["files", name]) => self.save_file(name, req).await,
            (&Method::DELETE, ["files", name]) => self.delete_file(name),

            // Server config
            (&Method::GET, ["server", "config"]) => self.read_server_config(),
            (&Method::PUT, ["server", "config"]) => self.save_server_config(req).await,

            _ => Ok(json_error_response(ApiErrorCode::NotFound, "Not found")),
        };

        Ok(response.unwrap_or_else(|e| {
            error!(error = %e, "API error");
            json_error_response(ApiErrorCode::InternalError, format!("Internal error: {}", e))
        }))
    }

    // ==================== Supervision ====================

    fn list_services(&self) -> Result<Response<Full<Bytes>>> {
        match self.supervisor.status_all() {
            Ok(statuses) => ok_json(StatusCode::OK, &statuses),
            Err(e) => Ok(error_response(&e)),
        }
    }

    fn service_status(&self, id: &str) -> Result<Response<Full<Bytes>>> {
        match self.supervisor.status(id) {
            Ok(status) => ok_json(StatusCode::OK, &status),
            Err(e) => Ok(error_response(&e)),
        }
    }

    fn service_action(&self, id: &str, action: &str) -> Result<Response<Full<Bytes>>> {
        let result = match action {
            "start" => self.supervisor.start(id),
            "restart" => self.supervisor.restart(id),
            "stop" => self.supervisor.status(id).map(|_| self.supervisor.stop(id)),
            _ => return Ok(json_error_response(ApiErrorCode::NotFound, "Not found")),
        };
        if let Err(e) = result {
            return Ok(error_response(&e));
        }
        info!(id, action, "Service action applied");
        self.service_status(id)
    }

    // ==================== Settings and instances ====================

    fn get_settings(&self) -> Result<Response<Full<Bytes>>> {
        match self.settings.load() {
            Ok(settings) => ok_json(StatusCode::OK, &settings),
            Err(e) => Ok(error_response(&e)),
        }
    }

    async fn set_binaries(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        let request: BinaryPathsRequest = match read_json(req).await? {
            Ok(r) => r,
            Err(response) => return Ok(response),
        };
        if let Err(e) = self.settings.set_binary_paths(&request.frpc_path, &request.frps_path) {
            return Ok(error_response(&e));
        }
        info!(frpc = %request.frpc_path, frps = %request.frps_path, "Binary paths updated");
        self.get_settings()
    }

    async fn add_instance(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        let request: AddInstanceRequest = match read_json(req).await? {
            Ok(r) => r,
            Err(response) => return Ok(response),
        };
        let config = match request.config_path.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => match existing_config(raw) {
                Some(path) => Some(path),
                None => {
                    return Ok(json_error_response(
                        ApiErrorCode::FileNotFound,
                        format!("config file does not exist: {raw}"),
                    ))
                }
            },
            _ => None,
        };

        match self.settings.add_instance(request.id.as_deref(), config.as_deref()) {
            Ok(instance) => ok_json(StatusCode::CREATED, &instance),
            Err(e) => Ok(error_response(&e)),
        }
    }

    fn remove_instance(&self, id: &str) -> Result<Response<Full<Bytes>>> {
        match self.supervisor.remove_instance(id) {
            Ok(()) => ok_json(StatusCode::OK, &serde_json::json!({ "removed": id })),
            Err(e) => Ok(error_response(&e)),
        }
    }

    async fn set_instance_config(&self, id: &str, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        let request: SetInstanceConfigRequest = match read_json(req).await? {
            Ok(r) => r,
            Err(response) => return Ok(response),
        };
        let raw = request.config_path.trim();
        let Some(path) = existing_config(raw) else {
            return Ok(json_error_response(
                ApiErrorCode::FileNotFound,
                format!("config file does not exist: {raw}"),
            ));
        };

        match self.settings.set_instance_config(id, &path.display().to_string()) {
            Ok(true) => {
                info!(id, config = %path.display(), "Instance config rebound");
                self.service_status(id)
            }
            Ok(false) => Ok(error_response(&SupervisorError::UnknownInstance(id.to_string()))),
            Err(e) => Ok(error_response(&e)),
        }
    }

    /// Delete the file bound to an instance, clear the binding and stop the
    /// instance. Only files inside a managed directory may be deleted.
    fn delete_instance_config(&self, id: &str) -> Result<Response<Full<Bytes>>> {
        let settings = match self.settings.load() {
            Ok(s) => s,
            Err(e) => return Ok(error_response(&e)),
        };
        let Some(instance) = settings.find_instance(id) else {
            return Ok(error_response(&SupervisorError::UnknownInstance(id.to_string())));
        };
        if instance.config.is_empty() {
            return Ok(json_error_response(
                ApiErrorCode::BadRequest,
                "instance has no config file",
            ));
        }

        let file = PathBuf::from(&instance.config);
        let deleted = if file.exists() {
            if !workspace::within_managed_dirs(&file, &settings) {
                return Ok(json_error_response(
                    ApiErrorCode::InvalidPath,
                    "only config files inside a managed directory can be deleted",
                ));
            }
            std::fs::remove_file(&file)?;
            info!(id, path = %file.display(), "Instance config deleted");
            true
        } else {
            false
        };

        if let Err(e) = self.settings.set_instance_config(id, "") {
            return Ok(error_response(&e));
        }
        if self.supervisor.status(id).is_ok_and(|s| s.desired) {
            self.supervisor.stop(id);
        }

        ok_json(StatusCode::OK, &serde_json::json!({ "id": id, "deleted": deleted }))
    }

    // ==================== Managed directories ====================

    fn list_dirs(&self) -> Result<Response<Full<Bytes>>> {
        match self.settings.load() {
            Ok(settings) => ok_json(
                StatusCode::OK,
                &serde_json::json!({
                    "managed_dirs": settings.managed_dirs,
                    "current_dir": settings.current_dir,
                }),
            ),
            Err(e) => Ok(error_response(&e)),
        }
    }

    /// Switch to an existing directory, or create one relative to the
    /// current directory, adding it to the managed set either way.
    async fn add_dir(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        let request: DirRequest = match read_json(req).await? {
            Ok(r) => r,
            Err(response) => return Ok(response),
        };

        let dir = if request.create {
            let settings = match self.settings.load() {
                Ok(s) => s,
                Err(e) => return Ok(error_response(&e)),
            };
            let base = match workspace::current_dir(&settings) {
                Ok(base) => base,
                Err(e) => return Ok(error_response(&e)),
            };
            let Some(dir) = workspace::resolve_new_dir(&request.path, &base) else {
                return Ok(json_error_response(ApiErrorCode::InvalidPath, "invalid directory"));
            };
            if dir.exists() {
                return Ok(json_error_response(
                    ApiErrorCode::FileExists,
                    format!("directory already exists: {}", dir.display()),
                ));
            }
            std::fs::create_dir_all(&dir)?;
            info!(dir = %dir.display(), "Directory created");
            dir
        } else {
            match workspace::safe_dir(&request.path) {
                Some(dir) => dir,
                None => {
                    return Ok(json_error_response(ApiErrorCode::InvalidPath, "invalid directory"))
                }
            }
        };

        let dir = dir.display().to_string();
        let result = self.settings.update(|s| {
            if !s.managed_dirs.contains(&dir) {
                s.managed_dirs.push(dir.clone());
            }
            s.current_dir = dir.clone();
        });
        if let Err(e) = result {
            return Ok(error_response(&e));
        }
        self.list_dirs()
    }

    async fn remove_dir(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        let request: DirRequest = match read_json(req).await? {
            Ok(r) => r,
            Err(response) => return Ok(response),
        };
        let root = self.settings.root().display().to_string();
        let result = self.settings.update(|s| {
            s.managed_dirs.retain(|d| *d != request.path);
            if s.managed_dirs.is_empty() {
                s.managed_dirs.push(root);
            }
            if s.current_dir == request.path {
                s.current_dir = s.managed_dirs[0].clone();
            }
        });
        if let Err(e) = result {
            return Ok(error_response(&e));
        }
        self.list_dirs()
    }

    // ==================== Config files ====================

    fn workspace(&self) -> std::result::Result<Workspace, Response<Full<Bytes>>> {
        let settings = self.settings.load().map_err(|e| error_response(&e))?;
        Workspace::from_settings(&settings).map_err(|e| error_response(&e))
    }

    fn list_files(&self) -> Result<Response<Full<Bytes>>> {
        let ws = match self.workspace() {
            Ok(ws) => ws,
            Err(response) => return Ok(response),
        };
        match ws.list_toml_files() {
            Ok(files) => ok_json(
                StatusCode::OK,
                &serde_json::json!({ "dir": ws.dir().display().to_string(), "files": files }),
            ),
            Err(e) => Ok(error_response(&e)),
        }
    }

    async fn create_file(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        let request: CreateFileRequest = match read_json(req).await? {
            Ok(r) => r,
            Err(response) => return Ok(response),
        };
        let ws = match self.workspace() {
            Ok(ws) => ws,
            Err(response) => return Ok(response),
        };
        match ws.create(&request.name) {
            Ok((name, path)) => ok_json(
                StatusCode::CREATED,
                &serde_json::json!({ "name": name, "path": path.display().to_string() }),
            ),
            Err(e) => Ok(error_response(&e)),
        }
    }

    fn read_file(&self, name: &str) -> Result<Response<Full<Bytes>>> {
        let ws = match self.workspace() {
            Ok(ws) => ws,
            Err(response) => return Ok(response),
        };
        match ws.read(name) {
            Ok(content) => ok_json(
                StatusCode::OK,
                &serde_json::json!({ "name": name, "content": content }),
            ),
            Err(e) => Ok(error_response(&e)),
        }
    }

    /// Save the request body verbatim and restart every running instance
    /// bound to the file
    async fn save_file(&self, name: &str, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        let content = match read_text(req).await? {
            Ok(content) => content,
            Err(response) => return Ok(response),
        };
        let ws = match self.workspace() {
            Ok(ws) => ws,
            Err(response) => return Ok(response),
        };
        let path = match ws.save(name, &content) {
            Ok(path) => path,
            Err(e) => return Ok(error_response(&e)),
        };
        match self.supervisor.notify_config_file_saved(&path) {
            Ok(restarted) => ok_json(
                StatusCode::OK,
                &serde_json::json!({ "path": path.display().to_string(), "restarted": restarted }),
            ),
            Err(e) => Ok(error_response(&e)),
        }
    }

    /// Delete a file and clear any instance bindings pointing at it
    fn delete_file(&self, name: &str) -> Result<Response<Full<Bytes>>> {
        let ws = match self.workspace() {
            Ok(ws) => ws,
            Err(response) => return Ok(response),
        };
        let path = match ws.delete(name) {
            Ok(path) => path,
            Err(e) => return Ok(error_response(&e)),
        };
        match self.settings.clear_bindings_to(&path) {
            Ok(cleared) => ok_json(
                StatusCode::OK,
                &serde_json::json!({ "path": path.display().to_string(), "cleared": cleared }),
            ),
            Err(e) => Ok(error_response(&e)),
        }
    }

    // ==================== Server config ====================

    fn read_server_config(&self) -> Result<Response<Full<Bytes>>> {
        let path = self.settings.server_config_path();
        match workspace::read_or_create_server_config(&path) {
            Ok(content) => ok_json(
                StatusCode::OK,
                &serde_json::json!({ "path": path.display().to_string(), "content": content }),
            ),
            Err(e) => Ok(error_response(&e)),
        }
    }

    /// Save the server config, bind it as the server's config and restart
    /// the server if it is meant to be running
    async fn save_server_config(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        let content = match read_text(req).await? {
            Ok(content) => content,
            Err(response) => return Ok(response),
        };
        let path = self.settings.server_config_path();
        std::fs::write(&path, &content)?;
        if let Err(e) = self.settings.set_server_config(&path) {
            return Ok(error_response(&e));
        }
        let restarted = self.supervisor.notify_config_changed(SERVER_ID);
        info!(path = %path.display(), restarted, "Server config saved");
        ok_json(
            StatusCode::OK,
            &serde_json::json!({ "path": path.display().to_string(), "restarted": restarted }),
        )
    }
}

// ==================== Helper Functions ====================

/// Split a request path into percent-decoded segments
fn path_segments(path: &str) -> Option<Vec<String>> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::decode(s).ok().map(|d| d.into_owned()))
        .collect()
}

/// Canonical path of an existing config file
fn existing_config(raw: &str) -> Option<PathBuf> {
    let path = std::fs::canonicalize(workspace::expand_home(raw)).ok()?;
    Path::is_file(&path).then_some(path)
}

async fn read_json<T: DeserializeOwned>(
    req: Request<Incoming>,
) -> Result<std::result::Result<T, Response<Full<Bytes>>>> {
    let body = req.collect().await?.to_bytes();
    Ok(serde_json::from_slice(&body)
        .map_err(|e| json_error_response(ApiErrorCode::BadRequest, format!("Invalid JSON: {}", e))))
}

async fn read_text(req: Request<Incoming>) -> Result<std::result::Result<String, Response<Full<Bytes>>>> {
    let body = req.collect().await?.to_bytes();
    Ok(String::from_utf8(body.to_vec())
        .map_err(|_| json_error_response(ApiErrorCode::BadRequest, "Body must be UTF-8 text")))
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn ok_json<T: Serialize>(status: StatusCode, data: &T) -> Result<Response<Full<Bytes>>> {
    Ok(json_response(status, serde_json::to_string(&ApiResponse::ok(data))?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response() {
        let response = ApiResponse::ok("test".to_string());
        assert!(response.success);
        assert_eq!(response.data, "test");
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"success":true,"data":"test"}"#
        );
    }

    #[test]
    fn test_path_segments() {
        assert_eq!(
            path_segments("/services/office/start").unwrap(),
            vec!["services", "office", "start"]
        );
        assert_eq!(
            path_segments("/files/my%20file.toml").unwrap(),
            vec!["files", "my file.toml"]
        );
        assert_eq!(path_segments("//services/").unwrap(), vec!["services"]);
        assert!(path_segments("/files/%FF").is_none());
    }

    #[test]
    fn test_existing_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("a.toml");
        std::fs::write(&file, "").unwrap();

        assert_eq!(existing_config(&file.display().to_string()), Some(std::fs::canonicalize(&file).unwrap()));
        assert!(existing_config(&dir.path().display().to_string()).is_none());
        assert!(existing_config("/no/such/frpc.toml").is_none());
    }
}
