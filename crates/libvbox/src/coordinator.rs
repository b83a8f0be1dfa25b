//! Box registry and the per-box session task.
//!
//! Every active box is one tokio task owning its workspace cache, terminals,
//! and connected clients. Clients talk to it through a FIFO mailbox, so one
//! request runs to completion before the next one of the same box starts.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vbox_protocol::{
    BoxId, ClientRequest, ConnectionId, ErrorCode, Handshake, PresenceEntry, Response, Role,
    ServerEvent,
};

use crate::error::{OWNER_ABSENT_MESSAGE, VboxError};
use crate::gateway::{Client, SessionGateway};
use crate::identity::IdentityService;
use crate::rate_limit::{BucketConfig, OperationKind, RateLimiter, default_limits};
use crate::store::ObjectStore;
use crate::suggest::{SuggestionRequest, SuggestionService};
use crate::terminal::{
    DEFAULT_MAX_TERMINALS, ShellCommand, ShellLauncher, TerminalEvent, TerminalMultiplexer,
};
use crate::workspace::{DEFAULT_MAX_SAVE_BYTES, WorkspaceCache, WorkspaceOptions, validate_name};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub max_terminals: usize,
    /// How long a box with no clients keeps its state.
    pub idle_timeout: Duration,
    pub max_save_bytes: usize,
    pub workspace: WorkspaceOptions,
    pub shell: ShellCommand,
    pub rate_limits: HashMap<OperationKind, BucketConfig>,
    /// Events buffered per client. Terminal output beyond this is dropped
    /// for that client; the last eighth is kept for tree and session events.
    pub outbound_queue: usize,
    pub mailbox_capacity: usize,
    pub limiter_sweep: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_terminals: DEFAULT_MAX_TERMINALS,
            idle_timeout: Duration::from_secs(15),
            max_save_bytes: DEFAULT_MAX_SAVE_BYTES,
            workspace: WorkspaceOptions::default(),
            shell: ShellCommand::default(),
            rate_limits: default_limits(),
            outbound_queue: 1024,
            mailbox_capacity: 256,
            limiter_sweep: Duration::from_secs(60),
        }
    }
}

/// External services the coordinator depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ObjectStore>,
    pub identity: Arc<dyn IdentityService>,
    /// `None` disables `generateCode`.
    pub suggestions: Option<Arc<dyn SuggestionService>>,
    pub launcher: Arc<dyn ShellLauncher>,
}

enum BoxCommand {
    Join {
        client: Client,
        outbound: mpsc::Sender<ServerEvent>,
        reply: oneshot::Sender<Result<(), VboxError>>,
    },
    Leave {
        connection_id: ConnectionId,
    },
    Request {
        connection_id: ConnectionId,
        request: ClientRequest,
        reply: oneshot::Sender<Response>,
    },
    Shutdown,
}

#[derive(Clone)]
struct BoxHandle {
    generation: u64,
    mailbox: mpsc::Sender<BoxCommand>,
}

struct Shared {
    config: CoordinatorConfig,
    gateway: SessionGateway,
    collaborators: Collaborators,
    limiter: Arc<RateLimiter>,
    boxes: Mutex<HashMap<BoxId, BoxHandle>>,
    next_generation: AtomicU64,
}

/// Owns the registry of active boxes.
#[derive(Clone)]
pub struct LifecycleCoordinator {
    shared: Arc<Shared>,
}

/// A client joined to its box session.
pub struct ClientConnection {
    pub client: Client,
    /// Events pushed by the box. Closed when the box drops this client.
    pub events: mpsc::Receiver<ServerEvent>,
    pub handle: ClientHandle,
}

/// Sends one connection's requests into its box mailbox.
#[derive(Clone)]
pub struct ClientHandle {
    connection_id: ConnectionId,
    box_id: BoxId,
    mailbox: mpsc::Sender<BoxCommand>,
}

impl ClientHandle {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Queue `request` behind everything this box already received. The
    /// receiver resolves once the box has handled it.
    pub async fn submit(
        &self,
        request: ClientRequest,
    ) -> Result<oneshot::Receiver<Response>, VboxError> {
        let (reply, rx) = oneshot::channel();
        self.mailbox
            .send(BoxCommand::Request {
                connection_id: self.connection_id.clone(),
                request,
                reply,
            })
            .await
            .map_err(|_| VboxError::SessionClosed(self.box_id.clone()))?;
        Ok(rx)
    }

    pub async fn request(&self, request: ClientRequest) -> Response {
        let outcome = match self.submit(request).await {
            Ok(rx) => rx
                .await
                .map_err(|_| VboxError::SessionClosed(self.box_id.clone())),
            Err(e) => Err(e),
        };
        outcome.unwrap_or_else(|e| {
            let (code, message) = e.to_error_code();
            Response::error(code, message)
        })
    }

    pub async fn disconnect(&self) {
        let leave = BoxCommand::Leave {
            connection_id: self.connection_id.clone(),
        };
        if self.mailbox.send(leave).await.is_err() {
            debug!(connection_id = %self.connection_id, "box already gone on disconnect");
        }
    }
}

impl LifecycleCoordinator {
    /// Must be called inside a tokio runtime: starts the limiter sweep task.
    pub fn new(config: CoordinatorConfig, collaborators: Collaborators) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limits.clone()));
        spawn_limiter_sweep(Arc::downgrade(&limiter), config.limiter_sweep);
        Self {
            shared: Arc::new(Shared {
                gateway: SessionGateway::new(collaborators.identity.clone()),
                config,
                collaborators,
                limiter,
                boxes: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.shared.limiter
    }

    /// Validate a handshake without touching any box.
    pub async fn admit(&self, handshake: &Handshake) -> Result<Client, VboxError> {
        self.shared.gateway.admit(handshake).await
    }

    pub async fn connect(&self, handshake: &Handshake) -> Result<ClientConnection, VboxError> {
        let client = self.admit(handshake).await?;
        self.join(client).await
    }

    /// Attach an admitted client to its box, starting the box if needed.
    pub async fn join(&self, client: Client) -> Result<ClientConnection, VboxError> {
        let (outbound, events) = mpsc::channel(self.shared.config.outbound_queue.max(1));
        // A box releasing concurrently drops queued joins; the retry lands on a fresh box.
        for _ in 0..2 {
            let handle = self.box_handle(&client.box_id).await;
            let (reply, joined) = oneshot::channel();
            let join = BoxCommand::Join {
                client: client.clone(),
                outbound: outbound.clone(),
                reply,
            };
            if handle.mailbox.send(join).await.is_err() {
                self.forget(&client.box_id, handle.generation).await;
                continue;
            }
            match joined.await {
                Ok(result) => {
                    result?;
                    return Ok(ClientConnection {
                        handle: ClientHandle {
                            connection_id: client.connection_id.clone(),
                            box_id: client.box_id.clone(),
                            mailbox: handle.mailbox,
                        },
                        client,
                        events,
                    });
                }
                Err(_) => self.forget(&client.box_id, handle.generation).await,
            }
        }
        Err(VboxError::SessionClosed(client.box_id))
    }

    /// Ids of boxes with a running session.
    pub async fn active_boxes(&self) -> Vec<BoxId> {
        let mut ids: Vec<BoxId> = self.shared.boxes.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Release every box. Connected clients see their event stream end.
    pub async fn shutdown(&self) {
        let handles: Vec<(BoxId, BoxHandle)> = self.shared.boxes.lock().await.drain().collect();
        for (box_id, handle) in handles {
            if handle.mailbox.send(BoxCommand::Shutdown).await.is_err() {
                debug!(box_id = %box_id, "box already stopped");
            }
        }
    }

    async fn box_handle(&self, box_id: &str) -> BoxHandle {
        let mut boxes = self.shared.boxes.lock().await;
        if let Some(handle) = boxes.get(box_id) {
            return handle.clone();
        }
        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (mailbox, commands) = mpsc::channel(self.shared.config.mailbox_capacity.max(1));
        let (terminal_tx, terminal_events) = mpsc::unbounded_channel();
        let config = &self.shared.config;
        let actor = BoxActor {
            box_id: box_id.to_string(),
            generation,
            shared: self.shared.clone(),
            commands,
            terminal_events,
            members: Vec::new(),
            workspace: None,
            terminals: TerminalMultiplexer::new(
                self.shared.collaborators.launcher.clone(),
                config.shell.clone(),
                config.max_terminals,
                terminal_tx,
            ),
            idle_deadline: None,
            evicted: Vec::new(),
        };
        tokio::spawn(actor.run());
        let handle = BoxHandle {
            generation,
            mailbox,
        };
        boxes.insert(box_id.to_string(), handle.clone());
        handle
    }

    async fn forget(&self, box_id: &str, generation: u64) {
        unregister(&self.shared, box_id, generation).await;
    }
}

async fn unregister(shared: &Shared, box_id: &str, generation: u64) {
    let mut boxes = shared.boxes.lock().await;
    if boxes.get(box_id).is_some_and(|h| h.generation == generation) {
        boxes.remove(box_id);
    }
}

fn spawn_limiter_sweep(limiter: std::sync::Weak<RateLimiter>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every.max(Duration::from_millis(10)));
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(limiter) = limiter.upgrade() else {
                break;
            };
            let removed = limiter.cleanup();
            if removed > 0 {
                debug!(removed, "swept rate-limit buckets");
            }
        }
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Enabled,
    Disabled,
}

struct Member {
    client: Client,
    access: Access,
    outbound: mpsc::Sender<ServerEvent>,
    /// Events dropped since the client last kept up.
    lagged: u64,
    /// A tree or session event was dropped; resend the tree once there is room.
    stale: bool,
}

/// State of one active box.
struct BoxActor {
    box_id: BoxId,
    generation: u64,
    shared: Arc<Shared>,
    commands: mpsc::Receiver<BoxCommand>,
    terminal_events: mpsc::UnboundedReceiver<TerminalEvent>,
    members: Vec<Member>,
    workspace: Option<WorkspaceCache>,
    terminals: TerminalMultiplexer,
    idle_deadline: Option<Instant>,
    evicted: Vec<ConnectionId>,
}

async fn idle_expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl BoxActor {
    async fn run(mut self) {
        debug!(box_id = %self.box_id, generation = self.generation, "box session started");
        loop {
            let deadline = self.idle_deadline;
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(BoxCommand::Shutdown) | None => break,
                    Some(command) => self.handle(command).await,
                },
                Some(event) = self.terminal_events.recv() => self.route_terminal(event),
                _ = idle_expired(deadline) => {
                    info!(box_id = %self.box_id, "box idle, releasing");
                    break;
                }
            }
            self.flush_evictions();
        }
        self.release().await;
    }

    async fn handle(&mut self, command: BoxCommand) {
        match command {
            BoxCommand::Join {
                client,
                outbound,
                reply,
            } => {
                let result = self.join(client, outbound).await;
                let _ = reply.send(result);
            }
            BoxCommand::Leave { connection_id } => self.leave(&connection_id),
            BoxCommand::Request {
                connection_id,
                request,
                reply,
            } => self.request(connection_id, request, reply).await,
            BoxCommand::Shutdown => {}
        }
    }

    async fn join(
        &mut self,
        client: Client,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> Result<(), VboxError> {
        if self.workspace.is_none() {
            let loaded = WorkspaceCache::load(
                &self.box_id,
                self.shared.collaborators.store.clone(),
                self.shared.config.workspace.clone(),
            )
            .await;
            match loaded {
                Ok(workspace) => {
                    if let Some(dir) = workspace.working_dir() {
                        self.terminals.set_working_dir(dir);
                    }
                    self.workspace = Some(workspace);
                }
                Err(e) => {
                    warn!(box_id = %self.box_id, "workspace load failed: {e}");
                    if self.members.is_empty() {
                        self.arm_idle_timer();
                    }
                    return Err(e);
                }
            }
        }
        self.idle_deadline = None;

        let owner_present = self.owner_present();
        let is_owner = client.role == Role::Owner;
        let connection_id = client.connection_id.clone();
        let access = if is_owner || owner_present {
            Access::Enabled
        } else {
            Access::Disabled
        };
        info!(
            box_id = %self.box_id,
            connection_id = %connection_id,
            user_id = %client.user_id,
            role = ?client.role,
            ?access,
            "client joined"
        );
        self.members.push(Member {
            client,
            access,
            outbound,
            lagged: 0,
            stale: false,
        });

        match access {
            Access::Enabled => self.grant(&connection_id),
            Access::Disabled => self.send(
                &connection_id,
                ServerEvent::DisableAccess {
                    message: OWNER_ABSENT_MESSAGE.to_string(),
                },
            ),
        }
        if is_owner && !owner_present {
            let waiting: Vec<ConnectionId> = self
                .members
                .iter()
                .filter(|m| m.access == Access::Disabled)
                .map(|m| m.client.connection_id.clone())
                .collect();
            for id in waiting {
                self.grant(&id);
            }
        }
        self.broadcast_presence();
        Ok(())
    }

    /// Enable a member and hand it the current tree and terminal output.
    fn grant(&mut self, connection_id: &str) {
        if let Some(member) = self.member_mut(connection_id) {
            member.access = Access::Enabled;
        }
        self.terminals.subscribe_all(connection_id);
        let files = self
            .workspace
            .as_ref()
            .map(|w| w.files().to_vec())
            .unwrap_or_default();
        self.send(connection_id, ServerEvent::Loaded { files });
    }

    fn leave(&mut self, connection_id: &str) {
        let Some(pos) = self
            .members
            .iter()
            .position(|m| m.client.connection_id == connection_id)
        else {
            return;
        };
        let member = self.members.remove(pos);
        self.terminals.unsubscribe_all(connection_id);
        info!(
            box_id = %self.box_id,
            connection_id,
            user_id = %member.client.user_id,
            "client left"
        );

        if member.client.role == Role::Owner && !self.owner_present() {
            let closed = self.terminals.close_all();
            info!(box_id = %self.box_id, closed, "owner disconnected");
            let remaining: Vec<ConnectionId> = self
                .members
                .iter()
                .map(|m| m.client.connection_id.clone())
                .collect();
            for id in remaining {
                if let Some(member) = self.member_mut(&id) {
                    member.access = Access::Disabled;
                }
                self.send(&id, ServerEvent::OwnerDisconnected);
            }
        }

        if self.members.is_empty() {
            self.arm_idle_timer();
        } else {
            self.broadcast_presence();
        }
    }

    async fn request(
        &mut self,
        connection_id: ConnectionId,
        request: ClientRequest,
        reply: oneshot::Sender<Response>,
    ) {
        let Some(member) = self.member(&connection_id) else {
            let _ = reply.send(Response::error(
                ErrorCode::AccessDenied,
                "connection is not joined to this box",
            ));
            return;
        };
        if member.access == Access::Disabled {
            let _ = reply.send(Response::error(ErrorCode::AccessDenied, OWNER_ABSENT_MESSAGE));
            return;
        }
        let user_id = member.client.user_id.clone();
        let name = request.name();

        let request = match request {
            ClientRequest::GenerateCode {
                file_name,
                code,
                line,
                instructions,
            } => {
                let suggestion = SuggestionRequest {
                    file_name,
                    code,
                    line,
                    instructions,
                };
                self.spawn_generation(user_id, suggestion, reply);
                return;
            }
            other => other,
        };

        let response = match self.dispatch(&connection_id, &user_id, request).await {
            Ok(data) => Response::ok(data),
            Err(err) => {
                if let Some(message) = err.rate_limit_notice() {
                    self.send(&connection_id, ServerEvent::RateLimit { message });
                }
                debug!(box_id = %self.box_id, connection_id, request = name, "request failed: {err}");
                let (code, message) = err.to_error_code();
                Response::error(code, message)
            }
        };
        let _ = reply.send(response);
    }

    async fn dispatch(
        &mut self,
        connection_id: &str,
        user_id: &str,
        request: ClientRequest,
    ) -> Result<Option<Value>, VboxError> {
        match request {
            ClientRequest::GetFile { file_id } => {
                let body = self.workspace()?.get_file(&file_id).await?;
                Ok(Some(Value::String(body)))
            }
            ClientRequest::GetFolder { folder_id } => {
                let ids = self.workspace()?.folder_files(&folder_id).await?;
                Ok(Some(json!(ids)))
            }
            ClientRequest::SaveFile { file_id, body } => {
                let limit = self.shared.config.max_save_bytes;
                if body.len() > limit {
                    return Err(VboxError::BodyTooLarge {
                        size: body.len(),
                        limit,
                    });
                }
                self.shared
                    .limiter
                    .consume(user_id, OperationKind::SaveFile, 1)?;
                self.workspace()?.save_file(&file_id, body).await?;
                Ok(None)
            }
            ClientRequest::CreateFile { name } => {
                validate_name(&name)?;
                self.shared
                    .limiter
                    .consume(user_id, OperationKind::CreateFile, 1)?;
                self.workspace()?.create_file(&name).await?;
                Ok(Some(self.files_changed(connection_id)))
            }
            ClientRequest::CreateFolder { name } => {
                validate_name(&name)?;
                self.shared
                    .limiter
                    .consume(user_id, OperationKind::CreateFolder, 1)?;
                self.workspace()?.create_folder(&name).await?;
                Ok(Some(self.files_changed(connection_id)))
            }
            ClientRequest::RenameFile { file_id, new_name } => {
                validate_name(&new_name)?;
                self.shared
                    .limiter
                    .consume(user_id, OperationKind::RenameFile, 1)?;
                let new_id = self.workspace()?.rename_file(&file_id, &new_name).await?;
                Ok(Some(self.file_relocated(connection_id, file_id, new_id)))
            }
            ClientRequest::MoveFile { file_id, folder_id } => {
                self.workspace()?.check_move(&file_id, &folder_id)?;
                self.shared
                    .limiter
                    .consume(user_id, OperationKind::RenameFile, 1)?;
                let new_id = self.workspace()?.move_file(&file_id, &folder_id).await?;
                Ok(Some(self.file_relocated(connection_id, file_id, new_id)))
            }
            ClientRequest::DeleteFile { file_id } => {
                self.shared
                    .limiter
                    .consume(user_id, OperationKind::DeleteFile, 1)?;
                self.workspace()?.delete_file(&file_id).await?;
                Ok(Some(self.files_changed(connection_id)))
            }
            ClientRequest::DeleteFolder { folder_id } => {
                self.shared
                    .limiter
                    .consume(user_id, OperationKind::DeleteFolder, 1)?;
                let ids = self.workspace()?.prepare_folder_delete(&folder_id).await?;
                self.broadcast(None, ServerEvent::DeletePending { ids: ids.clone() });
                let outcome = self
                    .workspace()?
                    .finish_folder_delete(&folder_id, ids)
                    .await;
                let files = self.files_changed(connection_id);
                outcome.map(|()| Some(files))
            }
            ClientRequest::CreateTerminal { id } => {
                let subscribers: Vec<ConnectionId> = self
                    .members
                    .iter()
                    .filter(|m| m.access == Access::Enabled)
                    .map(|m| m.client.connection_id.clone())
                    .collect();
                self.terminals.create(&id, subscribers)?;
                Ok(None)
            }
            ClientRequest::CloseTerminal { id } => {
                self.terminals.close(&id)?;
                Ok(None)
            }
            ClientRequest::TerminalData { id, data } => {
                self.terminals.write(&id, data.as_bytes());
                Ok(None)
            }
            ClientRequest::ResizeTerminal { id, cols, rows } => {
                if cols == 0 || rows == 0 {
                    return Err(VboxError::InvalidRequest(format!(
                        "invalid terminal size {cols}x{rows}"
                    )));
                }
                match id {
                    Some(id) => self.terminals.resize(&id, cols, rows)?,
                    None => {
                        self.terminals.resize_all(cols, rows);
                    }
                }
                Ok(None)
            }
            ClientRequest::GenerateCode { .. } => Err(VboxError::InvalidRequest(
                "generateCode is not handled on the box task".into(),
            )),
        }
    }

    fn spawn_generation(
        &self,
        user_id: String,
        request: SuggestionRequest,
        reply: oneshot::Sender<Response>,
    ) {
        let suggestions = self.shared.collaborators.suggestions.clone();
        let identity = self.shared.collaborators.identity.clone();
        let box_id = self.box_id.clone();
        tokio::spawn(async move {
            let response = match suggestions {
                None => Response::error(
                    ErrorCode::UpstreamUnavailable,
                    "code generation is not configured",
                ),
                Some(service) => {
                    let (suggestion, recorded) = tokio::join!(
                        service.suggest(&request),
                        identity.record_generation(&user_id)
                    );
                    if let Err(e) = recorded {
                        warn!(box_id = %box_id, user_id = %user_id, "generation report failed: {e}");
                    }
                    match suggestion {
                        Ok(code) => {
                            info!(box_id = %box_id, user_id = %user_id, file = %request.file_name, "code generated");
                            Response::ok(Some(Value::String(code)))
                        }
                        Err(e) => {
                            warn!(box_id = %box_id, "code generation failed: {e}");
                            let (code, message) = e.to_error_code();
                            Response::error(code, message)
                        }
                    }
                }
            };
            let _ = reply.send(response);
        });
    }

    fn route_terminal(&mut self, event: TerminalEvent) {
        if let Some((recipients, wire)) = self.terminals.route(event) {
            for recipient in recipients {
                self.send(&recipient, wire.clone());
            }
        }
    }

    /// Tell every other enabled member about a rename, then about the new tree.
    fn file_relocated(&mut self, connection_id: &str, old_id: String, new_id: String) -> Value {
        if old_id != new_id {
            self.broadcast(
                Some(connection_id),
                ServerEvent::FileRenamed {
                    old_id,
                    new_id: new_id.clone(),
                },
            );
        }
        let files = self.files_changed(connection_id);
        json!({ "id": new_id, "files": files })
    }

    /// Push the current tree to every other enabled member and return it.
    fn files_changed(&mut self, connection_id: &str) -> Value {
        let files = self
            .workspace
            .as_ref()
            .map(|w| w.files().to_vec())
            .unwrap_or_default();
        let value = json!(files);
        self.broadcast(Some(connection_id), ServerEvent::FilesChanged { files });
        value
    }

    /// Send to every enabled member except `except`.
    fn broadcast(&mut self, except: Option<&str>, event: ServerEvent) {
        let targets: Vec<ConnectionId> = self
            .members
            .iter()
            .filter(|m| m.access == Access::Enabled)
            .map(|m| m.client.connection_id.clone())
            .filter(|id| Some(id.as_str()) != except)
            .collect();
        for id in targets {
            self.send(&id, event.clone());
        }
    }

    fn broadcast_presence(&mut self) {
        let users: Vec<PresenceEntry> = self
            .members
            .iter()
            .map(|m| PresenceEntry {
                user_id: m.client.user_id.clone(),
                role: m.client.role,
            })
            .collect();
        let targets: Vec<ConnectionId> = self
            .members
            .iter()
            .map(|m| m.client.connection_id.clone())
            .collect();
        for id in targets {
            self.send(
                &id,
                ServerEvent::Presence {
                    users: users.clone(),
                },
            );
        }
    }

    /// Queue an event for one member.
    ///
    /// A slow client loses events instead of its membership: terminal output
    /// stops once the queue is down to its reserve, and a dropped tree or
    /// session event is replaced by a fresh tree when room frees up. Only a
    /// closed queue drops the member.
    fn send(&mut self, connection_id: &str, event: ServerEvent) {
        let Some(member) = self
            .members
            .iter_mut()
            .find(|m| m.client.connection_id == connection_id)
        else {
            return;
        };
        let is_output = matches!(event, ServerEvent::TerminalResponse { .. });
        let reserve = self.shared.config.outbound_queue / 8;
        if is_output && member.outbound.capacity() <= reserve {
            if member.lagged == 0 {
                warn!(box_id = %self.box_id, connection_id, "client lagging, dropping terminal output");
            }
            member.lagged += 1;
            return;
        }
        if member.stale && member.outbound.capacity() > 1 {
            let resync = match member.access {
                Access::Enabled => ServerEvent::FilesChanged {
                    files: self
                        .workspace
                        .as_ref()
                        .map(|w| w.files().to_vec())
                        .unwrap_or_default(),
                },
                Access::Disabled => ServerEvent::DisableAccess {
                    message: OWNER_ABSENT_MESSAGE.to_string(),
                },
            };
            if member.outbound.try_send(resync).is_ok() {
                member.stale = false;
            }
        }
        match member.outbound.try_send(event) {
            Ok(()) => {
                if member.lagged > 0 {
                    info!(box_id = %self.box_id, connection_id, dropped = member.lagged, "client caught up");
                    member.lagged = 0;
                }
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                if member.lagged == 0 {
                    warn!(box_id = %self.box_id, connection_id, "outbound queue full, dropping events");
                }
                member.lagged += 1;
                member.stale |= !is_output;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.evicted.push(connection_id.to_string());
            }
        }
    }

    fn flush_evictions(&mut self) {
        while let Some(connection_id) = self.evicted.pop() {
            self.leave(&connection_id);
        }
    }

    fn arm_idle_timer(&mut self) {
        let timeout = self.shared.config.idle_timeout;
        debug!(box_id = %self.box_id, ?timeout, "box idle timer armed");
        self.idle_deadline = Some(Instant::now() + timeout);
    }

    fn owner_present(&self) -> bool {
        self.members.iter().any(|m| m.client.role == Role::Owner)
    }

    fn member(&self, connection_id: &str) -> Option<&Member> {
        self.members
            .iter()
            .find(|m| m.client.connection_id == connection_id)
    }

    fn member_mut(&mut self, connection_id: &str) -> Option<&mut Member> {
        self.members
            .iter_mut()
            .find(|m| m.client.connection_id == connection_id)
    }

    fn workspace(&mut self) -> Result<&mut WorkspaceCache, VboxError> {
        self.workspace
            .as_mut()
            .ok_or_else(|| VboxError::SessionClosed(self.box_id.clone()))
    }

    async fn release(mut self) {
        unregister(&self.shared, &self.box_id, self.generation).await;
        // Joins that raced the release are dropped unanswered and retried by
        // the coordinator on a fresh box.
        self.commands.close();
        while self.commands.try_recv().is_ok() {}

        let closed = self.terminals.close_all();
        self.members.clear();
        if let Some(workspace) = self.workspace.take() {
            workspace.release().await;
        }
        info!(box_id = %self.box_id, terminals = closed, "box session released");
    }
}
