//! Feed supervisor
//!
//! Each feed runs as a single task that owns its grant, transcoder process
//! and bridge session. Every operation goes through that task, so fetches,
//! spawns and extensions for one feed never overlap.

use super::policy::{ExitAction, RetryPolicy};
use super::state::{FeedEvent, FeedSnapshot, FeedStatus, Transport};
use crate::bridge::{BridgeSession, CaptureBridge};
use crate::config::SupervisorSettings;
use crate::grant::{Grant, GrantError, GrantExtension, GrantProvider};
use crate::mount::MountRegistry;
use crate::transcoder::{ProcessExit, TranscodeError, TranscodeJob, TranscodeSource, Transcoder, TranscoderProcess};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{timeout, Instant};

/// Lifetime given to capture-bridge grants, which have no upstream expiry
pub const BRIDGE_GRANT_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Collaborators shared by every supervisor
#[derive(Clone)]
pub struct SupervisorDeps {
    pub grants: Arc<dyn GrantProvider>,
    pub transcoder: Arc<dyn Transcoder>,
    /// `None` disables the fallback transport
    pub bridge: Option<Arc<dyn CaptureBridge>>,
    pub mounts: Arc<dyn MountRegistry>,
    pub events: broadcast::Sender<FeedEvent>,
    pub settings: SupervisorSettings,
    /// How long a stopping transcoder gets before it is killed
    pub stop_grace: Duration,
}

enum Request {
    Start(oneshot::Sender<FeedStatus>),
    Restart(oneshot::Sender<FeedStatus>),
    Extend(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

/// Handle to one supervised feed
#[derive(Clone)]
pub struct FeedSupervisor {
    id: String,
    requests: mpsc::Sender<Request>,
    snapshot: watch::Receiver<FeedSnapshot>,
    stop_signal: Arc<watch::Sender<bool>>,
}

impl FeedSupervisor {
    /// Spawn the supervisor task. The feed stays idle until [`start`](Self::start).
    pub fn spawn(id: impl Into<String>, path: impl Into<String>, deps: SupervisorDeps) -> Self {
        let (handle, actor) = Self::with_actor(id.into(), path.into(), deps);
        tokio::spawn(actor.run());
        handle
    }

    fn with_actor(id: String, path: String, deps: SupervisorDeps) -> (Self, FeedActor) {
        let (requests_tx, requests_rx) = mpsc::channel(16);
        let (snapshot_tx, snapshot_rx) = watch::channel(FeedSnapshot::new(id.clone(), path.clone()));
        let (stop_tx, stop_rx) = watch::channel(false);

        let actor = FeedActor {
            id: id.clone(),
            path,
            policy: RetryPolicy::from(&deps.settings),
            deps,
            requests: requests_rx,
            snapshot: snapshot_tx,
            stop: stop_rx,
            status: FeedStatus::Initializing,
            transport: None,
            grant: None,
            process: None,
            bridge: None,
            bridge_alive: None,
            retry_count: 0,
            retry_at: None,
            mount_reserved: false,
            waiters: Vec::new(),
        };
        let handle = Self {
            id,
            requests: requests_tx,
            snapshot: snapshot_rx,
            stop_signal: Arc::new(stop_tx),
        };
        (handle, actor)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> FeedStatus {
        self.snapshot.borrow().status
    }

    /// Watch every snapshot change
    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot> {
        self.snapshot.clone()
    }

    /// Start supervising. Resolves once the first pass settles: streaming,
    /// a terminal status, a scheduled grant retry, or a stop.
    pub async fn start(&self) -> FeedStatus {
        self.stop_signal.send_replace(false);
        let (tx, rx) = oneshot::channel();
        self.call(Request::Start(tx), rx).await
    }

    /// Stop then start again under the same id
    pub async fn restart(&self) -> FeedStatus {
        self.stop_signal.send_replace(false);
        let (tx, rx) = oneshot::channel();
        self.call(Request::Restart(tx), rx).await
    }

    /// Extend the current grant; any failure restarts the feed
    pub async fn extend(&self) {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(Request::Extend(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop the feed and release its resources. Idempotent.
    pub async fn stop(&self) {
        // Seen by the task before the request, so an in-flight upstream call
        // is abandoned instead of finishing first.
        self.stop_signal.send_replace(true);
        let (tx, rx) = oneshot::channel();
        if self.requests.send(Request::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn call(&self, request: Request, rx: oneshot::Receiver<FeedStatus>) -> FeedStatus {
        if self.requests.send(request).await.is_err() {
            return self.status();
        }
        rx.await.unwrap_or(FeedStatus::Stopping)
    }
}

struct RunningProcess {
    handle: Box<dyn TranscoderProcess>,
    started: Instant,
}

enum Event {
    Request(Request),
    Exited(Result<ProcessExit, TranscodeError>),
    RetryDue,
    BridgeLost,
}

struct FeedActor {
    id: String,
    path: String,
    deps: SupervisorDeps,
    policy: RetryPolicy,
    requests: mpsc::Receiver<Request>,
    snapshot: watch::Sender<FeedSnapshot>,
    stop: watch::Receiver<bool>,

    status: FeedStatus,
    transport: Option<Transport>,
    grant: Option<Grant>,
    process: Option<RunningProcess>,
    bridge: Option<Box<dyn BridgeSession>>,
    bridge_alive: Option<watch::Receiver<bool>>,
    retry_count: u32,
    retry_at: Option<Instant>,
    mount_reserved: bool,
    waiters: Vec<oneshot::Sender<FeedStatus>>,
}

impl FeedActor {
    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => Event::Request(request),
                    None => break,
                },
                exit = wait_for_exit(&mut self.process) => Event::Exited(exit),
                _ = sleep_until(self.retry_at) => Event::RetryDue,
                _ = bridge_lost(&mut self.bridge_alive) => Event::BridgeLost,
            };

            match event {
                Event::Request(Request::Start(ack)) => self.on_start(ack).await,
                Event::Request(Request::Restart(ack)) => self.on_restart(ack).await,
                Event::Request(Request::Extend(ack)) => {
                    self.on_extend().await;
                    let _ = ack.send(());
                }
                Event::Request(Request::Stop(ack)) => {
                    self.on_stop().await;
                    let _ = ack.send(());
                }
                Event::Exited(exit) => self.on_exit(exit).await,
                Event::RetryDue => self.fetch_and_spawn().await,
                Event::BridgeLost => self.on_bridge_lost().await,
            }
        }

        // Every handle is gone
        self.teardown().await;
        tracing::debug!("Supervisor for {} exited", self.id);
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Anything in flight: a live process or a scheduled fetch
    fn is_active(&self) -> bool {
        self.process.is_some() || self.retry_at.is_some()
    }

    async fn on_start(&mut self, ack: oneshot::Sender<FeedStatus>) {
        if self.is_active() {
            tracing::debug!("Feed {} already running", self.id);
            self.waiters.push(ack);
            self.resolve_waiters();
            return;
        }
        self.waiters.push(ack);
        // A settled earlier pass may still hold a grant and the mount
        self.teardown().await;
        self.retry_count = 0;
        self.begin().await;
    }

    async fn on_restart(&mut self, ack: oneshot::Sender<FeedStatus>) {
        tracing::info!("Restarting feed {}", self.id);
        self.waiters.push(ack);
        self.set_status(FeedStatus::Restarting);
        self.teardown().await;
        self.retry_count = 0;
        self.begin().await;
    }

    async fn on_stop(&mut self) {
        self.set_status(FeedStatus::Stopping);
        self.teardown().await;
        tracing::info!("Feed {} stopped", self.id);
    }

    /// Capability query, transport choice, first fetch
    async fn begin(&mut self) {
        self.set_status(FeedStatus::Initializing);

        let grants = self.deps.grants.clone();
        let id = self.id.clone();
        let query = async move { grants.capabilities(&id).await };
        let Some(capabilities) = until_stopped(self.stop.clone(), query).await else {
            return;
        };

        let capabilities = match capabilities {
            Ok(capabilities) => capabilities,
            Err(e) => {
                tracing::warn!("Capability query for {} failed: {}", self.id, e);
                self.set_status(FeedStatus::Failed);
                return;
            }
        };

        let fallback = capabilities.supports_fallback && self.deps.bridge.is_some();
        let transport = if capabilities.supports_primary {
            Transport::Primary
        } else if fallback {
            Transport::Bridged
        } else {
            tracing::warn!("Feed {} supports no usable stream transport", self.id);
            self.set_status(FeedStatus::Unsupported);
            return;
        };

        // Only a feed that can actually stream holds its mount path
        if !self.mount_reserved {
            if let Err(e) = self.deps.mounts.reserve(&self.path) {
                tracing::error!("Feed {} cannot publish: {}", self.id, e);
                self.set_status(FeedStatus::Failed);
                return;
            }
            self.mount_reserved = true;
        }

        tracing::info!("Feed {} will stream over {}", self.id, transport.label());
        self.transport = Some(transport);
        self.fetch_and_spawn().await;
    }

    async fn fetch_and_spawn(&mut self) {
        self.retry_at = None;
        let Some(transport) = self.transport else {
            return;
        };
        if self.stopped() {
            return;
        }

        self.set_status(FeedStatus::FetchingGrant(transport));
        let fetched = match transport {
            Transport::Primary => {
                let fetch = fetch_primary(self.deps.grants.clone(), self.id.clone());
                until_stopped(self.stop.clone(), fetch).await
            }
            Transport::Bridged => self.fetch_bridged().await,
        };
        let Some(fetched) = fetched else {
            tracing::debug!("Abandoned grant fetch for stopped feed {}", self.id);
            return;
        };

        if self.stopped() {
            tracing::debug!("Discarding grant for stopped feed {}", self.id);
            if let Ok(grant) = fetched {
                self.revoke(grant).await;
            }
            return;
        }

        match fetched {
            Ok(grant) => {
                self.grant = Some(grant);
                self.spawn_transcoder().await;
            }
            Err(e) => {
                let delay = self.policy.grant_backoff(&e);
                let status = if e.is_rate_limited() {
                    FeedStatus::RateLimited(transport)
                } else {
                    FeedStatus::RetryingGrant(transport)
                };
                tracing::warn!(
                    "Grant for {} failed: {}. Retrying in {:?}",
                    self.id,
                    e,
                    delay
                );
                self.retry_at = Some(Instant::now() + delay);
                self.set_status(status);
            }
        }
    }

    /// `None` when a stop arrived while the bridge was opening
    async fn fetch_bridged(&mut self) -> Option<Result<Grant, GrantError>> {
        if self.bridge.is_none() {
            let Some(bridge) = self.deps.bridge.clone() else {
                return Some(Err(GrantError::Request("capture bridge disabled".to_string())));
            };
            let id = self.id.clone();
            let open = async move { bridge.open(&id).await };
            let session = match until_stopped(self.stop.clone(), open).await? {
                Ok(session) => session,
                Err(e) => return Some(Err(GrantError::Request(e.to_string()))),
            };
            self.bridge_alive = Some(session.liveness());
            self.bridge = Some(session);
        }
        let url = self
            .bridge
            .as_ref()
            .map(|session| session.sink_url())
            .ok_or_else(|| GrantError::Request("capture bridge closed".to_string()));
        Some(url.map(|url| Grant::synthetic(url, BRIDGE_GRANT_LIFETIME)))
    }

    async fn spawn_transcoder(&mut self) {
        // At most one live process per feed
        self.terminate_process().await;

        let (Some(transport), Some(grant)) = (self.transport, self.grant.as_ref()) else {
            return;
        };
        let source = match transport {
            Transport::Primary => TranscodeSource::Primary(grant.media_url.clone()),
            Transport::Bridged => TranscodeSource::Bridged(grant.media_url.clone()),
        };
        let job = TranscodeJob {
            feed_id: self.id.clone(),
            source,
            mount_path: self.path.clone(),
        };

        match self.deps.transcoder.spawn(&job).await {
            Ok(handle) => {
                if self.stopped() {
                    self.process = Some(RunningProcess {
                        handle,
                        started: Instant::now(),
                    });
                    self.terminate_process().await;
                    return;
                }
                let pid = handle.pid().unwrap_or_default();
                self.process = Some(RunningProcess {
                    handle,
                    started: Instant::now(),
                });
                tracing::info!("Feed {} streaming to {} (pid {})", self.id, self.path, pid);
                self.set_status(FeedStatus::Streaming { pid });
            }
            Err(e) => {
                tracing::error!("Transcoder for {} failed to start: {}", self.id, e);
                self.after_exit(None);
            }
        }
    }

    async fn on_exit(&mut self, exit: Result<ProcessExit, TranscodeError>) {
        let uptime = self
            .process
            .take()
            .map(|running| running.started.elapsed())
            .unwrap_or_default();
        if self.stopped() {
            return;
        }

        let code = match exit {
            Ok(exit) => exit.code,
            Err(e) => {
                tracing::warn!("Lost track of transcoder for {}: {}", self.id, e);
                None
            }
        };
        tracing::warn!("Transcoder for {} exited with {:?} after {:?}", self.id, code, uptime);

        if self.policy.resets_crash_count(uptime) {
            self.retry_count = 0;
        }
        self.after_exit(code);
    }

    /// Either schedule a full refetch or stall
    fn after_exit(&mut self, code: Option<i32>) {
        match self.policy.on_exit(code, self.retry_count) {
            ExitAction::Restart => {
                self.retry_count += 1;
                self.grant = None;
                self.retry_at = Some(Instant::now() + self.policy.short_backoff);
                tracing::info!(
                    "Restarting {} ({}/{}) in {:?}",
                    self.id,
                    self.retry_count,
                    self.policy.max_restarts,
                    self.policy.short_backoff
                );
                self.set_status(FeedStatus::Restarting);
            }
            ExitAction::Stall => {
                tracing::error!("Feed {} stalled (exit {:?}, {} restarts)", self.id, code, self.retry_count);
                self.set_status(FeedStatus::Stalled);
            }
        }
    }

    async fn on_bridge_lost(&mut self) {
        self.bridge_alive = None;
        if self.stopped() {
            return;
        }
        tracing::warn!("Capture bridge for {} stopped producing frames", self.id);
        if let Some(mut session) = self.bridge.take() {
            session.close().await;
        }
        let was_running = self.process.is_some();
        self.terminate_process().await;
        if was_running {
            self.after_exit(None);
        }
    }

    async fn on_extend(&mut self) {
        if !self.status.is_streaming() || self.stopped() {
            return;
        }
        let Some(grant) = self.grant.clone() else {
            return;
        };

        match self.transport {
            Some(Transport::Bridged) => {
                // No upstream session to extend; re-arm the local lifetime.
                self.grant = Some(Grant::synthetic(grant.media_url, BRIDGE_GRANT_LIFETIME));
                self.publish();
            }
            Some(Transport::Primary) => {
                let result = match grant.continuation_token.clone() {
                    Some(token) => {
                        let extension = extend_within(
                            self.deps.grants.clone(),
                            self.id.clone(),
                            token,
                            self.deps.settings.expiry_margin,
                        );
                        match until_stopped(self.stop.clone(), extension).await {
                            Some(result) => result,
                            None => return,
                        }
                    }
                    None => Err(GrantError::Malformed("no continuation token".to_string())),
                };
                if self.stopped() {
                    return;
                }
                let mut extended = grant;
                match result.and_then(|extension| extended.merge(extension)) {
                    Ok(()) => {
                        tracing::info!("Extended grant for {} until {}", self.id, extended.expires_at);
                        self.grant = Some(extended);
                        self.publish();
                    }
                    Err(e) => {
                        tracing::warn!("Extending grant for {} failed: {}. Restarting", self.id, e);
                        self.set_status(FeedStatus::Restarting);
                        self.teardown().await;
                        self.retry_count = 0;
                        self.begin().await;
                    }
                }
            }
            None => {}
        }
    }

    /// Release everything held; leaves the status alone
    async fn teardown(&mut self) {
        self.retry_at = None;
        self.terminate_process().await;
        self.bridge_alive = None;
        if let Some(mut session) = self.bridge.take() {
            session.close().await;
        }
        if let Some(grant) = self.grant.take() {
            if self.transport == Some(Transport::Primary) {
                self.revoke(grant).await;
            }
        }
        if self.mount_reserved {
            self.deps.mounts.release(&self.path);
            self.mount_reserved = false;
        }
        self.transport = None;
        self.publish();
    }

    async fn revoke(&mut self, grant: Grant) {
        let Some(token) = grant.continuation_token else {
            return;
        };
        revoke_within(self.deps.grants.clone(), self.id.clone(), token, self.deps.stop_grace).await;
    }

    /// Interrupt the live process and wait for it, killing it after the grace period
    async fn terminate_process(&mut self) {
        let Some(mut running) = self.process.take() else {
            return;
        };
        if let Err(e) = running.handle.interrupt() {
            tracing::warn!("Failed to interrupt transcoder for {}: {}", self.id, e);
        }
        if timeout(self.deps.stop_grace, running.handle.wait()).await.is_err() {
            tracing::warn!("Transcoder for {} ignored interrupt, killing", self.id);
            if let Err(e) = running.handle.kill() {
                tracing::error!("Failed to kill transcoder for {}: {}", self.id, e);
            }
            let _ = running.handle.wait().await;
        }
    }

    fn set_status(&mut self, status: FeedStatus) {
        if self.status != status {
            tracing::debug!("Feed {}: {} -> {}", self.id, self.status, status);
            self.status = status;
            self.publish();
            let _ = self.deps.events.send(FeedEvent {
                feed: self.id.clone(),
                path: self.path.clone(),
                status,
            });
        }
        self.resolve_waiters();
    }

    fn resolve_waiters(&mut self) {
        if self.status.is_transient() {
            return;
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(self.status);
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(FeedSnapshot {
            id: self.id.clone(),
            path: self.path.clone(),
            transport: self.transport,
            status: self.status,
            expires_at: self.grant.as_ref().map(|grant| grant.expires_at),
            retry_count: self.retry_count,
        });
    }
}

async fn fetch_primary(grants: Arc<dyn GrantProvider>, id: String) -> Result<Grant, GrantError> {
    let payload = grants.generate(&id).await?;
    Grant::from_payload(payload)
}

/// Extend upstream, giving up once the grant would have lapsed anyway
async fn extend_within(
    grants: Arc<dyn GrantProvider>,
    id: String,
    token: String,
    limit: Duration,
) -> Result<GrantExtension, GrantError> {
    match timeout(limit, grants.extend(&id, &token)).await {
        Ok(result) => result,
        Err(_) => Err(GrantError::Request(format!("no extension reply within {:?}", limit))),
    }
}

async fn revoke_within(grants: Arc<dyn GrantProvider>, id: String, token: String, limit: Duration) {
    match timeout(limit, grants.revoke(&id, &token)).await {
        Ok(Ok(())) => tracing::debug!("Revoked grant for {}", id),
        Ok(Err(e)) => tracing::debug!("Revoking grant for {} failed: {}", id, e),
        Err(_) => tracing::debug!("Revoking grant for {} timed out", id),
    }
}

/// Drive `work` unless a stop is requested first
async fn until_stopped<F: Future>(mut stop: watch::Receiver<bool>, work: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = stop_requested(&mut stop) => None,
        output = work => Some(output),
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            // Every handle is gone
            return;
        }
    }
}

async fn wait_for_exit(process: &mut Option<RunningProcess>) -> Result<ProcessExit, TranscodeError> {
    match process {
        Some(running) => running.handle.wait().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn bridge_lost(alive: &mut Option<watch::Receiver<bool>>) {
    let Some(alive) = alive else {
        return std::future::pending().await;
    };
    loop {
        if !*alive.borrow_and_update() {
            return;
        }
        if alive.changed().await.is_err() {
            return;
        }
    }
}
