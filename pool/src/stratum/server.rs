//! Job distributor (stratum server)
//!
//! Listens on one port per mining mode, polls the node for candidates,
//! broadcasts jobs and validates submits. Connection bookkeeping (sessions,
//! job book, source guard, share feed) is owned here, created by `new` and
//! reset by `stop`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::connection::{drive, parse_login, ConnectionHandler, ConnectionSettings, MinerSession};
use super::guard::{GuardConfig, SourceGuard};
use super::protocol::{StratumError, StratumNotification, StratumRequest, StratumResponse, SubmitParams};
use crate::blockchain::NodeClient;
use crate::diagnostics::{hash_ratio, FeedSnapshot, ShareFeed, ShareRoll, DEFAULT_FEED_CAPACITY};
use crate::error::{NodeError, ProtocolError, ShareError, ValidationIntegrityError};
use crate::jobs::{Job, JobBook, NewJob, DEFAULT_JOB_HISTORY};
use crate::metrics::prometheus as metrics;
use crate::session::{MiningMode, SessionCounts, SessionManager, SharedSession};
use crate::shares::{proven_work, FoundBlock, ShareProcessor, ShareValidator, ShareWork};
use crate::storage::NewShare;
use crate::vardiff::VarDiffConfig;

#[derive(Debug, Clone)]
pub struct StratumSettings {
    pub host: String,
    pub pplns_port: u16,
    pub solo_port: u16,
    pub poll_interval: Duration,
    /// How often to re-check a node that is still syncing at startup.
    pub sync_retry: Duration,
    pub keepalive: Duration,
    pub extranonce2_size: usize,
    pub job_history: usize,
    pub feed_capacity: usize,
    pub purge_interval: Duration,
    pub connection: ConnectionSettings,
    pub vardiff: VarDiffConfig,
    pub guard: GuardConfig,
}

impl Default for StratumSettings {
    fn default() -> Self {
        let vardiff = VarDiffConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            pplns_port: 3416,
            solo_port: 3417,
            poll_interval: Duration::from_secs(2),
            sync_retry: Duration::from_secs(30),
            keepalive: Duration::from_secs(30),
            extranonce2_size: 6,
            job_history: DEFAULT_JOB_HISTORY,
            feed_capacity: DEFAULT_FEED_CAPACITY,
            purge_interval: Duration::from_secs(3600),
            connection: ConnectionSettings {
                retarget_interval: vardiff.retarget_time,
                ..Default::default()
            },
            vardiff,
            guard: GuardConfig::default(),
        }
    }
}

enum SubmitReject {
    Share(ShareError),
    Params(ProtocolError),
    Integrity(ValidationIntegrityError),
}

impl From<ShareError> for SubmitReject {
    fn from(e: ShareError) -> Self {
        SubmitReject::Share(e)
    }
}

impl From<ProtocolError> for SubmitReject {
    fn from(e: ProtocolError) -> Self {
        SubmitReject::Params(e)
    }
}

impl From<ValidationIntegrityError> for SubmitReject {
    fn from(e: ValidationIntegrityError) -> Self {
        SubmitReject::Integrity(e)
    }
}

fn reject_reason(e: &ShareError) -> &'static str {
    match e {
        ShareError::Unauthorized => "unauthorized",
        ShareError::JobNotFound => "job_not_found",
        ShareError::InvalidExtraNonce2 => "invalid_extranonce2",
        ShareError::InvalidNonceSize => "invalid_nonce_size",
        ShareError::Duplicate => "duplicate",
        ShareError::LowDifficulty => "low_difficulty",
        ShareError::Banned => "banned",
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct StratumServer {
    settings: StratumSettings,
    node: Arc<dyn NodeClient>,
    processor: Arc<ShareProcessor>,
    validator: ShareValidator,
    sessions: SessionManager,
    jobs: Mutex<JobBook>,
    guard: Mutex<SourceGuard>,
    feed: Mutex<ShareFeed>,
    network_difficulty: AtomicU64,
    next_extranonce: AtomicU32,
    suspended: AtomicBool,
    shutdown: CancellationToken,
}

impl StratumServer {
    pub fn new(
        settings: StratumSettings,
        node: Arc<dyn NodeClient>,
        processor: Arc<ShareProcessor>,
        validator: ShareValidator,
    ) -> Arc<Self> {
        tracing::info!(
            host = %settings.host,
            pplns_port = settings.pplns_port,
            solo_port = settings.solo_port,
            "🌐 Creating Stratum server"
        );
        Arc::new(Self {
            jobs: Mutex::new(JobBook::new(settings.job_history)),
            guard: Mutex::new(SourceGuard::new(settings.guard)),
            feed: Mutex::new(ShareFeed::new(settings.feed_capacity)),
            settings,
            node,
            processor,
            validator,
            sessions: SessionManager::new(),
            network_difficulty: AtomicU64::new(0),
            next_extranonce: AtomicU32::new(0),
            suspended: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub async fn session_counts(&self, mode: Option<MiningMode>) -> SessionCounts {
        self.sessions.counts(mode).await
    }

    pub fn share_feed(&self) -> FeedSnapshot {
        lock(&self.feed).snapshot()
    }

    pub fn current_job(&self) -> Option<Arc<Job>> {
        lock(&self.jobs).current()
    }

    pub fn network_difficulty(&self) -> u64 {
        self.network_difficulty.load(Ordering::Relaxed)
    }

    /// Waits for the node to sync, then listens on both ports and starts
    /// the poll and purge timers.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.wait_for_sync().await {
            return Ok(());
        }
        if let Err(e) = self.poll_work().await {
            tracing::warn!(error = %e, "Initial candidate fetch failed");
        }

        for (port, mode) in [
            (self.settings.pplns_port, MiningMode::Pplns),
            (self.settings.solo_port, MiningMode::Solo),
        ] {
            let listener = bind(&self.settings.host, port)?;
            tracing::info!(port, %mode, "✅ Stratum listening");
            tokio::spawn(Arc::clone(self).accept_loop(listener, mode));
        }

        tokio::spawn(Arc::clone(self).poll_loop());
        tokio::spawn(Arc::clone(self).purge_loop());
        Ok(())
    }

    /// Cancels timers and listeners, disconnects every session and resets
    /// the in-memory state.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        for session in self.sessions.drain().await {
            session.write().await.disconnect();
        }
        lock(&self.jobs).clear();
        lock(&self.guard).clear();
        lock(&self.feed).clear();
        tracing::info!("Stratum server stopped");
    }

    async fn wait_for_sync(&self) -> bool {
        loop {
            match self.node.info().await {
                Ok(info) if info.is_synced() => {
                    self.set_network_difficulty(info.difficulty);
                    tracing::info!(height = info.full_height, peers = info.peers_count, "Node synced");
                    return true;
                }
                Ok(info) => tracing::info!(
                    full = info.full_height,
                    headers = info.headers_height,
                    "⏳ Node still syncing, waiting"
                ),
                Err(e) => tracing::warn!(error = %e, "Node unreachable, waiting"),
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.settings.sync_retry) => {}
            }
        }
    }

    fn set_network_difficulty(&self, d: u64) {
        self.network_difficulty.store(d, Ordering::Relaxed);
        metrics::set_network_difficulty(d);
    }

    /// One poll: refresh node status and broadcast a new job if the
    /// candidate changed. Nothing is fetched while the node is out of sync.
    pub async fn poll_work(&self) -> Result<Option<NewJob>, NodeError> {
        let info = self.node.info().await?;
        self.set_network_difficulty(info.difficulty);

        if !info.is_synced() {
            if !self.suspended.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    full = info.full_height,
                    headers = info.headers_height,
                    "Node out of sync, job updates suspended"
                );
            }
            return Ok(None);
        }
        if self.suspended.swap(false, Ordering::Relaxed) {
            tracing::info!("Node back in sync, job updates resumed");
        }

        let candidate = self.node.mining_candidate().await?;
        let new_job = lock(&self.jobs).offer(candidate);
        if let Some(nj) = &new_job {
            metrics::set_job_height(u64::from(nj.job.height()));
            let sent = self.broadcast(&nj.job, nj.height_changed).await;
            tracing::info!(
                job = %nj.job.id,
                height = nj.job.height(),
                clean = nj.height_changed,
                miners = sent,
                "⛏️ New job"
            );
        }
        Ok(new_job)
    }

    /// Sends `job` to every authorized session at its own difficulty.
    pub async fn broadcast(&self, job: &Job, clean: bool) -> usize {
        let mut sent = 0;
        for session in self.sessions.all().await {
            let mut s = session.write().await;
            if s.is_authorized() && s.send_job(job, clean) {
                sent += 1;
            }
        }
        metrics::inc_job_broadcasts(sent as u64);
        sent
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.settings.poll_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.poll_work().await {
                        tracing::warn!(error = %e, "Node poll failed");
                    }
                }
            }
        }
    }

    async fn purge_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.settings.purge_interval);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let n = lock(&self.guard).purge(Instant::now());
                    if n > 0 {
                        tracing::debug!(expired = n, "Purged invalid-share counters");
                    }
                }
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mode: MiningMode) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = listener.accept() => res,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move { server.serve_tcp(stream, peer, mode).await });
                }
                Err(e) => tracing::error!(error = %e, "Failed to accept connection"),
            }
        }
    }

    async fn serve_tcp(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, mode: MiningMode) {
        let keepalive = socket2::TcpKeepalive::new().with_time(self.settings.keepalive);
        if let Err(e) = socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            tracing::debug!(%peer, error = %e, "Could not enable TCP keepalive");
        }
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "Could not set TCP_NODELAY");
        }
        self.serve(stream, peer, mode).await;
    }

    /// Runs one miner connection on any byte stream.
    pub async fn serve<S>(self: Arc<Self>, stream: S, peer: SocketAddr, mode: MiningMode)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if !lock(&self.guard).try_open(peer.ip()) {
            tracing::warn!(ip = %peer.ip(), "🚫 Per-IP connection limit reached, rejecting");
            return;
        }
        let (session, outbound, token) = self.open_session(peer, mode).await;
        let handler: Arc<dyn ConnectionHandler> = self.clone();
        drive(stream, session, outbound, token, handler, self.settings.connection.clone()).await;
        lock(&self.guard).close(peer.ip());
    }

    /// Registers a session with a fresh subscription id and extranonce1.
    pub async fn open_session(
        &self,
        peer: SocketAddr,
        mode: MiningMode,
    ) -> (SharedSession, mpsc::UnboundedReceiver<String>, CancellationToken) {
        let id = Uuid::new_v4().simple().to_string();
        let extranonce1 = format!("{:04x}", self.next_extranonce.fetch_add(1, Ordering::Relaxed) as u16);
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.shutdown.child_token();
        let session = Arc::new(RwLock::new(MinerSession::new(
            &id,
            peer,
            mode,
            &extranonce1,
            self.settings.extranonce2_size,
            &self.settings.vardiff,
            tx,
            token.clone(),
        )));
        self.sessions.register(session.clone()).await;
        (session, rx, token)
    }

    pub async fn handle_line(&self, session: &SharedSession, line: &str) {
        let req = match StratumRequest::parse(line) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring malformed message");
                return;
            }
        };
        match req.method.as_str() {
            "mining.subscribe" => self.handle_subscribe(session, &req).await,
            "mining.authorize" => self.handle_authorize(session, &req).await,
            "mining.submit" => self.handle_submit(session, &req).await,
            "mining.extranonce.subscribe" => {
                session.read().await.respond(&StratumResponse::success(req.id.clone(), json!(true)));
            }
            other => {
                let err = ProtocolError::UnknownMethod(other.to_string());
                tracing::debug!(method = other, "Unknown method");
                session
                    .read()
                    .await
                    .respond(&StratumResponse::error(req.id.clone(), StratumError::from(&err)));
            }
        }
    }

    async fn handle_subscribe(&self, session: &SharedSession, req: &StratumRequest) {
        let mut s = session.write().await;
        s.subscribed = true;
        s.user_agent = req.param_str(0).map(str::to_string);
        let result = json!([
            [["mining.set_difficulty", s.id], ["mining.notify", s.id]],
            s.extranonce1,
            s.extranonce2_size
        ]);
        s.respond(&StratumResponse::success(req.id.clone(), result));
        s.notify(&StratumNotification::set_difficulty(1));
        tracing::info!(peer = %s.peer, agent = s.user_agent.as_deref().unwrap_or(""), "📡 Subscribe");
    }

    async fn handle_authorize(&self, session: &SharedSession, req: &StratumRequest) {
        let login = req.param_str(0).unwrap_or("");
        let current = self.current_job();
        let mut s = session.write().await;
        match parse_login(login) {
            Ok((address, worker)) => {
                s.authorize(&address, &worker);
                s.respond(&StratumResponse::success(req.id.clone(), json!(true)));
                tracing::info!(miner = %address, worker = %worker, mode = %s.mode, difficulty = s.difficulty, "🔐 Miner authorized");
                if let Some(job) = current {
                    if s.send_job(&job, false) {
                        metrics::inc_job_broadcasts(1);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(peer = %s.peer, login, error = %e, "Authorization rejected");
                s.respond(&StratumResponse::error(req.id.clone(), StratumError::from(&e)));
                s.disconnect();
            }
        }
    }

    async fn handle_submit(&self, session: &SharedSession, req: &StratumRequest) {
        match self.process_submit(session, req).await {
            Ok(found) => {
                session.read().await.respond(&StratumResponse::success(req.id.clone(), json!(true)));
                if let Some(found) = found {
                    // submit retries must not hold up this miner's read loop
                    let processor = Arc::clone(&self.processor);
                    tokio::spawn(async move { processor.handle_block(&found).await });
                }
            }
            Err(SubmitReject::Share(e)) => self.reject_share(session, req, e).await,
            Err(SubmitReject::Params(e)) => {
                let mut s = session.write().await;
                s.rejected += 1;
                metrics::inc_rejected("invalid_params");
                s.respond(&StratumResponse::error(req.id.clone(), StratumError::from(&e)));
            }
            Err(SubmitReject::Integrity(e)) => {
                tracing::error!(error = %e, "Share validation failed internally");
                metrics::inc_rejected("internal");
                session
                    .read()
                    .await
                    .respond(&StratumResponse::error(req.id.clone(), StratumError::internal_validation()));
            }
        }
    }

    async fn process_submit(
        &self,
        session: &SharedSession,
        req: &StratumRequest,
    ) -> Result<Option<FoundBlock>, SubmitReject> {
        let (peer, extranonce1, extranonce2_size, difficulty, address, worker, mode) = {
            let s = session.read().await;
            let Some(address) = s.address.clone().filter(|_| s.is_authorized()) else {
                return Err(ShareError::Unauthorized.into());
            };
            (
                s.peer,
                s.extranonce1.clone(),
                s.extranonce2_size,
                s.last_sent_difficulty,
                address,
                s.worker.clone(),
                s.mode,
            )
        };

        if lock(&self.guard).is_banned(peer.ip(), Instant::now()) {
            return Err(ShareError::Banned.into());
        }

        let params = SubmitParams::from_request(req)?;
        let job = lock(&self.jobs)
            .get(&params.job_id)
            .ok_or(ShareError::JobNotFound)?;

        let en2 = &params.extranonce2;
        if en2.len() != extranonce2_size * 2 || !en2.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ShareError::InvalidExtraNonce2.into());
        }
        let full_nonce = format!("{extranonce1}{en2}");
        let mut nonce = [0u8; 8];
        if full_nonce.len() != 16 || hex::decode_to_slice(&full_nonce, &mut nonce).is_err() {
            return Err(ShareError::InvalidNonceSize.into());
        }

        if !job.claim_nonce(&full_nonce) {
            return Err(ShareError::Duplicate.into());
        }

        let result = self
            .validator
            .validate(ShareWork {
                header: job.candidate.header,
                nonce,
                height: job.height(),
                share_target: job.share_target(difficulty),
                network_target: job.network_target().clone(),
            })
            .await?;

        let network_difficulty = self.network_difficulty();
        let mut share = NewShare {
            address: address.clone(),
            worker: worker.clone(),
            work: 0,
            network_difficulty,
            share_difficulty: difficulty,
            height: u64::from(job.height()),
            valid: false,
            mode,
            created_at: Utc::now(),
        };

        if !result.valid {
            self.processor.record_share(&share).await;
            return Err(ShareError::LowDifficulty.into());
        }

        {
            let mut s = session.write().await;
            s.vardiff.on_share(Instant::now());
            s.accepted += 1;
        }
        metrics::inc_accepted();

        share.valid = true;
        share.work = proven_work(network_difficulty, difficulty);
        self.processor.record_share(&share).await;

        lock(&self.feed).record(ShareRoll {
            timestamp: share.created_at,
            address: address.clone(),
            worker: worker.clone(),
            mode,
            height: job.height(),
            difficulty,
            ratio: hash_ratio(&result.final_hash, job.network_target()),
            is_block: result.meets_network_target,
        });
        tracing::debug!(miner = %address, worker = %worker, job = %job.id, difficulty, "Share accepted");

        if !result.meets_network_target {
            return Ok(None);
        }
        Ok(Some(FoundBlock {
            height: job.height(),
            nonce: full_nonce,
            pk: job.candidate.pk.clone(),
            address,
            worker,
            mode,
            network_difficulty,
        }))
    }

    async fn reject_share(&self, session: &SharedSession, req: &StratumRequest, err: ShareError) {
        metrics::inc_rejected(reject_reason(&err));
        let mut s = session.write().await;
        s.rejected += 1;

        let counted = !matches!(err, ShareError::Unauthorized | ShareError::Banned);
        let over_limit = counted && lock(&self.guard).record_invalid(s.peer.ip(), Instant::now());

        if over_limit || err == ShareError::Banned {
            if over_limit {
                metrics::inc_source_bans();
            }
            tracing::warn!(peer = %s.peer, miner = %s.label(), "🚫 Too many invalid shares, disconnecting");
            s.respond(&StratumResponse::error(req.id.clone(), StratumError::from(&ShareError::Banned)));
            s.disconnect();
            return;
        }

        tracing::debug!(miner = %s.label(), reason = %err, "Share rejected");
        s.respond(&StratumResponse::error(req.id.clone(), StratumError::from(&err)));
    }

    /// Vardiff tick. A changed difficulty only takes effect with the next
    /// job sent to the session; a job id is never re-sent with another target.
    pub async fn retarget(&self, session: &SharedSession) {
        let mut s = session.write().await;
        if !s.is_authorized() {
            return;
        }
        let difficulty = s.difficulty;
        let Some(next) = s.vardiff.retarget(Instant::now(), difficulty) else {
            return;
        };
        s.difficulty = next;
        metrics::inc_vardiff_retargets();
        tracing::debug!(miner = %s.label(), from = difficulty, to = next, "VarDiff retarget");
    }
}

#[async_trait]
impl ConnectionHandler for StratumServer {
    async fn on_connect(&self, session: &SharedSession) {
        let s = session.read().await;
        metrics::inc_connections(s.mode.as_str());
        tracing::info!(peer = %s.peer, mode = %s.mode, extranonce1 = %s.extranonce1, "🔌 New connection");
    }

    async fn on_message(&self, session: &SharedSession, line: &str) {
        self.handle_line(session, line).await;
    }

    async fn on_retarget(&self, session: &SharedSession) {
        self.retarget(session).await;
    }

    async fn on_disconnect(&self, session: &SharedSession) {
        let (id, peer, mode, label) = {
            let s = session.read().await;
            (s.id.clone(), s.peer, s.mode, s.label())
        };
        self.sessions.remove(&id).await;
        metrics::dec_connections(mode.as_str());
        tracing::info!(%peer, miner = %label, "🔌 Connection closed");
    }
}

fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    // SO_REUSEADDR avoids "address in use" on quick restarts
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&socket2::SockAddr::from(addr))
        .with_context(|| format!("failed to bind {addr}"))?;
    socket.listen(1024)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}
