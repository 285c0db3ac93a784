//! Per-connection miner state and the connection driver.
//!
//! `drive` owns the socket: it frames inbound lines, forwards them to a
//! [`ConnectionHandler`], runs the periodic retarget tick and enforces the
//! authorization deadline. Everything written to the miner goes through the
//! session's outbound queue so replies and broadcasts never interleave.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::error::AuthError;
use crate::jobs::Job;
use crate::session::{MiningMode, SharedSession};
use crate::stratum::protocol::{StratumNotification, StratumResponse};
use crate::vardiff::{VarDiffConfig, VarDiffState};

pub const DEFAULT_WORKER: &str = "default";
pub const MAX_WORKER_LEN: usize = 32;
pub const MAX_LINE_BYTES: usize = 10 * 1024;

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Authorized,
    Disconnected,
}

#[derive(Debug)]
pub struct MinerSession {
    /// Subscription id, unique per connection
    pub id: String,
    pub peer: SocketAddr,
    pub mode: MiningMode,
    pub state: SessionState,
    pub subscribed: bool,
    pub user_agent: Option<String>,
    /// 2 bytes, lowercase hex
    pub extranonce1: String,
    pub extranonce2_size: usize,
    pub address: Option<String>,
    pub worker: String,
    /// Multiplier vardiff wants; takes effect with the next job sent.
    pub difficulty: u64,
    /// Multiplier embedded in the last job sent; shares are checked against it.
    pub last_sent_difficulty: u64,
    pub vardiff: VarDiffState,
    pub connected_at: Instant,
    pub accepted: u64,
    pub rejected: u64,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
}

impl MinerSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: &str,
        peer: SocketAddr,
        mode: MiningMode,
        extranonce1: &str,
        extranonce2_size: usize,
        vardiff: &VarDiffConfig,
        outbound: mpsc::UnboundedSender<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id: id.to_string(),
            peer,
            mode,
            state: SessionState::Connected,
            subscribed: false,
            user_agent: None,
            extranonce1: extranonce1.to_string(),
            extranonce2_size,
            address: None,
            worker: DEFAULT_WORKER.to_string(),
            difficulty: vardiff.initial_difficulty,
            last_sent_difficulty: vardiff.initial_difficulty,
            vardiff: VarDiffState::new(*vardiff),
            connected_at: Instant::now(),
            accepted: 0,
            rejected: 0,
            outbound,
            shutdown,
        }
    }

    pub fn is_authorized(&self) -> bool {
        self.state == SessionState::Authorized && self.address.is_some()
    }

    pub fn authorize(&mut self, address: &str, worker: &str) {
        self.address = Some(address.to_string());
        self.worker = worker.to_string();
        self.state = SessionState::Authorized;
    }

    /// Label used in logs: `address.worker` once authorized, else the peer.
    pub fn label(&self) -> String {
        match &self.address {
            Some(a) => format!("{}.{}", a, self.worker),
            None => self.peer.to_string(),
        }
    }

    /// Queues one line for the writer. False once the connection is gone.
    pub fn send_line(&self, line: String) -> bool {
        !self.shutdown.is_cancelled() && self.outbound.send(line).is_ok()
    }

    pub fn respond(&self, response: &StratumResponse) -> bool {
        self.send_line(response.to_line())
    }

    pub fn notify(&self, notification: &StratumNotification) -> bool {
        self.send_line(notification.to_line())
    }

    /// Sends `job` at the current vardiff multiplier, which from now on is
    /// the one shares are validated against.
    pub fn send_job(&mut self, job: &Job, clean: bool) -> bool {
        self.last_sent_difficulty = self.difficulty;
        let share_target = job.share_target(self.last_sent_difficulty).to_str_radix(10);
        self.notify(&StratumNotification::notify(
            &job.id,
            u64::from(job.height()),
            &job.candidate.msg,
            &share_target,
            clean,
        ))
    }

    /// Asks the driver to close the connection after queued lines are flushed.
    pub fn disconnect(&mut self) {
        self.state = SessionState::Disconnected;
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Mainnet P2PK addresses: '9' prefix, base58, 40 to 55 characters.
pub fn validate_address(address: &str) -> Result<(), AuthError> {
    let len_ok = (40..=55).contains(&address.len());
    let charset_ok = address.chars().all(|c| BASE58_ALPHABET.contains(c));
    if address.starts_with('9') && len_ok && charset_ok {
        Ok(())
    } else {
        Err(AuthError::InvalidAddress)
    }
}

pub fn sanitize_worker(raw: &str) -> String {
    let w: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(MAX_WORKER_LEN)
        .collect();
    if w.is_empty() {
        DEFAULT_WORKER.to_string()
    } else {
        w
    }
}

/// `address[.worker]` → validated address plus sanitized worker name.
pub fn parse_login(login: &str) -> Result<(String, String), AuthError> {
    let login = login.trim();
    if login.is_empty() {
        return Err(AuthError::MissingCredentials);
    }
    let (address, worker) = match login.split_once('.') {
        Some((a, w)) => (a, w),
        None => (login, ""),
    };
    validate_address(address)?;
    Ok((address.to_string(), sanitize_worker(worker)))
}

/// Observer for connection lifecycle events.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn on_connect(&self, _session: &SharedSession) {}

    async fn on_message(&self, session: &SharedSession, line: &str);

    async fn on_retarget(&self, session: &SharedSession);

    async fn on_disconnect(&self, session: &SharedSession);
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub auth_timeout: Duration,
    pub max_line_bytes: usize,
    pub retarget_interval: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(30),
            max_line_bytes: MAX_LINE_BYTES,
            retarget_interval: Duration::from_secs(90),
        }
    }
}

/// Runs one connection until the peer leaves, the session is cancelled,
/// authorization times out or a line exceeds the size cap.
pub async fn drive<S>(
    stream: S,
    session: SharedSession,
    outbound: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
    handler: Arc<dyn ConnectionHandler>,
    settings: ConnectionSettings,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let writer_task = tokio::spawn(write_loop(writer, outbound, shutdown.clone()));

    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(settings.max_line_bytes));
    let auth_deadline = tokio::time::sleep(settings.auth_timeout);
    tokio::pin!(auth_deadline);
    let mut auth_checked = false;
    let mut retarget = tokio::time::interval_at(
        tokio::time::Instant::now() + settings.retarget_interval,
        settings.retarget_interval,
    );
    let peer = session.read().await.peer;
    handler.on_connect(&session).await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = &mut auth_deadline, if !auth_checked => {
                auth_checked = true;
                if !session.read().await.is_authorized() {
                    tracing::warn!(%peer, "⏱️ Authorization timeout, disconnecting");
                    break;
                }
            }
            _ = retarget.tick() => handler.on_retarget(&session).await,
            frame = lines.next() => match frame {
                Some(Ok(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        handler.on_message(&session, line).await;
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    tracing::warn!(%peer, limit = settings.max_line_bytes, "Oversized line, disconnecting");
                    break;
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    tracing::debug!(%peer, error = %e, "Read error");
                    break;
                }
                None => {
                    tracing::debug!(%peer, "Connection closed by client");
                    break;
                }
            },
        }
    }

    {
        let mut s = session.write().await;
        s.disconnect();
    }
    handler.on_disconnect(&session).await;
    let _ = writer_task.await;
}

async fn write_loop<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<String>, shutdown: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            msg = outbound.recv() => match msg {
                Some(line) => {
                    if writer.write_all(line.as_bytes()).await.is_err() {
                        return;
                    }
                    let _ = writer.flush().await;
                }
                None => break,
            },
            _ = shutdown.cancelled() => {
                // flush what was queued before the close
                while let Ok(line) = outbound.try_recv() {
                    if writer.write_all(line.as_bytes()).await.is_err() {
                        return;
                    }
                }
                let _ = writer.flush().await;
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}
