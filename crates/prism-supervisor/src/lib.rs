// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Supervisor end of the calc channel.
//!
//! [`CalcSupervisor`] runs a TCP listener on a background runtime thread and
//! keeps a pool of registered provider connections. It implements
//! [`RemoteBackend`], so the engine's remote-calculation jobs — each on its
//! own dedicated thread — block in [`RemoteBackend::submit`] while the
//! runtime drives the wire: `FUNCTION` out, `PROGRESS` pumped into the job
//! context, `RESULT`/`FAILURE` back, and liveness pings on a fixed interval
//! throughout. One calculation is in flight per connection; concurrency
//! comes from connecting more providers.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use prism_calc_proto::{
    wire, FunctionPayload, Message, PingPayload,
};
use prism_engine::{FailurePayload, JobContext, JobError, RemoteBackend, RemoteCall};
use prism_request::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Supervisor-side configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Address the provider listener binds to. Port 0 picks a free port.
    pub bind_addr: String,
    /// Cadence of liveness pings, idle or busy.
    pub ping_interval: Duration,
    /// How long a provider may go without a pong before the connection is
    /// declared dead (failing its in-flight call).
    pub pong_timeout: Duration,
    /// How long a fresh connection has to send its registration.
    pub registration_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_owned(),
            ping_interval: Duration::from_millis(500),
            pong_timeout: Duration::from_secs(2),
            registration_timeout: Duration::from_secs(2),
        }
    }
}

/// Supervisor failures.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Socket failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Framing or codec failure. Fatal to the connection.
    #[error("wire: {0}")]
    Wire(#[from] wire::WireError),
    /// Out-of-sequence or unexpected message. Fatal to the connection.
    #[error("protocol: {0}")]
    Protocol(String),
    /// The provider missed its pong deadline.
    #[error("provider unresponsive (missed pong deadline)")]
    Unresponsive,
    /// The listener thread failed to come up.
    #[error("supervisor startup failed: {0}")]
    Startup(String),
}

enum RemoteEvent {
    Progress(f64),
    Done(Result<Value, FailurePayload>),
}

struct SubmitCmd {
    call: RemoteCall,
    events: std::sync::mpsc::Sender<RemoteEvent>,
}

#[derive(Clone)]
struct ProviderLink {
    provider_id: String,
    cmd_tx: mpsc::Sender<SubmitCmd>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Idle provider connections, shared between the runtime (which registers
/// and returns links) and blocking submitters (which borrow them).
struct IdlePool {
    links: Mutex<VecDeque<(u64, ProviderLink)>>,
    available: Condvar,
    connected: AtomicUsize,
    next_conn: AtomicU64,
}

impl IdlePool {
    fn new() -> IdlePool {
        IdlePool {
            links: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            connected: AtomicUsize::new(0),
            next_conn: AtomicU64::new(0),
        }
    }

    fn next_conn_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::AcqRel)
    }

    fn push(&self, conn_id: u64, link: ProviderLink) {
        lock(&self.links).push_back((conn_id, link));
        self.available.notify_one();
    }

    fn remove(&self, conn_id: u64) {
        lock(&self.links).retain(|(id, _)| *id != conn_id);
    }
}

struct ConnState {
    registered: bool,
    inflight: Option<SubmitCmd>,
}

/// The supervisor: provider listener, connection pool, and the engine's
/// remote backend.
pub struct CalcSupervisor {
    idle: Arc<IdlePool>,
    local_addr: SocketAddr,
    config: SupervisorConfig,
    shutdown: watch::Sender<bool>,
    thread: Option<JoinHandle<()>>,
}

impl CalcSupervisor {
    /// Binds the provider listener and starts the background runtime.
    pub fn bind(config: SupervisorConfig) -> Result<CalcSupervisor, SupervisorError> {
        let idle = Arc::new(IdlePool::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (addr_tx, addr_rx) = std::sync::mpsc::channel::<Result<SocketAddr, std::io::Error>>();

        let idle_for_runtime = Arc::clone(&idle);
        let runtime_config = config.clone();
        let thread = std::thread::Builder::new()
            .name("prism-supervisor".to_owned())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = addr_tx.send(Err(err));
                        return;
                    }
                };
                runtime.block_on(accept_loop(
                    runtime_config,
                    idle_for_runtime,
                    shutdown_rx,
                    addr_tx,
                ));
            })
            .map_err(|err| SupervisorError::Startup(err.to_string()))?;

        let local_addr = addr_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| SupervisorError::Startup("listener thread did not report".to_owned()))?
            .map_err(SupervisorError::Io)?;

        info!(%local_addr, "calc supervisor listening");
        Ok(CalcSupervisor {
            idle,
            local_addr,
            config,
            shutdown: shutdown_tx,
            thread: Some(thread),
        })
    }

    /// The bound listener address providers should connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of registered provider connections.
    pub fn provider_count(&self) -> usize {
        self.idle.connected.load(Ordering::Acquire)
    }

    /// The configuration this supervisor was built with.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Borrows an idle provider link, blocking until one is available or
    /// the job is canceled.
    fn acquire_link(&self, ctx: &JobContext) -> Result<ProviderLink, JobError> {
        let mut links = lock(&self.idle.links);
        loop {
            if let Some((_, link)) = links.pop_front() {
                return Ok(link);
            }
            let (guard, _) = self
                .idle
                .available
                .wait_timeout(links, Duration::from_millis(100))
                .unwrap_or_else(PoisonError::into_inner);
            links = guard;
            ctx.check_in()?;
        }
    }
}

impl Drop for CalcSupervisor {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for CalcSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalcSupervisor")
            .field("local_addr", &self.local_addr)
            .field("providers", &self.provider_count())
            .finish_non_exhaustive()
    }
}

impl RemoteBackend for CalcSupervisor {
    fn submit(&self, call: RemoteCall, ctx: &JobContext) -> Result<Value, JobError> {
        loop {
            let link = self.acquire_link(ctx)?;
            let (event_tx, event_rx) = std::sync::mpsc::channel::<RemoteEvent>();
            let cmd = SubmitCmd {
                call: call.clone(),
                events: event_tx,
            };
            if link.cmd_tx.blocking_send(cmd).is_err() {
                // The connection died between pooling and use; borrow the
                // next one.
                debug!(provider_id = %link.provider_id, "stale provider link skipped");
                continue;
            }
            loop {
                match event_rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(RemoteEvent::Progress(fraction)) => ctx.report_progress(fraction),
                    Ok(RemoteEvent::Done(Ok(value))) => return Ok(value),
                    Ok(RemoteEvent::Done(Err(failure))) => return Err(JobError::Failed(failure)),
                    // Cancellation abandons the call; the connection drains
                    // to its terminal message on its own.
                    Err(RecvTimeoutError::Timeout) => ctx.check_in()?,
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(JobError::execution("provider connection lost"))
                    }
                }
            }
        }
    }
}

async fn accept_loop(
    config: SupervisorConfig,
    idle: Arc<IdlePool>,
    mut shutdown: watch::Receiver<bool>,
    addr_tx: std::sync::mpsc::Sender<Result<SocketAddr, std::io::Error>>,
) {
    let listener = match TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            let _ = addr_tx.send(Err(err));
            return;
        }
    };
    match listener.local_addr() {
        Ok(addr) => {
            let _ = addr_tx.send(Ok(addr));
        }
        Err(err) => {
            let _ = addr_tx.send(Err(err));
            return;
        }
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "provider connection accepted");
                    tokio::spawn(drive_connection(stream, Arc::clone(&idle), config.clone()));
                }
                Err(err) => warn!(?err, "accept failed"),
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// Owns one provider connection from accept to teardown.
async fn drive_connection(stream: TcpStream, idle: Arc<IdlePool>, config: SupervisorConfig) {
    let peer = stream.peer_addr().ok();
    let conn_id = idle.next_conn_id();
    let mut state = ConnState {
        registered: false,
        inflight: None,
    };

    let result = connection_loop(stream, &idle, &config, conn_id, &mut state).await;

    idle.remove(conn_id);
    if state.registered {
        idle.connected.fetch_sub(1, Ordering::AcqRel);
    }
    if let Some(cmd) = state.inflight.take() {
        let _ = cmd.events.send(RemoteEvent::Done(Err(FailurePayload::new(
            prism_registry::CODE_EXECUTION,
            "provider connection lost",
        ))));
    }
    match result {
        Ok(()) => info!(?peer, "provider disconnected"),
        Err(err) => warn!(?peer, %err, "provider connection failed"),
    }
}

async fn connection_loop(
    stream: TcpStream,
    idle: &Arc<IdlePool>,
    config: &SupervisorConfig,
    conn_id: u64,
    state: &mut ConnState,
) -> Result<(), SupervisorError> {
    let (reader, mut writer) = stream.into_split();
    let (msg_tx, mut msg_rx) = mpsc::channel::<Result<Message, SupervisorError>>(16);
    tokio::spawn(read_frames(reader, msg_tx));

    // Registration gate: nothing is pooled until the provider identifies
    // itself.
    let first = tokio::time::timeout(config.registration_timeout, msg_rx.recv())
        .await
        .map_err(|_| SupervisorError::Protocol("no registration before deadline".to_owned()))?
        .ok_or_else(|| {
            SupervisorError::Protocol("connection closed before registration".to_owned())
        })??;
    let Message::Registration(registration) = first else {
        return Err(SupervisorError::Protocol(
            "first message must be REGISTRATION".to_owned(),
        ));
    };
    info!(provider_id = %registration.provider_id, "provider registered");
    state.registered = true;
    idle.connected.fetch_add(1, Ordering::AcqRel);

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SubmitCmd>(1);
    let link = ProviderLink {
        provider_id: registration.provider_id,
        cmd_tx,
    };
    idle.push(conn_id, link.clone());

    let mut interval = tokio::time::interval(config.ping_interval);
    let mut last_pong = Instant::now();
    let mut nonce = 0u64;

    loop {
        tokio::select! {
            biased;
            maybe = msg_rx.recv() => {
                let Some(incoming) = maybe else { return Ok(()) };
                match incoming? {
                    Message::Pong(_) => last_pong = Instant::now(),
                    Message::Progress(progress) => {
                        if let Some(cmd) = &state.inflight {
                            let _ = cmd.events.send(RemoteEvent::Progress(progress.fraction));
                        }
                    }
                    Message::Result(result) => match state.inflight.take() {
                        Some(cmd) => {
                            let _ = cmd.events.send(RemoteEvent::Done(Ok(result.value)));
                            idle.push(conn_id, link.clone());
                        }
                        None => {
                            return Err(SupervisorError::Protocol(
                                "RESULT with no calculation in flight".to_owned(),
                            ))
                        }
                    },
                    Message::Failure(failure) => match state.inflight.take() {
                        Some(cmd) => {
                            let _ = cmd.events.send(RemoteEvent::Done(Err(FailurePayload::new(
                                failure.code,
                                failure.message,
                            ))));
                            idle.push(conn_id, link.clone());
                        }
                        None => {
                            return Err(SupervisorError::Protocol(
                                "FAILURE with no calculation in flight".to_owned(),
                            ))
                        }
                    },
                    other => {
                        return Err(SupervisorError::Protocol(format!(
                            "unexpected message tag {:#04x}",
                            other.tag()
                        )))
                    }
                }
            }
            maybe = cmd_rx.recv(), if state.inflight.is_none() => {
                let Some(cmd) = maybe else { return Ok(()) };
                let payload = FunctionPayload {
                    account: cmd.call.account.clone(),
                    app: cmd.call.app.clone(),
                    name: cmd.call.name.clone(),
                    args: cmd.call.args.clone(),
                    level: cmd.call.level,
                };
                write_message(&mut writer, &Message::Function(payload)).await?;
                state.inflight = Some(cmd);
            }
            _ = interval.tick() => {
                if last_pong.elapsed() > config.pong_timeout {
                    return Err(SupervisorError::Unresponsive);
                }
                nonce += 1;
                write_message(&mut writer, &Message::Ping(PingPayload { nonce })).await?;
            }
        }
    }
}

async fn read_frames(
    mut reader: OwnedReadHalf,
    frames: mpsc::Sender<Result<Message, SupervisorError>>,
) {
    loop {
        match read_message(&mut reader).await {
            Ok(Some(message)) => {
                if frames.send(Ok(message)).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                let _ = frames.send(Err(err)).await;
                return;
            }
        }
    }
}

/// Reads a single message if available. Returns `Ok(None)` on a clean close
/// before any bytes are read.
async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Message>, SupervisorError> {
    let mut header = [0u8; wire::HEADER_LEN];
    let mut read = 0usize;
    while read < header.len() {
        let n = reader.read(&mut header[read..]).await?;
        if n == 0 {
            if read == 0 {
                return Ok(None);
            }
            return Err(SupervisorError::Protocol(format!(
                "truncated frame header: read {read} of {} bytes",
                header.len()
            )));
        }
        read += n;
    }
    let len = wire::payload_len(&header)?.unwrap_or(0);
    let mut frame = vec![0u8; wire::HEADER_LEN + len];
    frame[..wire::HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut frame[wire::HEADER_LEN..]).await?;
    let (message, _used) = wire::decode_message(&frame)?;
    Ok(Some(message))
}

async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), SupervisorError> {
    let bytes = wire::encode_message(message)?;
    writer.write_all(&bytes).await?;
    Ok(())
}
