// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Calc provider runtime: executes registry functions for a supervisor.
//!
//! A provider connects out to the supervisor's address, identifies itself
//! with `REGISTRATION`, then serves one calculation at a time. Each
//! `FUNCTION` runs on a dedicated worker thread; the connection task keeps
//! draining the socket so a `PING` is answered with `PONG` immediately,
//! never waiting on the in-progress calculation.

use std::sync::Arc;

use prism_calc_proto::{
    wire, FailurePayload, FunctionPayload, Message, PongPayload, ProgressPayload,
    RegistrationPayload, ResultPayload,
};
use prism_registry::{CalcError, CallContext, CancelToken, Registry, CODE_EXECUTION};
use prism_request::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Provider-side configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Stable identity sent in the registration message.
    pub provider_id: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_id: format!("prism-provider-{}", std::process::id()),
        }
    }
}

/// Why the provider connection ended.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Socket failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Framing or codec failure. Fatal to the connection.
    #[error("wire: {0}")]
    Wire(#[from] wire::WireError),
    /// Out-of-sequence or unexpected message. Fatal to the connection.
    #[error("protocol: {0}")]
    Protocol(String),
}

enum WorkerEvent {
    Progress(f64),
    Done(Result<Value, CalcError>),
}

/// Connects to the supervisor at `addr` and serves calculations until the
/// connection closes.
pub async fn run_provider(
    addr: &str,
    config: ProviderConfig,
    registry: Arc<Registry>,
) -> Result<(), ProviderError> {
    let stream = TcpStream::connect(addr).await?;
    info!(addr, provider_id = %config.provider_id, "connected to supervisor");
    serve_connection(stream, config, registry).await
}

/// Serves one supervisor connection: registration, then the request loop.
pub async fn serve_connection(
    stream: TcpStream,
    config: ProviderConfig,
    registry: Arc<Registry>,
) -> Result<(), ProviderError> {
    let (reader, mut writer) = stream.into_split();

    write_message(
        &mut writer,
        &Message::Registration(RegistrationPayload {
            provider_id: config.provider_id.clone(),
        }),
    )
    .await?;

    // Frames are decoded on a separate task so the loop below can keep
    // serving pings while a calculation is in flight.
    let (frame_tx, mut frame_rx) = mpsc::channel::<Result<Message, ProviderError>>(16);
    tokio::spawn(read_frames(reader, frame_tx));

    let (event_tx, mut event_rx) = mpsc::channel::<WorkerEvent>(64);
    let mut busy = false;

    loop {
        tokio::select! {
            biased;
            frame = frame_rx.recv() => {
                let Some(frame) = frame else { break };
                match frame? {
                    Message::Ping(ping) => {
                        write_message(
                            &mut writer,
                            &Message::Pong(PongPayload { nonce: ping.nonce }),
                        )
                        .await?;
                    }
                    Message::Function(function) => {
                        if busy {
                            return Err(ProviderError::Protocol(
                                "FUNCTION received while a calculation is in flight".into(),
                            ));
                        }
                        busy = true;
                        spawn_worker(function, Arc::clone(&registry), event_tx.clone());
                    }
                    other => {
                        return Err(ProviderError::Protocol(format!(
                            "unexpected message tag {:#04x}",
                            other.tag()
                        )))
                    }
                }
            }
            event = event_rx.recv(), if busy => {
                let Some(event) = event else { break };
                match event {
                    WorkerEvent::Progress(fraction) => {
                        write_message(
                            &mut writer,
                            &Message::Progress(ProgressPayload { fraction }),
                        )
                        .await?;
                    }
                    WorkerEvent::Done(Ok(value)) => {
                        busy = false;
                        write_message(&mut writer, &Message::Result(ResultPayload { value }))
                            .await?;
                    }
                    WorkerEvent::Done(Err(err)) => {
                        busy = false;
                        write_message(
                            &mut writer,
                            &Message::Failure(FailurePayload {
                                code: err.code,
                                message: err.message,
                            }),
                        )
                        .await?;
                    }
                }
            }
        }
    }
    info!(provider_id = %config.provider_id, "supervisor connection closed");
    Ok(())
}

/// Runs one function call on a dedicated worker thread, posting progress
/// and the terminal result onto the connection's event queue.
fn spawn_worker(
    function: FunctionPayload,
    registry: Arc<Registry>,
    events: mpsc::Sender<WorkerEvent>,
) {
    let worker_events = events.clone();
    let spawned = std::thread::Builder::new()
        .name("prism-provider-worker".to_owned())
        .spawn(move || {
            let progress = worker_events.clone();
            let ctx = CallContext::new(CancelToken::new(), move |fraction| {
                let _ = progress.blocking_send(WorkerEvent::Progress(fraction));
            });
            debug!(name = %function.name, account = %function.account, app = %function.app, "executing function");
            let result = match registry.lookup(&function.name) {
                Some(callable) => callable.call(&ctx, &function.args),
                None => Err(CalcError::unknown_function(&function.name)),
            };
            let _ = worker_events.blocking_send(WorkerEvent::Done(result));
        });
    if let Err(err) = spawned {
        warn!(?err, "failed to spawn calculation worker");
        // try_send: this path runs on the runtime thread.
        let _ = events.try_send(WorkerEvent::Done(Err(CalcError::new(
            CODE_EXECUTION,
            "failed to spawn calculation worker",
        ))));
    }
}

async fn read_frames(
    mut reader: OwnedReadHalf,
    frames: mpsc::Sender<Result<Message, ProviderError>>,
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

/// Reads a single message if available. Returns `Ok(None)` when the stream
/// closes before any bytes are read. Reads until a full frame header is
/// buffered so short reads cannot desynchronize framing.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Message>, ProviderError> {
    let mut header = [0u8; wire::HEADER_LEN];
    let mut read = 0usize;
    while read < header.len() {
        let n = reader.read(&mut header[read..]).await?;
        if n == 0 {
            if read == 0 {
                return Ok(None);
            }
            return Err(ProviderError::Protocol(format!(
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

/// Encodes and writes one complete frame.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), ProviderError> {
    let bytes = wire::encode_message(message)?;
    writer.write_all(&bytes).await?;
    Ok(())
}
