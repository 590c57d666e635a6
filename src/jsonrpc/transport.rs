//! Content-Length framed byte-stream transport.
//!
//! Frames look like LSP's: `Content-Length: <n>\r\n\r\n<json>`. One
//! [`Connection`] owns one engine; any failure on the stream, or a message
//! the engine rejects, ends the connection and closes the engine.

use std::io;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::engine::Engine;
use super::error::TransportError;
use super::handler::{NotificationHandler, RequestHandler};
use super::message::Message;

const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 1000;

/// Longest accepted header line, terminator included
pub const MAX_HEADER_LINE_BYTES: usize = 8 * 1024;

fn content_length_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^Content-Length:\s*(\d+)\s*$").expect("Content-Length pattern compiles")
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Largest accepted frame body; bigger frames end the connection
    pub max_frame_bytes: usize,
    /// How long shutdown waits for already queued outbound frames
    pub drain_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
        }
    }
}

/// Reads Content-Length framed bodies
pub struct FrameReader<R> {
    reader: BufReader<R>,
    max_frame_bytes: usize,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, config: &TransportConfig) -> Self {
        Self {
            reader: BufReader::new(reader),
            max_frame_bytes: config.max_frame_bytes,
            line: String::new(),
        }
    }

    /// Next frame body, or `None` on a clean EOF between frames.
    ///
    /// Headers other than Content-Length are skipped. A header line longer
    /// than [`MAX_HEADER_LINE_BYTES`] is an error.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut content_length = None;
        let mut in_header = false;

        loop {
            self.line.clear();
            let read = (&mut self.reader)
                .take(MAX_HEADER_LINE_BYTES as u64)
                .read_line(&mut self.line)
                .await?;
            if read == 0 {
                if in_header {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside a frame header",
                    )
                    .into());
                }
                return Ok(None);
            }
            if read == MAX_HEADER_LINE_BYTES && !self.line.ends_with('\n') {
                return Err(TransportError::InvalidHeader(format!(
                    "header line exceeds {} bytes",
                    MAX_HEADER_LINE_BYTES
                )));
            }

            let line = self.line.trim();
            if line.is_empty() {
                if in_header {
                    break;
                }
                continue;
            }
            in_header = true;

            if let Some(captures) = content_length_pattern().captures(line) {
                let size = captures[1]
                    .parse::<usize>()
                    .map_err(|_| TransportError::InvalidHeader(line.to_string()))?;
                content_length = Some(size);
            } else if !line.contains(':') {
                return Err(TransportError::InvalidHeader(line.to_string()));
            } else {
                trace!("Skipping header: {}", line);
            }
        }

        let size = content_length
            .ok_or_else(|| TransportError::InvalidHeader("missing Content-Length".to_string()))?;
        if size > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge {
                size,
                limit: self.max_frame_bytes,
            });
        }

        let mut body = vec![0u8; size];
        self.reader.read_exact(&mut body).await?;
        Ok(Some(body))
    }
}

/// Writes messages as Content-Length framed bodies
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_message(&mut self, message: &Message) -> Result<(), TransportError> {
        let body = serde_json::to_vec(message)?;
        self.write_frame(&body).await
    }

    pub async fn write_frame(&mut self, body: &[u8]) -> Result<(), TransportError> {
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(body).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Why a connection stopped
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// The peer closed its side of the stream
    Eof,
    /// [`Connection::shutdown`] or drop
    Requested,
    ReadFailed(Arc<TransportError>),
    WriteFailed(Arc<TransportError>),
}

/// One engine bound to one framed byte stream
pub struct Connection {
    engine: Engine,
    exit_tx: mpsc::UnboundedSender<ShutdownReason>,
    reason_rx: watch::Receiver<Option<ShutdownReason>>,
}

impl Connection {
    /// Start the read, write and supervisor tasks. Must be called inside a
    /// tokio runtime.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        config: TransportConfig,
        requests: impl RequestHandler,
        notifications: impl NotificationHandler,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let engine = Engine::new(outbound_tx, requests, notifications);

        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (reason_tx, reason_rx) = watch::channel(None);

        let read_handle = {
            let engine = engine.clone();
            let exit_tx = exit_tx.clone();
            let frames = FrameReader::new(reader, &config);
            tokio::spawn(async move {
                let reason = match read_loop(frames, engine).await {
                    Ok(()) => ShutdownReason::Eof,
                    Err(e) => {
                        error!("Read loop error: {}", e);
                        ShutdownReason::ReadFailed(Arc::new(e))
                    }
                };
                let _ = exit_tx.send(reason);
            })
        };

        let (closing_tx, closing_rx) = oneshot::channel();
        let write_handle = {
            let exit_tx = exit_tx.clone();
            let frames = FrameWriter::new(writer);
            tokio::spawn(async move {
                if let Err(e) = write_loop(frames, outbound_rx, closing_rx).await {
                    error!("Write loop error: {}", e);
                    let _ = exit_tx.send(ShutdownReason::WriteFailed(Arc::new(e)));
                }
            })
        };

        tokio::spawn(supervise(
            engine.clone(),
            exit_rx,
            reason_tx,
            read_handle,
            Drain {
                closing_tx,
                write_handle,
                timeout: Duration::from_millis(config.drain_timeout_ms),
            },
        ));

        Self {
            engine,
            exit_tx,
            reason_rx,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Wait until the connection has stopped and the engine is closed
    pub async fn closed(&self) -> ShutdownReason {
        let mut reason_rx = self.reason_rx.clone();
        let reason = match reason_rx.wait_for(Option::is_some).await {
            Ok(reason) => Option::clone(&reason).unwrap_or(ShutdownReason::Requested),
            Err(_) => ShutdownReason::Requested,
        };
        reason
    }

    /// Stop the connection and close the engine
    pub async fn shutdown(&self) -> ShutdownReason {
        info!("Shutdown requested");
        let _ = self.exit_tx.send(ShutdownReason::Requested);
        self.closed().await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.exit_tx.send(ShutdownReason::Requested);
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut frames: FrameReader<R>,
    engine: Engine,
) -> Result<(), TransportError> {
    while let Some(body) = frames.read_frame().await? {
        if engine.is_closed() {
            debug!("Engine closed, terminating read loop");
            return Ok(());
        }

        let value: Value = serde_json::from_slice(&body)?;
        trace!("Received: {}", value);
        engine.received_message(&value)?;
    }

    debug!("EOF reached, terminating read loop");
    Ok(())
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut frames: FrameWriter<W>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    mut closing: oneshot::Receiver<()>,
) -> Result<(), TransportError> {
    loop {
        tokio::select! {
            biased;
            message = outbound.recv() => match message {
                Some(message) => {
                    trace!("Sending: {:?}", message);
                    frames.write_message(&message).await?;
                }
                None => {
                    debug!("Outbound channel closed, terminating write loop");
                    return Ok(());
                }
            },
            _ = &mut closing => break,
        }
    }

    // エンジンは閉じているので新たな送信は積まれない
    while let Ok(message) = outbound.try_recv() {
        trace!("Draining: {:?}", message);
        frames.write_message(&message).await?;
    }
    debug!("Outbound queue drained, terminating write loop");
    Ok(())
}

/// Write-side teardown handed to the supervisor
struct Drain {
    closing_tx: oneshot::Sender<()>,
    write_handle: JoinHandle<()>,
    timeout: Duration,
}

// 接続がエンジンを閉じる唯一の場所
async fn supervise(
    engine: Engine,
    mut exit_rx: mpsc::UnboundedReceiver<ShutdownReason>,
    reason_tx: watch::Sender<Option<ShutdownReason>>,
    read_handle: JoinHandle<()>,
    drain: Drain,
) {
    let reason = exit_rx
        .recv()
        .await
        .unwrap_or(ShutdownReason::Requested);

    // エンジンを閉じる前に読み取りタスクを終わらせる
    read_handle.abort();
    let _ = read_handle.await;

    if engine.is_closed() {
        warn!("Engine was closed outside its connection");
    } else {
        debug!("Closing engine: {:?}", reason);
        engine.close();
    }

    let Drain {
        closing_tx,
        mut write_handle,
        timeout,
    } = drain;
    let _ = closing_tx.send(());
    if tokio::time::timeout(timeout, &mut write_handle).await.is_err() {
        warn!("Outbound queue not drained within {:?}, dropping it", timeout);
        write_handle.abort();
    }

    let _ = reason_tx.send(Some(reason));
}
