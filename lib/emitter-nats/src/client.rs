//! NATS connection with a reader and a writer task

use crate::protocol::{
    encode_connect, encode_ping, encode_pong, encode_pub, encode_sub, encode_unsub,
    parse_info, parse_server_op, ConnectInfo, ServerOp, CRLF,
};
use crate::{NatsError, Result};
use async_trait::async_trait;
use emitter_core::{BusMessage, MessageBus, Subscription};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

const DEFAULT_PORT: u16 = 4222;

type Subscribers = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<BusMessage>>>>;

/// Connection settings
#[derive(Clone, Debug)]
pub struct NatsOptions {
    /// Server URLs, tried in order until one accepts the connection
    pub addresses: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Client name announced in CONNECT
    pub name: String,
    pub connect_timeout: Duration,
}

impl NatsOptions {
    /// Options for a comma-separated list of server URLs
    pub fn new(addresses: &str) -> Self {
        Self {
            addresses: addresses
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect(),
            username: None,
            password: None,
            name: "route-emitter".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Credentials used when a URL carries none
    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username.filter(|u| !u.is_empty());
        self.password = password.filter(|p| !p.is_empty());
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[derive(Debug, PartialEq, Eq)]
struct ServerAddress {
    host_port: String,
    user: Option<String>,
    pass: Option<String>,
}

fn parse_address(address: &str, options: &NatsOptions) -> Result<ServerAddress> {
    let with_scheme = if address.contains("://") {
        address.to_string()
    } else {
        format!("nats://{}", address)
    };
    let url = Url::parse(&with_scheme)
        .map_err(|e| NatsError::InvalidAddress(format!("{}: {}", address, e)))?;
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| NatsError::InvalidAddress(format!("{}: missing host", address)))?;

    let user = if url.username().is_empty() {
        options.username.clone()
    } else {
        Some(url.username().to_string())
    };
    let pass = url
        .password()
        .map(str::to_string)
        .or_else(|| options.password.clone());

    Ok(ServerAddress {
        host_port: format!("{}:{}", host, url.port().unwrap_or(DEFAULT_PORT)),
        user,
        pass,
    })
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> Result<String> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(NatsError::ConnectionClosed);
    }
    Ok(line)
}

/// Wait for INFO, send CONNECT and PING, and wait for the PONG. Returns the
/// server's payload limit.
async fn handshake(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    connect: &ConnectInfo,
) -> Result<usize> {
    let max_payload = match parse_server_op(&read_line(reader).await?)? {
        ServerOp::Info(body) => parse_info(&body)?.max_payload(),
        other => {
            return Err(NatsError::Protocol(format!("expected INFO, got {:?}", other)));
        }
    };

    writer.write_all(&encode_connect(connect)?).await?;
    writer.write_all(&encode_ping()).await?;

    loop {
        match parse_server_op(&read_line(reader).await?)? {
            ServerOp::Pong => return Ok(max_payload),
            ServerOp::Err(e) => return Err(NatsError::Server(e)),
            ServerOp::Msg { .. } => {
                return Err(NatsError::Protocol(
                    "MSG before handshake completed".to_string(),
                ));
            }
            ServerOp::Ok | ServerOp::Info(_) | ServerOp::Ping => {}
        }
    }
}

async fn read_payload<R: AsyncRead + Unpin>(
    reader: &mut R,
    size: usize,
    max_payload: usize,
) -> Result<Vec<u8>> {
    if size > max_payload {
        return Err(NatsError::Protocol(format!(
            "payload of {} bytes exceeds max_payload {}",
            size, max_payload
        )));
    }
    let len = size
        .checked_add(CRLF.len())
        .ok_or_else(|| NatsError::Protocol(format!("payload size {} overflows", size)))?;
    let mut payload = vec![0; len];
    reader.read_exact(&mut payload).await?;
    if !payload.ends_with(CRLF.as_bytes()) {
        return Err(NatsError::Protocol("payload not terminated by CRLF".to_string()));
    }
    payload.truncate(size);
    Ok(payload)
}

/// A connected NATS client. Cloning is not supported; share it behind an `Arc`.
pub struct NatsClient {
    server: String,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    subscribers: Subscribers,
    next_sid: AtomicU64,
    closed: CancellationToken,
}

impl NatsClient {
    /// Connect to the first reachable server in `options`
    pub async fn connect(options: NatsOptions) -> Result<Self> {
        let mut last_error = NatsError::InvalidAddress("no NATS addresses configured".to_string());
        for address in &options.addresses {
            match Self::connect_to(address, &options).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    warn!(address = %address, error = %e, "Failed to connect to NATS server");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn connect_to(address: &str, options: &NatsOptions) -> Result<Self> {
        let server = parse_address(address, options)?;
        let stream = timeout(options.connect_timeout, TcpStream::connect(&server.host_port))
            .await
            .map_err(|_| NatsError::Timeout(server.host_port.clone()))??;
        stream.set_nodelay(true)?;

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let connect = ConnectInfo {
            verbose: false,
            pedantic: false,
            user: server.user.clone(),
            pass: server.pass.clone(),
            name: options.name.clone(),
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: 1,
        };

        let max_payload = timeout(
            options.connect_timeout,
            handshake(&mut reader, &mut write_half, &connect),
        )
        .await
        .map_err(|_| NatsError::Timeout(server.host_port.clone()))??;

        let (writer, outgoing) = mpsc::unbounded_channel();
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        tokio::spawn(write_loop(write_half, outgoing, closed.clone()));
        tokio::spawn(read_loop(
            reader,
            writer.clone(),
            subscribers.clone(),
            closed.clone(),
            max_payload,
        ));

        info!(server = %server.host_port, max_payload, "Connected to NATS");
        Ok(Self {
            server: server.host_port,
            writer,
            subscribers,
            next_sid: AtomicU64::new(1),
            closed,
        })
    }

    /// Address of the connected server
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is lost or closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    fn send(&self, frame: Vec<u8>) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(NatsError::ConnectionClosed);
        }
        self.writer
            .send(frame)
            .map_err(|_| NatsError::ConnectionClosed)
    }

    fn subscribers(&self) -> Result<std::sync::MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<BusMessage>>>> {
        self.subscribers
            .lock()
            .map_err(|_| NatsError::Protocol("subscription table poisoned".to_string()))
    }
}

impl Drop for NatsClient {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl MessageBus for NatsClient {
    async fn publish(
        &self,
        subject: &str,
        reply_to: Option<&str>,
        payload: Vec<u8>,
    ) -> emitter_core::Result<()> {
        self.send(encode_pub(subject, reply_to, &payload)?)?;
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> emitter_core::Result<Subscription> {
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        let frame = encode_sub(subject, sid)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers()?.insert(sid, sender);
        if let Err(e) = self.send(frame) {
            self.subscribers()?.remove(&sid);
            return Err(e.into());
        }
        debug!(sid, subject, "Subscribed");
        Ok(Subscription { sid, receiver })
    }

    async fn unsubscribe(&self, sid: u64) -> emitter_core::Result<()> {
        self.subscribers()?.remove(&sid);
        self.send(encode_unsub(sid))?;
        Ok(())
    }
}

async fn write_loop(
    mut stream: OwnedWriteHalf,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = outgoing.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = stream.write_all(&frame).await {
            error!(error = %e, "Failed to write to NATS");
            break;
        }
    }
    let _ = stream.shutdown().await;
    closed.cancel();
}

async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    subscribers: Subscribers,
    closed: CancellationToken,
    mut max_payload: usize,
) {
    let result: Result<()> = loop {
        let line = tokio::select! {
            _ = closed.cancelled() => break Ok(()),
            line = read_line(&mut reader) => line,
        };
        let op = match line.and_then(|line| parse_server_op(&line)) {
            Ok(op) => op,
            Err(e) => break Err(e),
        };

        match op {
            ServerOp::Msg {
                subject,
                sid,
                reply_to,
                size,
            } => {
                let payload = match read_payload(&mut reader, size, max_payload).await {
                    Ok(payload) => payload,
                    Err(e) => break Err(e),
                };
                if let Ok(mut subs) = subscribers.lock() {
                    let delivered = subs.get(&sid).map(|tx| {
                        tx.send(BusMessage {
                            subject,
                            reply_to,
                            payload,
                        })
                        .is_ok()
                    });
                    if delivered == Some(false) {
                        subs.remove(&sid);
                    }
                }
            }
            ServerOp::Ping => {
                let _ = writer.send(encode_pong());
            }
            ServerOp::Err(e) => error!(error = %e, "NATS server error"),
            ServerOp::Info(body) => match parse_info(&body) {
                Ok(info) => max_payload = info.max_payload(),
                Err(e) => warn!(error = %e, "Ignoring server INFO"),
            },
            ServerOp::Pong | ServerOp::Ok => {}
        }
    };

    match result {
        Ok(()) => debug!("NATS reader stopped"),
        Err(e) => error!(error = %e, "NATS connection lost"),
    }
    closed.cancel();
    if let Ok(mut subs) = subscribers.lock() {
        subs.clear();
    }
}
