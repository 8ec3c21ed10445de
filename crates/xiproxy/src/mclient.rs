//! Per-server memcached client: a bounded budget of connection tasks, an
//! idle stack, a FIFO waiter queue, and client-wide error flagging with a
//! jittered retry timer.
//!
//! Each connection is one tokio task doing blocking-style reads; a
//! connection drives at most one operation at a time, so replies always
//! match the in-flight command.

use crate::moperation::{Category, MValue, McError, Operation, Reply};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

const MEMCACHE_PORT: u16 = 11211;
const DEFAULT_CON_NUM: usize = 6;
const MAX_CON_NUM: usize = 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const OPERATION_TIMEOUT: Duration = Duration::from_secs(2);
const CONNECT_INTERVAL: Duration = Duration::from_secs(1);
const RETRY_INTERVAL: Duration = Duration::from_secs(15);
const REAP_INTERVAL: Duration = Duration::from_secs(300);
const SLOW_MSEC: u128 = 400;

pub struct MClient {
    inner: Arc<Inner>,
}

struct Inner {
    service: String,
    server: String,
    host: String,
    port: u16,
    max_con: usize,
    state: Mutex<State>,
}

struct State {
    istack: Vec<oneshot::Sender<Operation>>,
    queue: VecDeque<Operation>,
    cons: usize,
    error: bool,
    err_count: usize,
    last_con_at: Option<Instant>,
    shutdown: bool,
}

/// Split a `host+port` server token; the port defaults to 11211.
fn split_server(server: &str) -> (String, u16) {
    match server.split_once('+') {
        Some((host, port)) => (
            host.to_string(),
            port.parse().ok().filter(|p| *p > 0).unwrap_or(MEMCACHE_PORT),
        ),
        None => (server.to_string(), MEMCACHE_PORT),
    }
}

impl MClient {
    pub fn new(service: &str, server: &str, max_con: usize) -> Self {
        let (host, port) = split_server(server);
        let max_con = match max_con {
            0 => DEFAULT_CON_NUM,
            n => n.min(MAX_CON_NUM),
        };
        Self {
            inner: Arc::new(Inner {
                service: service.to_string(),
                server: server.to_string(),
                host,
                port,
                max_con,
                state: Mutex::new(State {
                    istack: Vec::new(),
                    queue: VecDeque::new(),
                    cons: 0,
                    error: false,
                    err_count: 0,
                    last_con_at: None,
                    shutdown: false,
                }),
            }),
        }
    }

    pub fn server(&self) -> &str {
        &self.inner.server
    }

    pub fn error(&self) -> bool {
        self.inner.state.lock().unwrap().error
    }

    /// Hand an operation to an idle connection, or queue it and grow the
    /// connection budget. With the error flag raised, fail fast.
    pub fn process(&self, mut op: Operation) {
        let mut state = self.inner.state.lock().unwrap();
        if state.shutdown {
            drop(state);
            op.finish(Err(McError::Shutdown));
            return;
        }
        if state.error {
            drop(state);
            op.finish(Err(McError::NoServer));
            return;
        }

        while let Some(idle) = state.istack.pop() {
            match idle.send(op) {
                Ok(()) => return,
                // The parked task died; skim the stale entry and retry.
                Err(returned) => op = returned,
            }
        }

        state.queue.push_back(op);
        Inner::maybe_spawn(&self.inner, &mut state);
    }

    pub fn shutdown(&self) {
        let drained: Vec<Operation> = {
            let mut state = self.inner.state.lock().unwrap();
            state.shutdown = true;
            state.istack.clear();
            state.queue.drain(..).collect()
        };
        for op in drained {
            op.finish(Err(McError::Shutdown));
        }
    }
}

impl Inner {
    fn maybe_spawn(inner: &Arc<Self>, state: &mut State) {
        if state.cons >= inner.max_con {
            return;
        }
        let now = Instant::now();
        if let Some(last) = state.last_con_at {
            if now.duration_since(last) < CONNECT_INTERVAL {
                return;
            }
        }
        state.last_con_at = Some(now);
        state.cons += 1;
        let inner = inner.clone();
        tokio::spawn(async move { inner.run_connection().await });
    }

    async fn run_connection(self: Arc<Self>) {
        match self.connection_loop().await {
            Ok(()) => {
                // Graceful exit: shutdown or idle reap.
                self.state.lock().unwrap().cons -= 1;
            }
            Err(err) => {
                tracing::info!(server = %self.server, err = %err, "memcached connection failed");
                Inner::connection_error(&self);
            }
        }
    }

    async fn connection_loop(&self) -> Result<(), McError> {
        let socket = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| McError::Timeout)??;
        socket.set_nodelay(true)?;
        socket2::SockRef::from(&socket).set_keepalive(true)?;

        let (r, mut w) = socket.into_split();
        let mut r = BufReader::with_capacity(1024, r);

        // Liveness probe before accepting external operations.
        let (probe, _waiter) = Operation::version();
        self.execute(&mut r, &mut w, probe).await?;

        loop {
            let Some(op) = self.next_operation().await? else {
                return Ok(());
            };
            self.execute(&mut r, &mut w, op).await?;
        }
    }

    /// Pull the next operation: drain the queue, else park on the idle
    /// stack. Returns None for graceful exit (shutdown or idle reap).
    async fn next_operation(&self) -> Result<Option<Operation>, McError> {
        loop {
            let rx = {
                let mut state = self.state.lock().unwrap();
                if state.shutdown {
                    return Ok(None);
                }
                if let Some(op) = state.queue.pop_front() {
                    return Ok(Some(op));
                }
                // Reaching idle clears the client-wide error state.
                state.error = false;
                state.err_count = 0;
                let (tx, rx) = oneshot::channel();
                state.istack.push(tx);
                rx
            };

            match tokio::time::timeout(REAP_INTERVAL, rx).await {
                Ok(Ok(op)) => return Ok(Some(op)),
                // Our idle entry was dropped: the client errored or shut down.
                Ok(Err(_)) => return Ok(None),
                Err(_) => {
                    // Long idle: keep a single connection alive, reap extras.
                    let mut state = self.state.lock().unwrap();
                    state.istack.retain(|tx| !tx.is_closed());
                    if state.cons > 1 {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn execute(
        &self,
        r: &mut BufReader<OwnedReadHalf>,
        w: &mut OwnedWriteHalf,
        op: Operation,
    ) -> Result<(), McError> {
        let result = tokio::time::timeout(OPERATION_TIMEOUT, async {
            w.write_all(&op.command).await?;
            read_reply(r, op.category).await
        })
        .await;

        let elapsed = op.start.elapsed();
        if elapsed.as_millis() > SLOW_MSEC {
            tracing::warn!(
                server = %self.server,
                service = %self.service,
                caller = %op.caller,
                elapsed_msec = elapsed.as_millis() as u64,
                cmd = %op.command_line(),
                "slow memcached operation"
            );
        }

        match result {
            Ok(Ok(Outcome::Reply(reply))) => {
                // A second reply pending here can only mean we lost framing.
                if !r.buffer().is_empty() {
                    op.finish(Err(McError::Closed));
                    return Err(McError::Protocol(
                        "more data pending after a complete reply".to_string(),
                    ));
                }
                op.finish(Ok(reply));
                Ok(())
            }
            Ok(Ok(Outcome::Soft(line))) => {
                tracing::warn!(
                    server = %self.server,
                    line = %line,
                    cmd = %op.command_line(),
                    "memcached rejected command"
                );
                let reply = soft_failure(op.category);
                op.finish(Ok(reply));
                Ok(())
            }
            Ok(Err(err)) => {
                tracing::warn!(server = %self.server, err = %err, "memcached protocol failure");
                op.finish(Err(McError::Closed));
                Err(err)
            }
            Err(_) => {
                tracing::warn!(server = %self.server, cmd = %op.command_line(), "operation timeout");
                op.finish(Err(McError::Timeout));
                Err(McError::Timeout)
            }
        }
    }

    fn connection_error(inner: &Arc<Self>) {
        let mut failed: VecDeque<Operation> = VecDeque::new();
        {
            let mut state = inner.state.lock().unwrap();
            state.cons -= 1;
            state.err_count += 1;

            if (state.cons == 0 || state.err_count >= inner.max_con) && !state.shutdown {
                let retry = if state.error {
                    tracing::error!(server = %inner.server, "memcached server still unreachable");
                    RETRY_INTERVAL
                } else {
                    let half = RETRY_INTERVAL.as_millis() as u64 / 2;
                    Duration::from_millis(rand::thread_rng().gen_range(0..half) + 1)
                };
                state.error = true;
                state.istack.clear();
                std::mem::swap(&mut state.queue, &mut failed);

                let inner = inner.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(retry).await;
                    let mut state = inner.state.lock().unwrap();
                    if state.cons == 0 && !state.shutdown {
                        state.cons += 1;
                        state.last_con_at = Some(Instant::now());
                        let inner = inner.clone();
                        tokio::spawn(async move { inner.run_connection().await });
                    }
                });
            }
        }
        for op in failed {
            op.finish(Err(McError::NoServer));
        }
    }
}

enum Outcome {
    Reply(Reply),
    /// ERROR / CLIENT_ERROR: the command was rejected but the connection
    /// stays usable.
    Soft(String),
}

fn soft_failure(category: Category) -> Reply {
    match category {
        Category::Count => Reply::Count(None),
        Category::Get | Category::GetMulti => Reply::Values(Vec::new()),
        _ => Reply::Done(false),
    }
}

async fn read_line(r: &mut BufReader<OwnedReadHalf>) -> Result<String, McError> {
    let mut buf = Vec::new();
    let n = r.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Err(McError::Closed);
    }
    if n < 2 || buf[n - 2] != b'\r' {
        return Err(McError::Protocol(
            "reply line does not end with CRLF".to_string(),
        ));
    }
    buf.truncate(n - 2);
    String::from_utf8(buf).map_err(|_| McError::Protocol("reply line is not UTF-8".to_string()))
}

async fn read_reply(
    r: &mut BufReader<OwnedReadHalf>,
    category: Category,
) -> Result<Outcome, McError> {
    let line = read_line(r).await?;

    if line == "ERROR" || line.starts_with("CLIENT_ERROR") {
        return Ok(Outcome::Soft(line));
    }
    if line.starts_with("SERVER_ERROR") {
        return Err(McError::Protocol(line));
    }

    let reply = match category {
        Category::Version => {
            if !line.starts_with('V') {
                return Err(McError::Protocol(line));
            }
            Reply::Done(true)
        }
        Category::Store => match line.as_str() {
            "STORED" => Reply::Done(true),
            "NOT_STORED" => Reply::Done(false),
            _ => return Err(McError::Protocol(line)),
        },
        Category::Cas => match line.as_str() {
            "STORED" => Reply::Done(true),
            "EXISTS" | "NOT_FOUND" => Reply::Done(false),
            _ => return Err(McError::Protocol(line)),
        },
        Category::Delete => match line.as_str() {
            "DELETED" => Reply::Done(true),
            "NOT_FOUND" => Reply::Done(false),
            _ => return Err(McError::Protocol(line)),
        },
        Category::Count => {
            if line.as_bytes().first().map_or(false, u8::is_ascii_digit) {
                let value = line
                    .parse()
                    .map_err(|_| McError::Protocol(line.clone()))?;
                Reply::Count(Some(value))
            } else if line == "NOT_FOUND" {
                Reply::Count(None)
            } else {
                return Err(McError::Protocol(line));
            }
        }
        Category::Get | Category::GetMulti => {
            return read_values(r, line).await;
        }
    };
    Ok(Outcome::Reply(reply))
}

/// Parse `VALUE <key> <flags> <bytes> [<cas unique>]` blocks up to `END`.
async fn read_values(
    r: &mut BufReader<OwnedReadHalf>,
    mut line: String,
) -> Result<Outcome, McError> {
    let mut values = Vec::new();
    loop {
        if line == "END" {
            return Ok(Outcome::Reply(Reply::Values(values)));
        }

        let mut parts = line.split_ascii_whitespace();
        let (cmd, key, flags, bytes) = (parts.next(), parts.next(), parts.next(), parts.next());
        let cas = parts.next();
        if cmd != Some("VALUE") || parts.next().is_some() {
            return Err(McError::Protocol(line));
        }
        let (Some(key), Some(flags), Some(bytes)) = (key, flags, bytes) else {
            return Err(McError::Protocol(line));
        };
        let flags: u32 = flags.parse().map_err(|_| McError::Protocol(line.clone()))?;
        let len: usize = bytes.parse().map_err(|_| McError::Protocol(line.clone()))?;
        let revision: i64 = match cas {
            Some(cas) => cas.parse().map_err(|_| McError::Protocol(line.clone()))?,
            None => 0,
        };

        let mut value = vec![0u8; len + 2];
        r.read_exact(&mut value).await?;
        if &value[len..] != b"\r\n" {
            return Err(McError::Protocol(
                "value block does not end with CRLF".to_string(),
            ));
        }
        value.truncate(len);

        values.push(MValue {
            key: key.to_string(),
            value,
            revision,
            flags,
        });

        line = read_line(r).await?;
    }
}
