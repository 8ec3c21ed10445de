//! Per-server Redis client. Same pooling topology as the memcached
//! client, but speaking RESP: a resumable multi-bulk reader with bounded
//! nesting, and an AUTH exchange as the first command on fresh sockets.

use crate::redis_op::{RdsError, RedisOp, Replies};
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use xic::Value;

const REDIS_PORT: u16 = 6379;
const DEFAULT_CON_NUM: usize = 6;
const MAX_CON_NUM: usize = 1024;
const MAX_LEVEL: usize = 10;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const GIVEUP_TIMEOUT: Duration = Duration::from_secs(2);
const CONNECT_INTERVAL: Duration = Duration::from_secs(1);
const RETRY_INTERVAL: Duration = Duration::from_secs(15);
const REAP_INTERVAL: Duration = Duration::from_secs(300);
const SLOW_MSEC: u128 = 400;

pub struct RedisClient {
    inner: Arc<Inner>,
}

struct Inner {
    service: String,
    server: String,
    host: String,
    port: u16,
    password: String,
    max_con: usize,
    state: Mutex<State>,
}

struct State {
    istack: Vec<oneshot::Sender<RedisOp>>,
    queue: VecDeque<RedisOp>,
    cons: usize,
    error: bool,
    err_count: usize,
    last_con_at: Option<Instant>,
    shutdown: bool,
}

fn split_server(server: &str) -> (String, u16) {
    match server.split_once('+') {
        Some((host, port)) => (
            host.to_string(),
            port.parse().ok().filter(|p| *p > 0).unwrap_or(REDIS_PORT),
        ),
        None => (server.to_string(), REDIS_PORT),
    }
}

impl RedisClient {
    pub fn new(service: &str, server: &str, password: &str, max_con: usize) -> Self {
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
                password: password.to_string(),
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

    pub fn process(&self, mut op: RedisOp) {
        let mut state = self.inner.state.lock().unwrap();
        if state.shutdown {
            drop(state);
            op.finish(Err(RdsError::Shutdown));
            return;
        }

        while let Some(idle) = state.istack.pop() {
            match idle.send(op) {
                Ok(()) => return,
                Err(returned) => op = returned,
            }
        }

        state.queue.push_back(op);
        Inner::maybe_spawn(&self.inner, &mut state);
    }

    pub fn shutdown(&self) {
        let drained: Vec<RedisOp> = {
            let mut state = self.inner.state.lock().unwrap();
            state.shutdown = true;
            state.istack.clear();
            state.queue.drain(..).collect()
        };
        for op in drained {
            op.finish(Err(RdsError::Shutdown));
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
                self.state.lock().unwrap().cons -= 1;
            }
            Err(err) => {
                tracing::info!(server = %self.server, err = %err, "redis connection failed");
                Inner::connection_error(&self);
            }
        }
    }

    async fn connection_loop(&self) -> Result<(), RdsError> {
        let socket = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| RdsError::Timeout)??;
        socket.set_nodelay(true)?;
        socket2::SockRef::from(&socket).set_keepalive(true)?;

        let (r, mut w) = socket.into_split();
        let mut r = BufReader::with_capacity(1024, r);

        // Anything but +OK to AUTH fails the connection.
        if !self.password.is_empty() {
            let (op, _waiter) = RedisOp::auth(&self.password);
            let replies = self.roundtrip(&mut r, &mut w, &op).await?;
            match replies.first() {
                Some(Value::String(s)) if s == "+OK" => {}
                other => {
                    tracing::error!(server = %self.server, reply = ?other, "AUTH rejected");
                    return Err(RdsError::AuthFailed);
                }
            }
        }

        loop {
            let Some(op) = self.next_operation().await? else {
                return Ok(());
            };
            self.execute(&mut r, &mut w, op).await?;
        }
    }

    async fn next_operation(&self) -> Result<Option<RedisOp>, RdsError> {
        loop {
            let rx = {
                let mut state = self.state.lock().unwrap();
                if state.shutdown {
                    return Ok(None);
                }
                if let Some(op) = state.queue.pop_front() {
                    return Ok(Some(op));
                }
                state.error = false;
                state.err_count = 0;
                let (tx, rx) = oneshot::channel();
                state.istack.push(tx);
                rx
            };

            match tokio::time::timeout(REAP_INTERVAL, rx).await {
                Ok(Ok(op)) => return Ok(Some(op)),
                Ok(Err(_)) => return Ok(None),
                Err(_) => {
                    let mut state = self.state.lock().unwrap();
                    state.istack.retain(|tx| !tx.is_closed());
                    if state.cons > 1 {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn roundtrip(
        &self,
        r: &mut BufReader<OwnedReadHalf>,
        w: &mut OwnedWriteHalf,
        op: &RedisOp,
    ) -> Result<Replies, RdsError> {
        tokio::time::timeout(GIVEUP_TIMEOUT, async {
            w.write_all(&op.commands).await?;
            let mut replies = Vec::with_capacity(op.cmd_num);
            for _ in 0..op.cmd_num {
                replies.push(read_item(r, 0).await?);
            }
            if !r.buffer().is_empty() {
                return Err(RdsError::Protocol(
                    "more data pending after the last reply".to_string(),
                ));
            }
            Ok(replies)
        })
        .await
        .map_err(|_| RdsError::Timeout)?
    }

    async fn execute(
        &self,
        r: &mut BufReader<OwnedReadHalf>,
        w: &mut OwnedWriteHalf,
        op: RedisOp,
    ) -> Result<(), RdsError> {
        let result = self.roundtrip(r, w, &op).await;

        let elapsed = op.start.elapsed();
        if elapsed.as_millis() > SLOW_MSEC {
            tracing::warn!(
                server = %self.server,
                service = %self.service,
                caller = %op.caller,
                elapsed_msec = elapsed.as_millis() as u64,
                cmd = %op.command_line(),
                "slow redis operation"
            );
        }

        match result {
            Ok(replies) => {
                op.finish(Ok(replies));
                Ok(())
            }
            Err(err) => {
                tracing::warn!(server = %self.server, err = %err, cmd = %op.command_line(), "redis operation failed");
                op.finish(Err(RdsError::Closed));
                Err(err)
            }
        }
    }

    fn connection_error(inner: &Arc<Self>) {
        let mut failed: VecDeque<RedisOp> = VecDeque::new();
        {
            let mut state = inner.state.lock().unwrap();
            state.cons -= 1;
            state.err_count += 1;

            if (state.cons == 0 || state.err_count >= inner.max_con) && !state.shutdown {
                let retry = if state.error {
                    tracing::error!(server = %inner.server, "redis server still unreachable");
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
            op.finish(Err(RdsError::NoServer));
        }
    }
}

async fn read_line(r: &mut BufReader<OwnedReadHalf>) -> Result<String, RdsError> {
    let mut buf = Vec::new();
    let n = r.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Err(RdsError::Closed);
    }
    if n < 3 || buf[n - 2] != b'\r' {
        return Err(RdsError::Protocol(
            "reply line does not end with CRLF".to_string(),
        ));
    }
    buf.truncate(n - 2);
    String::from_utf8(buf).map_err(|_| RdsError::Protocol("reply line is not UTF-8".to_string()))
}

/// Read one RESP item. Simple strings and errors keep their sign byte and
/// map to `String`; bulk strings map to `Blob`, nils to `Null`, and
/// multi-bulk replies recurse up to `MAX_LEVEL` deep.
fn read_item(
    r: &mut BufReader<OwnedReadHalf>,
    level: usize,
) -> BoxFuture<'_, Result<Value, RdsError>> {
    async move {
        let line = read_line(r).await?;
        match line.as_bytes()[0] {
            b'+' | b'-' => Ok(Value::String(line)),
            b':' => line[1..]
                .parse()
                .map(Value::Int)
                .map_err(|_| RdsError::Protocol(line)),
            b'$' => {
                let len: i64 = line[1..]
                    .parse()
                    .map_err(|_| RdsError::Protocol(line.clone()))?;
                if len < 0 {
                    return Ok(Value::Null);
                }
                let mut chunk = vec![0u8; len as usize + 2];
                r.read_exact(&mut chunk).await?;
                if &chunk[len as usize..] != b"\r\n" {
                    return Err(RdsError::Protocol(
                        "bulk reply does not end with CRLF".to_string(),
                    ));
                }
                chunk.truncate(len as usize);
                Ok(Value::Blob(chunk))
            }
            b'*' => {
                if level >= MAX_LEVEL - 1 {
                    return Err(RdsError::Protocol(
                        "multi-bulk reply nesting too deep".to_string(),
                    ));
                }
                let num: i64 = line[1..]
                    .parse()
                    .map_err(|_| RdsError::Protocol(line.clone()))?;
                if num < 0 {
                    return Ok(Value::Null);
                }
                let mut items = Vec::with_capacity(num as usize);
                for _ in 0..num {
                    items.push(read_item(r, level + 1).await?);
                }
                Ok(Value::List(items))
            }
            _ => Err(RdsError::Protocol(format!("invalid reply, line={line}"))),
        }
    }
    .boxed()
}
