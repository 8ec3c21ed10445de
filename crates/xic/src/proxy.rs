use crate::{codec, Answer, Endpoint, Error, Message, Quest};
use bytes::Bytes;
use futures::{SinkExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_QUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Client side of the quest/answer transport: one live connection at a
/// time over an ordered endpoint list, a pending-call map, and explicit
/// connection reset so the next emit dials the next endpoint.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<Inner>,
}

struct Inner {
    /// Service name stamped on emitted quests (the wire identity, which
    /// may differ from the registry identity for `~variant` services).
    service: String,
    endpoints: Vec<Endpoint>,
    conn: tokio::sync::Mutex<Option<Conn>>,
    pending: Mutex<HashMap<i64, oneshot::Sender<Answer>>>,
    next_txid: AtomicI64,
    cursor: AtomicUsize,
    generation: AtomicU64,
    quest_timeout: Duration,
}

#[derive(Clone)]
struct Conn {
    tx: tokio::sync::mpsc::Sender<Bytes>,
    endpoint: Endpoint,
    generation: u64,
}

impl Proxy {
    pub fn new(service: impl Into<String>, endpoints: Vec<Endpoint>) -> Self {
        Self {
            inner: Arc::new(Inner {
                service: service.into(),
                endpoints,
                conn: tokio::sync::Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_txid: AtomicI64::new(1),
                cursor: AtomicUsize::new(0),
                generation: AtomicU64::new(0),
                quest_timeout: DEFAULT_QUEST_TIMEOUT,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    /// `service @endpoint@endpoint…` description for info answers.
    pub fn describe(&self) -> String {
        let mut out = self.inner.service.clone();
        for ep in &self.inner.endpoints {
            out.push('@');
            out.push_str(&ep.to_string());
        }
        out
    }

    /// The endpoint the live connection uses, if any.
    pub async fn current_endpoint(&self) -> Option<Endpoint> {
        self.inner.conn.lock().await.as_ref().map(|c| c.endpoint.clone())
    }

    /// Emit a quest and await its answer. Oneway quests resolve to an
    /// empty answer as soon as the frame is written.
    pub async fn emit(&self, mut quest: Quest) -> crate::Result<Answer> {
        quest.service = self.inner.service.clone();

        let oneway = quest.is_oneway();
        if !oneway {
            quest.txid = self.inner.next_txid.fetch_add(1, Ordering::Relaxed);
        }

        let conn = self.ensure_conn().await?;

        let rx = if oneway {
            None
        } else {
            let (tx, rx) = oneshot::channel();
            self.inner.pending.lock().unwrap().insert(quest.txid, tx);
            Some(rx)
        };

        if conn.tx.send(codec::encode_quest(&quest)).await.is_err() {
            self.inner.pending.lock().unwrap().remove(&quest.txid);
            return Err(Error::ConnectionClosed);
        }

        let Some(rx) = rx else {
            return Ok(Answer::empty());
        };

        match tokio::time::timeout(self.inner.quest_timeout, rx).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.inner.pending.lock().unwrap().remove(&quest.txid);
                Err(Error::Timeout("answer"))
            }
        }
    }

    /// Drop the live connection and advance to the next endpoint. Pending
    /// calls on the old connection fail with `ConnectionClosed`.
    pub async fn reset_connection(&self) {
        let mut slot = self.inner.conn.lock().await;
        if slot.take().is_some() {
            self.inner.generation.fetch_add(1, Ordering::Relaxed);
            self.inner.cursor.fetch_add(1, Ordering::Relaxed);
        }
        drop(slot);
        self.inner.fail_pending();
    }

    async fn ensure_conn(&self) -> crate::Result<Conn> {
        let mut slot = self.inner.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let n = self.inner.endpoints.len();
        if n == 0 {
            return Err(Error::InvalidEndpoint("no endpoints".to_string()));
        }

        let mut last_err = Error::ConnectionClosed;
        for attempt in 0..n {
            let index = (self.inner.cursor.load(Ordering::Relaxed) + attempt) % n;
            let endpoint = self.inner.endpoints[index].clone();
            match self.dial(&endpoint).await {
                Ok(conn) => {
                    self.inner.cursor.store(index, Ordering::Relaxed);
                    *slot = Some(conn.clone());
                    return Ok(conn);
                }
                Err(err) => {
                    tracing::warn!(service = %self.inner.service, endpoint = %endpoint, err = %err, "dial failed");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    async fn dial(&self, endpoint: &Endpoint) -> crate::Result<Conn> {
        let connect_timeout = match endpoint.connect_timeout_msec {
            0 => DEFAULT_CONNECT_TIMEOUT,
            msec => Duration::from_millis(msec as u64),
        };
        let socket = tokio::time::timeout(
            connect_timeout,
            tokio::net::TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| Error::Timeout("connect"))??;

        socket.set_nodelay(true)?;
        socket2::SockRef::from(&socket).set_keepalive(true)?;

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (r, w) = socket.into_split();
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Bytes>(64);

        tokio::spawn(async move {
            let mut w = FramedWrite::new(w, proxy_codec());
            while let Some(frame) = rx.recv().await {
                if w.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut r = FramedRead::new(r, proxy_codec());
            loop {
                match r.try_next().await {
                    Ok(Some(frame)) => match codec::decode_message(&frame) {
                        Ok(Message::Answer(answer)) => {
                            let waiter = inner.pending.lock().unwrap().remove(&answer.txid);
                            if let Some(waiter) = waiter {
                                let _ = waiter.send(answer);
                            }
                        }
                        Ok(Message::Quest(_)) => {
                            tracing::warn!(service = %inner.service, "unexpected quest frame from upstream");
                        }
                        Err(err) => {
                            tracing::warn!(service = %inner.service, err = %err, "bad frame from upstream");
                            break;
                        }
                    },
                    Ok(None) => break,
                    Err(err) => {
                        tracing::info!(service = %inner.service, err = %err, "upstream connection lost");
                        break;
                    }
                }
            }

            // Only clear the slot if no newer connection replaced us.
            let mut slot = inner.conn.lock().await;
            if slot
                .as_ref()
                .map(|c| c.generation == generation)
                .unwrap_or(false)
            {
                *slot = None;
            }
            drop(slot);
            inner.fail_pending();
        });

        Ok(Conn {
            tx,
            endpoint: endpoint.clone(),
            generation,
        })
    }
}

impl Inner {
    fn fail_pending(&self) {
        let waiters: Vec<_> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().collect()
        };
        for (txid, waiter) in waiters {
            let mut answer = Answer::from_error(&Error::ConnectionClosed, &self.service, "");
            answer.txid = txid;
            let _ = waiter.send(answer);
        }
    }
}

fn proxy_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(1 << 27)
        .new_codec()
}
