use crate::{codec, Answer, Message, Quest};
use futures::{SinkExt, TryStreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

/// Per-quest call context handed to servants.
#[derive(Debug, Clone)]
pub struct Current {
    /// `proto/local/peer` transport description of the inbound connection,
    /// stable for its lifetime. Used for stickiness keys and logging.
    pub con_info: String,
    pub peer: std::net::SocketAddr,
}

/// A named handler of quests. The returned answer's txid is stamped by the
/// serving loop; an `Err` is converted into a status-bearing answer.
#[async_trait::async_trait]
pub trait Servant: Send + Sync + 'static {
    async fn process(&self, quest: Quest, current: &Current) -> anyhow::Result<Answer>;
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_connections: usize,
    pub idle_timeout: std::time::Duration,
    pub max_frame_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            idle_timeout: std::time::Duration::from_secs(300),
            max_frame_length: 1 << 27, // 128 MiB
        }
    }
}

fn frame_codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(max_frame_length)
        .new_codec()
}

/// Accept and serve quest/answer sessions until `stop` is cancelled.
pub async fn serve(
    listener: TcpListener,
    dispatcher: Arc<dyn Servant>,
    config: ServerConfig,
    stop: CancellationToken,
) -> anyhow::Result<()> {
    let connection_limit = Arc::new(tokio::sync::Semaphore::new(config.max_connections));

    loop {
        tokio::select! {
            accept = listener.accept() => {
                let Ok((socket, addr)) = accept else {
                    continue;
                };
                let permit = match connection_limit.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!(%addr, "connection limit reached, rejecting connection");
                        continue;
                    }
                };

                let dispatcher = dispatcher.clone();
                let config = config.clone();
                let stop = stop.child_token();
                tokio::spawn(async move {
                    if let Err(err) = session(socket, addr, dispatcher, config, stop).await {
                        tracing::info!(%addr, err = format!("{err:#}"), "session ended");
                    }
                    drop(permit);
                });
            }
            _ = stop.cancelled() => return Ok(()),
        }
    }
}

async fn session(
    socket: TcpStream,
    addr: std::net::SocketAddr,
    dispatcher: Arc<dyn Servant>,
    config: ServerConfig,
    stop: CancellationToken,
) -> anyhow::Result<()> {
    socket.set_nodelay(true)?;
    let local = socket.local_addr()?;
    let current = Current {
        con_info: format!("tcp/{local}/{addr}"),
        peer: addr,
    };
    let max_frame_length = config.max_frame_length;
    let idle_timeout = config.idle_timeout;

    let (r, w) = socket.into_split();
    let mut r = FramedRead::new(r, frame_codec(max_frame_length));

    // Answers funnel through one writer task so concurrently processed
    // quests never interleave partial frames.
    let (answer_tx, mut answer_rx) = tokio::sync::mpsc::channel::<Answer>(64);
    let writer = tokio::spawn(async move {
        let mut w = FramedWrite::new(w, frame_codec(max_frame_length));
        while let Some(answer) = answer_rx.recv().await {
            if let Err(err) = w.send(codec::encode_answer(&answer)).await {
                tracing::warn!(err = %err, "failed to write answer frame");
                break;
            }
        }
        let _ = w.flush().await;
    });

    let result: anyhow::Result<()> = async {
        loop {
            tokio::select! {
                frame = r.try_next() => {
                    let Some(frame) = frame? else {
                        return Ok(());
                    };
                    let quest = match codec::decode_message(&frame)? {
                        Message::Quest(quest) => quest,
                        Message::Answer(_) => {
                            anyhow::bail!("unexpected answer frame on serving connection");
                        }
                    };

                    let dispatcher = dispatcher.clone();
                    let answer_tx = answer_tx.clone();
                    let current = current.clone();
                    tokio::spawn(async move {
                        let txid = quest.txid;
                        let (service, method) = (quest.service.clone(), quest.method.clone());
                        let mut answer = match dispatcher.process(quest, &current).await {
                            Ok(answer) => answer,
                            Err(err) => Answer::from_anyhow(&err, &service, &method),
                        };
                        if txid != 0 {
                            answer.txid = txid;
                            let _ = answer_tx.send(answer).await;
                        }
                    });
                }
                _ = tokio::time::sleep(idle_timeout) => {
                    anyhow::bail!("timeout waiting for next session quest");
                }
                _ = stop.cancelled() => {
                    anyhow::bail!("signalled to stop");
                }
            }
        }
    }
    .await;

    drop(answer_tx);
    let _ = writer.await;
    result
}
