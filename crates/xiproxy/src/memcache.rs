//! Sharded memcached client group: key → server via the hash sequencer,
//! ladder failover around errored servers, and gather-style multi-get.

use crate::mclient::MClient;
use crate::moperation::{MValue, McError, Operation, OperationWaiter, Reply};
use hseq::{Bucket, HashSequencer};
use std::collections::HashMap;
use std::sync::Arc;

const HASH_MASK: u32 = (1 << 16) - 1;
/// Primary plus up to four successor ladder positions.
const LADDER: usize = 5;

pub struct StoreOutcome {
    pub ok: bool,
    pub zip: bool,
}

pub struct Memcache {
    clients: Vec<Arc<MClient>>,
    hseq: HashSequencer,
}

impl Memcache {
    /// `servers` is the whitespace-separated `host+port` token list from
    /// the service descriptor.
    pub fn new(service: &str, servers: &str) -> Self {
        let mut clients = Vec::new();
        let mut buckets = Vec::new();
        for token in servers.split_whitespace() {
            clients.push(Arc::new(MClient::new(service, token, 0)));
            buckets.push(Bucket::new(token.as_bytes().to_vec()));
        }
        Self {
            clients,
            hseq: HashSequencer::new(buckets, HASH_MASK).enable_cache(),
        }
    }

    pub fn shutdown(&self) {
        for client in &self.clients {
            client.shutdown();
        }
    }

    fn appoint(&self, key: &str) -> Option<usize> {
        let x = self.hseq.which(key.as_bytes())?;
        if !self.clients[x].error() {
            return Some(x);
        }
        self.hseq
            .sequence(key.as_bytes(), LADDER)
            .into_iter()
            .skip(1)
            .find(|&x| !self.clients[x].error())
    }

    async fn doit(
        &self,
        key: &str,
        op: Operation,
        waiter: OperationWaiter,
    ) -> Result<Reply, McError> {
        let Some(index) = self.appoint(key) else {
            tracing::warn!(key, "no healthy memcached server for key");
            return Err(McError::NoServer);
        };
        self.clients[index].process(op);
        waiter.await.map_err(|_| McError::Closed)?
    }

    pub async fn store(
        &self,
        verb: &'static str,
        caller: &str,
        key: &str,
        value: &[u8],
        expire: i64,
        flags: u32,
    ) -> Result<StoreOutcome, McError> {
        let (op, waiter) = Operation::store(verb, caller.to_string(), key, value, expire, flags);
        let zip = op.zip;
        match self.doit(key, op, waiter).await? {
            Reply::Done(ok) => Ok(StoreOutcome { ok, zip }),
            _ => Err(McError::Protocol("unexpected store reply".to_string())),
        }
    }

    pub async fn cas(
        &self,
        caller: &str,
        key: &str,
        value: &[u8],
        revision: i64,
        expire: i64,
        flags: u32,
    ) -> Result<StoreOutcome, McError> {
        let (op, waiter) = Operation::cas(caller.to_string(), key, value, revision, expire, flags);
        let zip = op.zip;
        match self.doit(key, op, waiter).await? {
            Reply::Done(ok) => Ok(StoreOutcome { ok, zip }),
            _ => Err(McError::Protocol("unexpected cas reply".to_string())),
        }
    }

    pub async fn concat(
        &self,
        verb: &'static str,
        caller: &str,
        key: &str,
        value: &[u8],
    ) -> Result<bool, McError> {
        let (op, waiter) = Operation::concat(verb, caller.to_string(), key, value);
        match self.doit(key, op, waiter).await? {
            Reply::Done(ok) => Ok(ok),
            _ => Err(McError::Protocol("unexpected concat reply".to_string())),
        }
    }

    pub async fn remove(&self, caller: &str, key: &str) -> Result<bool, McError> {
        let (op, waiter) = Operation::delete(caller.to_string(), key);
        match self.doit(key, op, waiter).await? {
            Reply::Done(ok) => Ok(ok),
            _ => Err(McError::Protocol("unexpected delete reply".to_string())),
        }
    }

    /// incr/decr; a negative delta is refused locally, and None means the
    /// key was absent upstream.
    pub async fn count(
        &self,
        verb: &'static str,
        caller: &str,
        key: &str,
        value: i64,
    ) -> Result<Option<i64>, McError> {
        if value < 0 {
            tracing::warn!(key, value, "memcached cannot count by a negative number");
            return Ok(None);
        }
        let (op, waiter) = Operation::count(verb, caller.to_string(), key, value);
        match self.doit(key, op, waiter).await? {
            Reply::Count(v) => Ok(v),
            _ => Err(McError::Protocol("unexpected count reply".to_string())),
        }
    }

    pub async fn get(&self, caller: &str, key: &str) -> Result<Option<MValue>, McError> {
        let (op, waiter) = Operation::get(caller.to_string(), key);
        match self.doit(key, op, waiter).await? {
            Reply::Values(mut values) => Ok(values.drain(..).next()),
            _ => Err(McError::Protocol("unexpected get reply".to_string())),
        }
    }

    /// Group keys by appointed server and gather one gets-multi per
    /// server. Keys with no healthy server, and servers that fail, just
    /// contribute no values.
    pub async fn get_multi(&self, caller: &str, keys: &[String]) -> Vec<MValue> {
        let mut grouped: HashMap<usize, Vec<String>> = HashMap::new();
        for key in keys {
            if let Some(index) = self.appoint(key) {
                grouped.entry(index).or_default().push(key.clone());
            }
        }

        let fetches = grouped.into_iter().map(|(index, keys)| {
            let client = self.clients[index].clone();
            let caller = caller.to_string();
            async move {
                let (op, waiter) = Operation::get_multi(caller, &keys);
                client.process(op);
                waiter.await.map_err(|_| McError::Closed)?
            }
        });

        let mut values = Vec::new();
        for outcome in futures::future::join_all(fetches).await {
            if let Ok(Reply::Values(batch)) = outcome {
                values.extend(batch);
            }
        }
        values
    }

    /// (actually appointed server, canonical primary) for a key.
    pub fn which_server(&self, key: &str) -> (String, String) {
        let Some(x) = self.hseq.which(key.as_bytes()) else {
            return (String::new(), String::new());
        };
        let canonical = self.clients[x].server().to_string();
        let real = self
            .appoint(key)
            .map(|i| self.clients[i].server().to_string())
            .unwrap_or_default();
        (real, canonical)
    }

    pub fn all_servers(&self) -> (Vec<String>, Vec<String>) {
        let mut all = Vec::new();
        let mut bad = Vec::new();
        for client in &self.clients {
            all.push(client.server().to_string());
            if client.error() {
                bad.push(client.server().to_string());
            }
        }
        (all, bad)
    }
}
