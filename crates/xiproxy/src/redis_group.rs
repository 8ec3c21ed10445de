//! Sharded Redis client group with the same appointment ladder as the
//! memcached group, plus MGET gather across servers.

use crate::redis_client::RedisClient;
use crate::redis_op::{RdsError, RedisOp, RedisOpWaiter, Replies};
use hseq::{Bucket, HashSequencer};
use std::collections::HashMap;
use std::sync::Arc;
use xic::Value;

const HASH_MASK: u32 = (1 << 16) - 1;
const LADDER: usize = 5;

pub struct RedisGroup {
    clients: Vec<Arc<RedisClient>>,
    hseq: HashSequencer,
}

impl RedisGroup {
    /// `servers` may start with `password^`, followed by whitespace-
    /// separated `host+port` tokens.
    pub fn new(service: &str, servers: &str) -> Self {
        let (password, servers) = match servers.split_once('^') {
            Some((password, rest)) => (password.trim(), rest),
            None => ("", servers),
        };

        let mut clients = Vec::new();
        let mut buckets = Vec::new();
        for token in servers.split_whitespace() {
            clients.push(Arc::new(RedisClient::new(service, token, password, 0)));
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
        op: RedisOp,
        waiter: RedisOpWaiter,
    ) -> Result<Replies, RdsError> {
        let Some(index) = self.appoint(key) else {
            return Err(RdsError::NoServer);
        };
        self.clients[index].process(op);
        waiter.await.map_err(|_| RdsError::Closed)?
    }

    pub async fn one_call(&self, caller: &str, key: &str, cmd: &[Value]) -> Result<Replies, RdsError> {
        let (op, waiter) = RedisOp::one_call(caller.to_string(), cmd)?;
        self.doit(key, op, waiter).await
    }

    pub async fn n_call(&self, caller: &str, key: &str, cmds: &[Value]) -> Result<Replies, RdsError> {
        let (op, waiter) = RedisOp::n_call(caller.to_string(), cmds)?;
        self.doit(key, op, waiter).await
    }

    pub async fn t_call(&self, caller: &str, key: &str, cmds: &[Value]) -> Result<Replies, RdsError> {
        let (op, waiter) = RedisOp::t_call(caller.to_string(), cmds)?;
        self.doit(key, op, waiter).await
    }

    pub async fn set(
        &self,
        caller: &str,
        key: &str,
        value: &[u8],
        expire: i64,
    ) -> Result<Replies, RdsError> {
        let (op, waiter) = RedisOp::set(caller.to_string(), key, value, expire);
        self.doit(key, op, waiter).await
    }

    pub async fn remove(&self, caller: &str, key: &str) -> Result<Replies, RdsError> {
        let (op, waiter) = RedisOp::remove(caller.to_string(), key);
        self.doit(key, op, waiter).await
    }

    pub async fn count(
        &self,
        caller: &str,
        verb: &'static str,
        key: &str,
        value: i64,
    ) -> Result<Replies, RdsError> {
        let (op, waiter) = RedisOp::count(caller.to_string(), verb, key, value);
        self.doit(key, op, waiter).await
    }

    pub async fn get(&self, caller: &str, key: &str) -> Result<Replies, RdsError> {
        let (op, waiter) = RedisOp::get(caller.to_string(), key);
        self.doit(key, op, waiter).await
    }

    /// Group keys by appointed server and MGET each group; a failed
    /// server contributes no values.
    pub async fn get_multi(&self, caller: &str, keys: &[String]) -> HashMap<String, Vec<u8>> {
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
                let (op, waiter) = RedisOp::mget(caller, &keys);
                client.process(op);
                let replies = waiter.await.map_err(|_| RdsError::Closed)??;
                Ok::<_, RdsError>((keys, replies))
            }
        });

        let mut values = HashMap::new();
        for outcome in futures::future::join_all(fetches).await {
            let Ok((keys, replies)) = outcome else {
                continue;
            };
            // The MGET reply is one list, entries matching keys by index.
            let Some(Value::List(entries)) = replies.into_iter().next() else {
                continue;
            };
            for (key, entry) in keys.into_iter().zip(entries) {
                if let Value::Blob(blob) = entry {
                    values.insert(key, blob);
                }
            }
        }
        values
    }

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
