//! Internal servant exposing the sharded memcached group as RPC methods,
//! with the shared answer/value cache layered in front of reads.

use crate::big_servant::RevServant;
use crate::clock::now_ms;
use crate::lz4codec;
use crate::memcache::Memcache;
use crate::moperation::{MValue, FLAG_LZ4_ZIP};
use rcache::{RCache, RData, RKey, RKind};
use std::sync::Arc;
use xic::{Answer, Current, Dict, DictExt, Quest, Value};

const ZIP_THRESHOLD: usize = lz4codec::ZIP_THRESHOLD;
const LARGE_VALUE_WARNING: usize = 1024 * 1024 - 256;

pub struct MCache {
    service: String,
    revision: i64,
    servers: String,
    memcache: Memcache,
    rcache: Arc<RCache>,
}

impl MCache {
    pub fn new(service: &str, revision: i64, servers: &str, rcache: Arc<RCache>) -> Self {
        Self {
            service: service.to_string(),
            revision,
            servers: servers.to_string(),
            memcache: Memcache::new(service, servers),
            rcache,
        }
    }

    fn caller(quest: &Quest) -> String {
        quest.ctx.get_str("CALLER").unwrap_or_default().to_string()
    }

    fn store_flags(args: &Dict, value: &[u8]) -> u32 {
        let nozip = args.get_bool("nozip");
        if !nozip && value.len() > ZIP_THRESHOLD {
            FLAG_LZ4_ZIP
        } else {
            0
        }
    }

    /// Unzip a fetched value when its flag bit says so. A framing or
    /// checksum violation yields the raw value with a warning.
    fn unzip(&self, mut mv: MValue) -> (MValue, bool) {
        if !mv.zipped() {
            return (mv, false);
        }
        match lz4codec::attempt_unzip(&mv.value) {
            Ok(plain) => {
                mv.value = plain;
                mv.flags &= !FLAG_LZ4_ZIP;
                (mv, true)
            }
            Err(err) => {
                tracing::warn!(
                    service = %self.service,
                    key = %mv.key,
                    flags = mv.flags,
                    %err,
                    "failed to decompress value, passing it through raw"
                );
                mv.flags &= !FLAG_LZ4_ZIP;
                (mv, true)
            }
        }
    }

    fn fill_rcache(&self, key: &str, value: &[u8]) {
        let rkey = RKey::mcache(self.service.as_bytes(), key.as_bytes());
        self.rcache
            .replace(rkey, RData::new(now_ms(), RKind::MCache, value.to_vec()));
    }

    /// A fresh RCache hit for `key`, honoring the 1-second cap on
    /// status-bearing entries. `Some(None)` means a cached failure.
    fn rcache_hit(&self, key: &str, cache_secs: i64) -> Option<Option<RData>> {
        let rkey = RKey::mcache(self.service.as_bytes(), key.as_bytes());
        let rdata = self.rcache.find(&rkey)?;
        if rdata.kind() != RKind::MCache {
            return None;
        }
        let ttl_secs = if rdata.status() != 0 { 1 } else { cache_secs };
        if now_ms().saturating_sub(rdata.ctime()) >= ttl_secs as u64 * 1000 {
            return None;
        }
        if rdata.status() != 0 {
            Some(None)
        } else {
            Some(Some(rdata))
        }
    }

    async fn set(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let args = &quest.args;
        let key = prepare_key(quest, args.want_str("key")?)?;
        let value = args.want_blob("value")?;
        warn_large_value(quest, &key, value);
        let expire = args.get_int("expire");
        let flags = Self::store_flags(args, value);

        let cache = quest.ctx.get_int("CACHE");
        let rkey = RKey::mcache(self.service.as_bytes(), key.as_bytes());
        if cache != 0 {
            self.rcache
                .replace(rkey, RData::new(now_ms(), RKind::MCache, value.to_vec()));
        } else {
            self.rcache.remove(&rkey);
        }

        let out = self
            .memcache
            .store("set", &Self::caller(quest), &key, value, expire, flags)
            .await?;
        let mut answer = Dict::new();
        answer.insert("ok".to_string(), Value::Bool(out.ok));
        answer.insert("_zip".to_string(), Value::Bool(out.zip));
        Ok(Answer::ok(answer))
    }

    async fn store_like(&self, verb: &'static str, quest: &Quest) -> anyhow::Result<Answer> {
        let args = &quest.args;
        let key = prepare_key(quest, args.want_str("key")?)?;
        let value = args.want_blob("value")?;
        warn_large_value(quest, &key, value);
        let expire = args.get_int("expire");
        let flags = Self::store_flags(args, value);

        self.rcache
            .remove(&RKey::mcache(self.service.as_bytes(), key.as_bytes()));

        let out = self
            .memcache
            .store(verb, &Self::caller(quest), &key, value, expire, flags)
            .await?;
        let mut answer = Dict::new();
        answer.insert("ok".to_string(), Value::Bool(out.ok));
        answer.insert("_zip".to_string(), Value::Bool(out.zip));
        Ok(Answer::ok(answer))
    }

    async fn concat_like(&self, verb: &'static str, quest: &Quest) -> anyhow::Result<Answer> {
        let args = &quest.args;
        let key = prepare_key(quest, args.want_str("key")?)?;
        let value = args.want_blob("value")?;

        self.rcache
            .remove(&RKey::mcache(self.service.as_bytes(), key.as_bytes()));

        let ok = self
            .memcache
            .concat(verb, &Self::caller(quest), &key, value)
            .await?;
        let mut answer = Dict::new();
        answer.insert("ok".to_string(), Value::Bool(ok));
        Ok(Answer::ok(answer))
    }

    async fn cas(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let args = &quest.args;
        let key = prepare_key(quest, args.want_str("key")?)?;
        let value = args.want_blob("value")?;
        warn_large_value(quest, &key, value);
        let revision = args.want_int("revision")?;
        let expire = args.get_int("expire");
        let flags = Self::store_flags(args, value);

        self.rcache
            .remove(&RKey::mcache(self.service.as_bytes(), key.as_bytes()));

        let out = self
            .memcache
            .cas(&Self::caller(quest), &key, value, revision, expire, flags)
            .await?;
        let mut answer = Dict::new();
        answer.insert("ok".to_string(), Value::Bool(out.ok));
        answer.insert("_zip".to_string(), Value::Bool(out.zip));
        Ok(Answer::ok(answer))
    }

    async fn delete(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let key = prepare_key(quest, quest.args.want_str("key")?)?;
        self.rcache
            .remove(&RKey::mcache(self.service.as_bytes(), key.as_bytes()));

        let ok = self.memcache.remove(&Self::caller(quest), &key).await?;
        let mut answer = Dict::new();
        answer.insert("ok".to_string(), Value::Bool(ok));
        Ok(Answer::ok(answer))
    }

    async fn count_like(&self, verb: &'static str, quest: &Quest) -> anyhow::Result<Answer> {
        let args = &quest.args;
        let key = prepare_key(quest, args.want_str("key")?)?;
        let value = args.want_int("value")?;

        self.rcache
            .remove(&RKey::mcache(self.service.as_bytes(), key.as_bytes()));

        let result = self
            .memcache
            .count(verb, &Self::caller(quest), &key, value)
            .await?;
        let mut answer = Dict::new();
        answer.insert("ok".to_string(), Value::Bool(result.is_some()));
        if let Some(value) = result {
            answer.insert("value".to_string(), Value::Int(value));
        }
        Ok(Answer::ok(answer))
    }

    async fn get(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let key = prepare_key(quest, quest.args.want_str("key")?)?;
        let cache = quest.ctx.get_int("CACHE");

        if cache > 0 {
            match self.rcache_hit(&key, cache) {
                Some(Some(rdata)) => {
                    let mut answer = Dict::new();
                    answer.insert("value".to_string(), Value::Blob(rdata.payload().to_vec()));
                    answer.insert("revision".to_string(), Value::Int(0));
                    answer.insert("_zip".to_string(), Value::Bool(false));
                    return Ok(Answer::ok(answer));
                }
                Some(None) => return Ok(Answer::empty()),
                None => {}
            }
        }

        let mut answer = Dict::new();
        if let Some(mv) = self.memcache.get(&Self::caller(quest), &key).await? {
            let (mv, was_zipped) = self.unzip(mv);
            if cache != 0 {
                self.fill_rcache(&mv.key, &mv.value);
            }
            answer.insert("value".to_string(), Value::Blob(mv.value));
            answer.insert("revision".to_string(), Value::Int(mv.revision));
            answer.insert("_zip".to_string(), Value::Bool(was_zipped));
        }
        Ok(Answer::ok(answer))
    }

    async fn get_multi(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let keys = quest.args.want_str_seq("keys")?;
        let keys = keys
            .iter()
            .map(|k| prepare_key(quest, k))
            .collect::<xic::Result<Vec<_>>>()?;
        let cache = quest.ctx.get_int("CACHE");

        let mut values = Dict::new();
        let mut revisions = Dict::new();
        let mut missing = Vec::new();

        if cache > 0 {
            for key in &keys {
                match self.rcache_hit(key, cache) {
                    Some(Some(rdata)) => {
                        values.insert(key.clone(), Value::Blob(rdata.payload().to_vec()));
                        revisions.insert(key.clone(), Value::Int(0));
                    }
                    _ => missing.push(key.clone()),
                }
            }
        } else {
            missing = keys;
        }

        if !missing.is_empty() {
            for mv in self.memcache.get_multi(&Self::caller(quest), &missing).await {
                let (mv, _) = self.unzip(mv);
                if cache != 0 {
                    self.fill_rcache(&mv.key, &mv.value);
                }
                revisions.insert(mv.key.clone(), Value::Int(mv.revision));
                values.insert(mv.key, Value::Blob(mv.value));
            }
        }

        let mut answer = Dict::new();
        answer.insert("values".to_string(), Value::Dict(values));
        answer.insert("revisions".to_string(), Value::Dict(revisions));
        Ok(Answer::ok(answer))
    }

    fn which_server(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let key = prepare_key(quest, quest.args.want_str("key")?)?;
        let (real, canonical) = self.memcache.which_server(&key);
        let mut answer = Dict::new();
        answer.insert("real".to_string(), Value::from(real));
        answer.insert("canonical".to_string(), Value::from(canonical));
        Ok(Answer::ok(answer))
    }

    fn all_servers(&self) -> Answer {
        let (all, bad) = self.memcache.all_servers();
        let mut answer = Dict::new();
        answer.insert(
            "all".to_string(),
            Value::List(all.into_iter().map(Value::from).collect()),
        );
        answer.insert(
            "bad".to_string(),
            Value::List(bad.into_iter().map(Value::from).collect()),
        );
        Answer::ok(answer)
    }
}

#[async_trait::async_trait]
impl xic::Servant for MCache {
    async fn process(&self, quest: Quest, _current: &Current) -> anyhow::Result<Answer> {
        match quest.method.as_str() {
            "set" => self.set(&quest).await,
            "replace" => self.store_like("replace", &quest).await,
            "add" => self.store_like("add", &quest).await,
            "append" => self.concat_like("append", &quest).await,
            "prepend" => self.concat_like("prepend", &quest).await,
            "cas" => self.cas(&quest).await,
            "delete" => self.delete(&quest).await,
            "increment" => self.count_like("incr", &quest).await,
            "decrement" => self.count_like("decr", &quest).await,
            "get" => self.get(&quest).await,
            "getMulti" => self.get_multi(&quest).await,
            "whichServer" => self.which_server(&quest),
            "allServers" => Ok(self.all_servers()),
            method => Err(xic::Error::NotFound(format!(
                "method '{method}' of service '{}'",
                quest.service
            ))
            .into()),
        }
    }
}

impl RevServant for MCache {
    fn revision(&self) -> i64 {
        self.revision
    }

    fn get_info(&self) -> Dict {
        let mut info = Dict::new();
        info.insert("type".to_string(), Value::from("internal"));
        info.insert("revision".to_string(), Value::Int(self.revision));
        info.insert("servers".to_string(), Value::from(self.servers.clone()));
        info
    }

    fn shutdown(&self) {
        self.memcache.shutdown();
    }
}

const FORBIDDEN: &[u8] = b" \t\x0b\x0c\r\n\0";
const ESCAPE: &[u8] = b"\x1f\x1e\x1d\x1c\x1a";

/// Validate a memcached key and remap forbidden bytes through the escape
/// alphabet. The remapped key keeps the original byte length.
pub fn prepare_key(quest: &Quest, key: &str) -> xic::Result<String> {
    if key.is_empty() || key.len() > 250 {
        return Err(xic::Error::Argument(format!(
            "key for memcache can't be empty or larger than 250 bytes, key={key:?}"
        )));
    }

    if !key.bytes().any(|b| FORBIDDEN.contains(&b)) {
        return Ok(key.to_string());
    }

    tracing::warn!(
        service = %quest.service,
        method = %quest.method,
        key = %key.escape_default(),
        "memcache key contains whitespace, remapping"
    );
    let out: Vec<u8> = key
        .bytes()
        .map(|b| match FORBIDDEN.iter().position(|&f| f == b) {
            Some(i) => ESCAPE[i % ESCAPE.len()],
            None => b,
        })
        .collect();
    Ok(String::from_utf8_lossy(&out).into_owned())
}

fn warn_large_value(quest: &Quest, key: &str, value: &[u8]) {
    if value.len() >= LARGE_VALUE_WARNING {
        tracing::warn!(
            service = %quest.service,
            method = %quest.method,
            key,
            value_len = value.len(),
            "value too large"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quest() -> Quest {
        Quest::new("MCache~t", "set", Dict::new())
    }

    #[test]
    fn prepare_key_passes_clean_keys_through() {
        let q = quest();
        assert_eq!(prepare_key(&q, "plain-key:1").unwrap(), "plain-key:1");
        // Idempotent on clean keys.
        let once = prepare_key(&q, "plain-key:1").unwrap();
        assert_eq!(prepare_key(&q, &once).unwrap(), once);
    }

    #[test]
    fn prepare_key_remaps_whitespace_preserving_length() {
        let q = quest();
        let out = prepare_key(&q, "a b\tc").unwrap();
        assert_eq!(out.len(), "a b\tc".len());
        assert_eq!(out.as_bytes(), b"a\x1fb\x1ec");
        // Remapped output contains no forbidden byte, so it is stable.
        assert_eq!(prepare_key(&q, &out).unwrap(), out);
    }

    #[test]
    fn prepare_key_rejects_empty_and_oversize() {
        let q = quest();
        assert!(prepare_key(&q, "").is_err());
        assert!(prepare_key(&q, &"x".repeat(251)).is_err());
        assert!(prepare_key(&q, &"x".repeat(250)).is_ok());
    }
}
