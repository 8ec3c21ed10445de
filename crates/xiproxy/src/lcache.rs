//! The local-cache servant: value operations directly against the shared
//! answer/value cache, no backend involved.

use crate::clock::now_ms;
use rcache::{RCache, RData, RKey, RKind};
use std::sync::Arc;
use xic::{Answer, Current, Dict, DictExt, Quest, Value};

pub struct LCache {
    rcache: Arc<RCache>,
}

impl LCache {
    pub fn new(rcache: Arc<RCache>) -> Self {
        Self { rcache }
    }

    fn age_secs(ctime: u64) -> i64 {
        (now_ms().saturating_sub(ctime) / 1000) as i64
    }

    /// `after` cutoff for a `maxage` given in seconds; zero means no cutoff.
    fn after_from_maxage(maxage: i64) -> u64 {
        if maxage > 0 {
            now_ms().saturating_sub(maxage as u64 * 1000)
        } else {
            0
        }
    }

    fn fresh_lcache(&self, rkey: &RKey, maxage: i64) -> Option<RData> {
        let d = self.rcache.fetch(rkey)?;
        if d.kind() != RKind::LCache {
            return None;
        }
        if maxage != 0 && Self::age_secs(d.ctime()) >= maxage {
            return None;
        }
        Some(d)
    }

    fn value_answer(d: Option<RData>) -> anyhow::Result<Answer> {
        let mut answer = Dict::new();
        match d {
            Some(d) => {
                answer.insert("value".to_string(), xic::decode_value(&d.payload())?);
                answer.insert("age".to_string(), Value::Int(Self::age_secs(d.ctime())));
            }
            None => {
                answer.insert("value".to_string(), Value::Null);
            }
        }
        Ok(Answer::ok(answer))
    }

    fn store(&self, rkey: RKey, value: &Value) {
        if value.is_null() {
            self.rcache.remove(&rkey);
        } else {
            self.rcache
                .replace(rkey, RData::new(now_ms(), RKind::LCache, xic::encode_value(value)));
        }
    }

    fn get(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let key = quest.args.want_str("key")?;
        let maxage = quest.args.get_int("maxage");
        let d = self.fresh_lcache(&RKey::lcache(key.as_bytes()), maxage);
        Self::value_answer(d)
    }

    fn set(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let key = quest.args.want_str("key")?;
        let value = quest
            .args
            .get("value")
            .ok_or_else(|| xic::Error::Argument("missing parameter 'value'".to_string()))?;
        self.store(RKey::lcache(key.as_bytes()), value);
        Ok(Answer::empty())
    }

    fn get_or_set(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let key = quest.args.want_str("key")?;
        let value = quest
            .args
            .get("value")
            .ok_or_else(|| xic::Error::Argument("missing parameter 'value'".to_string()))?;
        let maxage = quest.args.get_int("maxage");

        let rkey = RKey::lcache(key.as_bytes());
        let d = self.fresh_lcache(&rkey, maxage);
        if d.is_none() {
            self.store(rkey, value);
        }
        Self::value_answer(d)
    }

    fn get_and_set(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let key = quest.args.want_str("key")?;
        let value = quest
            .args
            .get("value")
            .ok_or_else(|| xic::Error::Argument("missing parameter 'value'".to_string()))?;
        let maxage = quest.args.get_int("maxage");

        let rkey = RKey::lcache(key.as_bytes());
        let d = self.fresh_lcache(&rkey, maxage);
        self.store(rkey, value);
        Self::value_answer(d)
    }

    fn get_all(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let keys = quest.args.want_str_seq("keys")?;
        let maxage = quest.args.get_int("maxage");
        let after = Self::after_from_maxage(maxage);

        let mut items = Dict::new();
        for key in keys {
            let rkey = RKey::lcache(key.as_bytes());
            if let Some(d) = self.rcache.fetch(&rkey) {
                if d.ctime() > after && d.kind() == RKind::LCache {
                    items.insert(key, xic::decode_value(&d.payload())?);
                }
            }
        }
        let mut answer = Dict::new();
        answer.insert("items".to_string(), Value::Dict(items));
        Ok(Answer::ok(answer))
    }

    fn plus(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let key = quest.args.want_str("key")?;
        let value = quest.args.want_int("value")?;
        let maxage = quest.args.get_int("maxage");

        let now = now_ms();
        let after = Self::after_from_maxage(maxage);
        let value = self
            .rcache
            .plus(RKey::lcache(key.as_bytes()), value, now, after);

        let mut answer = Dict::new();
        answer.insert("value".to_string(), Value::Int(value));
        Ok(Answer::ok(answer))
    }

    fn remove(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let key = quest.args.want_str("key")?;
        let ok = self.rcache.remove(&RKey::lcache(key.as_bytes()));
        let mut answer = Dict::new();
        answer.insert("ok".to_string(), Value::Bool(ok));
        Ok(Answer::ok(answer))
    }

    fn answer_rkey(quest: &Quest) -> anyhow::Result<RKey> {
        let s = quest.args.want_str("s")?;
        let m = quest.args.want_str("m")?;
        let a = quest.args.want_dict("a")?;
        Ok(RKey::answer(
            s.as_bytes(),
            m.as_bytes(),
            &xic::encode_args(a),
        ))
    }

    fn remove_answer(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let ok = self.rcache.remove(&Self::answer_rkey(quest)?);
        let mut answer = Dict::new();
        answer.insert("ok".to_string(), Value::Bool(ok));
        Ok(Answer::ok(answer))
    }

    fn get_answer(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let rkey = Self::answer_rkey(quest)?;
        let mut answer = Dict::new();
        match self.rcache.find(&rkey) {
            Some(d) if d.kind() == RKind::Answer => {
                answer.insert(
                    "value".to_string(),
                    Value::Dict(xic::decode_args(&d.payload())?),
                );
                answer.insert("age".to_string(), Value::Int(Self::age_secs(d.ctime())));
            }
            _ => {
                answer.insert("value".to_string(), Value::Null);
            }
        }
        Ok(Answer::ok(answer))
    }

    fn mcache_rkey(quest: &Quest) -> anyhow::Result<RKey> {
        let s = quest.args.want_str("s")?;
        let k = quest.args.want_str("k")?;
        Ok(RKey::mcache(s.as_bytes(), k.as_bytes()))
    }

    fn remove_mcache(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let ok = self.rcache.remove(&Self::mcache_rkey(quest)?);
        let mut answer = Dict::new();
        answer.insert("ok".to_string(), Value::Bool(ok));
        Ok(Answer::ok(answer))
    }

    fn get_mcache(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let rkey = Self::mcache_rkey(quest)?;
        let mut answer = Dict::new();
        if let Some(d) = self.rcache.find(&rkey) {
            if d.kind() == RKind::MCache {
                answer.insert("value".to_string(), Value::Blob(d.payload().to_vec()));
                answer.insert("age".to_string(), Value::Int(Self::age_secs(d.ctime())));
            }
        }
        Ok(Answer::ok(answer))
    }
}

#[async_trait::async_trait]
impl xic::Servant for LCache {
    async fn process(&self, quest: Quest, _current: &Current) -> anyhow::Result<Answer> {
        match quest.method.as_str() {
            "get" => self.get(&quest),
            "set" => self.set(&quest),
            "get_or_set" => self.get_or_set(&quest),
            "get_and_set" => self.get_and_set(&quest),
            "getAll" => self.get_all(&quest),
            "plus" => self.plus(&quest),
            "remove" => self.remove(&quest),
            "remove_answer" => self.remove_answer(&quest),
            "get_answer" => self.get_answer(&quest),
            "remove_mcache" => self.remove_mcache(&quest),
            "get_mcache" => self.get_mcache(&quest),
            method => Err(xic::Error::NotFound(format!(
                "method '{method}' of service '{}'",
                quest.service
            ))
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xic::Servant;

    fn current() -> Current {
        Current {
            con_info: "tcp/l/p".to_string(),
            peer: "127.0.0.1:1".parse().unwrap(),
        }
    }

    fn quest(method: &str, args: Dict) -> Quest {
        Quest::new("LCache", method, args)
    }

    async fn call(lc: &LCache, method: &str, args: Dict) -> Dict {
        let answer = lc.process(quest(method, args), &current()).await.unwrap();
        answer.args.to_dict().unwrap()
    }

    #[tokio::test]
    async fn set_get_remove_round_trip() {
        let lc = LCache::new(Arc::new(RCache::new(64)));

        let mut args = Dict::new();
        args.insert("key".to_string(), Value::from("k"));
        args.insert("value".to_string(), Value::Int(7));
        call(&lc, "set", args).await;

        let mut args = Dict::new();
        args.insert("key".to_string(), Value::from("k"));
        let out = call(&lc, "get", args.clone()).await;
        assert_eq!(out.get("value"), Some(&Value::Int(7)));

        let out = call(&lc, "remove", args.clone()).await;
        assert_eq!(out.get("ok"), Some(&Value::Bool(true)));

        let out = call(&lc, "get", args).await;
        assert_eq!(out.get("value"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn setting_null_removes() {
        let lc = LCache::new(Arc::new(RCache::new(64)));

        let mut args = Dict::new();
        args.insert("key".to_string(), Value::from("k"));
        args.insert("value".to_string(), Value::from("v"));
        call(&lc, "set", args).await;

        let mut args = Dict::new();
        args.insert("key".to_string(), Value::from("k"));
        args.insert("value".to_string(), Value::Null);
        call(&lc, "set", args).await;

        let mut args = Dict::new();
        args.insert("key".to_string(), Value::from("k"));
        let out = call(&lc, "get", args).await;
        assert_eq!(out.get("value"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn plus_accumulates() {
        let lc = LCache::new(Arc::new(RCache::new(64)));

        let mut args = Dict::new();
        args.insert("key".to_string(), Value::from("n"));
        args.insert("value".to_string(), Value::Int(5));
        let out = call(&lc, "plus", args.clone()).await;
        assert_eq!(out.get("value"), Some(&Value::Int(5)));

        let out = call(&lc, "plus", args).await;
        assert_eq!(out.get("value"), Some(&Value::Int(10)));
    }

    #[tokio::test]
    async fn get_or_set_only_fills_a_miss() {
        let lc = LCache::new(Arc::new(RCache::new(64)));

        let mut args = Dict::new();
        args.insert("key".to_string(), Value::from("k"));
        args.insert("value".to_string(), Value::Int(1));
        let out = call(&lc, "get_or_set", args).await;
        assert_eq!(out.get("value"), Some(&Value::Null));

        let mut args = Dict::new();
        args.insert("key".to_string(), Value::from("k"));
        args.insert("value".to_string(), Value::Int(2));
        let out = call(&lc, "get_or_set", args).await;
        // The first stored value survives.
        assert_eq!(out.get("value"), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn get_answer_matches_fingerprint() {
        let rcache = Arc::new(RCache::new(64));
        let lc = LCache::new(rcache.clone());

        let mut call_args = Dict::new();
        call_args.insert("id".to_string(), Value::Int(9));
        let rkey = rcache::RKey::answer(b"svc", b"m", &xic::encode_args(&call_args));
        let mut payload = Dict::new();
        payload.insert("result".to_string(), Value::from("cached"));
        rcache.replace(
            rkey,
            RData::new(now_ms(), RKind::Answer, xic::encode_args(&payload)),
        );

        let mut args = Dict::new();
        args.insert("s".to_string(), Value::from("svc"));
        args.insert("m".to_string(), Value::from("m"));
        args.insert("a".to_string(), Value::Dict(call_args));
        let out = call(&lc, "get_answer", args).await;
        assert_eq!(out.get("value"), Some(&Value::Dict(payload)));
    }
}
