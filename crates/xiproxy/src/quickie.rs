//! Utility servant: time, sink, echo, ad-hoc hash sequencing, salvo.

use crate::big_servant::BigServant;
use chrono::{Local, Utc};
use hseq::{Bucket, HashSequencer};
use std::sync::Arc;
use xic::{Answer, Current, Dict, DictExt, Quest, Value};

pub struct Quickie {
    big: Arc<BigServant>,
}

impl Quickie {
    pub fn new(big: Arc<BigServant>) -> Self {
        Self { big }
    }

    fn time() -> Answer {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let mut args = Dict::new();
        args.insert("time".to_string(), Value::Int(now));
        args.insert(
            "utc".to_string(),
            Value::from(Utc::now().format("%Y%m%d-%H%M%S").to_string()),
        );
        args.insert(
            "local".to_string(),
            Value::from(Local::now().format("%Y%m%d-%H%M%S").to_string()),
        );
        Answer::ok(args)
    }

    /// Sequence caller-provided buckets: `buckets` (strings or blobs),
    /// optional per-bucket `weights`, a key or pre-computed `keyhash`,
    /// an optional `keymask`, and `num` wanted positions.
    fn hseq(quest: &Quest) -> anyhow::Result<Answer> {
        let args = &quest.args;
        let buckets = args.want_list("buckets")?;
        let weights = args.get_int_seq("weights");
        let weighted = weights.len() >= buckets.len();

        let items: Vec<Bucket> = buckets
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let identity = b
                    .as_bytes()
                    .ok_or_else(|| xic::Error::Argument("bucket is not bytes".to_string()))?
                    .to_vec();
                let weight = if weighted { weights[i].max(1) as u32 } else { 1 };
                Ok(Bucket::weighted(identity, weight))
            })
            .collect::<xic::Result<_>>()?;

        let mut num = args.get_int("num") as usize;
        if num == 0 || num > items.len() {
            num = items.len();
        }

        let mut keyhash = args.get_int("keyhash") as u32;
        if keyhash == 0 {
            if let Some(key) = args.get_blob("key") {
                keyhash = HashSequencer::key_hash(key);
            }
        }
        let keymask = args.get_int("keymask") as u32;
        if keymask != 0 {
            keyhash &= keymask;
        }

        let hseq = HashSequencer::new(items, 0);
        let seqs: Vec<Value> = hseq
            .sequence_hash(keyhash, num)
            .into_iter()
            .map(|i| Value::Int(i as i64))
            .collect();

        let mut answer = Dict::new();
        answer.insert("seqs".to_string(), Value::List(seqs));
        Ok(Answer::ok(answer))
    }
}

#[async_trait::async_trait]
impl xic::Servant for Quickie {
    async fn process(&self, quest: Quest, current: &Current) -> anyhow::Result<Answer> {
        match quest.method.as_str() {
            "time" => Ok(Self::time()),
            "sink" => Ok(Answer::empty()),
            "echo" => Ok(Answer::ok(quest.args.clone())),
            "hseq" => Self::hseq(&quest),
            "salvo" => self.big.salvo(&quest, current).await,
            method => Err(xic::Error::NotFound(format!(
                "method '{method}' of service '{}'",
                quest.service
            ))
            .into()),
        }
    }
}

pub struct XiProxyCtrl {
    big: Arc<BigServant>,
}

impl XiProxyCtrl {
    pub fn new(big: Arc<BigServant>) -> Self {
        Self { big }
    }
}

#[async_trait::async_trait]
impl xic::Servant for XiProxyCtrl {
    async fn process(&self, quest: Quest, _current: &Current) -> anyhow::Result<Answer> {
        match quest.method.as_str() {
            "stats" => Ok(self.big.stats()),
            "getProxyInfo" => {
                let service = quest.args.want_str("service")?;
                Ok(self.big.proxy_info(service))
            }
            "markProxyMethods" => {
                let service = quest.args.want_str("service")?;
                Ok(self.big.mark_proxy_methods(service, &quest.args))
            }
            "clearCache" => {
                self.big.clear_cache();
                let mut args = Dict::new();
                args.insert("ok".to_string(), Value::Bool(true));
                Ok(Answer::ok(args))
            }
            method => Err(xic::Error::NotFound(format!(
                "method '{method}' of service '{}'",
                quest.service
            ))
            .into()),
        }
    }
}
