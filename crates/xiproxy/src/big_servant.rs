//! The proxy's service registry and default dispatcher: lazily constructs
//! a servant per configured service, reloads the service list, reaps the
//! answer cache, and fans out salvo batches.

use crate::clock::now_ms;
use crate::mcache::MCache;
use crate::metrics;
use crate::proxy_config::{endpoints_of, ProxyConfig, ProxyKind};
use crate::redis::Redis;
use crate::xiservant::{XiOptions, XiServant};
use hseq::{Bucket, HashSequencer};
use rcache::RCache;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use xic::{Answer, Current, Dict, DictExt, Endpoint, Quest, Value};

const RCACHE_NUM_ITEM: usize = 1024 * 64;
const RCACHE_MAX_AGE_SECS: u64 = 3600 * 24;
const REAP_BATCH: usize = 10;

/// A registered servant: processes quests and reports a config revision
/// so reloads can tell stale instances apart.
pub trait RevServant: xic::Servant {
    fn revision(&self) -> i64;
    fn get_info(&self) -> Dict;
    fn shutdown(&self) {}
    fn as_xiservant(&self) -> Option<&XiServant> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct BigConfig {
    pub rcache_entries: usize,
    pub rcache_max_age_secs: u64,
    /// This proxy's own address, the sequencing key for endpoint
    /// reordering so each instance prefers a distinct backend.
    pub self_ip: String,
    pub xi_options: XiOptions,
}

impl Default for BigConfig {
    fn default() -> Self {
        Self {
            rcache_entries: RCACHE_NUM_ITEM,
            rcache_max_age_secs: RCACHE_MAX_AGE_SECS,
            self_ip: String::new(),
            xi_options: XiOptions::default(),
        }
    }
}

struct Registry {
    map: HashMap<String, Arc<dyn RevServant>>,
    // One-entry lookup cache in front of the map.
    hint: Option<(String, Arc<dyn RevServant>)>,
}

pub struct BigServant {
    config: ProxyConfig,
    rcache: Arc<RCache>,
    options: BigConfig,
    registry: Mutex<Registry>,
    /// Statically wired servants (LCache, Quickie, XiProxyCtrl) consulted
    /// before the dynamic registry.
    fixed: Mutex<HashMap<String, Arc<dyn xic::Servant>>>,
}

impl BigServant {
    pub fn new(listfile: impl Into<std::path::PathBuf>, options: BigConfig) -> anyhow::Result<Arc<Self>> {
        let config = ProxyConfig::new(listfile)?;
        Ok(Arc::new(Self {
            config,
            rcache: Arc::new(RCache::new(options.rcache_entries.max(1))),
            options,
            registry: Mutex::new(Registry {
                map: HashMap::new(),
                hint: None,
            }),
            fixed: Mutex::new(HashMap::new()),
        }))
    }

    pub fn rcache(&self) -> Arc<RCache> {
        self.rcache.clone()
    }

    pub fn register_fixed(&self, name: &str, servant: Arc<dyn xic::Servant>) {
        self.fixed.lock().unwrap().insert(name.to_string(), servant);
    }

    fn fixed_servant(&self, name: &str) -> Option<Arc<dyn xic::Servant>> {
        self.fixed.lock().unwrap().get(name).cloned()
    }

    /// Start the periodic reload and cache-reap tasks.
    pub fn start_tasks(self: Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = 0u64;
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                tick += 1;
                if tick % 5 != 0 {
                    continue;
                }
                match this.config.reload() {
                    Ok(true) => this.drop_stale(),
                    Ok(false) => {}
                    Err(err) => tracing::error!(err = format!("{err:#}"), "service list reload failed"),
                }
            }
        });

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                let before = now_ms().saturating_sub(this.options.rcache_max_age_secs * 1000);
                let mut total = 0;
                loop {
                    let n = this.rcache.reap(REAP_BATCH, before);
                    total += n;
                    if n < REAP_BATCH {
                        break;
                    }
                }
                if total > 0 {
                    tracing::info!(evicted = total, "reaped expired cache entries");
                }
            }
        });
    }

    /// Drop registry entries whose descriptor disappeared or changed
    /// revision; their servants shut down outside the lock.
    fn drop_stale(&self) {
        let mut dropped = Vec::new();
        {
            let mut registry = self.registry.lock().unwrap();
            registry.map.retain(|service, servant| {
                let keep = self
                    .config
                    .find(service)
                    .map(|pd| pd.revision == servant.revision())
                    .unwrap_or(false);
                if !keep {
                    dropped.push(servant.clone());
                }
                keep
            });
            registry.hint = None;
        }
        for servant in dropped {
            servant.shutdown();
        }
    }

    pub fn find(&self, service: &str, load: bool) -> Option<Arc<dyn RevServant>> {
        {
            let mut registry = self.registry.lock().unwrap();
            if let Some((name, servant)) = &registry.hint {
                if name == service {
                    return Some(servant.clone());
                }
            }
            if let Some(servant) = registry.map.get(service) {
                let servant = servant.clone();
                registry.hint = Some((service.to_string(), servant.clone()));
                return Some(servant);
            }
        }
        if load {
            self.load(service)
        } else {
            None
        }
    }

    fn load(&self, service: &str) -> Option<Arc<dyn RevServant>> {
        let pd = self.config.find(service)?;
        let id = service.split('~').next().unwrap_or(service);

        let servant: Arc<dyn RevServant> = match pd.kind {
            ProxyKind::Internal if id == "MCache" => Arc::new(MCache::new(
                service,
                pd.revision,
                &pd.value,
                self.rcache.clone(),
            )),
            ProxyKind::Internal if id == "Redis" => {
                Arc::new(Redis::new(service, pd.revision, &pd.value))
            }
            ProxyKind::Internal => {
                tracing::error!(service, "unknown internal servant identity");
                return None;
            }
            ProxyKind::External => {
                let endpoints = self.reorder_endpoints(endpoints_of(&pd.value));
                let prx = xic::Proxy::new(id, endpoints);
                Arc::new(XiServant::new(
                    service,
                    pd.revision,
                    prx,
                    self.rcache.clone(),
                    self.options.xi_options.clone(),
                ))
            }
        };

        let mut registry = self.registry.lock().unwrap();
        let servant = registry
            .map
            .entry(service.to_string())
            .or_insert(servant)
            .clone();
        registry.hint = Some((service.to_string(), servant.clone()));
        Some(servant)
    }

    /// Order endpoints by the sequencer keyed on this proxy's address, so
    /// a fleet of proxies spreads across the resolved backends.
    fn reorder_endpoints(&self, endpoints: Vec<Endpoint>) -> Vec<Endpoint> {
        if endpoints.len() < 2 {
            return endpoints;
        }
        let buckets = endpoints
            .iter()
            .map(|ep| Bucket::new(ep.to_string().into_bytes()))
            .collect();
        let hseq = HashSequencer::new(buckets, 0);
        hseq.sequence(self.options.self_ip.as_bytes(), endpoints.len())
            .into_iter()
            .map(|i| endpoints[i].clone())
            .collect()
    }

    pub fn remove(&self, service: &str) {
        let mut registry = self.registry.lock().unwrap();
        registry.map.remove(service);
        registry.hint = None;
    }

    /// Fan out the sub-quests of a salvo batch and gather their answers
    /// in request order.
    pub async fn salvo(&self, quest: &Quest, current: &Current) -> anyhow::Result<Answer> {
        metrics::salvo_total().inc();
        let quests = quest.args.want_list("quests")?;

        let mut ctx = quest.ctx.clone();
        ctx.insert("SALVO".to_string(), Value::Bool(true));

        let calls = quests.iter().map(|sub| async {
            let (service, method) = match sub.as_dict() {
                Some(dict) => match (dict.want_str("s"), dict.want_str("m")) {
                    (Ok(s), Ok(m)) => (s.to_string(), m.to_string()),
                    (Err(err), _) | (_, Err(err)) => {
                        return Answer::from_error(&err, "", "");
                    }
                },
                None => {
                    let err = xic::Error::Argument("salvo quest is not a dict".to_string());
                    return Answer::from_error(&err, "", "");
                }
            };
            let args = sub
                .as_dict()
                .and_then(|d| d.get("a"))
                .and_then(Value::as_dict)
                .cloned()
                .unwrap_or_default();

            let mut sub_quest = Quest::new(service.clone(), method.clone(), args);
            sub_quest.txid = 1;
            sub_quest.ctx = ctx.clone();

            let result = match self.find(&service, true) {
                Some(servant) => servant.process(sub_quest, current).await,
                None => match self.fixed_servant(&service) {
                    Some(servant) => servant.process(sub_quest, current).await,
                    None => Err(xic::Error::NotFound(service.clone()).into()),
                },
            };
            match result {
                Ok(answer) => answer,
                Err(err) => Answer::from_anyhow(&err, &service, &method),
            }
        });

        let answers = futures::future::join_all(calls).await;
        let mut list = Vec::with_capacity(answers.len());
        for answer in answers {
            let mut entry = Dict::new();
            entry.insert("status".to_string(), Value::Int(answer.status as i64));
            entry.insert("a".to_string(), Value::Dict(answer.args.to_dict()?));
            list.push(Value::Dict(entry));
        }

        let mut args = Dict::new();
        args.insert("answers".to_string(), Value::List(list));
        Ok(Answer::ok(args))
    }

    pub fn stats(&self) -> Answer {
        let registry = self.registry.lock().unwrap();
        let services: Vec<Value> = registry
            .map
            .keys()
            .map(|name| Value::from(name.clone()))
            .collect();
        drop(registry);

        let mut args = Dict::new();
        args.insert("services".to_string(), Value::List(services));
        args.insert("metrics".to_string(), Value::from(metrics::render()));
        Answer::ok(args)
    }

    pub fn proxy_info(&self, service: &str) -> Answer {
        let mut args = Dict::new();
        if let Some(servant) = self.find(service, false) {
            args.insert("now_ms".to_string(), Value::Int(now_ms() as i64));
            args.insert("service".to_string(), Value::from(service));
            args.insert("info".to_string(), Value::Dict(servant.get_info()));
        }
        Answer::ok(args)
    }

    pub fn mark_proxy_methods(&self, service: &str, args: &Dict) -> Answer {
        match self.find(service, true).and_then(|servant| {
            servant
                .as_xiservant()
                .map(|xi| xi.mark_methods(args))
        }) {
            Some(answer) => answer,
            None => Answer::empty(),
        }
    }

    pub fn clear_cache(&self) {
        self.rcache.clear();
    }
}

#[async_trait::async_trait]
impl xic::Servant for BigServant {
    async fn process(&self, quest: Quest, current: &Current) -> anyhow::Result<Answer> {
        metrics::quests_total().inc();

        if let Some(servant) = self.fixed_servant(&quest.service) {
            return servant.process(quest, current).await;
        }

        let Some(servant) = self.find(&quest.service, true) else {
            return Err(xic::Error::NotFound(quest.service.clone()).into());
        };
        servant.process(quest, current).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct EchoServant;

    #[async_trait::async_trait]
    impl xic::Servant for EchoServant {
        async fn process(&self, quest: Quest, _current: &Current) -> anyhow::Result<Answer> {
            Ok(Answer::ok(quest.args))
        }
    }

    fn current() -> Current {
        Current {
            con_info: "tcp/l/p".to_string(),
            peer: "127.0.0.1:1".parse().unwrap(),
        }
    }

    fn sub_quest(service: &str, n: i64) -> Value {
        let mut a = Dict::new();
        a.insert("n".to_string(), Value::Int(n));
        let mut q = Dict::new();
        q.insert("s".to_string(), Value::from(service));
        q.insert("m".to_string(), Value::from("hi"));
        q.insert("a".to_string(), Value::Dict(a));
        Value::Dict(q)
    }

    #[tokio::test]
    async fn salvo_answers_keep_request_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"# no services\n").unwrap();
        file.flush().unwrap();

        let big = BigServant::new(file.path(), BigConfig::default()).unwrap();
        big.register_fixed("Echo", Arc::new(EchoServant));

        let mut args = Dict::new();
        args.insert(
            "quests".to_string(),
            Value::List(vec![
                sub_quest("Echo", 1),
                sub_quest("Missing", 2),
                sub_quest("Echo", 3),
            ]),
        );
        let quest = Quest::new("Quickie", "salvo", args);

        let answer = big.salvo(&quest, &current()).await.unwrap();
        let dict = answer.args.to_dict().unwrap();
        let answers = dict.get("answers").and_then(Value::as_list).unwrap();
        assert_eq!(answers.len(), 3);

        let entry = |i: usize| answers[i].as_dict().unwrap();
        assert_eq!(entry(0).get_int("status"), 0);
        assert_eq!(
            entry(0).get("a").and_then(Value::as_dict).unwrap().get_int("n"),
            1
        );
        // The unknown service converts to a status-bearing answer in place.
        assert_ne!(entry(1).get_int("status"), 0);
        assert_eq!(entry(2).get_int("status"), 0);
        assert_eq!(
            entry(2).get("a").and_then(Value::as_dict).unwrap().get_int("n"),
            3
        );
    }
}

