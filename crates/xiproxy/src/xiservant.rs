//! External-service servant: forwards quests to a remote service through
//! a client proxy, consulting and filling the answer cache, with call
//! metering and slow/ultra-slow handling.

use crate::big_servant::RevServant;
use crate::clock::now_ms;
use rcache::{RCache, RData, RKey, RKind};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use xic::{Answer, Args, Current, Dict, DictExt, Proxy, Quest, Value};

#[derive(Debug, Clone)]
pub struct XiOptions {
    pub slow_warning_msec: u64,
    pub ultra_slow_msec: u64,
    /// Reset the upstream connection after this many seconds (plus up to
    /// 10% jitter) to rebalance across resolved endpoints.
    pub refresh_secs: u64,
    pub log_errors: bool,
}

impl Default for XiOptions {
    fn default() -> Self {
        Self {
            slow_warning_msec: 1000,
            ultra_slow_msec: 66_000,
            refresh_secs: 3600,
            log_errors: true,
        }
    }
}

#[derive(Default)]
struct MethodStat {
    count: u64,
    mark: bool,
}

struct LastCall {
    method: String,
    at_ms: u64,
    usec: i64,
}

pub struct XiServant {
    service: String,
    revision: i64,
    prx: Proxy,
    rcache: Arc<RCache>,
    options: XiOptions,

    start_ms: u64,
    expire_ms: Mutex<u64>,
    call_total: AtomicI64,
    call_underway: AtomicI64,
    rcache_hits: AtomicI64,
    mark_all: AtomicBool,
    methods: Mutex<HashMap<String, MethodStat>>,
    last_call: Mutex<Option<LastCall>>,
}

fn jittered_refresh(secs: u64) -> u64 {
    let jitter = rand::thread_rng().gen_range(0.0..0.1);
    (secs as f64 * (1.0 + jitter) * 1000.0) as u64
}

impl XiServant {
    pub fn new(
        service: &str,
        revision: i64,
        prx: Proxy,
        rcache: Arc<RCache>,
        options: XiOptions,
    ) -> Self {
        let now = now_ms();
        Self {
            service: service.to_string(),
            revision,
            prx,
            rcache,
            expire_ms: Mutex::new(now + jittered_refresh(options.refresh_secs)),
            options,
            start_ms: now,
            call_total: AtomicI64::new(0),
            call_underway: AtomicI64::new(0),
            rcache_hits: AtomicI64::new(0),
            mark_all: AtomicBool::new(false),
            methods: Mutex::new(HashMap::new()),
            last_call: Mutex::new(None),
        }
    }

    fn note_method(&self, method: &str) -> bool {
        let mut methods = self.methods.lock().unwrap();
        let stat = methods.entry(method.to_string()).or_default();
        stat.count += 1;
        stat.mark || self.mark_all.load(Ordering::Relaxed)
    }

    fn fresh_answer_hit(&self, rkey: &RKey, cache_secs: i64) -> Option<RData> {
        let rdata = self.rcache.find(rkey)?;
        if rdata.kind() != RKind::Answer {
            return None;
        }
        let ttl_secs = if rdata.status() != 0 { 1 } else { cache_secs };
        (now_ms().saturating_sub(rdata.ctime()) < ttl_secs as u64 * 1000).then_some(rdata)
    }

    async fn maybe_refresh_endpoint(&self) {
        let now = now_ms();
        let due = {
            let mut expire = self.expire_ms.lock().unwrap();
            if now < *expire {
                false
            } else {
                *expire = now + jittered_refresh(self.options.refresh_secs);
                true
            }
        };
        if due {
            tracing::info!(service = %self.service, "periodic endpoint refresh");
            self.prx.reset_connection().await;
        }
    }

    fn call_end(&self, method: &str, usec: i64) {
        self.call_underway.fetch_sub(1, Ordering::Relaxed);
        *self.last_call.lock().unwrap() = Some(LastCall {
            method: method.to_string(),
            at_ms: now_ms(),
            usec,
        });
    }

    /// Flip per-method or global mark flags; answers the marked set.
    pub fn mark_methods(&self, args: &Dict) -> Answer {
        if let Some(all) = args.get("markAll").and_then(Value::as_bool) {
            self.mark_all.store(all, Ordering::Relaxed);
        }

        let mut methods = self.methods.lock().unwrap();
        for name in args.get_str_seq("mark") {
            methods.entry(name).or_default().mark = true;
        }
        for name in args.get_str_seq("unmark") {
            if let Some(stat) = methods.get_mut(&name) {
                stat.mark = false;
            }
        }

        let marked: Vec<Value> = methods
            .iter()
            .filter(|(_, stat)| stat.mark)
            .map(|(name, _)| Value::from(name.clone()))
            .collect();
        drop(methods);

        let mut answer = Dict::new();
        answer.insert("marked".to_string(), Value::List(marked));
        answer.insert(
            "markAll".to_string(),
            Value::Bool(self.mark_all.load(Ordering::Relaxed)),
        );
        Answer::ok(answer)
    }
}

#[async_trait::async_trait]
impl xic::Servant for XiServant {
    async fn process(&self, quest: Quest, current: &Current) -> anyhow::Result<Answer> {
        self.call_total.fetch_add(1, Ordering::Relaxed);
        let marked = self.note_method(&quest.method);

        let mut cache = 0;
        let mut rkey = None;
        if !quest.is_oneway() {
            cache = quest.ctx.get_int("CACHE");
            if cache != 0 {
                let key = RKey::answer(
                    self.service.as_bytes(),
                    quest.method.as_bytes(),
                    &quest.args_bytes(),
                );
                if cache > 0 {
                    if let Some(rdata) = self.fresh_answer_hit(&key, cache) {
                        self.rcache_hits.fetch_add(1, Ordering::Relaxed);
                        crate::metrics::rcache_hits().inc();
                        // Lend the cached bytes to the answer by refcount.
                        return Ok(Answer::raw(rdata.status(), rdata.payload()));
                    }
                }
                rkey = Some(key);
            }
        }

        self.maybe_refresh_endpoint().await;

        self.call_underway.fetch_add(1, Ordering::Relaxed);
        let start = std::time::Instant::now();
        let method = quest.method.clone();
        let ctx = quest.ctx.clone();
        let result = self.prx.emit(quest).await;
        let used_usec = start.elapsed().as_micros() as i64;
        self.call_end(&method, used_usec);

        let answer = match result {
            Ok(answer) => answer,
            Err(err) => {
                tracing::warn!(
                    service = %self.service,
                    method = %method,
                    err = %err,
                    "upstream emit failed"
                );
                return Err(err.into());
            }
        };

        if let Some(rkey) = rkey {
            let payload = match &answer.args {
                Args::Raw(raw) => raw.clone(),
                Args::Dict(dict) => bytes::Bytes::from(xic::encode_args(dict)),
            };
            self.rcache.replace(
                rkey,
                RData::with_status(now_ms(), RKind::Answer, answer.status, payload),
            );
        }

        let used_ms = (used_usec / 1000) as u64;
        if used_ms >= self.options.slow_warning_msec {
            let ultra = used_ms >= self.options.ultra_slow_msec;
            tracing::warn!(
                service = %self.service,
                method = %method,
                con = %current.con_info,
                elapsed_msec = used_ms,
                status = answer.status,
                ultra_slow = ultra,
                "slow upstream call"
            );
            if ultra {
                // Close the upstream connection so the next call re-dials
                // (possibly another endpoint).
                self.prx.reset_connection().await;
            }
        }
        if answer.status != 0 && self.options.log_errors {
            tracing::warn!(
                service = %self.service,
                method = %method,
                con = %current.con_info,
                status = answer.status,
                ctx = ?ctx,
                "exception answer from upstream"
            );
        }
        if marked {
            tracing::info!(
                service = %self.service,
                method = %method,
                elapsed_usec = used_usec,
                status = answer.status,
                "marked method call"
            );
        }

        Ok(answer)
    }
}

impl RevServant for XiServant {
    fn revision(&self) -> i64 {
        self.revision
    }

    fn get_info(&self) -> Dict {
        let now = now_ms();
        let mut info = Dict::new();
        info.insert("type".to_string(), Value::from("external"));
        info.insert("revision".to_string(), Value::Int(self.revision));
        info.insert("proxy".to_string(), Value::from(self.prx.describe()));
        info.insert(
            "age".to_string(),
            Value::Int((now.saturating_sub(self.start_ms) / 1000) as i64),
        );
        info.insert(
            "refresh_in".to_string(),
            Value::Int(
                (self.expire_ms.lock().unwrap().saturating_sub(now) / 1000) as i64,
            ),
        );
        info.insert(
            "num_rcache_hit".to_string(),
            Value::Int(self.rcache_hits.load(Ordering::Relaxed)),
        );
        info.insert(
            "num_call_total".to_string(),
            Value::Int(self.call_total.load(Ordering::Relaxed)),
        );
        info.insert(
            "num_call_underway".to_string(),
            Value::Int(self.call_underway.load(Ordering::Relaxed)),
        );
        if let Some(last) = self.last_call.lock().unwrap().as_ref() {
            info.insert("last_call_method".to_string(), Value::from(last.method.clone()));
            info.insert(
                "last_call_age".to_string(),
                Value::Int((now.saturating_sub(last.at_ms) / 1000) as i64),
            );
            info.insert("last_call_usec".to_string(), Value::Int(last.usec));
        }
        info
    }

    fn as_xiservant(&self) -> Option<&XiServant> {
        Some(self)
    }
}
