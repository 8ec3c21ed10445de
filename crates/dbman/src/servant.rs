//! The DbMan RPC surface: query dispatch, schema info, and the control
//! operations, plus the background settings-reload and stickiness-reap
//! cycles.

use crate::caller_kind::CallerKindMap;
use crate::cluster::DbCluster;
use crate::job::QueryJob;
use crate::setting::{fetch_revision, unix_now, DbSetting, KindSetting};
use sqlx::{ConnectOptions, Connection, MySqlConnection};
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use xic::{Answer, Current, Dict, DictExt, Quest, Value};

const RELOAD_CHECK_SECS: u64 = 29;
const SETTINGS_PING_SECS: u64 = 11;

pub struct DbManServant {
    settings_dsn: String,
    charset: String,
    max_conn: usize,
    cluster: Mutex<Arc<DbCluster>>,
    writers: Arc<CallerKindMap>,
    settings_conn: tokio::sync::Mutex<MySqlConnection>,
    start_time: u64,
    reload_time: Mutex<Option<u64>>,
}

impl DbManServant {
    /// Connect to the settings database, load the schema leniently, and
    /// stand up the first cluster.
    pub async fn new(settings_dsn: &str, charset: &str, max_conn: usize) -> anyhow::Result<Arc<Self>> {
        let options = sqlx::mysql::MySqlConnectOptions::from_str(settings_dsn)?;
        let mut conn = options.connect().await?;
        let setting = Arc::new(DbSetting::load(&mut conn, false).await?);
        tracing::info!(revision = setting.revision(), "loaded database settings");

        let cluster = Arc::new(DbCluster::new(setting, charset, max_conn));
        Ok(Arc::new(Self {
            settings_dsn: settings_dsn.to_string(),
            charset: charset.to_string(),
            max_conn,
            cluster: Mutex::new(cluster),
            writers: Arc::new(CallerKindMap::default()),
            settings_conn: tokio::sync::Mutex::new(conn),
            start_time: unix_now(),
            reload_time: Mutex::new(None),
        }))
    }

    pub fn cluster(&self) -> Arc<DbCluster> {
        self.cluster.lock().unwrap().clone()
    }

    /// Start the stickiness reaper and the settings revision poller.
    pub fn start_tasks(self: Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                this.writers.reap(unix_now());
            }
        });

        let this = self.clone();
        tokio::spawn(async move {
            let mut last_check = 0u64;
            let mut last_ping = 0u64;
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                let now = unix_now();

                if now >= last_check + RELOAD_CHECK_SECS {
                    last_check = now;
                    if let Err(err) = this.check_revision().await {
                        tracing::error!(err = format!("{err:#}"), "settings revision check failed");
                    }
                }
                if now >= last_ping + SETTINGS_PING_SECS {
                    last_ping = now;
                    if let Err(err) = this.settings_conn.lock().await.ping().await {
                        tracing::warn!(err = %err, "settings connection ping failed, re-dialing");
                        let _ = this.redial_settings().await;
                    }
                }
            }
        });
    }

    async fn redial_settings(&self) -> anyhow::Result<()> {
        let options = sqlx::mysql::MySqlConnectOptions::from_str(&self.settings_dsn)?;
        let fresh = options.connect().await?;
        *self.settings_conn.lock().await = fresh;
        Ok(())
    }

    /// Reload when `variable_setting.revision` moved, swapping the
    /// cluster and draining the old one.
    async fn check_revision(&self) -> anyhow::Result<()> {
        let current = self.cluster().setting().revision().to_string();
        let mut conn = self.settings_conn.lock().await;
        let fresh = fetch_revision(&mut conn).await?;
        if fresh == current {
            return Ok(());
        }

        tracing::info!(old = %current, new = %fresh, "settings revision changed");
        let setting = Arc::new(DbSetting::load(&mut conn, false).await?);
        drop(conn);
        self.swap_cluster(setting);
        tracing::info!("automatic settings reload succeeded");
        Ok(())
    }

    fn swap_cluster(&self, setting: Arc<DbSetting>) {
        let fresh = Arc::new(DbCluster::new(setting, &self.charset, self.max_conn));
        let old = {
            let mut cluster = self.cluster.lock().unwrap();
            std::mem::replace(&mut *cluster, fresh)
        };
        old.shutdown();
        *self.reload_time.lock().unwrap() = Some(unix_now());
    }

    async fn s_query(&self, quest: &Quest, current: &Current) -> anyhow::Result<Answer> {
        let cluster = self.cluster();
        let (job, waiter) =
            QueryJob::single(quest, &current.con_info, cluster.setting(), &self.writers)?;
        cluster.assign_job(job);
        Ok(waiter.await.map_err(|_| xic::Error::ConnectionClosed)?)
    }

    async fn m_query(&self, quest: &Quest, current: &Current) -> anyhow::Result<Answer> {
        let cluster = self.cluster();
        let (job, waiter) =
            QueryJob::multi(quest, &current.con_info, cluster.setting(), &self.writers)?;
        cluster.assign_job(job);
        Ok(waiter.await.map_err(|_| xic::Error::ConnectionClosed)?)
    }

    fn want_kind(&self, quest: &Quest) -> anyhow::Result<(String, Arc<KindSetting>)> {
        let kind = quest.args.want_str("kind")?.to_string();
        let ks = self
            .cluster()
            .setting()
            .kind(&kind)
            .ok_or_else(|| xic::Error::NotFound(format!("no such kind({kind}) in DBSetting")))?;
        Ok((kind, ks))
    }

    fn table_number(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let (_, ks) = self.want_kind(quest)?;
        let mut args = Dict::new();
        args.insert("tableNumber".to_string(), Value::Int(ks.table_num));
        Ok(Answer::ok(args))
    }

    fn xid_name(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let (_, ks) = self.want_kind(quest)?;
        let mut args = Dict::new();
        args.insert("xidName".to_string(), Value::from(ks.id_field.clone()));
        Ok(Answer::ok(args))
    }

    fn kind_detail(&self, kind: &str, ks: &KindSetting) -> String {
        let cluster = self.cluster();
        let setting = cluster.setting();
        let mut out = String::new();
        let _ = writeln!(out, "       kind = {kind}");
        let _ = writeln!(out, "    enabled = {}", ks.enable);
        let _ = writeln!(out, "tablePrefix = {}", ks.table_prefix);
        let _ = writeln!(out, "tableNumber = {}", ks.table_num);
        let _ = writeln!(out, "    xidName = {}", ks.id_field);
        let _ = writeln!(out, "    version = {}\n", ks.version);

        let mut sids = std::collections::BTreeSet::new();
        let _ = writeln!(out, " No.   Database and sid...");
        let _ = writeln!(out, "----- ----------------------");
        for (i, t) in ks.tables.iter().enumerate() {
            sids.insert(t.sid);
            let _ = write!(out, "{i:>4}   {} {}", t.db_name, t.sid);
            if let Some(ss) = setting.server(t.sid) {
                for slave in &ss.slaves {
                    sids.insert(*slave);
                    let _ = write!(out, " {slave}");
                }
            }
            out.push('\n');
        }
        let _ = writeln!(out, "----- ----------------------\n");

        let _ = writeln!(out, " sid     master   host:port");
        let _ = writeln!(out, "------- -------- -----------------------");
        for sid in sids {
            match setting.server(sid) {
                None => {
                    let _ = writeln!(out, "?{sid:>5}");
                }
                Some(ss) => {
                    let _ = writeln!(
                        out,
                        "{}{sid:>5}   {:>6}   {}:{}",
                        if ss.active() { ' ' } else { '*' },
                        ss.master_sid,
                        ss.host,
                        ss.port
                    );
                }
            }
        }
        let _ = writeln!(out, "------- -------- -----------------------");
        out
    }

    fn kind_info(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let (kind, ks) = self.want_kind(quest)?;
        let facets = quest.args.want_str_seq("facets")?;

        let mut args = Dict::new();
        args.insert("kind".to_string(), Value::from(kind.clone()));
        for facet in facets {
            match facet.as_str() {
                "version" => {
                    args.insert("version".to_string(), Value::Int(ks.version));
                }
                "tableNumber" => {
                    args.insert("tableNumber".to_string(), Value::Int(ks.table_num));
                }
                "xidName" => {
                    args.insert("xidName".to_string(), Value::from(ks.id_field.clone()));
                }
                "detail" => {
                    args.insert(
                        "detail".to_string(),
                        Value::from(self.kind_detail(&kind, &ks)),
                    );
                }
                _ => {}
            }
        }
        Ok(Answer::ok(args))
    }

    fn kind_versions(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let kinds = quest.args.want_str_seq("kinds")?;
        let cluster = self.cluster();
        let setting = cluster.setting();

        let mut versions = Dict::new();
        for kind in kinds {
            let version = setting.kind(&kind).map(|ks| ks.version).unwrap_or(-1);
            versions.insert(kind, Value::Int(version));
        }
        let mut args = Dict::new();
        args.insert("kindVersions".to_string(), Value::Dict(versions));
        Ok(Answer::ok(args))
    }

    /// Manual reload: strict load, swap on success.
    async fn reload_db_setting(&self) -> Answer {
        let ok = async {
            let mut conn = self.settings_conn.lock().await;
            DbSetting::load(&mut conn, true).await
        }
        .await;

        let ok = match ok {
            Ok(setting) => {
                self.swap_cluster(Arc::new(setting));
                tracing::info!("manual settings reload succeeded");
                true
            }
            Err(err) => {
                tracing::error!(err = %err, "manual settings reload failed");
                false
            }
        };
        let mut args = Dict::new();
        args.insert("ok".to_string(), Value::Bool(ok));
        Answer::ok(args)
    }

    fn get_stat(&self) -> Answer {
        let mut out = String::new();
        let _ = writeln!(out, "START_TIME {}", self.start_time);
        let _ = writeln!(
            out,
            "MANUAL_RELOAD_TIME {}",
            self.reload_time
                .lock()
                .unwrap()
                .map(|t| t.to_string())
                .unwrap_or_default()
        );
        out.push_str(&self.cluster().get_stat());

        let mut args = Dict::new();
        args.insert("stat".to_string(), Value::from(out));
        Answer::ok(args)
    }

    fn set_active(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let sid = quest.args.want_int("sid")?;
        let active = quest
            .args
            .get("active")
            .and_then(Value::as_bool)
            .ok_or_else(|| xic::Error::Argument("missing parameter 'active'".to_string()))?;

        let ok = self.cluster().set_active(sid, active);
        let mut args = Dict::new();
        args.insert("ok".to_string(), Value::Bool(ok));
        Ok(Answer::ok(args))
    }

    fn all_kinds(&self) -> Answer {
        let mut args = Dict::new();
        args.insert(
            "allKinds".to_string(),
            Value::from(self.cluster().setting().all_kinds_report()),
        );
        Answer::ok(args)
    }

    fn all_servers(&self) -> Answer {
        let mut args = Dict::new();
        args.insert(
            "allServers".to_string(),
            Value::from(self.cluster().setting().all_servers_report()),
        );
        Answer::ok(args)
    }
}

#[async_trait::async_trait]
impl xic::Servant for DbManServant {
    async fn process(&self, quest: Quest, current: &Current) -> anyhow::Result<Answer> {
        match quest.method.as_str() {
            "sQuery" => self.s_query(&quest, current).await,
            "mQuery" => self.m_query(&quest, current).await,
            "tableNumber" => self.table_number(&quest),
            "xidName" => self.xid_name(&quest),
            "kindInfo" => self.kind_info(&quest),
            "kindVersions" => self.kind_versions(&quest),
            "reloadDBSetting" => Ok(self.reload_db_setting().await),
            "getStat" => Ok(self.get_stat()),
            "setActive" => self.set_active(&quest),
            "allKinds" => Ok(self.all_kinds()),
            "allServers" => Ok(self.all_servers()),
            method => Err(xic::Error::NotFound(format!(
                "method '{method}' of service '{}'",
                quest.service
            ))
            .into()),
        }
    }
}
