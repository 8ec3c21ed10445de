//! Per-primary connection pooling: one primary pool plus one pool per
//! replica, bounded write/read job queues, keepalive pings, and automatic
//! reconnection when a pool loses its last connection.

use crate::job::QueryJob;
use crate::setting::{DbSetting, ServerSetting};
use sqlx::mysql::MySqlConnectOptions;
use sqlx::{ConnectOptions, Connection, Executor, MySqlConnection};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const MASTER_QUEUE_SIZE: usize = 256;
const SLAVE_QUEUE_SIZE: usize = 64;
const DEFAULT_POOL_SIZE: usize = 4;
const MAX_POOL_SIZE: usize = 256;
const RECON_INTERVAL: Duration = Duration::from_secs(5);
const PING_INTERVAL: Duration = Duration::from_secs(20);
/// A pool that just faulted is not dialed again until this elapses.
const FAULT_COOLDOWN: Duration = Duration::from_secs(1);

/// One live database connection, borrowed from a team pool for the
/// duration of a job run.
pub struct DbConnection {
    conn: MySqlConnection,
    slave_no: i32,
    current_db: Option<String>,
    healthy: bool,
    active_at: Instant,
}

impl DbConnection {
    pub async fn connect(
        ss: &ServerSetting,
        charset: &str,
        slave_no: i32,
    ) -> Result<Self, sqlx::Error> {
        let options = MySqlConnectOptions::new()
            .host(&ss.host)
            .port(ss.port)
            .username(&ss.user)
            .password(&ss.passwd)
            .charset(charset);
        let conn = options.connect().await?;
        Ok(Self {
            conn,
            slave_no,
            current_db: None,
            healthy: true,
            active_at: Instant::now(),
        })
    }

    pub fn conn(&mut self) -> &mut MySqlConnection {
        &mut self.conn
    }

    /// Negative slave_no marks a primary connection.
    pub fn master(&self) -> bool {
        self.slave_no < 0
    }

    pub fn healthy(&self) -> bool {
        self.healthy
    }

    fn touch(&mut self) {
        self.active_at = Instant::now();
    }

    /// Switch the default database when the job targets another one.
    pub async fn use_db(&mut self, db: &str) -> Result<(), sqlx::Error> {
        if self.current_db.as_deref() == Some(db) {
            return Ok(());
        }
        let stmt = format!("USE `{}`", db.replace('`', "``"));
        self.conn.execute(stmt.as_str()).await?;
        self.current_db = Some(db.to_string());
        Ok(())
    }

    pub async fn rollback(&mut self) {
        if let Err(err) = self.conn.execute("ROLLBACK").await {
            tracing::warn!(err = %err, "rollback failed");
            self.healthy = false;
        }
    }

    pub async fn ping(&mut self) -> Result<(), sqlx::Error> {
        self.conn.ping().await
    }

    /// After a query failure, decide whether the connection survives: a
    /// statement-level error keeps it if a ping succeeds, anything else
    /// faults it.
    pub async fn note_query_error(&mut self, err: &sqlx::Error) {
        match err {
            sqlx::Error::Database(_) => {
                if self.conn.ping().await.is_err() {
                    self.healthy = false;
                }
            }
            _ => self.healthy = false,
        }
    }
}

struct Pool {
    ss: Arc<ServerSetting>,
    slave_no: i32,
    idle: Vec<DbConnection>,
    num_busy: usize,
    error: bool,
    error_at: Option<Instant>,
}

impl Pool {
    fn new(ss: Arc<ServerSetting>, slave_no: i32) -> Self {
        Self {
            ss,
            slave_no,
            idle: Vec::new(),
            num_busy: 0,
            error: false,
            error_at: None,
        }
    }

    /// Whether a fresh dial is permitted: not during the fault cool-down.
    fn may_dial(&self) -> bool {
        match self.error_at {
            Some(at) => at.elapsed() >= FAULT_COOLDOWN,
            None => true,
        }
    }
}

struct TeamState {
    master: Pool,
    slaves: Vec<Pool>,
    master_queue: VecDeque<QueryJob>,
    slave_queue: VecDeque<QueryJob>,
    last_slave: usize,
    shutdown: bool,
}

struct TeamInner {
    charset: String,
    max_all: usize,
    max_read: usize,
    state: Mutex<TeamState>,
}

#[derive(Clone)]
pub struct DbTeam {
    inner: Arc<TeamInner>,
}

/// Pool identifier within a team: -1 is the primary, otherwise the
/// replica index.
type PoolId = i32;

impl DbTeam {
    pub fn new(
        setting: &DbSetting,
        master: Arc<ServerSetting>,
        charset: &str,
        max_con: usize,
    ) -> Self {
        let max_all = match max_con {
            0 => DEFAULT_POOL_SIZE,
            n => n.min(MAX_POOL_SIZE),
        };
        let max_read = (max_all * 3 + 3) / 4;

        let slaves = master
            .slaves
            .iter()
            .enumerate()
            .filter_map(|(i, sid)| Some(Pool::new(setting.server(*sid)?, i as i32)))
            .collect();

        let team = Self {
            inner: Arc::new(TeamInner {
                charset: charset.to_string(),
                max_all,
                max_read,
                state: Mutex::new(TeamState {
                    master: Pool::new(master, -1),
                    slaves,
                    master_queue: VecDeque::new(),
                    slave_queue: VecDeque::new(),
                    last_slave: 0,
                    shutdown: false,
                }),
            }),
        };

        let pinger = team.clone();
        tokio::spawn(async move { pinger.ping_loop().await });
        team
    }

    pub fn shutdown(&self) {
        let cancelled: Vec<QueryJob> = {
            let mut guard = self.inner.state.lock().unwrap();
            let state = &mut *guard;
            state.shutdown = true;
            state.master.idle.clear();
            for pool in &mut state.slaves {
                pool.idle.clear();
            }
            state
                .master_queue
                .drain(..)
                .chain(state.slave_queue.drain(..))
                .collect()
        };
        for job in cancelled {
            job.cancel(&xic::Error::Overload("shutting down".to_string()));
        }
    }

    /// Run `job` (or just drain queues when None). Policy: replicas by
    /// round-robin fewest-busy for reads, the primary for writes and as
    /// the read fallback under its read cap. With no connection to be
    /// had, the job queues or cancels on overflow.
    pub async fn work(&self, job: Option<QueryJob>, master: bool) {
        let mut job = job;

        let Some((pool_id, ss, existing)) = self.acquire(master) else {
            if let Some(job) = job.take() {
                self.enqueue(job, master);
            }
            self.discard_jobs();
            return;
        };

        let mut con = match existing {
            Some(con) => con,
            None => {
                // Fresh slot: park the job on the queue while we dial.
                if let Some(job) = job.take() {
                    self.enqueue(job, master);
                }
                match DbConnection::connect(&ss, &self.inner.charset, pool_id).await {
                    Ok(con) => con,
                    Err(err) => {
                        tracing::warn!(sid = ss.sid, err = %err, "database connect failed");
                        self.release(pool_id, None);
                        self.discard_jobs();
                        return;
                    }
                }
            }
        };

        if let Some(job) = job.take() {
            job.run(&mut con).await;
        }
        while con.healthy() {
            let Some(job) = self.fetch_job(con.master()) else {
                break;
            };
            job.run(&mut con).await;
        }

        self.release(pool_id, Some(con));
    }

    fn acquire(&self, master: bool) -> Option<(PoolId, Arc<ServerSetting>, Option<DbConnection>)> {
        let mut guard = self.inner.state.lock().unwrap();
        let state = &mut *guard;
        if state.shutdown {
            return None;
        }
        let max_all = self.inner.max_all;
        let max_read = self.inner.max_read;

        if !master && !state.slaves.is_empty() {
            let num = state.slaves.len();
            let mut pick: Option<usize> = None;
            let mut which = state.last_slave;
            for _ in 0..num {
                if which >= num {
                    which = 0;
                }
                let p = &state.slaves[which];
                if !p.error && p.ss.active() && p.num_busy < max_all && p.may_dial() {
                    let better = match pick {
                        None => true,
                        Some(best) => state.slaves[best].num_busy > p.num_busy,
                    };
                    if better {
                        pick = Some(which);
                        state.last_slave = which;
                        if state.slaves[which].num_busy == 0 {
                            break;
                        }
                    }
                }
                which += 1;
            }

            if let Some(index) = pick {
                let pool = &mut state.slaves[index];
                pool.num_busy += 1;
                let con = pool.idle.pop();
                return Some((pool.slave_no, pool.ss.clone(), con));
            }
        }

        let pool = &mut state.master;
        let admits = pool.num_busy < max_read || (master && pool.num_busy < max_all);
        if !pool.error && pool.ss.active() && admits && pool.may_dial() {
            pool.num_busy += 1;
            let con = pool.idle.pop();
            return Some((-1, pool.ss.clone(), con));
        }
        None
    }

    /// Return a borrowed slot. `None` or an unhealthy connection counts
    /// as a failure; losing the last connection of a pool flags it
    /// errored and starts the reconnect task.
    fn release(&self, pool_id: PoolId, con: Option<DbConnection>) {
        let start_reconnect = {
            let mut state = self.inner.state.lock().unwrap();
            let shutdown = state.shutdown;
            let pool = pool_mut(&mut state, pool_id);
            pool.num_busy -= 1;

            match con {
                Some(mut con) if con.healthy() => {
                    pool.error = false;
                    pool.error_at = None;
                    if !shutdown {
                        con.touch();
                        pool.idle.push(con);
                    }
                    false
                }
                _ => {
                    pool.error_at = Some(Instant::now());
                    if pool.num_busy == 0 && pool.idle.is_empty() && !shutdown {
                        pool.error = true;
                        // Reserve the slot for the reconnect task.
                        pool.num_busy += 1;
                        true
                    } else {
                        false
                    }
                }
            }
        };

        if start_reconnect {
            let team = self.clone();
            tokio::spawn(async move { team.reconnect_loop(pool_id).await });
        }
    }

    async fn reconnect_loop(&self, pool_id: PoolId) {
        loop {
            tokio::time::sleep(RECON_INTERVAL).await;

            let (ss, shutdown) = {
                let mut state = self.inner.state.lock().unwrap();
                let shutdown = state.shutdown;
                let pool = pool_mut(&mut state, pool_id);
                (pool.ss.clone(), shutdown)
            };
            if shutdown {
                self.release(pool_id, None);
                return;
            }

            match DbConnection::connect(&ss, &self.inner.charset, pool_id).await {
                Ok(con) => {
                    tracing::info!(sid = ss.sid, "database reconnected");
                    self.release(pool_id, Some(con));
                    // Kick a drain pass over whatever queued meanwhile.
                    let team = self.clone();
                    let master = pool_id < 0;
                    tokio::spawn(async move { team.work(None, master).await });
                    return;
                }
                Err(err) => {
                    tracing::warn!(sid = ss.sid, err = %err, "database reconnect failed");
                    self.discard_jobs();
                }
            }
        }
    }

    fn enqueue(&self, job: QueryJob, master: bool) {
        let overflow = {
            let mut state = self.inner.state.lock().unwrap();
            if master {
                if state.master_queue.len() < MASTER_QUEUE_SIZE {
                    state.master_queue.push_back(job);
                    None
                } else {
                    Some((job, "BUSY TO WRITE"))
                }
            } else if state.slave_queue.len() < SLAVE_QUEUE_SIZE {
                state.slave_queue.push_back(job);
                None
            } else {
                Some((job, "BUSY TO READ"))
            }
        };

        if let Some((job, what)) = overflow {
            let message = format!("{what}, group={} kind={}", self.master_sid(), job.kind);
            job.cancel(&xic::Error::Overload(message));
        }
    }

    fn fetch_job(&self, master: bool) -> Option<QueryJob> {
        let mut state = self.inner.state.lock().unwrap();
        if master {
            if let Some(job) = state.master_queue.pop_front() {
                return Some(job);
            }
        }
        if !state.slave_queue.is_empty() {
            if !master || state.master.num_busy < self.inner.max_read {
                return state.slave_queue.pop_front();
            }
        }
        None
    }

    /// Fail queued jobs that no pool can serve anymore.
    fn discard_jobs(&self) {
        let jobs: Vec<QueryJob> = {
            let mut state = self.inner.state.lock().unwrap();
            let mut out = Vec::new();
            if state.master.error {
                out.extend(state.master_queue.drain(..));
                let slaves_dead = state.slaves.iter().all(|p| p.error);
                if slaves_dead {
                    out.extend(state.slave_queue.drain(..));
                }
            }
            out
        };
        for job in jobs {
            job.cancel(&xic::Error::Overload("NO CONNECTION".to_string()));
        }
    }

    /// Keepalive: ping idle connections that sat unused for a while,
    /// dropping the ones that fail.
    async fn ping_loop(&self) {
        loop {
            tokio::time::sleep(PING_INTERVAL).await;

            let stale: Vec<(PoolId, DbConnection)> = {
                let mut guard = self.inner.state.lock().unwrap();
                let state = &mut *guard;
                if state.shutdown {
                    return;
                }
                let mut out = Vec::new();
                let pools = std::iter::once(&mut state.master).chain(state.slaves.iter_mut());
                for pool in pools {
                    let mut keep = Vec::new();
                    for con in pool.idle.drain(..) {
                        if con.active_at.elapsed() >= PING_INTERVAL {
                            pool.num_busy += 1;
                            out.push((pool.slave_no, con));
                        } else {
                            keep.push(con);
                        }
                    }
                    pool.idle = keep;
                }
                out
            };

            for (pool_id, mut con) in stale {
                if let Err(err) = con.ping().await {
                    tracing::info!(err = %err, "idle connection failed its keepalive ping");
                    con.healthy = false;
                }
                self.release(pool_id, Some(con));
            }
        }
    }

    fn master_sid(&self) -> i64 {
        self.inner.state.lock().unwrap().master.ss.sid
    }

    /// Pool status lines for the admin stat surface.
    pub fn stat_report(&self, out: &mut String) {
        let state = self.inner.state.lock().unwrap();
        let master_sid = state.master.ss.sid;
        let _ = writeln!(out, "BEGIN Group_{master_sid}");
        for pool in std::iter::once(&state.master).chain(state.slaves.iter()) {
            let _ = writeln!(
                out,
                "{}G{}:{} {}:{} {} {} busy={} idle={}",
                if pool.ss.sid == master_sid { '+' } else { '-' },
                master_sid,
                pool.ss.sid,
                pool.ss.host,
                pool.ss.port,
                if pool.ss.active() { "active" } else { "inactive" },
                if pool.error { "error" } else { "normal" },
                pool.num_busy,
                pool.idle.len(),
            );
        }
        let _ = writeln!(out, "END Group_{master_sid}");
    }
}

fn pool_mut(state: &mut TeamState, pool_id: PoolId) -> &mut Pool {
    if pool_id < 0 {
        &mut state.master
    } else {
        &mut state.slaves[pool_id as usize]
    }
}
