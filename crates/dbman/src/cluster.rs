//! Cluster: sid → team map over one settings snapshot. Teams build
//! lazily; a settings reload swaps in a whole new cluster and drains the
//! old one.

use crate::job::QueryJob;
use crate::setting::DbSetting;
use crate::team::DbTeam;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

pub struct DbCluster {
    setting: Arc<DbSetting>,
    charset: String,
    max_con: usize,
    teams: Mutex<HashMap<i64, DbTeam>>,
}

impl DbCluster {
    pub fn new(setting: Arc<DbSetting>, charset: &str, max_con: usize) -> Self {
        Self {
            setting,
            charset: charset.to_string(),
            max_con,
            teams: Mutex::new(HashMap::new()),
        }
    }

    pub fn setting(&self) -> &Arc<DbSetting> {
        &self.setting
    }

    fn team(&self, sid: i64) -> Result<DbTeam, xic::Error> {
        let mut teams = self.teams.lock().unwrap();
        if let Some(team) = teams.get(&sid) {
            return Ok(team.clone());
        }
        let ss = self
            .setting
            .server(sid)
            .ok_or_else(|| xic::Error::NotFound(format!("no ServerSetting for sid({sid})")))?;
        let team = DbTeam::new(&self.setting, ss, &self.charset, self.max_con);
        teams.insert(sid, team.clone());
        Ok(team)
    }

    /// Route a job to its team; execution proceeds on its own task, and
    /// failure to route answers the job's waiter directly.
    pub fn assign_job(&self, job: QueryJob) {
        let team = match self.team(job.sid) {
            Ok(team) => team,
            Err(err) => {
                job.cancel(&err);
                return;
            }
        };
        let master = job.master;
        tokio::spawn(async move { team.work(Some(job), master).await });
    }

    pub fn get_stat(&self) -> String {
        let teams: Vec<DbTeam> = self.teams.lock().unwrap().values().cloned().collect();

        let mut out = String::new();
        let _ = writeln!(
            out,
            "SETTING_LOAD_TIME {}\nSETTING_REVISION {}\nMAX_DB_CONNECTION {}",
            self.setting.load_time(),
            self.setting.revision(),
            self.max_con
        );
        for team in teams {
            team.stat_report(&mut out);
        }
        out
    }

    pub fn set_active(&self, sid: i64, active: bool) -> bool {
        match self.setting.server(sid) {
            Some(ss) => {
                ss.set_active(active);
                true
            }
            None => false,
        }
    }

    /// Drain and close every team, asynchronously to the caller.
    pub fn shutdown(&self) {
        let teams: Vec<DbTeam> = self.teams.lock().unwrap().values().cloned().collect();
        for team in teams {
            team.shutdown();
        }
    }
}
