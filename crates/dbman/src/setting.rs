//! The logical schema snapshot: servers, kinds and their table layouts,
//! loaded from the settings database. A snapshot is immutable after load
//! (bar the per-server active flag); reloads build a fresh snapshot and
//! swap the cluster pointer.

use sqlx::{MySqlConnection, Row};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum SettingError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug)]
pub struct ServerSetting {
    pub sid: i64,
    /// Zero means this server is a primary.
    pub master_sid: i64,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub passwd: String,
    active: AtomicBool,
    pub slaves: Vec<i64>,
}

impl ServerSetting {
    pub fn active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    pub fn is_master(&self) -> bool {
        self.master_sid == 0
    }
}

#[derive(Debug, Clone)]
pub struct TableSetting {
    pub sid: i64,
    pub db_name: String,
}

#[derive(Debug)]
pub struct KindSetting {
    pub enable: bool,
    pub version: i64,
    pub table_num: i64,
    pub table_prefix: String,
    pub id_field: String,
    /// Exactly `table_num` entries, in shard order.
    pub tables: Vec<TableSetting>,
}

#[derive(Debug, Clone)]
pub struct ServerRow {
    pub sid: i64,
    pub master_sid: i64,
    pub host: String,
    pub port: i64,
    pub user: String,
    pub passwd: String,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct KindRow {
    pub kind: String,
    pub table_num: i64,
    pub table_prefix: String,
    pub id_field: String,
    pub enable: bool,
    pub version: i64,
}

#[derive(Debug, Clone)]
pub struct TableRow {
    pub kind: String,
    pub no: i64,
    pub sid: i64,
    pub db_name: String,
}

pub struct DbSetting {
    revision: String,
    load_time: u64,
    servers: BTreeMap<i64, Arc<ServerSetting>>,
    kinds: BTreeMap<String, Arc<KindSetting>>,
}

pub async fn fetch_revision(conn: &mut MySqlConnection) -> Result<String, SettingError> {
    let row = sqlx::query("select value from variable_setting where name='revision'")
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row
        .map(|r| r.try_get_unchecked::<String, _>(0))
        .transpose()?
        .unwrap_or_default())
}

impl DbSetting {
    /// Load a fresh snapshot. In strict mode any inconsistency fails the
    /// load; otherwise the offending kind is discarded with a warning.
    pub async fn load(conn: &mut MySqlConnection, strict: bool) -> Result<Self, SettingError> {
        let revision = fetch_revision(&mut *conn).await?;

        let server_rows = sqlx::query(
            "select sid, master_sid, host, port, user, passwd, active from server_setting",
        )
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(|r| {
            Ok(ServerRow {
                sid: r.try_get_unchecked(0)?,
                master_sid: r.try_get_unchecked(1)?,
                host: r.try_get_unchecked(2)?,
                port: r.try_get_unchecked(3)?,
                user: r.try_get_unchecked(4)?,
                passwd: r.try_get_unchecked(5)?,
                active: r.try_get_unchecked::<i64, _>(6)? != 0,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?;

        let kind_rows = sqlx::query(
            "select kind, table_num, table_prefix, id_field, enable, version from kind_setting",
        )
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(|r| {
            Ok(KindRow {
                kind: r.try_get_unchecked(0)?,
                table_num: r.try_get_unchecked(1)?,
                table_prefix: r.try_get_unchecked(2)?,
                id_field: r.try_get_unchecked(3)?,
                enable: r.try_get_unchecked::<i64, _>(4)? != 0,
                version: r.try_get_unchecked(5)?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?;

        let table_rows =
            sqlx::query("select `kind`, `no`, `sid`, `db_name` from table_setting")
                .fetch_all(&mut *conn)
                .await?
                .into_iter()
                .map(|r| {
                    Ok(TableRow {
                        kind: r.try_get_unchecked(0)?,
                        no: r.try_get_unchecked(1)?,
                        sid: r.try_get_unchecked(2)?,
                        db_name: r.try_get_unchecked(3)?,
                    })
                })
                .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Self::build(revision, server_rows, kind_rows, table_rows, strict)
    }

    /// Assemble a snapshot from raw setting rows.
    pub fn build(
        revision: String,
        server_rows: Vec<ServerRow>,
        kind_rows: Vec<KindRow>,
        mut table_rows: Vec<TableRow>,
        strict: bool,
    ) -> Result<Self, SettingError> {
        let mut servers: BTreeMap<i64, ServerSetting> = BTreeMap::new();
        for row in server_rows {
            servers.insert(
                row.sid,
                ServerSetting {
                    sid: row.sid,
                    master_sid: row.master_sid,
                    host: row.host,
                    port: row.port.try_into().map_err(|_| {
                        SettingError::Invalid(format!(
                            "invalid port {} for server (sid={})",
                            row.port, row.sid
                        ))
                    })?,
                    user: row.user,
                    passwd: row.passwd,
                    active: AtomicBool::new(row.active),
                    slaves: Vec::new(),
                },
            );
        }

        // Wire replicas onto their primaries.
        let slave_links: Vec<(i64, i64)> = servers
            .values()
            .filter(|s| s.master_sid != 0)
            .map(|s| (s.sid, s.master_sid))
            .collect();
        for (sid, master_sid) in slave_links {
            // (exists, its own master_sid) of the linked primary.
            let link = servers.get(&master_sid).map(|m| m.master_sid);
            match link {
                None => {
                    let msg = format!(
                        "no such master server (sid={master_sid}) in server_setting for server (sid={sid})"
                    );
                    if strict {
                        return Err(SettingError::Invalid(msg));
                    }
                    tracing::warn!("{msg}");
                }
                Some(nested) if nested != 0 => {
                    let msg = format!(
                        "server (sid={master_sid}) is a replica of server ({nested}) but primary of server ({sid})"
                    );
                    if strict {
                        return Err(SettingError::Invalid(msg));
                    }
                    tracing::warn!("{msg}");
                }
                Some(_) => {
                    if let Some(master) = servers.get_mut(&master_sid) {
                        master.slaves.push(sid);
                    }
                }
            }
        }
        let servers: BTreeMap<i64, Arc<ServerSetting>> = servers
            .into_iter()
            .map(|(sid, s)| (sid, Arc::new(s)))
            .collect();

        let mut kinds: BTreeMap<String, KindSetting> = BTreeMap::new();
        for row in kind_rows {
            kinds.insert(
                row.kind,
                KindSetting {
                    enable: row.enable,
                    version: row.version,
                    table_num: row.table_num,
                    table_prefix: row.table_prefix,
                    id_field: row.id_field,
                    tables: Vec::new(),
                },
            );
        }

        // Tables arrive in arbitrary order; group per kind by shard no.
        table_rows.sort_by(|a, b| a.kind.cmp(&b.kind).then(a.no.cmp(&b.no)));
        for row in table_rows {
            let Some(ks) = kinds.get_mut(&row.kind) else {
                tracing::warn!(kind = %row.kind, "kind in table_setting but not in kind_setting");
                continue;
            };

            if row.no != ks.tables.len() as i64 {
                let msg = format!(
                    "missing table no {} in table_setting for kind={}",
                    ks.tables.len(),
                    row.kind
                );
                if strict {
                    return Err(SettingError::Invalid(msg));
                }
                tracing::warn!("{msg}");
                // Poison the kind so the completeness reap drops it.
                ks.tables.clear();
                ks.table_num = -1;
                continue;
            }

            match servers.get(&row.sid) {
                Some(server) if server.is_master() => {}
                _ => {
                    let msg = format!(
                        "no such server (sid={}) or it's not a primary for table (kind={} no={})",
                        row.sid, row.kind, row.no
                    );
                    if strict {
                        return Err(SettingError::Invalid(msg));
                    }
                    tracing::warn!("{msg}");
                    ks.tables.clear();
                    ks.table_num = -1;
                    continue;
                }
            }

            ks.tables.push(TableSetting {
                sid: row.sid,
                db_name: row.db_name,
            });
        }

        // Discard kinds whose table list came out incomplete; a strict
        // load fails on them instead.
        if strict {
            for (kind, ks) in &kinds {
                if ks.tables.len() as i64 != ks.table_num {
                    return Err(SettingError::Invalid(format!(
                        "not enough tables (got {}, should have {}) in table_setting for kind={kind}",
                        ks.tables.len(),
                        ks.table_num
                    )));
                }
            }
        }
        kinds.retain(|kind, ks| {
            let complete = ks.tables.len() as i64 == ks.table_num;
            if !complete {
                tracing::warn!(kind = %kind, "kind has invalid table_setting entries, discarded");
            }
            complete
        });

        Ok(Self {
            revision,
            load_time: unix_now(),
            servers,
            kinds: kinds.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
        })
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn load_time(&self) -> u64 {
        self.load_time
    }

    pub fn kind(&self, kind: &str) -> Option<Arc<KindSetting>> {
        self.kinds.get(kind).cloned()
    }

    pub fn server(&self, sid: i64) -> Option<Arc<ServerSetting>> {
        self.servers.get(&sid).cloned()
    }

    /// Formatted kind listing for the admin surface.
    pub fn all_kinds_report(&self) -> String {
        let width = self.kinds.keys().map(String::len).max().unwrap_or(0);
        let mut out = String::new();
        for (kind, ks) in &self.kinds {
            let _ = write!(
                out,
                "{kind:<width$} {} {} {} [",
                ks.id_field,
                ks.table_num,
                if ks.enable { "enable" } else { "disable" },
            );
            for (i, t) in ks.tables.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}", t.sid);
            }
            out.push_str("]\n");
        }
        out
    }

    /// Formatted server listing for the admin surface.
    pub fn all_servers_report(&self) -> String {
        let mut out = String::new();
        for (sid, ss) in &self.servers {
            let _ = write!(
                out,
                "{sid} {} {}:{} {} [",
                ss.master_sid,
                ss.host,
                ss.port,
                if ss.active() { "active" } else { "inactive" },
            );
            for (i, slave) in ss.slaves.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{slave}");
            }
            out.push_str("]\n");
        }
        out
    }
}

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(sid: i64, master_sid: i64) -> ServerRow {
        ServerRow {
            sid,
            master_sid,
            host: format!("db{sid}.internal"),
            port: 3306,
            user: "app".to_string(),
            passwd: "secret".to_string(),
            active: true,
        }
    }

    fn kind(name: &str, table_num: i64) -> KindRow {
        KindRow {
            kind: name.to_string(),
            table_num,
            table_prefix: "u".to_string(),
            id_field: "id".to_string(),
            enable: true,
            version: 1,
        }
    }

    fn table(kind: &str, no: i64, sid: i64) -> TableRow {
        TableRow {
            kind: kind.to_string(),
            no,
            sid,
            db_name: "appdb".to_string(),
        }
    }

    #[test]
    fn builds_a_complete_snapshot() {
        let setting = DbSetting::build(
            "r1".to_string(),
            vec![server(1, 0), server(2, 1), server(3, 1)],
            vec![kind("user", 2)],
            vec![table("user", 0, 1), table("user", 1, 1)],
            true,
        )
        .unwrap();

        assert_eq!(setting.revision(), "r1");
        let ks = setting.kind("user").unwrap();
        assert_eq!(ks.tables.len(), 2);
        assert_eq!(setting.server(1).unwrap().slaves, vec![2, 3]);
        assert!(setting.server(2).unwrap().master_sid == 1);
    }

    #[test]
    fn incomplete_kind_is_discarded_when_lenient() {
        let setting = DbSetting::build(
            "r1".to_string(),
            vec![server(1, 0)],
            vec![kind("user", 3), kind("log", 1)],
            // Table no 1 is missing for `user`.
            vec![table("user", 0, 1), table("user", 2, 1), table("log", 0, 1)],
            false,
        )
        .unwrap();

        assert!(setting.kind("user").is_none());
        assert!(setting.kind("log").is_some());
    }

    #[test]
    fn incomplete_kind_fails_a_strict_load() {
        let err = DbSetting::build(
            "r1".to_string(),
            vec![server(1, 0)],
            vec![kind("user", 3)],
            vec![table("user", 0, 1), table("user", 2, 1)],
            true,
        );
        assert!(err.is_err());
    }

    #[test]
    fn table_on_a_replica_is_rejected() {
        // sid 2 is a replica; a table on it poisons the kind.
        let rows = (
            vec![server(1, 0), server(2, 1)],
            vec![kind("user", 1)],
            vec![table("user", 0, 2)],
        );

        let lenient = DbSetting::build(
            "r".to_string(),
            rows.0.clone(),
            rows.1.clone(),
            rows.2.clone(),
            false,
        )
        .unwrap();
        assert!(lenient.kind("user").is_none());

        assert!(DbSetting::build("r".to_string(), rows.0, rows.1, rows.2, true).is_err());
    }

    #[test]
    fn missing_master_link() {
        let rows = (
            vec![server(1, 0), server(2, 9)],
            vec![kind("user", 1)],
            vec![table("user", 0, 1)],
        );
        // Lenient: the dangling replica is ignored.
        let setting = DbSetting::build(
            "r".to_string(),
            rows.0.clone(),
            rows.1.clone(),
            rows.2.clone(),
            false,
        )
        .unwrap();
        assert!(setting.server(1).unwrap().slaves.is_empty());

        assert!(DbSetting::build("r".to_string(), rows.0, rows.1, rows.2, true).is_err());
    }

    #[test]
    fn active_flag_toggles_on_the_snapshot() {
        let setting = DbSetting::build(
            "r".to_string(),
            vec![server(1, 0)],
            vec![],
            vec![],
            true,
        )
        .unwrap();
        let ss = setting.server(1).unwrap();
        assert!(ss.active());
        ss.set_active(false);
        assert!(!setting.server(1).unwrap().active());
    }
}
