//! Single-statement and multi-statement-transaction query jobs. A job is
//! validated and rewritten up front, queued or run on a borrowed
//! connection, and delivers its answer through a oneshot waiter.

use crate::caller_kind::{CallerKindMap, CallerKindMd5};
use crate::setting::{unix_now, DbSetting};
use crate::sqlrw;
use crate::team::DbConnection;
use futures::TryStreamExt;
use sqlx::mysql::{MySqlQueryResult, MySqlRow};
use sqlx::{Column, Executor, Row, TypeInfo};
use tokio::sync::oneshot;
use xic::{Answer, Dict, DictExt, Value};

const MAX_TRANSACTION_STATEMENTS: usize = 100;

enum Plan {
    Single {
        query: String,
    },
    /// `BEGIN; s1; …; COMMIT` as one multi-statement text query.
    Multi {
        query: String,
        statements: usize,
    },
}

pub struct QueryJob {
    pub sid: i64,
    pub master: bool,
    pub kind: String,
    pub db_name: String,
    convert: bool,
    preserve_null: bool,
    plan: Plan,
    waiter: oneshot::Sender<Answer>,
}

pub type JobWaiter = oneshot::Receiver<Answer>;

/// Shared argument handling: which caller over which transport
/// connection, and whether context or args force primary routing.
struct Routing {
    master: bool,
    caller: String,
    con_info: String,
    now: u64,
}

impl Routing {
    fn from_quest(quest: &xic::Quest, con_info: &str) -> Self {
        Self {
            master: quest.ctx.get_bool("MASTER") || quest.args.get_bool("master"),
            caller: quest.ctx.get_str("CALLER").unwrap_or_default().to_string(),
            con_info: con_info.to_string(),
            now: unix_now(),
        }
    }

    /// Record writes and consult the stickiness window for reads.
    fn apply_stickiness(&mut self, writers: &CallerKindMap, kind: &str, may_write: bool) {
        if self.caller.is_empty() {
            return;
        }
        let ck = CallerKindMd5::new(&self.con_info, &self.caller, kind);
        if may_write {
            writers.replace(self.now, ck);
        } else if writers.find(self.now, &ck) {
            self.master = true;
        }
    }
}

impl QueryJob {
    /// Build a single-statement job from quest arguments.
    pub fn single(
        quest: &xic::Quest,
        con_info: &str,
        setting: &DbSetting,
        writers: &CallerKindMap,
    ) -> Result<(Self, JobWaiter), xic::Error> {
        let args = &quest.args;
        let sql_raw = std::str::from_utf8(args.want_blob("sql")?)
            .map_err(|_| xic::Error::Argument("sql is not UTF-8".to_string()))?
            .trim()
            .to_string();
        if sql_raw.is_empty() {
            return Err(xic::Error::Argument("EMPTY SQL".to_string()));
        }

        let statement =
            sqlrw::parse(&sql_raw).map_err(|err| xic::Error::Argument(err.to_string()))?;

        let kind = match args.get_str("kind") {
            Some(kind) if !kind.is_empty() => kind.to_string(),
            _ => statement
                .table_name()
                .ok_or_else(|| {
                    xic::Error::Argument(format!(
                        "table name can't be got from sql: {sql_raw}"
                    ))
                })?
                .to_string(),
        };

        let hint_id = args.want_int("hintId")?;
        let convert = args.get_bool("convert");
        let preserve_null = args.get_bool("null");

        let ks = setting
            .kind(&kind)
            .ok_or_else(|| xic::Error::NotFound(format!("no such kind({kind}) in DBSetting")))?;
        if !ks.enable {
            return Err(xic::Error::Argument(format!("disabled kind({kind})")));
        }

        let table_no = if ks.table_num > 1 {
            sqlrw::floored_mod(hint_id, ks.table_num)
        } else {
            0
        };
        let table = &ks.tables[table_no as usize];

        let mut routing = Routing::from_quest(quest, con_info);
        let may_write = statement.may_write();
        if may_write {
            routing.master = true;
        }
        routing.apply_stickiness(writers, &kind, may_write);
        if !may_write && routing.master {
            tracing::info!(sql = %sql_raw, "reading sql goes to the primary");
        }

        let query = statement
            .rewrite(&kind, &ks.table_prefix, ks.table_num, table_no)
            .unwrap_or_else(|| statement.sql().to_string());

        let (tx, rx) = oneshot::channel();
        Ok((
            Self {
                sid: table.sid,
                master: routing.master,
                kind,
                db_name: table.db_name.clone(),
                convert,
                preserve_null,
                plan: Plan::Single { query },
                waiter: tx,
            },
            rx,
        ))
    }

    /// Build a transaction job. All statements must land on the same
    /// (server, database, shard layout).
    pub fn multi(
        quest: &xic::Quest,
        con_info: &str,
        setting: &DbSetting,
        writers: &CallerKindMap,
    ) -> Result<(Self, JobWaiter), xic::Error> {
        let args = &quest.args;
        let sqls = args.want_list("sqls")?;
        if sqls.is_empty() {
            return Err(xic::Error::Argument("no sql given".to_string()));
        }
        if sqls.len() > MAX_TRANSACTION_STATEMENTS {
            return Err(xic::Error::Argument(format!(
                "too many sqls, the number of sqls should be not greater than {MAX_TRANSACTION_STATEMENTS}"
            )));
        }

        let mut kinds = args.get_str_seq("kinds");
        if kinds.is_empty() {
            if let Some(kind) = args.get_str("kind") {
                if !kind.is_empty() {
                    kinds.push(kind.to_string());
                }
            }
        }

        let hint_id = args.want_int("hintId")?;
        let convert = args.get_bool("convert");
        let preserve_null = args.get_bool("null");
        let mut routing = Routing::from_quest(quest, con_info);

        let mut query = String::from("BEGIN; ");
        let mut first_kind = String::new();
        let mut last_kind: Option<String> = None;
        let mut layout: Option<(i64, i64, String)> = None; // (table_num, sid, db_name)
        let mut table_no = 0;

        for (i, sql) in sqls.iter().enumerate() {
            let sql_raw = std::str::from_utf8(
                sql.as_bytes()
                    .ok_or_else(|| xic::Error::Argument("sql is not bytes".to_string()))?,
            )
            .map_err(|_| xic::Error::Argument("sql is not UTF-8".to_string()))?
            .trim()
            .to_string();
            if sql_raw.is_empty() {
                return Err(xic::Error::Argument("EMPTY SQL".to_string()));
            }

            let statement =
                sqlrw::parse(&sql_raw).map_err(|err| xic::Error::Argument(err.to_string()))?;

            let kind = match kinds.get(i) {
                Some(kind) => kind.clone(),
                None => match statement.table_name() {
                    Some(name) => name.to_string(),
                    None => last_kind.clone().ok_or_else(|| {
                        xic::Error::Argument("no kind specified".to_string())
                    })?,
                },
            };
            if first_kind.is_empty() {
                first_kind = kind.clone();
            }

            let ks = setting.kind(&kind).ok_or_else(|| {
                xic::Error::NotFound(format!("no such kind({kind}) in DBSetting"))
            })?;
            if !ks.enable {
                return Err(xic::Error::Argument(format!("disabled kind({kind})")));
            }

            if layout.is_none() {
                table_no = if ks.table_num > 1 {
                    sqlrw::floored_mod(hint_id, ks.table_num)
                } else {
                    0
                };
            }
            let table = &ks.tables[table_no as usize];
            match &layout {
                None => {
                    layout = Some((ks.table_num, table.sid, table.db_name.clone()));
                }
                Some((table_num, sid, db_name)) => {
                    if *table_num != ks.table_num || *sid != table.sid || db_name != &table.db_name
                    {
                        return Err(xic::Error::Argument(
                            "SQLs in one transaction must have same table_number, same db server and same db name".to_string(),
                        ));
                    }
                }
            }
            last_kind = Some(kind.clone());

            let may_write = statement.may_write();
            if may_write {
                routing.master = true;
            }
            routing.apply_stickiness(writers, &kind, may_write);
            if !may_write && routing.master {
                tracing::info!(sql = %sql_raw, "reading sql goes to the primary");
            }

            let rewritten = statement
                .rewrite(&kind, &ks.table_prefix, ks.table_num, table_no)
                .unwrap_or_else(|| statement.sql().to_string());
            query.push_str(&rewritten);
            if !rewritten.ends_with(';') {
                query.push_str("; ");
            }
        }
        query.push_str("COMMIT");

        let (_table_num, sid, db_name) = layout.expect("at least one statement was checked");

        let (tx, rx) = oneshot::channel();
        Ok((
            Self {
                sid,
                master: routing.master,
                kind: first_kind,
                db_name,
                convert,
                preserve_null,
                plan: Plan::Multi {
                    query,
                    statements: sqls.len(),
                },
                waiter: tx,
            },
            rx,
        ))
    }

    /// Fail the job without running it.
    pub fn cancel(self, err: &xic::Error) {
        let _ = self
            .waiter
            .send(Answer::from_error(err, "DbMan", "query"));
    }

    /// Run on a borrowed connection and deliver the answer. A failure
    /// leaves its health verdict on the connection for the pool.
    pub async fn run(self, con: &mut DbConnection) {
        let answer = match &self.plan {
            Plan::Single { query } => self.run_single(con, query).await,
            Plan::Multi { query, statements } => self.run_multi(con, query, *statements).await,
        };
        let answer = match answer {
            Ok(answer) => answer,
            Err(err) => {
                tracing::warn!(kind = %self.kind, sid = self.sid, err = %err, "query failed");
                Answer::from_error(
                    &xic::Error::Upstream {
                        status: 1,
                        message: err.to_string(),
                    },
                    "DbMan",
                    "query",
                )
            }
        };
        let _ = self.waiter.send(answer);
    }

    async fn run_single(&self, con: &mut DbConnection, query: &str) -> Result<Answer, sqlx::Error> {
        con.use_db(&self.db_name).await?;

        let sets = match collect_result_sets(con, query).await {
            Ok(sets) => sets,
            Err(err) => {
                con.note_query_error(&err).await;
                return Err(err);
            }
        };

        let mut iter = sets.into_iter();
        let first = iter.next().unwrap_or_default();
        // A single statement yields one set; anything more is unexpected.
        let extra = iter.count();
        if extra > 0 {
            tracing::warn!(extra, query, "unexpected SQL produced trailing result sets");
        }

        let mut args = Dict::new();
        args.insert("converted".to_string(), Value::Bool(self.convert));
        args.insert(
            "affectedRowNumber".to_string(),
            Value::Int(first.affected_rows as i64),
        );
        if first.insert_id != 0 {
            args.insert("insertId".to_string(), Value::Int(first.insert_id as i64));
        }
        self.encode_rows(&mut args, &first);
        Ok(Answer::ok(args))
    }

    async fn run_multi(
        &self,
        con: &mut DbConnection,
        query: &str,
        statements: usize,
    ) -> Result<Answer, sqlx::Error> {
        con.use_db(&self.db_name).await?;

        let sets = match collect_result_sets(con, query).await {
            Ok(sets) => sets,
            Err(err) => {
                // Roll back whatever part of the transaction applied.
                con.rollback().await;
                con.note_query_error(&err).await;
                return Err(err);
            }
        };

        // BEGIN and COMMIT bracket the statement results.
        if sets.len() != statements + 2 {
            con.rollback().await;
            return Err(sqlx::Error::Protocol(format!(
                "expected {} result sets, got {}",
                statements + 2,
                sets.len()
            )));
        }

        let mut args = Dict::new();
        args.insert("converted".to_string(), Value::Bool(self.convert));
        let mut results = Vec::with_capacity(statements);
        for set in &sets[1..=statements] {
            let mut entry = Dict::new();
            entry.insert(
                "affectedRowNumber".to_string(),
                Value::Int(set.affected_rows as i64),
            );
            if set.insert_id != 0 {
                entry.insert("insertId".to_string(), Value::Int(set.insert_id as i64));
            }
            self.encode_rows(&mut entry, set);
            results.push(Value::Dict(entry));
        }
        args.insert("results".to_string(), Value::List(results));
        Ok(Answer::ok(args))
    }

    fn encode_rows(&self, args: &mut Dict, set: &ResultSet) {
        if set.rows.is_empty() && set.fields.is_empty() {
            return;
        }

        args.insert(
            "fields".to_string(),
            Value::List(set.fields.iter().map(|f| Value::from(f.name.clone())).collect()),
        );

        let mut rows = Vec::with_capacity(set.rows.len());
        for row in &set.rows {
            let mut cells = Vec::with_capacity(row.len());
            for (value, field) in row.iter().zip(&set.fields) {
                cells.push(encode_cell(value, field.kind, self.convert, self.preserve_null));
            }
            rows.push(Value::List(cells));
        }
        args.insert("rows".to_string(), Value::List(rows));
    }
}

/// Wire-level column shapes, mapped from the MySQL column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Integer,
    Float,
    Decimal,
    Blob,
    Text,
}

/// `binary` is the column's BINARY flag / binary collation: a
/// VAR_STRING or STRING column carrying it holds bytes, not text.
pub fn field_kind(type_name: &str, binary: bool) -> FieldKind {
    let name = type_name.to_ascii_uppercase();
    let name = name.strip_suffix(" UNSIGNED").unwrap_or(&name);
    match name {
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" | "BOOLEAN" => {
            FieldKind::Integer
        }
        "FLOAT" | "DOUBLE" => FieldKind::Float,
        "DECIMAL" => FieldKind::Decimal,
        "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" => FieldKind::Blob,
        "VARCHAR" | "CHAR" | "VAR_STRING" | "STRING" | "TEXT" if binary => FieldKind::Blob,
        _ => FieldKind::Text,
    }
}

/// Encode one cell per the declared field kind, `convert` parsing numeric
/// text (falling back to the string on any trailing garbage), and `null`
/// preserving SQL NULLs.
pub fn encode_cell(
    value: &Option<Vec<u8>>,
    kind: FieldKind,
    convert: bool,
    preserve_null: bool,
) -> Value {
    let Some(bytes) = value else {
        if preserve_null {
            return Value::Null;
        }
        return match kind {
            FieldKind::Blob => Value::Blob(Vec::new()),
            _ => Value::String(String::new()),
        };
    };

    if kind == FieldKind::Blob {
        return Value::Blob(bytes.clone());
    }

    let text = String::from_utf8_lossy(bytes);
    if convert {
        match kind {
            FieldKind::Integer => {
                if let Ok(n) = text.parse::<i64>() {
                    return Value::Int(n);
                }
            }
            FieldKind::Float | FieldKind::Decimal => {
                if let Ok(f) = text.parse::<f64>() {
                    return Value::Float(f);
                }
            }
            _ => {}
        }
    }
    Value::String(text.into_owned())
}

struct Field {
    name: String,
    kind: FieldKind,
}

#[derive(Default)]
struct ResultSet {
    affected_rows: u64,
    insert_id: u64,
    fields: Vec<Field>,
    rows: Vec<Vec<Option<Vec<u8>>>>,
}

/// Stream a (possibly multi-statement) text query, splitting the row and
/// done events into one `ResultSet` per statement.
async fn collect_result_sets(
    con: &mut DbConnection,
    query: &str,
) -> Result<Vec<ResultSet>, sqlx::Error> {
    let mut sets: Vec<ResultSet> = Vec::new();
    let mut current = ResultSet::default();

    {
        let mut stream = con.conn().fetch_many(query);
        while let Some(item) = stream.try_next().await? {
            match item {
                sqlx::Either::Left(done) => {
                    apply_done(&mut current, &done);
                    sets.push(std::mem::take(&mut current));
                }
                sqlx::Either::Right(row) => {
                    apply_row(&mut current, &row)?;
                }
            }
        }
    }
    Ok(sets)
}

fn apply_done(set: &mut ResultSet, done: &MySqlQueryResult) {
    set.affected_rows = done.rows_affected();
    set.insert_id = done.last_insert_id();
}

fn apply_row(set: &mut ResultSet, row: &MySqlRow) -> Result<(), sqlx::Error> {
    if set.fields.is_empty() {
        set.fields = row
            .columns()
            .iter()
            .map(|c| {
                let ti = c.type_info();
                // The column's BINARY flag lives in its collation, which
                // byte-slice compatibility checks directly; the rendered
                // name also folds it in (VAR_STRING/STRING arrive as
                // VARBINARY/BINARY under a binary collation).
                let binary = <[u8] as sqlx::Type<sqlx::MySql>>::compatible(ti);
                Field {
                    name: c.name().to_string(),
                    kind: field_kind(ti.name(), binary),
                }
            })
            .collect();
    }

    let mut cells = Vec::with_capacity(set.fields.len());
    for i in 0..set.fields.len() {
        cells.push(row.try_get_unchecked::<Option<Vec<u8>>, _>(i)?);
    }
    set.rows.push(cells);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setting::{KindRow, ServerRow, TableRow};

    fn fixture_setting() -> DbSetting {
        let servers = vec![
            ServerRow {
                sid: 1,
                master_sid: 0,
                host: "db1".to_string(),
                port: 3306,
                user: "app".to_string(),
                passwd: "pw".to_string(),
                active: true,
            },
            ServerRow {
                sid: 2,
                master_sid: 1,
                host: "db2".to_string(),
                port: 3306,
                user: "app".to_string(),
                passwd: "pw".to_string(),
                active: true,
            },
        ];
        let kinds = vec![KindRow {
            kind: "user".to_string(),
            table_num: 16,
            table_prefix: "u".to_string(),
            id_field: "id".to_string(),
            enable: true,
            version: 3,
        }];
        let tables = (0..16)
            .map(|no| TableRow {
                kind: "user".to_string(),
                no,
                sid: 1,
                db_name: "appdb".to_string(),
            })
            .collect();
        DbSetting::build("r1".to_string(), servers, kinds, tables, true).unwrap()
    }

    fn query_quest(sql: &str, hint: i64) -> xic::Quest {
        let mut args = Dict::new();
        args.insert("sql".to_string(), Value::Blob(sql.as_bytes().to_vec()));
        args.insert("kind".to_string(), Value::from("user"));
        args.insert("hintId".to_string(), Value::Int(hint));
        let mut quest = xic::Quest::new("DbMan", "sQuery", args);
        quest
            .ctx
            .insert("CALLER".to_string(), Value::from("svcA"));
        quest
    }

    fn plan_query(job: &QueryJob) -> &str {
        match &job.plan {
            Plan::Single { query } => query,
            Plan::Multi { query, .. } => query,
        }
    }

    #[test]
    fn single_job_rewrites_to_the_shard_table() {
        let setting = fixture_setting();
        let writers = CallerKindMap::default();
        let quest = query_quest("select id from user where id=?", 97);

        let (job, _rx) = QueryJob::single(&quest, "con1", &setting, &writers).unwrap();
        assert_eq!(plan_query(&job), "select id from u_1 where id=?");
        assert_eq!(job.sid, 1);
        assert_eq!(job.db_name, "appdb");
        assert!(!job.master);
    }

    #[test]
    fn writes_force_master_and_arm_stickiness() {
        let setting = fixture_setting();
        let writers = CallerKindMap::default();

        let write = query_quest("insert into user(id) values(1)", 97);
        let (job, _rx) = QueryJob::single(&write, "con1", &setting, &writers).unwrap();
        assert!(job.master);

        // A read by the same connection/caller/kind within the window
        // routes to the primary too.
        let read = query_quest("select id from user where id=1", 97);
        let (job, _rx) = QueryJob::single(&read, "con1", &setting, &writers).unwrap();
        assert!(job.master, "sticky read must go to the primary");

        // A different connection is not sticky.
        let read = query_quest("select id from user where id=1", 97);
        let (job, _rx) = QueryJob::single(&read, "con2", &setting, &writers).unwrap();
        assert!(!job.master);
    }

    #[test]
    fn master_context_forces_primary_routing() {
        let setting = fixture_setting();
        let writers = CallerKindMap::default();

        let mut quest = query_quest("select id from user where id=1", 5);
        quest.ctx.insert("MASTER".to_string(), Value::Bool(true));
        let (job, _rx) = QueryJob::single(&quest, "con1", &setting, &writers).unwrap();
        assert!(job.master);
    }

    #[test]
    fn unknown_and_disallowed_sql_are_rejected() {
        let setting = fixture_setting();
        let writers = CallerKindMap::default();

        let quest = query_quest("drop table user", 1);
        assert!(QueryJob::single(&quest, "c", &setting, &writers).is_err());

        let mut args = Dict::new();
        args.insert(
            "sql".to_string(),
            Value::Blob(b"select * from ghost where id=1".to_vec()),
        );
        args.insert("kind".to_string(), Value::from("ghost"));
        args.insert("hintId".to_string(), Value::Int(0));
        let quest = xic::Quest::new("DbMan", "sQuery", args);
        assert!(QueryJob::single(&quest, "c", &setting, &writers).is_err());
    }

    #[test]
    fn multi_job_wraps_in_a_transaction() {
        let setting = fixture_setting();
        let writers = CallerKindMap::default();

        let mut args = Dict::new();
        args.insert(
            "sqls".to_string(),
            Value::List(vec![
                Value::Blob(b"insert into user(id) values(1)".to_vec()),
                Value::Blob(b"select id from user where id=1".to_vec()),
            ]),
        );
        args.insert("kind".to_string(), Value::from("user"));
        args.insert("hintId".to_string(), Value::Int(17));
        let quest = xic::Quest::new("DbMan", "mQuery", args);

        let (job, _rx) = QueryJob::multi(&quest, "c", &setting, &writers).unwrap();
        assert!(job.master, "a transaction with any write is a write");
        assert_eq!(
            plan_query(&job),
            "BEGIN; insert into u_1(id) values(1); select id from u_1 where id=1; COMMIT"
        );
    }

    #[test]
    fn field_kinds_follow_the_column_type() {
        assert_eq!(field_kind("BIGINT", false), FieldKind::Integer);
        assert_eq!(field_kind("INT UNSIGNED", false), FieldKind::Integer);
        assert_eq!(field_kind("YEAR", false), FieldKind::Integer);
        assert_eq!(field_kind("DOUBLE", false), FieldKind::Float);
        assert_eq!(field_kind("DECIMAL", false), FieldKind::Decimal);
        assert_eq!(field_kind("VARBINARY", true), FieldKind::Blob);
        assert_eq!(field_kind("LONGBLOB", true), FieldKind::Blob);
        assert_eq!(field_kind("VARCHAR", false), FieldKind::Text);
        assert_eq!(field_kind("DATETIME", false), FieldKind::Text);
    }

    #[test]
    fn binary_collation_strings_are_blobs() {
        // A VARCHAR/CHAR column with a binary collation (wire type
        // VAR_STRING/STRING plus the BINARY flag) carries bytes.
        assert_eq!(field_kind("VARCHAR", true), FieldKind::Blob);
        assert_eq!(field_kind("CHAR", true), FieldKind::Blob);
        assert_eq!(field_kind("VAR_STRING", true), FieldKind::Blob);
        assert_eq!(field_kind("STRING", true), FieldKind::Blob);
        // The same wire names without the flag stay text.
        assert_eq!(field_kind("VAR_STRING", false), FieldKind::Text);
        assert_eq!(field_kind("STRING", false), FieldKind::Text);
        assert_eq!(field_kind("CHAR", false), FieldKind::Text);
        // The flag never converts non-string types.
        assert_eq!(field_kind("BIGINT", true), FieldKind::Integer);
        assert_eq!(field_kind("DATETIME", true), FieldKind::Text);
    }

    #[test]
    fn convert_parses_numeric_text_and_falls_back() {
        let cell = |s: &str, kind| encode_cell(&Some(s.as_bytes().to_vec()), kind, true, false);

        assert_eq!(cell("42", FieldKind::Integer), Value::Int(42));
        assert_eq!(cell("-7", FieldKind::Integer), Value::Int(-7));
        assert_eq!(
            cell("42abc", FieldKind::Integer),
            Value::String("42abc".to_string())
        );
        assert_eq!(cell("1.5", FieldKind::Float), Value::Float(1.5));
        assert_eq!(cell("10.25", FieldKind::Decimal), Value::Float(10.25));
        assert_eq!(
            cell("not-a-number", FieldKind::Decimal),
            Value::String("not-a-number".to_string())
        );
    }

    #[test]
    fn without_convert_everything_is_text_or_blob() {
        assert_eq!(
            encode_cell(&Some(b"42".to_vec()), FieldKind::Integer, false, false),
            Value::String("42".to_string())
        );
        assert_eq!(
            encode_cell(&Some(b"\x00\x01".to_vec()), FieldKind::Blob, false, false),
            Value::Blob(vec![0, 1])
        );
    }

    #[test]
    fn null_handling() {
        assert_eq!(encode_cell(&None, FieldKind::Text, false, true), Value::Null);
        assert_eq!(
            encode_cell(&None, FieldKind::Text, false, false),
            Value::String(String::new())
        );
        assert_eq!(
            encode_cell(&None, FieldKind::Blob, false, false),
            Value::Blob(Vec::new())
        );
    }
}
