//! Internal servant exposing the sharded Redis group as RPC methods.

use crate::big_servant::RevServant;
use crate::redis_group::RedisGroup;
use xic::{Answer, Current, Dict, DictExt, Quest, Value};

pub struct Redis {
    service: String,
    revision: i64,
    servers: String,
    group: RedisGroup,
}

impl Redis {
    pub fn new(service: &str, revision: i64, servers: &str) -> Self {
        Self {
            service: service.to_string(),
            revision,
            servers: servers.to_string(),
            group: RedisGroup::new(service, servers),
        }
    }

    fn caller(quest: &Quest) -> String {
        quest.ctx.get_str("CALLER").unwrap_or_default().to_string()
    }

    async fn one_call(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let key = quest.args.want_str("key")?;
        let cmd = quest.args.want_list("cmd")?;
        let replies = self
            .group
            .one_call(&Self::caller(quest), key, cmd)
            .await?;

        let mut answer = Dict::new();
        answer.insert(
            "result".to_string(),
            replies.into_iter().next().unwrap_or(Value::Null),
        );
        Ok(Answer::ok(answer))
    }

    async fn n_call(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let key = quest.args.want_str("key")?;
        let cmds = quest.args.want_list("cmds")?;
        let num = cmds.len();
        let mut replies = self.group.n_call(&Self::caller(quest), key, cmds).await?;

        replies.truncate(num);
        while replies.len() < num {
            replies.push(Value::Null);
        }
        let mut answer = Dict::new();
        answer.insert("results".to_string(), Value::List(replies));
        Ok(Answer::ok(answer))
    }

    async fn t_call(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let key = quest.args.want_str("key")?;
        let cmds = quest.args.want_list("cmds")?;
        let num = cmds.len();
        let replies = self.group.t_call(&Self::caller(quest), key, cmds).await?;

        let results = splice_tcall(replies, num).map_err(xic::Error::Protocol)?;
        let mut answer = Dict::new();
        answer.insert("results".to_string(), Value::List(results));
        Ok(Answer::ok(answer))
    }

    async fn set(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let key = quest.args.want_str("key")?;
        let value = quest.args.want_blob("value")?;
        let expire = quest.args.get_int("expire");
        let replies = self
            .group
            .set(&Self::caller(quest), key, value, expire)
            .await?;

        let ok = matches!(replies.first(), Some(Value::String(s)) if s == "+OK");
        let mut answer = Dict::new();
        answer.insert("ok".to_string(), Value::Bool(ok));
        Ok(Answer::ok(answer))
    }

    async fn delete(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let key = quest.args.want_str("key")?;
        let replies = self.group.remove(&Self::caller(quest), key).await?;

        let ok = matches!(replies.first(), Some(Value::Int(n)) if *n > 0);
        let mut answer = Dict::new();
        answer.insert("ok".to_string(), Value::Bool(ok));
        Ok(Answer::ok(answer))
    }

    async fn count(&self, verb: &'static str, quest: &Quest) -> anyhow::Result<Answer> {
        let key = quest.args.want_str("key")?;
        let value = quest.args.want_int("value")?;
        if value < 0 {
            let err = xic::Error::Argument(format!(
                "can't {} negative number, key={key} value={value}",
                if verb == "INCRBY" { "increment" } else { "decrement" },
            ));
            tracing::warn!(service = %self.service, %err, "rejecting count");
            return Err(err.into());
        }

        let replies = self
            .group
            .count(&Self::caller(quest), verb, key, value)
            .await?;
        let mut answer = Dict::new();
        match replies.first() {
            Some(Value::Int(n)) => {
                answer.insert("ok".to_string(), Value::Bool(true));
                answer.insert("value".to_string(), Value::Int(*n));
            }
            _ => {
                answer.insert("ok".to_string(), Value::Bool(false));
            }
        }
        Ok(Answer::ok(answer))
    }

    async fn get(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let key = quest.args.want_str("key")?;
        let replies = self.group.get(&Self::caller(quest), key).await?;

        let mut answer = Dict::new();
        if let Some(Value::Blob(blob)) = replies.into_iter().next() {
            answer.insert("value".to_string(), Value::Blob(blob));
        }
        Ok(Answer::ok(answer))
    }

    async fn get_multi(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let keys = quest.args.want_str_seq("keys")?;
        let values = self.group.get_multi(&Self::caller(quest), &keys).await;

        let mut dict = Dict::new();
        for (key, value) in values {
            dict.insert(key, Value::Blob(value));
        }
        let mut answer = Dict::new();
        answer.insert("values".to_string(), Value::Dict(dict));
        Ok(Answer::ok(answer))
    }

    fn which_server(&self, quest: &Quest) -> anyhow::Result<Answer> {
        let key = quest.args.want_str("key")?;
        let (real, canonical) = self.group.which_server(key);
        let mut answer = Dict::new();
        answer.insert("real".to_string(), Value::from(real));
        answer.insert("canonical".to_string(), Value::from(canonical));
        Ok(Answer::ok(answer))
    }

    fn all_servers(&self) -> Answer {
        let (all, bad) = self.group.all_servers();
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
impl xic::Servant for Redis {
    async fn process(&self, quest: Quest, _current: &Current) -> anyhow::Result<Answer> {
        match quest.method.as_str() {
            "_1CALL" => self.one_call(&quest).await,
            "_NCALL" => self.n_call(&quest).await,
            "_TCALL" => self.t_call(&quest).await,
            "set" => self.set(&quest).await,
            "delete" => self.delete(&quest).await,
            "increment" => self.count("INCRBY", &quest).await,
            "decrement" => self.count("DECRBY", &quest).await,
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

impl RevServant for Redis {
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
        self.group.shutdown();
    }
}

/// Rebuild per-command results of a MULTI/EXEC exchange: `+QUEUED`
/// placeholders are replaced by the matching entries of the final EXEC
/// array, short EXEC arrays pad with nulls, and any non-QUEUED mid reply
/// passes through as-is.
pub fn splice_tcall(replies: Vec<Value>, num: usize) -> Result<Vec<Value>, String> {
    if replies.len() < num + 2 {
        return Err("number of replies less than that of requests".to_string());
    }

    match replies.first() {
        Some(Value::String(s)) if s == "+OK" => {}
        _ => return Err("invalid reply for MULTI cmd".to_string()),
    }
    let exec = match &replies[num + 1] {
        Value::List(list) => list.clone(),
        _ => return Err("invalid reply for EXEC cmd".to_string()),
    };

    let mut exec = exec.into_iter();
    let mut results = Vec::with_capacity(num);
    for reply in replies.into_iter().skip(1).take(num) {
        match &reply {
            Value::String(s) if s == "+QUEUED" => {
                results.push(exec.next().unwrap_or(Value::Null));
            }
            _ => results.push(reply),
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcall_replaces_queued_placeholders() {
        // MULTI; GET foo; SET bar 1; EXEC with replies
        // [+OK, +QUEUED, +QUEUED, [<foo>, +OK]].
        let replies = vec![
            Value::from("+OK"),
            Value::from("+QUEUED"),
            Value::from("+QUEUED"),
            Value::List(vec![Value::Blob(b"foo-value".to_vec()), Value::from("+OK")]),
        ];
        let results = splice_tcall(replies, 2).unwrap();
        assert_eq!(
            results,
            vec![Value::Blob(b"foo-value".to_vec()), Value::from("+OK")]
        );
    }

    #[test]
    fn tcall_passes_non_queued_replies_through() {
        let replies = vec![
            Value::from("+OK"),
            Value::from("-ERR wrong arity"),
            Value::from("+QUEUED"),
            Value::List(vec![Value::Int(3)]),
        ];
        let results = splice_tcall(replies, 2).unwrap();
        assert_eq!(results, vec![Value::from("-ERR wrong arity"), Value::Int(3)]);
    }

    #[test]
    fn tcall_pads_short_exec_with_nulls() {
        let replies = vec![
            Value::from("+OK"),
            Value::from("+QUEUED"),
            Value::from("+QUEUED"),
            Value::List(vec![Value::Int(1)]),
        ];
        let results = splice_tcall(replies, 2).unwrap();
        assert_eq!(results, vec![Value::Int(1), Value::Null]);
    }

    #[test]
    fn tcall_rejects_malformed_exchanges() {
        assert!(splice_tcall(vec![Value::from("+OK")], 2).is_err());

        let bad_multi = vec![
            Value::from("-ERR"),
            Value::from("+QUEUED"),
            Value::List(vec![]),
        ];
        assert!(splice_tcall(bad_multi, 1).is_err());

        let bad_exec = vec![
            Value::from("+OK"),
            Value::from("+QUEUED"),
            Value::from("+OK"),
        ];
        assert!(splice_tcall(bad_exec, 1).is_err());
    }
}
