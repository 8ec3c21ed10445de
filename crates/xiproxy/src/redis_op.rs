//! RESP command rendering and the pipelined operation unit handed to the
//! per-server Redis client.

use bytes::{BufMut, Bytes, BytesMut};
use std::time::Instant;
use tokio::sync::oneshot;
use xic::Value;

/// Pipelined replies arrive one `Value` per command, in command order.
pub type Replies = Vec<Value>;

#[derive(Debug, thiserror::Error)]
pub enum RdsError {
    #[error("no available redis server")]
    NoServer,
    #[error("redis client shut down")]
    Shutdown,
    #[error("invalid argument: {0}")]
    Argument(String),
    #[error("{0}")]
    Protocol(String),
    #[error("AUTH rejected by server")]
    AuthFailed,
    #[error("operation timeout")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct RedisOp {
    pub commands: Bytes,
    pub cmd_num: usize,
    pub caller: String,
    pub start: Instant,
    pub tx: oneshot::Sender<Result<Replies, RdsError>>,
}

pub type RedisOpWaiter = oneshot::Receiver<Result<Replies, RdsError>>;

impl RedisOp {
    fn new(commands: BytesMut, cmd_num: usize, caller: String) -> (Self, RedisOpWaiter) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                commands: commands.freeze(),
                cmd_num,
                caller,
                start: Instant::now(),
                tx,
            },
            rx,
        )
    }

    /// First serialized command, for slow/error logs.
    pub fn command_line(&self) -> String {
        let line: Vec<u8> = self
            .commands
            .iter()
            .copied()
            .take(96)
            .filter(|b| !b.is_ascii_control())
            .collect();
        String::from_utf8_lossy(&line).into_owned()
    }

    pub fn finish(self, result: Result<Replies, RdsError>) {
        let _ = self.tx.send(result);
    }

    pub fn one_call(caller: String, cmd: &[Value]) -> Result<(Self, RedisOpWaiter), RdsError> {
        let mut buf = BytesMut::new();
        write_cmd(&mut buf, cmd)?;
        Ok(Self::new(buf, 1, caller))
    }

    pub fn n_call(caller: String, cmds: &[Value]) -> Result<(Self, RedisOpWaiter), RdsError> {
        if cmds.is_empty() {
            return Err(RdsError::Argument("no cmds".to_string()));
        }
        let mut buf = BytesMut::new();
        let mut num = 0;
        for cmd in cmds {
            let cmd = cmd
                .as_list()
                .ok_or_else(|| RdsError::Argument("invalid cmd".to_string()))?;
            write_cmd(&mut buf, cmd)?;
            num += 1;
        }
        Ok(Self::new(buf, num, caller))
    }

    /// MULTI, the commands, EXEC — one pipelined exchange.
    pub fn t_call(caller: String, cmds: &[Value]) -> Result<(Self, RedisOpWaiter), RdsError> {
        if cmds.is_empty() {
            return Err(RdsError::Argument("no cmds".to_string()));
        }
        let mut buf = BytesMut::new();
        buf.put_slice(b"*1\r\n");
        write_arg_bytes(&mut buf, b"MULTI");
        let mut num = 1;
        for cmd in cmds {
            let cmd = cmd
                .as_list()
                .ok_or_else(|| RdsError::Argument("invalid cmd".to_string()))?;
            write_cmd(&mut buf, cmd)?;
            num += 1;
        }
        buf.put_slice(b"*1\r\n");
        write_arg_bytes(&mut buf, b"EXEC");
        num += 1;
        Ok(Self::new(buf, num, caller))
    }

    pub fn auth(password: &str) -> (Self, RedisOpWaiter) {
        let mut buf = BytesMut::new();
        buf.put_slice(b"*2\r\n");
        write_arg_bytes(&mut buf, b"AUTH");
        write_arg_bytes(&mut buf, password.as_bytes());
        Self::new(buf, 1, String::new())
    }

    /// SET, plus EXPIRE when `expire` is non-negative. An expire of zero
    /// applies the 7-week default.
    pub fn set(caller: String, key: &str, value: &[u8], expire: i64) -> (Self, RedisOpWaiter) {
        const DEFAULT_EXPIRE: i64 = 86400 * 7 * 7;

        let mut buf = BytesMut::new();
        buf.put_slice(b"*3\r\n");
        write_arg_bytes(&mut buf, b"SET");
        write_arg_bytes(&mut buf, key.as_bytes());
        write_arg_bytes(&mut buf, value);
        let mut num = 1;

        if expire >= 0 {
            let expire = if expire == 0 { DEFAULT_EXPIRE } else { expire };
            buf.put_slice(b"*3\r\n");
            write_arg_bytes(&mut buf, b"EXPIRE");
            write_arg_bytes(&mut buf, key.as_bytes());
            write_arg_bytes(&mut buf, expire.to_string().as_bytes());
            num += 1;
        }
        Self::new(buf, num, caller)
    }

    pub fn remove(caller: String, key: &str) -> (Self, RedisOpWaiter) {
        let mut buf = BytesMut::new();
        buf.put_slice(b"*2\r\n");
        write_arg_bytes(&mut buf, b"DEL");
        write_arg_bytes(&mut buf, key.as_bytes());
        Self::new(buf, 1, caller)
    }

    pub fn count(
        caller: String,
        verb: &'static str,
        key: &str,
        value: i64,
    ) -> (Self, RedisOpWaiter) {
        let mut buf = BytesMut::new();
        buf.put_slice(b"*3\r\n");
        write_arg_bytes(&mut buf, verb.as_bytes());
        write_arg_bytes(&mut buf, key.as_bytes());
        write_arg_bytes(&mut buf, value.to_string().as_bytes());
        Self::new(buf, 1, caller)
    }

    pub fn get(caller: String, key: &str) -> (Self, RedisOpWaiter) {
        let mut buf = BytesMut::new();
        buf.put_slice(b"*2\r\n");
        write_arg_bytes(&mut buf, b"GET");
        write_arg_bytes(&mut buf, key.as_bytes());
        Self::new(buf, 1, caller)
    }

    pub fn mget(caller: String, keys: &[String]) -> (Self, RedisOpWaiter) {
        let mut buf = BytesMut::new();
        buf.put_slice(format!("*{}\r\n", 1 + keys.len()).as_bytes());
        write_arg_bytes(&mut buf, b"MGET");
        for key in keys {
            write_arg_bytes(&mut buf, key.as_bytes());
        }
        Self::new(buf, 1, caller)
    }
}

// Commands needing stateful server semantics are incompatible with a
// pooled borrow/return connection and are screened out here.
fn forbidden(name: &str) -> bool {
    name.eq_ignore_ascii_case("MULTI")
        || name.eq_ignore_ascii_case("SUBSCRIBE")
        || name.eq_ignore_ascii_case("UNSUBSCRIBE")
        || name.eq_ignore_ascii_case("PSUBSCRIBE")
        || name.eq_ignore_ascii_case("PUNSUBSCRIBE")
        || name.eq_ignore_ascii_case("PUBLISH")
}

fn write_cmd(buf: &mut BytesMut, cmd: &[Value]) -> Result<(), RdsError> {
    let Some(Value::String(name)) = cmd.first() else {
        return Err(RdsError::Argument("invalid cmd name".to_string()));
    };
    if name.is_empty() {
        return Err(RdsError::Argument("invalid cmd name".to_string()));
    }
    if forbidden(name) {
        return Err(RdsError::Argument(format!("not allowed cmd ({name})")));
    }

    buf.put_slice(format!("*{}\r\n", cmd.len()).as_bytes());
    write_arg_bytes(buf, name.as_bytes());
    for arg in &cmd[1..] {
        match arg {
            Value::String(s) => write_arg_bytes(buf, s.as_bytes()),
            Value::Blob(b) => write_arg_bytes(buf, b),
            Value::Int(i) => write_arg_bytes(buf, i.to_string().as_bytes()),
            Value::Float(f) => write_arg_bytes(buf, format!("{f}").as_bytes()),
            Value::Bool(b) => write_arg_bytes(buf, if *b { b"1" } else { b"0" }),
            _ => return Err(RdsError::Argument("invalid cmd args".to_string())),
        }
    }
    Ok(())
}

fn write_arg_bytes(buf: &mut BytesMut, arg: &[u8]) {
    buf.put_slice(format!("${}\r\n", arg.len()).as_bytes());
    buf.put_slice(arg);
    buf.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Vec<Value> {
        parts.iter().map(|p| Value::from(*p)).collect()
    }

    #[test]
    fn one_call_serialization() {
        let (op, _rx) = RedisOp::one_call(String::new(), &cmd(&["GET", "foo"])).unwrap();
        assert_eq!(&op.commands[..], b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
        assert_eq!(op.cmd_num, 1);
    }

    #[test]
    fn t_call_wraps_in_multi_exec() {
        let cmds = vec![
            Value::List(cmd(&["GET", "foo"])),
            Value::List(cmd(&["SET", "bar", "1"])),
        ];
        let (op, _rx) = RedisOp::t_call(String::new(), &cmds).unwrap();
        assert_eq!(op.cmd_num, 4);
        assert!(op.commands.starts_with(b"*1\r\n$5\r\nMULTI\r\n"));
        assert!(op.commands.ends_with(b"*1\r\n$4\r\nEXEC\r\n"));
    }

    #[test]
    fn stateful_commands_are_rejected() {
        for name in ["MULTI", "multi", "SUBSCRIBE", "publish", "pUnSubscribe"] {
            let err = RedisOp::one_call(String::new(), &cmd(&[name, "x"])).unwrap_err();
            assert!(matches!(err, RdsError::Argument(_)), "{name}");
        }
        // Non-string and empty command names are screened too.
        assert!(RedisOp::one_call(String::new(), &[Value::Int(1)]).is_err());
        assert!(RedisOp::one_call(String::new(), &cmd(&[""])).is_err());
    }

    #[test]
    fn set_appends_expire() {
        let (op, _rx) = RedisOp::set(String::new(), "k", b"v", 60);
        assert_eq!(op.cmd_num, 2);
        assert!(op.commands.ends_with(b"$6\r\nEXPIRE\r\n$1\r\nk\r\n$2\r\n60\r\n"));

        // Zero means the 7-week default.
        let (op, _rx) = RedisOp::set(String::new(), "k", b"v", 0);
        assert_eq!(op.cmd_num, 2);
        let rendered = String::from_utf8_lossy(&op.commands).into_owned();
        assert!(rendered.contains("4233600"), "{rendered}");

        let (op, _rx) = RedisOp::set(String::new(), "k", b"v", -1);
        assert_eq!(op.cmd_num, 1);
    }

    #[test]
    fn mixed_arg_types() {
        let parts = vec![
            Value::from("SET"),
            Value::from("k"),
            Value::Int(42),
        ];
        let (op, _rx) = RedisOp::one_call(String::new(), &parts).unwrap();
        assert!(op.commands.ends_with(b"$2\r\n42\r\n"));
    }
}
