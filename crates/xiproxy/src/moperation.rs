//! Memcached text-protocol operations: command rendering and the reply
//! shapes the per-server client hands back.

use crate::lz4codec;
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Instant;
use tokio::sync::oneshot;

pub const FLAG_LZ4_ZIP: u32 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Version,
    Store,
    Cas,
    Count,
    Delete,
    Get,
    GetMulti,
}

/// One value from a `gets` reply. `revision` is the cas-unique.
#[derive(Debug, Clone)]
pub struct MValue {
    pub key: String,
    pub value: Vec<u8>,
    pub revision: i64,
    pub flags: u32,
}

impl MValue {
    pub fn zipped(&self) -> bool {
        self.flags & FLAG_LZ4_ZIP != 0
    }
}

#[derive(Debug)]
pub enum Reply {
    /// STORED / NOT_STORED / EXISTS / NOT_FOUND / DELETED outcomes.
    Done(bool),
    /// incr/decr result; None means NOT_FOUND.
    Count(Option<i64>),
    /// gets (single or multi) values; absent keys are simply missing.
    Values(Vec<MValue>),
}

#[derive(Debug, thiserror::Error)]
pub enum McError {
    #[error("no healthy memcached server")]
    NoServer,
    #[error("memcached client shut down")]
    Shutdown,
    #[error("{0}")]
    Protocol(String),
    #[error("operation timeout")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A queued operation: rendered command bytes plus the waiter.
pub struct Operation {
    pub category: Category,
    pub command: Bytes,
    pub caller: String,
    pub start: Instant,
    pub tx: oneshot::Sender<Result<Reply, McError>>,
    /// Whether the stored value went out compressed.
    pub zip: bool,
}

pub type OperationWaiter = oneshot::Receiver<Result<Reply, McError>>;

impl Operation {
    fn new(category: Category, command: Bytes, caller: String, zip: bool) -> (Self, OperationWaiter) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                category,
                command,
                caller,
                start: Instant::now(),
                tx,
                zip,
            },
            rx,
        )
    }

    /// First line of the command, for slow/error logs.
    pub fn command_line(&self) -> String {
        let line = self
            .command
            .split(|&b| b == b'\n')
            .next()
            .unwrap_or(&self.command);
        String::from_utf8_lossy(line).trim_end().to_string()
    }

    pub fn version() -> (Self, OperationWaiter) {
        Self::new(
            Category::Version,
            Bytes::from_static(b"version\r\n"),
            String::new(),
            false,
        )
    }

    /// `set` / `replace` / `add`: when the zip flag is requested, the value
    /// is compressed here and the flag dropped if compression doesn't pay.
    pub fn store(
        verb: &'static str,
        caller: String,
        key: &str,
        value: &[u8],
        expire: i64,
        mut flags: u32,
    ) -> (Self, OperationWaiter) {
        let v = attempt_zip(key, value, &mut flags);
        let zipped = flags & FLAG_LZ4_ZIP != 0;
        let mut buf = BytesMut::new();
        buf.put_slice(format!("{verb} {key} {flags} {expire} {}\r\n", v.len()).as_bytes());
        buf.put_slice(&v);
        buf.put_slice(b"\r\n");
        Self::new(Category::Store, buf.freeze(), caller, zipped)
    }

    pub fn cas(
        caller: String,
        key: &str,
        value: &[u8],
        revision: i64,
        expire: i64,
        mut flags: u32,
    ) -> (Self, OperationWaiter) {
        let v = attempt_zip(key, value, &mut flags);
        let zipped = flags & FLAG_LZ4_ZIP != 0;
        let mut buf = BytesMut::new();
        buf.put_slice(format!("cas {key} {flags} {expire} {} {revision}\r\n", v.len()).as_bytes());
        buf.put_slice(&v);
        buf.put_slice(b"\r\n");
        Self::new(Category::Cas, buf.freeze(), caller, zipped)
    }

    /// `append` / `prepend` never compress.
    pub fn concat(
        verb: &'static str,
        caller: String,
        key: &str,
        value: &[u8],
    ) -> (Self, OperationWaiter) {
        let mut buf = BytesMut::new();
        buf.put_slice(format!("{verb} {key} 0 0 {}\r\n", value.len()).as_bytes());
        buf.put_slice(value);
        buf.put_slice(b"\r\n");
        Self::new(Category::Store, buf.freeze(), caller, false)
    }

    pub fn delete(caller: String, key: &str) -> (Self, OperationWaiter) {
        Self::new(
            Category::Delete,
            Bytes::from(format!("delete {key}\r\n")),
            caller,
            false,
        )
    }

    pub fn count(verb: &'static str, caller: String, key: &str, value: i64) -> (Self, OperationWaiter) {
        Self::new(
            Category::Count,
            Bytes::from(format!("{verb} {key} {value}\r\n")),
            caller,
            false,
        )
    }

    /// Always `gets`, so every value carries its cas revision.
    pub fn get(caller: String, key: &str) -> (Self, OperationWaiter) {
        Self::new(
            Category::Get,
            Bytes::from(format!("gets {key}\r\n")),
            caller,
            false,
        )
    }

    pub fn get_multi(caller: String, keys: &[String]) -> (Self, OperationWaiter) {
        let mut cmd = String::from("gets");
        for key in keys {
            cmd.push(' ');
            cmd.push_str(key);
        }
        cmd.push_str("\r\n");
        Self::new(Category::GetMulti, Bytes::from(cmd), caller, false)
    }

    /// Deliver the reply; the waiter may have given up already.
    pub fn finish(self, result: Result<Reply, McError>) {
        let _ = self.tx.send(result);
    }
}

fn attempt_zip(key: &str, value: &[u8], flags: &mut u32) -> Vec<u8> {
    if *flags & FLAG_LZ4_ZIP != 0 {
        match lz4codec::attempt_zip(value) {
            Ok(framed) => return framed,
            Err(err) => {
                *flags &= !FLAG_LZ4_ZIP;
                tracing::debug!(key, value_len = value.len(), %err, "left value uncompressed");
            }
        }
    }
    value.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_rendering() {
        let (op, _rx) = Operation::store("set", String::new(), "k", b"abc", 30, 0);
        assert_eq!(&op.command[..], b"set k 0 30 3\r\nabc\r\n");
        assert!(!op.zip);
        assert_eq!(op.command_line(), "set k 0 30 3");

        let (op, _rx) = Operation::cas(String::new(), "k", b"abc", 99, 0, 0);
        assert_eq!(&op.command[..], b"cas k 0 0 3 99\r\nabc\r\n");

        let (op, _rx) = Operation::count("incr", String::new(), "n", 5);
        assert_eq!(&op.command[..], b"incr n 5\r\n");

        let keys = vec!["a".to_string(), "b".to_string()];
        let (op, _rx) = Operation::get_multi(String::new(), &keys);
        assert_eq!(&op.command[..], b"gets a b\r\n");
    }

    #[test]
    fn store_compresses_when_it_pays() {
        let value: Vec<u8> = std::iter::repeat(b'x').take(4096).collect();
        let (op, _rx) = Operation::store("set", String::new(), "k", &value, 0, FLAG_LZ4_ZIP);
        assert!(op.zip);
        let line = op.command_line();
        assert!(line.starts_with(&format!("set k {} 0 ", FLAG_LZ4_ZIP)), "{line}");

        // Incompressible value: the flag is dropped from the wire command.
        let mut x: u32 = 0x9e37_79b9;
        let noisy: Vec<u8> = (0..2048)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect();
        let (op, _rx) = Operation::store("set", String::new(), "k", &noisy, 0, FLAG_LZ4_ZIP);
        assert!(!op.zip);
        assert!(op.command_line().starts_with("set k 0 0 "));
    }
}
