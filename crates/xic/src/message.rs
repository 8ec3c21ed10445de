use crate::{codec, Dict, Value};
use bytes::Bytes;

pub const STATUS_OK: i32 = 0;
/// Generic non-zero status for answers synthesized from errors.
pub const STATUS_EXCEPTION: i32 = 1;

/// One request: a service, a method, a context dict and an args dict.
/// A `txid` of zero marks a oneway quest; no answer will be produced.
#[derive(Debug, Clone)]
pub struct Quest {
    pub txid: i64,
    pub service: String,
    pub method: String,
    pub ctx: Dict,
    pub args: Dict,
    /// Encoded form of `args` as it arrived off the wire, when known.
    /// Kept so fingerprinting hashes the exact bytes the caller sent.
    pub raw_args: Option<Bytes>,
}

impl Quest {
    pub fn new(service: impl Into<String>, method: impl Into<String>, args: Dict) -> Self {
        Self {
            txid: 0,
            service: service.into(),
            method: method.into(),
            ctx: Dict::new(),
            args,
            raw_args: None,
        }
    }

    pub fn is_oneway(&self) -> bool {
        self.txid == 0
    }

    /// The encoded argument bytes, as sent or re-encoded on demand.
    pub fn args_bytes(&self) -> Bytes {
        match &self.raw_args {
            Some(raw) => raw.clone(),
            None => Bytes::from(codec::encode_args(&self.args)),
        }
    }
}

/// Answer arguments are either a decoded dict, or the still-encoded bytes
/// of one. The raw form lets a cached answer lend its payload to the wire
/// by reference count instead of copying it.
#[derive(Debug, Clone)]
pub enum Args {
    Dict(Dict),
    Raw(Bytes),
}

impl Args {
    /// Decode into a dict, borrowing when already decoded.
    pub fn to_dict(&self) -> crate::Result<Dict> {
        match self {
            Args::Dict(d) => Ok(d.clone()),
            Args::Raw(raw) => codec::decode_args(raw),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Answer {
    pub txid: i64,
    pub status: i32,
    pub args: Args,
}

impl Answer {
    pub fn ok(args: Dict) -> Self {
        Self {
            txid: 0,
            status: STATUS_OK,
            args: Args::Dict(args),
        }
    }

    pub fn empty() -> Self {
        Self::ok(Dict::new())
    }

    /// An answer whose args are pre-encoded bytes (e.g. a cache entry).
    pub fn raw(status: i32, args: Bytes) -> Self {
        Self {
            txid: 0,
            status,
            args: Args::Raw(args),
        }
    }

    /// Convert an error into a status-bearing answer carrying the same
    /// service/method metadata, per the worker propagation rule.
    pub fn from_error(err: &crate::Error, service: &str, method: &str) -> Self {
        let mut args = Dict::new();
        args.insert("exname".to_string(), Value::from(err.exname()));
        args.insert("message".to_string(), Value::from(err.to_string()));
        args.insert("raiser".to_string(), Value::from(format!("{service}::{method}")));
        Self {
            txid: 0,
            status: STATUS_EXCEPTION,
            args: Args::Dict(args),
        }
    }

    /// As `from_error`, for arbitrary error chains out of servant bodies.
    pub fn from_anyhow(err: &anyhow::Error, service: &str, method: &str) -> Self {
        match err.downcast_ref::<crate::Error>() {
            Some(err) => Self::from_error(err, service, method),
            None => {
                let mut args = Dict::new();
                args.insert("exname".to_string(), Value::from("ServantError"));
                args.insert("message".to_string(), Value::from(format!("{err:#}")));
                args.insert("raiser".to_string(), Value::from(format!("{service}::{method}")));
                Self {
                    txid: 0,
                    status: STATUS_EXCEPTION,
                    args: Args::Dict(args),
                }
            }
        }
    }
}
