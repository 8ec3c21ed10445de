use crate::{Answer, Args, Dict, Quest};
use bytes::Bytes;

/// Wire shape of one frame. Context and argument dicts travel as nested
/// bincode blobs so an answer can splice pre-encoded bytes verbatim.
#[derive(serde::Serialize, serde::Deserialize)]
enum Wire {
    Quest {
        txid: i64,
        service: String,
        method: String,
        ctx: Vec<u8>,
        args: Vec<u8>,
    },
    Answer {
        txid: i64,
        status: i32,
        args: Vec<u8>,
    },
}

#[derive(Debug)]
pub enum Message {
    Quest(Quest),
    Answer(Answer),
}

pub fn encode_args(args: &Dict) -> Vec<u8> {
    bincode::serialize(args).expect("encoding an argument dict does not fail")
}

/// Encode one value stanza, the storage form of local-cache payloads.
pub fn encode_value(value: &crate::Value) -> Vec<u8> {
    bincode::serialize(value).expect("encoding a value does not fail")
}

pub fn decode_value(raw: &[u8]) -> crate::Result<crate::Value> {
    Ok(bincode::deserialize(raw)?)
}

pub fn decode_args(raw: &[u8]) -> crate::Result<Dict> {
    Ok(bincode::deserialize(raw)?)
}

pub fn encode_quest(quest: &Quest) -> Bytes {
    let wire = Wire::Quest {
        txid: quest.txid,
        service: quest.service.clone(),
        method: quest.method.clone(),
        ctx: encode_args(&quest.ctx),
        args: quest.args_bytes().to_vec(),
    };
    Bytes::from(bincode::serialize(&wire).expect("encoding a quest does not fail"))
}

pub fn encode_answer(answer: &Answer) -> Bytes {
    let args = match &answer.args {
        Args::Dict(d) => encode_args(d),
        Args::Raw(raw) => raw.to_vec(),
    };
    let wire = Wire::Answer {
        txid: answer.txid,
        status: answer.status,
        args,
    };
    Bytes::from(bincode::serialize(&wire).expect("encoding an answer does not fail"))
}

pub fn decode_message(frame: &[u8]) -> crate::Result<Message> {
    match bincode::deserialize::<Wire>(frame)? {
        Wire::Quest {
            txid,
            service,
            method,
            ctx,
            args,
        } => {
            let decoded = decode_args(&args)?;
            Ok(Message::Quest(Quest {
                txid,
                service,
                method,
                ctx: decode_args(&ctx)?,
                args: decoded,
                raw_args: Some(Bytes::from(args)),
            }))
        }
        Wire::Answer { txid, status, args } => Ok(Message::Answer(Answer {
            txid,
            status,
            args: Args::Raw(Bytes::from(args)),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    #[test]
    fn quest_round_trip_preserves_arg_bytes() {
        let mut args = Dict::new();
        args.insert("key".to_string(), Value::Blob(vec![0, 159, 146, 150]));
        args.insert("n".to_string(), Value::Int(-3));

        let mut quest = Quest::new("MCache~main", "get", args.clone());
        quest.txid = 42;
        quest.ctx.insert("CACHE".to_string(), Value::Int(30));

        let frame = encode_quest(&quest);
        let Message::Quest(out) = decode_message(&frame).unwrap() else {
            panic!("expected quest");
        };
        assert_eq!(out.txid, 42);
        assert_eq!(out.service, "MCache~main");
        assert_eq!(out.args, args);
        // The retained raw bytes re-encode to themselves.
        assert_eq!(out.args_bytes(), Bytes::from(encode_args(&args)));
    }

    #[test]
    fn raw_answer_args_pass_through_unchanged() {
        let mut args = Dict::new();
        args.insert("value".to_string(), Value::from("cached"));
        let raw = Bytes::from(encode_args(&args));

        let mut answer = Answer::raw(0, raw.clone());
        answer.txid = 7;
        let frame = encode_answer(&answer);

        let Message::Answer(out) = decode_message(&frame).unwrap() else {
            panic!("expected answer");
        };
        assert_eq!(out.txid, 7);
        assert_eq!(out.args.to_dict().unwrap(), args);
    }
}
