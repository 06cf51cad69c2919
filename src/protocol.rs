//! The command protocol: structured records carried over a
//! [`crate::channel::MessageChannel`].
//!
//! Concrete serialization is a wire-layer concern left external to the core
//! design; this crate serializes every record as JSON, tagged on the
//! `command`/`reply` field.

use serde::{Deserialize, Serialize};

/// One entry in a `GIVE_ID` reply's filter result list.
///
/// `order` is `None` for a parallel filter and `Some(i)` for the `i`-th
/// sequential filter in configured order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterRecord {
    pub name: String,
    pub order: Option<usize>,
    pub data: serde_json::Value,
}

/// A request sent client -> server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    GetLogin { name: String, processid: i64 },
    GetId,
    DoneId {
        resourceid: String,
        responsecode: String,
        annotation: String,
    },
    GetStatus,
    RmClient { clientid: u64 },
    Shutdown,
}

/// A reply sent server -> client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reply", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reply {
    GiveLogin { clientid: u64 },
    GiveId {
        resourceid: String,
        filters: Vec<FilterRecord>,
    },
    Finish,
    Kill,
    DidOk,
    GiveStatus { status: String },
    RmOk,
    RmError { reason: String },
    SdOk,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips_through_json() {
        let cmd = Command::DoneId {
            resourceid: "r1".into(),
            responsecode: "200".into(),
            annotation: "ok".into(),
        };
        let encoded = serde_json::to_string(&cmd).unwrap();
        assert!(encoded.contains("\"command\":\"DONE_ID\""));
        let decoded: Command = serde_json::from_str(&encoded).unwrap();
        assert_eq!(cmd, decoded);
    }

    #[test]
    fn reply_tags_match_wire_table() {
        let reply = Reply::GiveId {
            resourceid: "a".into(),
            filters: vec![FilterRecord {
                name: "upper".into(),
                order: Some(0),
                data: serde_json::json!({"ok": true}),
            }],
        };
        let encoded = serde_json::to_string(&reply).unwrap();
        assert!(encoded.contains("\"reply\":\"GIVE_ID\""));
    }
}
