//! Wire messages: a closed sum type for the five auction message intents.
//!
//! `spec.md` §6 specifies these as UTF-8 JSON bodies with an `intent` field
//! tagging one of `announce_task | bid | award | reject | status_update`.
//! Rather than a stringly-typed `intent` plus freeform JSON, the message is a
//! closed enum parsed once at the transport boundary (`spec.md` §9).

use serde::{Deserialize, Serialize};

use crate::task::Task;

/// Metadata every message on the wire carries, per `spec.md` §6.
pub const ONTOLOGY: &str = "dispatch_auction";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum Message {
    AnnounceTask(Task),
    Bid {
        task_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        bid: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        no_bid: Option<bool>,
    },
    Award(Task),
    Reject {
        task_id: String,
        winner: String,
        bid: f64,
    },
    StatusUpdate {
        task_id: String,
        vehicle: String,
        finished_ts: f64,
        deadline_ts: f64,
        distance: f64,
        delivered_latlon: (f64, f64),
    },
}

impl Message {
    pub fn no_bid(task_id: impl Into<String>) -> Self {
        Message::Bid {
            task_id: task_id.into(),
            bid: None,
            no_bid: Some(true),
        }
    }

    pub fn bid(task_id: impl Into<String>, value: f64) -> Self {
        Message::Bid {
            task_id: task_id.into(),
            bid: Some(value),
            no_bid: None,
        }
    }
}

/// An addressed message: `from`/`to` plus the tagged body. This is the unit the
/// in-process [`crate::transport::MessageBus`] carries; it stands in for the
/// XMPP envelope the real transport (out of scope for this crate) would use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    pub ontology: String,
    pub message: Message,
}

impl Envelope {
    pub fn new(from: impl Into<String>, to: impl Into<String>, message: Message) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            ontology: ONTOLOGY.to_string(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bid_round_trips_through_json() {
        let env = Envelope::new("vehicle1", "dispatcher", Message::bid("T1-100", 42.5));
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        match back.message {
            Message::Bid { task_id, bid, no_bid } => {
                assert_eq!(task_id, "T1-100");
                assert_eq!(bid, Some(42.5));
                assert_eq!(no_bid, None);
            }
            _ => panic!("expected Bid"),
        }
    }
}
