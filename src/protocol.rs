//! Protocol Module
//!
//! Builds the one frame this client ever sends: the OKX v5 `subscribe` request.
//! Incoming payloads are deliberately left unparsed.

use serde::Serialize;

/// One channel/instrument pair of a subscribe request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub channel: String,
    #[serde(rename = "instId")]
    pub inst_id: String,
}

impl Subscription {
    pub fn new(channel: &str, inst_id: &str) -> Self {
        Self {
            channel: channel.to_string(),
            inst_id: inst_id.to_string(),
        }
    }
}

impl Default for Subscription {
    fn default() -> Self {
        Self::new("books", "BTC-USDT")
    }
}

/// Subscribe request envelope
#[derive(Debug, Serialize)]
pub struct SubscribeMessage<'a> {
    pub op: &'static str,
    pub args: [&'a Subscription; 1],
}

/// Generate the subscribe text frame for a single subscription
///
/// Field order is fixed by the struct layout, so the default subscription
/// serializes to exactly
/// `{"op":"subscribe","args":[{"channel":"books","instId":"BTC-USDT"}]}`.
pub fn subscribe_message(subscription: &Subscription) -> Result<String, serde_json::Error> {
    let msg = SubscribeMessage {
        op: "subscribe",
        args: [subscription],
    };
    serde_json::to_string(&msg)
}
