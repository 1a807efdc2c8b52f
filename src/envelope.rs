//! # Wire Envelope Codec
//!
//! The overlay speaks a line-oriented UTF-8 datagram format:
//!
//! ```text
//! <id>;<ttl>;<ORDER>              (no payload)
//! <id>;<ttl>;<ORDER>;<d0>,<d1>    (payload)
//! ```
//!
//! - `id` is a UUID assigned when the message is originated and kept
//!   unchanged on every relay hop, so the seen-cache can suppress loops.
//! - `ttl` is the remaining hop budget; it is decremented once per relay.
//! - `ORDER` names the protocol operation and is upper-cased on both the
//!   encode and decode path so handler lookup is case-insensitive.
//! - `data` items may not contain `;` or `,` (known representational limit).
//!
//! Decoding is deliberately permissive: any input that does not match the
//! format (wrong separator count, non-UTF-8 bytes, unparseable ttl) is
//! normalized to the canonical invalid envelope instead of an error. Invalid
//! envelopes are discarded by the dispatcher before any handler runs, which
//! keeps malformed traffic off every other code path.

use std::fmt;

use uuid::Uuid;

/// Protocol operations carried by an envelope.
///
/// The four built-in orders drive discovery and liveness; `Other` is the
/// open extension point for application-defined orders. The wire form is
/// always the upper-cased name, so `Other` only ever holds upper-cased
/// strings (enforced by [`Order::parse`]).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Order {
    /// Join announcement; replied to with `Peers`.
    Hello,
    /// Membership exchange: a list of `host:port` peer ids.
    Peers,
    /// Liveness probe carrying the prober's identity.
    Ping,
    /// Liveness reply carrying the responder's identity.
    Alive,
    /// Application-defined order (upper-cased tag).
    Other(String),
}

impl Order {
    /// Parse an order tag, normalizing case. An empty tag parses to
    /// `Other("")`, which marks the enclosing envelope invalid.
    pub fn parse(tag: &str) -> Self {
        let upper = tag.to_ascii_uppercase();
        match upper.as_str() {
            "HELLO" => Order::Hello,
            "PEERS" => Order::Peers,
            "PING" => Order::Ping,
            "ALIVE" => Order::Alive,
            _ => Order::Other(upper),
        }
    }

    /// True if this order carries a non-empty tag.
    pub fn is_named(&self) -> bool {
        !matches!(self, Order::Other(tag) if tag.is_empty())
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Order::Hello => f.write_str("HELLO"),
            Order::Peers => f.write_str("PEERS"),
            Order::Ping => f.write_str("PING"),
            Order::Alive => f.write_str("ALIVE"),
            Order::Other(tag) => f.write_str(tag),
        }
    }
}

/// A single overlay message.
///
/// Envelopes are created at origin (local HELLO/PING emission) or at relay
/// (decoded from wire bytes) and dropped after local processing; there is no
/// persistent message store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Globally unique message id, assigned once at origin.
    pub id: String,
    /// Remaining hop budget. `<= 0` means expired: still handled locally,
    /// never re-flooded.
    pub ttl: i64,
    pub order: Order,
    /// Order arguments, absent when the order takes none.
    pub data: Option<Vec<String>>,
}

impl Envelope {
    /// Originate a new message with a fresh UUID.
    pub fn new(ttl: i64, order: Order, data: Option<Vec<String>>) -> Self {
        Envelope {
            id: Uuid::new_v4().to_string(),
            ttl,
            order,
            data,
        }
    }

    /// The canonical invalid envelope that all malformed input decodes to.
    pub fn invalid() -> Self {
        Envelope {
            id: "0".to_string(),
            ttl: 0,
            order: Order::Other(String::new()),
            data: None,
        }
    }

    /// A message is valid iff its order tag is non-empty.
    pub fn is_valid(&self) -> bool {
        self.order.is_named()
    }

    /// A message is expired once its hop budget is exhausted.
    pub fn is_expired(&self) -> bool {
        self.ttl <= 0
    }

    /// Encode to the wire form. Exactly inverts [`Envelope::decode`] for
    /// valid envelopes, including the absent-data case.
    pub fn encode(&self) -> Vec<u8> {
        let mut wire = format!("{};{};{}", self.id, self.ttl, self.order);
        if let Some(data) = &self.data {
            wire.push(';');
            wire.push_str(&data.join(","));
        }
        wire.into_bytes()
    }

    /// Decode wire bytes. Never fails: anything that does not match the
    /// two- or three-separator form becomes [`Envelope::invalid`].
    pub fn decode(bytes: &[u8]) -> Envelope {
        let text = match std::str::from_utf8(bytes) {
            Ok(t) => t,
            Err(_) => return Envelope::invalid(),
        };

        let fields: Vec<&str> = text.split(';').collect();
        let (id, ttl, order, data) = match fields.as_slice() {
            [id, ttl, order] => (*id, *ttl, *order, None),
            [id, ttl, order, data] => {
                let items = data.split(',').map(str::to_string).collect();
                (*id, *ttl, *order, Some(items))
            }
            _ => return Envelope::invalid(),
        };

        let ttl: i64 = match ttl.trim().parse() {
            Ok(t) => t,
            Err(_) => return Envelope::invalid(),
        };

        Envelope {
            id: id.to_string(),
            ttl,
            order: Order::parse(order),
            data,
        }
    }
}
