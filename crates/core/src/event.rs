//! Market event model
//!
//! The `MarketEvent` is the sole payload unit flowing through the pipeline:
//! producers append events, the WAL sequences them, and the sinks persist
//! them. Events are immutable once constructed.
//!
//! All monetary values use `rust_decimal::Decimal` (fixed-point, no binary
//! float). Sizes are non-negative integers.

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum symbol length in characters
pub const MAX_SYMBOL_LEN: usize = 12;

/// Validated instrument symbol
///
/// Symbols are 1-12 characters: uppercase alphanumerics plus `.`, `/`, `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Parse and validate a symbol string.
    pub fn parse(s: impl Into<String>) -> Result<Self, SymbolError> {
        let s = s.into();
        if s.is_empty() || s.len() > MAX_SYMBOL_LEN {
            return Err(SymbolError::InvalidLength { len: s.len() });
        }
        for c in s.chars() {
            let ok = c.is_ascii_uppercase() || c.is_ascii_digit() || matches!(c, '.' | '/' | '-');
            if !ok {
                return Err(SymbolError::InvalidCharacter { character: c });
            }
        }
        Ok(Symbol(s))
    }

    /// Symbol as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe form (`/` becomes `-`)
    pub fn path_component(&self) -> String {
        self.0.replace('/', "-")
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Symbol {
    type Err = SymbolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Symbol::parse(s)
    }
}

/// Symbol validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SymbolError {
    /// Symbol length outside 1-12 characters
    #[error("symbol length {len} outside 1-{max}", max = MAX_SYMBOL_LEN)]
    InvalidLength {
        /// Observed length
        len: usize,
    },

    /// Character outside the allowed set
    #[error("invalid symbol character '{character}'")]
    InvalidCharacter {
        /// Offending character
        character: char,
    },
}

/// Trade aggressor side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Aggressor {
    /// Buyer-initiated
    Buy,
    /// Seller-initiated
    Sell,
    /// Side not reported by the venue
    Unknown,
}

impl Aggressor {
    /// Short string tag used in columnar output
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggressor::Buy => "buy",
            Aggressor::Sell => "sell",
            Aggressor::Unknown => "unknown",
        }
    }
}

/// One price level of an order book side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceLevel {
    /// Level price (non-negative)
    pub price: Decimal,
    /// Resting size at the level
    pub size: u64,
}

/// Event type tag (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    /// Executed trade
    Trade,
    /// Best bid/offer quote
    BboQuote,
    /// Incremental depth update
    Depth,
    /// Full order-book snapshot
    L2Snapshot,
    /// OHLCV bar
    HistoricalBar,
    /// Provider-specific payload
    Other,
}

impl EventType {
    /// All event types, in tag order
    pub const ALL: [EventType; 6] = [
        EventType::Trade,
        EventType::BboQuote,
        EventType::Depth,
        EventType::L2Snapshot,
        EventType::HistoricalBar,
        EventType::Other,
    ];

    /// Snake-case tag used in paths and package schema names
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Trade => "trade",
            EventType::BboQuote => "bbo_quote",
            EventType::Depth => "depth",
            EventType::L2Snapshot => "l2_snapshot",
            EventType::HistoricalBar => "historical_bar",
            EventType::Other => "other",
        }
    }

    /// Parse a snake-case tag back into an event type
    pub fn from_tag(tag: &str) -> Option<EventType> {
        EventType::ALL.iter().copied().find(|t| t.as_str() == tag)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged event payload
///
/// The JSON form carries a `type` tag and a `payload` object, so every
/// serialized event is self-describing:
///
/// ```json
/// {"type":"trade","payload":{"price":"450.12","size":100,...}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum EventPayload {
    /// Executed trade
    #[serde(rename_all = "camelCase")]
    Trade {
        /// Execution price
        price: Decimal,
        /// Executed size
        size: u64,
        /// Aggressor side
        aggressor: Aggressor,
        /// Venue-assigned trade sequence, if reported
        #[serde(skip_serializing_if = "Option::is_none")]
        sequence_number: Option<u64>,
        /// Executing venue, if reported
        #[serde(skip_serializing_if = "Option::is_none")]
        venue: Option<String>,
    },

    /// Best bid/offer quote
    #[serde(rename_all = "camelCase")]
    BboQuote {
        /// Best bid price
        bid_price: Decimal,
        /// Size at the best bid
        bid_size: u64,
        /// Best ask price
        ask_price: Decimal,
        /// Size at the best ask
        ask_size: u64,
    },

    /// Incremental depth update
    #[serde(rename_all = "camelCase")]
    Depth {
        /// Updated bid levels, best first
        bids: Vec<PriceLevel>,
        /// Updated ask levels, best first
        asks: Vec<PriceLevel>,
    },

    /// Full order-book snapshot
    #[serde(rename_all = "camelCase")]
    L2Snapshot {
        /// Bid side, best first
        bids: Vec<PriceLevel>,
        /// Ask side, best first
        asks: Vec<PriceLevel>,
    },

    /// OHLCV bar
    #[serde(rename_all = "camelCase")]
    HistoricalBar {
        /// Open price
        open: Decimal,
        /// High price
        high: Decimal,
        /// Low price
        low: Decimal,
        /// Close price
        close: Decimal,
        /// Bar volume
        volume: u64,
    },

    /// Provider-specific payload carried verbatim
    #[serde(rename_all = "camelCase")]
    Other {
        /// Raw provider payload
        data: serde_json::Value,
    },
}

impl EventPayload {
    /// Event type tag for this payload
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::Trade { .. } => EventType::Trade,
            EventPayload::BboQuote { .. } => EventType::BboQuote,
            EventPayload::Depth { .. } => EventType::Depth,
            EventPayload::L2Snapshot { .. } => EventType::L2Snapshot,
            EventPayload::HistoricalBar { .. } => EventType::HistoricalBar,
            EventPayload::Other { .. } => EventType::Other,
        }
    }
}

/// A single market observation flowing through the pipeline
///
/// Immutable once constructed. The `sequence` field is the optional
/// per-source monotonic identifier reported by the feed; it is unrelated
/// to the WAL sequence assigned during persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketEvent {
    /// Event time, UTC, millisecond resolution or better
    pub timestamp: DateTime<Utc>,
    /// Instrument symbol
    pub symbol: Symbol,
    /// Typed payload
    #[serde(flatten)]
    pub payload: EventPayload,
    /// Per-source monotonic identifier (not the WAL sequence)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Producing feed identifier
    pub source: String,
}

impl MarketEvent {
    /// Construct an event with the current timestamp
    pub fn new(symbol: Symbol, payload: EventPayload, source: impl Into<String>) -> Self {
        MarketEvent {
            timestamp: Utc::now(),
            symbol,
            payload,
            sequence: None,
            source: source.into(),
        }
    }

    /// Set the event timestamp (builder pattern)
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the per-source sequence (builder pattern)
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Event type tag
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Quote spread (ask - bid), if this is a BBO quote
    pub fn spread(&self) -> Option<Decimal> {
        match &self.payload {
            EventPayload::BboQuote {
                bid_price,
                ask_price,
                ..
            } => Some(ask_price - bid_price),
            _ => None,
        }
    }

    /// Event timestamp as RFC 3339 with millisecond precision
    pub fn timestamp_rfc3339(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Serialize as a single JSON line (no trailing newline)
    ///
    /// The JSON encoder escapes control characters, so the output never
    /// contains embedded newlines.
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse an event back from a JSON line
    pub fn from_json_line(line: &str) -> serde_json::Result<MarketEvent> {
        serde_json::from_str(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn price(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn trade_event() -> MarketEvent {
        MarketEvent {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap(),
            symbol: Symbol::parse("SPY").unwrap(),
            payload: EventPayload::Trade {
                price: price("450.12"),
                size: 100,
                aggressor: Aggressor::Buy,
                sequence_number: Some(42),
                venue: Some("ARCA".to_string()),
            },
            sequence: Some(7),
            source: "alpaca".to_string(),
        }
    }

    #[test]
    fn test_symbol_parse_valid() {
        for s in ["SPY", "BTC/USD", "BRK.B", "ES-2024", "A", "ABCDEFGHIJKL"] {
            assert!(Symbol::parse(s).is_ok(), "{} should parse", s);
        }
    }

    #[test]
    fn test_symbol_parse_invalid() {
        assert!(matches!(
            Symbol::parse(""),
            Err(SymbolError::InvalidLength { len: 0 })
        ));
        assert!(matches!(
            Symbol::parse("ABCDEFGHIJKLM"),
            Err(SymbolError::InvalidLength { len: 13 })
        ));
        assert!(matches!(
            Symbol::parse("spy"),
            Err(SymbolError::InvalidCharacter { character: 's' })
        ));
        assert!(matches!(
            Symbol::parse("SP Y"),
            Err(SymbolError::InvalidCharacter { character: ' ' })
        ));
    }

    #[test]
    fn test_symbol_path_component() {
        let sym = Symbol::parse("BTC/USD").unwrap();
        assert_eq!(sym.path_component(), "BTC-USD");
    }

    #[test]
    fn test_event_type_tags_roundtrip() {
        for ty in EventType::ALL {
            assert_eq!(EventType::from_tag(ty.as_str()), Some(ty));
        }
        assert_eq!(EventType::from_tag("bogus"), None);
    }

    #[test]
    fn test_trade_json_shape() {
        let event = trade_event();
        let line = event.to_json_line().unwrap();

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "trade");
        assert_eq!(value["symbol"], "SPY");
        assert_eq!(value["payload"]["price"], "450.12");
        assert_eq!(value["payload"]["size"], 100);
        assert_eq!(value["payload"]["aggressor"], "buy");
        assert_eq!(value["payload"]["sequenceNumber"], 42);
        assert_eq!(value["source"], "alpaca");
        // camelCase keys, RFC 3339 timestamp with timezone
        assert!(value["timestamp"].as_str().unwrap().starts_with("2024-01-15T14:30:00"));
    }

    #[test]
    fn test_json_line_roundtrip() {
        let event = trade_event();
        let line = event.to_json_line().unwrap();
        let parsed = MarketEvent::from_json_line(&line).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_json_line_no_embedded_newlines() {
        let event = MarketEvent::new(
            Symbol::parse("SPY").unwrap(),
            EventPayload::Other {
                data: serde_json::json!({"note": "line one\nline two"}),
            },
            "test",
        );
        let line = event.to_json_line().unwrap();
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_bbo_spread() {
        let event = MarketEvent::new(
            Symbol::parse("QQQ").unwrap(),
            EventPayload::BboQuote {
                bid_price: price("388.10"),
                bid_size: 200,
                ask_price: price("388.15"),
                ask_size: 150,
            },
            "test",
        );
        assert_eq!(event.spread(), Some(price("0.05")));
        assert_eq!(trade_event().spread(), None);
    }

    #[test]
    fn test_l2_snapshot_roundtrip() {
        let event = MarketEvent::new(
            Symbol::parse("ES-2024").unwrap(),
            EventPayload::L2Snapshot {
                bids: vec![
                    PriceLevel { price: price("4500.25"), size: 10 },
                    PriceLevel { price: price("4500.00"), size: 25 },
                ],
                asks: vec![PriceLevel { price: price("4500.50"), size: 12 }],
            },
            "cme",
        );
        let line = event.to_json_line().unwrap();
        let parsed = MarketEvent::from_json_line(&line).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.event_type(), EventType::L2Snapshot);
    }

    #[test]
    fn test_all_payloads_serialize() {
        let payloads = vec![
            EventPayload::Trade {
                price: price("1.0"),
                size: 1,
                aggressor: Aggressor::Unknown,
                sequence_number: None,
                venue: None,
            },
            EventPayload::BboQuote {
                bid_price: price("1.0"),
                bid_size: 1,
                ask_price: price("1.1"),
                ask_size: 1,
            },
            EventPayload::Depth { bids: vec![], asks: vec![] },
            EventPayload::L2Snapshot { bids: vec![], asks: vec![] },
            EventPayload::HistoricalBar {
                open: price("1"),
                high: price("2"),
                low: price("0.5"),
                close: price("1.5"),
                volume: 1000,
            },
            EventPayload::Other { data: serde_json::json!({"k": "v"}) },
        ];

        for payload in payloads {
            let event = MarketEvent::new(Symbol::parse("SPY").unwrap(), payload, "test");
            let line = event.to_json_line().unwrap();
            let parsed = MarketEvent::from_json_line(&line).unwrap();
            assert_eq!(parsed, event);
        }
    }
}
