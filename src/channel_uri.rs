//! Channel URI parsing (spec §6 "Channel URI scheme").
//!
//! `aeron:udp?endpoint=...|stream-id=...` style URIs: a media type, then
//! `|`-separated `key=value` pairs. Parsing never touches the network;
//! it only normalizes the key/value table and derives the typed params
//! consumed by publication/subscription creation (§4.3, §4.4).

use std::collections::BTreeMap;

use crate::error::Error;

pub const SPY_PREFIX: &str = "aeron-spy:";

pub const KEY_ENDPOINT: &str = "endpoint";
pub const KEY_CONTROL: &str = "control";
pub const KEY_CONTROL_MODE: &str = "control-mode";
pub const KEY_SESSION_ID: &str = "session-id";
pub const KEY_MTU: &str = "mtu";
pub const KEY_TERM_LENGTH: &str = "term-length";
pub const KEY_INIT_TERM_ID: &str = "init-term-id";
pub const KEY_TERM_ID: &str = "term-id";
pub const KEY_TERM_OFFSET: &str = "term-offset";
pub const KEY_LINGER: &str = "linger";
pub const KEY_SPARSE: &str = "sparse";
pub const KEY_RELIABLE: &str = "reliable";
pub const KEY_REJOIN: &str = "rejoin";
pub const KEY_GROUP: &str = "group";
pub const KEY_TAG: &str = "tag";
pub const KEY_ALIAS: &str = "alias";
pub const KEY_RECEIVER_WINDOW: &str = "receiver-window-length";
pub const KEY_SOCKET_RCVBUF: &str = "socket-rcvbuf";
pub const KEY_SOCKET_SNDBUF: &str = "socket-sndbuf";
pub const KEY_TTL: &str = "ttl";
pub const KEY_SEND_TIMESTAMP_OFFSET: &str = "channel-send-timestamp-offset";
pub const KEY_RECEIVE_TIMESTAMP_OFFSET: &str = "channel-receive-timestamp-offset";

/// Reserved keys an MDC/MDS destination URI must not carry (spec §4.6,
/// §4.9).
pub const RESERVED_DESTINATION_KEYS: &[&str] = &[KEY_MTU, KEY_RECEIVER_WINDOW, KEY_SOCKET_RCVBUF, KEY_SOCKET_SNDBUF];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Media {
    Udp,
    Ipc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    None,
    Manual,
    Dynamic,
}

/// A parsed channel URI: media type, whether it is an `aeron-spy:`
/// eavesdrop, and the raw `|`-separated key/value table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUri {
    pub media: Media,
    pub is_spy: bool,
    params: BTreeMap<String, String>,
}

impl ChannelUri {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let (is_spy, rest) = match raw.strip_prefix(SPY_PREFIX) {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let rest = rest
            .strip_prefix("aeron:")
            .ok_or_else(|| Error::InvalidChannel(format!("missing aeron: prefix: {raw}")))?;

        let mut parts = rest.splitn(2, '?');
        let media_str = parts.next().unwrap_or_default();
        let media = match media_str {
            "udp" => Media::Udp,
            "ipc" => Media::Ipc,
            other => {
                return Err(Error::InvalidChannel(format!("unknown media type: {other}")));
            }
        };

        let mut params = BTreeMap::new();
        if let Some(query) = parts.next() {
            for pair in query.split('|') {
                if pair.is_empty() {
                    continue;
                }
                let mut kv = pair.splitn(2, '=');
                let key = kv.next().unwrap_or_default().to_string();
                let value = kv
                    .next()
                    .ok_or_else(|| Error::InvalidChannel(format!("malformed key=value pair: {pair}")))?
                    .to_string();
                params.insert(key, value);
            }
        }

        Ok(Self { media, is_spy, params })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn control_mode(&self) -> ControlMode {
        match self.get(KEY_CONTROL_MODE) {
            Some("manual") => ControlMode::Manual,
            Some("dynamic") => ControlMode::Dynamic,
            _ => ControlMode::None,
        }
    }

    pub fn is_reliable(&self, default: bool) -> bool {
        self.get(KEY_RELIABLE).map(|v| v == "true").unwrap_or(default)
    }

    pub fn is_rejoin(&self, default: bool) -> bool {
        self.get(KEY_REJOIN).map(|v| v == "true").unwrap_or(default)
    }

    pub fn is_sparse(&self, default: bool) -> bool {
        self.get(KEY_SPARSE).map(|v| v == "true").unwrap_or(default)
    }

    /// `group` is tri-state: explicit `true`/`false`, or `infer` which
    /// defers to the group-inferable rule (spec §9 open question).
    pub fn group(&self) -> Option<bool> {
        match self.get(KEY_GROUP) {
            Some("true") => Some(true),
            Some("false") => Some(false),
            _ => None,
        }
    }

    pub fn session_id(&self) -> Result<Option<i32>, Error> {
        self.parse_i32(KEY_SESSION_ID)
    }

    pub fn mtu(&self) -> Result<Option<u32>, Error> {
        self.parse_u32(KEY_MTU)
    }

    pub fn term_length(&self) -> Result<Option<u32>, Error> {
        self.parse_u32(KEY_TERM_LENGTH)
    }

    pub fn init_term_id(&self) -> Result<Option<i32>, Error> {
        self.parse_i32(KEY_INIT_TERM_ID)
    }

    pub fn term_id(&self) -> Result<Option<i32>, Error> {
        self.parse_i32(KEY_TERM_ID)
    }

    pub fn term_offset(&self) -> Result<Option<u32>, Error> {
        self.parse_u32(KEY_TERM_OFFSET)
    }

    pub fn tag(&self) -> Option<&str> {
        self.get(KEY_TAG)
    }

    pub fn socket_rcvbuf(&self) -> Result<Option<u32>, Error> {
        self.parse_u32(KEY_SOCKET_RCVBUF)
    }

    pub fn socket_sndbuf(&self) -> Result<Option<u32>, Error> {
        self.parse_u32(KEY_SOCKET_SNDBUF)
    }

    fn parse_i32(&self, key: &str) -> Result<Option<i32>, Error> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| Error::InvalidChannel(format!("invalid integer for {key}: {raw}"))),
        }
    }

    fn parse_u32(&self, key: &str) -> Result<Option<u32>, Error> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| Error::InvalidChannel(format!("invalid integer for {key}: {raw}"))),
        }
    }

    /// The canonical form used as the endpoint registry key: media plus
    /// the resolved `endpoint` (or `control` for manual-control send
    /// channels), normalized independent of key ordering (spec §4.5,
    /// §GLOSSARY "Canonical form").
    pub fn canonical_form(&self) -> String {
        let address = self
            .get(KEY_ENDPOINT)
            .or_else(|| self.get(KEY_CONTROL))
            .unwrap_or("");
        match self.media {
            Media::Udp => format!("udp://{address}"),
            Media::Ipc => "ipc".to_string(),
        }
    }

    /// True if an endpoint/control address ends in an explicit `:0` port
    /// (spec §4.9: "network destinations must not end with `:0` port").
    pub fn has_zero_port(&self, key: &str) -> bool {
        self.get(key)
            .map(|addr| addr.ends_with(":0"))
            .unwrap_or(false)
    }

    /// Validates a destination URI used for `AddDestination`/
    /// `AddRcvDestination` against spec §4.6/§4.9: must not be a spy, must
    /// not carry any reserved key.
    pub fn validate_as_destination(&self) -> Result<(), Error> {
        if self.is_spy {
            return Err(Error::InvalidChannel(
                "destination URI must not be a spy prefix".into(),
            ));
        }
        for key in RESERVED_DESTINATION_KEYS {
            if self.contains_key(key) {
                return Err(Error::InvalidChannel(format!(
                    "destination URI must not set reserved key {key}"
                )));
            }
        }
        if self.media == Media::Udp && self.has_zero_port(KEY_ENDPOINT) {
            return Err(Error::InvalidChannel(
                "network destination must not end with :0 port".into(),
            ));
        }
        Ok(())
    }

    /// Spec §4.9: "A publication must not have an endpoint port of 0
    /// unless in manual/dynamic control mode."
    pub fn validate_as_publication(&self) -> Result<(), Error> {
        if self.media == Media::Udp && self.control_mode() == ControlMode::None && self.has_zero_port(KEY_ENDPOINT) {
            return Err(Error::InvalidChannel(
                "publication endpoint must not use port 0 outside manual/dynamic control mode".into(),
            ));
        }
        Ok(())
    }

    /// Spec §4.9: "A subscription must not declare explicit control with
    /// port 0."
    pub fn validate_as_subscription(&self) -> Result<(), Error> {
        if self.media == Media::Udp && self.contains_key(KEY_CONTROL) && self.has_zero_port(KEY_CONTROL) {
            return Err(Error::InvalidChannel("subscription control address must not use port 0".into()));
        }
        Ok(())
    }

    /// Media receive timestamps are unsupported (spec §4.9).
    pub fn validate_no_receive_timestamp(&self) -> Result<(), Error> {
        if self.contains_key(KEY_RECEIVE_TIMESTAMP_OFFSET) {
            return Err(Error::InvalidChannel(
                "channel-receive-timestamp-offset is not supported".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_media_and_params() {
        let uri = ChannelUri::parse("aeron:udp?endpoint=127.0.0.1:40123|stream-id=1001|reliable=true").unwrap();
        assert_eq!(uri.media, Media::Udp);
        assert!(!uri.is_spy);
        assert_eq!(uri.get(KEY_ENDPOINT), Some("127.0.0.1:40123"));
        assert!(uri.is_reliable(false));
    }

    #[test]
    fn recognizes_spy_prefix() {
        let uri = ChannelUri::parse("aeron-spy:aeron:udp?endpoint=127.0.0.1:40123").unwrap();
        assert!(uri.is_spy);
        assert_eq!(uri.media, Media::Udp);
    }

    #[test]
    fn rejects_unknown_media() {
        assert!(ChannelUri::parse("aeron:tcp?endpoint=x").is_err());
    }

    #[test]
    fn canonical_form_ignores_key_order() {
        let a = ChannelUri::parse("aeron:udp?endpoint=127.0.0.1:40123|stream-id=1").unwrap();
        let b = ChannelUri::parse("aeron:udp?stream-id=1|endpoint=127.0.0.1:40123").unwrap();
        assert_eq!(a.canonical_form(), b.canonical_form());
    }

    #[test]
    fn destination_validation_rejects_spy_and_reserved_keys() {
        let spy = ChannelUri::parse("aeron-spy:aeron:udp?endpoint=127.0.0.1:1").unwrap();
        assert!(spy.validate_as_destination().is_err());

        let reserved = ChannelUri::parse("aeron:udp?endpoint=127.0.0.1:1|mtu=1408").unwrap();
        assert!(reserved.validate_as_destination().is_err());

        let zero_port = ChannelUri::parse("aeron:udp?endpoint=127.0.0.1:0").unwrap();
        assert!(zero_port.validate_as_destination().is_err());

        let ok = ChannelUri::parse("aeron:udp?endpoint=127.0.0.1:40124").unwrap();
        assert!(ok.validate_as_destination().is_ok());
    }

    #[test]
    fn publication_rejects_zero_port_outside_manual_control() {
        let zero = ChannelUri::parse("aeron:udp?endpoint=127.0.0.1:0").unwrap();
        assert!(zero.validate_as_publication().is_err());

        let manual = ChannelUri::parse("aeron:udp?endpoint=127.0.0.1:0|control-mode=manual").unwrap();
        assert!(manual.validate_as_publication().is_ok());
    }

    #[test]
    fn subscription_rejects_zero_port_control() {
        let zero = ChannelUri::parse("aeron:udp?control=127.0.0.1:0|endpoint=127.0.0.1:40123").unwrap();
        assert!(zero.validate_as_subscription().is_err());

        let ok = ChannelUri::parse("aeron:udp?endpoint=127.0.0.1:40123").unwrap();
        assert!(ok.validate_as_subscription().is_ok());
    }
}
