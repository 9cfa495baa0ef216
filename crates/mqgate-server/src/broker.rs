//! Broker Core collaborator.
//!
//! The connection state machine hands CONNECT and SUBSCRIBE decisions to a
//! [`BrokerCore`]. Authentication, authorization and subscription storage live
//! behind this trait so they can be swapped without touching framing or the
//! codec. [`GrantAll`] is the default policy: every client is accepted and
//! every well-formed filter is granted.

use log::debug;

use mqgate_core::packet::{ConnackCode, Connect, QoS, SubackReturnCode};

use crate::config::Config;

/// Decisions the connection handler delegates to the broker.
pub trait BrokerCore: Send + Sync {
    /// Decide whether to accept a CONNECT. Anything other than `Accepted` is
    /// sent back in the CONNACK and the connection is then closed.
    fn connect(&self, connect: &Connect) -> ConnackCode;

    /// Register subscriptions for `client_id`.
    ///
    /// Must return exactly one code per requested filter, in request order.
    fn subscribe(&self, client_id: &str, topics: &[(String, QoS)]) -> Vec<SubackReturnCode>;

    /// Called once when an accepted client's connection ends.
    fn disconnect(&self, _client_id: &str) {}
}

/// Default broker policy: accept everyone, grant every valid filter.
#[derive(Debug, Clone)]
pub struct GrantAll {
    max_qos: QoS,
    max_topic_length: usize,
    max_topic_levels: usize,
}

impl Default for GrantAll {
    fn default() -> Self {
        Self {
            max_qos: QoS::ExactlyOnce,
            max_topic_length: 0,
            max_topic_levels: 0,
        }
    }
}

impl GrantAll {
    pub fn new(max_qos: QoS, max_topic_length: usize, max_topic_levels: usize) -> Self {
        Self {
            max_qos,
            max_topic_length,
            max_topic_levels,
        }
    }

    /// Build from the `[mqtt]` and `[limits]` sections.
    pub fn from_config(config: &Config) -> Self {
        let max_qos = QoS::try_from(config.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce);
        Self::new(
            max_qos,
            config.limits.max_topic_length,
            config.limits.max_topic_levels,
        )
    }

    fn grant(&self, filter: &str, requested: QoS) -> SubackReturnCode {
        if !is_valid_filter(filter, self.max_topic_length, self.max_topic_levels) {
            return SubackReturnCode::Failure;
        }
        SubackReturnCode::Granted(requested.min(self.max_qos))
    }
}

impl BrokerCore for GrantAll {
    fn connect(&self, connect: &Connect) -> ConnackCode {
        debug!(
            "Accepting client '{}' (level {}, keep_alive={}s)",
            connect.client_id, connect.protocol_level, connect.keep_alive
        );
        ConnackCode::Accepted
    }

    fn subscribe(&self, client_id: &str, topics: &[(String, QoS)]) -> Vec<SubackReturnCode> {
        topics
            .iter()
            .map(|(filter, qos)| {
                let code = self.grant(filter, *qos);
                debug!("Client '{}' subscribe '{}' -> {:?}", client_id, filter, code);
                code
            })
            .collect()
    }
}

/// Check a topic filter against length and depth limits (0 = no limit) and
/// the wildcard placement rules: `#` only as the whole last level, `+` only
/// as a whole level.
pub fn is_valid_filter(filter: &str, max_length: usize, max_levels: usize) -> bool {
    if filter.is_empty() || (max_length > 0 && filter.len() > max_length) {
        return false;
    }

    let mut levels = filter.split('/').peekable();
    let mut depth = 0usize;
    while let Some(level) = levels.next() {
        depth += 1;
        if max_levels > 0 && depth > max_levels {
            return false;
        }
        let is_last = levels.peek().is_none();
        if level.contains('#') && (level != "#" || !is_last) {
            return false;
        }
        if level.contains('+') && level != "+" {
            return false;
        }
    }
    true
}
