use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Consumer-side predicate deciding which messages a subscription wants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum FilterSpec {
    /// Every listed header must be present with the given value.
    AllHeaders(HashMap<String, String>),
    /// At least one listed header must be present with the given value.
    AnyHeader(HashMap<String, String>),
    RoutingKeyPrefix(String),
}

impl FilterSpec {
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            Self::AllHeaders(headers) => headers
                .iter()
                .all(|(k, v)| message.header(k) == Some(v.as_str())),
            Self::AnyHeader(headers) => headers
                .iter()
                .any(|(k, v)| message.header(k) == Some(v.as_str())),
            Self::RoutingKeyPrefix(prefix) => {
                message.metadata().routing_key.starts_with(prefix.as_str())
            }
        }
    }
}
