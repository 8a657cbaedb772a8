//! Configuration for administering a broker node.
use std::collections::HashMap;
use std::time::Duration;

use redact::Secret;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;

#[derive(Debug, Deserialize, Clone)]
/// How to reach and administer a RabbitMq node.
pub struct AdminSettings {
    /// The Erlang node name of the broker, e.g. `rabbit@localhost`.
    #[serde(default = "default_node_name")]
    pub node_name: String,
    #[serde(
        default = "default_port",
        deserialize_with = "deserialize_number_from_string"
    )]
    /// The AMQP port of the broker.
    pub port: u16,
    /// The shared secret used to authenticate against the Erlang node.
    #[serde(default)]
    pub cookie: Option<Secret<String>>,
    /// How long to wait for the broker to change state (start, stop, ...), in milliseconds.
    ///
    /// `0` disables waiting altogether.
    #[serde(default)]
    pub startup_timeout_ms: u64,
    /// Remaps remote calls, from `module%function` to `module%function`.
    ///
    /// Useful when a broker version moved a function to a different module.
    #[serde(default)]
    pub module_adapter: HashMap<String, String>,
}

fn default_node_name() -> String {
    "rabbit@localhost".into()
}

fn default_port() -> u16 {
    5672
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            port: default_port(),
            cookie: None,
            startup_timeout_ms: 0,
            module_adapter: HashMap::new(),
        }
    }
}

impl AdminSettings {
    /// `None` if waiting for state changes is disabled.
    pub fn startup_timeout(&self) -> Option<Duration> {
        (self.startup_timeout_ms > 0).then(|| Duration::from_millis(self.startup_timeout_ms))
    }
}

/// Make a node name unique by suffixing it with a random UUID.
///
/// Remote-call clients register themselves as nodes: two clients using the same name would
/// kick each other out.
pub fn unique_node_name(base: &str) -> String {
    format!("{}-{}", base.trim(), uuid::Uuid::new_v4())
}
