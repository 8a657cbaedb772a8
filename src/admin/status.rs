//! Typed views over the terms returned by the broker node.
use std::fmt;

use super::RpcValue;

/// An application running on the broker node, e.g. `rabbit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub id: String,
    pub description: String,
    pub version: String,
}

/// What the broker node reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RabbitStatus {
    pub running_applications: Vec<Application>,
    pub nodes: Vec<String>,
    pub running_nodes: Vec<String>,
}

impl RabbitStatus {
    /// The Erlang node answered.
    pub fn is_alive(&self) -> bool {
        !self.nodes.is_empty()
    }

    /// At least one node of the cluster is running.
    pub fn is_running(&self) -> bool {
        !self.running_nodes.is_empty()
    }

    /// The `rabbit` application is up and accepting connections.
    pub fn is_ready(&self) -> bool {
        self.is_running() && self.running_applications.iter().any(|app| app.id == "rabbit")
    }

    /// Read `rabbit:status()` and `rabbit_mnesia:status()` replies.
    pub(crate) fn from_replies(rabbit: &RpcValue, mnesia: &RpcValue) -> Self {
        let running_applications = rabbit
            .property("running_applications")
            .and_then(RpcValue::as_list)
            .unwrap_or_default()
            .iter()
            .filter_map(parse_application)
            .collect();
        let nodes = mnesia
            .property("nodes")
            .and_then(RpcValue::as_list)
            .unwrap_or_default()
            .iter()
            .filter_map(|kind| match kind.as_tuple()? {
                [_, names] => names.as_list(),
                _ => None,
            })
            .flatten()
            .filter_map(RpcValue::as_text)
            .collect();
        let running_nodes = mnesia
            .property("running_nodes")
            .and_then(RpcValue::as_list)
            .unwrap_or_default()
            .iter()
            .filter_map(RpcValue::as_text)
            .collect();
        Self {
            running_applications,
            nodes,
            running_nodes,
        }
    }
}

impl fmt::Display for RabbitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let applications: Vec<&str> = self
            .running_applications
            .iter()
            .map(|app| app.id.as_str())
            .collect();
        write!(
            f,
            "RabbitStatus [runningApplications={applications:?}, nodes={:?}, runningNodes={:?}]",
            self.nodes, self.running_nodes
        )
    }
}

fn parse_application(value: &RpcValue) -> Option<Application> {
    match value.as_tuple()? {
        [id, description, version] => Some(Application {
            id: id.as_text()?,
            description: description.as_text().unwrap_or_default(),
            version: version.as_text().unwrap_or_default(),
        }),
        _ => None,
    }
}

/// A queue, as listed by `rabbit_amqqueue:info_all(VHost)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub vhost: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub messages: Option<i64>,
    pub consumers: Option<i64>,
}

impl QueueInfo {
    pub(crate) fn from_reply(value: &RpcValue) -> Option<Self> {
        // {resource, VHost, queue, Name}
        let (vhost, name) = match value.property("name")?.as_tuple()? {
            [_, vhost, _, name] => (vhost.as_text()?, name.as_text()?),
            _ => return None,
        };
        let flag = |key: &str| value.property(key).and_then(RpcValue::as_atom) == Some("true");
        Some(Self {
            name,
            vhost,
            durable: flag("durable"),
            auto_delete: flag("auto_delete"),
            messages: value.property("messages").and_then(RpcValue::as_long),
            consumers: value.property("consumers").and_then(RpcValue::as_long),
        })
    }
}
