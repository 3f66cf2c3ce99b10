use crate::{
    monitoring::{self, CompiledMonitoringParams, MonitoringParameters},
    types::SubscribeClientConfig,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt, str::FromStr};
use ua_listener_sdk::{ListenerError, ListenerResult};

/// Kind of identifier inside a node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierType {
    /// `i`
    Numeric,
    /// `s`
    String,
    /// `g`
    Guid,
    /// `b`
    Opaque,
}

impl IdentifierType {
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            IdentifierType::Numeric => "i",
            IdentifierType::String => "s",
            IdentifierType::Guid => "g",
            IdentifierType::Opaque => "b",
        }
    }

    /// Whether `identifier` is syntactically valid for this type.
    fn accepts(self, identifier: &str) -> bool {
        match self {
            IdentifierType::Numeric => identifier.parse::<u32>().is_ok(),
            IdentifierType::Guid => uuid::Uuid::parse_str(identifier).is_ok(),
            IdentifierType::String | IdentifierType::Opaque => true,
        }
    }
}

impl FromStr for IdentifierType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "i" => Ok(IdentifierType::Numeric),
            "s" => Ok(IdentifierType::String),
            "g" => Ok(IdentifierType::Guid),
            "b" => Ok(IdentifierType::Opaque),
            _ => Err(()),
        }
    }
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node as written in the configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Field name of the emitted value
    pub name: String,
    pub namespace: String,
    pub identifier_type: String,
    pub identifier: String,
    /// Extra tags as `[key, value]` pairs
    pub tags: Vec<Vec<String>>,
    pub monitoring_params: MonitoringParameters,
}

/// A group of nodes sharing metric name, namespace, identifier type and tags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeGroupSettings {
    /// Metric name for all nodes of the group; empty inherits the client name
    pub name: String,
    pub namespace: String,
    pub identifier_type: String,
    pub tags: Vec<Vec<String>>,
    pub nodes: Vec<NodeSettings>,
}

/// A fully validated node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDescriptor {
    pub metric_name: String,
    pub field_name: String,
    pub namespace: u16,
    pub identifier_type: IdentifierType,
    pub identifier: String,
    /// Ordered tags with unique keys
    pub tags: Vec<(String, String)>,
    pub monitoring: CompiledMonitoringParams,
}

impl NodeDescriptor {
    /// Fully qualified id, `ns=<namespace>;<type>=<identifier>`.
    #[inline]
    pub fn node_id(&self) -> String {
        format!(
            "ns={};{}={}",
            self.namespace, self.identifier_type, self.identifier
        )
    }
}

/// Fully qualified id built from the raw configuration strings.
#[inline]
pub fn node_id_string(settings: &NodeSettings) -> String {
    format!(
        "ns={};{}={}",
        settings.namespace, settings.identifier_type, settings.identifier
    )
}

/// Validate a single node and attach it to `metric_name`.
pub fn resolve_node(metric_name: &str, settings: &NodeSettings) -> ListenerResult<NodeDescriptor> {
    let id = node_id_string(settings);

    if settings.name.is_empty() {
        return Err(ListenerError::ConfigurationError(format!(
            "empty node name in metric '{metric_name}'"
        )));
    }

    let namespace = settings.namespace.parse::<u16>().map_err(|_| {
        ListenerError::ConfigurationError(format!(
            "namespace '{}' is not a valid non-negative integer, node '{id}'",
            settings.namespace
        ))
    })?;

    if settings.identifier.is_empty() {
        return Err(ListenerError::ConfigurationError(format!(
            "empty node identifier not allowed, node '{id}'"
        )));
    }

    let identifier_type = settings
        .identifier_type
        .parse::<IdentifierType>()
        .map_err(|_| {
            ListenerError::ConfigurationError(format!(
                "identifier_type '{}' not supported, node '{id}'",
                settings.identifier_type
            ))
        })?;

    if !identifier_type.accepts(&settings.identifier) {
        return Err(ListenerError::ConfigurationError(format!(
            "identifier '{}' does not match identifier_type '{identifier_type}', node '{id}'",
            settings.identifier
        )));
    }

    let tags = tag_pairs(&settings.tags, &id)?;
    let monitoring = monitoring::compile(&settings.monitoring_params, &id)?;

    Ok(NodeDescriptor {
        metric_name: metric_name.to_string(),
        field_name: settings.name.clone(),
        namespace,
        identifier_type,
        identifier: settings.identifier.clone(),
        tags,
        monitoring,
    })
}

fn tag_pairs(raw: &[Vec<String>], id: &str) -> ListenerResult<Vec<(String, String)>> {
    let mut seen = HashSet::with_capacity(raw.len());
    let mut pairs = Vec::with_capacity(raw.len());
    for (i, tag) in raw.iter().enumerate() {
        let [key, value] = tag.as_slice() else {
            return Err(ListenerError::ConfigurationError(format!(
                "tag {} needs 2 values, has {}, node '{id}'",
                i + 1,
                tag.len()
            )));
        };
        if key.is_empty() {
            return Err(ListenerError::ConfigurationError(format!(
                "tag {} has an empty key, node '{id}'",
                i + 1
            )));
        }
        if !seen.insert(key.as_str()) {
            return Err(ListenerError::ConfigurationError(format!(
                "tag '{key}' has duplicate key, node '{id}'"
            )));
        }
        pairs.push((key.clone(), value.clone()));
    }
    Ok(pairs)
}

/// Merge group tags with node tags.
///
/// Group tags keep their order; a node tag with the same key replaces the
/// group value in place and node-only tags are appended in node order.
pub fn merge_tags(group: &[Vec<String>], node: &[Vec<String>]) -> Vec<Vec<String>> {
    let mut merged: Vec<Vec<String>> = group.to_vec();
    for tag in node {
        let existing = tag
            .first()
            .and_then(|key| merged.iter_mut().find(|g| g.first() == Some(key)));
        match existing {
            Some(slot) => *slot = tag.clone(),
            None => merged.push(tag.clone()),
        }
    }
    merged
}

/// Apply group defaults to every member node and resolve them.
pub fn expand_group(
    group: &NodeGroupSettings,
    default_metric_name: &str,
) -> ListenerResult<Vec<NodeDescriptor>> {
    let metric_name = if group.name.is_empty() {
        default_metric_name
    } else {
        group.name.as_str()
    };

    group
        .nodes
        .iter()
        .map(|node| {
            let mut effective = node.clone();
            if effective.namespace.is_empty() {
                effective.namespace = group.namespace.clone();
            }
            if effective.identifier_type.is_empty() {
                effective.identifier_type = group.identifier_type.clone();
            }
            effective.tags = merge_tags(&group.tags, &node.tags);
            resolve_node(metric_name, &effective)
        })
        .collect()
}

/// Resolve root nodes and all groups in registration order.
///
/// Two nodes that would produce the same metric series (metric name, field
/// name and tag set) are rejected.
pub fn resolve_nodes(config: &SubscribeClientConfig) -> ListenerResult<Vec<NodeDescriptor>> {
    let mut out = Vec::with_capacity(
        config.nodes.len() + config.group.iter().map(|g| g.nodes.len()).sum::<usize>(),
    );
    for node in &config.nodes {
        out.push(resolve_node(&config.name, node)?);
    }
    for group in &config.group {
        out.extend(expand_group(group, &config.name)?);
    }

    let mut seen = HashSet::with_capacity(out.len());
    for d in &out {
        let mut tags: Vec<String> = d.tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
        tags.sort();
        let tags = tags.join(",");
        if !seen.insert((d.metric_name.as_str(), d.field_name.as_str(), tags.clone())) {
            return Err(ListenerError::ConfigurationError(format!(
                "name '{}' is duplicated (metric name '{}', tags '{tags}')",
                d.field_name, d.metric_name
            )));
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, ns: &str, ty: &str, id: &str) -> NodeSettings {
        NodeSettings {
            name: name.to_string(),
            namespace: ns.to_string(),
            identifier_type: ty.to_string(),
            identifier: id.to_string(),
            ..Default::default()
        }
    }

    fn tag(k: &str, v: &str) -> Vec<String> {
        vec![k.to_string(), v.to_string()]
    }

    fn config_error(res: ListenerResult<NodeDescriptor>) -> String {
        match res {
            Err(ListenerError::ConfigurationError(msg)) => msg,
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn resolves_valid_node() {
        let d = resolve_node("opcua", &node("goodnode", "1", "s", "the.answer")).unwrap();
        assert_eq!(d.node_id(), "ns=1;s=the.answer");
        assert_eq!(d.metric_name, "opcua");
        assert_eq!(d.field_name, "goodnode");
        assert_eq!(d.identifier_type, IdentifierType::String);
        assert_eq!(d.monitoring.queue_size, 10);
    }

    #[test]
    fn rejects_empty_name() {
        assert_eq!(
            config_error(resolve_node("opcua", &node("", "1", "i", "1"))),
            "empty node name in metric 'opcua'"
        );
    }

    #[test]
    fn rejects_bad_namespace() {
        assert_eq!(
            config_error(resolve_node("opcua", &node("a", "", "i", "1"))),
            "namespace '' is not a valid non-negative integer, node 'ns=;i=1'"
        );
        assert_eq!(
            config_error(resolve_node("opcua", &node("a", "-1", "i", "1"))),
            "namespace '-1' is not a valid non-negative integer, node 'ns=-1;i=1'"
        );
    }

    #[test]
    fn rejects_empty_identifier() {
        assert_eq!(
            config_error(resolve_node("opcua", &node("a", "1", "s", ""))),
            "empty node identifier not allowed, node 'ns=1;s='"
        );
    }

    #[test]
    fn rejects_unknown_identifier_type() {
        assert_eq!(
            config_error(resolve_node("opcua", &node("a", "1", "x", "1"))),
            "identifier_type 'x' not supported, node 'ns=1;x=1'"
        );
    }

    #[test]
    fn rejects_mismatched_identifier() {
        assert_eq!(
            config_error(resolve_node("opcua", &node("a", "1", "i", "abc"))),
            "identifier 'abc' does not match identifier_type 'i', node 'ns=1;i=abc'"
        );
        assert!(resolve_node(
            "opcua",
            &node("a", "1", "g", "72962b91-fa75-4ae6-8d28-b404dc7daf63")
        )
        .is_ok());
        assert!(resolve_node("opcua", &node("a", "1", "g", "not-a-guid")).is_err());
    }

    #[test]
    fn rejects_invalid_filter_at_resolution() {
        let mut settings = node("a", "1", "i", "1");
        settings.monitoring_params.data_change_filter =
            Some(crate::monitoring::DataChangeFilter {
                trigger: "Status".into(),
                deadband_type: "Absolute".into(),
                deadband_value: None,
            });
        assert_eq!(
            config_error(resolve_node("opcua", &settings)),
            "deadband_value was not set, node 'ns=1;i=1'"
        );
    }

    #[test]
    fn rejects_malformed_tags() {
        let mut settings = node("a", "1", "i", "1");
        settings.tags = vec![vec!["lonely".to_string()]];
        assert_eq!(
            config_error(resolve_node("opcua", &settings)),
            "tag 1 needs 2 values, has 1, node 'ns=1;i=1'"
        );
    }

    #[test]
    fn group_defaults_and_tag_override() {
        let group = NodeGroupSettings {
            name: "bar".to_string(),
            namespace: "0".to_string(),
            identifier_type: "i".to_string(),
            tags: vec![tag("tag1", "val1"), tag("tag2", "val2")],
            nodes: vec![
                NodeSettings {
                    name: "name4".to_string(),
                    identifier: "4000".to_string(),
                    tags: vec![tag("tag1", "override"), tag("tag3", "val3")],
                    ..Default::default()
                },
                NodeSettings {
                    name: "name5".to_string(),
                    namespace: "2".to_string(),
                    identifier_type: "s".to_string(),
                    identifier: "five".to_string(),
                    ..Default::default()
                },
            ],
        };

        let nodes = expand_group(&group, "opcua").unwrap();
        assert_eq!(nodes.len(), 2);

        assert_eq!(nodes[0].metric_name, "bar");
        assert_eq!(nodes[0].node_id(), "ns=0;i=4000");
        assert_eq!(
            nodes[0].tags,
            vec![
                ("tag1".to_string(), "override".to_string()),
                ("tag2".to_string(), "val2".to_string()),
                ("tag3".to_string(), "val3".to_string()),
            ]
        );

        assert_eq!(nodes[1].node_id(), "ns=2;s=five");
        assert_eq!(nodes[1].tags.len(), 2);
    }

    #[test]
    fn unnamed_group_inherits_client_name() {
        let group = NodeGroupSettings {
            namespace: "1".to_string(),
            identifier_type: "i".to_string(),
            nodes: vec![NodeSettings {
                name: "x".to_string(),
                identifier: "1".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let nodes = expand_group(&group, "plant").unwrap();
        assert_eq!(nodes[0].metric_name, "plant");
    }

    #[test]
    fn duplicate_series_are_rejected() {
        let config = SubscribeClientConfig {
            name: "opcua".to_string(),
            nodes: vec![node("a", "1", "i", "1"), node("a", "1", "i", "2")],
            ..Default::default()
        };
        let err = resolve_nodes(&config).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: name 'a' is duplicated (metric name 'opcua', tags '')"
        );
    }

    #[test]
    fn same_field_with_different_tags_is_allowed() {
        let mut first = node("a", "1", "i", "1");
        first.tags = vec![tag("line", "1")];
        let mut second = node("a", "1", "i", "2");
        second.tags = vec![tag("line", "2")];
        let config = SubscribeClientConfig {
            nodes: vec![first, second],
            ..Default::default()
        };
        assert_eq!(resolve_nodes(&config).unwrap().len(), 2);
    }
}
