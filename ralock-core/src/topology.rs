//! Static cluster membership: which nodes exist and where they listen.
//!
//! Every node must be started with the same table. It is never modified
//! after startup.

use crate::error::TopologyError;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Where a node's listener can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TopologyError::InvalidAddress(s.to_string());
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }
}

impl Serialize for PeerAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// NodeId -> listening address, sorted by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, PeerAddress>", into = "BTreeMap<String, PeerAddress>")]
pub struct Topology {
    nodes: BTreeMap<NodeId, PeerAddress>,
}

impl Topology {
    pub fn new(
        entries: impl IntoIterator<Item = (NodeId, PeerAddress)>,
    ) -> Result<Self, TopologyError> {
        let mut nodes = BTreeMap::new();
        for (id, address) in entries {
            if nodes.insert(id, address).is_some() {
                return Err(TopologyError::DuplicateNode(id));
            }
        }
        if nodes.is_empty() {
            return Err(TopologyError::Empty);
        }
        Ok(Self { nodes })
    }

    /// The four-node layout used by the reference deployment:
    /// `node1:5001` through `node4:5004`.
    pub fn default_cluster() -> Self {
        let nodes = (1..=4u32)
            .filter_map(|i| {
                let id = NodeId::new(i)?;
                Some((id, PeerAddress::new(format!("node{i}"), 5000 + i as u16)))
            })
            .collect();
        Self { nodes }
    }

    /// Parses `1=node1:5001,2=node2:5002`.
    pub fn parse_list(list: &str) -> Result<Self, TopologyError> {
        let entries = list
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(parse_entry)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(entries)
    }

    /// Reads a JSON object of `{"<id>": "<host>:<port>"}`.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, TopologyError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn get(&self, id: NodeId) -> Option<&PeerAddress> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Grants a node must collect before entering the critical section.
    pub fn num_peers(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Every node except `id`, ascending.
    pub fn peers_of(&self, id: NodeId) -> Result<Vec<NodeId>, TopologyError> {
        if !self.contains(id) {
            return Err(TopologyError::UnknownNode(id));
        }
        Ok(self.node_ids().filter(|&other| other != id).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &PeerAddress)> {
        self.nodes.iter().map(|(&id, address)| (id, address))
    }
}

impl TryFrom<BTreeMap<String, PeerAddress>> for Topology {
    type Error = TopologyError;

    fn try_from(raw: BTreeMap<String, PeerAddress>) -> Result<Self, Self::Error> {
        let entries = raw
            .into_iter()
            .map(|(id, address)| Ok((parse_node_id(&id)?, address)))
            .collect::<Result<Vec<_>, TopologyError>>()?;
        Self::new(entries)
    }
}

impl From<Topology> for BTreeMap<String, PeerAddress> {
    fn from(topology: Topology) -> Self {
        topology
            .nodes
            .into_iter()
            .map(|(id, address)| (id.to_string(), address))
            .collect()
    }
}

pub fn parse_node_id(raw: &str) -> Result<NodeId, TopologyError> {
    raw.trim()
        .parse::<u32>()
        .ok()
        .and_then(NodeId::new)
        .ok_or_else(|| TopologyError::InvalidNodeId(raw.to_string()))
}

fn parse_entry(entry: &str) -> Result<(NodeId, PeerAddress), TopologyError> {
    let (id, address) = entry
        .split_once('=')
        .ok_or_else(|| TopologyError::InvalidEntry(entry.to_string()))?;
    Ok((parse_node_id(id)?, address.parse()?))
}
