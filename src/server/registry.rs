use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// One entry of the server registry, as the surrounding application
/// maintains it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: String,
    #[serde(rename = "serverType")]
    pub server_type: String,
    pub host: String,
    pub port: u16,
    /// True for nodes that accept client connections.
    #[serde(default)]
    pub frontend: bool,
    #[serde(rename = "clientPort", default, skip_serializing_if = "Option::is_none")]
    pub client_port: Option<u16>,
    /// Admission limit for frontend nodes; unlimited when absent.
    #[serde(rename = "max-connections", default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u64>,
}

/// Cluster membership as one explicit value: id→info plus type→members.
///
/// Owned by the application and passed by `Arc` to the router and the
/// connector instead of living in ambient global state. The type index is
/// pruned when the last member of a type is removed.
pub struct ClusterView {
    cur: ServerInfo,
    servers: DashMap<String, ServerInfo>,
    by_type: DashMap<String, Vec<String>>,
}

impl ClusterView {
    pub fn new(cur: ServerInfo) -> Self {
        let view = ClusterView {
            cur: cur.clone(),
            servers: DashMap::new(),
            by_type: DashMap::new(),
        };
        view.add_server(cur);
        view
    }

    /// The registry entry of this process.
    pub fn cur_server(&self) -> &ServerInfo {
        &self.cur
    }

    pub fn server_id(&self) -> &str {
        &self.cur.id
    }

    pub fn server_type(&self) -> &str {
        &self.cur.server_type
    }

    pub fn add_server(&self, info: ServerInfo) {
        let mut members = self.by_type.entry(info.server_type.clone()).or_default();
        if !members.contains(&info.id) {
            members.push(info.id.clone());
        }
        drop(members);
        self.servers.insert(info.id.clone(), info);
    }

    pub fn remove_server(&self, id: &str) -> Option<ServerInfo> {
        let (_, info) = self.servers.remove(id)?;
        if let Some(mut members) = self.by_type.get_mut(&info.server_type) {
            members.retain(|m| m != id);
            let empty = members.is_empty();
            drop(members);
            if empty {
                self.by_type.remove_if(&info.server_type, |_, v| v.is_empty());
            }
        }
        Some(info)
    }

    pub fn server(&self, id: &str) -> Option<ServerInfo> {
        self.servers.get(id).map(|s| s.clone())
    }

    pub fn servers_by_type(&self, server_type: &str) -> Vec<ServerInfo> {
        self.by_type
            .get(server_type)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|id| self.server(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_type(&self, server_type: &str) -> bool {
        self.by_type.contains_key(server_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, server_type: &str) -> ServerInfo {
        ServerInfo {
            id: id.into(),
            server_type: server_type.into(),
            host: "127.0.0.1".into(),
            port: 3250,
            frontend: server_type == "connector",
            client_port: None,
            max_connections: None,
        }
    }

    #[test]
    fn tracks_members_by_type() {
        let view = ClusterView::new(info("connector-1", "connector"));
        view.add_server(info("chat-1", "chat"));
        view.add_server(info("chat-2", "chat"));

        assert_eq!(view.server_type(), "connector");
        assert_eq!(view.servers_by_type("chat").len(), 2);
        assert!(view.has_type("chat"));
    }

    #[test]
    fn removing_last_member_prunes_the_type() {
        let view = ClusterView::new(info("connector-1", "connector"));
        view.add_server(info("chat-1", "chat"));

        view.remove_server("chat-1");
        assert!(!view.has_type("chat"));
        assert!(view.servers_by_type("chat").is_empty());
    }

    #[test]
    fn max_connections_field_uses_kebab_name() {
        let json = r#"{
            "id": "connector-1",
            "serverType": "connector",
            "host": "127.0.0.1",
            "port": 3250,
            "frontend": true,
            "max-connections": 100
        }"#;
        let parsed: ServerInfo = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.max_connections, Some(100));
    }
}
