// Container snapshot models: a flat, fully-owned capture taken before any
// destructive step. The engine's own container object is invalid the instant
// it is removed, so nothing here borrows from an inspect response.

use crate::models::image::ImageReference;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

/// One network the container is attached to.
///
/// Exactly one attachment is primary (none for host/none network modes): the
/// primary is supplied at container-creation time, all others are applied by
/// explicit post-creation connect calls before start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachment {
    pub network_name: String,
    pub aliases: Vec<String>,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub gateway_priority: Option<i64>,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortBinding {
    pub host_ip: Option<String>,
    pub host_port: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
    pub cpu_shares: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartPolicySpec {
    pub name: String,
    pub maximum_retry_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    pub test: Vec<String>,
    pub interval_ns: Option<i64>,
    pub timeout_ns: Option<i64>,
    pub retries: Option<i64>,
    pub start_period_ns: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    pub path_on_host: String,
    pub path_in_container: String,
    pub cgroup_permissions: String,
}

/// An unnamed volume the engine created for the container. Preserved by
/// volume name during recreation so its data is not orphaned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnonymousVolume {
    pub volume_name: String,
    pub destination: String,
}

/// Compose membership derived from the container's labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackMembership {
    pub project: String,
    pub service: String,
}

/// Immutable capture of one running container at inspection time.
///
/// Host identity fields (hostname, MAC address) are cleared at build time so
/// a recreated container is assigned fresh identity rather than inheriting
/// the old one; they are deliberately absent from this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSnapshot {
    pub id: String,
    pub name: String,
    pub image: ImageReference,
    pub image_id: String,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub binds: Vec<String>,
    pub anonymous_volumes: Vec<AnonymousVolume>,
    pub exposed_ports: Vec<String>,
    pub port_bindings: HashMap<String, Vec<PortBinding>>,
    pub resources: ResourceLimits,
    pub restart_policy: Option<RestartPolicySpec>,
    pub health_check: Option<HealthCheckSpec>,
    pub devices: Vec<DeviceSpec>,
    pub network_mode: Option<String>,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub networks: Vec<NetworkAttachment>,
    pub stack: Option<StackMembership>,
}

impl ContainerSnapshot {
    pub fn primary_network(&self) -> Option<&NetworkAttachment> {
        self.networks.iter().find(|n| n.is_primary)
    }

    pub fn secondary_networks(&self) -> impl Iterator<Item = &NetworkAttachment> {
        self.networks.iter().filter(|n| !n.is_primary)
    }

    /// Bind strings plus anonymous-volume mappings, the full `binds` list
    /// handed to the engine at create time.
    pub fn effective_binds(&self) -> Vec<String> {
        let mut binds = self.binds.clone();
        for vol in &self.anonymous_volumes {
            binds.push(format!("{}:{}", vol.volume_name, vol.destination));
        }
        binds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(name: &str, primary: bool) -> NetworkAttachment {
        NetworkAttachment {
            network_name: name.to_string(),
            aliases: vec![],
            ipv4: None,
            ipv6: None,
            gateway_priority: None,
            is_primary: primary,
        }
    }

    #[test]
    fn primary_and_secondary_split() {
        let snap = ContainerSnapshot {
            id: "abc".into(),
            name: "web".into(),
            image: ImageReference::parse("app:1.0").unwrap(),
            image_id: "sha256:aaa".into(),
            entrypoint: None,
            cmd: None,
            env: vec![],
            labels: HashMap::new(),
            binds: vec!["/data:/data".into()],
            anonymous_volumes: vec![AnonymousVolume {
                volume_name: "0123abcd".into(),
                destination: "/var/lib/app".into(),
            }],
            exposed_ports: vec![],
            port_bindings: HashMap::new(),
            resources: ResourceLimits::default(),
            restart_policy: None,
            health_check: None,
            devices: vec![],
            network_mode: None,
            privileged: false,
            cap_add: vec![],
            cap_drop: vec![],
            networks: vec![attachment("frontend", true), attachment("backend", false)],
            stack: None,
        };
        assert_eq!(snap.primary_network().unwrap().network_name, "frontend");
        let secondary: Vec<_> = snap.secondary_networks().collect();
        assert_eq!(secondary.len(), 1);
        assert_eq!(secondary[0].network_name, "backend");
        assert_eq!(
            snap.effective_binds(),
            vec!["/data:/data".to_string(), "0123abcd:/var/lib/app".to_string()]
        );
    }

    #[test]
    fn network_attachment_serializes_camel_case() {
        let a = NetworkAttachment {
            network_name: "backend".into(),
            aliases: vec!["api".into()],
            ipv4: Some("172.20.0.5".into()),
            ipv6: None,
            gateway_priority: Some(10),
            is_primary: false,
        };
        let json = serde_json::to_string(&a).unwrap();
        assert!(json.contains("\"networkName\""));
        assert!(json.contains("\"gatewayPriority\""));
        let back: NetworkAttachment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
    }
}
