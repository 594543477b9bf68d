// Docker engine implementation via bollard

use super::{Engine, EngineError, HelperSpec, LocalImageState};
use crate::models::{
    AnonymousVolume, COMPOSE_PROJECT_LABEL, COMPOSE_SERVICE_LABEL, ContainerSnapshot, DeviceSpec,
    HealthCheckSpec, ImageReference, NetworkAttachment, PortBinding, ResourceLimits,
    RestartPolicySpec, StackMembership,
};
use async_trait::async_trait;
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, InspectContainerOptions, RemoveContainerOptions,
    RemoveImageOptions, StartContainerOptions, StopContainerOptions, TagImageOptions,
};
use bollard::models::{
    ContainerCreateBody, ContainerInspectResponse, EndpointIpamConfig, EndpointSettings,
    HealthConfig, HostConfig, NetworkConnectRequest, NetworkingConfig, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::{API_DEFAULT_VERSION, Docker};
use futures_util::StreamExt;
use std::collections::HashMap;

pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect(socket: Option<&str>, timeout_secs: u64) -> anyhow::Result<Self> {
        let path = socket.unwrap_or("unix:///var/run/docker.sock");
        let docker = Docker::connect_with_unix(path, timeout_secs, API_DEFAULT_VERSION)?;
        Ok(Self { docker })
    }
}

fn map_err(e: bollard::errors::Error) -> EngineError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 401 | 403,
            message,
        } => EngineError::Auth(message),
        other => EngineError::Api(other.to_string()),
    }
}

#[async_trait]
impl Engine for DockerEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.docker.ping().await.map_err(map_err)?;
        Ok(())
    }

    async fn snapshot_container(&self, name: &str) -> Result<ContainerSnapshot, EngineError> {
        let resp = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(map_err)?;
        snapshot_from_inspect(&resp).map_err(|e| EngineError::Api(e.to_string()))
    }

    async fn local_image_state(&self, reference: &str) -> Result<LocalImageState, EngineError> {
        let inspect = self.docker.inspect_image(reference).await.map_err(map_err)?;
        Ok(LocalImageState {
            id: inspect.id.unwrap_or_default(),
            repo_digests: inspect.repo_digests.unwrap_or_default(),
        })
    }

    async fn remote_manifest_digest(
        &self,
        reference: &ImageReference,
    ) -> Result<String, EngineError> {
        let dist = self
            .docker
            .inspect_registry_image(&reference.canonical(), None)
            .await
            .map_err(|e| EngineError::Registry(e.to_string()))?;
        dist.descriptor
            .digest
            .filter(|d| !d.is_empty())
            .ok_or_else(|| {
                EngineError::Registry(format!("no manifest digest for {}", reference))
            })
    }

    async fn pull_image(&self, reference: &ImageReference) -> Result<(), EngineError> {
        // A pinned reference pulls by digest; the digest goes where the tag
        // normally would in the pull request.
        let version = reference
            .tag
            .clone()
            .or_else(|| reference.digest.clone())
            .unwrap_or_else(|| "latest".to_string());
        let options = CreateImageOptions {
            from_image: Some(reference.repository.clone()),
            tag: Some(version),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let info = progress.map_err(map_err)?;
            if let Some(status) = info.status {
                tracing::debug!(image = %reference, status = %status, "pull progress");
            }
        }
        Ok(())
    }

    async fn tag_image(
        &self,
        image_id: &str,
        repository: &str,
        tag: &str,
    ) -> Result<(), EngineError> {
        let options = TagImageOptions {
            repo: Some(repository.to_string()),
            tag: Some(tag.to_string()),
        };
        self.docker
            .tag_image(image_id, Some(options))
            .await
            .map_err(map_err)
    }

    async fn remove_image(&self, reference: &str, force: bool) -> Result<(), EngineError> {
        let options = RemoveImageOptions {
            force,
            noprune: false,
            platforms: None,
        };
        self.docker
            .remove_image(reference, Some(options), None)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        let options = StopContainerOptions {
            t: Some(30),
            ..Default::default()
        };
        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(map_err)
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        // v stays false: anonymous volumes are re-bound by name into the
        // replacement, they must survive the old container's removal.
        let options = RemoveContainerOptions {
            v: false,
            force: false,
            link: false,
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(map_err)
    }

    async fn create_container(
        &self,
        name: &str,
        snapshot: &ContainerSnapshot,
        with_primary_network: bool,
    ) -> Result<String, EngineError> {
        let body = body_from_snapshot(snapshot, with_primary_network);
        let options = CreateContainerOptions {
            name: Some(name.to_string()),
            platform: String::new(),
        };
        let resp = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(map_err)?;
        Ok(resp.id)
    }

    async fn connect_network(
        &self,
        container_id: &str,
        attachment: &NetworkAttachment,
    ) -> Result<(), EngineError> {
        let request = NetworkConnectRequest {
            container: container_id.to_string(),
            endpoint_config: Some(endpoint_from_attachment(attachment)),
        };
        self.docker
            .connect_network(&attachment.network_name, request)
            .await
            .map_err(map_err)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(map_err)
    }

    async fn run_helper(&self, spec: &HelperSpec) -> Result<String, EngineError> {
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            host_config: Some(HostConfig {
                binds: Some(spec.binds.clone()),
                auto_remove: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            platform: String::new(),
        };
        let created = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(map_err)?;
        self.docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
            .map_err(map_err)?;
        Ok(created.id)
    }
}

/// Build a fully-owned snapshot from an inspect response. Exposed for unit
/// tests; never holds onto the response.
pub(crate) fn snapshot_from_inspect(
    resp: &ContainerInspectResponse,
) -> anyhow::Result<ContainerSnapshot> {
    let id = resp
        .id
        .clone()
        .ok_or_else(|| anyhow::anyhow!("inspect response has no container id"))?;
    let name = resp
        .name
        .clone()
        .map(|n| n.trim_start_matches('/').to_string())
        .ok_or_else(|| anyhow::anyhow!("inspect response has no container name"))?;
    let config = resp
        .config
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("inspect response has no config"))?;
    let image_name = config
        .image
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("container {} has no image reference", name))?;
    let image = ImageReference::parse(image_name)?;
    let image_id = resp.image.clone().unwrap_or_default();

    let labels = config.labels.clone().unwrap_or_default();
    let stack = stack_membership(&labels);

    let host_config = resp.host_config.as_ref();
    let binds = host_config
        .and_then(|h| h.binds.clone())
        .unwrap_or_default();
    let network_mode = host_config.and_then(|h| h.network_mode.clone());

    let anonymous_volumes = anonymous_volumes(resp, &binds);

    let exposed_ports = config
        .exposed_ports
        .as_ref()
        .map(|m| {
            let mut ports: Vec<String> = m.clone();
            ports.sort();
            ports
        })
        .unwrap_or_default();

    let port_bindings = host_config
        .and_then(|h| h.port_bindings.as_ref())
        .map(|m| {
            m.iter()
                .map(|(port, bindings)| {
                    let bindings = bindings
                        .clone()
                        .unwrap_or_default()
                        .into_iter()
                        .map(|b| PortBinding {
                            host_ip: b.host_ip,
                            host_port: b.host_port,
                        })
                        .collect();
                    (port.clone(), bindings)
                })
                .collect()
        })
        .unwrap_or_default();

    let resources = ResourceLimits {
        memory_bytes: host_config.and_then(|h| h.memory),
        nano_cpus: host_config.and_then(|h| h.nano_cpus),
        cpu_shares: host_config.and_then(|h| h.cpu_shares),
    };

    let restart_policy = host_config
        .and_then(|h| h.restart_policy.as_ref())
        .and_then(|p| {
            let name = p.name.as_ref()?;
            Some(RestartPolicySpec {
                name: restart_policy_name(name).to_string(),
                maximum_retry_count: p.maximum_retry_count,
            })
        })
        .filter(|p| !p.name.is_empty());

    let health_check = config.healthcheck.as_ref().and_then(|h| {
        let test = h.test.clone()?;
        Some(HealthCheckSpec {
            test,
            interval_ns: h.interval,
            timeout_ns: h.timeout,
            retries: h.retries,
            start_period_ns: h.start_period,
        })
    });

    let devices = host_config
        .and_then(|h| h.devices.clone())
        .unwrap_or_default()
        .into_iter()
        .map(|d| DeviceSpec {
            path_on_host: d.path_on_host.unwrap_or_default(),
            path_in_container: d.path_in_container.unwrap_or_default(),
            cgroup_permissions: d.cgroup_permissions.unwrap_or_default(),
        })
        .collect();

    let networks = network_attachments(resp, &id, network_mode.as_deref(), stack.as_ref());

    Ok(ContainerSnapshot {
        id,
        name,
        image,
        image_id,
        entrypoint: config.entrypoint.clone(),
        cmd: config.cmd.clone(),
        env: config.env.clone().unwrap_or_default(),
        labels,
        binds,
        anonymous_volumes,
        exposed_ports,
        port_bindings,
        resources,
        restart_policy,
        health_check,
        devices,
        network_mode,
        privileged: host_config.and_then(|h| h.privileged).unwrap_or(false),
        cap_add: host_config.and_then(|h| h.cap_add.clone()).unwrap_or_default(),
        cap_drop: host_config
            .and_then(|h| h.cap_drop.clone())
            .unwrap_or_default(),
        networks,
        stack,
    })
}

fn stack_membership(labels: &HashMap<String, String>) -> Option<StackMembership> {
    let project = labels.get(COMPOSE_PROJECT_LABEL)?;
    let service = labels.get(COMPOSE_SERVICE_LABEL)?;
    Some(StackMembership {
        project: project.clone(),
        service: service.clone(),
    })
}

/// Anonymous engine-created volumes not already covered by an explicit bind.
fn anonymous_volumes(resp: &ContainerInspectResponse, binds: &[String]) -> Vec<AnonymousVolume> {
    let bound_destinations: Vec<&str> = binds
        .iter()
        .filter_map(|b| b.split(':').nth(1))
        .collect();
    resp.mounts
        .as_ref()
        .map(|mounts| {
            mounts
                .iter()
                .filter(|m| m.typ.as_deref() == Some("volume"))
                .filter_map(|m| {
                    let volume_name = m.name.clone()?;
                    let destination = m.destination.clone()?;
                    // Anonymous volume names are 64-char hex ids.
                    if volume_name.len() != 64
                        || !volume_name.chars().all(|c| c.is_ascii_hexdigit())
                    {
                        return None;
                    }
                    if bound_destinations.contains(&destination.as_str()) {
                        return None;
                    }
                    Some(AnonymousVolume {
                        volume_name,
                        destination,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Split the container's networks into one primary (applied at create time)
/// and secondaries (applied via connect calls). Host and none modes carry no
/// attachments at all.
fn network_attachments(
    resp: &ContainerInspectResponse,
    container_id: &str,
    network_mode: Option<&str>,
    stack: Option<&StackMembership>,
) -> Vec<NetworkAttachment> {
    if matches!(network_mode, Some("host") | Some("none")) {
        return vec![];
    }
    let Some(networks) = resp
        .network_settings
        .as_ref()
        .and_then(|s| s.networks.as_ref())
    else {
        return vec![];
    };

    let short_id: String = container_id.chars().take(12).collect();
    let mut names: Vec<&String> = networks.keys().collect();
    names.sort();

    // The network named by network_mode is the create-time attachment;
    // otherwise the first in sorted order, for determinism.
    let primary_name = network_mode
        .filter(|m| networks.contains_key(*m))
        .map(String::from)
        .or_else(|| names.first().map(|n| (*n).clone()));

    names
        .into_iter()
        .map(|network_name| {
            let endpoint = &networks[network_name];
            let is_primary = Some(network_name) == primary_name.as_ref();

            // Engine-assigned short-id aliases belong to the old instance.
            let mut aliases: Vec<String> = endpoint
                .aliases
                .clone()
                .unwrap_or_default()
                .into_iter()
                .filter(|a| *a != short_id)
                .collect();

            // Compose alias forms are engine-assigned and not always present
            // in inspection output; re-derive them for secondary networks.
            if !is_primary && let Some(stack) = stack {
                let compound = format!("{}-{}", stack.project, stack.service);
                for alias in [stack.service.clone(), compound] {
                    if !aliases.contains(&alias) {
                        aliases.push(alias);
                    }
                }
            }

            let ipam = endpoint.ipam_config.as_ref();
            NetworkAttachment {
                network_name: network_name.clone(),
                aliases,
                ipv4: ipam.and_then(|i| i.ipv4_address.clone()).filter(|a| !a.is_empty()),
                ipv6: ipam.and_then(|i| i.ipv6_address.clone()).filter(|a| !a.is_empty()),
                gateway_priority: endpoint.gw_priority,
                is_primary,
            }
        })
        .collect()
}

fn restart_policy_name(name: &RestartPolicyNameEnum) -> &'static str {
    match name {
        RestartPolicyNameEnum::NO => "no",
        RestartPolicyNameEnum::ALWAYS => "always",
        RestartPolicyNameEnum::UNLESS_STOPPED => "unless-stopped",
        RestartPolicyNameEnum::ON_FAILURE => "on-failure",
        RestartPolicyNameEnum::EMPTY => "",
    }
}

fn restart_policy_enum(name: &str) -> RestartPolicyNameEnum {
    match name {
        "no" => RestartPolicyNameEnum::NO,
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        _ => RestartPolicyNameEnum::EMPTY,
    }
}

pub(crate) fn endpoint_from_attachment(attachment: &NetworkAttachment) -> EndpointSettings {
    let ipam = if attachment.ipv4.is_some() || attachment.ipv6.is_some() {
        Some(EndpointIpamConfig {
            ipv4_address: attachment.ipv4.clone(),
            ipv6_address: attachment.ipv6.clone(),
            ..Default::default()
        })
    } else {
        None
    };
    EndpointSettings {
        aliases: if attachment.aliases.is_empty() {
            None
        } else {
            Some(attachment.aliases.clone())
        },
        ipam_config: ipam,
        gw_priority: attachment.gateway_priority,
        ..Default::default()
    }
}

/// Map a snapshot back into a create request. Hostname and MAC address are
/// left unset so the engine assigns fresh identity.
pub(crate) fn body_from_snapshot(
    snapshot: &ContainerSnapshot,
    with_primary_network: bool,
) -> ContainerCreateBody {
    let exposed_ports = if snapshot.exposed_ports.is_empty() {
        None
    } else {
        Some(
            snapshot
                .exposed_ports
                .iter()
                .map(|p| p.clone())
                .collect(),
        )
    };

    let port_bindings = if snapshot.port_bindings.is_empty() {
        None
    } else {
        Some(
            snapshot
                .port_bindings
                .iter()
                .map(|(port, bindings)| {
                    let mapped = bindings
                        .iter()
                        .map(|b| bollard::models::PortBinding {
                            host_ip: b.host_ip.clone(),
                            host_port: b.host_port.clone(),
                        })
                        .collect();
                    (port.clone(), Some(mapped))
                })
                .collect(),
        )
    };

    let restart_policy = snapshot.restart_policy.as_ref().map(|p| RestartPolicy {
        name: Some(restart_policy_enum(&p.name)),
        maximum_retry_count: p.maximum_retry_count,
    });

    let devices = if snapshot.devices.is_empty() {
        None
    } else {
        Some(
            snapshot
                .devices
                .iter()
                .map(|d| bollard::models::DeviceMapping {
                    path_on_host: Some(d.path_on_host.clone()),
                    path_in_container: Some(d.path_in_container.clone()),
                    cgroup_permissions: Some(d.cgroup_permissions.clone()),
                })
                .collect(),
        )
    };

    let healthcheck = snapshot.health_check.as_ref().map(|h| HealthConfig {
        test: Some(h.test.clone()),
        interval: h.interval_ns,
        timeout: h.timeout_ns,
        retries: h.retries,
        start_period: h.start_period_ns,
        ..Default::default()
    });

    let binds = snapshot.effective_binds();
    let host_config = HostConfig {
        binds: if binds.is_empty() { None } else { Some(binds) },
        port_bindings,
        memory: snapshot.resources.memory_bytes,
        nano_cpus: snapshot.resources.nano_cpus,
        cpu_shares: snapshot.resources.cpu_shares,
        restart_policy,
        devices,
        network_mode: snapshot.network_mode.clone(),
        privileged: Some(snapshot.privileged),
        cap_add: if snapshot.cap_add.is_empty() {
            None
        } else {
            Some(snapshot.cap_add.clone())
        },
        cap_drop: if snapshot.cap_drop.is_empty() {
            None
        } else {
            Some(snapshot.cap_drop.clone())
        },
        ..Default::default()
    };

    let networking_config = if with_primary_network {
        snapshot.primary_network().map(|primary| NetworkingConfig {
            endpoints_config: Some(HashMap::from([(
                primary.network_name.clone(),
                endpoint_from_attachment(primary),
            )])),
        })
    } else {
        None
    };

    ContainerCreateBody {
        image: Some(snapshot.image.canonical()),
        entrypoint: snapshot.entrypoint.clone(),
        cmd: snapshot.cmd.clone(),
        env: if snapshot.env.is_empty() {
            None
        } else {
            Some(snapshot.env.clone())
        },
        labels: if snapshot.labels.is_empty() {
            None
        } else {
            Some(snapshot.labels.clone())
        },
        exposed_ports,
        healthcheck,
        host_config: Some(host_config),
        networking_config,
        ..Default::default()
    }
}
