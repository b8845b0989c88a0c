//! Translate a desired container into a runtime create request.
//!
//! Containers run with host networking, so every declared port must be
//! bound on the host at the same number. CPU requests become CFS shares and
//! CPU limits become a CFS quota.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::warn;

use crate::error::EngineError;
use crate::pod::{ContainerPort, ContainerSpec, Pod};
use crate::quantity::Quantity;
use crate::runtime::{
    CreateContainerRequest, RuntimeResources, CONTAINER_HASH_LABEL, CONTAINER_NAME_LABEL,
    CONTAINER_RESTART_COUNT_LABEL, POD_NAMESPACE_LABEL, POD_NAME_LABEL, POD_UID_LABEL,
};

/// Prefix shared by every container the agent creates.
pub const CONTAINER_NAME_PREFIX: &str = "k8s";

/// Network mode for every container.
pub const NETWORK_MODE: &str = "host";

const MIN_SHARES: i64 = 2;
const SHARES_PER_CPU: i64 = 1024;
const MILLI_CPU_TO_CPU: i64 = 1000;

/// CFS period in microseconds.
const QUOTA_PERIOD: i64 = 100_000;
/// Smallest quota the kernel accepts, in microseconds.
const MIN_QUOTA_PERIOD: i64 = 1000;

/// Build the create request for `container` of `pod`.
pub fn build_create_request(
    pod: &Pod,
    container: &ContainerSpec,
    restart_count: u32,
    hostname: &str,
) -> Result<CreateContainerRequest, EngineError> {
    let exposed_ports = exposed_ports(container)?;
    let resources = runtime_resources(container)?;

    let env_map: HashMap<&str, &str> = container
        .env
        .iter()
        .map(|e| (e.name.as_str(), e.value.as_str()))
        .collect();
    let entrypoint = container
        .command
        .iter()
        .map(|c| expand_env_refs(c, &env_map))
        .collect();
    let cmd = container
        .args
        .iter()
        .map(|a| expand_env_refs(a, &env_map))
        .collect();

    Ok(CreateContainerRequest {
        name: container_name(pod, container, restart_count),
        hostname: hostname.to_string(),
        image: container.image.clone(),
        entrypoint,
        cmd,
        env: container
            .env
            .iter()
            .map(|e| format!("{}={}", e.name, e.value))
            .collect(),
        labels: container_labels(pod, container, restart_count),
        exposed_ports,
        working_dir: container.working_dir.clone(),
        network_mode: NETWORK_MODE.to_string(),
        resources,
    })
}

/// `k8s_<container>_<pod>_<namespace>_<uid>_<restartCount>`
pub fn container_name(pod: &Pod, container: &ContainerSpec, restart_count: u32) -> String {
    format!(
        "{}_{}_{}_{}_{}_{}",
        CONTAINER_NAME_PREFIX, container.name, pod.name, pod.namespace, pod.uid, restart_count
    )
}

/// Labels that tie the container back to its pod.
pub fn container_labels(
    pod: &Pod,
    container: &ContainerSpec,
    restart_count: u32,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (POD_NAME_LABEL.to_string(), pod.name.clone()),
        (POD_NAMESPACE_LABEL.to_string(), pod.namespace.clone()),
        (POD_UID_LABEL.to_string(), pod.uid.to_string()),
        (CONTAINER_NAME_LABEL.to_string(), container.name.clone()),
        (
            CONTAINER_HASH_LABEL.to_string(),
            container.spec_hash().to_string(),
        ),
        (
            CONTAINER_RESTART_COUNT_LABEL.to_string(),
            restart_count.to_string(),
        ),
    ])
}

/// Validate ports and render them as `port/proto`.
pub fn exposed_ports(container: &ContainerSpec) -> Result<BTreeSet<String>, EngineError> {
    let mut exposed = BTreeSet::new();
    for port in &container.ports {
        validate_port(container, port)?;
        let proto = match port.protocol.to_ascii_uppercase().as_str() {
            "UDP" => "udp",
            "TCP" => "tcp",
            other => {
                warn!(
                    container = %container.name,
                    protocol = %other,
                    "Unknown port protocol, defaulting to TCP"
                );
                "tcp"
            }
        };
        exposed.insert(format!("{}/{}", port.container_port, proto));
    }
    Ok(exposed)
}

fn validate_port(container: &ContainerSpec, port: &ContainerPort) -> Result<(), EngineError> {
    let invalid = |reason: String| EngineError::InvalidPort {
        container: container.name.clone(),
        reason,
    };

    if port.container_port <= 0 || port.container_port > 65535 {
        return Err(invalid(format!(
            "container port {} out of range",
            port.container_port
        )));
    }
    if port.host_port == 0 {
        return Err(invalid(format!(
            "host port for container port {} must be set",
            port.container_port
        )));
    }
    if port.host_port != port.container_port {
        return Err(invalid(format!(
            "host port {} must equal container port {} under host networking",
            port.host_port, port.container_port
        )));
    }
    Ok(())
}

/// Resource settings from requests and limits.
///
/// A missing CPU request falls back to the CPU limit.
pub fn runtime_resources(container: &ContainerSpec) -> Result<RuntimeResources, EngineError> {
    let resources = &container.resources;

    let memory = match &resources.limits.memory {
        Some(q) => quantity_value(container, "memory", q, Quantity::value)?,
        None => 0,
    };

    let cpu_request = resources
        .requests
        .cpu
        .as_ref()
        .or(resources.limits.cpu.as_ref());
    let request_milli = match cpu_request {
        Some(q) => quantity_value(container, "cpu", q, Quantity::milli_value)?,
        None => 0,
    };
    let limit_milli = match &resources.limits.cpu {
        Some(q) => quantity_value(container, "cpu", q, Quantity::milli_value)?,
        None => 0,
    };
    let (cpu_quota, cpu_period) = milli_cpu_to_quota(limit_milli);

    Ok(RuntimeResources {
        memory,
        memory_swap: 0,
        cpu_shares: milli_cpu_to_shares(request_milli),
        cpu_quota,
        cpu_period,
    })
}

fn quantity_value(
    container: &ContainerSpec,
    resource: &'static str,
    quantity: &Quantity,
    read: fn(&Quantity) -> Result<i64, crate::quantity::QuantityError>,
) -> Result<i64, EngineError> {
    read(quantity).map_err(|e| EngineError::InvalidQuantity {
        container: container.name.clone(),
        resource,
        quantity: quantity.to_string(),
        reason: e.to_string(),
    })
}

/// CPU shares for a request in millicores; an unset request gets the minimum.
pub fn milli_cpu_to_shares(milli_cpu: i64) -> i64 {
    if milli_cpu <= 0 {
        return MIN_SHARES;
    }
    let shares = milli_cpu.saturating_mul(SHARES_PER_CPU) / MILLI_CPU_TO_CPU;
    shares.max(MIN_SHARES)
}

/// CFS `(quota, period)` for a limit in millicores; `(0, 0)` means unlimited.
pub fn milli_cpu_to_quota(milli_cpu: i64) -> (i64, i64) {
    if milli_cpu <= 0 {
        return (0, 0);
    }
    let quota = milli_cpu.saturating_mul(QUOTA_PERIOD) / MILLI_CPU_TO_CPU;
    (quota.max(MIN_QUOTA_PERIOD), QUOTA_PERIOD)
}

/// Expand `$(VAR)` references from `env`. `$$` produces a literal `$`;
/// references to unknown variables are left untouched.
pub fn expand_env_refs(input: &str, env: &HashMap<&str, &str>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
        } else if let Some(body) = after.strip_prefix('(') {
            match body.find(')') {
                Some(end) => {
                    let name = &body[..end];
                    match env.get(name) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push_str("$(");
                            out.push_str(name);
                            out.push(')');
                        }
                    }
                    rest = &body[end + 1..];
                }
                None => {
                    out.push_str(&rest[pos..]);
                    rest = "";
                }
            }
        } else {
            out.push('$');
            rest = after;
        }
    }

    out.push_str(rest);
    out
}
