use guest::prelude::*;
use kubewarden_policy_sdk::wapc_guest as guest;

use k8s_openapi::api::core::v1 as apicore;

extern crate kubewarden_policy_sdk as kubewarden;
use kubewarden::{
    logging, protocol_version_guest,
    request::ValidationRequest,
    settings::{SettingsValidationResponse, Validatable},
};

use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use slog::{info, o, warn, Logger};
use std::collections::HashSet;

mod settings;
use settings::Settings;

lazy_static! {
    static ref LOG_DRAIN: Logger = Logger::root(
        logging::KubewardenDrain::new(),
        o!("policy" => "volume-types-policy")
    );
}

#[no_mangle]
pub extern "C" fn wapc_init() {
    register_function("validate", validate);
    register_function("validate_settings", validate_settings);
    register_function("protocol_version", protocol_version_guest);
}


#[derive(Debug, PartialEq)]
enum PolicyResponse {
    Accept,
    Reject(String),
}


fn validate(payload: &[u8]) -> CallResult {
    let validation_request: ValidationRequest<Settings> = ValidationRequest::new(payload)?;

    let pod = match serde_json::from_value::<apicore::Pod>(validation_request.request.object) {
        Ok(pod) => pod,
        Err(_) => {
            // Not a Pod, nothing for this policy to check
            return kubewarden::accept_request();
        }
    };

    let settings = &validation_request.settings;

    match uses_denied_volume_types(&pod, settings)? {
        PolicyResponse::Accept => kubewarden::accept_request(),
        PolicyResponse::Reject(message) => {
            kubewarden::reject_request(Some(message), None, None, None)
        }
    }
}

fn validate_settings(payload: &[u8]) -> CallResult {
    evaluate_settings(payload, &LOG_DRAIN)
}

fn evaluate_settings(payload: &[u8], logger: &Logger) -> CallResult {
    info!(logger, "validating settings");

    let settings = match serde_json::from_slice::<Settings>(payload) {
        Ok(settings) => settings,
        Err(err) => return settings_rejection(err.to_string()),
    };

    match settings.validate() {
        Ok(()) => Ok(serde_json::to_vec(&SettingsValidationResponse {
            valid: true,
            message: None,
        })?),
        Err(message) => {
            warn!(logger, "rejecting settings");
            settings_rejection(message)
        }
    }
}

fn settings_rejection(message: String) -> CallResult {
    Ok(serde_json::to_vec(&SettingsValidationResponse {
        valid: false,
        message: Some(message),
    })?)
}

fn uses_denied_volume_types(pod: &apicore::Pod, settings: &Settings) -> Result<PolicyResponse> {
    let spec = match &pod.spec {
        Some(spec) => spec,
        None => return Ok(PolicyResponse::Accept),
    };

    let volumes = match &spec.volumes {
        Some(volumes) if !volumes.is_empty() => volumes,
        _ => return Ok(PolicyResponse::Accept),
    };

    if settings.allows_all_types() {
        return Ok(PolicyResponse::Accept);
    }

    let exempt = if settings.ignore_init_containers_volumes {
        init_containers_only_volumes(spec)
    } else {
        HashSet::new()
    };

    let mut denied: Vec<String> = Vec::new();
    for volume in volumes {
        if exempt.contains(volume.name.as_str()) {
            continue;
        }

        let volume_type = volume_source_type(volume)?;
        if !settings.allowed_types.contains(&volume_type) && !denied.contains(&volume_type) {
            denied.push(volume_type);
        }
    }

    if denied.is_empty() {
        return Ok(PolicyResponse::Accept);
    }

    denied.sort();
    Ok(PolicyResponse::Reject(format!(
        "These volume types are not allowed: {}",
        denied.join(", ")
    )))
}

// A Volume serializes to its name plus exactly one source member, e.g.
// {"name": "data", "emptyDir": {}}, so the source type is the only key
// other than "name".
fn volume_source_type(volume: &apicore::Volume) -> Result<String> {
    let value = serde_json::to_value(volume)?;

    value
        .as_object()
        .and_then(|fields| fields.keys().find(|key| key.as_str() != "name").cloned())
        .ok_or_else(|| anyhow!("volume {} has no source", volume.name))
}

// Volumes mounted by at least one init container and by no regular
// container.
fn init_containers_only_volumes(spec: &apicore::PodSpec) -> HashSet<&str> {
    let mounted = volume_mount_names(&spec.containers);
    let init_mounted = spec
        .init_containers
        .as_deref()
        .map(volume_mount_names)
        .unwrap_or_default();

    init_mounted.difference(&mounted).copied().collect()
}

fn volume_mount_names(containers: &[apicore::Container]) -> HashSet<&str> {
    containers
        .iter()
        .flat_map(|container| container.volume_mounts.iter().flatten())
        .map(|mount| mount.name.as_str())
        .collect()
}
