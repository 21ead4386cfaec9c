//! Copies user supplied pod fragments onto the subset of fields a Revision may carry.
//!
//! Every function returns a fresh value and leaves its input untouched. Containers and
//! env var sources are destructured field by field, so a new upstream field fails to
//! compile here until someone decides whether it is allowed.

use k8s_openapi::api::core::v1::{Container, EnvVar, EnvVarSource, Volume};

/// Project a container onto the allowed fields.
pub fn container(input: &Container) -> Container {
    let Container {
        args,
        command,
        env,
        env_from,
        image,
        image_pull_policy: _,
        lifecycle: _,
        liveness_probe,
        name: _,
        ports,
        readiness_probe,
        resize_policy: _,
        resources,
        restart_policy: _,
        security_context,
        startup_probe: _,
        stdin: _,
        stdin_once: _,
        termination_message_path,
        termination_message_policy,
        tty: _,
        volume_devices: _,
        volume_mounts,
        working_dir: _,
    } = input;

    Container {
        args: args.clone(),
        command: command.clone(),
        // allowed with restricted fields
        env: env.as_ref().map(|env| env.iter().map(env_var).collect()),
        env_from: env_from.clone(),
        image: image.clone(),
        liveness_probe: liveness_probe.clone(),
        ports: ports.clone(),
        readiness_probe: readiness_probe.clone(),
        resources: resources.clone(),
        security_context: security_context.clone(),
        termination_message_path: termination_message_path.clone(),
        termination_message_policy: termination_message_policy.clone(),
        volume_mounts: volume_mounts.clone(),
        ..Default::default()
    }
}

fn env_var(input: &EnvVar) -> EnvVar {
    EnvVar {
        name: input.name.clone(),
        value: input.value.clone(),
        value_from: input.value_from.as_ref().map(env_var_source),
    }
}

fn env_var_source(input: &EnvVarSource) -> EnvVarSource {
    let EnvVarSource {
        config_map_key_ref,
        field_ref: _,
        resource_field_ref: _,
        secret_key_ref,
    } = input;

    EnvVarSource {
        config_map_key_ref: config_map_key_ref.clone(),
        secret_key_ref: secret_key_ref.clone(),
        ..Default::default()
    }
}

/// Project a volume onto its name and the allowed sources (secrets and config maps).
pub fn volume(input: &Volume) -> Volume {
    Volume {
        name: input.name.clone(),
        secret: input.secret.clone(),
        config_map: input.config_map.clone(),
        ..Default::default()
    }
}
