//! Registry credentials and image pull secrets.

use std::collections::BTreeMap;

use base64::Engine as _;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use tracing::{debug, info};

use crate::build::DOCKER_HUB;
use crate::config::{DevspaceConfig, ImageConfig, RegistryConfig};
use crate::error::{Error, Result};
use crate::kubectl::ClusterClient;

/// Prefix of generated pull secret names.
const PULL_SECRET_PREFIX: &str = "devspace-auth-";

/// Secret type understood by the kubelet for image pulls.
const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";

/// Registry used by images without a `registry` key: Docker Hub, anonymous.
static DEFAULT_REGISTRY: RegistryConfig = RegistryConfig {
    url: None,
    auth: None,
    insecure: None,
};

/// Look up the registry an image is pushed to.
///
/// # Errors
/// Returns a configuration error if the image names a registry that is not
/// configured.
pub fn registry_for_image<'a>(
    config: &'a DevspaceConfig,
    image: &ImageConfig,
) -> Result<&'a RegistryConfig> {
    match image.registry.as_deref() {
        None => Ok(&DEFAULT_REGISTRY),
        Some(name) => config.registries.get(name).ok_or_else(|| {
            Error::config(format!(
                "Registry '{name}' of image '{}' is not configured",
                image.name
            ))
        }),
    }
}

/// Registry host used as image prefix. Empty for Docker Hub.
#[must_use]
pub fn image_prefix(registry: &RegistryConfig) -> &str {
    match registry.url.as_deref() {
        Some(DOCKER_HUB) | None => "",
        Some(url) => url,
    }
}

/// Username and password of a registry, empty when not configured.
#[must_use]
pub fn credentials(registry: &RegistryConfig) -> (String, String) {
    let auth = registry.auth.as_ref();
    (
        auth.and_then(|a| a.username.clone()).unwrap_or_default(),
        auth.and_then(|a| a.password.clone()).unwrap_or_default(),
    )
}

/// Full image reference of the last build, as deployed into the chart.
///
/// # Errors
/// Returns a configuration error if the image's registry is unknown.
pub fn image_url(config: &DevspaceConfig, image: &ImageConfig) -> Result<String> {
    let registry = registry_for_image(config, image)?;
    let prefix = image_prefix(registry);

    let mut url = if prefix.is_empty() {
        image.name.clone()
    } else {
        format!("{prefix}/{}", image.name)
    };
    if let Some(tag) = image.tag.as_deref() {
        url.push(':');
        url.push_str(tag);
    }
    Ok(url)
}

/// Name of the pull secret for a registry URL.
#[must_use]
pub fn pull_secret_name(registry_url: &str) -> String {
    let sanitized: String = registry_url
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("{PULL_SECRET_PREFIX}{}", sanitized.trim_matches('-'))
}

/// `base64(username:password)`, the `auth` field of a docker config.
#[must_use]
pub fn auth_token(username: &str, password: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"))
}

/// Docker `config.json` content granting access to one registry.
///
/// # Errors
/// Returns a JSON error if serialization fails.
pub fn docker_config_json(registry_url: &str, username: &str, password: &str) -> Result<Vec<u8>> {
    let config = serde_json::json!({
        "auths": {
            registry_url: {
                "username": username,
                "password": password,
                "auth": auth_token(username, password),
            }
        }
    });
    Ok(serde_json::to_vec(&config)?)
}

/// Create or replace the image pull secret for a registry.
///
/// # Errors
/// Returns an error if the secret cannot be created or replaced.
pub async fn create_pull_secret(
    client: &ClusterClient,
    namespace: &str,
    registry_url: &str,
    username: &str,
    password: &str,
) -> Result<String> {
    let name = pull_secret_name(registry_url);
    let mut data = BTreeMap::new();
    data.insert(
        ".dockerconfigjson".to_string(),
        ByteString(docker_config_json(registry_url, username, password)?),
    );

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some(DOCKER_CONFIG_JSON_TYPE.to_string()),
        data: Some(data),
        ..Default::default()
    };

    let secrets: Api<Secret> = Api::namespaced(client.kube_client().clone(), namespace);
    match secrets.create(&PostParams::default(), &secret).await {
        Ok(_) => {
            info!(secret = %name, namespace, "Created image pull secret");
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            debug!(secret = %name, namespace, "Pull secret exists, replacing");
            secrets.replace(&name, &PostParams::default(), &secret).await?;
            info!(secret = %name, namespace, "Updated image pull secret");
        }
        Err(e) => return Err(e.into()),
    }

    Ok(name)
}
