//! Device identity provisioning
//!
//! A node needs a stable uuid and an API key before it can talk to the
//! backend. Missing values are created once and persisted.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::ConfigStore;
use crate::error::{AppError, Result};

#[derive(Serialize)]
struct RegisterRequest<'a> {
    uuid: &'a str,
    name: &'a str,
    location: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    api_key: String,
}

/// Identity used on every backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uuid: String,
    pub api_key: String,
}

/// Register this camera and return the issued API key
pub async fn register_device(
    client: &reqwest::Client,
    api_uri: &str,
    uuid: &str,
    name: &str,
    location: &str,
) -> Result<String> {
    let url = format!("{}api/cameras/register", api_uri);
    let response = client
        .post(&url)
        .json(&RegisterRequest {
            uuid,
            name,
            location,
        })
        .send()
        .await
        .map_err(|e| AppError::Config(format!("Registration request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(AppError::Config(format!("Registration rejected: {}", status)));
    }

    let body: RegisterResponse = response
        .json()
        .await
        .map_err(|e| AppError::Config(format!("Invalid registration response: {}", e)))?;
    Ok(body.api_key)
}

/// Make sure a uuid and API key are stored, registering when needed
pub async fn ensure_identity(store: &ConfigStore, client: &reqwest::Client) -> Result<Identity> {
    let config = store.get();
    let device = &config.device;

    let uuid = match &device.uuid {
        Some(uuid) => uuid.clone(),
        None => {
            let uuid = uuid::Uuid::new_v4().to_string();
            info!("Generated device uuid {}", uuid);
            uuid
        }
    };

    let api_key = match &device.api_key {
        Some(key) => key.clone(),
        None => {
            info!("No API key stored, registering device {}", uuid);
            register_device(
                client,
                &config.server.api_uri,
                &uuid,
                &device.name,
                &device.location,
            )
            .await?
        }
    };

    if device.uuid.as_deref() != Some(uuid.as_str())
        || device.api_key.as_deref() != Some(api_key.as_str())
    {
        let (stored_uuid, stored_key) = (uuid.clone(), api_key.clone());
        store
            .update(move |c| {
                c.device.uuid = Some(stored_uuid);
                c.device.api_key = Some(stored_key);
            })
            .await?;
    }

    Ok(Identity { uuid, api_key })
}
