use crate::data_transfer::models::{TableLocator, TransferJobSpec, TransferRequest};
use crate::db_types::ConnectionConfig;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AccountCredentials {
    pub owner: String,
    pub username: String,
    pub password: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InstanceConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub owner: String,
    #[serde(default)]
    pub shared: bool,
    #[serde(rename = "sslMode", default)]
    pub ssl_mode: Option<String>,
    #[serde(default)]
    pub accounts: Vec<AccountCredentials>,
}

/// Supplies database credentials for a user on an instance.
pub trait AccountResolver: Send + Sync {
    fn account_for_user(
        &self,
        instance: &InstanceConfig,
        user: &str,
    ) -> Result<AccountCredentials, String>;
}

/// Instances and accounts listed under `instances` in the config file.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct InstanceDirectory {
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

impl InstanceDirectory {
    pub fn from_json(contents: &str) -> Result<Self, String> {
        serde_json::from_str(contents).map_err(|e| format!("Invalid instance directory: {}", e))
    }

    pub fn instance(&self, name: &str) -> Result<&InstanceConfig, String> {
        let normalized = name.trim();
        if normalized.is_empty() {
            return Err("instance name is required".to_string());
        }
        self.instances
            .iter()
            .find(|instance| instance.name.trim() == normalized)
            .ok_or_else(|| format!("Instance '{}' not found", normalized))
    }
}

impl AccountResolver for InstanceDirectory {
    /// Shared instances hand out the owner's account to every user;
    /// otherwise the user needs an account of their own.
    fn account_for_user(
        &self,
        instance: &InstanceConfig,
        user: &str,
    ) -> Result<AccountCredentials, String> {
        let account_owner = if instance.shared {
            instance.owner.as_str()
        } else {
            user.trim()
        };
        instance
            .accounts
            .iter()
            .find(|account| account.owner == account_owner)
            .cloned()
            .ok_or_else(|| {
                format!(
                    "User '{}' has no account on instance '{}'",
                    user.trim(),
                    instance.name
                )
            })
    }
}

pub fn resolve_connection(
    directory: &InstanceDirectory,
    resolver: &dyn AccountResolver,
    locator: &TableLocator,
    user: &str,
) -> Result<ConnectionConfig, String> {
    let instance = directory.instance(&locator.instance)?;
    let account = resolver.account_for_user(instance, user)?;
    Ok(ConnectionConfig {
        host: instance.host.clone(),
        port: instance.port,
        username: account.username,
        password: account.password,
        database: Some(locator.database.trim().to_string()).filter(|db| !db.is_empty()),
        ssl_mode: instance.ssl_mode.clone(),
    })
}

pub fn resolve_request(
    directory: &InstanceDirectory,
    resolver: &dyn AccountResolver,
    job: &TransferJobSpec,
    user: &str,
) -> Result<TransferRequest, String> {
    Ok(TransferRequest {
        source: job.source.table_ref(),
        source_connection: resolve_connection(directory, resolver, &job.source, user)?,
        destination: job.destination.table_ref(),
        destination_connection: resolve_connection(directory, resolver, &job.destination, user)?,
        options: job.options.clone(),
    })
}
