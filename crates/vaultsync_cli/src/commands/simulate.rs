//! Simulate command implementation.
//!
//! Two devices share one vault through an in-process relay. Both edit the
//! same item; the second to sync gets a conflict and resolves it with the
//! chosen strategy. Automatic sync is off so every pass is an explicit step.

use crate::device::Device;
use clap::ValueEnum;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use vaultsync_engine::{
    AesGcmGateway, Conflict, EngineConfig, Keyring, ResolutionStrategy, SyncStatus, VaultKey,
};
use vaultsync_protocol::{ClearMetadata, DeviceId, ItemType, Vault, VaultId, VaultType};
use vaultsync_relay::{RelayConfig, RelayServer};

const VAULT: &str = "personal";
const ITEM: &str = "GitHub";

/// Conflict resolution applied by the second device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Resolution {
    /// Push the phone's edit over the laptop's.
    KeepLocal,
    /// Adopt the laptop's edit.
    KeepServer,
    /// Push both edits joined together.
    Merge,
}

impl Resolution {
    fn label(self) -> &'static str {
        match self {
            Resolution::KeepLocal => "keep-local",
            Resolution::KeepServer => "keep-server",
            Resolution::Merge => "merge",
        }
    }

    fn strategy(self, conflict: &Conflict) -> ResolutionStrategy {
        match self {
            Resolution::KeepLocal => ResolutionStrategy::KeepLocal,
            Resolution::KeepServer => ResolutionStrategy::KeepServer,
            Resolution::Merge => {
                let server = conflict.server.data.as_deref().unwrap_or_default();
                let local = conflict.local.data.as_deref().unwrap_or_default();
                ResolutionStrategy::Merge(format!("{server}\n{local}"))
            }
        }
    }
}

/// One sync pass in the scenario.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Device that ran the pass.
    pub device: String,
    /// What the device did before syncing.
    pub action: String,
    /// Items pushed, pulled or removed.
    pub items_updated: u64,
    /// Unresolved conflicts after the pass.
    pub items_conflicted: u64,
    /// Failures recorded so far.
    pub errors: usize,
}

/// The conflict the second device ran into.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSummary {
    /// Conflicted item.
    pub item_id: String,
    /// Version of the local edit.
    pub local_version: u64,
    /// Version the relay held.
    pub server_version: u64,
}

impl From<&Conflict> for ConflictSummary {
    fn from(conflict: &Conflict) -> Self {
        Self {
            item_id: conflict.item_id.to_string(),
            local_version: conflict.local.version,
            server_version: conflict.server.version,
        }
    }
}

/// Outcome of a simulation run.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    /// Passes in order.
    pub steps: Vec<Step>,
    /// Conflict raised on the second device.
    pub conflict: Option<ConflictSummary>,
    /// Strategy used.
    pub resolution: String,
    /// Versions the relay accepted for the item.
    pub relay_versions: Vec<u64>,
    /// Both devices ended with the same content.
    pub converged: bool,
}

impl SimulationReport {
    fn record(&mut self, device: &Device, action: &str, status: SyncStatus) {
        info!(device = device.name, action, updated = status.items_updated, "step");
        self.steps.push(Step {
            device: device.name.to_string(),
            action: action.to_string(),
            items_updated: status.items_updated,
            items_conflicted: status.items_conflicted,
            errors: status.errors.len(),
        });
    }
}

/// Runs the simulate command.
pub fn run(
    resolution: Resolution,
    config_path: Option<&Path>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = match config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::new("http://relay.local"),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(simulate(resolution, config))?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            print_text_output(&report);
        }
    }

    Ok(())
}

/// Plays the scenario and reports what happened.
pub async fn simulate(
    resolution: Resolution,
    config: EngineConfig,
) -> Result<SimulationReport, Box<dyn std::error::Error>> {
    let relay = Arc::new(RelayServer::new(RelayConfig::new(
        b"vaultsync-simulator".to_vec(),
    )));
    let account_key = VaultKey::generate();
    let wrapper = Keyring::new(Arc::new(AesGcmGateway::new()), account_key.clone());
    let vault = Vault {
        id: VaultId::new(VAULT),
        name: "Personal".to_string(),
        vault_type: VaultType::Personal,
        encrypted_key: wrapper.wrap(&VaultKey::generate())?,
        team_id: None,
    };
    let vault_id = vault.id.clone();

    let config = config.with_auto_sync(false);
    let laptop = Device::new(
        "laptop",
        relay.clone(),
        account_key.clone(),
        &vault,
        config.clone().with_device_id(DeviceId::generate()),
    )?;
    let phone = Device::new(
        "phone",
        relay.clone(),
        account_key,
        &vault,
        config.with_device_id(DeviceId::generate()),
    )?;
    laptop.connect(&vault_id).await?;
    phone.connect(&vault_id).await?;

    let mut report = SimulationReport {
        resolution: resolution.label().to_string(),
        ..SimulationReport::default()
    };

    laptop
        .engine
        .create_item(
            &vault_id,
            ItemType::Login,
            ClearMetadata::named(ITEM),
            r#"{"username":"octo","password":"initial"}"#,
        )
        .await?;
    report.record(&laptop, "create", laptop.engine.sync_vault(&vault_id).await?);
    report.record(&phone, "pull", phone.engine.sync_vault(&vault_id).await?);

    let item_id = phone
        .engine
        .items(&vault_id)?
        .first()
        .map(|item| item.id.clone())
        .ok_or("item did not reach the phone")?;

    laptop
        .engine
        .edit_item(
            &item_id,
            ClearMetadata::named(ITEM),
            r#"{"username":"octo","password":"rotated-on-laptop"}"#,
        )
        .await?;
    phone
        .engine
        .edit_item(
            &item_id,
            ClearMetadata::named(ITEM),
            r#"{"username":"octo","password":"rotated-on-phone"}"#,
        )
        .await?;
    report.record(&laptop, "edit", laptop.engine.sync_vault(&vault_id).await?);
    report.record(&phone, "edit", phone.engine.sync_vault(&vault_id).await?);

    let conflict = phone
        .engine
        .conflict_tracker()
        .get(&item_id)
        .ok_or("expected a conflict on the phone")?;
    report.conflict = Some(ConflictSummary::from(&conflict));

    phone
        .engine
        .resolve(&item_id, resolution.strategy(&conflict))
        .await?;
    report.record(&phone, "resolve", phone.engine.sync_vault(&vault_id).await?);
    report.record(&laptop, "pull", laptop.engine.sync_vault(&vault_id).await?);

    report.relay_versions = relay.accepted_versions(&item_id);
    report.converged =
        laptop.engine.read_plaintext(&item_id)? == phone.engine.read_plaintext(&item_id)?;

    laptop.engine.disconnect().await;
    phone.engine.disconnect().await;
    Ok(report)
}

fn print_text_output(report: &SimulationReport) {
    println!("Two devices, one vault");
    for step in &report.steps {
        println!(
            "  [{:<6}] {:<8} updated {}  conflicted {}  errors {}",
            step.device, step.action, step.items_updated, step.items_conflicted, step.errors
        );
    }
    println!();
    if let Some(conflict) = &report.conflict {
        println!(
            "Conflict on {}: local v{} vs relay v{}",
            conflict.item_id, conflict.local_version, conflict.server_version
        );
    }
    println!("Resolution:     {}", report.resolution);
    let versions: Vec<String> = report.relay_versions.iter().map(u64::to_string).collect();
    println!("Relay versions: {}", versions.join(", "));
    println!(
        "Converged:      {}",
        if report.converged { "yes" } else { "no" }
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        EngineConfig::new("http://relay.test")
    }

    #[tokio::test]
    async fn keep_local_converges_on_a_third_version() {
        let report = simulate(Resolution::KeepLocal, config()).await.unwrap();
        let conflict = report.conflict.unwrap();
        assert_eq!(conflict.local_version, 2);
        assert_eq!(conflict.server_version, 2);
        assert_eq!(report.relay_versions, vec![1, 2, 3]);
        assert!(report.converged);
        assert_eq!(report.steps.len(), 6);
        assert_eq!(report.steps[3].items_conflicted, 1);
        assert_eq!(report.steps[4].items_conflicted, 0);
    }

    #[tokio::test]
    async fn keep_server_pushes_nothing() {
        let report = simulate(Resolution::KeepServer, config()).await.unwrap();
        assert_eq!(report.relay_versions, vec![1, 2]);
        assert!(report.converged);
        assert_eq!(report.resolution, "keep-server");
    }

    #[tokio::test]
    async fn merge_converges() {
        let report = simulate(Resolution::Merge, config()).await.unwrap();
        assert_eq!(report.relay_versions, vec![1, 2, 3]);
        assert!(report.converged);
    }
}
