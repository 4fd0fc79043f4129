use crate::commands::Out;
use crate::db::Store;
use crate::update::{
    AssetCaches, DirAssetCaches, LocalWorker, Reloader, UpdateCoordinator, UpdateState,
};
use crate::{Config, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// What an `upgrade` command found or did.
#[derive(Debug, Clone, Serialize)]
pub struct UpgradeReport {
    pub state: UpdateState,
    pub snoozed_until: Option<DateTime<Utc>>,
    /// UI asset caches that are present, or that were purged by `apply`.
    pub ui_caches: Vec<String>,
}

/// Every CLI invocation is a fresh process, so reloading means the next command starts on the
/// new version.
struct NextRun;

impl Reloader for NextRun {
    fn reload(&self) {
        info!("The next fintrack command runs on the new version");
    }
}

fn coordinator(config: &Config) -> UpdateCoordinator {
    let store: Arc<dyn Store> = Arc::new(config.db().clone());
    UpdateCoordinator::new(
        Arc::new(LocalWorker::new()),
        Arc::new(DirAssetCaches::new(config.asset_caches())),
        Arc::new(NextRun),
        store,
        config.sync(),
    )
}

async fn ui_caches(config: &Config, coordinator: &UpdateCoordinator) -> Result<Vec<String>> {
    let names = DirAssetCaches::new(config.asset_caches()).names().await?;
    Ok(names
        .into_iter()
        .filter(|name| coordinator.is_ui_asset(name))
        .collect())
}

/// Lists the UI asset caches and the snooze, without changing anything.
pub async fn upgrade_status(config: &Config) -> Result<Out<UpgradeReport>> {
    let coordinator = coordinator(config);
    let ui_caches = ui_caches(config, &coordinator).await?;
    let snoozed_until = coordinator
        .snoozed_until()
        .await?
        .filter(|until| *until > Utc::now());
    let mut message = format!(
        "{} UI asset cache(s) in {}",
        ui_caches.len(),
        config.asset_caches().display()
    );
    if let Some(until) = snoozed_until {
        message.push_str(&format!(". Upgrades are postponed until {until}"));
    }
    Ok(Out::new(
        message,
        UpgradeReport {
            state: coordinator.state(),
            snoozed_until,
            ui_caches,
        },
    ))
}

/// Purges the UI asset caches and hands over to the new version, unless upgrades are postponed.
pub async fn upgrade_apply(config: &Config) -> Result<Out<UpgradeReport>> {
    let mut coordinator = coordinator(config);
    if !coordinator.waiting_worker_found().await? {
        let snoozed_until = coordinator.snoozed_until().await?;
        let message = match snoozed_until {
            Some(until) => format!("Upgrades are postponed until {until}"),
            None => "Nothing to upgrade".to_string(),
        };
        return Ok(Out::new(
            message,
            UpgradeReport {
                state: coordinator.state(),
                snoozed_until,
                ui_caches: Vec::new(),
            },
        ));
    }

    let purged = ui_caches(config, &coordinator).await?;
    coordinator.accept().await?;
    Ok(Out::new(
        format!("Upgraded. Purged {} UI asset cache(s)", purged.len()),
        UpgradeReport {
            state: coordinator.state(),
            snoozed_until: None,
            ui_caches: purged,
        },
    ))
}

/// Postpones upgrades for the configured snooze period.
pub async fn upgrade_defer(config: &Config) -> Result<Out<UpgradeReport>> {
    let mut coordinator = coordinator(config);
    let until = coordinator.defer().await?;
    Ok(Out::new(
        format!("Upgrades are postponed until {until}"),
        UpgradeReport {
            state: coordinator.state(),
            snoozed_until: Some(until),
            ui_caches: Vec::new(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::TestEnv;
    use crate::utils::make_dir;

    #[tokio::test]
    async fn test_apply_purges_only_ui_caches() {
        let env = TestEnv::new().await;
        let config = env.config();
        for name in ["precache-v3", "app-shell", "api-responses"] {
            make_dir(config.asset_caches().join(name)).await.unwrap();
        }

        let status = upgrade_status(&config).await.unwrap();
        assert_eq!(status.structure().unwrap().ui_caches.len(), 2);

        let out = upgrade_apply(&config).await.unwrap();
        let report = out.structure().unwrap();
        assert_eq!(report.state, UpdateState::Reloading);
        assert_eq!(report.ui_caches, vec!["app-shell", "precache-v3"]);
        assert!(out.message().starts_with("Upgraded"));
        assert!(config.asset_caches().join("api-responses").is_dir());
        assert!(!config.asset_caches().join("precache-v3").exists());
    }

    #[tokio::test]
    async fn test_deferred_upgrade_is_not_applied() {
        let env = TestEnv::new().await;
        let config = env.config();
        make_dir(config.asset_caches().join("precache-v3")).await.unwrap();

        let deferred = upgrade_defer(&config).await.unwrap();
        let until = deferred.structure().unwrap().snoozed_until.unwrap();
        assert!(until > Utc::now());

        let out = upgrade_apply(&config).await.unwrap();
        assert!(out.message().starts_with("Upgrades are postponed"));
        assert!(out.structure().unwrap().ui_caches.is_empty());
        assert!(config.asset_caches().join("precache-v3").is_dir());
        let status = upgrade_status(&config).await.unwrap();
        assert_eq!(status.structure().unwrap().snoozed_until, Some(until));
    }
}
