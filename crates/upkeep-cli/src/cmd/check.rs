use crate::output::{or_dash, print_json};
use anyhow::Context;
use serde::Serialize;
use std::path::Path;
use upkeep_core::{
    assets::AssetVersionComparator,
    config::Config,
    paths,
    vcs::{Divergence, GitCli, VersionOracle},
    UpkeepError,
};

#[derive(Serialize)]
struct CheckReport {
    head: Option<String>,
    divergence: Divergence,
    update_pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    assets: Option<AssetCheck>,
}

#[derive(Serialize)]
struct AssetCheck {
    declared: Option<String>,
    installed: Option<String>,
    changed: bool,
}

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let vcs = GitCli::new(root, config.source.remote.clone(), config.source.branch.clone())?;
    let oracle = VersionOracle::new(Box::new(vcs));

    let divergence = oracle.divergence().context("update check failed")?;
    let head = oracle.head().ok().map(|m| m.to_string());

    // Declared assets are read from the current checkout; after an update the
    // marker may change.
    let assets = match &config.assets {
        Some(a) => {
            let comparator =
                AssetVersionComparator::new(a.marker_file.clone(), paths::installed_assets_path(root));
            let declared = match comparator.current_declared_version(root) {
                Ok(v) => Some(v),
                Err(UpkeepError::MarkerMissing(_)) => None,
                Err(e) => return Err(e).context("failed to read declared asset version"),
            };
            let installed = comparator
                .last_installed_version()
                .context("failed to read installed asset record")?;
            let changed = declared
                .as_ref()
                .is_some_and(|d| AssetVersionComparator::has_changed(d, installed.as_ref()));
            Some(AssetCheck {
                declared: declared.map(|v| v.to_string()),
                installed: installed.map(|v| v.to_string()),
                changed,
            })
        }
        None => None,
    };

    let report = CheckReport {
        head,
        divergence,
        update_pending: divergence == Divergence::Behind,
        assets,
    };

    if json {
        return print_json(&report);
    }

    println!("head:        {}", or_dash(report.head.as_deref()));
    println!("upstream:    {}", report.divergence);
    if let Some(a) = &report.assets {
        println!("assets:      declared {} / installed {}", or_dash(a.declared.as_deref()), or_dash(a.installed.as_deref()));
    }
    match report.divergence {
        Divergence::Behind => println!("\nUpdate pending. Run `upkeep run` to apply it."),
        Divergence::Even => println!("\nUp to date."),
        Divergence::Ahead | Divergence::Diverged => {
            println!("\nLocal history differs from upstream; updates are skipped until it is reconciled.")
        }
    }
    Ok(())
}
