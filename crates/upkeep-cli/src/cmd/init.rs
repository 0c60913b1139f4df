use anyhow::Context;
use std::path::Path;
use upkeep_core::{
    config::{Config, SupervisorBackend},
    io, paths,
};

pub fn run(
    root: &Path,
    service: Option<&str>,
    user: bool,
    assets_url: Option<&str>,
    live_dir: Option<&Path>,
) -> anyhow::Result<()> {
    println!("Initializing upkeep in: {}", root.display());

    let dir = paths::upkeep_dir(root);
    io::ensure_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    if paths::config_path(root).exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
    } else {
        let unit = match service {
            Some(s) => s.to_string(),
            None => root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .context("cannot derive a service name from the root path; pass --service")?,
        };
        let mut cfg = Config::new(SupervisorBackend::Systemd { unit, user });
        if let (Some(url), Some(live)) = (assets_url, live_dir) {
            cfg = cfg.with_assets(url, live.to_path_buf());
        }
        cfg.save(root).context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
    }

    let entry = format!("{}/", paths::UPKEEP_DIR);
    if io::ignore_in_git(root, &entry).context("failed to update .gitignore")? {
        println!("  ignored: {entry} in .gitignore");
    }

    Ok(())
}
