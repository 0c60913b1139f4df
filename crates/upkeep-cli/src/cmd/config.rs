use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use std::path::Path;
use upkeep_core::{
    config::{Config, WarnLevel},
    paths,
};

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective configuration, defaults filled in
    Show,

    /// Report settings that would make an update cycle fail or misbehave
    Validate,
}

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show => show(root, json),
        ConfigSubcommand::Validate => validate(root, json),
    }
}

fn show(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    if json {
        print_json(&config)
    } else {
        print!("{}", serde_yaml::to_string(&config)?);
        Ok(())
    }
}

fn validate(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let findings = config.validate(root);
    let errors = findings
        .iter()
        .filter(|f| f.level == WarnLevel::Error)
        .count();

    if json {
        print_json(&serde_json::json!({ "ok": errors == 0, "warnings": findings }))?;
    } else {
        for f in &findings {
            let tag = if f.level == WarnLevel::Error {
                "error:  "
            } else {
                "warning:"
            };
            println!("{tag} {}", f.message);
        }
        match findings.len() {
            0 => println!("{} is valid.", paths::CONFIG_FILE),
            n => println!("{n} finding(s), {errors} blocking."),
        }
    }

    if errors > 0 {
        anyhow::bail!("{} has {errors} error(s); updates will not run", paths::CONFIG_FILE);
    }
    Ok(())
}
