use std::path::Path;

use anyhow::{Context, Result};
use image_provisioner::pipeline;
use image_provisioner::stage_runs::{latest_successful_run_id, load_runs_metadata};
use image_provisioner::verify::audit;

pub(crate) fn plan(recipe: &Path, dev: Option<bool>) -> Result<()> {
    let prepared = pipeline::prepare(recipe, dev)?;
    let resolution = &prepared.resolution;

    println!(
        "image {} (DEV={})",
        prepared.recipe.name, resolution.flags.dev
    );
    println!("  install:   {}", join_keys(&resolution.install));
    println!("  toolchain: {}", join_keys(&resolution.toolchain));
    println!("  excluded:  {}", join_keys(&resolution.excluded));
    println!();
    for (stage, key) in prepared.plan.iter() {
        println!("{}  {}", &key[..12], stage);
    }
    Ok(())
}

pub(crate) fn verify(rootfs: &Path, recipe: &Path, dev: Option<bool>) -> Result<()> {
    let prepared = pipeline::prepare(recipe, dev)?;
    let report = audit(rootfs, &prepared.resolution, prepared.plan.identity())
        .with_context(|| format!("auditing rootfs '{}'", rootfs.display()))?;

    println!("packages: {}", report.installed.len());
    println!("digest:   {}", report.digest);
    for violation in &report.violations {
        println!("  violation: {}", violation);
    }
    report.ensure_clean()?;
    Ok(())
}

pub(crate) fn list_runs(output: &Path) -> Result<()> {
    let runs = load_runs_metadata(output)
        .with_context(|| format!("listing runs under '{}'", output.display()))?;
    if runs.is_empty() {
        println!("no runs under {}", output.display());
        return Ok(());
    }
    let latest = latest_successful_run_id(output)?;
    for run in runs {
        let marker = if latest.as_deref() == Some(run.run_id.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "{} {}  {:8}  {}  {}  {}",
            marker,
            run.run_id,
            run.status,
            run.created_at_utc,
            run.image.as_deref().unwrap_or("-"),
            run.package_digest.as_deref().map_or("-", |d| &d[..d.len().min(12)]),
        );
    }
    Ok(())
}

fn join_keys(packages: &[image_provisioner::Package]) -> String {
    if packages.is_empty() {
        return "-".to_string();
    }
    packages
        .iter()
        .map(|p| p.key())
        .collect::<Vec<_>>()
        .join(", ")
}
