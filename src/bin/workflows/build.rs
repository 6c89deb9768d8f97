use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use image_provisioner::pipeline::{self, BackendKind, BuildRequest};

pub(crate) fn build(
    recipe: PathBuf,
    output: PathBuf,
    dev: Option<bool>,
    backend: BackendKind,
    stage_timeout: Option<u64>,
) -> Result<()> {
    let request = BuildRequest {
        recipe,
        output,
        dev,
        backend,
        stage_timeout: stage_timeout.map(Duration::from_secs),
    };
    let outcome = pipeline::build(&request)?;

    println!("run:     {}", outcome.manifest.run_id);
    println!("path:    {}", outcome.run_dir.display());
    println!("layer:   {}", outcome.manifest.plan_key);
    println!(
        "packages: {} (digest {})",
        outcome.manifest.packages.len(),
        outcome.manifest.package_digest
    );
    for artifact in &outcome.manifest.artifacts {
        println!("  {}  {}  {} bytes", artifact.sha256, artifact.file, artifact.size);
    }
    Ok(())
}
