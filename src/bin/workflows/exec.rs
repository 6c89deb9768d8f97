use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use image_provisioner::executor::ImageConfig;
use image_provisioner::privilege::drop_process_privileges;

/// Replace this process with `command` running as the image identity.
pub(crate) fn exec(config: &Path, command: &[String]) -> Result<()> {
    let config = ImageConfig::load(config)?;
    let Some(identity) = config.user.as_ref() else {
        bail!("image config has no runtime identity; refusing to run as root");
    };
    let Some((program, args)) = command.split_first() else {
        bail!("no command given");
    };

    // Expand against the launching environment before anything changes.
    let env = config.runtime_env(|name| std::env::var(name).ok());

    drop_process_privileges(identity)
        .with_context(|| format!("dropping privileges to {}", identity))?;
    tracing::debug!(identity = %identity, program = %program, "privileges dropped");

    let mut cmd = Command::new(program);
    cmd.args(args).envs(env);
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }
    let err = cmd.exec();
    Err(err).with_context(|| format!("executing '{}'", program))
}
