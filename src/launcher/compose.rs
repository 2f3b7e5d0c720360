//! Launch script and host unpack script composition.

use std::sync::Arc;

use super::backend::{Backend, LaunchConfig, LaunchOptions};
use crate::error::ConfigurationError;
use crate::mount::Mount;
use crate::runner::{Job, Runner};
use crate::script::{templates, ScriptBuilder, Section};

/// Compose the script that runs `runners` on one host.
///
/// `unpack` controls whether the mounts' unpack scripts are included; a
/// host that was already unpacked skips them.
pub fn launch_script(
    runners: &[Runner],
    mounts: &[Arc<dyn Mount>],
    unpack: bool,
    config: &LaunchConfig,
) -> Result<String, ConfigurationError> {
    let options = &config.options;
    let mut builder = ScriptBuilder::new().with_log_dir(options.launch_dir.clone());

    if let Some(ref root_config) = options.root_config {
        builder.push(Section::Preamble, root_config);
    }

    builder.push(
        Section::LaunchSetup,
        format!("export REMLAUNCH_LAUNCH_DIR={}", options.launch_dir),
    );
    if let Some(ref setup) = options.setup {
        builder.push(Section::LaunchSetup, setup);
    }

    if let (Backend::Ec2(_), Some(name)) = (&config.backend, &options.instance_name) {
        builder.push(Section::InstanceTag, templates::ec2_tag(name));
    }

    if unpack {
        builder.extend(Section::Unpack, mounts.iter().filter_map(|m| m.unpack_script()));
    }
    builder.extend(Section::Transfer, mounts.iter().filter_map(|m| m.transfer_script()));

    builder.extend(Section::RunnerSetup, runners.iter().filter_map(Runner::setup_script));
    builder.extend(Section::Run, runners.iter().filter_map(Runner::run_script));
    builder.extend(Section::Post, runners.iter().filter_map(Runner::post_script));

    builder.extend(Section::SyncBack, mounts.iter().filter_map(|m| m.final_sync_script()));

    if options.terminate_after {
        let delay = options.delay.unwrap_or(0);
        let terminate = match config.backend {
            Backend::Ec2(_) => templates::ec2_terminate(delay),
            Backend::Gce(_) => templates::gce_terminate(delay),
            ref other => {
                return Err(ConfigurationError::Unsupported {
                    backend: other.label(),
                    feature: "terminate_after",
                })
            }
        };
        builder.push(Section::Terminate, terminate);
    }

    Ok(builder.render())
}

/// Compose the one-off script that prepares a persistent host.
pub fn host_unpack_script(mounts: &[Arc<dyn Mount>], options: &LaunchOptions) -> String {
    let mut builder = ScriptBuilder::new().with_log_dir(options.launch_dir.clone());
    if let Some(ref root_config) = options.root_config {
        builder.push(Section::Preamble, root_config);
    }
    builder.extend(Section::Unpack, mounts.iter().filter_map(|m| m.unpack_script()));
    if let Some(delay) = options.delay.filter(|d| *d > 0) {
        builder.push(Section::Post, format!("sleep {}", delay));
    }
    builder.render()
}

/// All jobs as one multi-document YAML stream.
pub fn jobs_yaml(jobs: &[Job]) -> Result<String, serde_yaml::Error> {
    let documents = jobs
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(documents.join("---\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::backend::{Ec2Backend, LocalBackend};
    use crate::mount::{BindMount, HostOutputMount};
    use crate::payload::Payload;
    use crate::runner::{RunnerKind, ShellRunner};

    fn built_runner(setup: &str, post: &str) -> Runner {
        let mut runner = Runner::new(RunnerKind::Shell(ShellRunner::default()))
            .unwrap()
            .with_setup(setup)
            .with_post(post);
        runner.build(&Payload::new("echo").with_arg("hi"));
        runner
    }

    fn position(script: &str, needle: &str) -> usize {
        script
            .find(needle)
            .unwrap_or_else(|| panic!("'{}' not found in:\n{}", needle, script))
    }

    #[test]
    fn test_ec2_script_orders_every_section() {
        let config = LaunchConfig::new(Backend::Ec2(Ec2Backend::new("ami-1", "t3.micro"))).with_options(
            LaunchOptions {
                root_config: Some("source /etc/profile".to_string()),
                setup: Some("echo launch-setup".to_string()),
                instance_name: Some("trial".to_string()),
                terminate_after: true,
                ..LaunchOptions::default()
            },
        );
        let output: Arc<dyn Mount> = Arc::new(HostOutputMount::new("/outputs").unwrap());
        let script = launch_script(
            &[built_runner("echo runner-setup", "echo runner-post")],
            &[output],
            true,
            &config,
        )
        .unwrap();

        let order = [
            "source /etc/profile",
            "mkdir -p ~/remlaunch-launch",
            "echo launch-setup",
            "Key=Name,Value=trial",
            "# [unpack]",
            "echo runner-setup",
            "remlaunch-entry",
            "wait",
            "echo runner-post",
            "aws ec2 terminate-instances",
        ];
        for pair in order.windows(2) {
            assert!(
                position(&script, pair[0]) < position(&script, pair[1]),
                "{} should precede {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_unpack_is_skipped_when_host_is_ready() {
        let config = LaunchConfig::new(Backend::Local(LocalBackend::default()));
        let output: Arc<dyn Mount> = Arc::new(HostOutputMount::new("/outputs").unwrap());
        let script = launch_script(&[built_runner("", "")], &[output], false, &config).unwrap();
        assert!(!script.contains("# [unpack]"));
        assert!(!script.contains("# [instance-tag]"));
    }

    #[test]
    fn test_host_unpack_script_only_unpacks() {
        let bind: Arc<dyn Mount> = Arc::new(BindMount::new("/srv", "/srv").unwrap());
        let output: Arc<dyn Mount> = Arc::new(HostOutputMount::new("/outputs").unwrap());
        let options = LaunchOptions {
            delay: Some(5),
            ..LaunchOptions::default()
        };
        let script = host_unpack_script(&[bind, output], &options);
        assert!(script.contains("# [unpack]"));
        assert!(!script.contains("# [run]"));
        assert!(script.contains("sleep 5"));
    }
}
