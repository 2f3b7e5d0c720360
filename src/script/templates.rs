//! Script fragments for cloud hosts.

/// Instance metadata endpoint that starts answering 200 once a spot
/// instance is marked for termination.
pub const SPOT_TERMINATION_URL: &str =
    "http://169.254.169.254/latest/meta-data/spot/termination-time";

/// Seconds between polls of [`SPOT_TERMINATION_URL`].
pub const SPOT_POLL_SECONDS: u32 = 3;

/// Tag the current EC2 instance with `Name=name`. A no-op elsewhere.
pub fn ec2_tag(name: &str) -> String {
    format!(
        r#"if [ "`cat /sys/devices/virtual/dmi/id/bios_version 2>/dev/null`" == 1.0 ] || [[ -f /sys/hypervisor/uuid && `head -c 3 /sys/hypervisor/uuid` == ec2 ]]; then
    export REGION="$(wget -q -O - http://169.254.169.254/latest/meta-data/placement/region)"
    EC2_INSTANCE_ID="`wget -q -O - http://169.254.169.254/latest/meta-data/instance-id`"
    aws ec2 create-tags --resources $EC2_INSTANCE_ID --tags 'Key=Name,Value={name}' --region $REGION
fi"#
    )
}

fn delay_line(delay: u32) -> String {
    if delay > 0 {
        format!("sleep {}\n", delay)
    } else {
        String::new()
    }
}

/// Terminate the current EC2 instance after `delay` seconds.
pub fn ec2_terminate(delay: u32) -> String {
    format!(
        r#"{}die() {{ status=$1; shift; echo "FATAL: $*"; exit $status; }}
echo "Now terminate this instance"
export REGION="$(wget -q -O - http://169.254.169.254/latest/meta-data/placement/region)"
export EC2_INSTANCE_ID="`wget -q -O - http://169.254.169.254/latest/meta-data/instance-id || die "wget instance-id has failed: $?"`"
aws ec2 terminate-instances --instance-ids $EC2_INSTANCE_ID --region $REGION"#,
        delay_line(delay)
    )
}

/// Delete the current GCE instance after `delay` seconds.
pub fn gce_terminate(delay: u32) -> String {
    format!(
        r#"{}echo "Now terminate this instance"
export NAME=$(curl -X GET http://metadata.google.internal/computeMetadata/v1/instance/name -H 'Metadata-Flavor: Google')
export ZONE=$(curl -X GET http://metadata.google.internal/computeMetadata/v1/instance/zone -H 'Metadata-Flavor: Google')
gcloud --quiet compute instances delete $NAME --zone=$ZONE"#,
        delay_line(delay)
    )
}

/// Run `command` forever in the background, pausing `interval` seconds
/// between rounds. A failing round does not stop the loop, even when it was
/// started from a `set -e` fragment.
pub fn background_loop(label: &str, command: &str, interval: u32) -> String {
    let pause = if interval > 0 {
        format!("\n    sleep {}", interval)
    } else {
        String::new()
    };
    format!(
        "while true; do\n    set +e\n    echo \"{label}...\"\n    {command}{pause}\ndone & echo \"{label} loop started\""
    )
}

/// Poll the spot termination endpoint in the background and run `flush`
/// once when the instance is marked for termination.
///
/// Assumes a few seconds of grace between the mark and the shutdown.
pub fn spot_watcher(flush: &str) -> String {
    format!(
        r#"while true; do
    set +e
    if [ -z $(curl -Is {SPOT_TERMINATION_URL} | head -1 | grep 404 | cut -d \  -f 2) ]
    then
        logger "Running shutdown hook."
        {flush}
        break
    else
        sleep {SPOT_POLL_SECONDS}
    fi
done & echo "spot termination watcher started""#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_loops_survive_errexit() {
        assert!(background_loop("uploading", "false", 5).starts_with("while true; do\n    set +e\n"));
        assert!(spot_watcher("sync").starts_with("while true; do\n    set +e\n"));
    }

    #[test]
    fn test_terminate_delay() {
        assert!(ec2_terminate(30).starts_with("sleep 30\n"));
        assert!(!ec2_terminate(0).contains("sleep"));
        assert!(gce_terminate(0).contains("gcloud --quiet compute instances delete $NAME"));
    }

    #[test]
    fn test_ec2_tag_sets_name() {
        assert!(ec2_tag("exp-1").contains("'Key=Name,Value=exp-1'"));
    }

    #[test]
    fn test_spot_watcher_polls_and_flushes() {
        let watcher = spot_watcher("aws s3 cp --recursive /out s3://b/out");
        assert!(watcher.contains(SPOT_TERMINATION_URL));
        assert!(watcher.contains("sleep 3"));
        assert!(watcher.contains("aws s3 cp --recursive /out s3://b/out\n        break"));
        assert!(watcher.ends_with("& echo \"spot termination watcher started\""));
    }

    #[test]
    fn test_background_loop() {
        let looped = background_loop("uploading", "sync-cmd", 15);
        assert_eq!(
            looped,
            "while true; do\n    set +e\n    echo \"uploading...\"\n    sync-cmd\n    sleep 15\ndone & echo \"uploading loop started\""
        );
    }
}
