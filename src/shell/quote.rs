//! Shell quoting helpers.

/// Quote `s` as a single bash word.
///
/// Plain words made of safe characters pass through untouched, everything
/// else is wrapped in single quotes with embedded quotes spliced as `'\''`.
pub fn quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | ',' | '@' | '+' | '%' | '~')
        });
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Shell variable holding the last nonzero status seen by [`wait_all`].
pub const RUN_STATUS_VAR: &str = "run_status";

/// Background every command and wait for all of them.
///
/// A single command is returned as-is so its exit code is the caller's.
pub fn join_background(commands: &[String]) -> String {
    match commands {
        [] => String::new(),
        [only] => only.clone(),
        many => wait_all(many),
    }
}

/// Background each command, then wait on each one by pid.
///
/// A bare `wait` would also wait on the `tee`s behind the launch script's
/// process substitutions, which only exit once the script does. Commands
/// spanning lines or joined with `;` are grouped in braces so the whole
/// group is backgrounded. The barrier exits with the last nonzero status of
/// the commands, also left in [`RUN_STATUS_VAR`].
pub fn wait_all(commands: &[String]) -> String {
    let mut joined = String::from("pids=()\n");
    for command in commands {
        if command.contains('\n') || command.contains(';') {
            joined.push_str(&format!("{{\n{}\n}} &\n", command));
        } else {
            joined.push_str(&format!("{} &\n", command));
        }
        joined.push_str("pids+=($!)\n");
    }
    joined.push_str(&format!(
        "{RUN_STATUS_VAR}=0\nfor pid in \"${{pids[@]}}\"; do wait \"$pid\" || {RUN_STATUS_VAR}=$?; done\n(exit ${RUN_STATUS_VAR})"
    ));
    joined
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_passes_safe_words() {
        assert_eq!(quote("/tmp/code-1.tar"), "/tmp/code-1.tar");
        assert_eq!(quote("KEY=value"), "KEY=value");
    }

    #[test]
    fn test_quote_wraps_and_escapes() {
        assert_eq!(quote(""), "''");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn test_join_background() {
        assert_eq!(join_background(&[]), "");
        assert_eq!(join_background(&["a".to_string()]), "a");
        let joined = join_background(&["a".to_string(), "b".to_string()]);
        assert!(joined.starts_with("pids=()\na &\npids+=($!)\nb &\npids+=($!)\n"));
        assert!(joined.contains("do wait \"$pid\" || run_status=$?; done"));
        assert!(joined.ends_with("(exit $run_status)"));
        assert!(!joined.contains("\nwait\n"));
    }

    #[test]
    fn test_wait_all_groups_compound_commands() {
        let joined = wait_all(&["cd /x\nrun-a".to_string(), "a; b".to_string(), "run-b".to_string()]);
        assert!(joined.contains("{\ncd /x\nrun-a\n} &\npids+=($!)\n"));
        assert!(joined.contains("{\na; b\n} &\npids+=($!)\n"));
        assert!(joined.contains("run-b &\npids+=($!)\n"));
    }

    fn bash(script: &str) -> std::process::Output {
        std::process::Command::new("bash").arg("-c").arg(script).output().unwrap()
    }

    #[test]
    fn test_wait_all_keeps_nonzero_status() {
        let script = wait_all(&["exit 3".to_string(), "true".to_string()]);
        assert_eq!(bash(&script).status.code(), Some(3));

        let script = wait_all(&["true".to_string(), "sleep 0.1".to_string()]);
        assert_eq!(bash(&script).status.code(), Some(0));
    }

    #[test]
    fn test_wait_all_ignores_process_substitutions() {
        let script = format!(
            "{{\n{}\necho after-barrier\n}} > >(cat) 2> >(cat >&2)",
            wait_all(&["echo one".to_string(), "echo two".to_string()])
        );
        let mut child = std::process::Command::new("bash")
            .arg("-c")
            .arg(&script)
            .stdout(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while child.try_wait().unwrap().is_none() {
            if std::time::Instant::now() > deadline {
                child.kill().unwrap();
                panic!("barrier waited on the process substitutions");
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        let output = child.wait_with_output().unwrap();
        assert!(String::from_utf8_lossy(&output.stdout).contains("after-barrier"));
    }
}
