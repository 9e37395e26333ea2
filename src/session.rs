//! Identity resolution and non-interactive login.
//!
//! The active identity is read from the first line of `keybase status`,
//! which looks like `Username: alice`. When that fails and paper-key
//! credentials are configured, the session is reset with `logout -f`
//! followed by `oneshot --username U --paperkey K`.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::config::{OneshotOptions, RunOptions};
use crate::error::{BotError, Result};
use crate::ipc::{read_bounded_line, reap, run_checked};

/// Grace period for the `status` process after its first line was read.
const STATUS_REAP_GRACE: Duration = Duration::from_secs(1);

/// Resolve the identity the local client is logged in as.
///
/// # Errors
///
/// [`BotError::AuthTimeout`] if `status` produces no line within
/// `opts.auth_timeout`; [`BotError::Auth`] if its output is not of the form
/// `<label> <username>`.
pub async fn resolve_identity(opts: &RunOptions) -> Result<String> {
    let args = ["status"];
    let label = opts.describe(&args);
    let mut child = opts
        .command(&args)
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| BotError::spawn(&opts.program().display().to_string(), &opts.command_args(&args), e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BotError::Auth(format!("no stdout from {}", label)))?;
    let mut reader = BufReader::new(stdout);

    let first = tokio::time::timeout(opts.auth_timeout, read_bounded_line(&mut reader)).await;
    // Closing our end lets a chatty `status` exit on its own.
    drop(reader);

    let line = match first {
        Ok(Ok(line)) => line,
        Ok(Err(BotError::Disconnected)) => {
            settle(&mut child, &label).await;
            return Err(BotError::Auth("unable to find Keybase username".to_string()));
        }
        Ok(Err(e)) => {
            settle(&mut child, &label).await;
            return Err(e);
        }
        Err(_) => {
            warn!("{} did not answer within {:?}", label, opts.auth_timeout);
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(BotError::AuthTimeout(opts.auth_timeout));
        }
    };
    settle(&mut child, &label).await;

    parse_status_line(&line)
}

/// Resolve the identity, falling back to a oneshot login when configured.
pub async fn authenticate(opts: &RunOptions) -> Result<String> {
    match resolve_identity(opts).await {
        Ok(username) => {
            debug!("Resolved identity {}", username);
            Ok(username)
        }
        Err(e) => match &opts.oneshot {
            Some(creds) => {
                warn!("Identity resolution failed ({}), trying oneshot login", e);
                oneshot_login(opts, creds).await?;
                Ok(creds.username.clone())
            }
            None => Err(e),
        },
    }
}

/// Replace whatever session is active with a paper-key session.
pub async fn oneshot_login(opts: &RunOptions, creds: &OneshotOptions) -> Result<()> {
    run_checked(opts, &["logout", "-f"]).await?;
    run_checked(
        opts,
        &[
            "oneshot",
            "--username",
            creds.username.as_str(),
            "--paperkey",
            creds.paperkey.as_str(),
        ],
    )
    .await
    .map_err(|e| BotError::Auth(format!("oneshot login as {} failed: {}", creds.username, e)))?;
    info!("Logged in as {} with oneshot", creds.username);
    Ok(())
}

/// Launch `keybase service` in the background and return its handle.
pub fn start_service(opts: &RunOptions) -> Result<Child> {
    let args = ["service"];
    let child = opts
        .command(&args)
        .spawn()
        .map_err(|e| BotError::spawn(&opts.program().display().to_string(), &opts.command_args(&args), e))?;
    info!("Started {} (pid {:?})", opts.describe(&args), child.id());
    Ok(child)
}

async fn settle(child: &mut Child, label: &str) {
    if let Err(e) = reap(child, label, STATUS_REAP_GRACE).await {
        debug!("Failed to reap {}: {}", label, e);
    }
}

/// Extract the username from `Username: alice`.
fn parse_status_line(line: &str) -> Result<String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        [_, username] => Ok((*username).to_string()),
        _ => Err(BotError::Auth(format!(
            "invalid Keybase username output: {:?}",
            line
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status_line("Username:      alice").unwrap(), "alice");
        assert_eq!(parse_status_line("Username: bob\t").unwrap(), "bob");
    }

    #[test]
    fn test_parse_status_line_rejects_other_shapes() {
        for line in ["", "Username:", "Logged in: no", "a b c"] {
            let err = parse_status_line(line).unwrap_err();
            assert!(matches!(err, BotError::Auth(_)), "line {:?}", line);
        }
    }

    #[cfg(unix)]
    mod with_fake_binary {
        use super::super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::{Path, PathBuf};

        /// Write an executable shell script standing in for `keybase`.
        fn fake_keybase(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("keybase");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        #[tokio::test]
        async fn test_resolve_identity_reads_first_line() {
            let dir = tempfile::tempdir().unwrap();
            let bin = fake_keybase(
                dir.path(),
                r#"echo "Username:    alice"; echo "Logged in:   yes""#,
            );
            let opts = RunOptions::new().with_location(bin);
            assert_eq!(resolve_identity(&opts).await.unwrap(), "alice");
        }

        #[tokio::test]
        async fn test_resolve_identity_times_out() {
            let dir = tempfile::tempdir().unwrap();
            let bin = fake_keybase(dir.path(), "sleep 30");
            let opts = RunOptions::new()
                .with_location(bin)
                .with_auth_timeout(Duration::from_millis(200));
            let err = resolve_identity(&opts).await.unwrap_err();
            assert!(matches!(err, BotError::AuthTimeout(_)));
        }

        #[tokio::test]
        async fn test_missing_binary_is_spawn_error() {
            let dir = tempfile::tempdir().unwrap();
            let opts = RunOptions::new().with_location(dir.path().join("nope"));
            let err = resolve_identity(&opts).await.unwrap_err();
            assert!(matches!(err, BotError::Spawn { .. }));
        }

        #[tokio::test]
        async fn test_authenticate_without_credentials_propagates() {
            let dir = tempfile::tempdir().unwrap();
            let bin = fake_keybase(dir.path(), "exit 1");
            let opts = RunOptions::new().with_location(bin);
            let err = authenticate(&opts).await.unwrap_err();
            assert!(matches!(err, BotError::Auth(_)));
        }

        #[tokio::test]
        async fn test_authenticate_falls_back_to_oneshot() {
            let dir = tempfile::tempdir().unwrap();
            let log = dir.path().join("calls.log");
            let bin = fake_keybase(
                dir.path(),
                &format!(
                    r#"echo "$@" >> {log}
case "$1" in
  status) exit 1 ;;
  *) exit 0 ;;
esac"#,
                    log = log.display()
                ),
            );
            let opts = RunOptions::new()
                .with_location(bin)
                .with_oneshot(OneshotOptions::new("botuser", "paper key words"));

            assert_eq!(authenticate(&opts).await.unwrap(), "botuser");

            let calls = std::fs::read_to_string(&log).unwrap();
            let calls: Vec<&str> = calls.lines().collect();
            assert_eq!(
                calls,
                vec![
                    "status",
                    "logout -f",
                    "oneshot --username botuser --paperkey paper key words",
                ]
            );
        }

        #[tokio::test]
        async fn test_failed_oneshot_is_auth_error() {
            let dir = tempfile::tempdir().unwrap();
            let bin = fake_keybase(
                dir.path(),
                r#"case "$1" in
  oneshot) exit 2 ;;
  logout) exit 0 ;;
  *) exit 1 ;;
esac"#,
            );
            let opts = RunOptions::new()
                .with_location(bin)
                .with_oneshot(OneshotOptions::new("botuser", "words"));
            let err = authenticate(&opts).await.unwrap_err();
            assert!(matches!(err, BotError::Auth(_)));
        }
    }
}
