//! Code shipping
//!
//! The running executable is streamed to the remote host over the remote shell's
//! stdin as `<decimal length>\n<payload>`. A small `sh` stub on the other side reads
//! it into a private temporary file, runs it with the agent arguments, and removes
//! it when the agent exits. Nothing stays installed on the remote host.

use sha2::Digest;
use std::path::PathBuf;

use common::error::SyncError;

/// Remote side of the bootstrap; the agent arguments follow as `"$@"`.
pub const BOOTSTRAP_STUB: &str = concat!(
    "set -e; ",
    "read -r n; ",
    "f=$(mktemp \"${TMPDIR:-/tmp}/dsync.XXXXXX\"); ",
    "trap 'rm -f \"$f\"' EXIT; ",
    "head -c \"$n\" > \"$f\"; ",
    "chmod 700 \"$f\"; ",
    "\"$f\" --unlink-self \"$@\""
);

/// Quotes `value` for a POSIX shell.
#[must_use]
pub fn shell_escape(value: &str) -> String {
    if !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:@%+,".contains(&b))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Joins `program` and `args` into a single shell command line.
#[must_use]
pub fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().map(|arg| shell_escape(arg)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Remote command line running the bootstrap stub with `args` for the agent.
#[must_use]
pub fn bootstrap_command(args: &[String]) -> String {
    let mut stub_args = vec![
        "-c".to_string(),
        BOOTSTRAP_STUB.to_string(),
        "dsync-bootstrap".to_string(),
    ];
    stub_args.extend_from_slice(args);
    command_line("sh", &stub_args)
}

/// Header preceding a payload of `length` bytes.
#[must_use]
pub fn payload_header(length: usize) -> Vec<u8> {
    format!("{length}\n").into_bytes()
}

/// Path of the executable to ship.
///
/// A shipped agent unlinks itself at start-up, but it can still re-ship its own
/// image through `/proc/self/exe` when it relays a transfer.
pub fn local_payload() -> Result<PathBuf, SyncError> {
    let exe = std::env::current_exe()
        .map_err(|error| SyncError::transport(format!("cannot locate own executable: {error}")))?;
    if exe.is_file() {
        return Ok(exe);
    }
    let proc_exe = PathBuf::from("/proc/self/exe");
    if proc_exe.exists() {
        tracing::debug!("{} is gone, shipping {}", exe.display(), proc_exe.display());
        return Ok(proc_exe);
    }
    Err(SyncError::transport(format!(
        "own executable {} is no longer available",
        exe.display()
    )))
}

/// Reads the payload and logs its identity.
pub async fn read_payload(path: &std::path::Path) -> Result<Vec<u8>, SyncError> {
    let payload = tokio::fs::read(path).await.map_err(|error| {
        SyncError::transport(format!("failed to read payload {}: {error}", path.display()))
    })?;
    tracing::info!(
        "shipping {} ({}, sha256 {})",
        path.display(),
        bytesize::ByteSize(payload.len() as u64),
        hex::encode(sha2::Sha256::digest(&payload))
    );
    Ok(payload)
}

/// Removes the running executable; used by shipped agents right after start-up.
pub fn unlink_self() -> Result<(), SyncError> {
    let exe = std::env::current_exe()?;
    match std::fs::remove_file(&exe) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn escape_leaves_plain_words_alone() {
        assert_eq!(shell_escape("--progress-time=1.5"), "--progress-time=1.5");
        assert_eq!(shell_escape("user@host:/data"), "user@host:/data");
    }

    #[test]
    fn escape_quotes_everything_else() {
        assert_eq!(shell_escape(""), "''");
        assert_eq!(shell_escape("a b"), "'a b'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
        assert_eq!(shell_escape("$HOME"), "'$HOME'");
    }

    #[test]
    fn header_is_decimal_length() {
        assert_eq!(payload_header(1234), b"1234\n".to_vec());
        assert_eq!(payload_header(0), b"0\n".to_vec());
    }

    #[test]
    fn bootstrap_command_quotes_agent_arguments() {
        let command = bootstrap_command(&["--exclude=./a b".to_string()]);
        assert!(command.starts_with("sh -c 'set -e; read -r n;"));
        assert!(command.ends_with(" dsync-bootstrap '--exclude=./a b'"));
    }

    #[tokio::test]
    async fn stub_runs_shipped_payload_with_arguments() {
        let payload = b"#!/bin/sh\necho \"args: $*\"\nread -r line\necho \"stdin: $line\"\n";
        let tmp = tempfile::tempdir().unwrap();
        let command = bootstrap_command(&["--destination-agent".to_string(), "x y".to_string()]);
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .env("TMPDIR", tmp.path())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let mut stdin = child.stdin.take().unwrap();
        stdin.write_all(&payload_header(payload.len())).await.unwrap();
        stdin.write_all(payload).await.unwrap();
        // protocol traffic after the payload reaches the agent
        stdin.write_all(b"after payload\n").await.unwrap();
        drop(stdin);
        let output = child.wait_with_output().await.unwrap();
        assert!(output.status.success());
        assert_eq!(
            String::from_utf8(output.stdout).unwrap(),
            "args: --unlink-self --destination-agent x y\nstdin: after payload\n"
        );
        // the temporary executable is gone
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn local_payload_is_executable() {
        let path = local_payload().unwrap();
        let mode = std::fs::metadata(path).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0);
    }
}
