//! Stand-in `adb` executables built from shell scripts.

use std::fs;
use std::path::{Path, PathBuf};

/// An `adb` that reports the device offline for its first `offline_calls`
/// invocations, then prints `output`.
///
/// `kill-server` and `start-server` are appended to `<dir>/resets`; every
/// other invocation's arguments are appended to `<dir>/calls`.
#[cfg(unix)]
pub fn flaky_adb(dir: &Path, offline_calls: u32, output: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let escaped = output.replace('\'', "'\"'\"'");
    let script = format!(
        r#"#!/bin/sh
here="$(dirname "$0")"
case "$1" in
    kill-server|start-server)
        echo "$1" >> "$here/resets"
        exit 0
        ;;
esac
echo "$*" >> "$here/calls"
n=$(cat "$here/count" 2>/dev/null || echo 0)
n=$((n + 1))
echo "$n" > "$here/count"
if [ "$n" -le {offline_calls} ]; then
    echo "error: device offline" >&2
    exit 1
fi
echo '{escaped}'
"#
    );

    let path = dir.join("adb");
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// An `adb` for a whole run: `ps -A` lists one process named `server`,
/// launching `server` prints `lines` and exits, and anything else succeeds
/// silently. Every invocation's arguments are appended to `<dir>/calls`.
#[cfg(unix)]
pub fn device_adb(dir: &Path, server: &str, lines: &[&str]) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    fs::write(dir.join("server-output"), lines.join("\n") + "\n").unwrap();
    let script = format!(
        r#"#!/bin/sh
here="$(dirname "$0")"
echo "$*" >> "$here/calls"
case "$2" in
    "ps -A")
        echo "USER           PID  PPID     VSZ    RSS WCHAN            ADDR S NAME"
        echo "shell         4242  4200   12345   2345 0                   0 S {server}"
        ;;
    "{server}")
        cat "$here/server-output"
        ;;
esac
exit 0
"#
    );

    let path = dir.join("adb");
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Lines of a file the mock appends to; empty when it was never written.
pub fn recorded(dir: &Path, name: &str) -> Vec<String> {
    fs::read_to_string(dir.join(name))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}
