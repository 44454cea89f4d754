//! Device command errors.

use std::time::Duration;

/// Stderr fragments adb prints when the bridge lost the device.
///
/// Either the literal offline message, or a "device ... not found" pair
/// (`error: device 'emulator-5554' not found`).
pub fn is_offline_output(stderr: &str) -> bool {
    stderr.contains("error: device offline")
        || (stderr.contains("error: device") && stderr.contains("not found"))
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("`{command}` failed ({})", describe_exit(*exit_code))]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("device offline: `{command}` gave up after {attempts} attempt(s)")]
    Offline { command: String, attempts: u32 },

    #[error("`{command}` timed out after {}s", timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("failed to run `{command}`")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl DeviceError {
    pub fn is_offline(&self) -> bool {
        matches!(self, DeviceError::Offline { .. })
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "killed by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("error: device offline", true)]
    #[case("error: device 'emulator-5554' not found", true)]
    #[case("adb: error: device not found\n", true)]
    #[case("error: closed", false)]
    #[case("error: no devices/emulators found", false)]
    #[case("", false)]
    fn test_offline_detection(#[case] stderr: &str, #[case] expected: bool) {
        assert_eq!(is_offline_output(stderr), expected);
    }

    #[test]
    fn test_display() {
        let err = DeviceError::CommandFailed {
            command: "adb shell ls".into(),
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "boom".into(),
        };
        assert_eq!(err.to_string(), "`adb shell ls` failed (exit code 1)");

        let err = DeviceError::Offline {
            command: "adb pull /x".into(),
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "device offline: `adb pull /x` gave up after 3 attempt(s)"
        );
        assert!(err.is_offline());
    }
}
