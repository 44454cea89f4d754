//! Status lines printed by the trace server.

use std::sync::LazyLock;

use regex::Regex;

/// One parsed server line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusLine {
    /// `Server with uid <N>`
    ServerReady { uid: u32 },
    /// `[Socket <id>] Connection with pid <pid> from Start()`
    Connected { socket: u32, pid: u32 },
    /// `[Socket <id>] Selected prefix: <prefix>`
    PrefixSelected { socket: u32, prefix: String },
    /// `[Socket <id>] File released: <fname>`
    FileReleased { socket: u32, file: String },
    /// `[Socket <id>] Connection closed, prefix=<prefix>`
    Closed { socket: u32, prefix: String },
    /// Anything else
    Informational,
}

impl StatusLine {
    /// Name used in logs and the line journal.
    pub fn kind(&self) -> &'static str {
        match self {
            StatusLine::ServerReady { .. } => "server-ready",
            StatusLine::Connected { .. } => "connected",
            StatusLine::PrefixSelected { .. } => "prefix-selected",
            StatusLine::FileReleased { .. } => "file-released",
            StatusLine::Closed { .. } => "closed",
            StatusLine::Informational => "informational",
        }
    }
}

type Matcher = fn(&regex::Captures<'_>) -> Option<StatusLine>;

/// Tried in order; the first match wins.
static MATCHERS: LazyLock<Vec<(Regex, Matcher)>> = LazyLock::new(|| {
    let rules: [(&str, Matcher); 5] = [
        (r"^Server with uid (\d+)", |c| {
            Some(StatusLine::ServerReady {
                uid: c[1].parse().ok()?,
            })
        }),
        (
            r"^\[Socket (\d+)\] Connection with pid (\d+) from Start\(\)",
            |c| {
                Some(StatusLine::Connected {
                    socket: c[1].parse().ok()?,
                    pid: c[2].parse().ok()?,
                })
            },
        ),
        (r"^\[Socket (\d+)\] Selected prefix: (\S.*)$", |c| {
            Some(StatusLine::PrefixSelected {
                socket: c[1].parse().ok()?,
                prefix: c[2].to_string(),
            })
        }),
        (r"^\[Socket (\d+)\] File released: (\S.*)$", |c| {
            Some(StatusLine::FileReleased {
                socket: c[1].parse().ok()?,
                file: c[2].to_string(),
            })
        }),
        (r"^\[Socket (\d+)\] Connection closed, prefix=(\S.*)$", |c| {
            Some(StatusLine::Closed {
                socket: c[1].parse().ok()?,
                prefix: c[2].to_string(),
            })
        }),
    ];
    rules
        .into_iter()
        .map(|(pattern, matcher)| (Regex::new(pattern).unwrap(), matcher))
        .collect()
});

/// Classify one line. Trailing whitespace (including `\r` from adb) is ignored.
pub fn parse_line(line: &str) -> StatusLine {
    let line = line.trim_end();
    MATCHERS
        .iter()
        .find_map(|(regex, matcher)| regex.captures(line).and_then(|c| matcher(&c)))
        .unwrap_or(StatusLine::Informational)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Server with uid 10080", StatusLine::ServerReady { uid: 10080 })]
    #[case(
        "[Socket 3] Connection with pid 500 from Start()",
        StatusLine::Connected { socket: 3, pid: 500 }
    )]
    #[case(
        "[Socket 3] Selected prefix: /data/local/tmp/mt_0_\r",
        StatusLine::PrefixSelected { socket: 3, prefix: "/data/local/tmp/mt_0_".into() }
    )]
    #[case(
        "[Socket 3] File released: /data/local/tmp/mt_0_data_0.bin",
        StatusLine::FileReleased { socket: 3, file: "/data/local/tmp/mt_0_data_0.bin".into() }
    )]
    #[case(
        "[Socket 3] Connection closed, prefix=/data/local/tmp/mt_0_",
        StatusLine::Closed { socket: 3, prefix: "/data/local/tmp/mt_0_".into() }
    )]
    #[case("Connection attempt!", StatusLine::Informational)]
    #[case("[Socket 3] Connection closed", StatusLine::Informational)]
    #[case("[Socket x] Selected prefix: /a", StatusLine::Informational)]
    #[case("[Socket 3] Selected prefix: ", StatusLine::Informational)]
    #[case("[Socket 99999999999] Connection with pid 1 from Start()", StatusLine::Informational)]
    #[case("", StatusLine::Informational)]
    fn test_parse_line(#[case] line: &str, #[case] expected: StatusLine) {
        assert_eq!(parse_line(line), expected);
    }

    #[test]
    fn test_kind() {
        assert_eq!(parse_line("Server with uid 1").kind(), "server-ready");
        assert_eq!(parse_line("hello").kind(), "informational");
    }
}
