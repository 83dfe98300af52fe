//! Script assembly and reply parsing for the remote existence probe.
//!
//! The probe payload is a small POSIX shell program; every path is passed as
//! a single-quoted word, so quoting is the only serialization concern.

use std::collections::HashSet;

pub const EXISTS_MARKER: &str = "EXISTS:";
pub const NOT_EXISTS_MARKER: &str = "NOTEXISTS:";

/// Exit status an ssh client uses for its own (connection/auth) failures.
const SSH_FAILURE_STATUS: i32 = 255;

const AUTH_FAILURE_PATTERNS: [&str; 3] = [
    "Permission denied",
    "Authentication failed",
    "Host key verification failed",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("path contains a newline and cannot be probed: {0:?}")]
    Newline(String),
}

/// Quote `value` as one POSIX shell word.
pub fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

/// Build a script printing one `EXISTS:`/`NOTEXISTS:` line per path.
pub fn build_script<S: AsRef<str>>(paths: &[S]) -> Result<String, ScriptError> {
    let mut words = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        if path.contains(['\n', '\r']) {
            return Err(ScriptError::Newline(path.to_string()));
        }
        words.push(shell_quote(path));
    }

    Ok(format!(
        "for p in {}; do if [ -e \"$p\" ]; then printf '{EXISTS_MARKER}%s\\n' \"$p\"; else printf '{NOT_EXISTS_MARKER}%s\\n' \"$p\"; fi; done",
        words.join(" ")
    ))
}

/// Per-path answers parsed from the probe's stdout.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProbeReply {
    pub existing: HashSet<String>,
    pub missing: HashSet<String>,
    /// Lines that carried neither marker.
    pub unrecognized: usize,
}

impl ProbeReply {
    pub fn answered(&self, path: &str) -> bool {
        self.existing.contains(path) || self.missing.contains(path)
    }
}

pub fn parse_reply(stdout: &str) -> ProbeReply {
    let mut reply = ProbeReply::default();
    for line in stdout.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(path) = line.strip_prefix(NOT_EXISTS_MARKER) {
            reply.missing.insert(path.to_string());
        } else if let Some(path) = line.strip_prefix(EXISTS_MARKER) {
            reply.existing.insert(path.to_string());
        } else if !line.is_empty() {
            reply.unrecognized += 1;
        }
    }
    reply
}

/// Whether `host` and `path` join under the server root without escaping it.
///
/// A request path is attacker-controlled; `.` and `..` segments would let the
/// check walk out of the document root.
pub fn confined_to_root(host: &str, path: &str) -> bool {
    let host_ok = !host.is_empty() && !host.contains('/') && host != "." && host != "..";
    host_ok && path.split('/').all(|segment| segment != "." && segment != "..")
}

/// Server-side path a request would be served from.
pub fn server_path(root: &str, host: &str, path: &str) -> String {
    format!(
        "{}/{}/{}",
        root.trim_end_matches('/'),
        host,
        path.trim_start_matches('/')
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retrying cannot help (bad credentials, unknown host key).
    Permanent,
    Transient,
}

/// Classify a probe that exited unsuccessfully.
pub fn classify_failure(status: Option<i32>, stderr: &str) -> FailureKind {
    if status == Some(SSH_FAILURE_STATUS)
        || AUTH_FAILURE_PATTERNS.iter().any(|p| stderr.contains(p))
    {
        FailureKind::Permanent
    } else {
        FailureKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    const AWKWARD: [&str; 8] = [
        "plain.mp4",
        "with space.mp4",
        "it's.mp4",
        "''double''.mp4",
        "$(touch pwned).mp4",
        "`id`;rm -rf x|&.mp4",
        "\"quoted\" \\back\\slash*.mp4",
        "tab\there?.mp4",
    ];

    #[test]
    fn quoting_is_a_single_word() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn newlines_are_rejected() {
        assert_eq!(
            build_script(&["/ok", "/bad\nname"]),
            Err(ScriptError::Newline("/bad\nname".to_string()))
        );
    }

    #[test]
    fn script_round_trips_through_a_real_shell() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for (i, name) in AWKWARD.iter().enumerate() {
            let path = dir.path().join(name).display().to_string();
            if i % 2 == 0 {
                std::fs::write(&path, b"x").unwrap();
            }
            paths.push(path);
        }

        let script = build_script(&paths).unwrap();
        let output = Command::new("sh")
            .current_dir(dir.path())
            .arg("-c")
            .arg(&script)
            .output()
            .unwrap();
        assert!(output.status.success());

        let reply = parse_reply(&String::from_utf8(output.stdout).unwrap());
        for (i, path) in paths.iter().enumerate() {
            if i % 2 == 0 {
                assert!(reply.existing.contains(path), "{path}");
            } else {
                assert!(reply.missing.contains(path), "{path}");
            }
        }
        assert_eq!(reply.unrecognized, 0);
        assert!(!dir.path().join("pwned").exists());
    }

    #[test]
    fn reply_parsing_handles_noise() {
        let reply = parse_reply("EXISTS:/a\r\nNOTEXISTS:/b\nwelcome banner\n\nEXISTS:/c d\n");
        assert!(reply.existing.contains("/a"));
        assert!(reply.existing.contains("/c d"));
        assert!(reply.missing.contains("/b"));
        assert!(reply.answered("/b"));
        assert!(!reply.answered("/z"));
        assert_eq!(reply.unrecognized, 1);
    }

    #[test]
    fn server_paths_join_cleanly() {
        assert_eq!(
            server_path("/var/www/", "media.example.com", "/v/1.mp4"),
            "/var/www/media.example.com/v/1.mp4"
        );
    }

    #[test]
    fn dot_segments_cannot_escape_the_root() {
        assert!(confined_to_root("media.example.com", "/v/1.mp4"));
        assert!(confined_to_root("media.example.com", "/v/..hidden/file..mp4"));
        assert!(!confined_to_root("media.example.com", "/../../etc/passwd"));
        assert!(!confined_to_root("media.example.com", "/v/./1.mp4"));
        assert!(!confined_to_root("media.example.com", "/v/.."));
        assert!(!confined_to_root("..", "/etc/passwd"));
        assert!(!confined_to_root("a/../..", "/x"));
        assert!(!confined_to_root("", "/x"));
    }

    #[test]
    fn auth_failures_are_permanent() {
        assert_eq!(classify_failure(Some(255), ""), FailureKind::Permanent);
        assert_eq!(
            classify_failure(Some(1), "user@host: Permission denied (publickey)."),
            FailureKind::Permanent
        );
        assert_eq!(
            classify_failure(Some(1), "Connection timed out"),
            FailureKind::Transient
        );
        assert_eq!(classify_failure(None, ""), FailureKind::Transient);
    }
}
