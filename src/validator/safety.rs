//! Forbidden command patterns.

use regex::Regex;

/// Built-in patterns: (name, regular expression). Matched case-insensitively
/// against the whole command line.
const FORBIDDEN: &[(&str, &str)] = &[
    (
        "recursive deletion of a system or home directory",
        r"\brm\s+(?:-{1,2}[\w-]+\s+)*-{1,2}(?:[a-z]*r[a-z]*|recursive)\s+(?:-{1,2}[\w-]+\s+)*(?:/(?:bin|boot|dev|etc|home|lib\w*|opt|root|sbin|srv|usr|var)?/?\*?|~/?\*?|\$home/?\*?|\*|\.)(?:\s|;|&|\||$)",
    ),
    ("filesystem creation", r"\bmkfs(?:\.\w+)?\b"),
    (
        "raw write to a block device",
        r"\bdd\b[^|;&]*\bof=/dev/(?:sd|hd|vd|xvd|nvme|mmcblk|disk)",
    ),
    ("disk wipe with dd", r"\bdd\b[^|;&]*\bif=/dev/(?:zero|u?random)"),
    (
        "redirection onto a block device",
        r">\s*/dev/(?:sd[a-z]|hd[a-z]|vd[a-z]|nvme\d|mmcblk\d)",
    ),
    ("shred", r"\bshred\b"),
    ("fork bomb", r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:"),
    ("power state change", r"(?:^|[\s;&|(])(?:shutdown|reboot|halt|poweroff)\b"),
    ("runlevel change", r"\binit\s+[06]\b"),
    ("world-writable root path", r"\bchmod\s+(?:-\S+\s+)*0?777\s+/"),
    ("ownership change to root", r"\bchown\s+(?:-\S+\s+)*root\b"),
    ("password change", r"(?:^|[\s;&|(])passwd\b"),
    (
        "privilege group change",
        r"\busermod\b[^|;&]*-a?G\s*\S*\b(?:sudo|wheel|root|admin)\b",
    ),
    ("sudoers edit", r"\bvisudo\b"),
    ("sudoers write", r"(?:>>?|\btee\b[^|;&]*)\s*/etc/sudoers"),
    (
        "network download piped into a shell",
        r"\b(?:curl|wget)\b[^|]*\|\s*(?:sudo\s+)?(?:ba|z|da|k)?sh\b",
    ),
    ("host shadow file", r"/etc/shadow\b"),
    ("host private key", r"\.ssh/id_(?:rsa|dsa|ecdsa|ed25519)\b"),
];

/// A compiled set of forbidden patterns.
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    patterns: Vec<(String, Regex)>,
}

impl SafetyPolicy {
    /// Compile the built-in patterns plus `extra`.
    ///
    /// # Errors
    /// Returns the first pattern that fails to compile.
    pub fn new(extra: &[String]) -> Result<Self, regex::Error> {
        let mut patterns = Vec::with_capacity(FORBIDDEN.len() + extra.len());
        for (name, pattern) in FORBIDDEN {
            patterns.push((name.to_string(), compile(pattern)?));
        }
        for pattern in extra {
            patterns.push((format!("custom pattern {}", pattern), compile(pattern)?));
        }
        Ok(Self { patterns })
    }

    /// Name of the first forbidden pattern `command` matches.
    pub fn check(&self, command: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(command))
            .map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("(?i){}", pattern))
}
