//! Tool-intent taxonomy.
//!
//! Everything here is a pure, table-driven function of its inputs: step intent
//! classification, tool-family classification of a command's leading
//! executable, and the enumerated known-bad intent/tool pairings.

use serde::{Deserialize, Serialize};

/// What a step is trying to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Intent {
    Discovery,
    Enumeration,
    DataRetrieval,
    Exploitation,
    VulnerabilityResearch,
    Connection,
    Capture,
    Unknown,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Discovery => "discovery",
            Intent::Enumeration => "enumeration",
            Intent::DataRetrieval => "data-retrieval",
            Intent::Exploitation => "exploitation",
            Intent::VulnerabilityResearch => "vulnerability-research",
            Intent::Connection => "connection",
            Intent::Capture => "capture",
            Intent::Unknown => "unknown",
        }
    }

    /// Families that are reasonable for this intent, offered as alternatives
    /// in diversity feedback. Absence from this list never causes a rejection.
    pub fn accepted_families(&self) -> &'static [ToolFamily] {
        use ToolFamily::*;
        match self {
            Intent::Discovery => &[Scanner, DnsTool, RawSocket],
            Intent::Enumeration => &[Scanner, RawSocket, HttpClient, WebScanner, DnsTool, RemoteShell],
            Intent::DataRetrieval => &[HttpClient, RawSocket, Scripting, RemoteShell, MediaClient, DnsTool],
            Intent::Exploitation => &[
                ExploitFramework,
                Scripting,
                HttpClient,
                RawSocket,
                BruteForce,
                RemoteShell,
                WebScanner,
            ],
            Intent::VulnerabilityResearch => &[ExploitDb, Scanner, WebScanner, HttpClient],
            Intent::Connection => &[RawSocket, RemoteShell, Scripting],
            Intent::Capture => &[PacketCapture, MediaClient, RawSocket],
            Intent::Unknown => ToolFamily::ALL,
        }
    }

    /// Intents whose commands act on a specific host.
    pub fn needs_target(&self) -> bool {
        matches!(
            self,
            Intent::Enumeration
                | Intent::DataRetrieval
                | Intent::Exploitation
                | Intent::Connection
                | Intent::Capture
        )
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized category of an executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolFamily {
    Scanner,
    HttpClient,
    RawSocket,
    DnsTool,
    ExploitDb,
    ExploitFramework,
    WebScanner,
    BruteForce,
    RemoteShell,
    MediaClient,
    PacketCapture,
    Scripting,
    Other,
}

impl ToolFamily {
    pub const ALL: &'static [ToolFamily] = &[
        ToolFamily::Scanner,
        ToolFamily::HttpClient,
        ToolFamily::RawSocket,
        ToolFamily::DnsTool,
        ToolFamily::ExploitDb,
        ToolFamily::ExploitFramework,
        ToolFamily::WebScanner,
        ToolFamily::BruteForce,
        ToolFamily::RemoteShell,
        ToolFamily::MediaClient,
        ToolFamily::PacketCapture,
        ToolFamily::Scripting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolFamily::Scanner => "scanner",
            ToolFamily::HttpClient => "http-client",
            ToolFamily::RawSocket => "raw-socket",
            ToolFamily::DnsTool => "dns-tool",
            ToolFamily::ExploitDb => "exploit-db",
            ToolFamily::ExploitFramework => "exploit-framework",
            ToolFamily::WebScanner => "web-scanner",
            ToolFamily::BruteForce => "brute-force",
            ToolFamily::RemoteShell => "remote-shell",
            ToolFamily::MediaClient => "media-client",
            ToolFamily::PacketCapture => "packet-capture",
            ToolFamily::Scripting => "scripting",
            ToolFamily::Other => "other",
        }
    }

    pub fn is_exploit_tool(&self) -> bool {
        matches!(self, ToolFamily::ExploitDb | ToolFamily::ExploitFramework)
    }
}

impl std::fmt::Display for ToolFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intent keyword table. Order breaks ties between equal scores.
const INTENT_KEYWORDS: &[(Intent, &[&str])] = &[
    (
        Intent::VulnerabilityResearch,
        &[
            "cve",
            "vulnerabilit",
            "known weakness",
            "searchsploit",
            "exploit-db",
            "exploitdb",
            "search for exploit",
            "look up exploit",
            "advisor",
        ],
    ),
    (
        Intent::Exploitation,
        &[
            "exploit",
            "payload",
            "rce",
            "remote code",
            "reverse shell",
            "backdoor",
            "inject",
            "brute",
            "gain access",
            "default credential",
            "bypass auth",
            "attack",
        ],
    ),
    (
        Intent::Discovery,
        &[
            "discover",
            "sweep",
            "find devices",
            "find hosts",
            "live hosts",
            "identify hosts",
            "identify the target",
            "scan the network",
            "scan the local",
            "network scan",
            "locate",
            "map the network",
            "local network",
            "ping",
        ],
    ),
    (
        Intent::Enumeration,
        &[
            "enumerat",
            "open ports",
            "port scan",
            "services",
            "service version",
            "fingerprint",
            "banner",
            "os detection",
            "scan",
        ],
    ),
    (
        Intent::Capture,
        &["capture", "sniff", "record", "pcap", "traffic", "snapshot", "stream"],
    ),
    (
        Intent::Connection,
        &["connect", "listener", "netcat", "session", "login", "log in", "shell access", "pair"],
    ),
    (
        Intent::DataRetrieval,
        &[
            "retrieve",
            "fetch",
            "download",
            "collect",
            "gather",
            "information",
            "info",
            "data",
            "http request",
            "endpoint",
            "api",
            "read",
            "query",
        ],
    ),
];

/// Executable table.
const TOOL_FAMILIES: &[(ToolFamily, &[&str])] = &[
    (
        ToolFamily::Scanner,
        &[
            "nmap", "masscan", "zmap", "rustscan", "ping", "fping", "arp-scan", "arping", "netdiscover",
            "traceroute", "unicornscan",
        ],
    ),
    (ToolFamily::HttpClient, &["curl", "wget", "http", "httpie", "lynx"]),
    (ToolFamily::RawSocket, &["nc", "ncat", "netcat", "socat", "hping3"]),
    (
        ToolFamily::DnsTool,
        &["dig", "nslookup", "host", "whois", "dnsrecon", "dnsenum", "avahi-browse", "avahi-resolve"],
    ),
    (ToolFamily::ExploitDb, &["searchsploit"]),
    (ToolFamily::ExploitFramework, &["msfconsole", "msfvenom", "routersploit", "rsf"]),
    (
        ToolFamily::WebScanner,
        &["nikto", "gobuster", "dirb", "ffuf", "wfuzz", "whatweb", "sqlmap", "nuclei", "wpscan"],
    ),
    (ToolFamily::BruteForce, &["hydra", "medusa", "ncrack", "patator", "john", "hashcat"]),
    (ToolFamily::RemoteShell, &["ssh", "sshpass", "telnet", "adb", "scp", "rsh"]),
    (
        ToolFamily::MediaClient,
        &["ffmpeg", "ffprobe", "ffplay", "vlc", "cvlc", "mpv", "gst-launch-1.0"],
    ),
    (ToolFamily::PacketCapture, &["tcpdump", "tshark", "dumpcap", "wireshark"]),
    (
        ToolFamily::Scripting,
        &["python", "python3", "perl", "ruby", "bash", "sh", "node", "php"],
    ),
];

/// Prefix commands that wrap the real executable.
const WRAPPERS: &[&str] = &["sudo", "time", "nice", "nohup", "timeout", "env", "exec", "stdbuf"];

/// Classify a step description by keyword scoring.
pub fn classify_intent(description: &str) -> Intent {
    let lower = description.to_lowercase();
    let mut best = (Intent::Unknown, 0usize);
    for (intent, keywords) in INTENT_KEYWORDS {
        let score = keywords.iter().filter(|kw| mentions(&lower, kw)).count();
        if score > best.1 {
            best = (*intent, score);
        }
    }
    best.0
}

/// True if `keyword` occurs in `text` starting at a word boundary, so that
/// "rce" does not match "force" while "enumerat" still matches "enumerate".
pub fn mentions(text: &str, keyword: &str) -> bool {
    text.match_indices(keyword).any(|(idx, _)| {
        text[..idx]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric())
    })
}

/// Family of a bare executable name (path and version suffixes ignored).
pub fn family_of(executable: &str) -> ToolFamily {
    let name = executable.rsplit('/').next().unwrap_or(executable).to_lowercase();
    let name = name.trim_end_matches(".py");
    for (family, tools) in TOOL_FAMILIES {
        if tools.contains(&name) {
            return *family;
        }
    }
    // python3.11, perl5.36 and friends
    let base = name.trim_end_matches(|c: char| c.is_ascii_digit() || c == '.');
    if base != name {
        for (family, tools) in TOOL_FAMILIES {
            if tools.contains(&base) {
                return *family;
            }
        }
    }
    ToolFamily::Other
}

/// The executable a command actually runs, skipping wrappers such as
/// `sudo`, `timeout 30` or `env FOO=bar`.
pub fn leading_executable(command: &str) -> Option<String> {
    let mut tokens = command.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        let token = token.trim_start_matches('(');
        if token.is_empty() {
            continue;
        }
        if is_assignment(token) {
            continue;
        }
        let name = token.rsplit('/').next().unwrap_or(token);
        if WRAPPERS.contains(&name) {
            // Skip the wrapper's own flags and arguments
            while let Some(next) = tokens.peek() {
                let skip = next.starts_with('-')
                    || is_assignment(next)
                    || (name == "timeout" && is_duration(next))
                    || (name == "nice" && next.parse::<i32>().is_ok());
                if skip {
                    tokens.next();
                } else {
                    break;
                }
            }
            continue;
        }
        return Some(name.to_string());
    }
    None
}

/// Family of a command's leading executable.
pub fn classify_tool(command: &str) -> Option<ToolFamily> {
    leading_executable(command).map(|exe| family_of(&exe))
}

/// True if the description names an executable of `family`, i.e. the step
/// explicitly asks for that tool.
///
/// URLs and addresses are skipped: "Fetch http://10.0.0.5/" asks for a
/// resource, not for the `http` client.
pub fn names_tool(description: &str, family: ToolFamily) -> bool {
    if family == ToolFamily::Other {
        return false;
    }
    description
        .to_lowercase()
        .split_whitespace()
        .filter(|token| !is_locator(token))
        .flat_map(|token| token.split(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')))
        .map(|w| w.trim_end_matches('.'))
        .any(|w| !w.is_empty() && family_of(w) == family)
}

/// URL, path or network address rather than a word.
fn is_locator(token: &str) -> bool {
    let token = token.trim_matches(|c: char| matches!(c, '`' | '"' | '\'' | '(' | ')' | ',' | ';'));
    if token.contains("://") || token.starts_with('/') {
        return true;
    }
    let (host, port) = match token.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (token, None),
    };
    let host = host.split('/').next().unwrap_or(host).trim_end_matches('.');
    host.parse::<std::net::Ipv4Addr>().is_ok()
        || port.is_some_and(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
}

/// Whether a step's commands must be aimed at a specific host.
pub fn step_requires_target(description: &str) -> bool {
    description.contains("TARGET_IP") || classify_intent(description).needs_target()
}

fn is_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

fn is_duration(token: &str) -> bool {
    let digits = token.trim_end_matches(['s', 'm', 'h', 'd']);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit() || c == '.')
}

/// An enumerated known-bad pairing of step intent and tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchRule {
    /// Exploitation step answered with a plain scanner run
    ExploitWithPlainScanner,
    /// Discovery step answered with an exploit tool
    DiscoveryWithExploitTool,
    /// Data-retrieval step answered with an exploit tool
    RetrievalWithExploitTool,
    /// Command reconfigures the local machine instead of the target
    LocalSystemChange,
}

const ANALYSIS_WORDS: &[&str] = &["analy", "verify", "verif", "check", "confirm", "assess"];
const EXPLOIT_WORDS: &[&str] = &["exploit", "cve", "vulnerab"];
const EXPLOIT_SCRIPTS: &[&str] = &["vuln", "exploit", "shellshock", "brute", "auth"];
const LOCAL_SETUP_WORDS: &[&str] = &[
    "listener",
    "local setup",
    "set up locally",
    "prepare local",
    "attacker machine",
    "attacking machine",
];
const LOCAL_CHANGES: &[&str] = &["systemctl", "service", "useradd", "groupadd", "usermod"];

fn changes_local_system(command: &str) -> bool {
    command
        .split(|c| matches!(c, ';' | '|' | '&'))
        .any(|segment| match leading_executable(segment) {
            Some(exe) if exe == "crontab" => segment.split_whitespace().any(|t| t == "-e"),
            Some(exe) => LOCAL_CHANGES.contains(&exe.as_str()),
            None => false,
        })
}

impl MismatchRule {
    pub const ALL: &'static [MismatchRule] = &[
        MismatchRule::LocalSystemChange,
        MismatchRule::ExploitWithPlainScanner,
        MismatchRule::DiscoveryWithExploitTool,
        MismatchRule::RetrievalWithExploitTool,
    ];

    /// Explanation if the rule fires for this step/command pairing.
    pub fn check(
        &self,
        description: &str,
        intent: Intent,
        command: &str,
        family: ToolFamily,
    ) -> Option<String> {
        let desc = description.to_lowercase();
        let cmd = command.to_lowercase();
        match self {
            MismatchRule::ExploitWithPlainScanner => {
                let scripted = cmd.contains("--script")
                    && EXPLOIT_SCRIPTS.iter().any(|s| cmd.contains(s));
                let analysis = ANALYSIS_WORDS.iter().any(|w| mentions(&desc, w));
                (intent == Intent::Exploitation
                    && family == ToolFamily::Scanner
                    && !scripted
                    && !analysis)
                    .then(|| {
                        "exploitation step but the command only scans; use an exploit framework, \
                         a script, or nmap --script with an exploit/vuln script"
                            .to_string()
                    })
            }
            MismatchRule::DiscoveryWithExploitTool => (intent == Intent::Discovery
                && family.is_exploit_tool())
            .then(|| format!("discovery step but the command uses {}; use a scanner", family)),
            MismatchRule::RetrievalWithExploitTool => {
                let about_exploits = EXPLOIT_WORDS.iter().any(|w| mentions(&desc, w));
                (intent == Intent::DataRetrieval && family.is_exploit_tool() && !about_exploits)
                    .then(|| {
                        format!(
                            "data-retrieval step but the command uses {}; use an http client or raw socket",
                            family
                        )
                    })
            }
            MismatchRule::LocalSystemChange => {
                let local_setup = LOCAL_SETUP_WORDS.iter().any(|w| mentions(&desc, w));
                (changes_local_system(&cmd) && !local_setup).then(|| {
                    "command changes local services or users instead of acting on the target"
                        .to_string()
                })
            }
        }
    }
}

/// First enumerated mismatch that fires, if any.
pub fn find_mismatch(
    description: &str,
    intent: Intent,
    command: &str,
    family: ToolFamily,
) -> Option<(MismatchRule, String)> {
    MismatchRule::ALL
        .iter()
        .find_map(|rule| rule.check(description, intent, command, family).map(|why| (*rule, why)))
}
