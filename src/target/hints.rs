//! Hint extraction from a free-form objective.

use serde::{Deserialize, Serialize};

use super::discovery::is_host_ip;

/// Hardware vendors and the strings their MAC OUI registrations carry.
const VENDOR_ALIASES: &[(&str, &[&str])] = &[
    ("xiaomi", &["xiaomi communications", "xiaomi"]),
    ("samsung", &["samsung electronics", "samsung"]),
    ("google", &["google"]),
    ("apple", &["apple"]),
    ("huawei", &["huawei"]),
    ("oneplus", &["oneplus"]),
    ("sony", &["sony"]),
    ("lg", &["lg electronics"]),
    ("hikvision", &["hangzhou hikvision", "hikvision"]),
    ("ezviz", &["ezviz", "hikvision"]),
    ("dahua", &["dahua technology", "dahua"]),
    ("tp-link", &["tp-link technologies", "tp-link", "tp link"]),
    ("d-link", &["d-link corporation", "d-link", "d link"]),
    ("espressif", &["espressif systems", "espressif"]),
    ("raspberry", &["raspberry pi"]),
];

/// Device words and the synonyms they imply.
const DEVICE_WORDS: &[(&str, &[&str])] = &[
    ("camera", &["camera", "cam"]),
    ("webcam", &["camera", "cam"]),
    ("tablet", &["tablet", "pad"]),
    ("pad", &["pad", "tablet"]),
    ("phone", &["phone"]),
    ("smartphone", &["phone"]),
    ("router", &["router", "gateway"]),
    ("printer", &["printer"]),
    ("tv", &["tv"]),
    ("chromecast", &["chromecast"]),
    ("bulb", &["bulb"]),
    ("nas", &["nas"]),
    ("doorbell", &["doorbell"]),
];

/// Protocols that imply a well-known port.
const PROTOCOL_PORTS: &[(&str, u16)] = &[
    ("rtsp", 554),
    ("adb", 5555),
    ("onvif", 80),
    ("cast", 8008),
    ("ssh", 22),
    ("telnet", 23),
    ("mqtt", 1883),
];

/// A vendor named by the objective together with its registration aliases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorHint {
    pub name: String,
    pub aliases: Vec<String>,
}

impl VendorHint {
    /// True if a discovered vendor string belongs to this vendor.
    pub fn matches(&self, vendor: &str) -> bool {
        let vendor = vendor.to_lowercase();
        vendor.contains(&self.name) || self.aliases.iter().any(|a| vendor.contains(a.as_str()))
    }
}

/// A device word from the objective and the hostname spellings it implies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHint {
    pub name: String,
    pub synonyms: Vec<String>,
}

impl DeviceHint {
    /// Longest synonym found in `text`, if any.
    pub fn best_match(&self, text: &str) -> Option<&str> {
        self.synonyms
            .iter()
            .filter(|s| text.contains(s.as_str()))
            .max_by_key(|s| s.len())
            .map(String::as_str)
    }
}

/// Hints about the intended target, extracted from the objective.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetHints {
    /// Model numbers and hostname-like fragments (lowercase)
    pub keywords: Vec<String>,
    /// Device words, one entry per kind of device
    #[serde(default)]
    pub devices: Vec<DeviceHint>,
    /// Vendors the objective names
    pub vendors: Vec<VendorHint>,
    /// Ports the target is expected to expose
    pub ports: Vec<u16>,
    /// Address named verbatim in the objective
    pub explicit_target: Option<String>,
}

impl TargetHints {
    pub fn from_objective(objective: &str) -> Self {
        let lower = objective.to_lowercase();
        let tokens: Vec<&str> = lower
            .split(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | '(' | ')' | '"' | '\''))
            .map(|t| t.trim_end_matches(['.', '!', '?']))
            .filter(|t| !t.is_empty())
            .collect();

        let mut hints = TargetHints::default();

        for (name, aliases) in VENDOR_ALIASES {
            if tokens.iter().any(|t| t == name || t.starts_with(&format!("{}-", name))) {
                hints.vendors.push(VendorHint {
                    name: name.to_string(),
                    aliases: aliases.iter().map(|a| a.to_string()).collect(),
                });
            }
        }

        for token in &tokens {
            let stripped = token.trim_end_matches('s');
            for (word, synonyms) in DEVICE_WORDS {
                if *token == *word || stripped == *word {
                    push_device(&mut hints.devices, word, synonyms);
                }
            }
        }

        // Model numbers and hostname-like fragments ("ds-2cd2143", "redmi-pad")
        for token in &tokens {
            if token.len() < 3 || is_ipv4_literal(token) || token.contains(':') {
                continue;
            }
            let has_alpha = token.chars().any(|c| c.is_ascii_alphabetic());
            let has_digit = token.chars().any(|c| c.is_ascii_digit());
            let hostname_like = token.contains('-') || (has_alpha && has_digit);
            let is_vendor = hints.vendors.iter().any(|v| v.name == *token);
            if hostname_like && !is_vendor && token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                push_unique(&mut hints.keywords, token);
            }
        }

        for window in tokens.windows(2) {
            if window[0] == "port" {
                if let Ok(port) = window[1].parse::<u16>() {
                    push_unique_port(&mut hints.ports, port);
                }
            }
        }
        for token in &tokens {
            if let Some((host, port)) = token.rsplit_once(':') {
                if let Ok(port) = port.parse::<u16>() {
                    if port > 0 {
                        push_unique_port(&mut hints.ports, port);
                    }
                }
                if hints.explicit_target.is_none() && is_ipv4_literal(host) && is_host_ip(host) {
                    hints.explicit_target = Some(host.to_string());
                }
            }
        }
        for (proto, port) in PROTOCOL_PORTS {
            if tokens.iter().any(|t| t == proto) {
                push_unique_port(&mut hints.ports, *port);
            }
        }

        if hints.explicit_target.is_none() {
            hints.explicit_target = tokens
                .iter()
                .find(|t| is_ipv4_literal(t) && is_host_ip(t))
                .map(|t| t.to_string());
        }

        hints
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
            && self.devices.is_empty()
            && self.vendors.is_empty()
            && self.ports.is_empty()
            && self.explicit_target.is_none()
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

/// "tablet" and "pad" describe the same device, so they share one entry.
fn push_device(devices: &mut Vec<DeviceHint>, word: &str, synonyms: &[&str]) {
    let existing = devices
        .iter_mut()
        .find(|d| synonyms.iter().any(|s| d.synonyms.iter().any(|e| e == s)));
    match existing {
        Some(device) => {
            for s in synonyms {
                push_unique(&mut device.synonyms, s);
            }
        }
        None => devices.push(DeviceHint {
            name: word.to_string(),
            synonyms: synonyms.iter().map(|s| s.to_string()).collect(),
        }),
    }
}

fn push_unique_port(list: &mut Vec<u16>, port: u16) {
    if !list.contains(&port) {
        list.push(port);
    }
}

fn is_ipv4_literal(s: &str) -> bool {
    s.parse::<std::net::Ipv4Addr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_vendor_device_and_protocol() {
        let hints = TargetHints::from_objective("Assess the Xiaomi pad for known weaknesses over ADB");
        assert_eq!(hints.vendors.len(), 1);
        assert_eq!(hints.vendors[0].name, "xiaomi");
        assert_eq!(hints.devices.len(), 1);
        assert_eq!(hints.devices[0].name, "pad");
        assert!(hints.devices[0].synonyms.contains(&"tablet".to_string()));
        assert_eq!(hints.ports, vec![5555]);
        assert!(hints.explicit_target.is_none());
    }

    #[test]
    fn test_extracts_explicit_ports_and_ip() {
        let hints = TargetHints::from_objective("check the camera at 192.168.1.40 on port 8554");
        assert_eq!(hints.explicit_target.as_deref(), Some("192.168.1.40"));
        assert!(hints.ports.contains(&8554));
        assert_eq!(hints.devices[0].name, "camera");
    }

    #[test]
    fn test_related_device_words_share_one_entry() {
        let hints = TargetHints::from_objective("find the tablet, the pad in the kitchen");
        assert_eq!(hints.devices.len(), 1);
        assert_eq!(hints.devices[0].best_match("kitchen-tablet"), Some("tablet"));
        assert_eq!(hints.devices[0].best_match("printer"), None);
    }

    #[test]
    fn test_host_port_pair() {
        let hints = TargetHints::from_objective("check 10.0.0.9:8080 for admin panels");
        assert_eq!(hints.explicit_target.as_deref(), Some("10.0.0.9"));
        assert_eq!(hints.ports, vec![8080]);
    }

    #[test]
    fn test_model_number_becomes_keyword() {
        let hints = TargetHints::from_objective("Hikvision DS-2CD2143 camera via rtsp");
        assert!(hints.keywords.contains(&"ds-2cd2143".to_string()));
        assert!(hints.ports.contains(&554));
        assert!(hints.vendors[0].matches("Hangzhou Hikvision Digital Technology"));
    }

    #[test]
    fn test_network_address_is_not_a_target() {
        let hints = TargetHints::from_objective("scan 192.168.1.0 and report");
        assert!(hints.explicit_target.is_none());
    }
}
