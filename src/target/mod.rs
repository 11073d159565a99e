//! Target candidate resolution.
//!
//! Scores discovered hosts against hints taken from the objective and turns
//! the best score into a 0-10 confidence. Resolution is a pure function of its
//! inputs; the engine decides what to do with a low confidence.

mod discovery;
mod hints;

pub use discovery::{is_host_ip, merge_hosts, parse_nmap_hosts, DiscoveredHost};
pub use hints::{DeviceHint, TargetHints, VendorHint};

use std::cmp::Ordering;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::config::ScoringWeights;

/// A scored guess at the real-world target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub ip: String,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    pub score: u32,
    pub reasons: Vec<String>,
}

/// Outcome of a resolution run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Candidates ordered by score, highest first
    pub candidates: Vec<Candidate>,
    /// Confidence (0-10) that the first candidate is the intended target
    pub confidence: u8,
}

impl Resolution {
    pub fn top(&self) -> Option<&Candidate> {
        self.candidates.first()
    }

    /// The candidate to bind without asking, if confidence clears `threshold`.
    pub fn autonomous_choice(&self, threshold: u8) -> Option<&Candidate> {
        if self.confidence >= threshold {
            self.top()
        } else {
            None
        }
    }
}

/// Score one host against the hints.
pub fn score_host(hints: &TargetHints, host: &DiscoveredHost, weights: &ScoringWeights) -> Candidate {
    let mut score = 0;
    let mut reasons = Vec::new();
    let hostname = host.hostname.as_deref().map(str::to_lowercase);
    let vendor = host.vendor.as_deref().map(str::to_lowercase);

    if let Some(name) = &hostname {
        for hint in hostname_matches(hints, name) {
            score += weights.hostname_match;
            reasons.push(format!("hostname '{}' contains '{}'", name, hint));
        }
    }

    if let Some(v) = &vendor {
        for vendor_hint in &hints.vendors {
            if vendor_hint.matches(v) {
                score += weights.vendor_match;
                reasons.push(format!("vendor '{}' matches '{}'", v, vendor_hint.name));
            }
        }
    }

    for port in &hints.ports {
        if host.ports.contains(port) {
            score += weights.port_match;
            reasons.push(format!("expected port {} is open", port));
        }
    }

    if reasons.is_empty() {
        reasons.push("no hint matched".to_string());
    }

    Candidate {
        ip: host.ip.clone(),
        hostname: host.hostname.clone(),
        vendor: host.vendor.clone(),
        score,
        reasons,
    }
}

/// Hints found in a hostname, one match per hint.
///
/// A device word counts through its longest synonym, and a match that is part
/// of a longer match from another hint ("pad" inside "redmi-pad") is dropped.
fn hostname_matches<'a>(hints: &'a TargetHints, name: &str) -> Vec<&'a str> {
    let mut found: Vec<&str> = Vec::new();
    found.extend(hints.vendors.iter().map(|v| v.name.as_str()).filter(|v| name.contains(v)));
    found.extend(hints.devices.iter().filter_map(|d| d.best_match(name)));
    found.extend(hints.keywords.iter().map(String::as_str).filter(|k| name.contains(k)));

    let mut kept: Vec<&str> = Vec::new();
    for (i, hint) in found.iter().enumerate() {
        let covered = found.iter().enumerate().any(|(j, other)| {
            j != i && other.contains(hint) && (other.len() > hint.len() || j < i)
        });
        if !covered {
            kept.push(*hint);
        }
    }
    kept
}

/// Normalize a raw score onto 0-10.
pub fn confidence_for(score: u32, weights: &ScoringWeights) -> u8 {
    let scale = weights.confidence_scale.max(1);
    let normalized = (score.saturating_mul(10) + scale / 2) / scale;
    normalized.min(10) as u8
}

/// Rank every discovered host against the hints.
///
/// An address named verbatim in the objective wins outright with confidence 10.
pub fn resolve(hints: &TargetHints, hosts: &[DiscoveredHost], weights: &ScoringWeights) -> Resolution {
    if let Some(explicit) = &hints.explicit_target {
        let known = hosts.iter().find(|h| &h.ip == explicit);
        return Resolution {
            candidates: vec![Candidate {
                ip: explicit.clone(),
                hostname: known.and_then(|h| h.hostname.clone()),
                vendor: known.and_then(|h| h.vendor.clone()),
                score: weights.confidence_scale,
                reasons: vec!["address named in the objective".to_string()],
            }],
            confidence: 10,
        };
    }

    let mut candidates: Vec<Candidate> = hosts.iter().map(|h| score_host(hints, h, weights)).collect();
    candidates.sort_by(compare_candidates);

    let confidence = candidates
        .first()
        .map(|c| confidence_for(c.score, weights))
        .unwrap_or(0);

    Resolution {
        candidates,
        confidence,
    }
}

fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    b.score.cmp(&a.score).then_with(|| a.ip.cmp(&b.ip))
}

/// True if `target` is usable as a manually selected target: an IP address or
/// a DNS hostname.
pub fn is_valid_target(target: &str) -> bool {
    let target = target.trim();
    if target.is_empty() || target.len() > 253 {
        return false;
    }
    if target.parse::<IpAddr>().is_ok() {
        return true;
    }
    // Dotted quads that failed to parse are malformed addresses, not hostnames
    if target.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return false;
    }
    target.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}
