//! Context builder for planning prompts.
//!
//! Gathers target hints, discovered hosts, retrieved knowledge and prior
//! memory into a [`PlanningContext`]. Every collaborator is optional and best
//! effort: a failing source leaves its section empty and logs a warning.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::exec::CommandRunner;
use crate::target::{parse_nmap_hosts, DiscoveredHost, TargetHints};

/// Number of knowledge hits requested per objective.
const KNOWLEDGE_TOP_K: usize = 5;
/// Number of past outcomes recalled per objective.
const MEMORY_LIMIT: usize = 3;
/// Outcomes an [`InMemoryMemory`] keeps by default.
const MEMORY_CAPACITY: usize = 256;

/// One retrieved knowledge passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeHit {
    pub source: String,
    pub text: String,
    pub score: f32,
}

/// Read-only background knowledge.
#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    /// Best matches for `query`, highest score first.
    async fn search(&self, query: &str, top_k: usize) -> anyhow::Result<Vec<KnowledgeHit>>;
}

/// Long-term memory of past task outcomes.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn recall(&self, objective: &str, limit: usize) -> anyhow::Result<Vec<String>>;
    async fn remember(&self, objective: &str, summary: &str) -> anyhow::Result<()>;
}

/// Source of hosts on the operator's network.
#[async_trait]
pub trait HostDiscovery: Send + Sync {
    async fn discover(&self) -> anyhow::Result<Vec<DiscoveredHost>>;
}

/// Ping sweep through the command runner.
pub struct NmapDiscovery {
    runner: Arc<dyn CommandRunner>,
    range: String,
    timeout: Duration,
}

impl NmapDiscovery {
    pub fn new(runner: Arc<dyn CommandRunner>, range: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            range: range.into(),
            timeout,
        }
    }

    fn command(&self) -> String {
        format!("nmap -sn {}", self.range)
    }
}

#[async_trait]
impl HostDiscovery for NmapDiscovery {
    async fn discover(&self) -> anyhow::Result<Vec<DiscoveredHost>> {
        let output = self.runner.run(&self.command(), self.timeout).await?;
        if output.exit_status != Some(0) {
            anyhow::bail!("host discovery failed: {}", output.failure_summary());
        }
        let hosts = parse_nmap_hosts(&output.stdout);
        tracing::debug!("Discovery of {} found {} hosts", self.range, hosts.len());
        Ok(hosts)
    }
}

/// Process-local memory. Recall matches objectives sharing words with the
/// query, most recent first. Only the newest `capacity` outcomes are kept.
#[derive(Debug)]
pub struct InMemoryMemory {
    entries: RwLock<VecDeque<(String, String)>>,
    capacity: usize,
}

impl InMemoryMemory {
    pub fn new() -> Self {
        Self::with_capacity(MEMORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }
}

impl Default for InMemoryMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemory {
    async fn recall(&self, objective: &str, limit: usize) -> anyhow::Result<Vec<String>> {
        let words: Vec<String> = significant_words(objective);
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .rev()
            .filter(|(past, _)| {
                let past = past.to_lowercase();
                words.iter().any(|w| past.contains(w.as_str()))
            })
            .take(limit)
            .map(|(past, summary)| format!("{}: {}", past, summary))
            .collect())
    }

    async fn remember(&self, objective: &str, summary: &str) -> anyhow::Result<()> {
        let mut entries = self.entries.write().await;
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back((objective.to_string(), summary.to_string()));
        Ok(())
    }
}

fn significant_words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|w| w.len() > 3)
        .map(str::to_lowercase)
        .collect()
}

/// Everything the planner sees about an objective.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanningContext {
    pub objective: String,
    pub hints: TargetHints,
    pub hosts: Vec<DiscoveredHost>,
    pub knowledge: Vec<KnowledgeHit>,
    pub memories: Vec<String>,
}

impl PlanningContext {
    pub fn new(objective: impl Into<String>) -> Self {
        let objective = objective.into();
        Self {
            hints: TargetHints::from_objective(&objective),
            objective,
            ..Default::default()
        }
    }

    /// Deterministic prompt rendering. Empty sections are omitted.
    pub fn render(&self) -> String {
        let mut out = format!("## Objective\n{}\n", self.objective);

        if !self.hints.is_empty() {
            out.push_str("\n## Target Hints\n");
            if let Some(target) = &self.hints.explicit_target {
                out.push_str(&format!("- Explicit target: {}\n", target));
            }
            if !self.hints.vendors.is_empty() {
                let vendors: Vec<&str> = self.hints.vendors.iter().map(|v| v.name.as_str()).collect();
                out.push_str(&format!("- Vendors: {}\n", vendors.join(", ")));
            }
            if !self.hints.devices.is_empty() {
                let devices: Vec<&str> = self.hints.devices.iter().map(|d| d.name.as_str()).collect();
                out.push_str(&format!("- Devices: {}\n", devices.join(", ")));
            }
            if !self.hints.keywords.is_empty() {
                out.push_str(&format!("- Keywords: {}\n", self.hints.keywords.join(", ")));
            }
            if !self.hints.ports.is_empty() {
                let ports: Vec<String> = self.hints.ports.iter().map(u16::to_string).collect();
                out.push_str(&format!("- Expected ports: {}\n", ports.join(", ")));
            }
        }

        if !self.hosts.is_empty() {
            out.push_str("\n## Discovered Hosts\n");
            for host in &self.hosts {
                out.push_str(&format!("- {}", host.ip));
                if let Some(name) = &host.hostname {
                    out.push_str(&format!(" ({})", name));
                }
                if let Some(vendor) = &host.vendor {
                    out.push_str(&format!(" vendor={}", vendor));
                }
                if !host.ports.is_empty() {
                    let ports: Vec<String> = host.ports.iter().map(u16::to_string).collect();
                    out.push_str(&format!(" open={}", ports.join(",")));
                }
                out.push('\n');
            }
        }

        if !self.knowledge.is_empty() {
            out.push_str("\n## Background Knowledge\n");
            for hit in &self.knowledge {
                out.push_str(&format!("- [{}] {}\n", hit.source, hit.text.trim()));
            }
        }

        if !self.memories.is_empty() {
            out.push_str("\n## Previous Runs\n");
            for memory in &self.memories {
                out.push_str(&format!("- {}\n", memory));
            }
        }

        out
    }
}

/// Assembles a [`PlanningContext`] from whichever collaborators are configured.
#[derive(Clone, Default)]
pub struct ContextBuilder {
    knowledge: Option<Arc<dyn KnowledgeSource>>,
    memory: Option<Arc<dyn MemoryStore>>,
    discovery: Option<Arc<dyn HostDiscovery>>,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeSource>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn HostDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Build the context. Never fails; see module docs.
    pub async fn build(&self, objective: &str) -> PlanningContext {
        let mut context = PlanningContext::new(objective);

        if let Some(discovery) = &self.discovery {
            match discovery.discover().await {
                Ok(hosts) => context.hosts = hosts,
                Err(e) => tracing::warn!("Host discovery unavailable: {}", e),
            }
        }

        if let Some(knowledge) = &self.knowledge {
            match knowledge.search(objective, KNOWLEDGE_TOP_K).await {
                Ok(hits) => context.knowledge = hits,
                Err(e) => tracing::warn!("Knowledge retrieval unavailable: {}", e),
            }
        }

        if let Some(memory) = &self.memory {
            match memory.recall(objective, MEMORY_LIMIT).await {
                Ok(memories) => context.memories = memories,
                Err(e) => tracing::warn!("Memory recall unavailable: {}", e),
            }
        }

        context
    }

    /// Store a task outcome. Best effort.
    pub async fn remember(&self, objective: &str, summary: &str) {
        if let Some(memory) = &self.memory {
            if let Err(e) = memory.remember(objective, summary).await {
                tracing::warn!("Failed to store task outcome: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CommandOutput, ExecError};

    struct FailingKnowledge;

    #[async_trait]
    impl KnowledgeSource for FailingKnowledge {
        async fn search(&self, _query: &str, _top_k: usize) -> anyhow::Result<Vec<KnowledgeHit>> {
            anyhow::bail!("index offline")
        }
    }

    struct StaticKnowledge;

    #[async_trait]
    impl KnowledgeSource for StaticKnowledge {
        async fn search(&self, _query: &str, top_k: usize) -> anyhow::Result<Vec<KnowledgeHit>> {
            Ok(vec![KnowledgeHit {
                source: "cve-notes".to_string(),
                text: "RTSP on port 554 often accepts default credentials".to_string(),
                score: 0.9,
            }]
            .into_iter()
            .take(top_k)
            .collect())
        }
    }

    struct CannedRunner(String);

    #[async_trait]
    impl CommandRunner for CannedRunner {
        async fn run(&self, command: &str, _timeout: Duration) -> Result<CommandOutput, ExecError> {
            assert!(command.starts_with("nmap -sn "));
            Ok(CommandOutput {
                exit_status: Some(0),
                stdout: self.0.clone(),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_failing_collaborator_degrades() {
        let builder = ContextBuilder::new().with_knowledge(Arc::new(FailingKnowledge));
        let context = builder.build("Assess the Hikvision camera").await;
        assert!(context.knowledge.is_empty());
        assert!(context.render().contains("## Objective"));
        assert!(!context.render().contains("Background Knowledge"));
    }

    #[tokio::test]
    async fn test_build_with_all_sources() {
        let scan = "Nmap scan report for cam-lobby (192.168.1.40)\n\
                    Host is up (0.0030s latency).\n\
                    MAC Address: AA:BB:CC:DD:EE:FF (Hangzhou Hikvision Digital Technology)\n";
        let memory = Arc::new(InMemoryMemory::new());
        memory
            .remember("Assess the lobby camera", "completed, 3 of 4 steps succeeded")
            .await
            .unwrap();

        let builder = ContextBuilder::new()
            .with_knowledge(Arc::new(StaticKnowledge))
            .with_memory(memory)
            .with_discovery(Arc::new(NmapDiscovery::new(
                Arc::new(CannedRunner(scan.to_string())),
                "192.168.1.0/24",
                Duration::from_secs(30),
            )));

        let context = builder.build("Assess the Hikvision camera for weaknesses").await;
        assert_eq!(context.hosts.len(), 1);
        assert_eq!(context.knowledge.len(), 1);
        assert_eq!(context.memories.len(), 1);

        let rendered = context.render();
        assert!(rendered.contains("192.168.1.40 (cam-lobby)"));
        assert!(rendered.contains("[cve-notes]"));
        assert!(rendered.contains("## Previous Runs"));
        assert_eq!(rendered, context.render());
    }

    #[tokio::test]
    async fn test_memory_recall_matches_words() {
        let memory = InMemoryMemory::new();
        memory.remember("scan the printer", "done").await.unwrap();
        memory.remember("check the router", "done").await.unwrap();
        let recalled = memory.recall("router firmware", 5).await.unwrap();
        assert_eq!(recalled, vec!["check the router: done".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_drops_oldest_outcomes() {
        let memory = InMemoryMemory::with_capacity(2);
        memory.remember("check router one", "done").await.unwrap();
        memory.remember("check router two", "done").await.unwrap();
        memory.remember("check router three", "failed").await.unwrap();

        let recalled = memory.recall("router", 10).await.unwrap();
        assert_eq!(
            recalled,
            vec![
                "check router three: failed".to_string(),
                "check router two: done".to_string()
            ]
        );
    }
}
