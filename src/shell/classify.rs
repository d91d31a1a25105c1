//! Command text heuristics
//!
//! Picks a timeout tier for a shell command and detects long-running
//! services that should default to background execution. Explicit caller
//! values always win over both heuristics.

use crate::config::TimeoutTiers;
use regex::RegexSet;
use std::sync::OnceLock;
use std::time::Duration;

/// Timeout tier of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTier {
    Network,
    Default,
    Build,
    Install,
}

impl CommandTier {
    pub fn timeout_ms(&self, tiers: &TimeoutTiers) -> u64 {
        match self {
            CommandTier::Network => tiers.network_ms,
            CommandTier::Default => tiers.default_ms,
            CommandTier::Build => tiers.build_ms,
            CommandTier::Install => tiers.install_ms,
        }
    }
}

fn install_patterns() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([
            r"\b(npm|pnpm|yarn|bun)\s+(install|i|add|ci)\b",
            r"\bpip3?\s+install\b",
            r"\b(poetry|bundle|composer)\s+install\b",
            r"\bcargo\s+install\b",
            r"\bapt(-get)?\s+install\b",
            r"\bbrew\s+install\b",
            r"\bgo\s+(mod\s+download|install)\b",
        ])
        .unwrap_or_else(|_| RegexSet::empty())
    })
}

fn build_patterns() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([
            r"\bcargo\s+(build|test|check|clippy|bench|run)\b",
            r"\b(npm|pnpm|yarn|bun)\s+(run\s+)?(build|test|lint|typecheck)\b",
            r"\bgo\s+(build|test|vet)\b",
            r"\b(make|cmake|ninja|mvn|gradle|gradlew)\b",
            r"\b(tsc|pytest|jest|vitest)\b",
            r"\bdocker\s+build\b",
        ])
        .unwrap_or_else(|_| RegexSet::empty())
    })
}

fn network_patterns() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([
            r"\b(curl|wget|ping|dig|nslookup|ssh|scp|nc)\b",
            r"\bgit\s+(fetch|pull|push|clone|ls-remote)\b",
        ])
        .unwrap_or_else(|_| RegexSet::empty())
    })
}

fn service_patterns() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([
            r"\b(npm|pnpm|yarn|bun)\s+(run\s+)?(dev|start|serve|watch)\b",
            r"\b(next|nuxt|vite)\s+dev\b",
            r"^\s*vite\s*$",
            r"\b(nodemon|webpack-dev-server|uvicorn|gunicorn)\b",
            r"\bcargo\s+watch\b",
            r"\bpython3?\s+-m\s+http\.server\b",
            r"\b(flask|rails)\s+(run|server|s)\b",
            r"\bmanage\.py\s+runserver\b",
            r"\btail\s+-f\b",
            r"\s--watch\b",
        ])
        .unwrap_or_else(|_| RegexSet::empty())
    })
}

/// Classify a command into a timeout tier; the longest matching tier wins
pub fn classify(command: &str) -> CommandTier {
    if install_patterns().is_match(command) {
        CommandTier::Install
    } else if build_patterns().is_match(command) {
        CommandTier::Build
    } else if network_patterns().is_match(command) {
        CommandTier::Network
    } else {
        CommandTier::Default
    }
}

/// Whether a command looks like a service that never exits on its own
pub fn is_long_running_service(command: &str) -> bool {
    if service_patterns().is_match(command) {
        return true;
    }
    // `docker compose up` stays attached unless detached
    let compose_up = command.contains("docker compose up") || command.contains("docker-compose up");
    compose_up && !command.split_whitespace().any(|t| t == "-d" || t == "--detach")
}

/// Effective timeout: explicit value if given, else the tier; clamped to the max
pub fn resolve_timeout(command: &str, explicit_ms: Option<u64>, tiers: &TimeoutTiers) -> Duration {
    let ms = explicit_ms.unwrap_or_else(|| classify(command).timeout_ms(tiers));
    Duration::from_millis(ms.min(tiers.max_ms))
}

/// Background decision: explicit flag if given, else service detection
pub fn should_run_in_background(command: &str, explicit: Option<bool>) -> bool {
    explicit.unwrap_or_else(|| is_long_running_service(command))
}
