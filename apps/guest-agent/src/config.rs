//! Reads `/etc/guest-agent.conf`, a simple `KEY=VALUE` file baked into the
//! guest image.

use std::fs;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: String,
    pub shared_dir: Option<String>,
}

pub fn read_config() -> AgentConfig {
    let content = fs::read_to_string("/etc/guest-agent.conf").unwrap_or_default();
    parse_config(&content)
}

fn parse_config(content: &str) -> AgentConfig {
    let mut agent_id = None;
    let mut shared_dir = None;

    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            match key.trim() {
                "AGENT_ID" => agent_id = Some(value.trim().to_string()),
                "SHARED_DIR" => shared_dir = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }

    AgentConfig {
        agent_id: agent_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()[..8].to_string()),
        shared_dir,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_agent_id_and_shared_dir() {
        let config = parse_config("AGENT_ID=abc123\nSHARED_DIR=/mnt/shared\n");
        assert_eq!(config.agent_id, "abc123");
        assert_eq!(config.shared_dir.as_deref(), Some("/mnt/shared"));
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let config = parse_config("# a comment\n\nAGENT_ID=abc123\n");
        assert_eq!(config.agent_id, "abc123");
    }

    #[test]
    fn missing_agent_id_gets_a_random_fallback() {
        let config = parse_config("");
        assert_eq!(config.agent_id.len(), 8);
    }

    #[test]
    fn missing_shared_dir_is_none() {
        let config = parse_config("AGENT_ID=abc123\n");
        assert!(config.shared_dir.is_none());
    }
}
