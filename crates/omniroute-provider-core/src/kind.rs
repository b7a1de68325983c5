use serde::{Deserialize, Serialize};

/// Upstream provider families. Generic OpenAI/Anthropic-compatible
/// connections carry their full tag so lazily built executors can be keyed
/// by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Openai,
    Anthropic,
    Gemini,
    Openrouter,
    Glm,
    Kimi,
    Minimax,
    ClaudeCode,
    Codex,
    GeminiCli,
    QwenCode,
    Iflow,
    Antigravity,
    Github,
    Kiro,
    Cursor,
    #[serde(untagged)]
    Compat(String),
}

impl ProviderKind {
    pub fn as_str(&self) -> &str {
        match self {
            ProviderKind::Openai => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Openrouter => "openrouter",
            ProviderKind::Glm => "glm",
            ProviderKind::Kimi => "kimi",
            ProviderKind::Minimax => "minimax",
            ProviderKind::ClaudeCode => "claude-code",
            ProviderKind::Codex => "codex",
            ProviderKind::GeminiCli => "gemini-cli",
            ProviderKind::QwenCode => "qwen-code",
            ProviderKind::Iflow => "iflow",
            ProviderKind::Antigravity => "antigravity",
            ProviderKind::Github => "github",
            ProviderKind::Kiro => "kiro",
            ProviderKind::Cursor => "cursor",
            ProviderKind::Compat(tag) => tag.as_str(),
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        let kind = match tag {
            "openai" => ProviderKind::Openai,
            "anthropic" => ProviderKind::Anthropic,
            "gemini" => ProviderKind::Gemini,
            "openrouter" => ProviderKind::Openrouter,
            "glm" => ProviderKind::Glm,
            "kimi" => ProviderKind::Kimi,
            "minimax" => ProviderKind::Minimax,
            "claude-code" => ProviderKind::ClaudeCode,
            "codex" => ProviderKind::Codex,
            "gemini-cli" => ProviderKind::GeminiCli,
            "qwen-code" => ProviderKind::QwenCode,
            "iflow" => ProviderKind::Iflow,
            "antigravity" => ProviderKind::Antigravity,
            "github" => ProviderKind::Github,
            "kiro" => ProviderKind::Kiro,
            "cursor" => ProviderKind::Cursor,
            other
                if other.starts_with("openai-compatible-")
                    || other.starts_with("anthropic-compatible-") =>
            {
                ProviderKind::Compat(other.to_string())
            }
            _ => return None,
        };
        Some(kind)
    }

    pub fn is_openai_compatible(&self) -> bool {
        matches!(
            self,
            ProviderKind::Openai | ProviderKind::Openrouter
        ) || matches!(self, ProviderKind::Compat(tag) if tag.starts_with("openai-compatible-"))
    }
}

/// Fixed bijective short-alias table used in `model` strings
/// (`cc/claude-sonnet-4-5` etc.). Plain provider tags map to themselves.
const ALIASES: &[(&str, &str)] = &[
    ("cc", "claude-code"),
    ("cx", "codex"),
    ("gc", "gemini-cli"),
    ("qw", "qwen-code"),
    ("if", "iflow"),
    ("ag", "antigravity"),
    ("gh", "github"),
    ("kr", "kiro"),
    ("cu", "cursor"),
];

pub fn alias_to_provider(alias: &str) -> Option<ProviderKind> {
    for (short, full) in ALIASES {
        if *short == alias {
            return ProviderKind::parse(full);
        }
    }
    ProviderKind::parse(alias)
}

pub fn provider_to_alias(kind: &ProviderKind) -> &str {
    for (short, full) in ALIASES {
        if *full == kind.as_str() {
            return short;
        }
    }
    kind.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_table_is_bijective() {
        for (short, full) in ALIASES {
            let kind = alias_to_provider(short).unwrap();
            assert_eq!(kind.as_str(), *full);
            assert_eq!(provider_to_alias(&kind), *short);
        }
    }

    #[test]
    fn identity_aliases_resolve() {
        for tag in ["openai", "anthropic", "gemini", "openrouter", "glm", "kimi", "minimax"] {
            let kind = alias_to_provider(tag).unwrap();
            assert_eq!(kind.as_str(), tag);
            assert_eq!(provider_to_alias(&kind), tag);
        }
    }

    #[test]
    fn compat_tags_parse() {
        let kind = ProviderKind::parse("openai-compatible-groq").unwrap();
        assert!(matches!(kind, ProviderKind::Compat(_)));
        assert!(kind.is_openai_compatible());
        assert!(ProviderKind::parse("mystery").is_none());
    }
}
