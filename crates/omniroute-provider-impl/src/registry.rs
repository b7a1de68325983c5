//! Executor registry: fixed executors built at startup plus a thread-safe
//! lazy map for generic `openai-compatible-*` / `anthropic-compatible-*`
//! tags.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use omniroute_provider_core::{ExecutorLookup, ProviderExecutor, ProviderKind};

use crate::antigravity::AntigravityExecutor;
use crate::codex::CodexExecutor;
use crate::cursor::CursorExecutor;
use crate::default_exec::DefaultExecutor;
use crate::github::GithubCopilotExecutor;
use crate::iflow::IflowExecutor;
use crate::kiro::KiroExecutor;

pub struct ExecutorRegistry {
    fixed: HashMap<ProviderKind, Arc<dyn ProviderExecutor>>,
    compat: RwLock<HashMap<String, Arc<dyn ProviderExecutor>>>,
}

impl ExecutorRegistry {
    pub fn standard() -> Self {
        let mut fixed: HashMap<ProviderKind, Arc<dyn ProviderExecutor>> = HashMap::new();
        for kind in [
            ProviderKind::Openai,
            ProviderKind::Anthropic,
            ProviderKind::Gemini,
            ProviderKind::Openrouter,
            ProviderKind::Glm,
            ProviderKind::Kimi,
            ProviderKind::Minimax,
        ] {
            fixed.insert(kind.clone(), Arc::new(DefaultExecutor::new(kind)));
        }
        // Claude Code and Qwen Code speak their native dialect against
        // OAuth-backed endpoints but share the passthrough shape.
        fixed.insert(
            ProviderKind::ClaudeCode,
            Arc::new(DefaultExecutor::new(ProviderKind::Anthropic)),
        );
        fixed.insert(
            ProviderKind::QwenCode,
            Arc::new(DefaultExecutor::new(ProviderKind::Openai)),
        );
        fixed.insert(ProviderKind::Github, Arc::new(GithubCopilotExecutor::new()));
        fixed.insert(ProviderKind::Cursor, Arc::new(CursorExecutor::new()));
        fixed.insert(ProviderKind::Codex, Arc::new(CodexExecutor::new()));
        fixed.insert(
            ProviderKind::Antigravity,
            Arc::new(AntigravityExecutor::new(ProviderKind::Antigravity)),
        );
        fixed.insert(
            ProviderKind::GeminiCli,
            Arc::new(AntigravityExecutor::new(ProviderKind::GeminiCli)),
        );
        fixed.insert(ProviderKind::Iflow, Arc::new(IflowExecutor::new()));
        fixed.insert(ProviderKind::Kiro, Arc::new(KiroExecutor::new()));
        Self {
            fixed,
            compat: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, kind: &ProviderKind) -> Option<Arc<dyn ProviderExecutor>> {
        if let Some(executor) = self.fixed.get(kind) {
            return Some(executor.clone());
        }
        let ProviderKind::Compat(tag) = kind else {
            return None;
        };
        if let Ok(guard) = self.compat.read()
            && let Some(executor) = guard.get(tag)
        {
            return Some(executor.clone());
        }
        let executor: Arc<dyn ProviderExecutor> =
            Arc::new(DefaultExecutor::new(kind.clone()));
        if let Ok(mut guard) = self.compat.write() {
            guard.insert(tag.clone(), executor.clone());
        }
        Some(executor)
    }
}

impl ExecutorLookup for ExecutorRegistry {
    fn executor(&self, kind: &ProviderKind) -> Option<Arc<dyn ProviderExecutor>> {
        self.get(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_kinds_resolve() {
        let registry = ExecutorRegistry::standard();
        for kind in [
            ProviderKind::Openai,
            ProviderKind::Github,
            ProviderKind::Cursor,
            ProviderKind::Codex,
            ProviderKind::Antigravity,
            ProviderKind::GeminiCli,
            ProviderKind::Iflow,
            ProviderKind::Kiro,
        ] {
            assert!(registry.get(&kind).is_some(), "missing {}", kind.as_str());
        }
    }

    #[test]
    fn compat_executors_are_built_lazily_and_cached() {
        let registry = ExecutorRegistry::standard();
        let kind = ProviderKind::Compat("openai-compatible-groq".to_string());
        let first = registry.get(&kind).unwrap();
        let second = registry.get(&kind).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
