//! Provider presets — maps provider names to endpoint configurations.
//!
//! Every preset speaks the OpenAI chat-completions dialect, so a single
//! `OpenAiCompatibleClient` covers all of them.

/// How to attach auth credentials to requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// No authentication required (local servers).
    None,
}

/// Static endpoint description for one provider.
#[derive(Debug, Clone)]
pub struct ProviderPreset {
    pub name: &'static str,
    pub base_url: &'static str,
    /// Environment variables tried in order for the API key.
    pub env_keys: &'static [&'static str],
    pub auth_style: AuthStyle,
    /// Environment variable that overrides the base URL (e.g. OLLAMA_HOST).
    pub base_url_env: Option<&'static str>,
}

impl ProviderPreset {
    /// First non-empty API key found in the preset's environment variables.
    pub fn env_api_key(&self) -> String {
        self.env_keys
            .iter()
            .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
            .unwrap_or_default()
    }

    /// Base URL, honoring the override variable. Appends `/v1` to bare hosts.
    pub fn resolved_base_url(&self) -> String {
        self.base_url_env
            .and_then(|env_key| {
                let val = std::env::var(env_key).ok()?;
                if val.ends_with("/v1") {
                    Some(val)
                } else {
                    Some(format!("{}/v1", val.trim_end_matches('/')))
                }
            })
            .unwrap_or_else(|| self.base_url.to_string())
    }
}

static PRESETS: &[ProviderPreset] = &[
    ProviderPreset {
        name: "openai",
        base_url: "https://api.openai.com/v1",
        env_keys: &["OPENAI_API_KEY"],
        auth_style: AuthStyle::Bearer,
        base_url_env: Some("OPENAI_API_BASE"),
    },
    ProviderPreset {
        name: "deepseek",
        base_url: "https://api.deepseek.com/v1",
        env_keys: &["DEEPSEEK_API_KEY"],
        auth_style: AuthStyle::Bearer,
        base_url_env: None,
    },
    ProviderPreset {
        name: "groq",
        base_url: "https://api.groq.com/openai/v1",
        env_keys: &["GROQ_API_KEY"],
        auth_style: AuthStyle::Bearer,
        base_url_env: None,
    },
    ProviderPreset {
        name: "openrouter",
        base_url: "https://openrouter.ai/api/v1",
        env_keys: &["OPENROUTER_API_KEY", "OPENAI_API_KEY"],
        auth_style: AuthStyle::Bearer,
        base_url_env: None,
    },
    ProviderPreset {
        name: "ollama",
        base_url: "http://localhost:11434/v1",
        env_keys: &[],
        auth_style: AuthStyle::None,
        base_url_env: Some("OLLAMA_HOST"),
    },
    ProviderPreset {
        name: "doubao",
        base_url: "https://ark.cn-beijing.volces.com/api/v3",
        env_keys: &["ARK_API_KEY", "DOUBAO_API_KEY"],
        auth_style: AuthStyle::Bearer,
        base_url_env: None,
    },
    ProviderPreset {
        name: "dashscope",
        base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1",
        env_keys: &["DASHSCOPE_API_KEY"],
        auth_style: AuthStyle::Bearer,
        base_url_env: None,
    },
];

/// Look up a preset by name or alias.
pub fn get_preset(name: &str) -> Option<&'static ProviderPreset> {
    let lookup = match name {
        "volcengine" | "ark" | "bytedance" => "doubao",
        "qwen" | "aliyun" => "dashscope",
        other => other,
    };
    PRESETS.iter().find(|p| p.name == lookup)
}

/// List all known preset names.
pub fn all_preset_names() -> Vec<&'static str> {
    PRESETS.iter().map(|p| p.name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases_resolve() {
        assert_eq!(get_preset("ark").unwrap().name, "doubao");
        assert_eq!(get_preset("qwen").unwrap().name, "dashscope");
        assert!(get_preset("nonexistent").is_none());
    }

    #[test]
    fn test_local_preset_needs_no_key() {
        let ollama = get_preset("ollama").unwrap();
        assert_eq!(ollama.auth_style, AuthStyle::None);
        assert!(ollama.env_keys.is_empty());
    }

    #[test]
    fn test_names_are_unique() {
        let mut names = all_preset_names();
        let len = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), len);
    }
}
