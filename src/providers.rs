//! Built-in upstream presets.
//!
//! Each preset names an OpenAI-compatible chat completion API. Users pick a
//! preset by name in their config instead of spelling out the base URL; an
//! explicit `base_url` always wins.

/// Built-in upstream presets. The proxy appends `/chat/completions` to the
/// base URL.
#[derive(Debug, Clone)]
pub struct ProviderPreset {
    pub name: &'static str,
    pub base_url: &'static str,
}

/// Preset used when the config names no upstream.
pub const DEFAULT_PROVIDER: &str = "openrouter";

const PRESETS: &[ProviderPreset] = &[
    ProviderPreset {
        name: "openrouter",
        base_url: "https://openrouter.ai/api/v1",
    },
    ProviderPreset {
        name: "openai",
        base_url: "https://api.openai.com/v1",
    },
    ProviderPreset {
        name: "together",
        base_url: "https://api.together.xyz/v1",
    },
    ProviderPreset {
        name: "groq",
        base_url: "https://api.groq.com/openai/v1",
    },
    ProviderPreset {
        name: "fireworks",
        base_url: "https://api.fireworks.ai/inference/v1",
    },
];

impl ProviderPreset {
    #[must_use]
    pub fn from_name(name: &str) -> Option<&'static ProviderPreset> {
        PRESETS.iter().find(|p| p.name == name.to_lowercase())
    }

    #[must_use]
    pub fn all() -> &'static [ProviderPreset] {
        PRESETS
    }

    #[must_use]
    pub fn names() -> Vec<&'static str> {
        PRESETS.iter().map(|p| p.name).collect()
    }
}
