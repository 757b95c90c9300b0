//! Explicit capability table keyed by provider and model id.

/// Completion ceiling for ordinary providers
const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4_096;
/// Completion ceiling for providers known to handle long outputs
const LONG_MAX_OUTPUT_TOKENS: u32 = 16_384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Provider honours a JSON-only response format
    pub json_output: bool,
    pub vision: bool,
    /// Provider supports materially longer completions
    pub long_completions: bool,
}

impl Capabilities {
    pub fn max_output_tokens(&self) -> u32 {
        if self.long_completions {
            LONG_MAX_OUTPUT_TOKENS
        } else {
            DEFAULT_MAX_OUTPUT_TOKENS
        }
    }
}

#[derive(Debug, Clone)]
struct CapabilityEntry {
    provider: String,
    /// Empty prefix matches every model of the provider
    model_prefix: String,
    capabilities: Capabilities,
}

/// Ordered lookup table; the first matching entry wins.
#[derive(Debug, Clone)]
pub struct CapabilityTable {
    entries: Vec<CapabilityEntry>,
}

impl Default for CapabilityTable {
    fn default() -> Self {
        let caps = |json_output, vision, long_completions| Capabilities {
            json_output,
            vision,
            long_completions,
        };
        let mut table = Self { entries: Vec::new() };
        table
            .with_entry("openai", "gpt-4.1", caps(true, true, true))
            .with_entry("openai", "gpt-4o", caps(true, true, false))
            .with_entry("openai", "gpt-5", caps(true, true, true))
            .with_entry("openai", "o", caps(true, false, true))
            .with_entry("openai", "", caps(true, false, false))
            .with_entry("gemini", "", caps(true, true, true))
            .with_entry("google", "", caps(true, true, true))
            .with_entry("anthropic", "claude", caps(false, true, true))
            .with_entry("ollama", "", caps(true, false, false))
            .with_entry("lmstudio", "", caps(false, false, false));
        table
    }
}

impl CapabilityTable {
    /// Table with no entries; every lookup yields the conservative default.
    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    /// Append an entry. Earlier entries take precedence.
    pub fn with_entry(
        &mut self,
        provider: &str,
        model_prefix: &str,
        capabilities: Capabilities,
    ) -> &mut Self {
        self.entries.push(CapabilityEntry {
            provider: provider.to_lowercase(),
            model_prefix: model_prefix.to_lowercase(),
            capabilities,
        });
        self
    }

    pub fn lookup(&self, provider: &str, model: &str) -> Capabilities {
        let provider = provider.to_lowercase();
        let model = model.to_lowercase();
        self.entries
            .iter()
            .find(|e| e.provider == provider && model.starts_with(&e.model_prefix))
            .map(|e| e.capabilities)
            .unwrap_or_default()
    }
}
