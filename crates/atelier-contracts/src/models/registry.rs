use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    pub context_window: Option<u64>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

/// Known models, in preference order: the hosted Gemini family first, the
/// offline scripted pair last.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, provider: &str, capabilities: &[&str], context_window: Option<u64>| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
                context_window,
            },
        );
    };

    insert(
        "gemini-2.0-flash",
        "gemini",
        &["text", "vision"],
        Some(1_048_576),
    );
    insert(
        "gemini-2.5-flash",
        "gemini",
        &["text", "vision"],
        Some(1_048_576),
    );
    insert("gemini-2.0-flash-exp", "gemini", &["image", "text"], None);
    insert("gemini-2.5-flash-image", "gemini", &["image"], None);
    insert(
        "scripted-stylist-1",
        "scripted",
        &["text", "vision"],
        Some(8192),
    );
    insert("scripted-image-1", "scripted", &["image"], None);

    map
}

#[cfg(test)]
mod tests {
    use super::ModelRegistry;

    #[test]
    fn defaults_cover_text_and_image_for_both_providers() {
        let registry = ModelRegistry::new(None);
        let text = registry.by_capability("text");
        let image = registry.by_capability("image");

        assert!(text.iter().any(|model| model.provider == "gemini"));
        assert!(text.iter().any(|model| model.provider == "scripted"));
        assert!(image.iter().any(|model| model.provider == "gemini"));
        assert!(image.iter().any(|model| model.provider == "scripted"));
        // preference order: hosted models come first
        assert_eq!(text[0].provider, "gemini");
    }

    #[test]
    fn ensure_checks_the_capability() {
        let registry = ModelRegistry::new(None);
        assert!(registry.ensure("gemini-2.0-flash", "text").is_some());
        assert!(registry.ensure("gemini-2.0-flash", "image").is_none());
        assert!(registry.ensure("unlisted", "text").is_none());
    }
}
