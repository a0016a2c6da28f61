use super::registry::{ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

/// Resolves a requested model name against a capability, falling back to the
/// first capable registry entry with an explanation when the request cannot
/// be honored.
#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
    ) -> Result<ModelSelection, String> {
        if let Some(name) = requested {
            if let Some(model) = self.registry.ensure(name, capability) {
                return Ok(ModelSelection {
                    model,
                    requested: Some(name.to_string()),
                    fallback_reason: None,
                });
            }
        }

        let fallback_reason = match requested {
            Some(name) => format!("Model '{name}' does not support '{capability}'; using default."),
            None => "No model requested; using default.".to_string(),
        };
        let Some(model) = self.registry.by_capability(capability).into_iter().next() else {
            return Err(format!("No models available that support '{capability}'."));
        };
        Ok(ModelSelection {
            model,
            requested: requested.map(str::to_string),
            fallback_reason: Some(fallback_reason),
        })
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::super::registry::{ModelRegistry, ModelSpec};
    use super::ModelSelector;

    fn model(name: &str, provider: &str, capabilities: &[&str]) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            provider: provider.to_string(),
            capabilities: capabilities
                .iter()
                .map(|item| (*item).to_string())
                .collect(),
            context_window: None,
        }
    }

    fn registry_of(models: Vec<ModelSpec>) -> ModelRegistry {
        let mut map = IndexMap::new();
        for spec in models {
            map.insert(spec.name.clone(), spec);
        }
        ModelRegistry::new(Some(map))
    }

    #[test]
    fn honors_a_capable_request() {
        let selector = ModelSelector::new(Some(registry_of(vec![
            model("fallback-text", "scripted", &["text"]),
            model("wanted", "gemini", &["text"]),
        ])));
        let selection = selector.select(Some("wanted"), "text").unwrap();
        assert_eq!(selection.model.name, "wanted");
        assert!(selection.fallback_reason.is_none());
    }

    #[test]
    fn falls_back_when_request_lacks_capability() {
        let selector = ModelSelector::new(Some(registry_of(vec![
            model("imager", "gemini", &["image"]),
            model("texter", "gemini", &["text"]),
        ])));
        let selection = selector.select(Some("imager"), "text").unwrap();
        assert_eq!(selection.model.name, "texter");
        assert_eq!(selection.requested.as_deref(), Some("imager"));
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("Model 'imager' does not support 'text'; using default.")
        );
    }

    #[test]
    fn no_request_uses_first_capable_model() {
        let selector = ModelSelector::new(Some(registry_of(vec![model(
            "only-text",
            "scripted",
            &["text"],
        )])));
        let selection = selector.select(None, "text").unwrap();
        assert_eq!(selection.model.name, "only-text");
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("No model requested; using default.")
        );
    }

    #[test]
    fn errors_when_nothing_supports_the_capability() {
        let selector = ModelSelector::new(Some(registry_of(vec![model(
            "only-text",
            "scripted",
            &["text"],
        )])));
        let err = selector.select(Some("only-text"), "image").err().unwrap();
        assert_eq!(err, "No models available that support 'image'.");
    }
}
