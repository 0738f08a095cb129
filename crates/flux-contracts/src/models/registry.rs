use indexmap::IndexMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionLimits {
    pub min: u32,
    pub max: u32,
    pub step: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimensionPolicy {
    Unchecked,
    Limited(DimensionLimits),
    AspectRatioOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub endpoint: String,
    pub capabilities: Vec<String>,
    pub dimensions: DimensionPolicy,
    pub requires_input_image: bool,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }

    /// Spec for a model name the catalog does not know; the name is used as
    /// the endpoint and no constraints are enforced.
    pub fn passthrough(name: &str) -> Self {
        Self {
            name: name.to_string(),
            endpoint: name.trim_start_matches('/').to_string(),
            capabilities: Vec::new(),
            dimensions: DimensionPolicy::Unchecked,
            requires_input_image: false,
        }
    }

    pub fn check_dimensions(&self, width: Option<u32>, height: Option<u32>) -> Result<(), String> {
        if width.is_none() && height.is_none() {
            return Ok(());
        }
        let limits = match self.dimensions {
            DimensionPolicy::Unchecked => return Ok(()),
            DimensionPolicy::Limited(limits) => limits,
            DimensionPolicy::AspectRatioOnly => {
                return Err(format!(
                    "Model '{}' does not accept width/height; use aspect_ratio instead.",
                    self.name
                ))
            }
        };
        for (label, value) in [("width", width), ("height", height)] {
            let Some(value) = value else {
                continue;
            };
            if value < limits.min || value > limits.max {
                return Err(format!(
                    "{label} {value} out of range for '{}' ({}..={}).",
                    self.name, limits.min, limits.max
                ));
            }
            if value % limits.step != 0 {
                return Err(format!(
                    "{label} {value} must be a multiple of {} for '{}'.",
                    limits.step, self.name
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name.trim())
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

    /// Catalog entry for `name`, or a passthrough spec when unknown.
    pub fn resolve(&self, name: &str) -> ModelSpec {
        self.get(name)
            .cloned()
            .unwrap_or_else(|| ModelSpec::passthrough(name.trim()))
    }
}

const SIZED: DimensionPolicy = DimensionPolicy::Limited(DimensionLimits {
    min: 256,
    max: 1440,
    step: 32,
});
const ASPECT: DimensionPolicy = DimensionPolicy::AspectRatioOnly;

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str,
                      capabilities: &[&str],
                      dimensions: DimensionPolicy,
                      requires_input_image: bool| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                endpoint: name.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
                dimensions,
                requires_input_image,
            },
        );
    };

    insert("flux-pro-1.1", &["generate", "image_prompt"], SIZED, false);
    insert("flux-pro-1.1-ultra", &["generate", "image_prompt"], ASPECT, false);
    insert("flux-pro", &["generate", "image_prompt"], SIZED, false);
    insert("flux-dev", &["generate", "image_prompt"], SIZED, false);
    insert("flux-kontext-pro", &["generate", "edit"], ASPECT, false);
    insert("flux-kontext-max", &["generate", "edit"], ASPECT, false);
    insert("flux-pro-1.0-fill", &["fill"], ASPECT, true);
    insert("flux-pro-1.0-expand", &["expand"], ASPECT, true);
    insert("flux-pro-1.0-canny", &["control"], ASPECT, true);
    insert("flux-pro-1.0-depth", &["control"], ASPECT, true);

    map
}
