use std::collections::HashMap;
use std::sync::Arc;

use crate::provider::Provider;

#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<&'static str, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.family(), provider);
    }

    pub fn get(&self, family: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(family).cloned()
    }
}
