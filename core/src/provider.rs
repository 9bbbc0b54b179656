//! Explicit registry of card reader providers.
//!
//! ## Usage
//! ```rust,no_run
//! use cardsim::provider::{ProviderRegistry, SimulatorCardReaderProvider};
//! use cardsim::SimulationManager;
//!
//! let manager = SimulationManager::temporary().unwrap();
//! let mut registry = ProviderRegistry::new();
//! registry.register(SimulatorCardReaderProvider);
//!
//! for controller in registry.controllers(&manager) {
//!     println!("{}: {} readers", controller.name(), controller.card_readers().len());
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

#[cfg(feature = "tracing")]
use tracing::warn;

use crate::reader::{SimulatorCardReaderController, READER_PREFIX};
use crate::simulation::SimulationManager;

/// Describes a card reader provider.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ProviderDescriptor {
    pub name: String,
    pub license: String,
    pub description: String,
    pub short_description: String,
}

/// A factory of card reader controllers.
pub trait CardReaderProvider: Send + Sync {
    fn descriptor(&self) -> ProviderDescriptor;

    /// Creates a controller observing the manager.
    fn provide(&self, manager: &SimulationManager) -> Arc<SimulatorCardReaderController>;
}

/// Provides the readers of a simulation manager under the name `cardsim`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatorCardReaderProvider;

impl CardReaderProvider for SimulatorCardReaderProvider {
    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            name: READER_PREFIX.to_string(),
            license: "LGPL-2.1-or-later".to_string(),
            description: "TCP channel card reader provider for card simulators.".to_string(),
            short_description: "Card simulator CRP".to_string(),
        }
    }

    fn provide(&self, manager: &SimulationManager) -> Arc<SimulatorCardReaderController> {
        SimulatorCardReaderController::new(manager)
    }
}

/// Providers by name, filled by explicit registration.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Box<dyn CardReaderProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the provider under its descriptor's name.
    /// Returns `false` and keeps the existing one when the name is taken.
    pub fn register<P: CardReaderProvider + 'static>(&mut self, provider: P) -> bool {
        let name = provider.descriptor().name;
        if self.providers.contains_key(&name) {
            warn!("Card reader provider {} is already registered", name);
            return false;
        }

        self.providers.insert(name, Box::new(provider));
        true
    }

    pub fn get(&self, name: &str) -> Option<&dyn CardReaderProvider> {
        self.providers.get(name).map(|provider| &**provider)
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        self.providers
            .values()
            .map(|provider| provider.descriptor())
            .collect()
    }

    /// Creates one controller per registered provider.
    pub fn controllers(
        &self,
        manager: &SimulationManager,
    ) -> Vec<Arc<SimulatorCardReaderController>> {
        self.providers
            .values()
            .map(|provider| provider.provide(manager))
            .collect()
    }
}
