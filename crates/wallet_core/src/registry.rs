use std::sync::Arc;

use shared::domain::{ProviderDescriptor, ProviderKind};

/// Identity flags exposed on the canonical injected provider slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InjectedMarkers {
    pub is_leather: bool,
    pub is_hiro: bool,
}

/// Point-in-time view of the ambient signing surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvironmentSnapshot {
    /// The canonical global slot, `None` when nothing is injected.
    pub stacks_provider: Option<InjectedMarkers>,
    /// Xverse's own global, present independently of the canonical slot.
    pub xverse_providers: bool,
}

/// Read-only access to whatever provider objects the host has injected.
///
/// The host state can change at any time (extensions installed, disabled,
/// reloaded), so callers take a fresh snapshot per question.
pub trait ProviderEnvironment: Send + Sync {
    fn snapshot(&self) -> EnvironmentSnapshot;
}

/// A host with no global signing surface, e.g. a non-browser process.
pub struct HeadlessEnvironment;

impl ProviderEnvironment for HeadlessEnvironment {
    fn snapshot(&self) -> EnvironmentSnapshot {
        EnvironmentSnapshot::default()
    }
}

#[derive(Clone)]
pub struct ProviderRegistry {
    environment: Arc<dyn ProviderEnvironment>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new(Arc::new(HeadlessEnvironment))
    }
}

impl ProviderRegistry {
    pub fn new(environment: Arc<dyn ProviderEnvironment>) -> Self {
        Self { environment }
    }

    /// Every known kind in fixed order; the relay entry is always present.
    pub fn list_providers(&self) -> Vec<ProviderDescriptor> {
        let snapshot = self.environment.snapshot();
        ProviderKind::ALL
            .iter()
            .map(|kind| ProviderDescriptor::new(*kind, is_installed(&snapshot, *kind)))
            .collect()
    }

    pub fn detect_installed(&self, kind: ProviderKind) -> bool {
        is_installed(&self.environment.snapshot(), kind)
    }

    /// Resolves which provider owns the canonical slot.
    ///
    /// Precedence, first match wins:
    /// 1. no canonical slot: absent
    /// 2. `is_leather` marker: leather
    /// 3. `is_hiro` marker: hiro
    /// 4. Xverse global present: xverse
    /// 5. unbranded slot: xverse
    pub fn active_provider(&self) -> Option<ProviderDescriptor> {
        resolve_active(&self.environment.snapshot())
            .map(|kind| ProviderDescriptor::new(kind, true))
    }

    pub fn has_signing_surface(&self) -> bool {
        self.environment.snapshot().stacks_provider.is_some()
    }
}

fn is_installed(snapshot: &EnvironmentSnapshot, kind: ProviderKind) -> bool {
    let slot = snapshot.stacks_provider;
    match kind {
        ProviderKind::Leather => slot.is_some_and(|markers| markers.is_leather),
        ProviderKind::Xverse => {
            snapshot.xverse_providers || slot.is_some_and(|markers| !markers.is_leather)
        }
        ProviderKind::Hiro => slot.is_some_and(|markers| markers.is_hiro),
        ProviderKind::Relay => true,
    }
}

fn resolve_active(snapshot: &EnvironmentSnapshot) -> Option<ProviderKind> {
    let markers = snapshot.stacks_provider?;
    if markers.is_leather {
        Some(ProviderKind::Leather)
    } else if markers.is_hiro {
        Some(ProviderKind::Hiro)
    } else {
        // Xverse global or an unbranded slot both resolve to xverse.
        Some(ProviderKind::Xverse)
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
