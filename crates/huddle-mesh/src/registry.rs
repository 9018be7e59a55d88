//! Presence registry held by the coordinator.

use std::collections::BTreeMap;

use huddle_core::ParticipantProfile;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct State {
    profiles: BTreeMap<String, ParticipantProfile>,
    version: u64,
}

/// Profiles keyed by participant name, plus a version counter bumped on
/// every mutation so the planner can tell cheaply whether anything changed.
#[derive(Debug, Default)]
pub struct Registry {
    state: Mutex<State>,
}

/// Consistent copy of the registry taken under its lock.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub version: u64,
    /// Sorted by name.
    pub profiles: Vec<ParticipantProfile>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the profile under its name.
    pub fn register(&self, profile: ParticipantProfile) {
        let mut state = self.state.lock();
        state.profiles.insert(profile.name.clone(), profile);
        state.version += 1;
    }

    /// Drop `name`. Returns the removed profile; the version only moves when
    /// something was actually removed.
    pub fn remove(&self, name: &str) -> Option<ParticipantProfile> {
        let mut state = self.state.lock();
        let removed = state.profiles.remove(name);
        if removed.is_some() {
            state.version += 1;
        }
        removed
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.lock();
        RegistrySnapshot {
            version: state.version,
            profiles: state.profiles.values().cloned().collect(),
        }
    }

    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    pub fn get(&self, name: &str) -> Option<ParticipantProfile> {
        self.state.lock().profiles.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.state.lock().profiles.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
