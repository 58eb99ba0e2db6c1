use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use super::abby::abby;
use super::profile::{CharacterProfile, ProfileSummary};
use crate::character_card::load_card_dir;
use crate::error::ProfileError;

/// Read-only registry of character profiles, keyed case-insensitively by id.
#[derive(Debug, Clone, Default)]
pub struct ProfileStore {
    profiles: Vec<Arc<CharacterProfile>>,
}

impl ProfileStore {
    /// Validate and freeze a set of profiles.
    pub fn from_profiles<I>(profiles: I) -> Result<Self, ProfileError>
    where
        I: IntoIterator<Item = CharacterProfile>,
    {
        let mut frozen: Vec<Arc<CharacterProfile>> = Vec::new();
        for profile in profiles {
            profile.validate()?;
            if frozen.iter().any(|existing| existing.matches_id(&profile.id)) {
                return Err(ProfileError::DuplicateId(profile.id));
            }
            frozen.push(Arc::new(profile));
        }
        Ok(Self { profiles: frozen })
    }

    /// The profiles compiled into the binary, validated like any card.
    pub fn builtin() -> Result<Self, ProfileError> {
        Self::from_profiles(builtin_profiles())
    }

    /// Built-in profiles plus every card found in `dir`.
    pub fn with_card_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let mut profiles = builtin_profiles();
        profiles.extend(load_card_dir(dir)?);
        let store = Self::from_profiles(profiles)
            .with_context(|| format!("Invalid character card in {:?}", dir))?;
        tracing::info!(
            "Profile store ready with {} character(s) from {:?}",
            store.len(),
            dir
        );
        Ok(store)
    }

    pub fn get(&self, id: &str) -> Option<Arc<CharacterProfile>> {
        self.profiles.iter().find(|p| p.matches_id(id)).cloned()
    }

    pub fn list(&self) -> Vec<ProfileSummary> {
        self.profiles.iter().map(|p| p.summary()).collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

fn builtin_profiles() -> Vec<CharacterProfile> {
    vec![abby()]
}
