//! The profile store: the instance owner plus peers learned from the
//! network or granted access.

use std::collections::HashMap;
use std::sync::RwLock;

use almanac_auth::Profile;

use crate::error::Error;

pub struct ProfileStore {
    owner_id: String,
    profiles: RwLock<HashMap<String, Profile>>,
}

impl ProfileStore {
    pub fn new(owner: Profile) -> Self {
        let owner_id = owner.id.clone();
        let mut profiles = HashMap::new();
        profiles.insert(owner_id.clone(), owner);
        Self {
            owner_id,
            profiles: RwLock::new(profiles),
        }
    }

    pub fn owner(&self) -> Profile {
        self.profiles
            .read()
            .expect("profile store lock poisoned")
            .get(&self.owner_id)
            .cloned()
            .expect("owner profile always present")
    }

    pub fn put(&self, profile: Profile) {
        self.profiles
            .write()
            .expect("profile store lock poisoned")
            .insert(profile.id.clone(), profile);
    }

    pub fn get_by_id(&self, id: &str) -> Result<Profile, Error> {
        self.profiles
            .read()
            .expect("profile store lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("profile not found: {id}")))
    }

    pub fn get_by_username(&self, username: &str) -> Result<Profile, Error> {
        self.profiles
            .read()
            .expect("profile store lock poisoned")
            .values()
            .find(|p| p.peername == username)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("profile not found: {username}")))
    }

    /// Replace the owner's peername. Updates the stored profile in place.
    pub fn set_owner_peername(&self, peername: &str, updated: chrono::DateTime<chrono::Utc>) {
        let mut profiles = self.profiles.write().expect("profile store lock poisoned");
        if let Some(owner) = profiles.get_mut(&self.owner_id) {
            owner.peername = peername.to_string();
            owner.updated = updated;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use almanac_auth::KeyPair;
    use chrono::Utc;

    #[test]
    fn owner_lookup_by_id_and_username() {
        let pair = KeyPair::test_fixture();
        let store = ProfileStore::new(Profile::new("peer", &pair, Utc::now()));
        assert_eq!(store.owner().peername, "peer");
        assert_eq!(store.get_by_username("peer").unwrap().id, pair.profile_id());
        assert_eq!(store.get_by_id(pair.profile_id()).unwrap().peername, "peer");
        assert!(store.get_by_username("stranger").is_err());
    }

    #[test]
    fn set_owner_peername_updates_in_place() {
        let pair = KeyPair::test_fixture();
        let store = ProfileStore::new(Profile::new("peer", &pair, Utc::now()));
        store.set_owner_peername("ada", Utc::now());
        assert_eq!(store.owner().peername, "ada");
        assert!(store.get_by_username("peer").is_err());
    }
}
