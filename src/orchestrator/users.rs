//! Registry users and their `registry-user-<role>` secrets

use std::collections::BTreeMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::patch::{data_string, owned_secret, same_data, PatchCollector, SecretData};
use crate::constants;
use crate::error::{Error, Result};
use crate::helpers::{generate_random_string, PASSWORD_LENGTH};

pub const KEY_NAME: &str = "name";
pub const KEY_PASSWORD: &str = "password";
pub const KEY_PASSWORD_HASH: &str = "passwordHash";

const BCRYPT_COST: u32 = 10;
const MAX_NAME_LENGTH: usize = 253 - constants::USER_SECRET_PREFIX.len();

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Ro,
    Rw,
    MirrorPuller,
    MirrorPusher,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Ro, Role::Rw, Role::MirrorPuller, Role::MirrorPusher];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Ro => "ro",
            Role::Rw => "rw",
            Role::MirrorPuller => "mirror-puller",
            Role::MirrorPusher => "mirror-pusher",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub name: String,
    pub password: String,
    pub hashed_password: String,
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl User {
    pub fn generate(name: &str) -> Result<Self> {
        validate_name(name)?;
        let mut user = Self {
            name: name.to_string(),
            password: generate_random_string(PASSWORD_LENGTH),
            hashed_password: String::new(),
        };
        user.update_password_hash()?;
        Ok(user)
    }

    pub fn is_valid(&self) -> bool {
        validate_name(&self.name).is_ok() && !self.password.is_empty()
    }

    pub fn is_password_hash_valid(&self) -> bool {
        !self.hashed_password.is_empty()
            && bcrypt::verify(&self.password, &self.hashed_password).unwrap_or(false)
    }

    pub fn update_password_hash(&mut self) -> Result<()> {
        self.hashed_password = bcrypt::hash(&self.password, BCRYPT_COST)
            .map_err(|e| Error::ValidationError(format!("cannot hash password: {e}")))?;
        Ok(())
    }

    /// Recompute the hash only when it no longer matches the password
    pub fn ensure_password_hash(&mut self) -> Result<()> {
        if !self.is_password_hash_valid() {
            self.update_password_hash()?;
        }
        Ok(())
    }

    pub fn from_secret_data(data: &SecretData) -> Self {
        Self {
            name: data_string(data, KEY_NAME),
            password: data_string(data, KEY_PASSWORD),
            hashed_password: data_string(data, KEY_PASSWORD_HASH),
        }
    }

    pub fn to_secret_data(&self) -> SecretData {
        BTreeMap::from([
            (KEY_NAME.to_string(), self.name.clone().into_bytes()),
            (KEY_PASSWORD.to_string(), self.password.clone().into_bytes()),
            (
                KEY_PASSWORD_HASH.to_string(),
                self.hashed_password.clone().into_bytes(),
            ),
        ])
    }
}

const NAME_PATTERN: &str = "^[a-z0-9]([-a-z0-9]*[a-z0-9])*$";

static NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(NAME_PATTERN).expect("user name pattern is a valid regex"));

/// DNS-label-like user names
pub fn validate_name(name: &str) -> Result<()> {
    if !NAME_REGEX.is_match(name) {
        return Err(Error::ValidationError(format!(
            "invalid user name {name:?}: must match {NAME_PATTERN}"
        )));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(Error::ValidationError(format!(
            "user name {name:?} is longer than {MAX_NAME_LENGTH} characters"
        )));
    }
    Ok(())
}

/// Requested role set. `mirrorer` covers both mirror roles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Params {
    pub ro: bool,
    pub rw: bool,
    pub mirrorer: bool,
}

impl Params {
    fn wants(&self, role: Role) -> bool {
        match role {
            Role::Ro => self.ro,
            Role::Rw => self.rw,
            Role::MirrorPuller | Role::MirrorPusher => self.mirrorer,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ro: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rw: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_puller: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_pusher: Option<User>,
}

impl State {
    pub fn get(&self, role: Role) -> Option<&User> {
        self.slot(role).as_ref()
    }

    fn slot(&self, role: Role) -> &Option<User> {
        match role {
            Role::Ro => &self.ro,
            Role::Rw => &self.rw,
            Role::MirrorPuller => &self.mirror_puller,
            Role::MirrorPusher => &self.mirror_pusher,
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<User> {
        match role {
            Role::Ro => &mut self.ro,
            Role::Rw => &mut self.rw,
            Role::MirrorPuller => &mut self.mirror_puller,
            Role::MirrorPusher => &mut self.mirror_pusher,
        }
    }

    pub fn params(&self) -> Params {
        Params {
            ro: self.ro.is_some(),
            rw: self.rw.is_some(),
            mirrorer: self.mirror_puller.is_some() && self.mirror_pusher.is_some(),
        }
    }

    /// A requested role that is missing after [`State::process`]
    pub fn require(&self, role: Role) -> Result<&User> {
        self.get(role)
            .ok_or_else(|| Error::ValidationError(format!("user {role} is not initialized")))
    }

    /// Reconcile the users with the requested roles.
    ///
    /// `secrets` holds the current `registry-user-*` secrets keyed by role.
    /// For each requested role the first valid source wins: the in-state
    /// user, the stored secret, then a freshly generated one. Roles that are
    /// not requested are cleared and their secrets removed.
    pub fn process(
        &mut self,
        params: Params,
        secrets: &BTreeMap<String, SecretData>,
        patches: &mut PatchCollector,
    ) -> Result<()> {
        for role in Role::ALL {
            let stored = secrets.get(role.as_str());
            let secret_name = constants::user_secret_name(role.as_str());

            if !params.wants(role) {
                if self.slot(role).is_some() {
                    debug!(role = %role, "Removing registry user");
                }
                *self.slot_mut(role) = None;
                if stored.is_some() {
                    patches.delete_secret(secret_name);
                }
                continue;
            }

            let mut user = match self.slot(role).clone().filter(User::is_valid) {
                Some(user) => user,
                None => match stored.map(User::from_secret_data).filter(User::is_valid) {
                    Some(user) => user,
                    None => {
                        info!(role = %role, "Generating registry user");
                        User::generate(role.as_str())?
                    }
                },
            };
            user.ensure_password_hash()?;

            let desired = user.to_secret_data();
            if !same_data(stored, &desired) {
                patches.apply_secret(owned_secret(
                    &secret_name,
                    Some(constants::USER_SECRET_TYPE),
                    &[],
                    desired,
                ));
            }
            *self.slot_mut(role) = Some(user);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_name("mirror-puller").is_ok());
        assert!(validate_name("ro").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("-ro").is_err());
        assert!(validate_name("ro-").is_err());
        assert!(validate_name("Ro").is_err());
        assert!(validate_name("ro--rw").is_ok());
        assert!(validate_name("ro_rw").is_err());
        assert!(validate_name("ro\n").is_err());
        assert!(validate_name(&"a".repeat(MAX_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn mirrorer_materializes_both_roles() {
        let mut state = State::default();
        let mut patches = PatchCollector::new();
        state
            .process(
                Params {
                    ro: true,
                    rw: true,
                    mirrorer: true,
                },
                &BTreeMap::new(),
                &mut patches,
            )
            .unwrap();

        for role in Role::ALL {
            let user = state.get(role).unwrap();
            assert_eq!(user.name, role.as_str());
            assert_eq!(user.password.len(), PASSWORD_LENGTH);
            assert!(user.is_password_hash_valid());
        }
        assert_eq!(patches.applied_secret_names().len(), 4);
        assert!(state.params().mirrorer);
    }

    #[test]
    fn process_is_idempotent() {
        let mut state = State::default();
        let params = Params {
            ro: true,
            ..Default::default()
        };
        state
            .process(params, &BTreeMap::new(), &mut PatchCollector::new())
            .unwrap();

        let secrets = BTreeMap::from([(
            "ro".to_string(),
            state.ro.as_ref().unwrap().to_secret_data(),
        )]);
        let before = state.clone();
        let mut patches = PatchCollector::new();
        state.process(params, &secrets, &mut patches).unwrap();

        assert_eq!(state, before);
        assert!(patches.is_empty());
    }

    #[test]
    fn stored_user_with_stale_hash_is_rehashed() {
        let mut user = User::generate("rw").unwrap();
        user.hashed_password = bcrypt::hash("other", 4).unwrap();
        let secrets = BTreeMap::from([("rw".to_string(), user.to_secret_data())]);

        let mut state = State::default();
        let mut patches = PatchCollector::new();
        state
            .process(
                Params {
                    rw: true,
                    ..Default::default()
                },
                &secrets,
                &mut patches,
            )
            .unwrap();

        let rw = state.rw.unwrap();
        assert_eq!(rw.password, user.password);
        assert!(rw.is_password_hash_valid());
        assert_eq!(patches.applied_secret_names(), vec!["registry-user-rw"]);
    }

    #[test]
    fn unrequested_roles_are_removed() {
        let mut state = State::default();
        state
            .process(
                Params {
                    ro: true,
                    rw: true,
                    mirrorer: false,
                },
                &BTreeMap::new(),
                &mut PatchCollector::new(),
            )
            .unwrap();
        let secrets = BTreeMap::from([
            ("ro".to_string(), state.ro.clone().unwrap().to_secret_data()),
            ("rw".to_string(), state.rw.clone().unwrap().to_secret_data()),
        ]);

        let mut patches = PatchCollector::new();
        state
            .process(
                Params {
                    ro: true,
                    ..Default::default()
                },
                &secrets,
                &mut patches,
            )
            .unwrap();

        assert!(state.rw.is_none());
        assert_eq!(patches.deleted_secret_names(), vec!["registry-user-rw"]);
    }
}
