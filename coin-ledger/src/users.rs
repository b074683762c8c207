//! User directory
//!
//! Holds the identity rows the ledger needs for ownership checks. Credential
//! hashing happens upstream; only the resulting hash is stored.

use crate::{
    storage::{LedgerBatch, Sequence, Storage, CF_USERS, CF_USER_NAMES},
    types::{User, UserId},
    Error, Result,
};
use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Registered users
pub struct UserDirectory {
    storage: Arc<Storage>,
    ids: Sequence,
    // Serialises the unique-name check with the insert
    registration: Mutex<()>,
}

impl UserDirectory {
    /// Open over existing storage
    pub fn new(storage: Arc<Storage>) -> Result<Self> {
        let ids = Sequence::resume_persisted(&storage, CF_USERS)?;
        Ok(Self {
            storage,
            ids,
            registration: Mutex::new(()),
        })
    }

    /// Register a user on its own
    pub fn register(&self, user_name: &str, password_hash: &str) -> Result<User> {
        let mut batch = self.storage.batch();
        let (user, _guard) = self.stage_register(&mut batch, user_name, password_hash)?;
        self.storage.commit(batch)?;

        tracing::info!(user_id = %user.id, user_name = %user.user_name, "User registered");
        Ok(user)
    }

    /// Stage a new user into `batch`
    ///
    /// The returned guard keeps the name reserved; hold it until the batch
    /// is committed.
    pub(crate) fn stage_register(
        &self,
        batch: &mut LedgerBatch<'_>,
        user_name: &str,
        password_hash: &str,
    ) -> Result<(User, MutexGuard<'_, ()>)> {
        let user_name = user_name.trim();
        if user_name.is_empty() {
            return Err(Error::InvalidInput("User name must not be empty".to_string()));
        }
        if password_hash.is_empty() {
            return Err(Error::InvalidInput(
                "Password hash must not be empty".to_string(),
            ));
        }

        let guard = self.registration.lock();
        if self.storage.contains(CF_USER_NAMES, user_name.as_bytes())? {
            return Err(Error::DuplicateUser(user_name.to_string()));
        }

        let user = User {
            id: UserId::new(self.ids.next()),
            user_name: user_name.to_string(),
            password_hash: password_hash.to_string(),
            created_at: Utc::now(),
        };

        batch.put(CF_USERS, &user.id.to_key(), &user)?;
        batch.put_u64(CF_USER_NAMES, user.user_name.as_bytes(), user.id.get())?;
        Sequence::stage_high_water(batch, CF_USERS, user.id.get())?;

        Ok((user, guard))
    }

    /// Get user by ID
    pub fn get_user(&self, user_id: UserId) -> Result<User> {
        self.storage
            .get(CF_USERS, &user_id.to_key())?
            .ok_or(Error::UnknownUser(user_id))
    }

    /// Get user by unique name
    pub fn get_user_by_name(&self, user_name: &str) -> Result<Option<User>> {
        match self.storage.get_u64(CF_USER_NAMES, user_name.trim().as_bytes())? {
            Some(id) => self.get_user(UserId::new(id)).map(Some),
            None => Ok(None),
        }
    }

    /// Whether the user exists
    pub fn exists(&self, user_id: UserId) -> Result<bool> {
        self.storage.contains(CF_USERS, &user_id.to_key())
    }

    /// Stage removal of the user row and its name index
    ///
    /// Wallet and balance rows are removed by the wallet store in the same
    /// batch.
    pub(crate) fn stage_delete(&self, batch: &mut LedgerBatch<'_>, user: &User) -> Result<()> {
        batch.delete(CF_USERS, &user.id.to_key())?;
        batch.delete(CF_USER_NAMES, user.user_name.as_bytes())?;
        Ok(())
    }
}
