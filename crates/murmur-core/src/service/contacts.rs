//! Directory operations. Saving a contact opens its channel; deleting one
//! closes it. Message history is never touched.

use murmur_shared::types::timestamp_now;
use murmur_shared::{Contact, PublicKey};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::MessagingService;
use crate::error::{Result, ServiceError};

/// Input for creating (`id: None`) or updating a contact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactDraft {
    pub id: Option<Uuid>,
    pub name: String,
    pub public_key: PublicKey,
    pub avatar: Option<String>,
}

impl ContactDraft {
    pub fn new(name: impl Into<String>, public_key: PublicKey) -> Self {
        Self {
            id: None,
            name: name.into(),
            public_key,
            avatar: None,
        }
    }
}

impl MessagingService {
    /// All contacts in insertion order.
    pub async fn load_contacts(&self) -> Result<Vec<Contact>> {
        Ok(self.inner.contacts.list().await?)
    }

    pub async fn save_contact(&self, draft: ContactDraft) -> Result<Contact> {
        let inner = &self.inner;
        if draft.public_key == inner.local {
            return Err(ServiceError::Validation(
                "the local identity cannot be a contact".into(),
            ));
        }

        let _guard = inner.contact_locks.lock(&draft.public_key).await;

        let created = draft.id.is_none();
        let previous = match draft.id {
            Some(id) => Some(inner.contacts.get(id).await?),
            None => None,
        };
        let contact = Contact {
            id: draft.id.unwrap_or_else(Uuid::new_v4),
            name: draft.name,
            public_key: draft.public_key,
            avatar: draft.avatar,
            created_at: previous
                .as_ref()
                .map(|c| c.created_at)
                .unwrap_or_else(timestamp_now),
        };
        let saved = inner.contacts.save(&contact).await?;

        if let Some(old) = previous.filter(|old| old.public_key != saved.public_key) {
            inner.transport.close(&old.public_key).await;
        }
        if !self.is_shut_down() {
            inner.transport.open(&saved.public_key).await?;
        }

        info!(
            contact = %saved.id,
            peer = %saved.public_key.short(),
            created,
            "contact saved"
        );
        Ok(saved)
    }

    /// Remove a contact and cancel its channel. Its conversation stays in
    /// the message log.
    pub async fn delete_contact(&self, id: Uuid) -> Result<()> {
        let inner = &self.inner;
        let contact = inner.contacts.get(id).await?;

        let _guard = inner.contact_locks.lock(&contact.public_key).await;
        let removed = inner.contacts.delete(id).await?;
        inner.transport.close(&removed.public_key).await;

        info!(contact = %id, peer = %removed.public_key.short(), "contact deleted");
        Ok(())
    }
}
