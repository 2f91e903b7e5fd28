//! CRUD operations for [`Contact`] records, plus the async [`ContactStore`]
//! facade the service talks to.

use chrono::{DateTime, Utc};
use murmur_shared::constants::MAX_CONTACT_NAME_LEN;
use murmur_shared::types::{Contact, PublicKey};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::database::{conversion_error, Database, SharedDatabase};
use crate::error::{Result, StoreError};

const CONTACT_COLUMNS: &str = "id, name, public_key, avatar, created_at";

impl Database {
    // ------------------------------------------------------------------
    // Create / update
    // ------------------------------------------------------------------

    /// Insert a new contact, or update name, avatar and key of an existing
    /// id. Returns the stored record.
    pub fn save_contact(&mut self, contact: &Contact) -> Result<Contact> {
        let name = validate_name(&contact.name)?;
        let key_hex = contact.public_key.to_hex();

        let tx = self.conn_mut().transaction()?;

        let owner: Option<String> = tx
            .query_row(
                "SELECT id FROM contacts WHERE public_key = ?1",
                params![key_hex],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(owner) = owner {
            let owner = Uuid::parse_str(&owner).map_err(|e| conversion_error(0, e))?;
            if owner != contact.id {
                return Err(StoreError::DuplicateKey(owner));
            }
        }

        let updated = tx.execute(
            "UPDATE contacts SET name = ?2, public_key = ?3, avatar = ?4 WHERE id = ?1",
            params![contact.id.to_string(), name, key_hex, contact.avatar],
        )?;
        if updated == 0 {
            tx.execute(
                "INSERT INTO contacts (id, name, public_key, avatar, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    contact.id.to_string(),
                    name,
                    key_hex,
                    contact.avatar,
                    contact.created_at.to_rfc3339(),
                ],
            )?;
        }

        let stored = tx.query_row(
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
            params![contact.id.to_string()],
            row_to_contact,
        )?;
        tx.commit()?;

        Ok(stored)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_contact(&self, id: Uuid) -> Result<Contact> {
        self.conn()
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
                params![id.to_string()],
                row_to_contact,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn find_contact_by_key(&self, key: &PublicKey) -> Result<Option<Contact>> {
        let contact = self
            .conn()
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE public_key = ?1"),
                params![key.to_hex()],
                row_to_contact,
            )
            .optional()?;
        Ok(contact)
    }

    /// All contacts in insertion order.
    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY seq ASC"
        ))?;

        let rows = stmt.query_map([], row_to_contact)?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row?);
        }
        Ok(contacts)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Remove a directory entry. Messages exchanged with the contact stay.
    pub fn delete_contact(&mut self, id: Uuid) -> Result<Contact> {
        let tx = self.conn_mut().transaction()?;
        let contact = tx
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
                params![id.to_string()],
                row_to_contact,
            )
            .optional()?
            .ok_or(StoreError::NotFound)?;
        tx.execute("DELETE FROM contacts WHERE id = ?1", params![id.to_string()])?;
        tx.commit()?;
        Ok(contact)
    }
}

fn validate_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(StoreError::Validation("contact name is empty".into()));
    }
    if trimmed.chars().count() > MAX_CONTACT_NAME_LEN {
        return Err(StoreError::Validation(format!(
            "contact name longer than {MAX_CONTACT_NAME_LEN} characters"
        )));
    }
    Ok(trimmed)
}

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    let id_str: String = row.get(0)?;
    let name: String = row.get(1)?;
    let key_hex: String = row.get(2)?;
    let avatar: Option<String> = row.get(3)?;
    let created_str: String = row.get(4)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| conversion_error(0, e))?;
    let public_key = PublicKey::from_hex(&key_hex).map_err(|e| conversion_error(2, e))?;
    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(4, e))?;

    Ok(Contact {
        id,
        name,
        public_key,
        avatar,
        created_at,
    })
}

/// Async view of the contact directory over the shared connection.
#[derive(Clone)]
pub struct ContactStore {
    db: SharedDatabase,
}

impl ContactStore {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    pub async fn save(&self, contact: &Contact) -> Result<Contact> {
        let saved = self.db.lock().await.save_contact(contact)?;
        tracing::debug!(contact = %saved.id, key = %saved.public_key.short(), "contact saved");
        Ok(saved)
    }

    pub async fn get(&self, id: Uuid) -> Result<Contact> {
        self.db.lock().await.get_contact(id)
    }

    pub async fn find_by_key(&self, key: &PublicKey) -> Result<Option<Contact>> {
        self.db.lock().await.find_contact_by_key(key)
    }

    pub async fn delete(&self, id: Uuid) -> Result<Contact> {
        let removed = self.db.lock().await.delete_contact(id)?;
        tracing::debug!(contact = %id, "contact deleted");
        Ok(removed)
    }

    pub async fn list(&self) -> Result<Vec<Contact>> {
        self.db.lock().await.list_contacts()
    }
}
