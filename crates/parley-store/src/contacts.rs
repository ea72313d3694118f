//! Contact directory records.

use chrono::{DateTime, Utc};

use parley_shared::PeerIdentity;

use crate::database::Store;
use crate::error::Result;
use crate::keys;
use crate::models::Contact;

impl Store {
    /// Insert a contact unless one with the same id exists.
    ///
    /// Returns `false` (and leaves the stored record untouched) when the id
    /// is already known.
    pub fn add_contact(&self, contact: &Contact) -> Result<bool> {
        let key = keys::contact(&contact.id);
        if self.contains(&key)? {
            return Ok(false);
        }
        self.put_json(&key, contact)?;
        Ok(true)
    }

    pub fn get_contact(&self, id: &PeerIdentity) -> Result<Contact> {
        self.get_json(&keys::contact(id))
    }

    pub fn update_contact(&self, contact: &Contact) -> Result<()> {
        self.put_json(&keys::contact(&contact.id), contact)
    }

    /// All contacts, ordered by peer id.
    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        self.scan_prefix(keys::CONTACT_PREFIX)?
            .into_iter()
            .map(|(_, value)| -> Result<Contact> { Ok(serde_json::from_slice(&value)?) })
            .collect()
    }

    /// Record a successful session with a contact.
    pub fn touch_contact(&self, id: &PeerIdentity, at: DateTime<Utc>) -> Result<Contact> {
        let mut contact = self.get_contact(id)?;
        contact.last_seen = Some(at);
        self.update_contact(&contact)?;
        Ok(contact)
    }

    /// Move `address` to the front of a contact's hint list.
    pub fn remember_contact_address(&self, id: &PeerIdentity, address: &str) -> Result<Contact> {
        let mut contact = self.get_contact(id)?;
        contact.addresses.retain(|a| a != address);
        contact.addresses.insert(0, address.to_string());
        self.update_contact(&contact)?;
        Ok(contact)
    }
}
