//! Chat rooms.
//!
//! A room's identifier is the SHA-512 of its name, or of name+password for
//! protected rooms: knowing the password is what lets a client derive the
//! right ID, which doubles as the optimistic password test.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use lattice_shared::crypto;
use lattice_shared::error::{ChatError, CryptoError};
use lattice_shared::protocol::ChatRoomInfo;
use lattice_shared::types::{sha512_hex, NodeId};

pub struct ChatRoom {
    id: String,
    name: String,
    has_password: bool,
    members: RwLock<HashSet<NodeId>>,
    password: RwLock<Option<String>>,
    /// Opaque side table for UI collaborators; the core never reads it.
    properties: Mutex<HashMap<String, String>>,
}

impl ChatRoom {
    /// Derive a room ID from its name and optional password.
    pub fn derive_id(name: &str, password: Option<&str>) -> String {
        match password {
            Some(p) if !p.is_empty() => sha512_hex(&format!("{name}{p}")),
            _ => sha512_hex(name),
        }
    }

    pub fn new(id: String, name: String) -> Self {
        let has_password = Self::derive_id(&name, None) != id;
        Self {
            id,
            name,
            has_password,
            members: RwLock::new(HashSet::new()),
            password: RwLock::new(None),
            properties: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_password(&self) -> bool {
        self.has_password
    }

    /// Check a password attempt against the derived room ID.
    pub fn test_password(&self, password: Option<&str>) -> bool {
        if !self.has_password {
            return true;
        }
        Self::derive_id(&self.name, password) == self.id
    }

    pub fn set_password(&self, password: Option<String>) {
        *self.password.write().unwrap() = password;
    }

    pub fn password(&self) -> Option<String> {
        self.password.read().unwrap().clone()
    }

    pub fn add_member(&self, node: NodeId) -> bool {
        self.members.write().unwrap().insert(node)
    }

    pub fn remove_member(&self, node: &NodeId) -> bool {
        self.members.write().unwrap().remove(node)
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.read().unwrap().contains(node)
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.members.read().unwrap().iter().copied().collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.read().unwrap().len()
    }

    pub fn set_property(&self, key: &str, value: String) {
        self.properties.lock().unwrap().insert(key.to_string(), value);
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.properties.lock().unwrap().get(key).cloned()
    }

    /// Encrypt a message for a protected room.
    pub fn encrypt_message(&self, text: &str) -> Result<Vec<u8>, ChatError> {
        let password = self
            .password()
            .ok_or_else(|| ChatError::NotInRoom(self.name.clone()))?;
        let key = crypto::derive_room_key(&password, &self.id);
        crypto::encrypt(&key, text.as_bytes()).map_err(|_| ChatError::IncorrectPassword)
    }

    /// Decrypt a protected-room message with the locally known password.
    pub fn decrypt_message(&self, data: &[u8]) -> Result<String, CryptoError> {
        let password = self.password().ok_or(CryptoError::DecryptionFailed)?;
        let key = crypto::derive_room_key(&password, &self.id);
        let plain = crypto::decrypt(&key, data)?;
        String::from_utf8(plain).map_err(|_| CryptoError::DecryptionFailed)
    }

    pub fn to_info(&self) -> ChatRoomInfo {
        ChatRoomInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            users: self.members(),
            has_password: self.has_password,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_room_id() {
        let id = ChatRoom::derive_id("lobby", None);
        let room = ChatRoom::new(id.clone(), "lobby".to_string());
        assert!(!room.has_password());
        assert!(room.test_password(None));
        assert!(room.test_password(Some("anything")));
    }

    #[test]
    fn test_protected_room_password_check() {
        let id = ChatRoom::derive_id("ops", Some("sekrit"));
        let room = ChatRoom::new(id, "ops".to_string());
        assert!(room.has_password());
        assert!(room.test_password(Some("sekrit")));
        assert!(!room.test_password(Some("wrong")));
        assert!(!room.test_password(None));
    }

    #[test]
    fn test_membership() {
        let room = ChatRoom::new(ChatRoom::derive_id("lobby", None), "lobby".to_string());
        let a = NodeId::from_key_material(b"a");

        assert!(room.add_member(a));
        assert!(!room.add_member(a));
        assert!(room.contains(&a));
        assert_eq!(room.member_count(), 1);

        assert!(room.remove_member(&a));
        assert!(!room.remove_member(&a));
        assert_eq!(room.member_count(), 0);
    }

    #[test]
    fn test_message_encryption_roundtrip() {
        let id = ChatRoom::derive_id("ops", Some("sekrit"));
        let sender = ChatRoom::new(id.clone(), "ops".to_string());
        sender.set_password(Some("sekrit".to_string()));

        let receiver = ChatRoom::new(id, "ops".to_string());
        receiver.set_password(Some("sekrit".to_string()));

        let sealed = sender.encrypt_message("meet at dawn").unwrap();
        assert_eq!(receiver.decrypt_message(&sealed).unwrap(), "meet at dawn");

        receiver.set_password(Some("wrong".to_string()));
        assert!(receiver.decrypt_message(&sealed).is_err());
    }
}
