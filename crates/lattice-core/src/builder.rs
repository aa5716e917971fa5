//! Builds outgoing message envelopes.

use std::sync::Arc;

use lattice_shared::crypto::{self, SymmetricKey};
use lattice_shared::error::LatticeError;
use lattice_shared::identity::Identity;
use lattice_shared::protocol::{Content, Message};
use lattice_shared::types::{MessageId, NodeId};

pub struct MessageBuilder {
    local: NodeId,
    identity: Arc<Identity>,
}

impl MessageBuilder {
    pub fn new(local: NodeId, identity: Arc<Identity>) -> Self {
        Self { local, identity }
    }

    /// Assemble an envelope: encode the content, seal it with the session
    /// key when one is given, and sign the resulting body.
    pub fn build(
        &self,
        id: MessageId,
        to: NodeId,
        content: &Content,
        session_key: Option<&SymmetricKey>,
    ) -> Result<Message, LatticeError> {
        let mut body = content.encode()?;
        if let Some(key) = session_key {
            body = crypto::encrypt(key, &body)?;
        }
        let signature = Some(self.identity.sign(&body));

        Ok(Message {
            id,
            from: self.local,
            to,
            ty: content.message_type(),
            body,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_shared::identity::verify_signature;
    use lattice_shared::protocol::MessageType;

    #[test]
    fn test_plain_body_is_signed_and_decodable() {
        let identity = Arc::new(Identity::generate());
        let builder = MessageBuilder::new(identity.node_id(), identity.clone());

        let content = Content::Hello(lattice_shared::protocol::HelloInfo {
            nickname: "alice".to_string(),
        });
        let msg = builder
            .build(MessageId::new(), NodeId::from_key_material(b"to"), &content, None)
            .unwrap();

        assert_eq!(msg.ty, MessageType::Hello);
        assert_eq!(msg.from, identity.node_id());
        verify_signature(
            &identity.public().signing_key,
            &msg.body,
            msg.signature.as_ref().unwrap(),
        )
        .unwrap();
        assert!(Content::decode(msg.ty, &msg.body).is_ok());
    }

    #[test]
    fn test_sealed_body_requires_key() {
        let identity = Arc::new(Identity::generate());
        let builder = MessageBuilder::new(identity.node_id(), identity);

        let key = crypto::generate_symmetric_key();
        let content = Content::PrivateMessage("psst".to_string());
        let msg = builder
            .build(
                MessageId::new(),
                NodeId::from_key_material(b"to"),
                &content,
                Some(&key),
            )
            .unwrap();

        // Ciphertext must not decode directly.
        assert!(Content::decode(msg.ty, &msg.body).is_err());

        let plain = crypto::decrypt(&key, &msg.body).unwrap();
        assert!(matches!(
            Content::decode(msg.ty, &plain).unwrap(),
            Content::PrivateMessage(text) if text == "psst"
        ));
    }
}
