//! Per-message-type handlers.
//!
//! Called by the routing engine's dispatch step after the trust, locality
//! and decryption checks have passed. Handlers validate content shape,
//! apply the smallest state change that satisfies the message, and raise
//! the matching event. Malformed content is our problem to log, never the
//! sender's to hear about.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use lattice_net::Destination;
use lattice_shared::constants::PROTOCOL_VERSION;
use lattice_shared::crypto;
use lattice_shared::protocol::{
    AuthInfo, ChatAction, ChatInviteInfo, ChatMessageContent, Content, KeyInfo, MemoInfo,
    MeshError, NetworkState, NodeInfo, RequestFileInfo, SearchRequestInfo, SearchResultInfo,
    SharedFileListing,
};
use lattice_shared::types::MessageId;
use lattice_transfer::PieceManifest;
use uuid::Uuid;

use crate::connection::{ConnectionState, LocalNodeConnection};
use crate::events::NetworkEvent;
use crate::network::Network;
use crate::node::Node;

pub(crate) fn dispatch(
    network: &Arc<Network>,
    connection: &Arc<LocalNodeConnection>,
    from: &Arc<Node>,
    content: Content,
) {
    match content {
        Content::Ping(timestamp) => process_ping(network, from, timestamp),
        Content::Pong(timestamp) => process_pong(connection, timestamp),
        Content::Auth(info) => process_auth(network, connection, from, info, false),
        Content::AuthReply(info) => process_auth(network, connection, from, info, true),
        Content::Hello(info) => process_nickname_change(network, from, &info.nickname),
        Content::RequestKey => process_request_key(network, from),
        Content::MyKey(info) => process_my_key(network, from, info),
        Content::NewSessionKey(blob) => process_new_session_key(network, from, &blob),
        Content::RequestInfo => process_request_info(network, from),
        Content::MyInfo(info) => process_my_info(network, from, info),
        Content::NonCriticalError(error) => process_non_critical_error(network, from, error),
        // Critical errors are consumed by the dispatch loop before
        // handlers run.
        Content::CriticalError(_) => {}
        Content::SearchRequest(request) => process_search_request(network, from, request),
        Content::SearchResult(result) => process_search_result(network, from, result),
        Content::RequestFile(request) => process_request_file(network, from, request),
        Content::ConnectionDown(edge) => network.process_connection_down(edge),
        Content::JoinChat(action) => process_join_chat(network, from, action),
        Content::LeaveChat(action) => process_leave_chat(network, from, action),
        Content::ChatInvite(invite) => process_chat_invite(network, from, invite),
        Content::ChatroomMessage(message) => process_chat_message(network, from, message),
        Content::PrivateMessage(text) => process_private_message(network, from, text),
        Content::Ready(state) => process_ready(network, connection, from, state),
        Content::AddMemo(memo) => process_add_memo(network, from, memo),
        Content::DeleteMemo(id) => process_delete_memo(network, from, id),
        Content::RequestDirListing(path) => process_request_dir_listing(network, from, &path),
        Content::RespondDirListing(listing) => process_respond_dir_listing(network, from, listing),
        Content::Ack(acked) => process_ack(network, from, acked),
        Content::RequestFileDetails(path) => process_request_file_details(network, from, &path),
        Content::FileDetails(listing) => process_file_details(network, from, listing),
        Content::RequestAvatar => process_request_avatar(network, from),
        Content::Avatar(data) => process_avatar(network, from, data),
        Content::Test => {}
    }
}

fn process_ping(network: &Arc<Network>, from: &Arc<Node>, timestamp: u64) {
    if let Err(e) = network.send_pong(&from.id(), timestamp) {
        warn!(network = %network.name(), error = %e, "Failed to answer ping");
    }
}

fn process_pong(connection: &Arc<LocalNodeConnection>, timestamp: u64) {
    if let Some(latency) = connection.received_pong(timestamp) {
        debug!(connection = %connection.describe(), latency_ms = latency.as_millis() as u64, "Pong");
    }
}

/// The connection handshake sub-machine: mutual trust, version and
/// duplicate checks, then `Securing` and onwards to `Ready`.
fn process_auth(
    network: &Arc<Network>,
    connection: &Arc<LocalNodeConnection>,
    from: &Arc<Node>,
    info: AuthInfo,
    is_reply: bool,
) {
    if !network.is_trusted(&from.id()) {
        refuse_connection(network, connection, from, MeshError::NotTrusted);
        return;
    }

    if info.protocol_version != PROTOCOL_VERSION {
        refuse_connection(
            network,
            connection,
            from,
            MeshError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: info.protocol_version,
            },
        );
        return;
    }

    if connection.remote_node_id().is_none() {
        if let Err(e) = network.bind_connection_remote(connection, from.id()) {
            debug!(network = %network.name(), error = %e, "Rejecting duplicate connection");
            refuse_connection(network, connection, from, MeshError::AlreadyConnected);
            return;
        }
    }

    process_nickname_change(network, from, &info.nickname);
    connection.set_state(ConnectionState::Securing);

    if !is_reply {
        // Responder: identify ourselves back.
        let reply = network.make_message(
            from.id(),
            Content::AuthReply(AuthInfo {
                protocol_version: PROTOCOL_VERSION,
                nickname: network.local_node().nickname(),
            }),
        );
        match reply {
            Ok(message) => {
                if let Err(e) = connection.send_message(message) {
                    warn!(network = %network.name(), error = %e, "Failed to send auth reply");
                }
            }
            Err(e) => warn!(network = %network.name(), error = %e, "Failed to build auth reply"),
        }
    } else {
        // Initiator: authentication is done, announce readiness.
        send_ready(network, connection, from);
    }
}

fn refuse_connection(
    network: &Arc<Network>,
    connection: &Arc<LocalNodeConnection>,
    from: &Arc<Node>,
    error: MeshError,
) {
    info!(
        network = %network.name(),
        node = %from.id().short(),
        error = %error,
        "Refusing connection"
    );
    if let Ok(message) = network.make_message(from.id(), Content::CriticalError(error)) {
        let _ = connection.send_message(message);
    }
    connection.disconnect();
    network.handle_connection_closed(connection);
}

fn send_ready(network: &Arc<Network>, connection: &Arc<LocalNodeConnection>, from: &Arc<Node>) {
    let state = network.network_state();
    match network.make_message(from.id(), Content::Ready(state)) {
        Ok(message) => {
            if let Err(e) = connection.send_message(message) {
                warn!(network = %network.name(), error = %e, "Failed to send ready");
            }
        }
        Err(e) => warn!(network = %network.name(), error = %e, "Failed to build ready"),
    }
}

fn process_ready(
    network: &Arc<Network>,
    connection: &Arc<LocalNodeConnection>,
    from: &Arc<Node>,
    state: NetworkState,
) {
    if connection.state() == ConnectionState::Ready {
        debug!(network = %network.name(), "Duplicate ready ignored");
        return;
    }

    network.append_network_state(state);

    if connection.incoming() {
        // The initiator sent Ready first; complete the exchange.
        send_ready(network, connection, from);
    }

    connection.set_state(ConnectionState::Ready);
    info!(
        network = %network.name(),
        node = %from.nickname(),
        connection = %connection.describe(),
        "Connection ready"
    );
    network.events().publish(NetworkEvent::ConnectionReady {
        network_id: network.id().to_string(),
        node: from.id(),
    });

    if network.is_trusted(&from.id()) && !from.finished_key_exchange() {
        network.begin_key_exchange(from);
    }
}

fn process_nickname_change(network: &Arc<Network>, node: &Arc<Node>, nickname: &str) {
    if nickname.is_empty() || node.nickname() == nickname {
        return;
    }
    let old = node.set_nickname(nickname);
    if old != nickname {
        info!(network = %network.name(), old = %old, new = %nickname, "Nickname changed");
        network.events().publish(NetworkEvent::NodeInfoUpdated {
            network_id: network.id().to_string(),
            node: node.id(),
            old_nickname: old,
            nickname: nickname.to_string(),
        });
    }
}

fn process_request_key(network: &Arc<Network>, from: &Arc<Node>) {
    if let Err(e) = network.send_my_key(&from.id()) {
        warn!(network = %network.name(), error = %e, "Failed to send our key");
    }
}

fn process_my_key(network: &Arc<Network>, from: &Arc<Node>, key: KeyInfo) {
    // Keys are imported by the application, out-of-band; just surface it.
    if key.public.node_id() != from.id() {
        warn!(
            network = %network.name(),
            from = %from.id().short(),
            "Received key does not derive the sender's node ID"
        );
        return;
    }
    network.events().publish(NetworkEvent::ReceivedKey {
        network_id: network.id().to_string(),
        from: from.id(),
        key,
    });
}

fn process_new_session_key(network: &Arc<Network>, from: &Arc<Node>, blob: &[u8]) {
    let opened = match crypto::open(network.identity().exchange_secret(), blob) {
        Ok(opened) => opened,
        Err(e) => {
            warn!(
                network = %network.name(),
                from = %from.id().short(),
                error = %e,
                "Could not open sealed session key"
            );
            return;
        }
    };

    let key: [u8; 32] = match opened.try_into() {
        Ok(key) => key,
        Err(_) => {
            warn!(network = %network.name(), from = %from.id().short(), "Session key has wrong length");
            return;
        }
    };

    from.store_remote_key(key);
    debug!(network = %network.name(), from = %from.id().short(), "Stored peer session key");

    if from.finished_key_exchange() {
        info!(
            network = %network.name(),
            node = %from.nickname(),
            "Secure communication channel established"
        );
    }

    // Make sure they end up with our key too.
    network.begin_key_exchange(from);
}

fn process_request_info(network: &Arc<Network>, from: &Arc<Node>) {
    if let Err(e) = network.send_info_to_trusted_node(&from.id()) {
        warn!(network = %network.name(), error = %e, "Failed to answer info request");
    }
}

fn process_my_info(network: &Arc<Network>, from: &Arc<Node>, info: NodeInfo) {
    process_nickname_change(network, from, &info.nickname);
    from.set_avatar_size(info.avatar_size);
    from.set_share_stats(info.file_count, info.byte_count);
    from.set_destinations(
        info.destinations
            .iter()
            .map(Destination::from_info)
            .filter(|d| d.can_connect())
            .collect(),
    );
}

fn process_non_critical_error(network: &Arc<Network>, from: &Arc<Node>, error: MeshError) {
    warn!(network = %network.name(), from = %from.id().short(), error = %error, "Received non-critical error");
    network
        .events()
        .publish(NetworkEvent::ReceivedNonCriticalError {
            network_id: network.id().to_string(),
            from: from.id(),
            error,
        });
}

fn process_search_request(network: &Arc<Network>, from: &Arc<Node>, request: SearchRequestInfo) {
    let (files, directories) = network.share_index().search(&request.query);
    if files.is_empty() && directories.is_empty() {
        return;
    }

    let reply = SearchResultInfo {
        search_id: request.id,
        files,
        directories,
    };
    match network.make_message(from.id(), Content::SearchResult(reply)) {
        Ok(message) => {
            if let Err(e) = network.send_routed_message(message) {
                warn!(network = %network.name(), error = %e, "Failed to send search reply");
            }
        }
        Err(e) => warn!(network = %network.name(), error = %e, "Failed to build search reply"),
    }
}

fn process_search_result(network: &Arc<Network>, from: &Arc<Node>, result: SearchResultInfo) {
    network.events().publish(NetworkEvent::ReceivedSearchResult {
        network_id: network.id().to_string(),
        from: from.id(),
        result,
    });
}

fn process_request_file(network: &Arc<Network>, from: &Arc<Node>, request: RequestFileInfo) {
    let indexed = match network.share_index().get_file(&request.full_path) {
        Some(indexed) => indexed,
        None => {
            let _ = network.send_non_critical_error(
                &from.id(),
                MeshError::FileNotFound(request.full_path.clone()),
            );
            return;
        }
    };

    let (manager, messenger) = match (network.transfer_manager(), network.transfer_messenger()) {
        (Some(manager), Some(messenger)) => (manager, messenger),
        _ => {
            warn!(network = %network.name(), "File requested but no transfer manager attached");
            return;
        }
    };

    let manifest = PieceManifest {
        info_hash: indexed.listing.info_hash.clone(),
        name: indexed.listing.name.clone(),
        full_path: indexed.listing.full_path.clone(),
        size: indexed.listing.size,
        piece_length: if indexed.listing.piece_length == 0 {
            lattice_transfer::provider::DEFAULT_PIECE_LENGTH
        } else {
            indexed.listing.piece_length
        },
        pieces: indexed.listing.pieces.clone(),
        local_path: Some(indexed.local_path),
    };

    match manager.start_transfer(&messenger, from.id(), manifest) {
        Ok(transfer) => {
            debug!(
                network = %network.name(),
                transfer = %transfer.id(),
                file = %request.full_path,
                "Upload requested"
            );
        }
        Err(e) => {
            warn!(network = %network.name(), error = %e, "Could not start requested upload");
            let _ = network
                .send_non_critical_error(&from.id(), MeshError::Transfer(e.to_string()));
        }
    }
}

fn process_join_chat(network: &Arc<Network>, from: &Arc<Node>, action: ChatAction) {
    let room = network.get_or_create_chat_room(&action.room_id, &action.room_name);
    if room.add_member(from.id()) {
        network.raise_joined_chat(&room, from.id());
    }
}

fn process_leave_chat(network: &Arc<Network>, from: &Arc<Node>, action: ChatAction) {
    let room = match network.get_chat_room(&action.room_id) {
        Some(room) => room,
        None => return,
    };
    if room.remove_member(&from.id()) {
        network.raise_left_chat(&room, from.id());
    }
    network.drop_chat_room_if_empty(&action.room_id);
}

fn process_chat_invite(network: &Arc<Network>, from: &Arc<Node>, invite: ChatInviteInfo) {
    if network.get_chat_room(&invite.room_id).is_none() {
        warn!(
            network = %network.name(),
            room = %invite.room_name,
            "Ignored invitation for non-existent chat room"
        );
        return;
    }
    network.events().publish(NetworkEvent::ChatInvite {
        network_id: network.id().to_string(),
        from: from.id(),
        room_id: invite.room_id,
        room_name: invite.room_name,
        message: invite.message,
        password: invite.password,
    });
}

fn process_chat_message(network: &Arc<Network>, from: &Arc<Node>, message: ChatMessageContent) {
    let room = match network.get_chat_room(&message.room_id) {
        Some(room) => room,
        None => {
            debug!(network = %network.name(), "Chat message for unknown room");
            return;
        }
    };

    let text = if message.encrypted {
        match room.decrypt_message(&message.text) {
            Ok(text) => text,
            Err(_) => {
                // We are not in on the password; not our conversation.
                debug!(network = %network.name(), room = %room.name(), "Undecryptable chat message");
                return;
            }
        }
    } else {
        match String::from_utf8(message.text) {
            Ok(text) => text,
            Err(_) => {
                warn!(network = %network.name(), room = %room.name(), "Chat message is not UTF-8");
                return;
            }
        }
    };

    network.events().publish(NetworkEvent::ChatMessage {
        network_id: network.id().to_string(),
        room_id: room.id().to_string(),
        from: from.id(),
        text,
    });
}

fn process_private_message(network: &Arc<Network>, from: &Arc<Node>, text: String) {
    network.events().publish(NetworkEvent::PrivateMessage {
        network_id: network.id().to_string(),
        from: from.id(),
        text,
    });
}

fn process_add_memo(network: &Arc<Network>, from: &Arc<Node>, memo: MemoInfo) {
    if memo.author != from.id() {
        warn!(
            network = %network.name(),
            from = %from.id().short(),
            "Memo author does not match its sender"
        );
        return;
    }
    network.add_or_update_memo(memo);
}

fn process_delete_memo(network: &Arc<Network>, from: &Arc<Node>, id: Uuid) {
    let memo = match network.get_memo(&id) {
        Some(memo) => memo,
        None => return,
    };
    if memo.author != from.id() {
        warn!(
            network = %network.name(),
            from = %from.id().short(),
            "Refusing memo deletion by a non-author"
        );
        return;
    }
    network.remove_memo(&memo);
}

fn process_request_dir_listing(network: &Arc<Network>, from: &Arc<Node>, path: &str) {
    match network.share_index().get_directory(path) {
        Some(listing) => {
            match network.make_message(from.id(), Content::RespondDirListing(listing)) {
                Ok(message) => {
                    if let Err(e) = network.send_routed_message(message) {
                        warn!(network = %network.name(), error = %e, "Failed to send dir listing");
                    }
                }
                Err(e) => warn!(network = %network.name(), error = %e, "Failed to build dir listing"),
            }
        }
        None => {
            let _ = network
                .send_non_critical_error(&from.id(), MeshError::FileNotFound(path.to_string()));
        }
    }
}

fn process_respond_dir_listing(
    network: &Arc<Network>,
    from: &Arc<Node>,
    listing: lattice_shared::protocol::SharedDirectoryInfo,
) {
    network
        .share_index()
        .process_dir_listing(network.id(), &from.id(), &listing);
    network.events().publish(NetworkEvent::ReceivedDirListing {
        network_id: network.id().to_string(),
        from: from.id(),
        listing,
    });
}

fn process_ack(network: &Arc<Network>, from: &Arc<Node>, acked: MessageId) {
    match network.take_ack_handler(&acked) {
        Some(handler) => handler(Utc::now()),
        None => {
            debug!(
                network = %network.name(),
                from = %from.id().short(),
                message = %acked,
                "Ack without a waiting handler"
            );
        }
    }
}

fn process_request_file_details(network: &Arc<Network>, from: &Arc<Node>, path: &str) {
    match network.share_index().get_file(path) {
        Some(indexed) => {
            if let Err(e) = network.send_file_details(&from.id(), indexed.listing) {
                warn!(network = %network.name(), error = %e, "Failed to send file details");
            }
        }
        None => {
            let _ = network
                .send_non_critical_error(&from.id(), MeshError::FileNotFound(path.to_string()));
        }
    }
}

fn process_file_details(network: &Arc<Network>, from: &Arc<Node>, listing: SharedFileListing) {
    network
        .share_index()
        .process_file_details(network.id(), &from.id(), &listing);

    if let Some(manager) = network.transfer_manager() {
        manager.on_file_details(&from.id(), &listing);
    }

    network.events().publish(NetworkEvent::ReceivedFileDetails {
        network_id: network.id().to_string(),
        from: from.id(),
        details: listing,
    });
}

fn process_request_avatar(network: &Arc<Network>, from: &Arc<Node>) {
    match network.send_avatar(&from.id()) {
        Ok(()) => {}
        Err(e) => debug!(network = %network.name(), error = %e, "Not sending avatar"),
    }
}

fn process_avatar(network: &Arc<Network>, from: &Arc<Node>, data: Vec<u8>) {
    from.set_avatar_size(data.len() as u64);
    network.events().publish(NetworkEvent::ReceivedAvatar {
        network_id: network.id().to_string(),
        from: from.id(),
        data,
    });
}
