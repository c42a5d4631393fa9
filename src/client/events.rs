// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use super::{ForwardedTcpIpParams, GlobalReply, Handler, Reply, Session};
use crate::auth;
use crate::channels::{ChannelState, OpenChannelMsg, ReplyKind, Slot, StreamState};
use crate::transport::{ChannelOpenKind, ChannelRequestKind, Transport, TransportEvent};
use crate::{ChannelId, ChannelMsg, ChannelOpenFailure, Disconnect, Error};
use byteorder::{BigEndian, ByteOrder};
use cryptovec::CryptoVec;
use thrussh_keys::PublicKeyBase64;
use tokio::sync::mpsc::unbounded_channel;

impl<T: Transport> Session<T> {
    pub(crate) async fn handle_event<H: Handler>(
        &mut self,
        event: TransportEvent,
        handler: &mut H,
    ) -> Result<(), H::Error> {
        match event {
            TransportEvent::Greeting { text } => {
                debug!("server greeting: {:?}", text);
                handler.greeting(&text).await
            }
            TransportEvent::Header { identification } => {
                debug!("server identification: {:?}", identification);
                self.remote_ident = identification;
                Ok(())
            }
            TransportEvent::HostKeyCheck { key } => {
                let accepted = handler.check_server_key(&key).await?;
                self.transport.host_key_decision(accepted);
                if accepted {
                    Ok(())
                } else {
                    Err(Error::UnknownKey.into())
                }
            }
            TransportEvent::HandshakeComplete(info) => {
                debug!("handshake complete: {:?}", info);
                handler.handshake_complete(&info).await
            }
            TransportEvent::ServiceAccept { name } => {
                debug!("service accepted: {:?}", name);
                if name == "ssh-userauth" {
                    self.service_accepted = true;
                    if self.auth_method.is_some() {
                        self.emit_auth_request();
                    }
                }
                Ok(())
            }
            TransportEvent::AuthSuccess => {
                debug!("userauth success");
                self.authenticated = true;
                self.reset_keepalive();
                self.sender
                    .send(Reply::AuthSuccess)
                    .map_err(|_| Error::SendError)?;
                Ok(())
            }
            TransportEvent::AuthFailure {
                remaining,
                partial_success,
            } => {
                debug!(
                    "userauth failure, remaining {:?}, partial {:?}",
                    remaining, partial_success
                );
                self.sender
                    .send(Reply::AuthFailure {
                        remaining,
                        partial_success,
                    })
                    .map_err(|_| Error::SendError)?;
                Ok(())
            }
            TransportEvent::AuthBanner { message } => handler.auth_banner(&message).await,
            TransportEvent::AuthPkOk { .. } => {
                debug!("userauth pk_ok");
                self.request_signature();
                Ok(())
            }
            TransportEvent::AuthInfoRequest {
                name,
                instructions,
                prompts,
            } => {
                if prompts.is_empty() {
                    self.transport.auth_info_response(&[]);
                } else {
                    let answers = handler
                        .auth_keyboard_interactive(&name, &instructions, &prompts)
                        .await?;
                    self.transport.auth_info_response(&answers);
                }
                Ok(())
            }
            TransportEvent::AuthPasswdChangeReq { prompt } => {
                let old = match &self.auth_method {
                    Some(auth::Method::Password { password }) => password.clone(),
                    _ => {
                        debug!("password change request outside a password attempt");
                        return Ok(());
                    }
                };
                match handler.auth_change_password(&prompt).await? {
                    Some(new_password) => {
                        let user = self.auth_user.clone();
                        self.transport
                            .auth_password(&user, &old, Some(&new_password));
                    }
                    None => debug!("password change declined"),
                }
                Ok(())
            }
            TransportEvent::GlobalRequest { name, want_reply } => {
                info!("Unhandled global request: {:?}", name);
                if want_reply {
                    self.transport.request_failure();
                }
                Ok(())
            }
            TransportEvent::RequestSuccess { data } => {
                self.reset_keepalive();
                self.global_request_success(data);
                Ok(())
            }
            TransportEvent::RequestFailure => {
                self.reset_keepalive();
                match self.global_queue.pop_front() {
                    Some(entry) => entry.fail(Error::RequestDenied),
                    None => info!("unsolicited REQUEST_FAILURE"),
                }
                Ok(())
            }
            TransportEvent::ChannelOpenConfirmation {
                id,
                remote_id,
                window_size,
                maximum_packet_size,
            } => {
                debug!("channel_open_confirmation {:?}", id);
                let pipe = match self.channels.get_mut(id) {
                    Some(Slot::Pending(pipe)) => pipe.clone(),
                    // We've not requested this channel, close connection.
                    _ => return Err(Error::Inconsistent.into()),
                };
                pipe.send(OpenChannelMsg::Open {
                    id,
                    max_packet_size: maximum_packet_size,
                    window_size,
                })
                .unwrap_or(());
                let state = ChannelState::new(
                    remote_id,
                    window_size,
                    maximum_packet_size,
                    self.config.window_size,
                    pipe,
                );
                self.channels.update(id, state);
                Ok(())
            }
            TransportEvent::ChannelOpenFailed { id, reason, .. } => {
                debug!("channel_open_failure {:?}", id);
                match self.channels.remove(id) {
                    Some(Slot::Pending(pipe)) => {
                        pipe.send(OpenChannelMsg::OpenFailure(Error::ChannelOpenDenied(
                            reason,
                        )))
                        .unwrap_or(());
                    }
                    Some(Slot::Live(_)) => return Err(Error::Inconsistent.into()),
                    None => info!("CHANNEL_OPEN_FAILURE for unknown channel {:?}", id),
                }
                Ok(())
            }
            TransportEvent::ChannelWindowAdjust { id, amount } => {
                debug!("channel_window_adjust {:?} {:?}", id, amount);
                let transport = &mut self.transport;
                if let Some(state) = self.channels.live_mut(id) {
                    state.outgoing_window += amount;
                    state.flush_pending(transport);
                    let new_size = state.outgoing_window;
                    state.send(ChannelMsg::WindowAdjusted { new_size });
                    Ok(())
                } else {
                    Err(Error::WrongChannel.into())
                }
            }
            TransportEvent::ChannelData { id, data } => {
                let target = self.config.window_size;
                let transport = &mut self.transport;
                if let Some(state) = self.channels.live_mut(id) {
                    if state.incoming_state != StreamState::Open {
                        debug!("data on a half-closed channel {:?}", id);
                        return Ok(());
                    }
                    if state.absorb(transport, data.len(), target)? {
                        state.send(ChannelMsg::Data { data });
                    }
                } else {
                    debug!("data for unknown channel {:?}", id);
                }
                Ok(())
            }
            TransportEvent::ChannelExtendedData { id, ext, data } => {
                if ext != 1 {
                    // Only stderr is defined; everything else is
                    // protocol-ignored.
                    debug!("dropping extended data of type {:?}", ext);
                    return Ok(());
                }
                let target = self.config.window_size;
                let transport = &mut self.transport;
                if let Some(state) = self.channels.live_mut(id) {
                    if state.incoming_state != StreamState::Open {
                        debug!("extended data on a half-closed channel {:?}", id);
                        return Ok(());
                    }
                    if state.absorb(transport, data.len(), target)? {
                        state.send(ChannelMsg::ExtendedData { ext, data });
                    }
                } else {
                    debug!("extended data for unknown channel {:?}", id);
                }
                Ok(())
            }
            TransportEvent::ChannelEof { id } => {
                debug!("channel_eof {:?}", id);
                if let Some(state) = self.channels.live_mut(id) {
                    if state.incoming_state == StreamState::Open {
                        state.incoming_state = StreamState::Eof;
                        state.send(ChannelMsg::Eof);
                    }
                }
                Ok(())
            }
            TransportEvent::ChannelClose { id } => {
                debug!("channel_close {:?}", id);
                match self.channels.remove(id) {
                    Some(Slot::Live(mut state)) => {
                        if !state.close_sent {
                            self.transport.channel_close(state.remote_id);
                            state.close_sent = true;
                        }
                        state.incoming_state = StreamState::Closed;
                        // In-flight request callbacks can no longer be
                        // answered; dropping them resolves the callers.
                        state.pending_replies.clear();
                        state.send(ChannelMsg::Close);
                    }
                    Some(Slot::Pending(_)) => info!("CHANNEL_CLOSE for an unconfirmed channel"),
                    None => info!("CHANNEL_CLOSE for unknown channel {:?}", id),
                }
                Ok(())
            }
            TransportEvent::ChannelRequest { id, request } => {
                self.channel_request(id, request);
                Ok(())
            }
            TransportEvent::ChannelSuccess { id } => {
                debug!("channel_success {:?}", id);
                self.reset_keepalive();
                let popped = self
                    .channels
                    .live_mut(id)
                    .and_then(|state| state.pending_replies.pop_front());
                match popped {
                    Some((kind, tx)) => {
                        match kind {
                            ReplyKind::X11 => self.accept_x11 += 1,
                            ReplyKind::AgentForward => self.agent_forward_enabled = true,
                            ReplyKind::Generic => {}
                        }
                        if let Some(tx) = tx {
                            let _ = tx.send(true);
                        }
                    }
                    None => info!("unsolicited CHANNEL_SUCCESS on {:?}", id),
                }
                Ok(())
            }
            TransportEvent::ChannelFailure { id } => {
                debug!("channel_failure {:?}", id);
                self.reset_keepalive();
                let popped = self
                    .channels
                    .live_mut(id)
                    .and_then(|state| state.pending_replies.pop_front());
                match popped {
                    Some((_, Some(tx))) => {
                        let _ = tx.send(false);
                    }
                    Some((_, None)) => {}
                    None => info!("unsolicited CHANNEL_FAILURE on {:?}", id),
                }
                Ok(())
            }
            TransportEvent::ChannelOpen {
                remote_id,
                window_size,
                maximum_packet_size,
                kind,
            } => {
                self.incoming_channel(remote_id, window_size, maximum_packet_size, kind, handler)
                    .await
            }
            TransportEvent::Debug { message } => {
                debug!("server debug: {:?}", message);
                Ok(())
            }
            TransportEvent::Disconnect { code, description } => {
                if code == Disconnect::ByApplication as u32 {
                    debug!("server disconnected");
                    self.disconnected = true;
                    Ok(())
                } else {
                    let description = if !description.is_empty() {
                        description
                    } else {
                        disconnect_description(code)
                    };
                    Err(Error::DisconnectedBy { code, description }.into())
                }
            }
        }
    }

    fn reset_keepalive(&mut self) {
        self.keepalive_misses = 0;
        self.keepalive_rearm = true;
    }

    /// Answer a USERAUTH_PK_OK: hand the session-bound payload to the
    /// facade, which owns the signer (a local key or the agent).
    fn request_signature(&mut self) {
        let user = self.auth_user.clone();
        let key = match &self.auth_method {
            Some(auth::Method::PublicKey { key }) => {
                (key.name().to_string(), key.public_key_bytes())
            }
            Some(auth::Method::FuturePublicKey { key }) => {
                (key.name().to_string(), key.public_key_bytes())
            }
            _ => {
                debug!("USERAUTH_PK_OK outside a publickey attempt");
                return;
            }
        };
        let (algo, blob) = key;
        let data = self.transport.userauth_sign_payload(&user, &algo, &blob);
        self.sender
            .send(Reply::SignRequest { algo, data })
            .unwrap_or(());
    }

    pub(super) fn emit_auth_request(&mut self) {
        let method = match self.auth_method.clone() {
            Some(method) => method,
            None => return,
        };
        let user = self.auth_user.clone();
        debug!("sending userauth request for {:?}", user);
        match method {
            auth::Method::None => self.transport.auth_none(&user),
            auth::Method::Password { password } => {
                self.transport.auth_password(&user, &password, None)
            }
            auth::Method::PublicKey { key } => {
                let blob = key.public_key_bytes();
                self.transport.auth_publickey(&user, key.name(), &blob);
            }
            auth::Method::FuturePublicKey { key } => {
                let blob = key.public_key_bytes();
                self.transport.auth_publickey(&user, key.name(), &blob);
            }
            auth::Method::KeyboardInteractive { submethods } => {
                self.transport.auth_keyboard_interactive(&user, &submethods)
            }
            auth::Method::Hostbased {
                key,
                local_hostname,
                local_username,
            } => {
                // Hostbased requests carry their signature up front;
                // ask the facade for one before anything goes out.
                let blob = key.public_key_bytes();
                let data = self.transport.hostbased_sign_payload(
                    &user,
                    key.name(),
                    &blob,
                    &local_hostname,
                    &local_username,
                );
                self.sender
                    .send(Reply::SignRequest {
                        algo: key.name().to_string(),
                        data,
                    })
                    .unwrap_or(());
            }
            auth::Method::Agent => {
                debug!("the agent method reaches the session as individual keys")
            }
        }
    }

    pub(super) fn emit_signed_auth(&mut self, signature: CryptoVec) {
        let user = self.auth_user.clone();
        match self.auth_method.clone() {
            Some(auth::Method::PublicKey { key }) => {
                let blob = key.public_key_bytes();
                self.transport
                    .auth_publickey_signed(&user, key.name(), &blob, &signature);
            }
            Some(auth::Method::FuturePublicKey { key }) => {
                let blob = key.public_key_bytes();
                self.transport
                    .auth_publickey_signed(&user, key.name(), &blob, &signature);
            }
            Some(auth::Method::Hostbased {
                key,
                local_hostname,
                local_username,
            }) => {
                let blob = key.public_key_bytes();
                self.transport.auth_hostbased(
                    &user,
                    key.name(),
                    &blob,
                    &local_hostname,
                    &local_username,
                    &signature,
                );
            }
            _ => debug!("signature without a pending publickey attempt"),
        }
    }

    fn global_request_success(&mut self, data: CryptoVec) {
        match self.global_queue.pop_front() {
            Some(GlobalReply::TcpIpForward {
                address,
                port,
                reply,
            }) => {
                let mut actual_port = port;
                if port == 0
                    && !self
                        .transport
                        .compat_flags()
                        .contains(crate::transport::CompatFlags::DYN_RPORT_BUG)
                    && data.len() >= 4
                {
                    actual_port = BigEndian::read_u32(&data);
                }
                debug!("tcpip-forward bound {}:{}", address, actual_port);
                self.tcp_forwardings
                    .insert((address, actual_port), actual_port);
                let _ = reply.send(Ok(actual_port));
            }
            Some(GlobalReply::CancelTcpIpForward {
                address,
                port,
                reply,
            }) => {
                self.tcp_forwardings.remove(&(address, port));
                let _ = reply.send(Ok(()));
            }
            Some(GlobalReply::StreamLocalForward { socket_path, reply }) => {
                self.unix_forwardings.insert(socket_path);
                let _ = reply.send(Ok(()));
            }
            Some(GlobalReply::CancelStreamLocalForward { socket_path, reply }) => {
                self.unix_forwardings.remove(&socket_path);
                let _ = reply.send(Ok(()));
            }
            Some(GlobalReply::NoMoreSessions { reply }) => {
                let _ = reply.send(Ok(()));
            }
            Some(GlobalReply::Keepalive) => {
                debug!("keepalive answered");
            }
            None => info!("unsolicited REQUEST_SUCCESS"),
        }
    }

    fn channel_request(&mut self, id: ChannelId, request: ChannelRequestKind) {
        let transport = &mut self.transport;
        let state = match self.channels.live_mut(id) {
            Some(state) => state,
            None => {
                debug!("channel request for unknown channel {:?}", id);
                return;
            }
        };
        match request {
            ChannelRequestKind::ExitStatus { exit_status } => {
                // A process exits once; later exit requests are noise.
                if !state.exited {
                    state.exited = true;
                    state.send(ChannelMsg::ExitStatus { exit_status });
                }
            }
            ChannelRequestKind::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                lang_tag,
            } => {
                if !state.exited {
                    state.exited = true;
                    state.send(ChannelMsg::ExitSignal {
                        signal_name,
                        core_dumped,
                        error_message,
                        lang_tag,
                    });
                }
            }
            ChannelRequestKind::Other { typ, want_reply } => {
                info!("Unknown channel request {:?}", typ);
                if want_reply {
                    transport.channel_failure(state.remote_id);
                }
            }
        }
    }

    /// Route a server-initiated channel open: consult the forwarding
    /// tables and permission latches, then either confirm and hand a
    /// live channel to the handler, or refuse with the right reason.
    async fn incoming_channel<H: Handler>(
        &mut self,
        remote_id: u32,
        window_size: u32,
        maximum_packet_size: u32,
        kind: ChannelOpenKind,
        handler: &mut H,
    ) -> Result<(), H::Error> {
        let reason = match &kind {
            ChannelOpenKind::ForwardedTcpIp {
                connected_address,
                connected_port,
                ..
            } => {
                if self
                    .tcp_forwardings
                    .contains_key(&(connected_address.clone(), *connected_port))
                {
                    None
                } else {
                    Some(ChannelOpenFailure::AdministrativelyProhibited)
                }
            }
            ChannelOpenKind::ForwardedStreamLocal { socket_path } => {
                if self.unix_forwardings.contains(socket_path) {
                    None
                } else {
                    Some(ChannelOpenFailure::AdministrativelyProhibited)
                }
            }
            ChannelOpenKind::AgentForward => {
                if cfg!(unix) && self.agent_forward_enabled && self.config.agent.is_some() {
                    None
                } else {
                    Some(ChannelOpenFailure::AdministrativelyProhibited)
                }
            }
            ChannelOpenKind::X11 { .. } => {
                if self.accept_x11 > 0 {
                    None
                } else {
                    Some(ChannelOpenFailure::AdministrativelyProhibited)
                }
            }
            ChannelOpenKind::Unknown { typ } => {
                info!("rejecting a channel of unknown type {:?}", typ);
                Some(ChannelOpenFailure::UnknownChannelType)
            }
        };
        if let Some(reason) = reason {
            self.transport.channel_open_failure(remote_id, reason, "");
            return Ok(());
        }

        let (pipe, receiver) = unbounded_channel();
        let id = match self.channels.add(Slot::Pending(pipe.clone())) {
            Some(id) => id,
            None => {
                self.transport.channel_open_failure(
                    remote_id,
                    ChannelOpenFailure::ResourceShortage,
                    "",
                );
                return Ok(());
            }
        };
        let state = ChannelState::new(
            remote_id,
            window_size,
            maximum_packet_size,
            self.config.window_size,
            pipe,
        );
        self.channels.update(id, state);
        self.transport.channel_open_confirmation(
            remote_id,
            id,
            self.config.window_size,
            self.config.maximum_packet_size,
        );
        let channel = super::Channel {
            sender: super::ChannelSender {
                sender: self.handle_sender.clone(),
                id,
            },
            receiver,
            max_packet_size: maximum_packet_size,
            window_size,
            buffered: Default::default(),
        };
        match kind {
            ChannelOpenKind::ForwardedTcpIp {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => {
                let actual = self
                    .tcp_forwardings
                    .get(&(connected_address.clone(), connected_port))
                    .copied()
                    .unwrap_or(connected_port);
                handler
                    .server_channel_open_forwarded_tcpip(
                        channel,
                        ForwardedTcpIpParams {
                            connected_address,
                            connected_port: actual,
                            originator_address,
                            originator_port,
                        },
                    )
                    .await
            }
            ChannelOpenKind::ForwardedStreamLocal { socket_path } => {
                handler
                    .server_channel_open_forwarded_streamlocal(channel, &socket_path)
                    .await
            }
            ChannelOpenKind::X11 {
                originator_address,
                originator_port,
            } => {
                handler
                    .server_channel_open_x11(channel, &originator_address, originator_port)
                    .await
            }
            ChannelOpenKind::AgentForward => {
                #[cfg(unix)]
                {
                    if let Some(path) = &self.config.agent {
                        self.child_tasks
                            .push(tokio::spawn(crate::agent::bridge(path.clone(), channel)));
                    }
                }
                #[cfg(not(unix))]
                drop(channel);
                Ok(())
            }
            ChannelOpenKind::Unknown { .. } => unreachable!(),
        }
    }
}

/// The standard descriptions for disconnect reason codes, for servers
/// that do not send one.
fn disconnect_description(code: u32) -> String {
    let known = match code {
        1 => Some("Host not allowed to connect"),
        2 => Some("Protocol error"),
        3 => Some("Key exchange failed"),
        4 => Some("Reserved"),
        5 => Some("MAC error"),
        6 => Some("Compression error"),
        7 => Some("Service not available"),
        8 => Some("Protocol version not supported"),
        9 => Some("Host key not verifiable"),
        10 => Some("Connection lost"),
        12 => Some("Too many connections"),
        13 => Some("Auth cancelled by user"),
        14 => Some("No more auth methods available"),
        15 => Some("Illegal user name"),
        _ => None,
    };
    match known {
        Some(description) => description.to_string(),
        None => format!("Unexpected disconnection reason: {}", code),
    }
}
