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

//! The seam between this crate and the framed SSH packet layer.
//!
//! A [`Transport`] owns identification exchange, key exchange, ciphers
//! and packet framing. This crate feeds it raw inbound bytes and reads
//! back decoded [`TransportEvent`]s; in the other direction it calls
//! one emit method per protocol operation and writes whatever
//! [`Transport::take_output`] returns to the socket. Implementations
//! buffer output internally, so emit methods never fail; anything that
//! can go wrong surfaces from [`Transport::parse`].

use crate::auth::{MethodSet, Prompt};
use crate::{ChannelId, ChannelOpenFailure, Disconnect, Error, Pty, Sig};
use cryptovec::CryptoVec;
use std::collections::VecDeque;

/// Lists of preferred algorithms, sent during key exchange. This is
/// handed to the transport at construction; the connection layer never
/// interprets the names.
#[derive(Debug, Clone)]
pub struct Preferred {
    /// Preferred key exchange algorithms.
    pub kex: &'static [&'static str],
    /// Preferred host key algorithms.
    pub key: &'static [&'static str],
    /// Preferred symmetric ciphers.
    pub cipher: &'static [&'static str],
    /// Preferred MAC algorithms.
    pub mac: &'static [&'static str],
    /// Preferred compression algorithms.
    pub compression: &'static [&'static str],
}

impl Preferred {
    pub const DEFAULT: Preferred = Preferred {
        kex: &["curve25519-sha256@libssh.org"],
        key: &["ssh-ed25519", "rsa-sha2-256", "rsa-sha2-512"],
        cipher: &["chacha20-poly1305@openssh.com", "aes256-gcm@openssh.com"],
        mac: &["none"],
        compression: &["none", "zlib", "zlib@openssh.com"],
    };
}

impl Default for Preferred {
    fn default() -> Preferred {
        Preferred::DEFAULT
    }
}

bitflags! {
    /// Peer quirks reported by the transport after it has seen the
    /// server identification.
    pub struct CompatFlags: u32 {
        /// The server does not report the assigned port in the reply
        /// to a `tcpip-forward` request for port 0.
        const DYN_RPORT_BUG = 1;
    }
}

/// The algorithms that were negotiated during the handshake.
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub kex: String,
    pub server_host_key: String,
    pub cipher: String,
    pub mac: String,
    pub compression: String,
}

/// The typed payload of a server-initiated channel open.
#[derive(Debug)]
pub enum ChannelOpenKind {
    ForwardedTcpIp {
        connected_address: String,
        connected_port: u32,
        originator_address: String,
        originator_port: u32,
    },
    ForwardedStreamLocal {
        socket_path: String,
    },
    AgentForward,
    X11 {
        originator_address: String,
        originator_port: u32,
    },
    Unknown {
        typ: String,
    },
}

/// The typed payload of a channel request from the server.
#[derive(Debug)]
pub enum ChannelRequestKind {
    ExitStatus {
        exit_status: u32,
    },
    ExitSignal {
        signal_name: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    },
    Other {
        typ: String,
        want_reply: bool,
    },
}

/// A decoded protocol event, produced by [`Transport::parse`].
#[derive(Debug)]
pub enum TransportEvent {
    /// Free-form text the server sent before its identification line.
    Greeting { text: String },
    /// The server identification line, without the trailing CRLF.
    Header { identification: String },
    /// The server host key, to be checked before the handshake can
    /// proceed. The transport stalls until
    /// [`Transport::host_key_decision`] is called.
    HostKeyCheck { key: thrussh_keys::key::PublicKey },
    /// Key exchange finished.
    HandshakeComplete(HandshakeInfo),
    ServiceAccept { name: String },
    AuthSuccess,
    AuthFailure {
        remaining: MethodSet,
        partial_success: bool,
    },
    AuthBanner { message: String },
    AuthPkOk {
        algo: String,
        key_blob: CryptoVec,
    },
    AuthInfoRequest {
        name: String,
        instructions: String,
        prompts: Vec<Prompt>,
    },
    AuthPasswdChangeReq { prompt: String },
    GlobalRequest { name: String, want_reply: bool },
    RequestSuccess { data: CryptoVec },
    RequestFailure,
    ChannelOpen {
        remote_id: u32,
        window_size: u32,
        maximum_packet_size: u32,
        kind: ChannelOpenKind,
    },
    ChannelOpenConfirmation {
        id: ChannelId,
        remote_id: u32,
        window_size: u32,
        maximum_packet_size: u32,
    },
    ChannelOpenFailed {
        id: ChannelId,
        reason: ChannelOpenFailure,
        description: String,
    },
    ChannelWindowAdjust { id: ChannelId, amount: u32 },
    ChannelData { id: ChannelId, data: CryptoVec },
    ChannelExtendedData {
        id: ChannelId,
        ext: u32,
        data: CryptoVec,
    },
    ChannelEof { id: ChannelId },
    ChannelClose { id: ChannelId },
    ChannelRequest {
        id: ChannelId,
        request: ChannelRequestKind,
    },
    ChannelSuccess { id: ChannelId },
    ChannelFailure { id: ChannelId },
    Debug { message: String },
    Disconnect { code: u32, description: String },
}

/// The framed SSH packet layer, as seen from the connection layer.
///
/// Channel-scoped emit methods take the *remote* channel number (the
/// peer's identifier), channel opens take our local [`ChannelId`].
pub trait Transport: Send + 'static {
    /// Feed inbound bytes; decoded events are appended to `events`.
    /// An error is fatal to the connection.
    fn parse(&mut self, data: &[u8], events: &mut VecDeque<TransportEvent>) -> Result<(), Error>;

    /// Drain the frames produced by emit methods since the last call.
    fn take_output(&mut self) -> CryptoVec;

    /// Quirk bits for the connected server.
    fn compat_flags(&self) -> CompatFlags {
        CompatFlags::empty()
    }

    /// Resolve a pending [`TransportEvent::HostKeyCheck`].
    fn host_key_decision(&mut self, accepted: bool);

    /// Called exactly once when the connection is torn down.
    fn cleanup(&mut self) {}

    fn service_request(&mut self, name: &str);

    fn auth_none(&mut self, user: &str);
    fn auth_password(&mut self, user: &str, password: &str, new_password: Option<&str>);
    /// Probe whether the server would accept this key (no signature).
    fn auth_publickey(&mut self, user: &str, algo: &str, key_blob: &[u8]);
    /// The session-bound payload a publickey signature must cover.
    fn userauth_sign_payload(&mut self, user: &str, algo: &str, key_blob: &[u8]) -> CryptoVec;
    fn auth_publickey_signed(&mut self, user: &str, algo: &str, key_blob: &[u8], signature: &[u8]);
    /// The session-bound payload a hostbased signature must cover.
    fn hostbased_sign_payload(
        &mut self,
        user: &str,
        algo: &str,
        key_blob: &[u8],
        local_hostname: &str,
        local_username: &str,
    ) -> CryptoVec;
    fn auth_hostbased(
        &mut self,
        user: &str,
        algo: &str,
        key_blob: &[u8],
        local_hostname: &str,
        local_username: &str,
        signature: &[u8],
    );
    fn auth_keyboard_interactive(&mut self, user: &str, submethods: &str);
    fn auth_info_response(&mut self, answers: &[String]);

    /// A liveness probe the server must answer with a global reply.
    fn ping(&mut self);
    fn disconnect(&mut self, reason: Disconnect, description: &str);
    /// Failure reply to a global request from the server.
    fn request_failure(&mut self);

    fn tcpip_forward(&mut self, address: &str, port: u32, want_reply: bool);
    fn cancel_tcpip_forward(&mut self, address: &str, port: u32, want_reply: bool);
    fn streamlocal_forward(&mut self, socket_path: &str, want_reply: bool);
    fn cancel_streamlocal_forward(&mut self, socket_path: &str, want_reply: bool);
    fn no_more_sessions(&mut self, want_reply: bool);

    fn channel_open_session(&mut self, id: ChannelId, window_size: u32, maximum_packet_size: u32);
    fn channel_open_direct_tcpip(
        &mut self,
        id: ChannelId,
        window_size: u32,
        maximum_packet_size: u32,
        host: &str,
        port: u32,
        originator_address: &str,
        originator_port: u32,
    );
    fn channel_open_direct_streamlocal(
        &mut self,
        id: ChannelId,
        window_size: u32,
        maximum_packet_size: u32,
        socket_path: &str,
    );
    fn channel_open_confirmation(
        &mut self,
        remote_id: u32,
        id: ChannelId,
        window_size: u32,
        maximum_packet_size: u32,
    );
    fn channel_open_failure(&mut self, remote_id: u32, reason: ChannelOpenFailure, description: &str);

    fn channel_request_pty(
        &mut self,
        remote_id: u32,
        want_reply: bool,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        terminal_modes: &[(Pty, u32)],
    );
    fn channel_request_x11(
        &mut self,
        remote_id: u32,
        want_reply: bool,
        single_connection: bool,
        x11_authentication_protocol: &str,
        x11_authentication_cookie: &str,
        x11_screen_number: u32,
    );
    fn channel_request_env(&mut self, remote_id: u32, variable_name: &str, variable_value: &str);
    fn channel_request_shell(&mut self, remote_id: u32, want_reply: bool);
    fn channel_request_exec(&mut self, remote_id: u32, want_reply: bool, command: &str);
    fn channel_request_subsystem(&mut self, remote_id: u32, want_reply: bool, name: &str);
    fn channel_request_agent_forward(&mut self, remote_id: u32, want_reply: bool);
    fn channel_request_signal(&mut self, remote_id: u32, signal: &Sig);
    fn channel_request_window_change(
        &mut self,
        remote_id: u32,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    );

    fn channel_data(&mut self, remote_id: u32, data: &[u8]);
    fn channel_extended_data(&mut self, remote_id: u32, ext: u32, data: &[u8]);
    fn channel_eof(&mut self, remote_id: u32);
    fn channel_close(&mut self, remote_id: u32);
    fn channel_window_adjust(&mut self, remote_id: u32, amount: u32);
    /// Failure reply to a channel request from the server.
    fn channel_failure(&mut self, remote_id: u32);
}
