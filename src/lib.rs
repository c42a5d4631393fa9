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

//! Client-side SSH connection layer, based on tokio/futures.
//!
//! This crate implements everything an SSH client does *above* the
//! framed packet layer: user authentication, channel multiplexing with
//! per-channel flow control, session requests (pty, env, exec, shell,
//! subsystems, X11 and agent forwarding), port forwarding in both
//! directions, and the policy deciding which server-initiated channels
//! are accepted. Key exchange, ciphers, MACs and packet framing are
//! *not* implemented here; they live behind the
//! [`transport::Transport`] trait, which a separate crate (or a test
//! double) provides.
//!
//! The normal way to use this crate is to implement [`client::Handler`]
//! for unsolicited server events, call [`client::connect`] (or
//! [`client::connect_stream`] with an already-established stream), then
//! authenticate and open channels through the returned
//! [`client::Handle`]:
//!
//! ```ignore
//! let config = Arc::new(client::Config {
//!     username: "jsmith".into(),
//!     password: Some("banana".into()),
//!     ..Default::default()
//! });
//! let mut session = client::connect(config, MyHandler, transport).await?;
//! session.authenticate().await?;
//! let mut channel = session.exec("ls -l", Default::default()).await?;
//! while let Some(msg) = channel.wait().await {
//!     if let ChannelMsg::Data { data } = msg {
//!         stdout.write_all(&data).await?;
//!     }
//! }
//! ```
//!
//! All protocol state for one connection lives in a single spawned
//! task; handles and channels communicate with it over message
//! channels. This keeps window arithmetic and reply ordering free of
//! locks: per-channel request replies and global request replies are
//! delivered strictly in submission order, because both the peer and
//! the internal queues are FIFO.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;
#[macro_use]
extern crate thiserror;

use std::fmt::{Display, Formatter};

pub use cryptovec::CryptoVec;

pub mod agent;
pub mod auth;
mod channels;
pub mod client;
mod pty;
pub use pty::Pty;
pub mod transport;

/// The routing class of an [`Error`], used to decide how a failure is
/// handled: some classes are recovered from locally (agent problems
/// advance to the next key, authentication problems to the next
/// method), everything else is fatal to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLevel {
    /// The transport failed before the first service started.
    Handshake,
    /// Malformed or unexpected wire events.
    Protocol,
    /// The underlying byte stream failed or went away.
    ClientSocket,
    /// A liveness deadline expired.
    ClientTimeout,
    /// Name resolution failed.
    ClientDns,
    /// Authentication could not proceed.
    ClientAuthentication,
    /// The SSH agent misbehaved; never fatal on its own.
    Agent,
}

#[derive(Debug, Error)]
pub enum Error {
    /// The protocol is in an inconsistent state.
    #[error("Inconsistent state of the protocol")]
    Inconsistent,

    /// Message received/sent on unopened channel.
    #[error("Channel not open")]
    WrongChannel,

    /// Every local channel identifier is in use.
    #[error("No free channel identifier")]
    ChannelIdsExhausted,

    /// The client is not yet authenticated.
    #[error("Not yet authenticated")]
    NotAuthenticated,

    /// The session loop is gone; no operation can reach the server.
    #[error("Not connected")]
    NotConnected,

    /// Unknown server key.
    #[error("Unknown server key")]
    UnknownKey,

    /// Error during key exchange, reported by the transport.
    #[error("Key exchange failed")]
    Kex,

    /// Disconnected.
    #[error("Disconnected")]
    Disconnect,

    /// The server sent a disconnect message.
    #[error("{}", description)]
    DisconnectedBy { code: u32, description: String },

    /// The stream dropped before the server ever identified itself.
    #[error("Connection lost before handshake")]
    HandshakeAborted,

    /// Name resolution produced no usable address.
    #[error("Could not resolve address for {0}")]
    Dns(String),

    /// No server identification or authentication before the deadline.
    #[error("Timed out while waiting for the server")]
    ConnectionTimeout,

    /// The server stopped answering keepalive probes.
    #[error("Keepalive timeout")]
    KeepaliveTimeout,

    /// The strategy ran out of things to try.
    #[error("All configured authentication methods failed")]
    NoAuthMethod,

    /// The agent signed with a different algorithm than the one the
    /// key was probed with.
    #[error("The agent returned a {actual} signature for a {expected} key")]
    SignatureTypeMismatch { expected: String, actual: String },

    /// The connection closed while a reply was still pending.
    #[error("No response from server")]
    NoResponse,

    /// The server answered a request with a failure message.
    #[error("The server denied the request")]
    RequestDenied,

    /// The server refused to open a channel.
    #[error("Channel open refused ({0:?})")]
    ChannelOpenDenied(ChannelOpenFailure),

    /// An `openssh.com` extension was used against a server that did
    /// not identify itself as a compatible OpenSSH version.
    #[error("The remote server does not support OpenSSH extensions")]
    VendorMismatch,

    /// Configuration without a username.
    #[error("A username is required to authenticate")]
    MissingUsername,

    /// Agent forwarding configured without an agent endpoint.
    #[error("Agent forwarding requires an agent endpoint")]
    AgentForwardWithoutAgent,

    #[error("Channel send error")]
    SendError,

    #[error(transparent)]
    Keys(#[from] thrussh_keys::Error),

    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// The routing class of this error.
    pub fn level(&self) -> ErrorLevel {
        match self {
            Error::Inconsistent
            | Error::WrongChannel
            | Error::ChannelIdsExhausted
            | Error::DisconnectedBy { .. }
            | Error::RequestDenied
            | Error::ChannelOpenDenied(_)
            | Error::VendorMismatch
            | Error::Utf8(_) => ErrorLevel::Protocol,
            Error::UnknownKey | Error::Kex => ErrorLevel::Handshake,
            Error::NotConnected
            | Error::Disconnect
            | Error::HandshakeAborted
            | Error::NoResponse
            | Error::SendError
            | Error::IO(_)
            | Error::Join(_) => ErrorLevel::ClientSocket,
            Error::ConnectionTimeout | Error::KeepaliveTimeout => ErrorLevel::ClientTimeout,
            Error::Dns(_) => ErrorLevel::ClientDns,
            Error::NotAuthenticated | Error::NoAuthMethod | Error::MissingUsername
            | Error::AgentForwardWithoutAgent => ErrorLevel::ClientAuthentication,
            Error::SignatureTypeMismatch { .. } => ErrorLevel::Agent,
            Error::Keys(thrussh_keys::Error::AgentFailure)
            | Error::Keys(thrussh_keys::Error::AgentProtocolError) => ErrorLevel::Agent,
            Error::Keys(_) => ErrorLevel::ClientAuthentication,
        }
    }
}

/// A reason for disconnection.
#[allow(missing_docs)] // This should be relatively self-explanatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    HostNotAllowedToConnect = 1,
    ProtocolError = 2,
    KeyExchangeFailed = 3,
    #[doc(hidden)]
    Reserved = 4,
    MACError = 5,
    CompressionError = 6,
    ServiceNotAvailable = 7,
    ProtocolVersionNotSupported = 8,
    HostKeyNotVerifiable = 9,
    ConnectionLost = 10,
    ByApplication = 11,
    TooManyConnections = 12,
    AuthCancelledByUser = 13,
    NoMoreAuthMethodsAvailable = 14,
    IllegalUserName = 15,
}

/// The type of signals that can be sent to a remote process. If you
/// plan to use custom signals, read [the
/// RFC](https://tools.ietf.org/html/rfc4254#section-6.10) to
/// understand the encoding.
#[allow(missing_docs)]
// This should be relatively self-explanatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sig {
    ABRT,
    ALRM,
    FPE,
    HUP,
    ILL,
    INT,
    KILL,
    PIPE,
    QUIT,
    SEGV,
    TERM,
    USR1,
    Custom(String),
}

impl Sig {
    pub fn name(&self) -> &str {
        match *self {
            Sig::ABRT => "ABRT",
            Sig::ALRM => "ALRM",
            Sig::FPE => "FPE",
            Sig::HUP => "HUP",
            Sig::ILL => "ILL",
            Sig::INT => "INT",
            Sig::KILL => "KILL",
            Sig::PIPE => "PIPE",
            Sig::QUIT => "QUIT",
            Sig::SEGV => "SEGV",
            Sig::TERM => "TERM",
            Sig::USR1 => "USR1",
            Sig::Custom(ref c) => c,
        }
    }
    pub fn from_name(name: &str) -> Sig {
        match name {
            "ABRT" => Sig::ABRT,
            "ALRM" => Sig::ALRM,
            "FPE" => Sig::FPE,
            "HUP" => Sig::HUP,
            "ILL" => Sig::ILL,
            "INT" => Sig::INT,
            "KILL" => Sig::KILL,
            "PIPE" => Sig::PIPE,
            "QUIT" => Sig::QUIT,
            "SEGV" => Sig::SEGV,
            "TERM" => Sig::TERM,
            "USR1" => Sig::USR1,
            x => Sig::Custom(x.to_string()),
        }
    }
}

/// Reason for not being able to open a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChannelOpenFailure {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
}

impl ChannelOpenFailure {
    pub fn from_u32(x: u32) -> Option<ChannelOpenFailure> {
        match x {
            1 => Some(ChannelOpenFailure::AdministrativelyProhibited),
            2 => Some(ChannelOpenFailure::ConnectFailed),
            3 => Some(ChannelOpenFailure::UnknownChannelType),
            4 => Some(ChannelOpenFailure::ResourceShortage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The identifier of a channel. The inner number is public because
/// transport implementations encode and decode it on the wire.
pub struct ChannelId(pub u32);

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages the server can send on an open channel, delivered through
/// [`client::Channel::wait`].
#[derive(Debug)]
pub enum ChannelMsg {
    Data {
        data: CryptoVec,
    },
    ExtendedData {
        data: CryptoVec,
        ext: u32,
    },
    Eof,
    Close,
    ExitStatus {
        exit_status: u32,
    },
    ExitSignal {
        signal_name: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    },
    WindowAdjusted {
        new_size: u32,
    },
}
