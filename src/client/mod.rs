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

use crate::agent::{self, Agent};
use crate::auth::{self, AuthHandler, Prompt};
use crate::channels::{ChannelManager, OpenChannelMsg, ReplyKind, Slot, StreamState};
use crate::pty::Pty;
use crate::transport::{HandshakeInfo, Preferred, Transport};
use crate::{ChannelId, ChannelMsg, Disconnect, Error, ErrorLevel, Sig};
use cryptovec::CryptoVec;
use futures::task::{Context, Poll};
use futures::Future;
use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use thrussh_keys::key;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::*;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

mod events;

/// Which address families a hostname may resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Any,
    V4,
    V6,
}

/// The configuration of clients. Immutable once a connection has been
/// established.
#[derive(Debug)]
pub struct Config {
    /// The host to connect to (ignored by [`connect_stream`]).
    pub host: String,
    /// The port to connect to.
    pub port: u16,
    /// Restrict name resolution to one address family.
    pub address_family: AddressFamily,
    /// The client ID string the transport sends at the beginning of
    /// the protocol.
    pub client_id: String,
    /// Lists of preferred algorithms, for the transport.
    pub preferred: Preferred,
    /// Give up when the server has not authenticated us within this
    /// duration. `None` disables the deadline.
    pub ready_timeout: Option<Duration>,
    /// Probe the server at this interval when the connection is
    /// otherwise idle. `None` disables keepalives.
    pub keepalive_interval: Option<Duration>,
    /// How many unanswered probes are tolerated before the connection
    /// is declared dead.
    pub keepalive_count_max: u32,
    /// The initial size of a channel (used for flow control).
    pub window_size: u32,
    /// The maximal size of a single packet.
    pub maximum_packet_size: u32,
    /// The user to authenticate as. Required.
    pub username: String,
    /// Enables the `password` method.
    pub password: Option<String>,
    /// Enables the `publickey` method (and `hostbased`, together with
    /// the local names below). Keys are parsed before connecting, by
    /// `thrussh-keys`.
    pub key: Option<Arc<key::KeyPair>>,
    /// Path of the SSH agent socket; enables the `agent` method.
    pub agent: Option<std::path::PathBuf>,
    /// Request agent forwarding on every session channel. Requires
    /// `agent`.
    pub agent_forward: bool,
    /// Enables the `keyboard-interactive` method.
    pub try_keyboard: bool,
    /// The client host name, for `hostbased` authentication.
    pub local_hostname: Option<String>,
    /// The client-side user name, for `hostbased` authentication.
    pub local_username: Option<String>,
    /// Refuse `openssh.com` extensions unless the server identified
    /// itself as OpenSSH 5 or newer.
    pub strict_vendor: bool,
    /// Ceiling on concurrently open channels.
    pub max_channels: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            host: String::new(),
            port: 22,
            address_family: AddressFamily::Any,
            client_id: format!(
                "SSH-2.0-{}_{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ),
            preferred: Default::default(),
            ready_timeout: Some(Duration::from_secs(20)),
            keepalive_interval: None,
            keepalive_count_max: 3,
            window_size: 2097152,
            maximum_packet_size: 32768,
            username: String::new(),
            password: None,
            key: None,
            agent: None,
            agent_forward: false,
            try_keyboard: false,
            local_hostname: None,
            local_username: None,
            strict_vendor: true,
            max_channels: 1024,
        }
    }
}

impl Config {
    /// The methods the default authentication strategy will try, in
    /// order, derived from what credentials are configured.
    pub fn auth_methods(&self) -> Vec<auth::Method> {
        let mut methods = vec![auth::Method::None];
        if let Some(ref password) = self.password {
            methods.push(auth::Method::Password {
                password: password.clone(),
            });
        }
        if self.agent.is_some() {
            methods.push(auth::Method::Agent);
        }
        if let Some(ref key) = self.key {
            methods.push(auth::Method::PublicKey { key: key.clone() });
        }
        if let (Some(key), Some(local_hostname), Some(local_username)) =
            (&self.key, &self.local_hostname, &self.local_username)
        {
            methods.push(auth::Method::Hostbased {
                key: key.clone(),
                local_hostname: local_hostname.clone(),
                local_username: local_username.clone(),
            });
        }
        if self.try_keyboard {
            methods.push(auth::Method::KeyboardInteractive {
                submethods: String::new(),
            });
        }
        methods
    }
}

/// Description of an incoming forwarded TCP/IP connection.
#[derive(Debug, Clone)]
pub struct ForwardedTcpIpParams {
    pub connected_address: String,
    pub connected_port: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

/// A pty request, as sent before a shell or command.
#[derive(Debug, Clone)]
pub struct PtyRequest {
    pub term: String,
    pub col_width: u32,
    pub row_height: u32,
    pub pix_width: u32,
    pub pix_height: u32,
    pub terminal_modes: Vec<(Pty, u32)>,
}

impl Default for PtyRequest {
    fn default() -> PtyRequest {
        PtyRequest {
            term: "xterm".to_string(),
            col_width: 80,
            row_height: 24,
            pix_width: 0,
            pix_height: 0,
            terminal_modes: Vec::new(),
        }
    }
}

/// Whether a session channel gets a pty.
#[derive(Debug, Clone)]
pub enum PtySetting {
    /// A default pty for shells, none for commands and subsystems.
    Auto,
    /// Never request a pty.
    Disabled,
    /// Request exactly this pty.
    Request(PtyRequest),
}

impl Default for PtySetting {
    fn default() -> PtySetting {
        PtySetting::Auto
    }
}

/// An X11 forwarding request.
#[derive(Debug, Clone)]
pub struct X11Request {
    pub single_connection: bool,
    pub x11_authentication_protocol: String,
    pub x11_authentication_cookie: String,
    pub x11_screen_number: u32,
}

/// Per-call options for [`Handle::exec`], [`Handle::shell`] and
/// [`Handle::subsystem`]: the requests sent on the channel before the
/// command itself.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    /// Request agent forwarding for this channel (also implied by
    /// `Config::agent_forward`).
    pub agent_forward: bool,
    /// Environment variables, sent without waiting for replies.
    pub env: Vec<(String, String)>,
    pub pty: PtySetting,
    pub x11: Option<X11Request>,
}

#[derive(Debug)]
pub(crate) enum Msg {
    Authenticate {
        user: String,
        method: auth::Method,
    },
    Signed {
        signature: CryptoVec,
    },
    ChannelOpenSession {
        pipe: UnboundedSender<OpenChannelMsg>,
    },
    ChannelOpenDirectTcpIp {
        host_to_connect: String,
        port_to_connect: u32,
        originator_address: String,
        originator_port: u32,
        pipe: UnboundedSender<OpenChannelMsg>,
    },
    ChannelOpenDirectStreamLocal {
        socket_path: String,
        pipe: UnboundedSender<OpenChannelMsg>,
    },
    TcpIpForward {
        address: String,
        port: u32,
        reply: oneshot::Sender<Result<u32, Error>>,
    },
    CancelTcpIpForward {
        address: String,
        port: u32,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    StreamLocalForward {
        socket_path: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    CancelStreamLocalForward {
        socket_path: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    NoMoreSessions {
        reply: oneshot::Sender<Result<(), Error>>,
    },
    RequestPty {
        id: ChannelId,
        want_reply: bool,
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        terminal_modes: Vec<(Pty, u32)>,
        reply: Option<oneshot::Sender<bool>>,
    },
    RequestShell {
        id: ChannelId,
        reply: Option<oneshot::Sender<bool>>,
    },
    Exec {
        id: ChannelId,
        command: String,
        reply: Option<oneshot::Sender<bool>>,
    },
    RequestSubsystem {
        id: ChannelId,
        name: String,
        reply: Option<oneshot::Sender<bool>>,
    },
    RequestX11 {
        id: ChannelId,
        single_connection: bool,
        x11_authentication_protocol: String,
        x11_authentication_cookie: String,
        x11_screen_number: u32,
        reply: Option<oneshot::Sender<bool>>,
    },
    SetEnv {
        id: ChannelId,
        variable_name: String,
        variable_value: String,
    },
    AgentForward {
        id: ChannelId,
        reply: Option<oneshot::Sender<bool>>,
    },
    WindowChange {
        id: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal {
        id: ChannelId,
        signal: Sig,
    },
    Data {
        id: ChannelId,
        data: CryptoVec,
    },
    ExtendedData {
        id: ChannelId,
        ext: u32,
        data: CryptoVec,
    },
    Eof {
        id: ChannelId,
    },
    Close {
        id: ChannelId,
    },
    Disconnect {
        reason: Disconnect,
        description: String,
    },
    Abort,
}

#[derive(Debug)]
pub(crate) enum Reply {
    AuthSuccess,
    AuthFailure {
        remaining: auth::MethodSet,
        partial_success: bool,
    },
    SignRequest {
        algo: String,
        data: CryptoVec,
    },
}

/// An entry of the global reply queue: what to do with the next
/// REQUEST_SUCCESS/FAILURE from the server.
#[derive(Debug)]
pub(crate) enum GlobalReply {
    TcpIpForward {
        address: String,
        port: u32,
        reply: oneshot::Sender<Result<u32, Error>>,
    },
    CancelTcpIpForward {
        address: String,
        port: u32,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    StreamLocalForward {
        socket_path: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    CancelStreamLocalForward {
        socket_path: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    NoMoreSessions {
        reply: oneshot::Sender<Result<(), Error>>,
    },
    /// Keepalive probes share the queue so forward replies stay
    /// aligned with their requests.
    Keepalive,
}

impl GlobalReply {
    fn fail(self, err: Error) {
        match self {
            GlobalReply::TcpIpForward { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            GlobalReply::CancelTcpIpForward { reply, .. }
            | GlobalReply::StreamLocalForward { reply, .. }
            | GlobalReply::CancelStreamLocalForward { reply, .. }
            | GlobalReply::NoMoreSessions { reply } => {
                let _ = reply.send(Err(err));
            }
            GlobalReply::Keepalive => {}
        }
    }
}

/// A client handler for unsolicited server events. Everything has a
/// default implementation; most clients only implement
/// `check_server_key`.
#[async_trait]
pub trait Handler: Sized + Send + 'static {
    type Error: From<crate::Error> + Send;

    /// Free-form text the server sent before its identification.
    #[allow(unused_variables)]
    async fn greeting(&mut self, text: &str) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called to check the server's public key. This is a very
    /// important step to help prevent man-in-the-middle attacks. The
    /// default implementation rejects all keys.
    #[allow(unused_variables)]
    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }

    /// Key exchange finished; the negotiated algorithms are in `info`.
    #[allow(unused_variables)]
    async fn handshake_complete(&mut self, info: &HandshakeInfo) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the server sends us an authentication banner. This
    /// is usually meant to be shown to the user, see
    /// [RFC4252](https://tools.ietf.org/html/rfc4252#section-5.4) for
    /// more details.
    #[allow(unused_variables)]
    async fn auth_banner(&mut self, banner: &str) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Answer the prompts of a keyboard-interactive round. The reply
    /// must hold one answer per prompt; anything else makes the server
    /// fail the attempt.
    #[allow(unused_variables)]
    async fn auth_keyboard_interactive(
        &mut self,
        name: &str,
        instructions: &str,
        prompts: &[Prompt],
    ) -> Result<Vec<String>, Self::Error> {
        Ok(Vec::new())
    }

    /// The server requires a new password before authentication can
    /// succeed. Returning `None` abandons the attempt.
    #[allow(unused_variables)]
    async fn auth_change_password(&mut self, prompt: &str) -> Result<Option<String>, Self::Error> {
        Ok(None)
    }

    /// An incoming connection on a remotely forwarded TCP port. The
    /// channel is already confirmed; drop it to ignore the connection.
    #[allow(unused_variables)]
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel,
        params: ForwardedTcpIpParams,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// An incoming connection on a remotely forwarded Unix socket.
    #[allow(unused_variables)]
    async fn server_channel_open_forwarded_streamlocal(
        &mut self,
        channel: Channel,
        socket_path: &str,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// An incoming X11 connection, after a successful x11-req on some
    /// session channel.
    #[allow(unused_variables)]
    async fn server_channel_open_x11(
        &mut self,
        channel: Channel,
        originator_address: &str,
        originator_port: u32,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// The connection is gone, cleanly or not. Called exactly once.
    async fn disconnected(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Handle to a session, used to authenticate, open channels and manage
/// forwardings from outside the event loop. Cheap operations on open
/// channels go through [`Channel`] instead.
pub struct Handle<H: Handler> {
    config: Arc<Config>,
    sender: Sender<Msg>,
    receiver: UnboundedReceiver<Reply>,
    join: JoinHandle<Result<(), H::Error>>,
}

impl<H: Handler> Drop for Handle<H> {
    fn drop(&mut self) {
        debug!("drop handle")
    }
}

enum Outcome {
    Success,
    Failure {
        remaining: auth::MethodSet,
        partial_success: bool,
    },
    /// The method aborted locally (signing failure, missing agent,
    /// empty key list); what the server last advertised still stands.
    Abandoned,
}

impl<H: Handler> Handle<H> {
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Authenticate with the default strategy: the methods enabled by
    /// the configuration, tried in a fixed order (`none`, `password`,
    /// `agent`, `publickey`, `hostbased`, `keyboard-interactive`).
    pub async fn authenticate(&mut self) -> Result<(), Error> {
        let strategy = auth::DefaultHandler::new(self.config.auth_methods());
        #[cfg(unix)]
        let agent = self.config.agent.as_ref().map(agent::UnixAgent::new);
        #[cfg(not(unix))]
        let agent: Option<agent::NoAgent> = None;
        self.authenticate_with(strategy, agent).await
    }

    /// Authenticate with a custom strategy and/or agent. The strategy
    /// is consulted before the first attempt and again after every
    /// failure, with the methods the server still advertises.
    pub async fn authenticate_with<S: AuthHandler, A: Agent>(
        &mut self,
        mut strategy: S,
        mut agent: Option<A>,
    ) -> Result<(), Error> {
        let user = self.config.username.clone();
        if user.is_empty() {
            return Err(Error::MissingUsername);
        }
        let mut remaining = auth::MethodSet::all();
        let mut partial_success = false;
        loop {
            let method = match strategy.next_method(remaining, partial_success) {
                Some(method) => method,
                None => {
                    self.disconnect(Disconnect::NoMoreAuthMethodsAvailable, "")
                        .await;
                    return Err(Error::NoAuthMethod);
                }
            };
            let outcome = match method {
                auth::Method::Agent => self.try_agent_keys(&user, agent.as_mut()).await?,
                method => self.try_method(&user, method).await?,
            };
            match outcome {
                Outcome::Success => return Ok(()),
                Outcome::Failure {
                    remaining: r,
                    partial_success: p,
                } => {
                    remaining = r;
                    partial_success = p;
                }
                Outcome::Abandoned => {}
            }
        }
    }

    async fn try_method(&mut self, user: &str, method: auth::Method) -> Result<Outcome, Error> {
        let signer = match &method {
            auth::Method::PublicKey { key } => Some(key.clone()),
            auth::Method::Hostbased { key, .. } => Some(key.clone()),
            _ => None,
        };
        self.sender
            .send(Msg::Authenticate {
                user: user.to_string(),
                method,
            })
            .await
            .map_err(|_| Error::NotConnected)?;
        loop {
            match self.receiver.recv().await {
                Some(Reply::AuthSuccess) => return Ok(Outcome::Success),
                Some(Reply::AuthFailure {
                    remaining,
                    partial_success,
                }) => {
                    return Ok(Outcome::Failure {
                        remaining,
                        partial_success,
                    })
                }
                Some(Reply::SignRequest { data, .. }) => {
                    let key = match &signer {
                        Some(key) => key.clone(),
                        None => {
                            debug!("sign request without a signing key");
                            return Ok(Outcome::Abandoned);
                        }
                    };
                    match key.sign_detached(&data) {
                        Ok(sig) => {
                            let signature = auth::signature_bytes(&sig);
                            self.sender
                                .send(Msg::Signed {
                                    signature: CryptoVec::from_slice(&signature),
                                })
                                .await
                                .map_err(|_| Error::NotConnected)?;
                        }
                        Err(e) => {
                            error!("could not sign the authentication challenge: {}", e);
                            return Ok(Outcome::Abandoned);
                        }
                    }
                }
                None => return Err(Error::NoResponse),
            }
        }
    }

    /// Try every key the agent holds, in agent order. A failure or a
    /// bad signature advances to the next key, not the next method.
    async fn try_agent_keys<A: Agent>(
        &mut self,
        user: &str,
        agent: Option<&mut A>,
    ) -> Result<Outcome, Error> {
        let agent = match agent {
            Some(agent) => agent,
            None => {
                debug!("agent method configured but no agent available");
                return Ok(Outcome::Abandoned);
            }
        };
        let keys = match agent.request_identities().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("could not list agent identities: {}", e);
                return Ok(Outcome::Abandoned);
            }
        };
        if keys.is_empty() {
            debug!("the agent holds no identities");
            return Ok(Outcome::Abandoned);
        }
        let mut last_failure = None;
        'keys: for key in keys {
            self.sender
                .send(Msg::Authenticate {
                    user: user.to_string(),
                    method: auth::Method::FuturePublicKey { key: key.clone() },
                })
                .await
                .map_err(|_| Error::NotConnected)?;
            loop {
                match self.receiver.recv().await {
                    Some(Reply::AuthSuccess) => return Ok(Outcome::Success),
                    Some(Reply::AuthFailure {
                        remaining,
                        partial_success,
                    }) => {
                        last_failure = Some((remaining, partial_success));
                        continue 'keys;
                    }
                    Some(Reply::SignRequest { algo, data }) => {
                        let blob = match agent.sign_request(&key, data).await {
                            Ok(blob) => blob,
                            Err(e) => {
                                warn!("the agent could not sign with {:?}: {}", key, e);
                                continue 'keys;
                            }
                        };
                        let (actual, signature) = match auth::parse_signature_blob(&blob) {
                            Ok(parsed) => parsed,
                            Err(e) => {
                                warn!("unparseable agent signature: {}", e);
                                continue 'keys;
                            }
                        };
                        if actual != algo {
                            let e = Error::SignatureTypeMismatch {
                                expected: algo,
                                actual,
                            };
                            warn!("{}", e);
                            continue 'keys;
                        }
                        self.sender
                            .send(Msg::Signed {
                                signature: CryptoVec::from_slice(&signature),
                            })
                            .await
                            .map_err(|_| Error::NotConnected)?;
                    }
                    None => return Err(Error::NoResponse),
                }
            }
        }
        Ok(match last_failure {
            Some((remaining, partial_success)) => Outcome::Failure {
                remaining,
                partial_success,
            },
            None => Outcome::Abandoned,
        })
    }

    async fn wait_channel_confirmation(
        &self,
        mut receiver: UnboundedReceiver<OpenChannelMsg>,
    ) -> Result<Channel, Error> {
        loop {
            match receiver.recv().await {
                Some(OpenChannelMsg::Open {
                    id,
                    max_packet_size,
                    window_size,
                }) => {
                    return Ok(Channel {
                        sender: ChannelSender {
                            sender: self.sender.clone(),
                            id,
                        },
                        receiver,
                        max_packet_size,
                        window_size,
                        buffered: VecDeque::new(),
                    });
                }
                Some(OpenChannelMsg::OpenFailure(e)) => return Err(e),
                Some(msg) => {
                    debug!("msg = {:?}", msg);
                }
                None => return Err(Error::NoResponse),
            }
        }
    }

    /// Request a session channel (the most basic type of channel).
    /// The returned channel is confirmed and usable.
    pub async fn channel_open_session(&mut self) -> Result<Channel, Error> {
        let (pipe, receiver) = unbounded_channel();
        self.sender
            .send(Msg::ChannelOpenSession { pipe })
            .await
            .map_err(|_| Error::NotConnected)?;
        self.wait_channel_confirmation(receiver).await
    }

    /// Open a TCP/IP forwarding channel. This is usually done when a
    /// connection comes to a locally forwarded TCP/IP port. See
    /// [RFC4254](https://tools.ietf.org/html/rfc4254#section-7). The
    /// TCP/IP packets can then be tunneled through the channel using
    /// `.data()`.
    pub async fn channel_open_direct_tcpip<A: Into<String>, B: Into<String>>(
        &mut self,
        host_to_connect: A,
        port_to_connect: u32,
        originator_address: B,
        originator_port: u32,
    ) -> Result<Channel, Error> {
        let (pipe, receiver) = unbounded_channel();
        self.sender
            .send(Msg::ChannelOpenDirectTcpIp {
                host_to_connect: host_to_connect.into(),
                port_to_connect,
                originator_address: originator_address.into(),
                originator_port,
                pipe,
            })
            .await
            .map_err(|_| Error::NotConnected)?;
        self.wait_channel_confirmation(receiver).await
    }

    /// Open a channel to a Unix socket on the server
    /// (`direct-streamlocal@openssh.com`). Subject to the
    /// `strict_vendor` check.
    pub async fn channel_open_direct_streamlocal<A: Into<String>>(
        &mut self,
        socket_path: A,
    ) -> Result<Channel, Error> {
        let (pipe, receiver) = unbounded_channel();
        self.sender
            .send(Msg::ChannelOpenDirectStreamLocal {
                socket_path: socket_path.into(),
                pipe,
            })
            .await
            .map_err(|_| Error::NotConnected)?;
        self.wait_channel_confirmation(receiver).await
    }

    async fn run_channel_setup(
        &mut self,
        channel: &mut Channel,
        opts: &CommandOptions,
        default_pty: bool,
    ) -> Result<(), Error> {
        if (opts.agent_forward || self.config.agent_forward) && self.config.agent.is_some() {
            channel.request_agent_forward(true).await?;
        }
        for (name, value) in &opts.env {
            channel.set_env(name.clone(), value.clone()).await?;
        }
        let pty = match &opts.pty {
            PtySetting::Auto if default_pty => Some(PtyRequest::default()),
            PtySetting::Auto | PtySetting::Disabled => None,
            PtySetting::Request(request) => Some(request.clone()),
        };
        if let Some(request) = pty {
            channel
                .request_pty(
                    true,
                    &request.term,
                    request.col_width,
                    request.row_height,
                    request.pix_width,
                    request.pix_height,
                    &request.terminal_modes,
                )
                .await?;
        }
        if let Some(x11) = &opts.x11 {
            channel
                .request_x11(
                    true,
                    x11.single_connection,
                    &x11.x11_authentication_protocol,
                    &x11.x11_authentication_cookie,
                    x11.x11_screen_number,
                )
                .await?;
        }
        Ok(())
    }

    async fn prepare_session_channel(
        &mut self,
        opts: &CommandOptions,
        default_pty: bool,
    ) -> Result<Channel, Error> {
        let mut channel = self.channel_open_session().await?;
        if let Err(e) = self.run_channel_setup(&mut channel, opts, default_pty).await {
            channel.close().await.unwrap_or(());
            return Err(e);
        }
        Ok(channel)
    }

    /// Execute a remote command. The setup requests implied by `opts`
    /// run first, in order, each confirmed by the server before the
    /// next; any refusal closes the channel and fails the call.
    pub async fn exec<A: Into<String>>(
        &mut self,
        command: A,
        opts: CommandOptions,
    ) -> Result<Channel, Error> {
        let mut channel = self.prepare_session_channel(&opts, false).await?;
        if let Err(e) = channel.exec(true, command).await {
            channel.close().await.unwrap_or(());
            return Err(e);
        }
        Ok(channel)
    }

    /// Start a remote shell. Unless `opts` says otherwise, a default
    /// pty is requested first.
    pub async fn shell(&mut self, opts: CommandOptions) -> Result<Channel, Error> {
        let mut channel = self.prepare_session_channel(&opts, true).await?;
        if let Err(e) = channel.request_shell(true).await {
            channel.close().await.unwrap_or(());
            return Err(e);
        }
        Ok(channel)
    }

    /// Start a named subsystem on a fresh session channel.
    pub async fn subsystem<A: Into<String>>(
        &mut self,
        name: A,
        opts: CommandOptions,
    ) -> Result<Channel, Error> {
        let mut channel = self.prepare_session_channel(&opts, false).await?;
        if let Err(e) = channel.request_subsystem(true, name).await {
            channel.close().await.unwrap_or(());
            return Err(e);
        }
        Ok(channel)
    }

    /// Start the `sftp` subsystem. The returned channel carries raw
    /// SFTP packets, to be driven by an SFTP client implementation.
    pub async fn sftp(&mut self) -> Result<Channel, Error> {
        self.subsystem("sftp", CommandOptions::default()).await
    }

    /// Ask the server to listen on `address:port` and forward every
    /// connection to us (as `server_channel_open_forwarded_tcpip`
    /// events). With port 0, the port the server actually bound is
    /// returned.
    pub async fn tcpip_forward<A: Into<String>>(
        &mut self,
        address: A,
        port: u32,
    ) -> Result<u32, Error> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(Msg::TcpIpForward {
                address: address.into(),
                port,
                reply,
            })
            .await
            .map_err(|_| Error::NotConnected)?;
        rx.await.map_err(|_| Error::NoResponse)?
    }

    /// Cancel a previous forwarding request.
    pub async fn cancel_tcpip_forward<A: Into<String>>(
        &mut self,
        address: A,
        port: u32,
    ) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(Msg::CancelTcpIpForward {
                address: address.into(),
                port,
                reply,
            })
            .await
            .map_err(|_| Error::NotConnected)?;
        rx.await.map_err(|_| Error::NoResponse)?
    }

    /// Ask the server to forward a Unix socket to us
    /// (`streamlocal-forward@openssh.com`). Subject to the
    /// `strict_vendor` check.
    pub async fn streamlocal_forward<A: Into<String>>(
        &mut self,
        socket_path: A,
    ) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(Msg::StreamLocalForward {
                socket_path: socket_path.into(),
                reply,
            })
            .await
            .map_err(|_| Error::NotConnected)?;
        rx.await.map_err(|_| Error::NoResponse)?
    }

    /// Cancel a Unix socket forwarding. Subject to the `strict_vendor`
    /// check.
    pub async fn cancel_streamlocal_forward<A: Into<String>>(
        &mut self,
        socket_path: A,
    ) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(Msg::CancelStreamLocalForward {
                socket_path: socket_path.into(),
                reply,
            })
            .await
            .map_err(|_| Error::NotConnected)?;
        rx.await.map_err(|_| Error::NoResponse)?
    }

    /// Tell the server we will not open any more sessions
    /// (`no-more-sessions@openssh.com`). Subject to the
    /// `strict_vendor` check.
    pub async fn no_more_sessions(&mut self) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(Msg::NoMoreSessions { reply })
            .await
            .map_err(|_| Error::NotConnected)?;
        rx.await.map_err(|_| Error::NoResponse)?
    }

    /// Send a disconnect message and close the connection cleanly.
    /// Safe to call more than once.
    pub async fn disconnect(&mut self, reason: Disconnect, description: &str) {
        self.sender
            .send(Msg::Disconnect {
                reason,
                description: description.to_string(),
            })
            .await
            .unwrap_or(());
    }

    /// Drop the connection on the floor, without telling the server.
    pub async fn abort(&mut self) {
        self.sender.send(Msg::Abort).await.unwrap_or(());
    }
}

impl<H: Handler> Future for Handle<H> {
    type Output = Result<(), H::Error>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match Future::poll(Pin::new(&mut self.join), cx) {
            Poll::Ready(r) => Poll::Ready(match r {
                Ok(Ok(x)) => Ok(x),
                Err(e) => Err(H::Error::from(crate::Error::from(e))),
                Ok(Err(e)) => Err(e),
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Clone)]
pub struct ChannelSender {
    sender: Sender<Msg>,
    id: ChannelId,
}

/// The user half of a channel: reads server messages with
/// [`Channel::wait`], writes with [`Channel::data`], and issues
/// channel requests. Requests sent with `want_reply` resolve in the
/// order they were submitted.
pub struct Channel {
    sender: ChannelSender,
    receiver: UnboundedReceiver<OpenChannelMsg>,
    max_packet_size: u32,
    window_size: u32,
    buffered: VecDeque<ChannelMsg>,
}

fn reply_pair(
    want_reply: bool,
) -> (Option<oneshot::Sender<bool>>, Option<oneshot::Receiver<bool>>) {
    if want_reply {
        let (tx, rx) = oneshot::channel();
        (Some(tx), Some(rx))
    } else {
        (None, None)
    }
}

async fn await_reply(rx: Option<oneshot::Receiver<bool>>) -> Result<(), Error> {
    match rx {
        None => Ok(()),
        Some(rx) => match rx.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::RequestDenied),
            Err(_) => Err(Error::NoResponse),
        },
    }
}

impl Channel {
    pub fn id(&self) -> ChannelId {
        self.sender.id
    }

    /// Returns the min between the maximum packet size and the
    /// remaining window size in the channel.
    pub fn writable_packet_size(&self) -> usize {
        self.max_packet_size.min(self.window_size) as usize
    }

    async fn send_msg(&mut self, msg: Msg) -> Result<(), Error> {
        self.sender
            .sender
            .send(msg)
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Request a pseudo-terminal with the given characteristics.
    pub async fn request_pty(
        &mut self,
        want_reply: bool,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        terminal_modes: &[(Pty, u32)],
    ) -> Result<(), Error> {
        let (reply, rx) = reply_pair(want_reply);
        let id = self.sender.id;
        self.send_msg(Msg::RequestPty {
            id,
            want_reply,
            term: term.to_string(),
            col_width,
            row_height,
            pix_width,
            pix_height,
            terminal_modes: terminal_modes.to_vec(),
            reply,
        })
        .await?;
        await_reply(rx).await
    }

    /// Request a remote shell.
    pub async fn request_shell(&mut self, want_reply: bool) -> Result<(), Error> {
        let (reply, rx) = reply_pair(want_reply);
        let id = self.sender.id;
        self.send_msg(Msg::RequestShell { id, reply }).await?;
        await_reply(rx).await
    }

    /// Execute a remote program (will be passed to a shell). This can
    /// be used to implement scp (by calling a remote scp and
    /// tunneling to its standard input).
    pub async fn exec<A: Into<String>>(
        &mut self,
        want_reply: bool,
        command: A,
    ) -> Result<(), Error> {
        let (reply, rx) = reply_pair(want_reply);
        let id = self.sender.id;
        self.send_msg(Msg::Exec {
            id,
            command: command.into(),
            reply,
        })
        .await?;
        await_reply(rx).await
    }

    /// Request the start of a subsystem with the given name.
    pub async fn request_subsystem<A: Into<String>>(
        &mut self,
        want_reply: bool,
        name: A,
    ) -> Result<(), Error> {
        let (reply, rx) = reply_pair(want_reply);
        let id = self.sender.id;
        self.send_msg(Msg::RequestSubsystem {
            id,
            name: name.into(),
            reply,
        })
        .await?;
        await_reply(rx).await
    }

    /// Request X11 forwarding through an already opened X11
    /// channel. See
    /// [RFC4254](https://tools.ietf.org/html/rfc4254#section-6.3.1)
    /// for security issues related to cookies.
    pub async fn request_x11<A: Into<String>, B: Into<String>>(
        &mut self,
        want_reply: bool,
        single_connection: bool,
        x11_authentication_protocol: A,
        x11_authentication_cookie: B,
        x11_screen_number: u32,
    ) -> Result<(), Error> {
        let (reply, rx) = reply_pair(want_reply);
        let id = self.sender.id;
        self.send_msg(Msg::RequestX11 {
            id,
            single_connection,
            x11_authentication_protocol: x11_authentication_protocol.into(),
            x11_authentication_cookie: x11_authentication_cookie.into(),
            x11_screen_number,
            reply,
        })
        .await?;
        await_reply(rx).await
    }

    /// Set a remote environment variable. Env requests never expect a
    /// reply, so this resolves as soon as the request is on its way.
    pub async fn set_env<A: Into<String>, B: Into<String>>(
        &mut self,
        variable_name: A,
        variable_value: B,
    ) -> Result<(), Error> {
        let id = self.sender.id;
        self.send_msg(Msg::SetEnv {
            id,
            variable_name: variable_name.into(),
            variable_value: variable_value.into(),
        })
        .await
    }

    /// Request agent forwarding for this channel
    /// (`auth-agent-req@openssh.com`).
    pub async fn request_agent_forward(&mut self, want_reply: bool) -> Result<(), Error> {
        let (reply, rx) = reply_pair(want_reply);
        let id = self.sender.id;
        self.send_msg(Msg::AgentForward { id, reply }).await?;
        await_reply(rx).await
    }

    /// Signal a remote process.
    pub async fn signal(&mut self, signal: Sig) -> Result<(), Error> {
        let id = self.sender.id;
        self.send_msg(Msg::Signal { id, signal }).await
    }

    /// Inform the server that our window size has changed.
    pub async fn window_change(
        &mut self,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    ) -> Result<(), Error> {
        let id = self.sender.id;
        self.send_msg(Msg::WindowChange {
            id,
            col_width,
            row_height,
            pix_width,
            pix_height,
        })
        .await
    }

    /// Send data to a channel.
    pub async fn data<R: AsyncRead + Unpin>(&mut self, data: R) -> Result<(), Error> {
        self.send_data(None, data).await
    }

    /// Send data to a channel on the given extended stream.
    pub async fn extended_data<R: AsyncRead + Unpin>(
        &mut self,
        ext: u32,
        data: R,
    ) -> Result<(), Error> {
        self.send_data(Some(ext), data).await
    }

    async fn send_data<R: AsyncRead + Unpin>(
        &mut self,
        ext: Option<u32>,
        mut data: R,
    ) -> Result<(), Error> {
        loop {
            // Wait for the window to be restored.
            while self.window_size == 0 {
                match self.receiver.recv().await {
                    Some(OpenChannelMsg::Msg(ChannelMsg::WindowAdjusted { new_size })) => {
                        debug!("window adjusted: {:?}", new_size);
                        self.window_size = new_size;
                        break;
                    }
                    Some(OpenChannelMsg::Msg(msg)) => self.buffered.push_back(msg),
                    Some(msg) => debug!("unexpected channel msg: {:?}", msg),
                    None => return Err(Error::NotConnected),
                }
            }
            let sendable = self.window_size.min(self.max_packet_size) as usize;
            let mut c = CryptoVec::new_zeroed(sendable);
            let n = data.read(&mut c[..]).await?;
            c.resize(n);
            self.window_size -= n as u32;
            self.send_data_packet(ext, c).await?;
            if n == 0 {
                break;
            }
        }
        Ok(())
    }

    async fn send_data_packet(&mut self, ext: Option<u32>, data: CryptoVec) -> Result<(), Error> {
        let id = self.sender.id;
        self.send_msg(if let Some(ext) = ext {
            Msg::ExtendedData { id, ext, data }
        } else {
            Msg::Data { id, data }
        })
        .await
    }

    /// Signal that we will send no more data on this channel.
    pub async fn eof(&mut self) -> Result<(), Error> {
        let id = self.sender.id;
        self.send_msg(Msg::Eof { id }).await
    }

    /// Close the channel.
    pub async fn close(&mut self) -> Result<(), Error> {
        let id = self.sender.id;
        self.send_msg(Msg::Close { id }).await
    }

    /// Wait for the next message from the server on this channel.
    /// `None` means the channel (or the whole connection) is gone.
    pub async fn wait(&mut self) -> Option<ChannelMsg> {
        if let Some(msg) = self.buffered.pop_front() {
            return Some(msg);
        }
        loop {
            match self.receiver.recv().await {
                Some(OpenChannelMsg::Msg(ChannelMsg::WindowAdjusted { new_size })) => {
                    self.window_size = new_size;
                    return Some(ChannelMsg::WindowAdjusted { new_size });
                }
                Some(OpenChannelMsg::Msg(msg)) => return Some(msg),
                Some(msg) => {
                    debug!("unexpected channel msg: {:?}", msg);
                }
                None => return None,
            }
        }
    }
}

async fn resolve(config: &Config) -> Result<std::net::SocketAddr, Error> {
    let addrs = tokio::net::lookup_host((config.host.as_str(), config.port))
        .await
        .map_err(|_| Error::Dns(config.host.clone()))?;
    addrs
        .filter(|addr| match config.address_family {
            AddressFamily::Any => true,
            AddressFamily::V4 => addr.is_ipv4(),
            AddressFamily::V6 => addr.is_ipv6(),
        })
        .next()
        .ok_or_else(|| Error::Dns(config.host.clone()))
}

/// Resolve `config.host`, dial it and run a session over the socket.
pub async fn connect<H, T>(
    config: Arc<Config>,
    handler: H,
    transport: T,
) -> Result<Handle<H>, H::Error>
where
    H: Handler + Send + 'static,
    T: Transport,
{
    let addr = resolve(&config).await.map_err(H::Error::from)?;
    let socket = TcpStream::connect(addr).await.map_err(crate::Error::from)?;
    socket.set_nodelay(true).map_err(crate::Error::from)?;
    connect_stream(config, socket, handler, transport).await
}

/// Run a session over an already-established stream (a proxied
/// connection, a Unix socket, an in-memory pipe in tests).
pub async fn connect_stream<H, R, T>(
    config: Arc<Config>,
    stream: R,
    handler: H,
    transport: T,
) -> Result<Handle<H>, H::Error>
where
    H: Handler + Send + 'static,
    R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: Transport,
{
    if config.username.is_empty() {
        return Err(H::Error::from(Error::MissingUsername));
    }
    if config.agent_forward && config.agent.is_none() {
        return Err(H::Error::from(Error::AgentForwardWithoutAgent));
    }
    if config.maximum_packet_size > 65535 {
        error!(
            "Maximum packet size ({:?}) should not be larger than a TCP packet (65535)",
            config.maximum_packet_size
        );
    }
    let (sender, receiver) = channel(10);
    let (reply_sender, reply_receiver) = unbounded_channel();
    let session = Session {
        config: config.clone(),
        transport,
        receiver,
        sender: reply_sender,
        handle_sender: sender.clone(),
        channels: ChannelManager::new(config.max_channels),
        global_queue: VecDeque::new(),
        tcp_forwardings: HashMap::new(),
        unix_forwardings: HashSet::new(),
        accept_x11: 0,
        agent_forward_enabled: false,
        auth_user: String::new(),
        auth_method: None,
        service_requested: false,
        service_accepted: false,
        authenticated: false,
        remote_ident: String::new(),
        keepalive_misses: 0,
        keepalive_rearm: false,
        disconnected: false,
        child_tasks: Vec::new(),
    };
    let join = tokio::spawn(session.run(stream, handler));
    Ok(Handle {
        config,
        sender,
        receiver: reply_receiver,
        join,
    })
}

/// Does this identification line belong to an OpenSSH version with
/// usable vendor extensions (major version 5 or newer)?
pub(crate) fn is_openssh(ident: &str) -> bool {
    // e.g. "SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.1"
    let software = ident.splitn(3, '-').nth(2).unwrap_or("");
    let rest = match software.strip_prefix("OpenSSH_") {
        Some(rest) => rest,
        None => return false,
    };
    let digits = rest
        .as_bytes()
        .iter()
        .take_while(|c| c.is_ascii_digit())
        .count();
    match digits {
        0 => false,
        1 => rest.as_bytes()[0] >= b'5',
        _ => true,
    }
}

const DISABLED_TIMER: Duration = Duration::from_secs(86400 * 365);

pub(crate) struct Session<T: Transport> {
    config: Arc<Config>,
    transport: T,
    receiver: Receiver<Msg>,
    sender: UnboundedSender<Reply>,
    /// Used to hand out `Channel` objects for server-initiated opens.
    handle_sender: Sender<Msg>,
    channels: ChannelManager,
    global_queue: VecDeque<GlobalReply>,
    /// `(address, port) -> actual port` for active remote forwards.
    tcp_forwardings: HashMap<(String, u32), u32>,
    unix_forwardings: HashSet<String>,
    /// How many channels successfully requested X11 forwarding.
    accept_x11: u32,
    /// Latched by the first successful agent-forward request.
    agent_forward_enabled: bool,
    auth_user: String,
    auth_method: Option<auth::Method>,
    service_requested: bool,
    service_accepted: bool,
    authenticated: bool,
    remote_ident: String,
    keepalive_misses: u32,
    keepalive_rearm: bool,
    disconnected: bool,
    child_tasks: Vec<JoinHandle<()>>,
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        debug!("drop session")
    }
}

impl<T: Transport> Session<T> {
    async fn run<H, R>(mut self, stream: R, mut handler: H) -> Result<(), H::Error>
    where
        H: Handler + Send,
        R: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut stream_read, mut stream_write) = tokio::io::split(stream);
        let mut read_buf = vec![0u8; 65536];
        let mut events = VecDeque::new();

        let keepalive_enabled = self.config.keepalive_interval.is_some();
        let keepalive_period = self.config.keepalive_interval.unwrap_or(DISABLED_TIMER);
        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + keepalive_period,
            keepalive_period,
        );
        let mut ready_armed = self.config.ready_timeout.is_some();
        let ready_deadline =
            tokio::time::sleep(self.config.ready_timeout.unwrap_or(DISABLED_TIMER));
        tokio::pin!(ready_deadline);

        let result: Result<(), H::Error> = loop {
            tokio::select! {
                r = stream_read.read(&mut read_buf) => {
                    match r {
                        Ok(0) => {
                            if !self.disconnected && self.remote_ident.is_empty() {
                                break Err(crate::Error::HandshakeAborted.into());
                            }
                            break Ok(());
                        }
                        Ok(n) => {
                            if let Err(e) = self.transport.parse(&read_buf[..n], &mut events) {
                                if e.level() == ErrorLevel::Handshake {
                                    ready_armed = false;
                                }
                                break Err(e.into());
                            }
                            let mut fatal = None;
                            while let Some(event) = events.pop_front() {
                                if let Err(e) = self.handle_event(event, &mut handler).await {
                                    fatal = Some(e);
                                    break;
                                }
                            }
                            if let Some(e) = fatal {
                                break Err(e);
                            }
                        }
                        Err(e) => break Err(crate::Error::from(e).into()),
                    }
                }
                msg = self.receiver.recv() => {
                    match msg {
                        Some(msg) => self.handle_msg(msg),
                        None => self.disconnected = true,
                    }
                }
                _ = keepalive.tick(), if keepalive_enabled => {
                    self.keepalive_misses += 1;
                    if self.keepalive_misses > self.config.keepalive_count_max {
                        break Err(crate::Error::KeepaliveTimeout.into());
                    }
                    debug!("keepalive ping ({} unanswered)", self.keepalive_misses);
                    self.transport.ping();
                    self.global_queue.push_back(GlobalReply::Keepalive);
                }
                _ = &mut ready_deadline, if ready_armed && !self.authenticated => {
                    break Err(crate::Error::ConnectionTimeout.into());
                }
            }
            if self.authenticated {
                ready_armed = false;
            }
            if self.keepalive_rearm {
                self.keepalive_rearm = false;
                keepalive.reset();
            }
            let out = self.transport.take_output();
            if !out.is_empty() {
                if let Err(e) = stream_write.write_all(&out).await {
                    break Err(crate::Error::from(e).into());
                }
                if let Err(e) = stream_write.flush().await {
                    break Err(crate::Error::from(e).into());
                }
            }
            if self.disconnected {
                break Ok(());
            }
        };
        // Push out whatever is still buffered (our own disconnect,
        // channel failure replies) before tearing down.
        let out = self.transport.take_output();
        if !out.is_empty() {
            stream_write.write_all(&out).await.unwrap_or(());
            stream_write.flush().await.unwrap_or(());
        }
        let teardown_result = self.teardown(&mut handler).await;
        stream_write.shutdown().await.unwrap_or(());
        debug!("session finished");
        result.and(teardown_result)
    }

    /// The single cleanup path: every pending continuation, channel
    /// and global, is resolved exactly once.
    async fn teardown<H: Handler>(&mut self, handler: &mut H) -> Result<(), H::Error> {
        self.transport.cleanup();
        for entry in std::mem::take(&mut self.global_queue) {
            entry.fail(Error::NoResponse);
        }
        for slot in self.channels.drain() {
            match slot {
                Slot::Pending(pipe) => {
                    pipe.send(OpenChannelMsg::OpenFailure(Error::NoResponse))
                        .unwrap_or(());
                }
                Slot::Live(mut state) => {
                    // Dropping the reply senders resolves their
                    // callers with `NoResponse`.
                    state.pending_replies.clear();
                    state.send(ChannelMsg::Close);
                }
            }
        }
        for task in self.child_tasks.drain(..) {
            task.abort();
        }
        handler.disconnected().await
    }

    fn vendor_ok(&self) -> bool {
        !self.config.strict_vendor || is_openssh(&self.remote_ident)
    }

    /// Reserve the reply slot for a channel request and return the
    /// peer's channel number, or resolve the reply with a denial when
    /// the channel cannot take requests.
    fn begin_request(
        &mut self,
        id: ChannelId,
        kind: ReplyKind,
        reply: Option<oneshot::Sender<bool>>,
    ) -> Option<u32> {
        match self.channels.live_mut(id) {
            Some(state) if state.outgoing_state == StreamState::Open => {
                let remote_id = state.remote_id;
                if reply.is_some() {
                    state.pending_replies.push_back((kind, reply));
                }
                Some(remote_id)
            }
            _ => {
                debug!("request on a channel that cannot take one: {:?}", id);
                if let Some(tx) = reply {
                    let _ = tx.send(false);
                }
                None
            }
        }
    }

    fn open_local_channel(
        &mut self,
        pipe: UnboundedSender<OpenChannelMsg>,
    ) -> Option<ChannelId> {
        if !self.authenticated {
            pipe.send(OpenChannelMsg::OpenFailure(Error::NotAuthenticated))
                .unwrap_or(());
            return None;
        }
        match self.channels.add(Slot::Pending(pipe.clone())) {
            Some(id) => Some(id),
            None => {
                pipe.send(OpenChannelMsg::OpenFailure(Error::ChannelIdsExhausted))
                    .unwrap_or(());
                None
            }
        }
    }

    fn handle_msg(&mut self, msg: Msg) {
        match msg {
            Msg::Authenticate { user, method } => {
                self.auth_user = user;
                self.auth_method = Some(method);
                if !self.service_requested {
                    self.transport.service_request("ssh-userauth");
                    self.service_requested = true;
                }
                if self.service_accepted {
                    self.emit_auth_request();
                }
            }
            Msg::Signed { signature } => self.emit_signed_auth(signature),
            Msg::ChannelOpenSession { pipe } => {
                if let Some(id) = self.open_local_channel(pipe) {
                    self.transport.channel_open_session(
                        id,
                        self.config.window_size,
                        self.config.maximum_packet_size,
                    );
                }
            }
            Msg::ChannelOpenDirectTcpIp {
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
                pipe,
            } => {
                if let Some(id) = self.open_local_channel(pipe) {
                    self.transport.channel_open_direct_tcpip(
                        id,
                        self.config.window_size,
                        self.config.maximum_packet_size,
                        &host_to_connect,
                        port_to_connect,
                        &originator_address,
                        originator_port,
                    );
                }
            }
            Msg::ChannelOpenDirectStreamLocal { socket_path, pipe } => {
                if !self.vendor_ok() {
                    pipe.send(OpenChannelMsg::OpenFailure(Error::VendorMismatch))
                        .unwrap_or(());
                } else if let Some(id) = self.open_local_channel(pipe) {
                    self.transport.channel_open_direct_streamlocal(
                        id,
                        self.config.window_size,
                        self.config.maximum_packet_size,
                        &socket_path,
                    );
                }
            }
            Msg::TcpIpForward {
                address,
                port,
                reply,
            } => {
                self.transport.tcpip_forward(&address, port, true);
                self.global_queue.push_back(GlobalReply::TcpIpForward {
                    address,
                    port,
                    reply,
                });
            }
            Msg::CancelTcpIpForward {
                address,
                port,
                reply,
            } => {
                self.transport.cancel_tcpip_forward(&address, port, true);
                self.global_queue
                    .push_back(GlobalReply::CancelTcpIpForward {
                        address,
                        port,
                        reply,
                    });
            }
            Msg::StreamLocalForward { socket_path, reply } => {
                if !self.vendor_ok() {
                    let _ = reply.send(Err(Error::VendorMismatch));
                    return;
                }
                self.transport.streamlocal_forward(&socket_path, true);
                self.global_queue
                    .push_back(GlobalReply::StreamLocalForward { socket_path, reply });
            }
            Msg::CancelStreamLocalForward { socket_path, reply } => {
                if !self.vendor_ok() {
                    let _ = reply.send(Err(Error::VendorMismatch));
                    return;
                }
                self.transport.cancel_streamlocal_forward(&socket_path, true);
                self.global_queue
                    .push_back(GlobalReply::CancelStreamLocalForward { socket_path, reply });
            }
            Msg::NoMoreSessions { reply } => {
                if !self.vendor_ok() {
                    let _ = reply.send(Err(Error::VendorMismatch));
                    return;
                }
                self.transport.no_more_sessions(true);
                self.global_queue
                    .push_back(GlobalReply::NoMoreSessions { reply });
            }
            Msg::RequestPty {
                id,
                want_reply,
                term,
                col_width,
                row_height,
                pix_width,
                pix_height,
                terminal_modes,
                reply,
            } => {
                if let Some(remote_id) = self.begin_request(id, ReplyKind::Generic, reply) {
                    self.transport.channel_request_pty(
                        remote_id,
                        want_reply,
                        &term,
                        col_width,
                        row_height,
                        pix_width,
                        pix_height,
                        &terminal_modes,
                    );
                }
            }
            Msg::RequestShell { id, reply } => {
                let want_reply = reply.is_some();
                if let Some(remote_id) = self.begin_request(id, ReplyKind::Generic, reply) {
                    self.transport.channel_request_shell(remote_id, want_reply);
                }
            }
            Msg::Exec { id, command, reply } => {
                let want_reply = reply.is_some();
                if let Some(remote_id) = self.begin_request(id, ReplyKind::Generic, reply) {
                    self.transport
                        .channel_request_exec(remote_id, want_reply, &command);
                }
            }
            Msg::RequestSubsystem { id, name, reply } => {
                let want_reply = reply.is_some();
                if let Some(remote_id) = self.begin_request(id, ReplyKind::Generic, reply) {
                    self.transport
                        .channel_request_subsystem(remote_id, want_reply, &name);
                }
            }
            Msg::RequestX11 {
                id,
                single_connection,
                x11_authentication_protocol,
                x11_authentication_cookie,
                x11_screen_number,
                reply,
            } => {
                let want_reply = reply.is_some();
                if let Some(remote_id) = self.begin_request(id, ReplyKind::X11, reply) {
                    self.transport.channel_request_x11(
                        remote_id,
                        want_reply,
                        single_connection,
                        &x11_authentication_protocol,
                        &x11_authentication_cookie,
                        x11_screen_number,
                    );
                }
            }
            Msg::SetEnv {
                id,
                variable_name,
                variable_value,
            } => {
                // Env requests are fire-and-forget and stay out of the
                // reply queue.
                if let Some(remote_id) = self.begin_request(id, ReplyKind::Generic, None) {
                    self.transport
                        .channel_request_env(remote_id, &variable_name, &variable_value);
                }
            }
            Msg::AgentForward { id, reply } => {
                let want_reply = reply.is_some();
                if let Some(remote_id) = self.begin_request(id, ReplyKind::AgentForward, reply) {
                    self.transport
                        .channel_request_agent_forward(remote_id, want_reply);
                }
            }
            Msg::WindowChange {
                id,
                col_width,
                row_height,
                pix_width,
                pix_height,
            } => {
                if let Some(remote_id) = self.begin_request(id, ReplyKind::Generic, None) {
                    self.transport.channel_request_window_change(
                        remote_id, col_width, row_height, pix_width, pix_height,
                    );
                }
            }
            Msg::Signal { id, signal } => {
                if let Some(remote_id) = self.begin_request(id, ReplyKind::Generic, None) {
                    self.transport.channel_request_signal(remote_id, &signal);
                }
            }
            Msg::Data { id, data } => {
                let transport = &mut self.transport;
                if let Some(state) = self.channels.live_mut(id) {
                    if state.confirmed && state.outgoing_state == StreamState::Open {
                        state.data(transport, data, None);
                    } else {
                        debug!("data on a non-open channel {:?}", id);
                    }
                }
            }
            Msg::ExtendedData { id, ext, data } => {
                let transport = &mut self.transport;
                if let Some(state) = self.channels.live_mut(id) {
                    if state.confirmed && state.outgoing_state == StreamState::Open {
                        state.data(transport, data, Some(ext));
                    } else {
                        debug!("extended data on a non-open channel {:?}", id);
                    }
                }
            }
            Msg::Eof { id } => {
                let transport = &mut self.transport;
                if let Some(state) = self.channels.live_mut(id) {
                    if state.outgoing_state == StreamState::Open {
                        transport.channel_eof(state.remote_id);
                        state.outgoing_state = StreamState::Eof;
                    }
                }
            }
            Msg::Close { id } => {
                let transport = &mut self.transport;
                if let Some(state) = self.channels.live_mut(id) {
                    if !state.close_sent {
                        transport.channel_close(state.remote_id);
                        state.close_sent = true;
                        state.outgoing_state = StreamState::Closed;
                    }
                }
            }
            Msg::Disconnect {
                reason,
                description,
            } => {
                if !self.disconnected {
                    self.transport.disconnect(reason, &description);
                    self.disconnected = true;
                }
            }
            Msg::Abort => {
                self.disconnected = true;
            }
        }
    }
}
