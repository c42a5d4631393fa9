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

//! End-to-end tests over a scripted transport: the "server" side of
//! each test watches the operations the client emits and answers with
//! protocol events, exactly as a real peer would.

use async_trait::async_trait;
use cryptovec::CryptoVec;
use sshmux::agent::Agent;
use sshmux::auth::{DefaultHandler, Method, MethodSet, Prompt};
use sshmux::client::{self, CommandOptions, Config, ForwardedTcpIpParams, PtySetting};
use sshmux::transport::{
    ChannelOpenKind, ChannelRequestKind, CompatFlags, Transport, TransportEvent,
};
use sshmux::{ChannelId, ChannelMsg, ChannelOpenFailure, Disconnect, Error, Pty, Sig};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thrussh_keys::encoding::Encoding;
use thrussh_keys::key;
use thrussh_keys::PublicKeyBase64;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

#[derive(Debug, Clone, PartialEq)]
enum Op {
    ServiceRequest(String),
    AuthNone(String),
    AuthPassword {
        user: String,
        password: String,
        new_password: Option<String>,
    },
    AuthPublickey {
        algo: String,
        blob: Vec<u8>,
    },
    AuthPublickeySigned {
        algo: String,
        signature: Vec<u8>,
    },
    AuthHostbased {
        user: String,
    },
    AuthKeyboard {
        user: String,
    },
    AuthInfoResponse(Vec<String>),
    Ping,
    Disconnect(u32),
    RequestFailureReply,
    TcpIpForward {
        address: String,
        port: u32,
    },
    CancelTcpIpForward {
        address: String,
        port: u32,
    },
    StreamLocalForward(String),
    StreamLocalCancel(String),
    NoMoreSessions,
    ChannelOpenSession {
        id: u32,
    },
    ChannelOpenDirectTcpIp {
        id: u32,
        host: String,
        port: u32,
    },
    DirectStreamLocal {
        id: u32,
        path: String,
    },
    ChannelOpenConfirmation {
        remote_id: u32,
        id: u32,
    },
    OpenFailureReply {
        remote_id: u32,
        reason: ChannelOpenFailure,
    },
    RequestPty {
        remote_id: u32,
    },
    RequestShell {
        remote_id: u32,
    },
    RequestExec {
        remote_id: u32,
        command: String,
    },
    RequestSubsystem {
        remote_id: u32,
        name: String,
    },
    RequestEnv {
        remote_id: u32,
        name: String,
        value: String,
    },
    RequestAgentForward {
        remote_id: u32,
    },
    RequestX11 {
        remote_id: u32,
    },
    Data {
        remote_id: u32,
        data: Vec<u8>,
    },
    ExtendedData {
        remote_id: u32,
        ext: u32,
    },
    Eof {
        remote_id: u32,
    },
    Close {
        remote_id: u32,
    },
    WindowAdjust {
        remote_id: u32,
        amount: u32,
    },
    ChannelFailureReply {
        remote_id: u32,
    },
    Signal {
        remote_id: u32,
        name: String,
    },
    WindowChange {
        remote_id: u32,
    },
}

struct MockTransport {
    inbox: Arc<Mutex<VecDeque<TransportEvent>>>,
    ops: Arc<Mutex<Vec<Op>>>,
    compat: CompatFlags,
}

impl MockTransport {
    fn op(&self, op: Op) {
        self.ops.lock().unwrap().push(op)
    }
}

impl Transport for MockTransport {
    fn parse(
        &mut self,
        _data: &[u8],
        events: &mut VecDeque<TransportEvent>,
    ) -> Result<(), Error> {
        let mut inbox = self.inbox.lock().unwrap();
        while let Some(event) = inbox.pop_front() {
            events.push_back(event);
        }
        Ok(())
    }

    fn take_output(&mut self) -> CryptoVec {
        CryptoVec::new()
    }

    fn compat_flags(&self) -> CompatFlags {
        self.compat
    }

    fn host_key_decision(&mut self, _accepted: bool) {}

    fn service_request(&mut self, name: &str) {
        self.op(Op::ServiceRequest(name.to_string()))
    }

    fn auth_none(&mut self, user: &str) {
        self.op(Op::AuthNone(user.to_string()))
    }

    fn auth_password(&mut self, user: &str, password: &str, new_password: Option<&str>) {
        self.op(Op::AuthPassword {
            user: user.to_string(),
            password: password.to_string(),
            new_password: new_password.map(|p| p.to_string()),
        })
    }

    fn auth_publickey(&mut self, _user: &str, algo: &str, key_blob: &[u8]) {
        self.op(Op::AuthPublickey {
            algo: algo.to_string(),
            blob: key_blob.to_vec(),
        })
    }

    fn userauth_sign_payload(&mut self, _user: &str, _algo: &str, _key_blob: &[u8]) -> CryptoVec {
        CryptoVec::from_slice(b"session-bound-payload")
    }

    fn auth_publickey_signed(&mut self, _user: &str, algo: &str, _key_blob: &[u8], signature: &[u8]) {
        self.op(Op::AuthPublickeySigned {
            algo: algo.to_string(),
            signature: signature.to_vec(),
        })
    }

    fn hostbased_sign_payload(
        &mut self,
        _user: &str,
        _algo: &str,
        _key_blob: &[u8],
        _local_hostname: &str,
        _local_username: &str,
    ) -> CryptoVec {
        CryptoVec::from_slice(b"hostbased-payload")
    }

    fn auth_hostbased(
        &mut self,
        user: &str,
        _algo: &str,
        _key_blob: &[u8],
        _local_hostname: &str,
        _local_username: &str,
        _signature: &[u8],
    ) {
        self.op(Op::AuthHostbased {
            user: user.to_string(),
        })
    }

    fn auth_keyboard_interactive(&mut self, user: &str, _submethods: &str) {
        self.op(Op::AuthKeyboard {
            user: user.to_string(),
        })
    }

    fn auth_info_response(&mut self, answers: &[String]) {
        self.op(Op::AuthInfoResponse(answers.to_vec()))
    }

    fn ping(&mut self) {
        self.op(Op::Ping)
    }

    fn disconnect(&mut self, reason: Disconnect, _description: &str) {
        self.op(Op::Disconnect(reason as u32))
    }

    fn request_failure(&mut self) {
        self.op(Op::RequestFailureReply)
    }

    fn tcpip_forward(&mut self, address: &str, port: u32, _want_reply: bool) {
        self.op(Op::TcpIpForward {
            address: address.to_string(),
            port,
        })
    }

    fn cancel_tcpip_forward(&mut self, address: &str, port: u32, _want_reply: bool) {
        self.op(Op::CancelTcpIpForward {
            address: address.to_string(),
            port,
        })
    }

    fn streamlocal_forward(&mut self, socket_path: &str, _want_reply: bool) {
        self.op(Op::StreamLocalForward(socket_path.to_string()))
    }

    fn cancel_streamlocal_forward(&mut self, socket_path: &str, _want_reply: bool) {
        self.op(Op::StreamLocalCancel(socket_path.to_string()))
    }

    fn no_more_sessions(&mut self, _want_reply: bool) {
        self.op(Op::NoMoreSessions)
    }

    fn channel_open_session(&mut self, id: ChannelId, _window_size: u32, _maximum_packet_size: u32) {
        self.op(Op::ChannelOpenSession { id: id.0 })
    }

    fn channel_open_direct_tcpip(
        &mut self,
        id: ChannelId,
        _window_size: u32,
        _maximum_packet_size: u32,
        host: &str,
        port: u32,
        _originator_address: &str,
        _originator_port: u32,
    ) {
        self.op(Op::ChannelOpenDirectTcpIp {
            id: id.0,
            host: host.to_string(),
            port,
        })
    }

    fn channel_open_direct_streamlocal(
        &mut self,
        id: ChannelId,
        _window_size: u32,
        _maximum_packet_size: u32,
        socket_path: &str,
    ) {
        self.op(Op::DirectStreamLocal {
            id: id.0,
            path: socket_path.to_string(),
        })
    }

    fn channel_open_confirmation(
        &mut self,
        remote_id: u32,
        id: ChannelId,
        _window_size: u32,
        _maximum_packet_size: u32,
    ) {
        self.op(Op::ChannelOpenConfirmation {
            remote_id,
            id: id.0,
        })
    }

    fn channel_open_failure(&mut self, remote_id: u32, reason: ChannelOpenFailure, _description: &str) {
        self.op(Op::OpenFailureReply { remote_id, reason })
    }

    fn channel_request_pty(
        &mut self,
        remote_id: u32,
        _want_reply: bool,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _terminal_modes: &[(Pty, u32)],
    ) {
        self.op(Op::RequestPty { remote_id })
    }

    fn channel_request_x11(
        &mut self,
        remote_id: u32,
        _want_reply: bool,
        _single_connection: bool,
        _x11_authentication_protocol: &str,
        _x11_authentication_cookie: &str,
        _x11_screen_number: u32,
    ) {
        self.op(Op::RequestX11 { remote_id })
    }

    fn channel_request_env(&mut self, remote_id: u32, variable_name: &str, variable_value: &str) {
        self.op(Op::RequestEnv {
            remote_id,
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        })
    }

    fn channel_request_shell(&mut self, remote_id: u32, _want_reply: bool) {
        self.op(Op::RequestShell { remote_id })
    }

    fn channel_request_exec(&mut self, remote_id: u32, _want_reply: bool, command: &str) {
        self.op(Op::RequestExec {
            remote_id,
            command: command.to_string(),
        })
    }

    fn channel_request_subsystem(&mut self, remote_id: u32, _want_reply: bool, name: &str) {
        self.op(Op::RequestSubsystem {
            remote_id,
            name: name.to_string(),
        })
    }

    fn channel_request_agent_forward(&mut self, remote_id: u32, _want_reply: bool) {
        self.op(Op::RequestAgentForward { remote_id })
    }

    fn channel_request_signal(&mut self, remote_id: u32, signal: &Sig) {
        self.op(Op::Signal {
            remote_id,
            name: signal.name().to_string(),
        })
    }

    fn channel_request_window_change(
        &mut self,
        remote_id: u32,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
    ) {
        self.op(Op::WindowChange { remote_id })
    }

    fn channel_data(&mut self, remote_id: u32, data: &[u8]) {
        self.op(Op::Data {
            remote_id,
            data: data.to_vec(),
        })
    }

    fn channel_extended_data(&mut self, remote_id: u32, ext: u32, _data: &[u8]) {
        self.op(Op::ExtendedData { remote_id, ext })
    }

    fn channel_eof(&mut self, remote_id: u32) {
        self.op(Op::Eof { remote_id })
    }

    fn channel_close(&mut self, remote_id: u32) {
        self.op(Op::Close { remote_id })
    }

    fn channel_window_adjust(&mut self, remote_id: u32, amount: u32) {
        self.op(Op::WindowAdjust { remote_id, amount })
    }

    fn channel_failure(&mut self, remote_id: u32) {
        self.op(Op::ChannelFailureReply { remote_id })
    }
}

/// The far side of the connection: sends protocol events, observes the
/// operations the client emits.
struct Server {
    stream: tokio::io::DuplexStream,
    inbox: Arc<Mutex<VecDeque<TransportEvent>>>,
    ops: Arc<Mutex<Vec<Op>>>,
    seen: usize,
}

impl Server {
    async fn send(&mut self, events: Vec<TransportEvent>) {
        self.inbox.lock().unwrap().extend(events);
        // Any byte wakes the client's read loop; the mock transport
        // ignores the payload.
        self.stream.write_all(&[0]).await.unwrap();
    }

    async fn next_op(&mut self) -> Op {
        let deadline = Duration::from_secs(5);
        tokio::time::timeout(deadline, async {
            loop {
                {
                    let ops = self.ops.lock().unwrap();
                    if ops.len() > self.seen {
                        let op = ops[self.seen].clone();
                        self.seen += 1;
                        return op;
                    }
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("timed out waiting for a client operation")
    }

    fn all_ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    /// Accept the initial `none` probe, leaving the client
    /// authenticated.
    async fn accept_auth(&mut self) {
        assert_eq!(
            self.next_op().await,
            Op::ServiceRequest("ssh-userauth".to_string())
        );
        self.send(vec![TransportEvent::ServiceAccept {
            name: "ssh-userauth".to_string(),
        }])
        .await;
        assert!(matches!(self.next_op().await, Op::AuthNone(_)));
        self.send(vec![TransportEvent::AuthSuccess]).await;
    }
}

struct TestHandler {
    answers: Vec<String>,
    tcp: Option<UnboundedSender<(client::Channel, ForwardedTcpIpParams)>>,
}

impl Default for TestHandler {
    fn default() -> Self {
        TestHandler {
            answers: Vec::new(),
            tcp: None,
        }
    }
}

#[async_trait]
impl client::Handler for TestHandler {
    type Error = Error;

    async fn check_server_key(&mut self, _key: &key::PublicKey) -> Result<bool, Error> {
        Ok(true)
    }

    async fn auth_keyboard_interactive(
        &mut self,
        _name: &str,
        _instructions: &str,
        _prompts: &[Prompt],
    ) -> Result<Vec<String>, Error> {
        Ok(self.answers.clone())
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: client::Channel,
        params: ForwardedTcpIpParams,
    ) -> Result<(), Error> {
        if let Some(tx) = &self.tcp {
            let _ = tx.send((channel, params));
        }
        Ok(())
    }
}

async fn start(
    config: Config,
    handler: TestHandler,
    compat: CompatFlags,
) -> (client::Handle<TestHandler>, Server) {
    let _ = env_logger::try_init();
    let (client_side, server_side) = tokio::io::duplex(1 << 20);
    let inbox = Arc::new(Mutex::new(VecDeque::new()));
    let ops = Arc::new(Mutex::new(Vec::new()));
    let transport = MockTransport {
        inbox: inbox.clone(),
        ops: ops.clone(),
        compat,
    };
    let handle = client::connect_stream(Arc::new(config), client_side, handler, transport)
        .await
        .unwrap();
    let server = Server {
        stream: server_side,
        inbox,
        ops,
        seen: 0,
    };
    (handle, server)
}

fn base_config() -> Config {
    Config {
        username: "u".to_string(),
        ready_timeout: None,
        ..Config::default()
    }
}

#[tokio::test]
async fn password_auth_happy_path() {
    let mut config = base_config();
    config.password = Some("p".to_string());
    let (mut handle, mut server) = start(config, TestHandler::default(), CompatFlags::empty()).await;

    let (auth, _) = tokio::join!(handle.authenticate(), async {
        assert_eq!(
            server.next_op().await,
            Op::ServiceRequest("ssh-userauth".to_string())
        );
        server
            .send(vec![TransportEvent::ServiceAccept {
                name: "ssh-userauth".to_string(),
            }])
            .await;
        assert_eq!(server.next_op().await, Op::AuthNone("u".to_string()));
        server
            .send(vec![TransportEvent::AuthFailure {
                remaining: MethodSet::PASSWORD,
                partial_success: false,
            }])
            .await;
        assert_eq!(
            server.next_op().await,
            Op::AuthPassword {
                user: "u".to_string(),
                password: "p".to_string(),
                new_password: None,
            }
        );
        server.send(vec![TransportEvent::AuthSuccess]).await;
    });
    auth.unwrap();
}

#[tokio::test]
async fn auth_falls_back_across_methods_in_order() {
    let key = Arc::new(key::KeyPair::generate_ed25519().unwrap());
    let blob = key.public_key_bytes();
    let mut config = base_config();
    config.password = Some("p".to_string());
    config.key = Some(key);
    let (mut handle, mut server) = start(config, TestHandler::default(), CompatFlags::empty()).await;

    let (auth, _) = tokio::join!(handle.authenticate(), async {
        assert!(matches!(server.next_op().await, Op::ServiceRequest(_)));
        server
            .send(vec![TransportEvent::ServiceAccept {
                name: "ssh-userauth".to_string(),
            }])
            .await;
        assert!(matches!(server.next_op().await, Op::AuthNone(_)));
        server
            .send(vec![TransportEvent::AuthFailure {
                remaining: MethodSet::PUBLICKEY,
                partial_success: false,
            }])
            .await;
        assert!(matches!(server.next_op().await, Op::AuthPassword { .. }));
        server
            .send(vec![TransportEvent::AuthFailure {
                remaining: MethodSet::PUBLICKEY,
                partial_success: false,
            }])
            .await;
        // The publickey probe, answered with PK_OK.
        match server.next_op().await {
            Op::AuthPublickey { algo, blob: probed } => {
                assert_eq!(algo, "ssh-ed25519");
                assert_eq!(probed, blob);
            }
            op => panic!("unexpected op {:?}", op),
        }
        server
            .send(vec![TransportEvent::AuthPkOk {
                algo: "ssh-ed25519".to_string(),
                key_blob: CryptoVec::from_slice(&blob),
            }])
            .await;
        match server.next_op().await {
            Op::AuthPublickeySigned { algo, signature } => {
                assert_eq!(algo, "ssh-ed25519");
                assert_eq!(signature.len(), 64);
            }
            op => panic!("unexpected op {:?}", op),
        }
        server.send(vec![TransportEvent::AuthSuccess]).await;
    });
    auth.unwrap();
}

#[tokio::test]
async fn auth_method_exhaustion_fails_and_disconnects() {
    let mut config = base_config();
    config.password = Some("p".to_string());
    let (mut handle, mut server) = start(config, TestHandler::default(), CompatFlags::empty()).await;

    let (auth, _) = tokio::join!(handle.authenticate(), async {
        assert!(matches!(server.next_op().await, Op::ServiceRequest(_)));
        server
            .send(vec![TransportEvent::ServiceAccept {
                name: "ssh-userauth".to_string(),
            }])
            .await;
        assert!(matches!(server.next_op().await, Op::AuthNone(_)));
        server
            .send(vec![TransportEvent::AuthFailure {
                remaining: MethodSet::PASSWORD,
                partial_success: false,
            }])
            .await;
        assert!(matches!(server.next_op().await, Op::AuthPassword { .. }));
        server
            .send(vec![TransportEvent::AuthFailure {
                remaining: MethodSet::PASSWORD,
                partial_success: false,
            }])
            .await;
        assert_eq!(
            server.next_op().await,
            Op::Disconnect(Disconnect::NoMoreAuthMethodsAvailable as u32)
        );
    });
    assert!(matches!(auth, Err(Error::NoAuthMethod)));
}

#[tokio::test]
async fn keyboard_interactive_prompts_are_answered() {
    let mut config = base_config();
    config.try_keyboard = true;
    let handler = TestHandler {
        answers: vec!["tada".to_string()],
        ..Default::default()
    };
    let (mut handle, mut server) = start(config, handler, CompatFlags::empty()).await;

    let (auth, _) = tokio::join!(handle.authenticate(), async {
        assert!(matches!(server.next_op().await, Op::ServiceRequest(_)));
        server
            .send(vec![TransportEvent::ServiceAccept {
                name: "ssh-userauth".to_string(),
            }])
            .await;
        assert!(matches!(server.next_op().await, Op::AuthNone(_)));
        server
            .send(vec![TransportEvent::AuthFailure {
                remaining: MethodSet::KEYBOARD_INTERACTIVE,
                partial_success: false,
            }])
            .await;
        assert!(matches!(server.next_op().await, Op::AuthKeyboard { .. }));
        server
            .send(vec![TransportEvent::AuthInfoRequest {
                name: "".to_string(),
                instructions: "".to_string(),
                prompts: vec![Prompt {
                    prompt: "Password:".to_string(),
                    echo: false,
                }],
            }])
            .await;
        assert_eq!(
            server.next_op().await,
            Op::AuthInfoResponse(vec!["tada".to_string()])
        );
        server.send(vec![TransportEvent::AuthSuccess]).await;
    });
    auth.unwrap();
}

struct MockAgent {
    keys: Vec<key::PublicKey>,
    /// The only key index the agent signs correctly; all others get a
    /// wrongly tagged signature.
    good: usize,
}

#[async_trait]
impl Agent for MockAgent {
    async fn request_identities(&mut self) -> Result<Vec<key::PublicKey>, Error> {
        Ok(self.keys.clone())
    }

    async fn sign_request(
        &mut self,
        key: &key::PublicKey,
        _data: CryptoVec,
    ) -> Result<CryptoVec, Error> {
        let tag: &[u8] = if Some(key) == self.keys.get(self.good) {
            b"ssh-ed25519"
        } else {
            b"ssh-rsa"
        };
        let mut inner = CryptoVec::new();
        inner.extend_ssh_string(tag);
        inner.extend_ssh_string(&[9u8; 64]);
        let mut blob = CryptoVec::new();
        blob.extend_ssh_string(&inner);
        Ok(blob)
    }
}

#[tokio::test]
async fn agent_signature_mismatch_advances_to_next_key() {
    let k1 = key::KeyPair::generate_ed25519().unwrap().clone_public_key();
    let k2 = key::KeyPair::generate_ed25519().unwrap().clone_public_key();
    let blob1 = k1.public_key_bytes();
    let blob2 = k2.public_key_bytes();
    let agent = MockAgent {
        keys: vec![k1, k2],
        good: 1,
    };
    let config = base_config();
    let (mut handle, mut server) = start(config, TestHandler::default(), CompatFlags::empty()).await;

    let strategy = DefaultHandler::new(vec![Method::Agent]);
    let (auth, _) = tokio::join!(handle.authenticate_with(strategy, Some(agent)), async {
        assert!(matches!(server.next_op().await, Op::ServiceRequest(_)));
        server
            .send(vec![TransportEvent::ServiceAccept {
                name: "ssh-userauth".to_string(),
            }])
            .await;
        // First agent key is probed; the agent then signs with the
        // wrong algorithm, so the client moves to the second key
        // without sending a signature.
        match server.next_op().await {
            Op::AuthPublickey { blob, .. } => assert_eq!(blob, blob1),
            op => panic!("unexpected op {:?}", op),
        }
        server
            .send(vec![TransportEvent::AuthPkOk {
                algo: "ssh-ed25519".to_string(),
                key_blob: CryptoVec::from_slice(&blob1),
            }])
            .await;
        match server.next_op().await {
            Op::AuthPublickey { blob, .. } => assert_eq!(blob, blob2),
            op => panic!("unexpected op {:?}", op),
        }
        server
            .send(vec![TransportEvent::AuthPkOk {
                algo: "ssh-ed25519".to_string(),
                key_blob: CryptoVec::from_slice(&blob2),
            }])
            .await;
        match server.next_op().await {
            Op::AuthPublickeySigned { signature, .. } => assert_eq!(signature, vec![9u8; 64]),
            op => panic!("unexpected op {:?}", op),
        }
        server.send(vec![TransportEvent::AuthSuccess]).await;
    });
    auth.unwrap();
}

#[tokio::test]
async fn window_exhaustion_splits_and_resumes_writes() {
    let config = base_config();
    let (mut handle, mut server) = start(config, TestHandler::default(), CompatFlags::empty()).await;
    let (auth, _) = tokio::join!(handle.authenticate(), server.accept_auth());
    auth.unwrap();

    let (channel, _) = tokio::join!(handle.channel_open_session(), async {
        assert_eq!(server.next_op().await, Op::ChannelOpenSession { id: 0 });
        server
            .send(vec![TransportEvent::ChannelOpenConfirmation {
                id: ChannelId(0),
                remote_id: 42,
                window_size: 10,
                maximum_packet_size: 32768,
            }])
            .await;
    });
    let mut channel = channel.unwrap();

    let payload = b"abcdefghijklmnopqrstuvwxy"; // 25 bytes
    let (write, _) = tokio::join!(channel.data(&payload[..]), async {
        assert_eq!(
            server.next_op().await,
            Op::Data {
                remote_id: 42,
                data: payload[..10].to_vec(),
            }
        );
        server
            .send(vec![TransportEvent::ChannelWindowAdjust {
                id: ChannelId(0),
                amount: 20,
            }])
            .await;
        assert_eq!(
            server.next_op().await,
            Op::Data {
                remote_id: 42,
                data: payload[10..].to_vec(),
            }
        );
    });
    write.unwrap();
}

#[tokio::test]
async fn dynamic_remote_forward_and_incoming_routing() {
    let (tcp_tx, mut tcp_rx) = unbounded_channel();
    let handler = TestHandler {
        tcp: Some(tcp_tx),
        ..Default::default()
    };
    let config = base_config();
    let (mut handle, mut server) = start(config, handler, CompatFlags::empty()).await;
    let (auth, _) = tokio::join!(handle.authenticate(), server.accept_auth());
    auth.unwrap();

    let (port, _) = tokio::join!(handle.tcpip_forward("0.0.0.0", 0), async {
        assert_eq!(
            server.next_op().await,
            Op::TcpIpForward {
                address: "0.0.0.0".to_string(),
                port: 0,
            }
        );
        server
            .send(vec![TransportEvent::RequestSuccess {
                data: CryptoVec::from_slice(&[0x00, 0x00, 0x1f, 0x90]),
            }])
            .await;
    });
    assert_eq!(port.unwrap(), 8080);

    // A connection for the forwarded port is accepted and surfaced.
    server
        .send(vec![TransportEvent::ChannelOpen {
            remote_id: 7,
            window_size: 64,
            maximum_packet_size: 1024,
            kind: ChannelOpenKind::ForwardedTcpIp {
                connected_address: "0.0.0.0".to_string(),
                connected_port: 8080,
                originator_address: "10.0.0.1".to_string(),
                originator_port: 55555,
            },
        }])
        .await;
    assert_eq!(
        server.next_op().await,
        Op::ChannelOpenConfirmation {
            remote_id: 7,
            id: 0,
        }
    );
    let (_channel, params) = tcp_rx.recv().await.unwrap();
    assert_eq!(params.connected_port, 8080);
    assert_eq!(params.originator_address, "10.0.0.1");

    // A connection for a port nobody forwarded is refused.
    server
        .send(vec![TransportEvent::ChannelOpen {
            remote_id: 8,
            window_size: 64,
            maximum_packet_size: 1024,
            kind: ChannelOpenKind::ForwardedTcpIp {
                connected_address: "0.0.0.0".to_string(),
                connected_port: 9999,
                originator_address: "10.0.0.1".to_string(),
                originator_port: 55556,
            },
        }])
        .await;
    assert_eq!(
        server.next_op().await,
        Op::OpenFailureReply {
            remote_id: 8,
            reason: ChannelOpenFailure::AdministrativelyProhibited,
        }
    );
}

#[tokio::test]
async fn buggy_servers_keep_the_requested_port() {
    let config = base_config();
    let (mut handle, mut server) = start(
        config,
        TestHandler::default(),
        CompatFlags::DYN_RPORT_BUG,
    )
    .await;
    let (auth, _) = tokio::join!(handle.authenticate(), server.accept_auth());
    auth.unwrap();

    // The reply carries a port, but this server is known to lie about
    // it; the binding stays on the requested port.
    let (port, _) = tokio::join!(handle.tcpip_forward("0.0.0.0", 0), async {
        assert!(matches!(server.next_op().await, Op::TcpIpForward { .. }));
        server
            .send(vec![TransportEvent::RequestSuccess {
                data: CryptoVec::from_slice(&[0x00, 0x00, 0x1f, 0x90]),
            }])
            .await;
    });
    assert_eq!(port.unwrap(), 0);
}

#[tokio::test]
async fn unknown_incoming_channel_type_is_refused() {
    let config = base_config();
    let (mut handle, mut server) = start(config, TestHandler::default(), CompatFlags::empty()).await;
    let (auth, _) = tokio::join!(handle.authenticate(), server.accept_auth());
    auth.unwrap();

    server
        .send(vec![TransportEvent::ChannelOpen {
            remote_id: 3,
            window_size: 64,
            maximum_packet_size: 1024,
            kind: ChannelOpenKind::Unknown {
                typ: "tun@openssh.com".to_string(),
            },
        }])
        .await;
    assert_eq!(
        server.next_op().await,
        Op::OpenFailureReply {
            remote_id: 3,
            reason: ChannelOpenFailure::UnknownChannelType,
        }
    );
}

#[tokio::test]
async fn keepalive_gives_up_after_count_max() {
    let mut config = base_config();
    config.keepalive_interval = Some(Duration::from_millis(100));
    config.keepalive_count_max = 3;
    let (handle, server) = start(config, TestHandler::default(), CompatFlags::empty()).await;

    let result = handle.await;
    assert!(matches!(result, Err(Error::KeepaliveTimeout)));
    let pings = server
        .all_ops()
        .iter()
        .filter(|op| **op == Op::Ping)
        .count();
    assert_eq!(pings, 3);
}

#[tokio::test]
async fn ready_timeout_fires_without_auth() {
    let mut config = base_config();
    config.ready_timeout = Some(Duration::from_millis(100));
    let (handle, _server) = start(config, TestHandler::default(), CompatFlags::empty()).await;
    let result = handle.await;
    assert!(matches!(result, Err(Error::ConnectionTimeout)));
}

#[tokio::test]
async fn exec_pipeline_runs_setup_requests_in_order() {
    let config = base_config();
    let (mut handle, mut server) = start(config, TestHandler::default(), CompatFlags::empty()).await;
    let (auth, _) = tokio::join!(handle.authenticate(), server.accept_auth());
    auth.unwrap();

    let opts = CommandOptions {
        env: vec![("LANG".to_string(), "C".to_string())],
        pty: PtySetting::Request(Default::default()),
        ..Default::default()
    };
    let (channel, _) = tokio::join!(handle.exec("ls -l", opts), async {
        assert_eq!(server.next_op().await, Op::ChannelOpenSession { id: 0 });
        server
            .send(vec![TransportEvent::ChannelOpenConfirmation {
                id: ChannelId(0),
                remote_id: 9,
                window_size: 2097152,
                maximum_packet_size: 32768,
            }])
            .await;
        assert_eq!(
            server.next_op().await,
            Op::RequestEnv {
                remote_id: 9,
                name: "LANG".to_string(),
                value: "C".to_string(),
            }
        );
        assert_eq!(server.next_op().await, Op::RequestPty { remote_id: 9 });
        server
            .send(vec![TransportEvent::ChannelSuccess { id: ChannelId(0) }])
            .await;
        assert_eq!(
            server.next_op().await,
            Op::RequestExec {
                remote_id: 9,
                command: "ls -l".to_string(),
            }
        );
        server
            .send(vec![TransportEvent::ChannelSuccess { id: ChannelId(0) }])
            .await;
    });
    channel.unwrap();
}

#[tokio::test]
async fn refused_pty_fails_the_shell_and_closes_the_channel() {
    let config = base_config();
    let (mut handle, mut server) = start(config, TestHandler::default(), CompatFlags::empty()).await;
    let (auth, _) = tokio::join!(handle.authenticate(), server.accept_auth());
    auth.unwrap();

    let (shell, _) = tokio::join!(handle.shell(CommandOptions::default()), async {
        assert_eq!(server.next_op().await, Op::ChannelOpenSession { id: 0 });
        server
            .send(vec![TransportEvent::ChannelOpenConfirmation {
                id: ChannelId(0),
                remote_id: 5,
                window_size: 2097152,
                maximum_packet_size: 32768,
            }])
            .await;
        // Shells get a default pty; refuse it.
        assert_eq!(server.next_op().await, Op::RequestPty { remote_id: 5 });
        server
            .send(vec![TransportEvent::ChannelFailure { id: ChannelId(0) }])
            .await;
        assert_eq!(server.next_op().await, Op::Close { remote_id: 5 });
    });
    assert!(matches!(shell, Err(Error::RequestDenied)));
}

#[tokio::test]
async fn exit_status_is_delivered_once_then_eof_and_close() {
    let config = base_config();
    let (mut handle, mut server) = start(config, TestHandler::default(), CompatFlags::empty()).await;
    let (auth, _) = tokio::join!(handle.authenticate(), server.accept_auth());
    auth.unwrap();

    let (channel, _) = tokio::join!(handle.channel_open_session(), async {
        assert_eq!(server.next_op().await, Op::ChannelOpenSession { id: 0 });
        server
            .send(vec![TransportEvent::ChannelOpenConfirmation {
                id: ChannelId(0),
                remote_id: 1,
                window_size: 2097152,
                maximum_packet_size: 32768,
            }])
            .await;
    });
    let mut channel = channel.unwrap();

    server
        .send(vec![
            TransportEvent::ChannelRequest {
                id: ChannelId(0),
                request: ChannelRequestKind::ExitStatus { exit_status: 3 },
            },
            // A second exit report must be ignored.
            TransportEvent::ChannelRequest {
                id: ChannelId(0),
                request: ChannelRequestKind::ExitStatus { exit_status: 7 },
            },
            TransportEvent::ChannelEof { id: ChannelId(0) },
            TransportEvent::ChannelClose { id: ChannelId(0) },
        ])
        .await;

    assert!(matches!(
        channel.wait().await,
        Some(ChannelMsg::ExitStatus { exit_status: 3 })
    ));
    assert!(matches!(channel.wait().await, Some(ChannelMsg::Eof)));
    assert!(matches!(channel.wait().await, Some(ChannelMsg::Close)));
    assert!(channel.wait().await.is_none());
    // The client answered the close.
    assert_eq!(server.next_op().await, Op::Close { remote_id: 1 });
}

#[tokio::test]
async fn data_and_stderr_are_delivered_with_windows_accounted() {
    let config = base_config();
    let (mut handle, mut server) = start(config, TestHandler::default(), CompatFlags::empty()).await;
    let (auth, _) = tokio::join!(handle.authenticate(), server.accept_auth());
    auth.unwrap();

    let (channel, _) = tokio::join!(handle.channel_open_session(), async {
        assert_eq!(server.next_op().await, Op::ChannelOpenSession { id: 0 });
        server
            .send(vec![TransportEvent::ChannelOpenConfirmation {
                id: ChannelId(0),
                remote_id: 1,
                window_size: 2097152,
                maximum_packet_size: 32768,
            }])
            .await;
    });
    let mut channel = channel.unwrap();

    server
        .send(vec![
            TransportEvent::ChannelData {
                id: ChannelId(0),
                data: CryptoVec::from_slice(b"out"),
            },
            TransportEvent::ChannelExtendedData {
                id: ChannelId(0),
                ext: 1,
                data: CryptoVec::from_slice(b"err"),
            },
            // Extended data of any other type is dropped.
            TransportEvent::ChannelExtendedData {
                id: ChannelId(0),
                ext: 2,
                data: CryptoVec::from_slice(b"nope"),
            },
            TransportEvent::ChannelEof { id: ChannelId(0) },
        ])
        .await;

    match channel.wait().await {
        Some(ChannelMsg::Data { data }) => assert_eq!(&data[..], b"out"),
        msg => panic!("unexpected msg {:?}", msg),
    }
    match channel.wait().await {
        Some(ChannelMsg::ExtendedData { data, ext: 1 }) => assert_eq!(&data[..], b"err"),
        msg => panic!("unexpected msg {:?}", msg),
    }
    assert!(matches!(channel.wait().await, Some(ChannelMsg::Eof)));
}

#[tokio::test]
async fn window_overrun_is_a_protocol_error() {
    let mut config = base_config();
    config.window_size = 8;
    let (mut handle, mut server) = start(config, TestHandler::default(), CompatFlags::empty()).await;
    let (auth, _) = tokio::join!(handle.authenticate(), server.accept_auth());
    auth.unwrap();

    let (channel, _) = tokio::join!(handle.channel_open_session(), async {
        assert_eq!(server.next_op().await, Op::ChannelOpenSession { id: 0 });
        server
            .send(vec![TransportEvent::ChannelOpenConfirmation {
                id: ChannelId(0),
                remote_id: 1,
                window_size: 2097152,
                maximum_packet_size: 32768,
            }])
            .await;
    });
    let _channel = channel.unwrap();

    server
        .send(vec![TransportEvent::ChannelData {
            id: ChannelId(0),
            data: CryptoVec::from_slice(b"way too much data"),
        }])
        .await;
    let result = handle.await;
    assert!(matches!(result, Err(Error::Inconsistent)));
}

#[tokio::test]
async fn strict_vendor_blocks_openssh_extensions() {
    let config = base_config();
    let (mut handle, mut server) = start(config, TestHandler::default(), CompatFlags::empty()).await;
    server
        .send(vec![TransportEvent::Header {
            identification: "SSH-2.0-dropbear_2022.83".to_string(),
        }])
        .await;
    let (auth, _) = tokio::join!(handle.authenticate(), server.accept_auth());
    auth.unwrap();

    let result = handle.no_more_sessions().await;
    assert!(matches!(result, Err(Error::VendorMismatch)));
    // Nothing went on the wire for it.
    assert!(!server.all_ops().contains(&Op::NoMoreSessions));
}

#[tokio::test]
async fn openssh_servers_get_vendor_extensions() {
    let config = base_config();
    let (mut handle, mut server) = start(config, TestHandler::default(), CompatFlags::empty()).await;
    server
        .send(vec![TransportEvent::Header {
            identification: "SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.1".to_string(),
        }])
        .await;
    let (auth, _) = tokio::join!(handle.authenticate(), server.accept_auth());
    auth.unwrap();

    let (result, _) = tokio::join!(handle.no_more_sessions(), async {
        assert_eq!(server.next_op().await, Op::NoMoreSessions);
        server
            .send(vec![TransportEvent::RequestSuccess {
                data: CryptoVec::new(),
            }])
            .await;
    });
    result.unwrap();
}

#[tokio::test]
async fn close_resolves_every_pending_callback_with_no_response() {
    let config = base_config();
    let (mut handle, mut server) = start(config, TestHandler::default(), CompatFlags::empty()).await;
    let (auth, _) = tokio::join!(handle.authenticate(), server.accept_auth());
    auth.unwrap();

    let (channel, _) = tokio::join!(handle.channel_open_session(), async {
        assert_eq!(server.next_op().await, Op::ChannelOpenSession { id: 0 });
        server
            .send(vec![TransportEvent::ChannelOpenConfirmation {
                id: ChannelId(0),
                remote_id: 1,
                window_size: 2097152,
                maximum_packet_size: 32768,
            }])
            .await;
    });
    let mut channel = channel.unwrap();

    // One pending global reply and one pending channel reply when the
    // connection drops; both callers hear "no response".
    let (forward, exec, _) = tokio::join!(
        handle.tcpip_forward("127.0.0.1", 2222),
        channel.exec(true, "sleep 1"),
        async {
            assert!(matches!(server.next_op().await, Op::TcpIpForward { .. }));
            assert!(matches!(server.next_op().await, Op::RequestExec { .. }));
            // Hang up without answering anything.
            server.stream.shutdown().await.unwrap();
        }
    );
    assert!(matches!(forward, Err(Error::NoResponse)));
    assert!(matches!(exec, Err(Error::NoResponse)));
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let config = base_config();
    let (mut handle, mut server) = start(config, TestHandler::default(), CompatFlags::empty()).await;
    let (auth, _) = tokio::join!(handle.authenticate(), server.accept_auth());
    auth.unwrap();

    handle.disconnect(Disconnect::ByApplication, "bye").await;
    handle.disconnect(Disconnect::ByApplication, "bye").await;
    assert_eq!(
        server.next_op().await,
        Op::Disconnect(Disconnect::ByApplication as u32)
    );
    let result = handle.await;
    assert!(result.is_ok());
    let disconnects = server
        .all_ops()
        .iter()
        .filter(|op| matches!(op, Op::Disconnect(_)))
        .count();
    assert_eq!(disconnects, 1);
}

#[tokio::test]
async fn server_disconnect_with_reason_surfaces_the_code() {
    let config = base_config();
    let (handle, mut server) = start(config, TestHandler::default(), CompatFlags::empty()).await;
    server
        .send(vec![TransportEvent::Disconnect {
            code: 2,
            description: String::new(),
        }])
        .await;
    let result = handle.await;
    match result {
        Err(Error::DisconnectedBy { code, description }) => {
            assert_eq!(code, 2);
            assert_eq!(description, "Protocol error");
        }
        r => panic!("unexpected result {:?}", r),
    }
}
