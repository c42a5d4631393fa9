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

use crate::Error;
use std::collections::VecDeque;
use std::sync::Arc;
use thrussh_keys::encoding::Reader;
use thrussh_keys::key;

bitflags! {
    /// Set of methods, represented by bit flags.
    pub struct MethodSet: u32 {
        /// The SSH `none` method (no authentication).
        const NONE = 1;
        /// The SSH `password` method (plaintext passwords).
        const PASSWORD = 2;
        /// The SSH `publickey` method (sign a challenge sent by the
        /// server).
        const PUBLICKEY = 4;
        /// The SSH `hostbased` method (certain hostnames are allowed
        /// by the server).
        const HOSTBASED = 8;
        /// The SSH `keyboard-interactive` method (answer to a
        /// challenge, where the "challenge" can be a password prompt,
        /// a bytestring to sign with a smartcard, or something else).
        const KEYBOARD_INTERACTIVE = 16;
    }
}

macro_rules! iter {
    ( $y:expr, $x:expr ) => {{
        if $y.contains($x) {
            $y.remove($x);
            return Some($x);
        }
    }};
}

impl Iterator for MethodSet {
    type Item = MethodSet;
    fn next(&mut self) -> Option<MethodSet> {
        iter!(self, MethodSet::NONE);
        iter!(self, MethodSet::PASSWORD);
        iter!(self, MethodSet::PUBLICKEY);
        iter!(self, MethodSet::HOSTBASED);
        iter!(self, MethodSet::KEYBOARD_INTERACTIVE);
        None
    }
}

impl MethodSet {
    /// Parse a single method name as it appears in the wire name-list
    /// of a USERAUTH_FAILURE message.
    pub fn from_name(name: &str) -> Option<MethodSet> {
        match name {
            "none" => Some(MethodSet::NONE),
            "password" => Some(MethodSet::PASSWORD),
            "publickey" => Some(MethodSet::PUBLICKEY),
            "hostbased" => Some(MethodSet::HOSTBASED),
            "keyboard-interactive" => Some(MethodSet::KEYBOARD_INTERACTIVE),
            _ => None,
        }
    }

    /// The wire name of this method (for singleton sets).
    pub fn name(&self) -> &'static str {
        match *self {
            MethodSet::NONE => "none",
            MethodSet::PASSWORD => "password",
            MethodSet::PUBLICKEY => "publickey",
            MethodSet::HOSTBASED => "hostbased",
            MethodSet::KEYBOARD_INTERACTIVE => "keyboard-interactive",
            _ => "",
        }
    }
}

/// One prompt of a keyboard-interactive info request.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub prompt: String,
    /// Whether the terminal should echo what the user types.
    pub echo: bool,
}

/// One authentication attempt.
#[derive(Debug, Clone)]
pub enum Method {
    /// The `none` probe; also used to learn which methods the server
    /// accepts.
    None,
    Password {
        password: String,
    },
    /// Sign with a locally held private key.
    PublicKey {
        key: Arc<key::KeyPair>,
    },
    /// A public key whose signatures are produced externally, one key
    /// at a time. The agent flow expands to a sequence of these.
    FuturePublicKey {
        key: key::PublicKey,
    },
    /// Iterate over the keys held by the configured SSH agent.
    Agent,
    KeyboardInteractive {
        submethods: String,
    },
    Hostbased {
        key: Arc<key::KeyPair>,
        local_hostname: String,
        local_username: String,
    },
}

/// Decides which method to try next. Consulted once before the first
/// attempt and once after every USERAUTH_FAILURE; returning `None`
/// gives up, which fails the authentication with
/// [`Error::NoAuthMethod`](crate::Error::NoAuthMethod).
pub trait AuthHandler: Send {
    /// `remaining` is the method set the server advertised in its
    /// latest failure (everything, before the first attempt), and
    /// `partial_success` whether that failure was a partial success.
    fn next_method(&mut self, remaining: MethodSet, partial_success: bool) -> Option<Method>;
}

/// The default strategy: a fixed queue of methods derived from the
/// configuration, each tried at most once, in order.
pub struct DefaultHandler {
    queue: VecDeque<Method>,
}

impl DefaultHandler {
    pub fn new(methods: Vec<Method>) -> Self {
        DefaultHandler {
            queue: methods.into(),
        }
    }
}

impl AuthHandler for DefaultHandler {
    fn next_method(&mut self, _remaining: MethodSet, _partial_success: bool) -> Option<Method> {
        self.queue.pop_front()
    }
}

/// Split an agent signature blob `string (string algo, string sig)`
/// into the algorithm tag and the raw signature bytes.
pub(crate) fn parse_signature_blob(blob: &[u8]) -> Result<(String, Vec<u8>), Error> {
    let mut r = blob.reader(0);
    let mut inner = r.read_string()?.reader(0);
    let algo = std::str::from_utf8(inner.read_string()?)?.to_string();
    let signature = inner.read_string()?.to_vec();
    Ok((algo, signature))
}

/// The raw bytes of a locally produced signature.
pub(crate) fn signature_bytes(sig: &thrussh_keys::signature::Signature) -> Vec<u8> {
    use thrussh_keys::signature::Signature;
    match sig {
        Signature::Ed25519(ref bytes) => bytes.0.to_vec(),
        Signature::RSA { ref bytes, .. } => bytes.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thrussh_keys::encoding::Encoding;

    #[test]
    fn method_set_iterates_in_wire_order() {
        let all: Vec<MethodSet> = MethodSet::all().collect();
        assert_eq!(
            all,
            vec![
                MethodSet::NONE,
                MethodSet::PASSWORD,
                MethodSet::PUBLICKEY,
                MethodSet::HOSTBASED,
                MethodSet::KEYBOARD_INTERACTIVE,
            ]
        );
    }

    #[test]
    fn method_set_roundtrips_names() {
        for m in MethodSet::all() {
            assert_eq!(MethodSet::from_name(m.name()), Some(m));
        }
        assert_eq!(MethodSet::from_name("gssapi-with-mic"), None);
    }

    #[test]
    fn default_handler_is_a_fixed_queue() {
        let mut h = DefaultHandler::new(vec![
            Method::None,
            Method::Password {
                password: "p".into(),
            },
        ]);
        assert!(matches!(
            h.next_method(MethodSet::all(), false),
            Some(Method::None)
        ));
        // The advertised set does not reorder or filter the queue.
        assert!(matches!(
            h.next_method(MethodSet::KEYBOARD_INTERACTIVE, true),
            Some(Method::Password { .. })
        ));
        assert!(h.next_method(MethodSet::all(), false).is_none());
    }

    #[test]
    fn signature_blob_splits_algo_and_bytes() {
        let mut inner = cryptovec::CryptoVec::new();
        inner.extend_ssh_string(b"ssh-ed25519");
        inner.extend_ssh_string(&[7u8; 64]);
        let mut blob = cryptovec::CryptoVec::new();
        blob.extend_ssh_string(&inner);

        let (algo, sig) = parse_signature_blob(&blob).unwrap();
        assert_eq!(algo, "ssh-ed25519");
        assert_eq!(sig, vec![7u8; 64]);
    }
}
