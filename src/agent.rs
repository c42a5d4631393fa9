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

//! The SSH agent, as seen from the authentication orchestrator and the
//! agent-forwarding bridge. The wire protocol itself lives in
//! `thrussh-keys`; this module only decides *when* the agent is asked.

use crate::client::Channel;
use crate::{ChannelMsg, Error};
use async_trait::async_trait;
use cryptovec::CryptoVec;
use thrussh_keys::key;

/// An external signer holding private keys on our behalf.
#[async_trait]
pub trait Agent: Send {
    /// The public keys the agent is willing to sign with, in the
    /// agent's preference order. Keys of unsupported types are not
    /// listed.
    async fn request_identities(&mut self) -> Result<Vec<key::PublicKey>, Error>;

    /// Sign `data` with the private half of `key`. The result is the
    /// standard signature blob: `string (string algo, string sig)`.
    async fn sign_request(
        &mut self,
        key: &key::PublicKey,
        data: CryptoVec,
    ) -> Result<CryptoVec, Error>;
}

/// An agent behind a Unix-domain socket (the usual `SSH_AUTH_SOCK`
/// arrangement). A fresh connection is made per query, so a handle can
/// outlive agent restarts.
#[cfg(unix)]
pub struct UnixAgent {
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl UnixAgent {
    pub fn new<P: Into<std::path::PathBuf>>(path: P) -> Self {
        UnixAgent { path: path.into() }
    }
}

#[cfg(unix)]
#[async_trait]
impl Agent for UnixAgent {
    async fn request_identities(&mut self) -> Result<Vec<key::PublicKey>, Error> {
        let mut client =
            thrussh_keys::agent::client::AgentClient::connect_uds(&self.path).await?;
        Ok(client.request_identities().await?)
    }

    async fn sign_request(
        &mut self,
        key: &key::PublicKey,
        data: CryptoVec,
    ) -> Result<CryptoVec, Error> {
        let client = thrussh_keys::agent::client::AgentClient::connect_uds(&self.path).await?;
        let before = data.len();
        let (_, signed) = client.sign_request(key, data).await;
        let signed = signed?;
        // The agent client appends the signature blob to the payload;
        // nothing appended means the agent refused.
        if signed.len() <= before {
            return Err(Error::Keys(thrussh_keys::Error::AgentFailure));
        }
        Ok(CryptoVec::from_slice(&signed[before..]))
    }
}

/// Stand-in for platforms without an agent transport; every query
/// fails.
#[cfg(not(unix))]
pub struct NoAgent;

#[cfg(not(unix))]
#[async_trait]
impl Agent for NoAgent {
    async fn request_identities(&mut self) -> Result<Vec<key::PublicKey>, Error> {
        Err(Error::Keys(thrussh_keys::Error::AgentFailure))
    }

    async fn sign_request(
        &mut self,
        _key: &key::PublicKey,
        _data: CryptoVec,
    ) -> Result<CryptoVec, Error> {
        Err(Error::Keys(thrussh_keys::Error::AgentFailure))
    }
}

/// Relay a forwarded `auth-agent@openssh.com` channel to the local
/// agent socket until either side hangs up.
#[cfg(unix)]
pub(crate) async fn bridge(path: std::path::PathBuf, mut channel: Channel) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = match tokio::net::UnixStream::connect(&path).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("could not reach the agent at {:?}: {}", path, e);
            channel.close().await.unwrap_or(());
            return;
        }
    };
    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if stream.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    Some(msg) => debug!("ignoring {:?} on an agent channel", msg),
                }
            }
            r = stream.read(&mut buf) => {
                match r {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if channel.data(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    channel.close().await.unwrap_or(());
}
