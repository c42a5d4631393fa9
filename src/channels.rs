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

use crate::transport::Transport;
use crate::{ChannelId, ChannelMsg, Error};
use cryptovec::CryptoVec;
use std::collections::VecDeque;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

/// What a channel's user half receives from the session task.
#[derive(Debug)]
pub(crate) enum OpenChannelMsg {
    Open {
        id: ChannelId,
        max_packet_size: u32,
        window_size: u32,
    },
    OpenFailure(Error),
    Msg(ChannelMsg),
}

/// The state of one direction of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    Open,
    Eof,
    Closed,
}

/// What a pending channel-request reply resolves, beyond the caller's
/// oneshot: some replies flip connection-level permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyKind {
    Generic,
    X11,
    AgentForward,
}

/// The session-side parameters of a live channel.
#[derive(Debug)]
pub(crate) struct ChannelState {
    pub remote_id: u32,
    pub confirmed: bool,
    /// How much the peer still lets us send.
    pub outgoing_window: u32,
    pub outgoing_packet_size: u32,
    pub outgoing_state: StreamState,
    /// How much we still let the peer send.
    pub incoming_window: u32,
    pub incoming_state: StreamState,
    pub close_sent: bool,
    /// Data the window could not yet absorb: `(buffer, extended type,
    /// cursor)`.
    pub pending_data: VecDeque<(CryptoVec, Option<u32>, usize)>,
    /// Continuations for in-flight channel requests, in wire order.
    pub pending_replies: VecDeque<(ReplyKind, Option<oneshot::Sender<bool>>)>,
    /// Set once an exit-status or exit-signal has been delivered.
    pub exited: bool,
    pub pipe: UnboundedSender<OpenChannelMsg>,
}

impl ChannelState {
    pub fn new(
        remote_id: u32,
        outgoing_window: u32,
        outgoing_packet_size: u32,
        incoming_window: u32,
        pipe: UnboundedSender<OpenChannelMsg>,
    ) -> Self {
        ChannelState {
            remote_id,
            confirmed: true,
            outgoing_window,
            outgoing_packet_size,
            outgoing_state: StreamState::Open,
            incoming_window,
            incoming_state: StreamState::Open,
            close_sent: false,
            pending_data: VecDeque::new(),
            pending_replies: VecDeque::new(),
            exited: false,
            pipe,
        }
    }

    pub fn send(&self, msg: ChannelMsg) {
        self.pipe.send(OpenChannelMsg::Msg(msg)).unwrap_or(());
    }

    /// Push as much of `buf[from..]` as the window allows, split into
    /// packets no larger than the peer's maximum, and return how much
    /// was written.
    fn data_noqueue<T: Transport>(&mut self, transport: &mut T, buf0: &[u8], from: usize) -> usize {
        let mut buf = if buf0.len() as u32 > from as u32 + self.outgoing_window {
            &buf0[from..from + self.outgoing_window as usize]
        } else {
            &buf0[from..]
        };
        let buf_len = buf.len();
        while !buf.is_empty() {
            let off = std::cmp::min(buf.len(), self.outgoing_packet_size as usize);
            transport.channel_data(self.remote_id, &buf[..off]);
            self.outgoing_window -= off as u32;
            buf = &buf[off..];
        }
        buf_len
    }

    fn extended_noqueue<T: Transport>(
        &mut self,
        transport: &mut T,
        ext: u32,
        buf0: &[u8],
        from: usize,
    ) -> usize {
        let mut buf = if buf0.len() as u32 > from as u32 + self.outgoing_window {
            &buf0[from..from + self.outgoing_window as usize]
        } else {
            &buf0[from..]
        };
        let buf_len = buf.len();
        while !buf.is_empty() {
            let off = std::cmp::min(buf.len(), self.outgoing_packet_size as usize);
            transport.channel_extended_data(self.remote_id, ext, &buf[..off]);
            self.outgoing_window -= off as u32;
            buf = &buf[off..];
        }
        buf_len
    }

    /// Emit user data, retaining whatever the current window cannot
    /// absorb.
    pub fn data<T: Transport>(&mut self, transport: &mut T, buf0: CryptoVec, ext: Option<u32>) {
        if !self.pending_data.is_empty() {
            self.pending_data.push_back((buf0, ext, 0));
            return;
        }
        let written = match ext {
            None => self.data_noqueue(transport, &buf0, 0),
            Some(ext) => self.extended_noqueue(transport, ext, &buf0, 0),
        };
        if written < buf0.len() {
            self.pending_data.push_back((buf0, ext, written))
        }
    }

    /// After a window adjust, resume the retained writes in order.
    /// Returns the number of bytes that went out.
    pub fn flush_pending<T: Transport>(&mut self, transport: &mut T) -> usize {
        let mut pending_size = 0;
        while let Some((buf, ext, from)) = self.pending_data.pop_front() {
            let size = match ext {
                None => self.data_noqueue(transport, &buf, from),
                Some(ext) => self.extended_noqueue(transport, ext, &buf, from),
            };
            pending_size += size;
            if from + size < buf.len() {
                self.pending_data.push_front((buf, ext, from + size));
                break;
            }
        }
        pending_size
    }

    /// Account for an inbound payload and replenish the window when it
    /// falls under half the target. Returns `false` when the payload
    /// must be discarded (the window was empty), `Err` when the peer
    /// overran a non-empty window.
    pub fn absorb<T: Transport>(
        &mut self,
        transport: &mut T,
        len: usize,
        target: u32,
    ) -> Result<bool, Error> {
        if self.incoming_window == 0 {
            // Ignore extra data.
            // https://tools.ietf.org/html/rfc4254#section-5.2
            return Ok(false);
        }
        if len as u32 > self.incoming_window {
            return Err(Error::Inconsistent);
        }
        self.incoming_window -= len as u32;
        if self.incoming_window < target / 2 {
            transport.channel_window_adjust(self.remote_id, target - self.incoming_window);
            self.incoming_window = target;
        }
        Ok(true)
    }
}

/// A slot of the channel table: either a continuation waiting for the
/// open to be confirmed, or a live channel.
#[derive(Debug)]
pub(crate) enum Slot {
    Pending(UnboundedSender<OpenChannelMsg>),
    Live(ChannelState),
}

/// Local channel identifiers: dense, small, reused after release.
#[derive(Debug)]
pub(crate) struct ChannelManager {
    slots: Vec<Option<Slot>>,
    limit: usize,
}

impl ChannelManager {
    pub fn new(limit: usize) -> Self {
        ChannelManager {
            slots: Vec::new(),
            limit,
        }
    }

    /// Reserve the smallest free identifier, or `None` when all are
    /// taken.
    pub fn add(&mut self, slot: Slot) -> Option<ChannelId> {
        for (i, s) in self.slots.iter_mut().enumerate() {
            if s.is_none() {
                *s = Some(slot);
                return Some(ChannelId(i as u32));
            }
        }
        if self.slots.len() >= self.limit {
            return None;
        }
        self.slots.push(Some(slot));
        Some(ChannelId((self.slots.len() - 1) as u32))
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut Slot> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.as_mut())
    }

    pub fn live_mut(&mut self, id: ChannelId) -> Option<&mut ChannelState> {
        match self.get_mut(id) {
            Some(Slot::Live(state)) => Some(state),
            _ => None,
        }
    }

    /// Replace the pending continuation with a live channel.
    pub fn update(&mut self, id: ChannelId, state: ChannelState) {
        if let Some(s) = self.slots.get_mut(id.0 as usize) {
            *s = Some(Slot::Live(state));
        }
    }

    /// Release an identifier for reuse.
    pub fn remove(&mut self, id: ChannelId) -> Option<Slot> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.take())
    }

    /// Empty the table, handing back every occupied slot.
    pub fn drain(&mut self) -> Vec<Slot> {
        self.slots.drain(..).flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn pending() -> Slot {
        let (tx, _rx) = unbounded_channel();
        Slot::Pending(tx)
    }

    #[test]
    fn ids_are_dense_and_reused() {
        let mut mgr = ChannelManager::new(4);
        let a = mgr.add(pending()).unwrap();
        let b = mgr.add(pending()).unwrap();
        let c = mgr.add(pending()).unwrap();
        assert_eq!((a.0, b.0, c.0), (0, 1, 2));

        assert!(mgr.remove(b).is_some());
        let again = mgr.add(pending()).unwrap();
        assert_eq!(again.0, 1);
    }

    #[test]
    fn allocation_stops_at_the_limit() {
        let mut mgr = ChannelManager::new(2);
        assert!(mgr.add(pending()).is_some());
        assert!(mgr.add(pending()).is_some());
        assert!(mgr.add(pending()).is_none());
        mgr.remove(ChannelId(0));
        assert_eq!(mgr.add(pending()).unwrap().0, 0);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut mgr = ChannelManager::new(2);
        let id = mgr.add(pending()).unwrap();
        assert!(mgr.remove(id).is_some());
        assert!(mgr.remove(id).is_none());
        assert!(mgr.get_mut(id).is_none());
    }
}
