//! Correlation of responses with the requests waiting for them.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use flume::{Receiver, Sender};
use serde_bytes::ByteBuf;
use tracing::trace;

use crate::common::Contact;
use crate::rpc::messages::ResponseMessage;
use crate::rpc::{ConsumerId, MessageConsumer, TokenId};
use crate::{Error, Result};

/// Builtin consumer answering requests with responses matched by token.
pub const CALLBACK_ID: ConsumerId = ConsumerId::from_u128(0x96de743d_8ec0_451e_a2a3_bb915af1095e);

#[derive(Debug, Default)]
/// Allocates [WaitToken]s and fulfils them as responses are delivered.
pub struct Callback {
    next_token: AtomicI64,
    pending: DashMap<TokenId, Sender<Bytes>>,
}

#[derive(Debug)]
/// A pending request, waiting for its response.
pub struct WaitToken {
    id: TokenId,
    receiver: Receiver<Bytes>,
    response: Option<Bytes>,
}

impl WaitToken {
    pub fn id(&self) -> TokenId {
        self.id
    }

    /// Blocks until a response arrives or `timeout` elapses.
    ///
    /// Returns `true` if a response has arrived.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        if self.response.is_some() {
            return true;
        }

        match self.receiver.recv_timeout(timeout) {
            Ok(response) => {
                self.response = Some(response);
                true
            }
            Err(_) => false,
        }
    }

    pub fn response(&self) -> Option<&Bytes> {
        self.response.as_ref()
    }

    pub fn into_response(self) -> Option<Bytes> {
        self.response
    }
}

impl Callback {
    pub fn new() -> Self {
        Self::default()
    }

    // === Getters ===

    /// Number of tokens still waiting for a response.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    // === Public Methods ===

    pub fn allocate_token(&self) -> WaitToken {
        let id = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = flume::bounded(1);

        match self.pending.entry(id) {
            Entry::Occupied(_) => unreachable!("token {id} allocated twice"),
            Entry::Vacant(entry) => {
                entry.insert(sender);
            }
        }

        WaitToken {
            id,
            receiver,
            response: None,
        }
    }

    /// Stops waiting for a response to `token`. Freeing twice is a no-op.
    pub fn free_token(&self, token: &WaitToken) {
        self.pending.remove(&token.id);
    }

    /// Fulfils the pending token `token` with `payload`.
    pub fn fulfil(&self, token: TokenId, payload: Bytes) -> Result<()> {
        let Some((_, sender)) = self.pending.remove(&token) else {
            return Err(Error::UnmatchedResponse(token));
        };

        // The waiter may have given up already, nothing left to do then.
        let _ = sender.try_send(payload);

        Ok(())
    }

    /// Sends `payload` as the response to `token` to the callback consumer of `target`.
    pub fn send_response(
        &self,
        local: &Contact,
        target: &Contact,
        token: TokenId,
        payload: &[u8],
    ) -> Result<()> {
        let message = ResponseMessage {
            token,
            payload: ByteBuf::from(payload.to_vec()),
        };

        target.send(local, CALLBACK_ID, &message.to_bytes()?)
    }
}

impl MessageConsumer for Callback {
    fn consumer_id(&self) -> ConsumerId {
        CALLBACK_ID
    }

    fn deliver(&self, source: &Contact, message: &[u8]) -> Result<()> {
        let response = ResponseMessage::from_bytes(message)?;

        trace!(context = "callback", token = response.token, from = ?source.id(), "Response");

        self.fulfil(response.token, Bytes::from(response.payload.into_vec()))
    }
}
