//! Bencoded payloads of the builtin consumers.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::common::{Contact, Id};
use crate::rpc::TokenId;
use crate::Result;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Response envelope handled by the [Callback](crate::rpc::Callback) consumer.
pub struct ResponseMessage {
    #[serde(rename = "t")]
    pub token: TokenId,

    #[serde(rename = "p")]
    pub payload: ByteBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Request handled by the [GetClosestNodes](crate::rpc::GetClosestNodes) consumer.
pub struct ClosestRequest {
    #[serde(rename = "t")]
    pub token: TokenId,

    #[serde(rename = "i")]
    pub target: ByteBuf,

    #[serde(rename = "l")]
    pub limit: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
/// Answer to a [ClosestRequest], encoded contacts closest first.
pub struct ClosestResponse {
    #[serde(rename = "c")]
    pub contacts: Vec<ByteBuf>,
}

impl ResponseMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<ResponseMessage> {
        Ok(serde_bencode::from_bytes(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }
}

impl ClosestRequest {
    pub fn new(token: TokenId, target: &Id, limit: usize) -> Self {
        ClosestRequest {
            token,
            target: ByteBuf::from(target.to_vec()),
            limit: u32::try_from(limit).unwrap_or(u32::MAX),
        }
    }

    pub fn target(&self) -> Result<Id> {
        Id::from_bytes(&self.target)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<ClosestRequest> {
        Ok(serde_bencode::from_bytes(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }
}

impl ClosestResponse {
    pub fn new<'a, I: IntoIterator<Item = &'a Contact>>(contacts: I) -> Self {
        ClosestResponse {
            contacts: contacts
                .into_iter()
                .map(|contact| ByteBuf::from(contact.to_bytes().to_vec()))
                .collect(),
        }
    }

    /// Decodes the contacts, reachable the same way as `template`.
    pub fn contacts(&self, template: &Contact) -> Result<Vec<Contact>> {
        self.contacts
            .iter()
            .map(|bytes| Contact::decode(&mut &bytes[..], template))
            .collect()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<ClosestResponse> {
        Ok(serde_bencode::from_bytes(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn response_envelope_keys() {
        let message = ResponseMessage {
            token: 42,
            payload: ByteBuf::from(vec![1, 3, 3, 7]),
        };

        let bytes = message.to_bytes().unwrap();
        assert_eq!(bytes, b"d1:p4:\x01\x03\x03\x071:ti42ee".to_vec());

        assert_eq!(ResponseMessage::from_bytes(&bytes).unwrap(), message);
    }

    #[test]
    fn request_carries_target() {
        let target = Id::random();
        let request = ClosestRequest::new(-3, &target, 5);

        let decoded = ClosestRequest::from_bytes(&request.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded.token, -3);
        assert_eq!(decoded.limit, 5);
        assert_eq!(decoded.target().unwrap(), target);
    }

    #[test]
    fn garbage_is_a_bencode_error() {
        assert!(matches!(
            ResponseMessage::from_bytes(b"not bencode"),
            Err(crate::Error::BencodeError(_))
        ));
    }
}
