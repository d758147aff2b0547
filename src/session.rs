// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Authorization sessions attached to commands.
//!
//! An [`AuthSession`] keeps both directions of the session state: the
//! `TPMS_AUTH_COMMAND` record marshaled into the command authorization area
//! and the `TPMS_AUTH_RESPONSE` record parsed back out, including the nonce
//! the module rotates on every session-carrying exchange.

use crate::tpm20proto::protocol::Tpm2bBuffer;
use crate::tpm20proto::ReservedHandle;
use crate::tpm20proto::SessionAttributes;
use crate::tpm20proto::TpmProtoError;
use crate::tpm20proto::TPM20_RS_PW;
use zerocopy::IntoBytes;

/// `TPMS_AUTH_COMMAND`
#[derive(Debug, Copy, Clone)]
pub struct SessionIn {
    pub session_handle: ReservedHandle,
    pub nonce: Tpm2bBuffer,
    pub attributes: SessionAttributes,
    pub hmac: Tpm2bBuffer,
}

/// `TPMS_AUTH_RESPONSE`
#[derive(Debug, Copy, Clone)]
pub struct SessionOut {
    pub nonce: Tpm2bBuffer,
    pub attributes: SessionAttributes,
    pub hmac: Tpm2bBuffer,
}

#[derive(Debug, Copy, Clone)]
pub struct AuthSession {
    pub sess_in: SessionIn,
    pub sess_out: SessionOut,
}

impl AuthSession {
    /// A password authorization session: the well-known `TPM_RS_PW` handle,
    /// no nonces, and the authorization value sent in the clear.
    pub fn password(auth: &[u8]) -> Result<Self, TpmProtoError> {
        let hmac = Tpm2bBuffer::new(auth).map_err(TpmProtoError::PasswordSessionAuth)?;
        let attributes = SessionAttributes::new().with_continue_session(true);
        Ok(Self {
            sess_in: SessionIn {
                session_handle: TPM20_RS_PW,
                nonce: Tpm2bBuffer::empty(),
                attributes,
                hmac,
            },
            sess_out: SessionOut {
                nonce: Tpm2bBuffer::empty(),
                attributes,
                hmac: Tpm2bBuffer::empty(),
            },
        })
    }

    /// A session established by `TPM2_StartAuthSession`. The module's first
    /// nonce arrives in the command response and is stored by the caller.
    pub(crate) fn started(
        session_handle: ReservedHandle,
        nonce_caller: Tpm2bBuffer,
        nonce_tpm: Tpm2bBuffer,
        attributes: SessionAttributes,
    ) -> Self {
        Self {
            sess_in: SessionIn {
                session_handle,
                nonce: nonce_caller,
                attributes,
                hmac: Tpm2bBuffer::empty(),
            },
            sess_out: SessionOut {
                nonce: nonce_tpm,
                attributes,
                hmac: Tpm2bBuffer::empty(),
            },
        }
    }

    pub fn handle(&self) -> ReservedHandle {
        self.sess_in.session_handle
    }

    /// Marshal the full `TPMS_AUTH_COMMAND` record for the command
    /// authorization area.
    pub(crate) fn serialize_auth_command(&self) -> Vec<u8> {
        let mut buffer = Vec::new();

        buffer.extend_from_slice(self.sess_in.session_handle.as_bytes());
        buffer.extend_from_slice(&self.sess_in.nonce.serialize());
        buffer.push(self.sess_in.attributes.into());
        buffer.extend_from_slice(&self.sess_in.hmac.serialize());

        buffer
    }

    /// Parse one `TPMS_AUTH_RESPONSE` record from the trailing session area
    /// of a response and rotate the module nonce. Returns the number of
    /// bytes consumed.
    pub(crate) fn apply_auth_response(&mut self, bytes: &[u8]) -> Option<usize> {
        let nonce = Tpm2bBuffer::deserialize(bytes)?;
        let mut consumed = nonce.payload_size();

        let attributes = SessionAttributes::from(*bytes.get(consumed)?);
        consumed += 1;

        let hmac = Tpm2bBuffer::deserialize(&bytes[consumed..])?;
        consumed += hmac.payload_size();

        self.sess_out = SessionOut {
            nonce,
            attributes,
            hmac,
        };

        Some(consumed)
    }
}

/// Draw `len` cryptographic-quality random bytes for a caller nonce.
pub(crate) fn random_nonce(len: usize) -> Result<Tpm2bBuffer, getrandom::Error> {
    let mut bytes = [0u8; crate::tpm20proto::MAX_DIGEST_BUFFER_SIZE];
    getrandom::getrandom(&mut bytes[..len])?;

    let mut nonce = Tpm2bBuffer::empty();
    nonce.size = (len as u16).into();
    nonce.buffer[..len].copy_from_slice(&bytes[..len]);
    Ok(nonce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm20proto::SessionTagEnum;

    #[test]
    fn test_password_session_record() {
        let session = AuthSession::password(b"owner").unwrap();
        let record = session.serialize_auth_command();

        // handle, empty nonce, continueSession, 5-byte auth
        let mut expected = Vec::new();
        expected.extend_from_slice(&0x4000_0009u32.to_be_bytes());
        expected.extend_from_slice(&[0x00, 0x00]);
        expected.push(0x01);
        expected.extend_from_slice(&[0x00, 0x05]);
        expected.extend_from_slice(b"owner");
        assert_eq!(record, expected);

        assert_eq!(session.sess_in.nonce.size.get(), 0);
        assert_eq!(session.sess_out.nonce.size.get(), 0);
    }

    #[test]
    fn test_auth_response_rotates_nonce() {
        let mut session = AuthSession::password(&[]).unwrap();

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x00, 0x04]); // nonceTPM
        bytes.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        bytes.push(0x01); // continueSession
        bytes.extend_from_slice(&[0x00, 0x00]); // empty hmac
        bytes.extend_from_slice(&[0xff, 0xff]); // next record, not ours

        let consumed = session.apply_auth_response(&bytes).unwrap();
        assert_eq!(consumed, 9);
        assert_eq!(session.sess_out.nonce.contents(), &[0xde, 0xad, 0xbe, 0xef]);
        assert!(session.sess_out.attributes.continue_session());

        // Truncated record
        assert!(session.apply_auth_response(&[0x00, 0x04, 0xde]).is_none());
    }

    #[test]
    fn test_random_nonce_len() {
        let nonce = random_nonce(32).unwrap();
        assert_eq!(nonce.size.get(), 32);
        assert_eq!(nonce.contents().len(), 32);

        let nonce = random_nonce(20).unwrap();
        assert_eq!(nonce.contents().len(), 20);
    }

    #[test]
    fn test_session_tag_lookup() {
        assert_eq!(SessionTagEnum::from_u16(0x8002), Some(SessionTagEnum::Sessions));
        assert_eq!(SessionTagEnum::from_u16(0x1234), None);
    }
}
