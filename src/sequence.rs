// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Chunked hashing and signing of payloads larger than the module's input
//! buffer.
//!
//! The module advertises its maximum command parameter buffer via
//! `TPM_PT_INPUT_BUFFER`. Payloads at or under that size go through a single
//! HMAC or Hash command; larger payloads run a sequence: start, full-sized
//! updates while more than one chunk remains, then completion with the
//! remainder. The final update is never zero-length and never issued for a
//! payload that fits in one command.

use crate::dispatch::TpmCommandError;
use crate::dispatch::TpmTransport;
use crate::dispatch::Tss;
use crate::session::AuthSession;
use crate::tpm20proto::AlgIdEnum;
use crate::tpm20proto::ReservedHandle;
use crate::tpm20proto::ResponseValidationError;
use crate::tpm20proto::TpmProtoError;
use crate::tpm20proto::TPM20_CAP_TPM_PROPERTIES;
use crate::tpm20proto::TPM20_PT_INPUT_BUFFER;

const SHA256_DIGEST_SIZE: usize = 32;

/// Query the module's maximum command parameter buffer. A zero value would
/// make the sequence update loop spin on empty chunks, so it is a fault.
fn nonzero_max_input<T: TpmTransport>(tss: &mut Tss<T>) -> Result<usize, TpmCommandError> {
    let max_input = tss.get_tpm_property(TPM20_PT_INPUT_BUFFER)? as usize;
    if max_input == 0 {
        return Err(TpmCommandError::BadCapabilityProperty {
            capability: TPM20_CAP_TPM_PROPERTIES,
            property: TPM20_PT_INPUT_BUFFER,
        });
    }
    Ok(max_input)
}

impl<T: TpmTransport> Tss<T> {
    /// HMAC-sign `token` with the key at `key_handle`, writing the SHA-256
    /// digest into `signature`. Returns the number of signature bytes
    /// written.
    ///
    /// An undersized `signature` buffer fails before any module traffic,
    /// with the error carrying the required size. A failed sequence is not
    /// cleaned up; the aborted sequence object stays loaded until the next
    /// reboot or flush, matching the module's own abort semantics.
    pub fn sign_data(
        &mut self,
        session: &mut AuthSession,
        key_handle: ReservedHandle,
        token: &[u8],
        signature: &mut [u8],
    ) -> Result<usize, TpmCommandError> {
        let required = SHA256_DIGEST_SIZE;
        if signature.len() < required {
            return Err(TpmCommandError::OutputBufferTooSmall {
                required,
                capacity: signature.len(),
            });
        }

        let max_input = nonzero_max_input(self)?;

        let digest = if token.len() > max_input {
            let sequence_handle =
                self.hmac_start(session, key_handle, &[], AlgIdEnum::SHA256)?;

            tracing::trace!(
                sequence_handle = sequence_handle.0.get(),
                token_len = token.len(),
                max_input,
                "hmac sequence started"
            );

            let mut offset = 0;
            let mut bytes_left = token.len();
            // The outer size check guarantees the first chunk is full-sized.
            loop {
                self.sequence_update(
                    session,
                    sequence_handle,
                    &token[offset..offset + max_input],
                )?;
                offset += max_input;
                bytes_left -= max_input;
                if bytes_left <= max_input {
                    break;
                }
            }

            self.sequence_complete(session, sequence_handle, &token[offset..])?
                .digest
        } else {
            self.hmac(session, key_handle, token)?
        };

        if digest.size.get() as usize != required {
            return Err(TpmCommandError::InvalidResponse(
                ResponseValidationError::ResponseParametersMalformed,
            ));
        }
        signature[..required].copy_from_slice(digest.contents());
        Ok(required)
    }

    /// Hash `data` with `hash_alg`, writing the digest into `digest_out`.
    /// Returns the number of digest bytes written.
    ///
    /// Uses a single `TPM2_Hash` when the payload fits the module's input
    /// buffer, otherwise an unauthorized hash sequence.
    pub fn hash_data(
        &mut self,
        data: &[u8],
        hash_alg: AlgIdEnum,
        digest_out: &mut [u8],
    ) -> Result<usize, TpmCommandError> {
        let required = hash_alg.digest_size().ok_or_else(|| {
            TpmCommandError::InvalidInputParameter(TpmProtoError::UnsupportedHashAlgorithm(
                hash_alg as u16,
            ))
        })? as usize;
        if digest_out.len() < required {
            return Err(TpmCommandError::OutputBufferTooSmall {
                required,
                capacity: digest_out.len(),
            });
        }

        let max_input = nonzero_max_input(self)?;

        let digest = if data.len() > max_input {
            let sequence_handle = self.hash_sequence_start(&[], hash_alg)?;
            // The sequence object was created with an empty auth value.
            let mut session = AuthSession::password(&[])
                .map_err(TpmCommandError::InvalidInputParameter)?;

            let mut offset = 0;
            let mut bytes_left = data.len();
            loop {
                self.sequence_update(
                    &mut session,
                    sequence_handle,
                    &data[offset..offset + max_input],
                )?;
                offset += max_input;
                bytes_left -= max_input;
                if bytes_left <= max_input {
                    break;
                }
            }

            self.sequence_complete(&mut session, sequence_handle, &data[offset..])?
                .digest
        } else {
            self.hash(data, hash_alg)?.digest
        };

        if digest.size.get() as usize != required {
            return Err(TpmCommandError::InvalidResponse(
                ResponseValidationError::ResponseParametersMalformed,
            ));
        }
        digest_out[..required].copy_from_slice(digest.contents());
        Ok(required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::*;
    use crate::tpm20proto::protocol::Tpm2bBuffer;
    use crate::tpm20proto::TPM20_CAP_TPM_PROPERTIES;
    use crate::tpm20proto::TPM20_ID_KEY_HANDLE;

    fn input_buffer_reply(max_input: u32) -> Vec<u8> {
        let mut params = Vec::new();
        params.push(0x00); // moreData
        params.extend_from_slice(&TPM20_CAP_TPM_PROPERTIES.to_be_bytes());
        params.extend_from_slice(&1u32.to_be_bytes());
        params.extend_from_slice(&TPM20_PT_INPUT_BUFFER.to_be_bytes());
        params.extend_from_slice(&max_input.to_be_bytes());
        ok_reply(None, &params, 0)
    }

    fn digest_reply(session_acks: usize) -> Vec<u8> {
        let digest = Tpm2bBuffer::new(&[0x77; 32]).unwrap();
        ok_reply(None, &digest.serialize(), session_acks)
    }

    // A sequence command request with one empty password session lays out
    // as: header (10), sequence handle (4), authorizationSize (4), auth
    // record (9), then the TPM2B data parameter.
    fn update_chunk_len(request: &[u8]) -> u16 {
        u16::from_be_bytes([request[27], request[28]])
    }

    #[test]
    fn test_sign_data_chunks_exactly() {
        let mut transport = FakeTransport::new();
        transport.queue(input_buffer_reply(68));
        transport.queue(ok_reply(Some(0x8000_0003), &[], 1)); // HMAC_Start
        transport.queue(ok_reply(None, &[], 1)); // SequenceUpdate
        transport.queue(ok_reply(None, &[], 1)); // SequenceUpdate
        transport.queue(digest_reply(1)); // SequenceComplete
        let mut tss = Tss::new(transport);

        let mut session = AuthSession::password(&[]).unwrap();
        let token = vec![0xa5u8; 200];
        let mut signature = [0u8; 32];
        let written = tss
            .sign_data(&mut session, TPM20_ID_KEY_HANDLE, &token, &mut signature)
            .unwrap();

        assert_eq!(written, 32);
        assert_eq!(signature, [0x77; 32]);

        // GetCapability, HMAC_Start, 2 updates of 68, completion with 64.
        let requests = &tss.transport.requests;
        assert_eq!(requests.len(), 5);
        assert_eq!(update_chunk_len(&requests[2]), 68);
        assert_eq!(update_chunk_len(&requests[3]), 68);
        assert_eq!(update_chunk_len(&requests[4]), 64);
    }

    #[test]
    fn test_sign_data_never_sends_empty_update() {
        // 136 = 2 * 68: one update, then completion carries the second full
        // chunk rather than an empty trailing update.
        let mut transport = FakeTransport::new();
        transport.queue(input_buffer_reply(68));
        transport.queue(ok_reply(Some(0x8000_0003), &[], 1));
        transport.queue(ok_reply(None, &[], 1));
        transport.queue(digest_reply(1));
        let mut tss = Tss::new(transport);

        let mut session = AuthSession::password(&[]).unwrap();
        let token = vec![0x11u8; 136];
        let mut signature = [0u8; 32];
        tss.sign_data(&mut session, TPM20_ID_KEY_HANDLE, &token, &mut signature)
            .unwrap();

        let requests = &tss.transport.requests;
        assert_eq!(requests.len(), 4);
        assert_eq!(update_chunk_len(&requests[2]), 68);
        assert_eq!(update_chunk_len(&requests[3]), 68);
    }

    #[test]
    fn test_sign_data_single_shot_when_fits() {
        let mut transport = FakeTransport::new();
        transport.queue(input_buffer_reply(68));
        transport.queue(digest_reply(1)); // HMAC
        let mut tss = Tss::new(transport);

        let mut session = AuthSession::password(&[]).unwrap();
        let token = vec![0x22u8; 68];
        let mut signature = [0u8; 32];
        tss.sign_data(&mut session, TPM20_ID_KEY_HANDLE, &token, &mut signature)
            .unwrap();

        // GetCapability then a single HMAC, no sequence traffic.
        assert_eq!(tss.transport.requests.len(), 2);
        assert_eq!(&tss.transport.requests[1][6..10], &0x0000_0155u32.to_be_bytes());
    }

    #[test]
    fn test_sign_data_undersized_output_reports_required_size() {
        for capacity in [0usize, 16, 31] {
            let mut tss = Tss::new(FakeTransport::new());
            let mut session = AuthSession::password(&[]).unwrap();
            let mut signature = vec![0u8; capacity];
            let err = tss
                .sign_data(&mut session, TPM20_ID_KEY_HANDLE, &[0u8; 16], &mut signature)
                .unwrap_err();

            if let TpmCommandError::OutputBufferTooSmall { required, capacity: got } = err {
                assert_eq!(required, 32);
                assert_eq!(got, capacity);
            } else {
                panic!("unexpected error {err:?}");
            }
            // Checked before any module traffic.
            assert!(tss.transport.requests.is_empty());
        }
    }

    #[test]
    fn test_sign_data_propagates_sequence_failure() {
        let mut transport = FakeTransport::new();
        transport.queue(input_buffer_reply(68));
        transport.queue(ok_reply(Some(0x8000_0003), &[], 1));
        transport.queue(err_reply(0x0000_0922)); // TPM_RC_RETRY mid-sequence
        let mut tss = Tss::new(transport);

        let mut session = AuthSession::password(&[]).unwrap();
        let token = vec![0x33u8; 200];
        let mut signature = [0u8; 32];
        let err = tss
            .sign_data(&mut session, TPM20_ID_KEY_HANDLE, &token, &mut signature)
            .unwrap_err();

        assert!(matches!(err, TpmCommandError::TpmCommandFailed { .. }));
        // No completion attempt after the failed update.
        assert_eq!(tss.transport.requests.len(), 3);
    }

    #[test]
    fn test_sign_data_rejects_zero_input_buffer() {
        // An advertised input buffer of 0 can never carry a chunk.
        let mut transport = FakeTransport::new();
        transport.queue(input_buffer_reply(0));
        let mut tss = Tss::new(transport);

        let mut session = AuthSession::password(&[]).unwrap();
        let mut signature = [0u8; 32];
        let err = tss
            .sign_data(&mut session, TPM20_ID_KEY_HANDLE, &[0u8; 16], &mut signature)
            .unwrap_err();
        assert!(matches!(
            err,
            TpmCommandError::BadCapabilityProperty {
                capability: TPM20_CAP_TPM_PROPERTIES,
                property: TPM20_PT_INPUT_BUFFER,
            }
        ));
        // Only the capability query went out.
        assert_eq!(tss.transport.requests.len(), 1);

        let mut transport = FakeTransport::new();
        transport.queue(input_buffer_reply(0));
        let mut tss = Tss::new(transport);
        let mut out = [0u8; 32];
        let err = tss
            .hash_data(&[0u8; 16], AlgIdEnum::SHA256, &mut out)
            .unwrap_err();
        assert!(matches!(err, TpmCommandError::BadCapabilityProperty { .. }));
        assert_eq!(tss.transport.requests.len(), 1);
    }

    #[test]
    fn test_hash_data_chunks_large_payload() {
        let mut transport = FakeTransport::new();
        transport.queue(input_buffer_reply(68));
        transport.queue(ok_reply(Some(0x8000_0004), &[], 0)); // HashSequenceStart
        transport.queue(ok_reply(None, &[], 1)); // SequenceUpdate
        transport.queue(ok_reply(None, &[], 1)); // SequenceUpdate
        transport.queue(digest_reply(1)); // SequenceComplete
        let mut tss = Tss::new(transport);

        let data = vec![0x44u8; 200];
        let mut out = [0u8; 32];
        let written = tss.hash_data(&data, AlgIdEnum::SHA256, &mut out).unwrap();
        assert_eq!(written, 32);
        assert_eq!(out, [0x77; 32]);

        // GetCapability, HashSequenceStart, 2 updates of 68, completion
        // with 64.
        let requests = &tss.transport.requests;
        assert_eq!(requests.len(), 5);
        assert_eq!(update_chunk_len(&requests[2]), 68);
        assert_eq!(update_chunk_len(&requests[3]), 68);
        assert_eq!(update_chunk_len(&requests[4]), 64);
    }

    #[test]
    fn test_hash_data_single_shot() {
        let digest = Tpm2bBuffer::new(&[0x99; 32]).unwrap();
        let mut transport = FakeTransport::new();
        transport.queue(input_buffer_reply(1024));
        transport.queue(ok_reply(None, &digest.serialize(), 0)); // TPM2_Hash
        let mut tss = Tss::new(transport);

        let mut out = [0u8; 32];
        let written = tss
            .hash_data(b"device registration blob", AlgIdEnum::SHA256, &mut out)
            .unwrap();
        assert_eq!(written, 32);
        assert_eq!(out, [0x99; 32]);
    }

    #[test]
    fn test_hash_data_rejects_unsupported_algorithm() {
        let mut tss = Tss::new(FakeTransport::new());
        let mut out = [0u8; 64];
        let err = tss
            .hash_data(&[0u8; 8], AlgIdEnum::AES, &mut out)
            .unwrap_err();
        assert!(matches!(err, TpmCommandError::InvalidInputParameter(_)));
    }
}
