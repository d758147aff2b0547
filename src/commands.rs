// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Typed wrappers for the supported TPM 2.0 commands.
//!
//! Each method marshals its parameter area, runs one dispatch cycle, and
//! unmarshals the typed results from the response parameter area. Handle and
//! session ordering follows Part 3 of the TPM 2.0 specification.

use crate::dispatch::TpmCommandError;
use crate::dispatch::TpmTransport;
use crate::dispatch::Tss;
use crate::session::AuthSession;
use crate::tpm20proto::protocol::SessionType;
use crate::tpm20proto::protocol::StartupType;
use crate::tpm20proto::protocol::Tpm2bBuffer;
use crate::tpm20proto::protocol::Tpm2bPublic;
use crate::tpm20proto::protocol::Tpm2bSensitiveCreate;
use crate::tpm20proto::protocol::TpmlPcrSelection;
use crate::tpm20proto::protocol::TpmsCapabilityData;
use crate::tpm20proto::protocol::TpmsRsaParams;
use crate::tpm20proto::protocol::TpmsSensitiveCreate;
use crate::tpm20proto::protocol::TpmtPublic;
use crate::tpm20proto::protocol::TpmtScheme;
use crate::tpm20proto::protocol::TpmtSignature;
use crate::tpm20proto::protocol::TpmtSymDefObject;
use crate::tpm20proto::protocol::TpmtTicket;
use crate::tpm20proto::protocol::TpmuPublicParms;
use crate::tpm20proto::AlgId;
use crate::tpm20proto::AlgIdEnum;
use crate::tpm20proto::CommandCodeEnum;
use crate::tpm20proto::ReservedHandle;
use crate::tpm20proto::ResponseValidationError;
use crate::tpm20proto::SessionAttributes;
use crate::tpm20proto::TpmProtoError;
use crate::tpm20proto::TpmaObjectBits;
use crate::tpm20proto::TPM20_CAP_TPM_PROPERTIES;
use crate::tpm20proto::TPM20_RH_NULL;
use zerocopy::IntoBytes;

fn malformed() -> TpmCommandError {
    TpmCommandError::InvalidResponse(ResponseValidationError::ResponseParametersMalformed)
}

/// Unmarshal a size-flagged `TPM2B_PUBLIC`: a zero size prefix means the
/// public area was not returned.
fn read_flagged_public(bytes: &[u8]) -> Option<(Option<Tpm2bPublic>, usize)> {
    if bytes.len() < 2 {
        return None;
    }
    let size = u16::from_be_bytes([bytes[0], bytes[1]]);
    if size == 0 {
        return Some((None, 2));
    }
    let public = Tpm2bPublic::deserialize(bytes)?;
    let consumed = public.payload_size();
    Some((Some(public), consumed))
}

#[derive(Debug)]
pub struct GetCapabilityReply {
    pub more_data: bool,
    pub capability_data: TpmsCapabilityData,
}

#[derive(Debug)]
pub struct PolicySecretReply {
    pub timeout: Tpm2bBuffer,
    pub policy_ticket: Option<TpmtTicket>,
}

#[derive(Debug)]
pub struct CreatePrimaryReply {
    pub object_handle: ReservedHandle,
    pub out_public: Option<Tpm2bPublic>,
    pub creation_data: Tpm2bBuffer,
    pub creation_hash: Tpm2bBuffer,
    pub creation_ticket: TpmtTicket,
}

#[derive(Debug)]
pub struct CreateReply {
    pub out_private: Tpm2bBuffer,
    pub out_public: Option<Tpm2bPublic>,
    pub creation_data: Tpm2bBuffer,
    pub creation_hash: Tpm2bBuffer,
    pub creation_ticket: TpmtTicket,
}

#[derive(Debug)]
pub struct LoadReply {
    pub object_handle: ReservedHandle,
    pub name: Tpm2bBuffer,
}

#[derive(Debug)]
pub struct ReadPublicReply {
    pub out_public: Option<Tpm2bPublic>,
    pub name: Tpm2bBuffer,
    pub qualified_name: Tpm2bBuffer,
}

#[derive(Debug)]
pub struct HashReply {
    pub digest: Tpm2bBuffer,
    pub validation: Option<TpmtTicket>,
}

#[derive(Debug)]
pub struct SequenceCompleteReply {
    pub digest: Tpm2bBuffer,
    pub validation: Option<TpmtTicket>,
}

/// Default creation inputs shared by `create` and `create_primary`: empty
/// sensitive data, empty outside info, no creation PCRs.
fn default_creation_params(in_public: &Tpm2bPublic) -> Result<Vec<u8>, TpmCommandError> {
    let sensitive = Tpm2bSensitiveCreate::new(
        TpmsSensitiveCreate::new(&[], &[]).map_err(TpmCommandError::InvalidInputParameter)?,
    );
    let creation_pcr = TpmlPcrSelection::new(&[])
        .map_err(|e| TpmCommandError::InvalidInputParameter(TpmProtoError::CreationPcrSelection(e)))?;

    let mut params = Vec::new();
    params.extend(sensitive.serialize());
    params.extend(in_public.serialize());
    params.extend(Tpm2bBuffer::empty().serialize()); // outsideInfo
    params.extend(creation_pcr.serialize());
    Ok(params)
}

impl<T: TpmTransport> Tss<T> {
    /// `TPM2_Startup`
    pub fn startup(&mut self, startup_type: StartupType) -> Result<(), TpmCommandError> {
        let params = (startup_type as u16).to_be_bytes();
        self.dispatch(CommandCodeEnum::Startup, &[], &mut [], &params)
    }

    /// `TPM2_GetCapability`
    pub fn get_capability(
        &mut self,
        capability: u32,
        property: u32,
        property_count: u32,
    ) -> Result<GetCapabilityReply, TpmCommandError> {
        let mut params = Vec::new();
        params.extend_from_slice(&capability.to_be_bytes());
        params.extend_from_slice(&property.to_be_bytes());
        params.extend_from_slice(&property_count.to_be_bytes());

        self.dispatch(CommandCodeEnum::GetCapability, &[], &mut [], &params)?;

        let bytes = self.cmd_ctx.response_params();
        let more_data = *bytes.first().ok_or_else(malformed)? != 0;
        let capability_data =
            TpmsCapabilityData::deserialize(&bytes[1..]).ok_or_else(malformed)?;

        Ok(GetCapabilityReply {
            more_data,
            capability_data,
        })
    }

    /// Look up a single `TPM_PT_*` property value. A response that does not
    /// echo exactly the requested property is a fault, so a property value
    /// can never be confused with an error indication.
    pub fn get_tpm_property(&mut self, property: u32) -> Result<u32, TpmCommandError> {
        let reply = self.get_capability(TPM20_CAP_TPM_PROPERTIES, property, 1)?;

        let bad_property = || TpmCommandError::BadCapabilityProperty {
            capability: TPM20_CAP_TPM_PROPERTIES,
            property,
        };
        let data = &reply.capability_data;
        if data.capability.get() != TPM20_CAP_TPM_PROPERTIES {
            return Err(bad_property());
        }
        if data.count.get() != 1 {
            return Err(bad_property());
        }
        if data.tpm_properties[0].property.get() != property {
            return Err(bad_property());
        }

        Ok(data.tpm_properties[0].value.get())
    }

    /// `TPM2_StartAuthSession` with an unbound, unsalted session: tpmKey and
    /// bind are both `TPM_RH_NULL`, no salt, null symmetric algorithm. The
    /// caller nonce is freshly drawn with the hash algorithm's digest size.
    pub fn start_auth_session(
        &mut self,
        session_type: SessionType,
        auth_hash: AlgIdEnum,
        attributes: SessionAttributes,
    ) -> Result<AuthSession, TpmCommandError> {
        let digest_size = auth_hash.digest_size().ok_or_else(|| {
            TpmCommandError::InvalidInputParameter(TpmProtoError::UnsupportedHashAlgorithm(
                auth_hash as u16,
            ))
        })?;
        let nonce_caller = crate::session::random_nonce(digest_size as usize)
            .map_err(TpmCommandError::NonceGeneration)?;

        let mut params = Vec::new();
        params.extend(nonce_caller.serialize());
        params.extend(Tpm2bBuffer::empty().serialize()); // encryptedSalt
        params.push(session_type as u8);
        params.extend(TpmtSymDefObject::null().serialize());
        params.extend_from_slice(AlgId::from(auth_hash).as_bytes());

        self.dispatch(
            CommandCodeEnum::StartAuthSession,
            &[TPM20_RH_NULL, TPM20_RH_NULL],
            &mut [],
            &params,
        )?;

        let session_handle = self.cmd_ctx.ret_handle;
        let nonce_tpm =
            Tpm2bBuffer::deserialize(self.cmd_ctx.response_params()).ok_or_else(malformed)?;

        tracing::trace!(
            handle = session_handle.0.get(),
            ?session_type,
            "auth session established"
        );

        Ok(AuthSession::started(
            session_handle,
            nonce_caller,
            nonce_tpm,
            attributes,
        ))
    }

    /// `TPM2_PolicySecret` with empty cpHashA and policyRef.
    pub fn policy_secret(
        &mut self,
        session: &mut AuthSession,
        auth_handle: ReservedHandle,
        policy_session_handle: ReservedHandle,
        nonce_tpm: &Tpm2bBuffer,
        expiration: i32,
    ) -> Result<PolicySecretReply, TpmCommandError> {
        let mut params = Vec::new();
        params.extend(nonce_tpm.serialize());
        params.extend(Tpm2bBuffer::empty().serialize()); // cpHashA
        params.extend(Tpm2bBuffer::empty().serialize()); // policyRef
        params.extend_from_slice(&expiration.to_be_bytes());

        self.dispatch(
            CommandCodeEnum::PolicySecret,
            &[auth_handle, policy_session_handle],
            &mut [session],
            &params,
        )?;

        let bytes = self.cmd_ctx.response_params();
        let timeout = Tpm2bBuffer::deserialize(bytes).ok_or_else(malformed)?;
        let offset = timeout.payload_size();
        let policy_ticket = if offset < bytes.len() {
            Some(TpmtTicket::deserialize(&bytes[offset..]).ok_or_else(malformed)?)
        } else {
            None
        };

        Ok(PolicySecretReply {
            timeout,
            policy_ticket,
        })
    }

    /// `TPM2_CreatePrimary` with default creation inputs.
    pub fn create_primary(
        &mut self,
        session: &mut AuthSession,
        hierarchy: ReservedHandle,
        in_public: &Tpm2bPublic,
    ) -> Result<CreatePrimaryReply, TpmCommandError> {
        let params = default_creation_params(in_public)?;

        self.dispatch(
            CommandCodeEnum::CreatePrimary,
            &[hierarchy],
            &mut [session],
            &params,
        )?;

        let object_handle = self.cmd_ctx.ret_handle;
        let bytes = self.cmd_ctx.response_params();
        let (out_public, mut offset) = read_flagged_public(bytes).ok_or_else(malformed)?;
        let creation_data = Tpm2bBuffer::deserialize(&bytes[offset..]).ok_or_else(malformed)?;
        offset += creation_data.payload_size();
        let creation_hash = Tpm2bBuffer::deserialize(&bytes[offset..]).ok_or_else(malformed)?;
        offset += creation_hash.payload_size();
        let creation_ticket = TpmtTicket::deserialize(&bytes[offset..]).ok_or_else(malformed)?;

        tracing::trace!(
            handle = object_handle.0.get(),
            hierarchy = hierarchy.0.get(),
            "created primary object"
        );

        Ok(CreatePrimaryReply {
            object_handle,
            out_public,
            creation_data,
            creation_hash,
            creation_ticket,
        })
    }

    /// `TPM2_Create` with default creation inputs.
    pub fn create(
        &mut self,
        session: &mut AuthSession,
        parent_handle: ReservedHandle,
        in_public: &Tpm2bPublic,
    ) -> Result<CreateReply, TpmCommandError> {
        let params = default_creation_params(in_public)?;

        self.dispatch(
            CommandCodeEnum::Create,
            &[parent_handle],
            &mut [session],
            &params,
        )?;

        let bytes = self.cmd_ctx.response_params();
        let out_private = Tpm2bBuffer::deserialize(bytes).ok_or_else(malformed)?;
        let mut offset = out_private.payload_size();
        let (out_public, consumed) =
            read_flagged_public(&bytes[offset..]).ok_or_else(malformed)?;
        offset += consumed;
        let creation_data = Tpm2bBuffer::deserialize(&bytes[offset..]).ok_or_else(malformed)?;
        offset += creation_data.payload_size();
        let creation_hash = Tpm2bBuffer::deserialize(&bytes[offset..]).ok_or_else(malformed)?;
        offset += creation_hash.payload_size();
        let creation_ticket = TpmtTicket::deserialize(&bytes[offset..]).ok_or_else(malformed)?;

        Ok(CreateReply {
            out_private,
            out_public,
            creation_data,
            creation_hash,
            creation_ticket,
        })
    }

    /// `TPM2_Load`
    pub fn load(
        &mut self,
        session: &mut AuthSession,
        parent_handle: ReservedHandle,
        in_private: &Tpm2bBuffer,
        in_public: &Tpm2bPublic,
    ) -> Result<LoadReply, TpmCommandError> {
        let mut params = Vec::new();
        params.extend(in_private.serialize());
        params.extend(in_public.serialize());

        self.dispatch(
            CommandCodeEnum::Load,
            &[parent_handle],
            &mut [session],
            &params,
        )?;

        let object_handle = self.cmd_ctx.ret_handle;
        let name =
            Tpm2bBuffer::deserialize(self.cmd_ctx.response_params()).ok_or_else(malformed)?;

        Ok(LoadReply {
            object_handle,
            name,
        })
    }

    /// `TPM2_Import`. Returns the reparented private blob.
    pub fn import(
        &mut self,
        session: &mut AuthSession,
        parent_handle: ReservedHandle,
        encryption_key: &Tpm2bBuffer,
        object_public: &Tpm2bPublic,
        duplicate: &Tpm2bBuffer,
        in_sym_seed: &Tpm2bBuffer,
        symmetric_alg: &TpmtSymDefObject,
    ) -> Result<Tpm2bBuffer, TpmCommandError> {
        let mut params = Vec::new();
        params.extend(encryption_key.serialize());
        params.extend(object_public.serialize());
        params.extend(duplicate.serialize());
        params.extend(in_sym_seed.serialize());
        params.extend(symmetric_alg.serialize());

        self.dispatch(
            CommandCodeEnum::Import,
            &[parent_handle],
            &mut [session],
            &params,
        )?;

        Tpm2bBuffer::deserialize(self.cmd_ctx.response_params()).ok_or_else(malformed)
    }

    /// `TPM2_ActivateCredential`. Takes two authorization sessions: one for
    /// the object being activated, one for the decryption key. Returns the
    /// released certificate digest.
    pub fn activate_credential(
        &mut self,
        activate_session: &mut AuthSession,
        key_session: &mut AuthSession,
        activate_handle: ReservedHandle,
        key_handle: ReservedHandle,
        credential_blob: &Tpm2bBuffer,
        secret: &Tpm2bBuffer,
    ) -> Result<Tpm2bBuffer, TpmCommandError> {
        let mut params = Vec::new();
        params.extend(credential_blob.serialize());
        params.extend(secret.serialize());

        self.dispatch(
            CommandCodeEnum::ActivateCredential,
            &[activate_handle, key_handle],
            &mut [activate_session, key_session],
            &params,
        )?;

        Tpm2bBuffer::deserialize(self.cmd_ctx.response_params()).ok_or_else(malformed)
    }

    /// `TPM2_ReadPublic`. No authorization required.
    pub fn read_public(
        &mut self,
        object_handle: ReservedHandle,
    ) -> Result<ReadPublicReply, TpmCommandError> {
        self.dispatch(CommandCodeEnum::ReadPublic, &[object_handle], &mut [], &[])?;

        let bytes = self.cmd_ctx.response_params();
        let (out_public, mut offset) = read_flagged_public(bytes).ok_or_else(malformed)?;
        let name = Tpm2bBuffer::deserialize(&bytes[offset..]).ok_or_else(malformed)?;
        offset += name.payload_size();
        let qualified_name = Tpm2bBuffer::deserialize(&bytes[offset..]).ok_or_else(malformed)?;

        Ok(ReadPublicReply {
            out_public,
            name,
            qualified_name,
        })
    }

    /// `TPM2_Sign` with a null scheme (the key's own scheme applies) and a
    /// null hashcheck ticket.
    pub fn sign(
        &mut self,
        session: &mut AuthSession,
        key_handle: ReservedHandle,
        digest: &Tpm2bBuffer,
    ) -> Result<TpmtSignature, TpmCommandError> {
        let mut params = Vec::new();
        params.extend(digest.serialize());
        params.extend(TpmtScheme::null().serialize());
        params.extend(TpmtTicket::null_hashcheck().serialize());

        self.dispatch(
            CommandCodeEnum::Sign,
            &[key_handle],
            &mut [session],
            &params,
        )?;

        TpmtSignature::deserialize(self.cmd_ctx.response_params()).ok_or_else(malformed)
    }

    /// `TPM2_HMAC` over a single buffer, letting the key's hash algorithm
    /// apply (`TPM_ALG_NULL`).
    pub fn hmac(
        &mut self,
        session: &mut AuthSession,
        handle: ReservedHandle,
        data: &[u8],
    ) -> Result<Tpm2bBuffer, TpmCommandError> {
        let data = Tpm2bBuffer::new(data)
            .map_err(|e| TpmCommandError::InvalidInputParameter(TpmProtoError::HmacData(e)))?;

        let mut params = Vec::new();
        params.extend(data.serialize());
        params.extend_from_slice(AlgId::from(AlgIdEnum::NULL).as_bytes());

        self.dispatch(CommandCodeEnum::HMAC, &[handle], &mut [session], &params)?;

        Tpm2bBuffer::deserialize(self.cmd_ctx.response_params()).ok_or_else(malformed)
    }

    /// `TPM2_HMAC_Start`. Returns the sequence handle.
    pub fn hmac_start(
        &mut self,
        session: &mut AuthSession,
        handle: ReservedHandle,
        auth: &[u8],
        hash_alg: AlgIdEnum,
    ) -> Result<ReservedHandle, TpmCommandError> {
        let auth = Tpm2bBuffer::new(auth)
            .map_err(|e| TpmCommandError::InvalidInputParameter(TpmProtoError::HmacStartAuth(e)))?;

        let mut params = Vec::new();
        params.extend(auth.serialize());
        params.extend_from_slice(AlgId::from(hash_alg).as_bytes());

        self.dispatch(
            CommandCodeEnum::HMAC_Start,
            &[handle],
            &mut [session],
            &params,
        )?;

        Ok(self.cmd_ctx.ret_handle)
    }

    /// `TPM2_Hash` of a single buffer under the null hierarchy.
    pub fn hash(
        &mut self,
        data: &[u8],
        hash_alg: AlgIdEnum,
    ) -> Result<HashReply, TpmCommandError> {
        let data = Tpm2bBuffer::new(data)
            .map_err(|e| TpmCommandError::InvalidInputParameter(TpmProtoError::HashData(e)))?;

        let mut params = Vec::new();
        params.extend(data.serialize());
        params.extend_from_slice(AlgId::from(hash_alg).as_bytes());
        params.extend_from_slice(TPM20_RH_NULL.as_bytes());

        self.dispatch(CommandCodeEnum::Hash, &[], &mut [], &params)?;

        let bytes = self.cmd_ctx.response_params();
        let digest = Tpm2bBuffer::deserialize(bytes).ok_or_else(malformed)?;
        let offset = digest.payload_size();
        let validation = if offset < bytes.len() {
            Some(TpmtTicket::deserialize(&bytes[offset..]).ok_or_else(malformed)?)
        } else {
            None
        };

        Ok(HashReply { digest, validation })
    }

    /// `TPM2_HashSequenceStart`. Returns the sequence handle.
    pub fn hash_sequence_start(
        &mut self,
        auth: &[u8],
        hash_alg: AlgIdEnum,
    ) -> Result<ReservedHandle, TpmCommandError> {
        let auth = Tpm2bBuffer::new(auth).map_err(|e| {
            TpmCommandError::InvalidInputParameter(TpmProtoError::HashSequenceStartAuth(e))
        })?;

        let mut params = Vec::new();
        params.extend(auth.serialize());
        params.extend_from_slice(AlgId::from(hash_alg).as_bytes());

        self.dispatch(CommandCodeEnum::HashSequenceStart, &[], &mut [], &params)?;

        Ok(self.cmd_ctx.ret_handle)
    }

    /// `TPM2_SequenceUpdate` with one chunk.
    pub fn sequence_update(
        &mut self,
        session: &mut AuthSession,
        sequence_handle: ReservedHandle,
        data: &[u8],
    ) -> Result<(), TpmCommandError> {
        let data = Tpm2bBuffer::new(data).map_err(|e| {
            TpmCommandError::InvalidInputParameter(TpmProtoError::SequenceUpdateData(e))
        })?;

        self.dispatch(
            CommandCodeEnum::SequenceUpdate,
            &[sequence_handle],
            &mut [session],
            &data.serialize(),
        )
    }

    /// `TPM2_SequenceComplete` with the final chunk, under the null
    /// hierarchy. The sequence object is flushed by the module on success.
    pub fn sequence_complete(
        &mut self,
        session: &mut AuthSession,
        sequence_handle: ReservedHandle,
        data: &[u8],
    ) -> Result<SequenceCompleteReply, TpmCommandError> {
        let data = Tpm2bBuffer::new(data).map_err(|e| {
            TpmCommandError::InvalidInputParameter(TpmProtoError::SequenceCompleteData(e))
        })?;

        let mut params = Vec::new();
        params.extend(data.serialize());
        params.extend_from_slice(TPM20_RH_NULL.as_bytes());

        self.dispatch(
            CommandCodeEnum::SequenceComplete,
            &[sequence_handle],
            &mut [session],
            &params,
        )?;

        let bytes = self.cmd_ctx.response_params();
        let digest = Tpm2bBuffer::deserialize(bytes).ok_or_else(malformed)?;
        let offset = digest.payload_size();
        let validation = if offset < bytes.len() {
            Some(TpmtTicket::deserialize(&bytes[offset..]).ok_or_else(malformed)?)
        } else {
            None
        };

        Ok(SequenceCompleteReply { digest, validation })
    }

    /// `TPM2_FlushContext`
    pub fn flush_context(
        &mut self,
        flush_handle: ReservedHandle,
    ) -> Result<(), TpmCommandError> {
        self.dispatch(CommandCodeEnum::FlushContext, &[flush_handle], &mut [], &[])
    }

    /// `TPM2_EvictControl`: persist (or evict) an object at
    /// `persistent_handle`.
    pub fn evict_control(
        &mut self,
        session: &mut AuthSession,
        auth: ReservedHandle,
        object_handle: ReservedHandle,
        persistent_handle: ReservedHandle,
    ) -> Result<(), TpmCommandError> {
        self.dispatch(
            CommandCodeEnum::EvictControl,
            &[auth, object_handle],
            &mut [session],
            persistent_handle.as_bytes(),
        )
    }
}

/// Template for an RSA-2048 storage root key: a restricted decryption key
/// with AES-128 CFB protection.
pub fn srk_pub_template() -> Result<TpmtPublic, TpmProtoError> {
    let object_attributes = TpmaObjectBits::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_no_da(true)
        .with_restricted(true)
        .with_decrypt(true);

    TpmtPublic::new(
        AlgIdEnum::RSA,
        AlgIdEnum::SHA256,
        object_attributes,
        &[],
        TpmuPublicParms::Rsa(TpmsRsaParams::new(
            TpmtSymDefObject::new(AlgIdEnum::AES, 128, AlgIdEnum::CFB),
            TpmtScheme::null(),
            2048,
        )),
        &[],
    )
}

/// Template for the HMAC identity key released through credential
/// activation: a keyed-hash signing key bound to the given policy.
pub fn id_key_pub_template(auth_policy: &[u8]) -> Result<TpmtPublic, TpmProtoError> {
    let object_attributes = TpmaObjectBits::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_user_with_auth(true)
        .with_no_da(true)
        .with_sign_encrypt(true);

    TpmtPublic::new(
        AlgIdEnum::KEYEDHASH,
        AlgIdEnum::SHA256,
        object_attributes,
        auth_policy,
        TpmuPublicParms::KeyedHash(TpmtScheme::new(AlgIdEnum::HMAC, AlgIdEnum::SHA256)),
        &[],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::*;
    use crate::tpm20proto::TPM20_PT_INPUT_BUFFER;
    use crate::tpm20proto::TPM20_RH_OWNER;

    fn capability_reply(capability: u32, entries: &[(u32, u32)]) -> Vec<u8> {
        let mut params = Vec::new();
        params.push(0x00); // moreData
        params.extend_from_slice(&capability.to_be_bytes());
        params.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        for (property, value) in entries {
            params.extend_from_slice(&property.to_be_bytes());
            params.extend_from_slice(&value.to_be_bytes());
        }
        ok_reply(None, &params, 0)
    }

    #[test]
    fn test_startup_command_bytes() {
        let mut transport = FakeTransport::new();
        transport.queue(ok_reply(None, &[], 0));
        let mut tss = Tss::new(transport);
        tss.startup(StartupType::Clear).unwrap();

        let request = &tss.transport.requests[0];
        let mut expected = Vec::new();
        expected.extend_from_slice(&0x8001u16.to_be_bytes());
        expected.extend_from_slice(&12u32.to_be_bytes());
        expected.extend_from_slice(&0x0000_0144u32.to_be_bytes());
        expected.extend_from_slice(&0x0000u16.to_be_bytes());
        assert_eq!(request, &expected);
    }

    #[test]
    fn test_get_tpm_property() {
        let mut transport = FakeTransport::new();
        transport.queue(capability_reply(
            TPM20_CAP_TPM_PROPERTIES,
            &[(TPM20_PT_INPUT_BUFFER, 1024)],
        ));
        let mut tss = Tss::new(transport);

        let value = tss.get_tpm_property(TPM20_PT_INPUT_BUFFER).unwrap();
        assert_eq!(value, 1024);
    }

    #[test]
    fn test_get_tpm_property_shape_faults() {
        // Echoed property id differs from the requested one.
        let mut transport = FakeTransport::new();
        transport.queue(capability_reply(
            TPM20_CAP_TPM_PROPERTIES,
            &[(TPM20_PT_INPUT_BUFFER + 1, 1024)],
        ));
        let mut tss = Tss::new(transport);
        let err = tss.get_tpm_property(TPM20_PT_INPUT_BUFFER).unwrap_err();
        assert!(matches!(err, TpmCommandError::BadCapabilityProperty { .. }));

        // More than one property returned.
        let mut transport = FakeTransport::new();
        transport.queue(capability_reply(
            TPM20_CAP_TPM_PROPERTIES,
            &[(TPM20_PT_INPUT_BUFFER, 1024), (TPM20_PT_INPUT_BUFFER, 1024)],
        ));
        let mut tss = Tss::new(transport);
        let err = tss.get_tpm_property(TPM20_PT_INPUT_BUFFER).unwrap_err();
        assert!(matches!(err, TpmCommandError::BadCapabilityProperty { .. }));

        // Wrong capability id echoed.
        let mut transport = FakeTransport::new();
        transport.queue(capability_reply(0x5, &[(TPM20_PT_INPUT_BUFFER, 1024)]));
        let mut tss = Tss::new(transport);
        let err = tss.get_tpm_property(TPM20_PT_INPUT_BUFFER).unwrap_err();
        assert!(matches!(err, TpmCommandError::BadCapabilityProperty { .. }));
    }

    #[test]
    fn test_start_auth_session() {
        let mut transport = FakeTransport::new();
        let nonce_tpm = Tpm2bBuffer::new(&[0x42; 32]).unwrap();
        transport.queue(ok_reply(Some(0x0300_0000), &nonce_tpm.serialize(), 0));
        let mut tss = Tss::new(transport);

        let session = tss
            .start_auth_session(
                SessionType::Policy,
                AlgIdEnum::SHA256,
                SessionAttributes::new().with_continue_session(true),
            )
            .unwrap();

        assert_eq!(session.handle().0.get(), 0x0300_0000);
        assert_eq!(session.sess_in.nonce.size.get(), 32);
        assert_eq!(session.sess_out.nonce.contents(), &[0x42; 32]);

        // nonceCaller is the first command parameter: 2 handles precede it.
        let request = &tss.transport.requests[0];
        assert_eq!(&request[10..14], &0x4000_0007u32.to_be_bytes());
        assert_eq!(&request[14..18], &0x4000_0007u32.to_be_bytes());
        assert_eq!(&request[18..20], &32u16.to_be_bytes());
    }

    #[test]
    fn test_start_auth_session_nonce_matches_digest_size() {
        // The caller nonce length follows the session hash algorithm.
        for (auth_hash, digest_size) in [(AlgIdEnum::SHA, 20usize), (AlgIdEnum::SHA384, 48)] {
            let mut transport = FakeTransport::new();
            let nonce_tpm = Tpm2bBuffer::new(&vec![0x42; digest_size]).unwrap();
            transport.queue(ok_reply(Some(0x0300_0001), &nonce_tpm.serialize(), 0));
            let mut tss = Tss::new(transport);

            let session = tss
                .start_auth_session(
                    SessionType::Hmac,
                    auth_hash,
                    SessionAttributes::new().with_continue_session(true),
                )
                .unwrap();

            assert_eq!(session.sess_in.nonce.size.get() as usize, digest_size);
            assert_eq!(session.sess_out.nonce.contents(), &vec![0x42; digest_size]);

            let request = &tss.transport.requests[0];
            assert_eq!(
                &request[18..20],
                &(digest_size as u16).to_be_bytes(),
                "nonceCaller length for {auth_hash:?}"
            );
        }
    }

    #[test]
    fn test_start_auth_session_rejects_unsupported_hash() {
        let mut tss = Tss::new(FakeTransport::new());
        let err = tss
            .start_auth_session(
                SessionType::Hmac,
                AlgIdEnum::RSA,
                SessionAttributes::new(),
            )
            .unwrap_err();
        assert!(matches!(err, TpmCommandError::InvalidInputParameter(_)));
        assert!(tss.transport.requests.is_empty());
    }

    #[test]
    fn test_create_primary_reply_parsing() {
        let out_public = Tpm2bPublic::new(srk_pub_template().unwrap());
        let ticket = TpmtTicket {
            tag: crate::tpm20proto::SessionTagEnum::Creation.into(),
            hierarchy: TPM20_RH_NULL,
            digest: Tpm2bBuffer::new(&[0xcd; 4]).unwrap(),
        };

        let mut params = Vec::new();
        params.extend(out_public.serialize());
        params.extend(Tpm2bBuffer::new(&[0x01, 0x02]).unwrap().serialize()); // creationData
        params.extend(Tpm2bBuffer::new(&[0xab; 32]).unwrap().serialize()); // creationHash
        params.extend(ticket.serialize());

        let mut transport = FakeTransport::new();
        transport.queue(ok_reply(Some(0x8000_0002), &params, 1));
        let mut tss = Tss::new(transport);

        let mut session = AuthSession::password(&[]).unwrap();
        let reply = tss
            .create_primary(&mut session, TPM20_RH_OWNER, &out_public)
            .unwrap();

        assert_eq!(reply.object_handle.0.get(), 0x8000_0002);
        let parsed = reply.out_public.unwrap();
        assert_eq!(parsed.size.get(), out_public.size.get());
        assert_eq!(parsed.serialize(), out_public.serialize());
        assert_eq!(reply.creation_hash.contents(), &[0xab; 32]);
        assert_eq!(reply.creation_ticket.digest.contents(), &[0xcd; 4]);
    }

    #[test]
    fn test_sign_parses_hmac_signature() {
        let mut params = Vec::new();
        params.extend_from_slice(&0x0005u16.to_be_bytes()); // TPM_ALG_HMAC
        params.extend_from_slice(&0x000bu16.to_be_bytes()); // TPM_ALG_SHA256
        params.extend_from_slice(&[0x5a; 32]);

        let mut transport = FakeTransport::new();
        transport.queue(ok_reply(None, &params, 1));
        let mut tss = Tss::new(transport);

        let mut session = AuthSession::password(&[]).unwrap();
        let digest = Tpm2bBuffer::new(&[0x11; 32]).unwrap();
        let signature = tss.sign(&mut session, TPM20_RH_OWNER, &digest).unwrap();

        match signature {
            TpmtSignature::Hmac { digest, .. } => {
                assert_eq!(digest.contents(), &[0x5a; 32]);
            }
            other => panic!("unexpected signature {other:?}"),
        }
    }

    #[test]
    fn test_read_public_sends_no_sessions() {
        let mut params = Vec::new();
        params.extend(Tpm2bPublic::new(srk_pub_template().unwrap()).serialize());
        params.extend(Tpm2bBuffer::new(&[0x01; 34]).unwrap().serialize()); // name
        params.extend(Tpm2bBuffer::new(&[0x02; 34]).unwrap().serialize()); // qualifiedName

        let mut transport = FakeTransport::new();
        transport.queue(ok_reply(None, &params, 0));
        let mut tss = Tss::new(transport);

        let reply = tss.read_public(TPM20_RH_OWNER).unwrap();
        assert!(reply.out_public.is_some());
        assert_eq!(reply.name.contents(), &[0x01; 34]);
        assert_eq!(reply.qualified_name.contents(), &[0x02; 34]);

        // No-session command: TPM_ST_NO_SESSIONS tag, no auth area.
        let request = &tss.transport.requests[0];
        assert_eq!(&request[0..2], &0x8001u16.to_be_bytes());
        assert_eq!(request.len(), 14);
    }

    #[test]
    fn test_hmac_rejects_oversized_buffer() {
        let mut tss = Tss::new(FakeTransport::new());
        let mut session = AuthSession::password(&[]).unwrap();
        let data = vec![0u8; crate::tpm20proto::MAX_DIGEST_BUFFER_SIZE + 1];
        let err = tss.hmac(&mut session, TPM20_RH_OWNER, &data).unwrap_err();
        assert!(matches!(err, TpmCommandError::InvalidInputParameter(_)));
        assert!(tss.transport.requests.is_empty());
    }

    #[test]
    fn test_evict_control_marshal_order() {
        let mut transport = FakeTransport::new();
        transport.queue(ok_reply(None, &[], 1));
        let mut tss = Tss::new(transport);

        let mut session = AuthSession::password(&[]).unwrap();
        let object = ReservedHandle(0x8000_0002u32.into());
        let persistent = crate::tpm20proto::TPM20_ID_KEY_HANDLE;
        tss.evict_control(&mut session, TPM20_RH_OWNER, object, persistent)
            .unwrap();

        let request = &tss.transport.requests[0];
        // handles: auth then object
        assert_eq!(&request[10..14], &0x4000_0001u32.to_be_bytes());
        assert_eq!(&request[14..18], &0x8000_0002u32.to_be_bytes());
        // persistentHandle is the sole parameter, after the auth area
        let tail = &request[request.len() - 4..];
        assert_eq!(tail, &0x8100_0100u32.to_be_bytes());
    }
}
