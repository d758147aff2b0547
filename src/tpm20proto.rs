// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM 2.0 protocol vocabulary: tags, command codes, algorithm ids, reserved
//! handles, response-code handling, and the wire structures exchanged with
//! the module.
//!
//! Only the subset of the protocol needed for device identity provisioning
//! and signing is defined here.

use self::packed_nums::*;
use bitfield_struct::bitfield;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[allow(non_camel_case_types)]
pub(crate) mod packed_nums {
    pub type u16_be = zerocopy::U16<zerocopy::BigEndian>;
    pub type u32_be = zerocopy::U32<zerocopy::BigEndian>;
}

#[derive(Debug, Error)]
pub enum InvalidInput {
    #[error("input data size too large for buffer - input size > upper bound: {0} > {1}")]
    BufferSizeTooLarge(usize, usize),
    #[error("input list length too long - input length > upper bound: {0} > {1}")]
    PcrSelectionsLengthTooLong(usize, usize),
}

#[derive(Debug, Error)]
pub enum TpmProtoError {
    #[error("input user_auth to TpmsSensitiveCreate is invalid")]
    TpmsSensitiveCreateUserAuth(#[source] InvalidInput),
    #[error("input data to TpmsSensitiveCreate is invalid")]
    TpmsSensitiveCreateData(#[source] InvalidInput),
    #[error("input auth_policy to TpmtPublic is invalid")]
    TpmtPublicAuthPolicy(#[source] InvalidInput),
    #[error("input unique to TpmtPublic is invalid")]
    TpmtPublicUnique(#[source] InvalidInput),
    #[error("creation PCR selection list is invalid")]
    CreationPcrSelection(#[source] InvalidInput),
    #[error("input auth to a password session is invalid")]
    PasswordSessionAuth(#[source] InvalidInput),
    #[error("input auth to HMAC_Start is invalid")]
    HmacStartAuth(#[source] InvalidInput),
    #[error("input auth to HashSequenceStart is invalid")]
    HashSequenceStartAuth(#[source] InvalidInput),
    #[error("input data to HMAC is invalid")]
    HmacData(#[source] InvalidInput),
    #[error("input data to Hash is invalid")]
    HashData(#[source] InvalidInput),
    #[error("input data to SequenceUpdate is invalid")]
    SequenceUpdateData(#[source] InvalidInput),
    #[error("input data to SequenceComplete is invalid")]
    SequenceCompleteData(#[source] InvalidInput),
    #[error("hash algorithm {0:#06x} has no known digest size")]
    UnsupportedHashAlgorithm(u16),
}

#[derive(Debug, Error)]
pub enum ResponseValidationError {
    #[error("response buffer is smaller than the response header")]
    ResponseSizeTooSmall,
    #[error(
        "size {size} specified in the response header does not match the actual response length {actual}"
    )]
    HeaderResponseSizeMismatch { size: u32, actual: usize },
    #[error("session tag {response_session_tag:#06x} in the response header is not a valid tag")]
    HeaderSessionTagInvalid { response_session_tag: u16 },
    #[error("returned handle {handle:#010x} is missing or unassigned")]
    ReturnedHandleUnassigned { handle: u32 },
    #[error("response parameters are truncated or malformed")]
    ResponseParametersMalformed,
}

#[repr(transparent)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq)]
pub struct ReservedHandle(pub u32_be);

impl PartialEq<ReservedHandle> for u32 {
    fn eq(&self, other: &ReservedHandle) -> bool {
        other.0.get() == *self
    }
}

impl ReservedHandle {
    pub const fn new(kind: u8, offset: u32) -> ReservedHandle {
        ReservedHandle(new_u32_be((kind as u32) << 24 | offset))
    }
}

pub const TPM20_HT_PERMANENT: u8 = 0x40;
pub const TPM20_HT_PERSISTENT: u8 = 0x81;

pub const TPM20_RH_OWNER: ReservedHandle = ReservedHandle::new(TPM20_HT_PERMANENT, 0x01);
pub const TPM20_RH_NULL: ReservedHandle = ReservedHandle::new(TPM20_HT_PERMANENT, 0x07);
// Handles returned by the module are never this value; it doubles as the
// "nothing returned" marker in the command context.
pub const TPM20_RH_UNASSIGNED: ReservedHandle = ReservedHandle::new(TPM20_HT_PERMANENT, 0x08);
// `TPM_RS_PW` (not `TPM_RH_PW`)
// See Table 28, Section 7.4, "Trusted Platform Module Library Part 2: Structures", revision 1.38.
pub const TPM20_RS_PW: ReservedHandle = ReservedHandle::new(TPM20_HT_PERMANENT, 0x09);
pub const TPM20_RH_ENDORSEMENT: ReservedHandle = ReservedHandle::new(TPM20_HT_PERMANENT, 0x0b);
pub const TPM20_RH_PLATFORM: ReservedHandle = ReservedHandle::new(TPM20_HT_PERMANENT, 0x0c);

/// Well-known persistent handle for the endorsement key.
pub const TPM20_EK_HANDLE: ReservedHandle = ReservedHandle::new(TPM20_HT_PERSISTENT, 0x00010001);
/// Persistent handle under which the device identity key is kept.
pub const TPM20_ID_KEY_HANDLE: ReservedHandle = ReservedHandle::new(TPM20_HT_PERSISTENT, 0x00000100);

// The suggested minimal size for the buffer in `TPM2B_MAX_BUFFER`.
// See Table 79, Section 10.4.8, "Trusted Platform Module Library Part 2: Structures", revision 1.38.
pub const MAX_DIGEST_BUFFER_SIZE: usize = 1024;

// `TPM_CAP_TPM_PROPERTIES`
pub const TPM20_CAP_TPM_PROPERTIES: u32 = 0x00000006;
// `TPM_PT_INPUT_BUFFER` - maximum size of a command parameter buffer.
pub const TPM20_PT_INPUT_BUFFER: u32 = 0x0000010d;

#[repr(transparent)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SessionTag(pub u16_be);

impl PartialEq<SessionTag> for u16 {
    fn eq(&self, other: &SessionTag) -> bool {
        other.0.get() == *self
    }
}

impl SessionTag {
    const fn new(val: u16) -> SessionTag {
        SessionTag(new_u16_be(val))
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
#[repr(u16)]
pub enum SessionTagEnum {
    /// No structure type specified.
    Null = 0x8000,
    /// Command/response without attached sessions.
    NoSessions = 0x8001,
    /// Command/response with one or more attached sessions; the
    /// authorization/parameter size fields are present.
    Sessions = 0x8002,
    /// Ticket tag for `TPMT_TK_CREATION`.
    Creation = 0x8021,
    /// Ticket tag for `TPMT_TK_AUTH` produced by PolicySecret.
    AuthSecret = 0x8023,
    /// Ticket tag for `TPMT_TK_HASHCHECK`.
    Hashcheck = 0x8024,
}

impl From<SessionTagEnum> for SessionTag {
    fn from(x: SessionTagEnum) -> Self {
        SessionTag::new(x as u16)
    }
}

impl SessionTagEnum {
    pub fn from_u16(val: u16) -> Option<SessionTagEnum> {
        let ret = match val {
            0x8000 => Self::Null,
            0x8001 => Self::NoSessions,
            0x8002 => Self::Sessions,
            0x8021 => Self::Creation,
            0x8023 => Self::AuthSecret,
            0x8024 => Self::Hashcheck,
            _ => return None,
        };
        Some(ret)
    }
}

#[repr(transparent)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq)]
pub struct CommandCode(pub u32_be);

impl PartialEq<CommandCode> for u32 {
    fn eq(&self, other: &CommandCode) -> bool {
        other.0.get() == *self
    }
}

impl CommandCode {
    const fn new(val: u32) -> CommandCode {
        CommandCode(new_u32_be(val))
    }
}

// Commands outside this window are rejected by the command builder.
pub const TPM20_CC_MIN: u32 = 0x0000011f;
pub const TPM20_CC_MAX: u32 = 0x00000193;

/// The command codes used by this codec. Not a complete list; see Part 2,
/// Section 6.5.2 for the full registry.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u32)]
pub enum CommandCodeEnum {
    EvictControl = 0x00000120,
    SequenceComplete = 0x0000013e,
    Startup = 0x00000144,
    ActivateCredential = 0x00000147,
    PolicySecret = 0x00000151,
    Create = 0x00000153,
    HMAC = 0x00000155,
    Import = 0x00000156,
    Load = 0x00000157,
    CreatePrimary = 0x00000131,
    HMAC_Start = 0x0000015b,
    SequenceUpdate = 0x0000015c,
    Sign = 0x0000015d,
    ContextLoad = 0x00000161,
    FlushContext = 0x00000165,
    LoadExternal = 0x00000167,
    ReadPublic = 0x00000173,
    StartAuthSession = 0x00000176,
    GetCapability = 0x0000017a,
    Hash = 0x0000017d,
    HashSequenceStart = 0x00000186,
    CreateLoaded = 0x00000191,
    // Defined but deliberately outside the supported command window.
    CertifyX509 = 0x00000197,
}

impl From<CommandCodeEnum> for CommandCode {
    fn from(x: CommandCodeEnum) -> Self {
        CommandCode::new(x as u32)
    }
}

impl CommandCodeEnum {
    /// Whether a successful response to this command carries a
    /// module-assigned handle before the parameter area.
    ///
    /// The response shape is a protocol contract; the dispatcher consults
    /// this table instead of each caller testing membership by hand.
    pub fn returns_handle(self) -> bool {
        matches!(
            self,
            Self::CreatePrimary
                | Self::Load
                | Self::HMAC_Start
                | Self::ContextLoad
                | Self::LoadExternal
                | Self::StartAuthSession
                | Self::HashSequenceStart
                | Self::CreateLoaded
        )
    }
}

const FLAG_FMT1: u32 = 0x0080;
const FLAG_VER1: u32 = 0x0100;
const FLAG_WARN: u32 = 0x0800 + FLAG_VER1;

// Mask retaining the format-1 marker plus the error number, dropping the
// parameter/handle/session location qualifiers.
const FMT1_ERROR_MASK: u32 = FLAG_FMT1 | 0x3f;
// Mask retaining the version/warning markers plus the error number
// (`TPM_RC_NOT_USED` in the reference implementation).
const FMT0_ERROR_MASK: u32 = FLAG_WARN | 0x7f;

/// Canonical response codes, directly comparable against the output of
/// [`canonical_response_code`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u32)]
pub enum ResponseCode {
    Success = 0x000,
    /// TPM not initialized by `TPM2_Startup` or already initialized.
    Initialize = FLAG_VER1,
    /// TPM is in failure mode.
    Failure = FLAG_VER1 + 0x001,
    /// Command `commandSize` value is inconsistent with contents.
    CommandSize = FLAG_VER1 + 0x042,
    /// Command code not supported.
    CommandCode = FLAG_VER1 + 0x043,
    /// The given value is out of range or is not correct for the context.
    Value = FLAG_FMT1 + 0x004,
    /// Hierarchy is not enabled or is not correct for the use.
    Hierarchy = FLAG_FMT1 + 0x005,
    /// The handle is not correct for the use.
    Handle = FLAG_FMT1 + 0x00b,
    /// The authorization HMAC check failed.
    AuthFail = FLAG_FMT1 + 0x00e,
    /// Structure is the wrong size.
    Size = FLAG_FMT1 + 0x015,
    /// The TPM was unable to unmarshal a value because there were not
    /// enough bytes in the input buffer.
    Insufficient = FLAG_FMT1 + 0x01a,
    /// Integrity check fail.
    Integrity = FLAG_FMT1 + 0x01f,
    /// Out of memory for object contexts.
    ObjectMemory = FLAG_WARN + 0x002,
    /// Out of memory for session contexts.
    SessionMemory = FLAG_WARN + 0x003,
    /// The TPM was not able to start the command; a retry might work.
    Retry = FLAG_WARN + 0x022,
    /// Reserved; shall not be returned by the TPM.
    NotUsed = FLAG_WARN + 0x07f,
}

/// Whether a raw response code denotes a communication-medium error (TBS or
/// simulator protocol fault) rather than a module-format code.
pub fn is_comm_medium_error(code: u32) -> bool {
    (code & 0xffff_0000) == 0x8028_0000
}

/// Strips location-qualifier bits from a raw module response code, yielding a
/// canonical code comparable by equality against [`ResponseCode`] constants.
///
/// Communication-medium errors are meaningful in their own code space and
/// pass through unchanged.
pub fn canonical_response_code(raw: u32) -> u32 {
    if is_comm_medium_error(raw) {
        return raw;
    }

    let mask = if raw & FLAG_FMT1 != 0 {
        FMT1_ERROR_MASK
    } else {
        FMT0_ERROR_MASK
    };
    raw & mask
}

#[repr(transparent)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq)]
pub struct AlgId(pub u16_be);

impl PartialEq<AlgId> for u16 {
    fn eq(&self, other: &AlgId) -> bool {
        other.0.get() == *self
    }
}

impl AlgId {
    const fn new(val: u16) -> AlgId {
        AlgId(new_u16_be(val))
    }
}

#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u16)]
pub enum AlgIdEnum {
    RSA = 0x0001,
    SHA = 0x0004,
    HMAC = 0x0005,
    AES = 0x0006,
    KEYEDHASH = 0x0008,
    SHA256 = 0x000b,
    SHA384 = 0x000c,
    SHA512 = 0x000d,
    NULL = 0x0010,
    RSASSA = 0x0014,
    SYMCIPHER = 0x0025,
    CFB = 0x0043,
}

impl From<AlgIdEnum> for AlgId {
    fn from(x: AlgIdEnum) -> Self {
        AlgId::new(x as u16)
    }
}

impl AlgIdEnum {
    pub fn from_u16(val: u16) -> Option<AlgIdEnum> {
        let ret = match val {
            0x0001 => Self::RSA,
            0x0004 => Self::SHA,
            0x0005 => Self::HMAC,
            0x0006 => Self::AES,
            0x0008 => Self::KEYEDHASH,
            0x000b => Self::SHA256,
            0x000c => Self::SHA384,
            0x000d => Self::SHA512,
            0x0010 => Self::NULL,
            0x0014 => Self::RSASSA,
            0x0025 => Self::SYMCIPHER,
            0x0043 => Self::CFB,
            _ => return None,
        };
        Some(ret)
    }

    /// Digest size in bytes for the hash algorithms this codec supports.
    pub fn digest_size(&self) -> Option<u16> {
        let size = match self {
            Self::SHA => 20,
            Self::SHA256 => 32,
            Self::SHA384 => 48,
            _ => return None,
        };
        Some(size)
    }
}

/// `TPMA_OBJECT`
#[repr(transparent)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq)]
pub struct TpmaObject(pub u32_be);

impl TpmaObject {
    const fn new(val: u32) -> Self {
        Self(new_u32_be(val))
    }
}

impl From<TpmaObjectBits> for TpmaObject {
    fn from(x: TpmaObjectBits) -> Self {
        let val: u32 = x.into();
        Self::new(val)
    }
}

#[bitfield(u32)]
pub struct TpmaObjectBits {
    _reserved0: bool,
    pub fixed_tpm: bool,
    pub st_clear: bool,
    _reserved1: bool,
    pub fixed_parent: bool,
    pub sensitive_data_origin: bool,
    pub user_with_auth: bool,
    pub admin_with_policy: bool,
    #[bits(2)]
    _reserved2: u8,
    pub no_da: bool,
    pub encrypted_duplication: bool,
    #[bits(4)]
    _reserved3: u8,
    pub restricted: bool,
    pub decrypt: bool,
    pub sign_encrypt: bool,
    #[bits(13)]
    _reserved4: u16,
}

/// `TPMA_SESSION`
#[bitfield(u8)]
pub struct SessionAttributes {
    pub continue_session: bool,
    pub audit_exclusive: bool,
    pub audit_reset: bool,
    #[bits(2)]
    _reserved: u8,
    pub decrypt: bool,
    pub encrypt: bool,
    pub audit: bool,
}

/// Workaround to allow constructing a zerocopy U32 in a const context.
pub(crate) const fn new_u32_be(val: u32) -> u32_be {
    u32_be::from_bytes(val.to_be_bytes())
}

/// Workaround to allow constructing a zerocopy U16 in a const context.
pub(crate) const fn new_u16_be(val: u16) -> u16_be {
    u16_be::from_bytes(val.to_be_bytes())
}

/// Wire structures carried in command parameter areas and response
/// parameter areas. Each knows how to serialize itself, deserialize from a
/// response cursor, and report its marshaled size.
pub mod protocol {
    use super::*;

    /// `TPM_SU` values for Startup/Shutdown.
    #[derive(Debug, Copy, Clone, PartialEq)]
    #[repr(u16)]
    pub enum StartupType {
        Clear = 0x0000,
        State = 0x0001,
    }

    /// `TPM_SE` session types for StartAuthSession.
    #[derive(Debug, Copy, Clone, PartialEq)]
    #[repr(u8)]
    pub enum SessionType {
        Hmac = 0x00,
        Policy = 0x01,
        Trial = 0x03,
    }

    /// General type for TPM 2.0 sized buffers (`TPM2B_*`).
    #[repr(C)]
    #[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
    pub struct Tpm2bBuffer {
        pub size: u16_be,
        // Large enough for every 2B variant this codec touches, so a single
        // struct covers nonces, digests, private blobs and data buffers.
        pub buffer: [u8; MAX_DIGEST_BUFFER_SIZE],
    }

    impl Tpm2bBuffer {
        /// Create a `Tpm2bBuffer` from a slice.
        pub fn new(data: &[u8]) -> Result<Self, InvalidInput> {
            let size = data.len();
            if size > MAX_DIGEST_BUFFER_SIZE {
                Err(InvalidInput::BufferSizeTooLarge(
                    size,
                    MAX_DIGEST_BUFFER_SIZE,
                ))?
            }

            let mut buffer = [0u8; MAX_DIGEST_BUFFER_SIZE];
            buffer[..size].copy_from_slice(data);

            Ok(Self {
                size: new_u16_be(size as u16),
                buffer,
            })
        }

        /// A zero-length buffer, marshaled as a bare `UINT16` of 0.
        pub fn empty() -> Self {
            Self {
                size: new_u16_be(0),
                buffer: [0u8; MAX_DIGEST_BUFFER_SIZE],
            }
        }

        pub fn contents(&self) -> &[u8] {
            &self.buffer[..self.size.get() as usize]
        }

        pub fn serialize(&self) -> Vec<u8> {
            let mut buffer = Vec::new();

            buffer.extend_from_slice(self.size.as_bytes());
            buffer.extend_from_slice(&self.buffer[..self.size.get() as usize]);

            buffer
        }

        pub fn deserialize(bytes: &[u8]) -> Option<Self> {
            let mut start = 0;
            let mut end = size_of::<u16_be>();
            if bytes.len() < end {
                return None;
            }

            let size: u16 = u16_be::read_from_bytes(&bytes[start..end]).ok()?.into();
            if size as usize > MAX_DIGEST_BUFFER_SIZE {
                return None;
            }

            start = end;
            end += size as usize;
            if bytes.len() < end {
                return None;
            }
            let mut buffer = [0u8; MAX_DIGEST_BUFFER_SIZE];
            buffer[..size as usize].copy_from_slice(&bytes[start..end]);

            Some(Self {
                size: size.into(),
                buffer,
            })
        }

        pub fn payload_size(&self) -> usize {
            let mut payload_size = 0;

            payload_size += size_of_val(&self.size);
            payload_size += self.size.get() as usize;

            payload_size
        }
    }

    /// Scheme selector plus optional hash, covering `TPMT_SIG_SCHEME`,
    /// `TPMT_RSA_SCHEME` and `TPMT_KEYEDHASH_SCHEME`, all of which marshal
    /// as the scheme id followed by the hash id unless the scheme is NULL.
    #[repr(C)]
    #[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
    pub struct TpmtScheme {
        pub scheme: AlgId,
        pub hash_alg: AlgId,
    }

    impl TpmtScheme {
        pub fn new(scheme: AlgIdEnum, hash_alg: AlgIdEnum) -> Self {
            Self {
                scheme: scheme.into(),
                hash_alg: hash_alg.into(),
            }
        }

        pub fn null() -> Self {
            Self {
                scheme: AlgIdEnum::NULL.into(),
                hash_alg: AlgIdEnum::NULL.into(),
            }
        }

        pub fn serialize(&self) -> Vec<u8> {
            let mut buffer = Vec::new();

            buffer.extend_from_slice(self.scheme.as_bytes());
            if self.scheme.0.get() != AlgIdEnum::NULL as u16 {
                buffer.extend_from_slice(self.hash_alg.as_bytes());
            }

            buffer
        }

        pub fn deserialize(bytes: &[u8]) -> Option<Self> {
            let mut end = size_of::<AlgId>();
            if bytes.len() < end {
                return None;
            }
            let scheme = AlgId::read_from_prefix(bytes).ok()?.0;

            let hash_alg = if scheme.0.get() != AlgIdEnum::NULL as u16 {
                let start = end;
                end += size_of::<AlgId>();
                if bytes.len() < end {
                    return None;
                }
                AlgId::read_from_prefix(&bytes[start..]).ok()?.0
            } else {
                AlgIdEnum::NULL.into()
            };

            Some(Self { scheme, hash_alg })
        }

        pub fn payload_size(&self) -> usize {
            if self.scheme.0.get() != AlgIdEnum::NULL as u16 {
                size_of::<AlgId>() * 2
            } else {
                size_of::<AlgId>()
            }
        }
    }

    /// `TPMT_SYM_DEF` / `TPMT_SYM_DEF_OBJECT`.
    #[repr(C)]
    #[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
    pub struct TpmtSymDefObject {
        pub algorithm: AlgId,
        pub key_bits: u16_be,
        pub mode: AlgId,
    }

    impl TpmtSymDefObject {
        pub fn new(algorithm: AlgIdEnum, key_bits: u16, mode: AlgIdEnum) -> Self {
            Self {
                algorithm: algorithm.into(),
                key_bits: key_bits.into(),
                mode: mode.into(),
            }
        }

        pub fn null() -> Self {
            Self {
                algorithm: AlgIdEnum::NULL.into(),
                key_bits: 0.into(),
                mode: AlgIdEnum::NULL.into(),
            }
        }

        pub fn serialize(&self) -> Vec<u8> {
            let mut buffer = Vec::new();

            buffer.extend_from_slice(self.algorithm.as_bytes());
            if self.algorithm.0.get() != AlgIdEnum::NULL as u16 {
                buffer.extend_from_slice(self.key_bits.as_bytes());
                buffer.extend_from_slice(self.mode.as_bytes());
            }

            buffer
        }

        pub fn deserialize(bytes: &[u8]) -> Option<Self> {
            let mut end = size_of::<AlgId>();
            if bytes.len() < end {
                return None;
            }
            let algorithm = AlgId::read_from_prefix(bytes).ok()?.0;

            if algorithm.0.get() == AlgIdEnum::NULL as u16 {
                return Some(Self::null());
            }

            let mut start = end;
            end += size_of::<u16_be>();
            if bytes.len() < end {
                return None;
            }
            let key_bits = u16_be::read_from_bytes(&bytes[start..end]).ok()?;

            start = end;
            end += size_of::<AlgId>();
            if bytes.len() < end {
                return None;
            }
            let mode = AlgId::read_from_prefix(&bytes[start..]).ok()?.0;

            Some(Self {
                algorithm,
                key_bits,
                mode,
            })
        }

        pub fn payload_size(&self) -> usize {
            if self.algorithm.0.get() != AlgIdEnum::NULL as u16 {
                size_of::<AlgId>() + size_of::<u16_be>() + size_of::<AlgId>()
            } else {
                size_of::<AlgId>()
            }
        }
    }

    /// Ticket structures (`TPMT_TK_CREATION`, `TPMT_TK_AUTH`,
    /// `TPMT_TK_HASHCHECK`) share one wire shape.
    #[repr(C)]
    #[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
    pub struct TpmtTicket {
        pub tag: SessionTag,
        pub hierarchy: ReservedHandle,
        pub digest: Tpm2bBuffer,
    }

    impl TpmtTicket {
        /// The null hashcheck ticket passed to Sign when the digest was not
        /// produced by the module.
        pub fn null_hashcheck() -> Self {
            Self {
                tag: SessionTagEnum::Hashcheck.into(),
                hierarchy: TPM20_RH_NULL,
                digest: Tpm2bBuffer::empty(),
            }
        }

        pub fn serialize(&self) -> Vec<u8> {
            let mut buffer = Vec::new();

            buffer.extend_from_slice(self.tag.as_bytes());
            buffer.extend_from_slice(self.hierarchy.as_bytes());
            buffer.extend_from_slice(&self.digest.serialize());

            buffer
        }

        pub fn deserialize(bytes: &[u8]) -> Option<Self> {
            let mut start = 0;
            let mut end = size_of::<SessionTag>();
            if bytes.len() < end {
                return None;
            }
            let tag = SessionTag::read_from_prefix(&bytes[start..]).ok()?.0;

            start = end;
            end += size_of::<ReservedHandle>();
            if bytes.len() < end {
                return None;
            }
            let hierarchy = ReservedHandle::read_from_prefix(&bytes[start..]).ok()?.0;

            start = end;
            let digest = Tpm2bBuffer::deserialize(&bytes[start..])?;

            Some(Self {
                tag,
                hierarchy,
                digest,
            })
        }

        pub fn payload_size(&self) -> usize {
            let mut payload_size = 0;

            payload_size += size_of_val(&self.tag);
            payload_size += size_of_val(&self.hierarchy);
            payload_size += self.digest.payload_size();

            payload_size
        }
    }

    /// `TPMS_SENSITIVE_CREATE`
    #[repr(C)]
    #[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
    pub struct TpmsSensitiveCreate {
        user_auth: Tpm2bBuffer,
        data: Tpm2bBuffer,
    }

    impl TpmsSensitiveCreate {
        pub fn new(user_auth: &[u8], data: &[u8]) -> Result<Self, TpmProtoError> {
            let user_auth =
                Tpm2bBuffer::new(user_auth).map_err(TpmProtoError::TpmsSensitiveCreateUserAuth)?;
            let data = Tpm2bBuffer::new(data).map_err(TpmProtoError::TpmsSensitiveCreateData)?;
            Ok(Self { user_auth, data })
        }

        pub fn serialize(&self) -> Vec<u8> {
            let mut buffer = Vec::new();

            buffer.extend_from_slice(&self.user_auth.serialize());
            buffer.extend_from_slice(&self.data.serialize());

            buffer
        }

        pub fn payload_size(&self) -> usize {
            let mut payload_size = 0;

            payload_size += self.user_auth.payload_size();
            payload_size += self.data.payload_size();

            payload_size
        }
    }

    /// `TPM2B_SENSITIVE_CREATE`
    #[repr(C)]
    #[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
    pub struct Tpm2bSensitiveCreate {
        pub size: u16_be,
        pub sensitive: TpmsSensitiveCreate,
    }

    impl Tpm2bSensitiveCreate {
        pub fn new(sensitive: TpmsSensitiveCreate) -> Self {
            Self {
                size: new_u16_be(sensitive.payload_size() as u16),
                sensitive,
            }
        }

        pub fn serialize(&self) -> Vec<u8> {
            let mut buffer = Vec::new();

            buffer.extend_from_slice(self.size.as_bytes());
            buffer.extend_from_slice(&self.sensitive.serialize());

            buffer
        }

        pub fn payload_size(&self) -> usize {
            let mut payload_size = 0;

            payload_size += size_of_val(&self.size);
            payload_size += self.sensitive.payload_size();

            payload_size
        }
    }

    /// `TPMS_PCR_SELECTION`
    #[repr(C)]
    #[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
    pub struct PcrSelection {
        pub hash: AlgId,
        pub size_of_select: u8,
        pub bitmap: [u8; 3],
    }

    impl PcrSelection {
        pub fn serialize(&self) -> Vec<u8> {
            let mut buffer = Vec::new();

            buffer.extend_from_slice(self.hash.as_bytes());
            buffer.push(self.size_of_select);
            buffer.extend_from_slice(&self.bitmap);

            buffer
        }

        pub fn deserialize(bytes: &[u8]) -> Option<Self> {
            if bytes.len() < size_of::<Self>() {
                return None;
            }
            Self::read_from_prefix(bytes).ok().map(|r| r.0)
        }

        pub fn payload_size(&self) -> usize {
            size_of::<Self>()
        }
    }

    /// `TPML_PCR_SELECTION`
    #[repr(C)]
    #[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
    pub struct TpmlPcrSelection {
        pub count: u32_be,
        pub pcr_selections: [PcrSelection; 5],
    }

    impl TpmlPcrSelection {
        pub fn new(pcr_selections: &[PcrSelection]) -> Result<Self, InvalidInput> {
            let count = pcr_selections.len();
            if count > 5 {
                Err(InvalidInput::PcrSelectionsLengthTooLong(count, 5))?
            }

            let mut base = [PcrSelection::new_zeroed(); 5];
            base[..count].copy_from_slice(pcr_selections);

            Ok(Self {
                count: new_u32_be(count as u32),
                pcr_selections: base,
            })
        }

        pub fn serialize(&self) -> Vec<u8> {
            let mut buffer = Vec::new();

            buffer.extend_from_slice(self.count.as_bytes());
            for i in 0..self.count.get() {
                buffer.extend_from_slice(&self.pcr_selections[i as usize].serialize());
            }

            buffer
        }

        pub fn deserialize(bytes: &[u8]) -> Option<Self> {
            let mut start = 0;
            let mut end = size_of::<u32_be>();

            if bytes.len() < end {
                return None;
            }

            let count: u32 = u32_be::read_from_bytes(&bytes[start..end]).ok()?.into();
            if count > 5 {
                return None;
            }

            let mut pcr_selections = [PcrSelection::new_zeroed(); 5];
            for i in 0..count {
                start = end;
                pcr_selections[i as usize] = PcrSelection::deserialize(&bytes[start..])?;
                end += pcr_selections[i as usize].payload_size();
            }

            Some(Self {
                count: count.into(),
                pcr_selections,
            })
        }

        pub fn payload_size(&self) -> usize {
            let mut payload_size = 0;

            payload_size += size_of_val(&self.count);
            for i in 0..self.count.get() {
                payload_size += self.pcr_selections[i as usize].payload_size();
            }

            payload_size
        }
    }

    /// `TPMS_RSA_PARMS`
    #[repr(C)]
    #[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
    pub struct TpmsRsaParams {
        pub symmetric: TpmtSymDefObject,
        pub scheme: TpmtScheme,
        pub key_bits: u16_be,
        pub exponent: u32_be,
    }

    impl TpmsRsaParams {
        pub fn new(symmetric: TpmtSymDefObject, scheme: TpmtScheme, key_bits: u16) -> Self {
            Self {
                symmetric,
                scheme,
                key_bits: key_bits.into(),
                // 0 selects the default exponent 2^16 + 1
                exponent: 0.into(),
            }
        }

        pub fn serialize(&self) -> Vec<u8> {
            let mut buffer = Vec::new();

            buffer.extend_from_slice(&self.symmetric.serialize());
            buffer.extend_from_slice(&self.scheme.serialize());
            buffer.extend_from_slice(self.key_bits.as_bytes());
            buffer.extend_from_slice(self.exponent.as_bytes());

            buffer
        }

        pub fn deserialize(bytes: &[u8]) -> Option<Self> {
            let symmetric = TpmtSymDefObject::deserialize(bytes)?;
            let mut start = symmetric.payload_size();

            let scheme = TpmtScheme::deserialize(&bytes[start..])?;
            start += scheme.payload_size();

            let mut end = start + size_of::<u16_be>();
            if bytes.len() < end {
                return None;
            }
            let key_bits = u16_be::read_from_bytes(&bytes[start..end]).ok()?;

            start = end;
            end += size_of::<u32_be>();
            if bytes.len() < end {
                return None;
            }
            let exponent = u32_be::read_from_bytes(&bytes[start..end]).ok()?;

            Some(Self {
                symmetric,
                scheme,
                key_bits,
                exponent,
            })
        }

        pub fn payload_size(&self) -> usize {
            let mut payload_size = 0;

            payload_size += self.symmetric.payload_size();
            payload_size += self.scheme.payload_size();
            payload_size += size_of_val(&self.key_bits);
            payload_size += size_of_val(&self.exponent);

            payload_size
        }
    }

    /// `TPMU_PUBLIC_PARMS` - selected by the object type in `TpmtPublic`.
    #[derive(Debug, Copy, Clone)]
    pub enum TpmuPublicParms {
        Rsa(TpmsRsaParams),
        /// `TPMS_KEYEDHASH_PARMS`
        KeyedHash(TpmtScheme),
        /// `TPMS_SYMCIPHER_PARMS`
        SymCipher(TpmtSymDefObject),
    }

    impl TpmuPublicParms {
        pub fn serialize(&self) -> Vec<u8> {
            match self {
                Self::Rsa(p) => p.serialize(),
                Self::KeyedHash(p) => p.serialize(),
                Self::SymCipher(p) => p.serialize(),
            }
        }

        pub fn deserialize(object_type: AlgId, bytes: &[u8]) -> Option<Self> {
            match AlgIdEnum::from_u16(object_type.0.get())? {
                AlgIdEnum::RSA => Some(Self::Rsa(TpmsRsaParams::deserialize(bytes)?)),
                AlgIdEnum::KEYEDHASH => Some(Self::KeyedHash(TpmtScheme::deserialize(bytes)?)),
                AlgIdEnum::SYMCIPHER => {
                    Some(Self::SymCipher(TpmtSymDefObject::deserialize(bytes)?))
                }
                _ => None,
            }
        }

        pub fn payload_size(&self) -> usize {
            match self {
                Self::Rsa(p) => p.payload_size(),
                Self::KeyedHash(p) => p.payload_size(),
                Self::SymCipher(p) => p.payload_size(),
            }
        }
    }

    /// `TPMT_PUBLIC`
    #[derive(Debug, Copy, Clone)]
    pub struct TpmtPublic {
        pub object_type: AlgId,
        pub name_alg: AlgId,
        pub object_attributes: TpmaObject,
        pub auth_policy: Tpm2bBuffer,
        pub parameters: TpmuPublicParms,
        pub unique: Tpm2bBuffer,
    }

    impl TpmtPublic {
        pub fn new(
            object_type: AlgIdEnum,
            name_alg: AlgIdEnum,
            object_attributes: TpmaObjectBits,
            auth_policy: &[u8],
            parameters: TpmuPublicParms,
            unique: &[u8],
        ) -> Result<Self, TpmProtoError> {
            let auth_policy =
                Tpm2bBuffer::new(auth_policy).map_err(TpmProtoError::TpmtPublicAuthPolicy)?;
            let unique = Tpm2bBuffer::new(unique).map_err(TpmProtoError::TpmtPublicUnique)?;
            Ok(Self {
                object_type: object_type.into(),
                name_alg: name_alg.into(),
                object_attributes: object_attributes.into(),
                auth_policy,
                parameters,
                unique,
            })
        }

        pub fn serialize(&self) -> Vec<u8> {
            let mut buffer = Vec::new();

            buffer.extend_from_slice(self.object_type.as_bytes());
            buffer.extend_from_slice(self.name_alg.as_bytes());
            buffer.extend_from_slice(self.object_attributes.as_bytes());
            buffer.extend_from_slice(&self.auth_policy.serialize());
            buffer.extend_from_slice(&self.parameters.serialize());
            buffer.extend_from_slice(&self.unique.serialize());

            buffer
        }

        pub fn deserialize(bytes: &[u8]) -> Option<Self> {
            let mut start = 0;
            let mut end = size_of::<AlgId>();
            if bytes.len() < end {
                return None;
            }
            let object_type = AlgId::read_from_prefix(&bytes[start..]).ok()?.0;

            start = end;
            end += size_of::<AlgId>();
            if bytes.len() < end {
                return None;
            }
            let name_alg = AlgId::read_from_prefix(&bytes[start..]).ok()?.0;

            start = end;
            end += size_of::<TpmaObject>();
            if bytes.len() < end {
                return None;
            }
            let object_attributes = TpmaObject::read_from_prefix(&bytes[start..]).ok()?.0;

            start = end;
            let auth_policy = Tpm2bBuffer::deserialize(&bytes[start..])?;
            start += auth_policy.payload_size();

            let parameters = TpmuPublicParms::deserialize(object_type, &bytes[start..])?;
            start += parameters.payload_size();

            let unique = Tpm2bBuffer::deserialize(&bytes[start..])?;

            Some(Self {
                object_type,
                name_alg,
                object_attributes,
                auth_policy,
                parameters,
                unique,
            })
        }

        pub fn payload_size(&self) -> usize {
            let mut payload_size = 0;

            payload_size += size_of_val(&self.object_type);
            payload_size += size_of_val(&self.name_alg);
            payload_size += size_of_val(&self.object_attributes);
            payload_size += self.auth_policy.payload_size();
            payload_size += self.parameters.payload_size();
            payload_size += self.unique.payload_size();

            payload_size
        }
    }

    /// `TPM2B_PUBLIC`
    #[derive(Debug, Copy, Clone)]
    pub struct Tpm2bPublic {
        pub size: u16_be,
        pub public_area: TpmtPublic,
    }

    impl Tpm2bPublic {
        pub fn new(public_area: TpmtPublic) -> Self {
            Self {
                size: new_u16_be(public_area.payload_size() as u16),
                public_area,
            }
        }

        pub fn serialize(&self) -> Vec<u8> {
            let mut buffer = Vec::new();

            buffer.extend_from_slice(self.size.as_bytes());
            buffer.extend_from_slice(&self.public_area.serialize());

            buffer
        }

        pub fn deserialize(bytes: &[u8]) -> Option<Self> {
            let end = size_of::<u16_be>();
            if bytes.len() < end {
                return None;
            }
            let size: u16 = u16_be::read_from_bytes(&bytes[..end]).ok()?.into();

            if bytes.len() < end + size as usize {
                return None;
            }
            let public_area = TpmtPublic::deserialize(&bytes[end..end + size as usize])?;

            Some(Self {
                size: size.into(),
                public_area,
            })
        }

        pub fn payload_size(&self) -> usize {
            size_of_val(&self.size) + self.size.get() as usize
        }
    }

    /// `TPMT_SIGNATURE` - only the signature schemes this codec can request.
    #[derive(Debug, Clone)]
    pub enum TpmtSignature {
        /// `TPMS_SIGNATURE_RSASSA`
        RsaSsa { hash_alg: AlgId, signature: Tpm2bBuffer },
        /// An HMAC "signature" is a bare `TPMT_HA` whose digest length is
        /// implied by the hash algorithm.
        Hmac { hash_alg: AlgId, digest: Tpm2bBuffer },
        Null,
    }

    impl TpmtSignature {
        pub fn deserialize(bytes: &[u8]) -> Option<Self> {
            let start = size_of::<AlgId>();
            if bytes.len() < start {
                return None;
            }
            let sig_alg = AlgId::read_from_prefix(bytes).ok()?.0;

            match AlgIdEnum::from_u16(sig_alg.0.get())? {
                AlgIdEnum::NULL => Some(Self::Null),
                AlgIdEnum::RSASSA => {
                    let end = start + size_of::<AlgId>();
                    if bytes.len() < end {
                        return None;
                    }
                    let hash_alg = AlgId::read_from_prefix(&bytes[start..]).ok()?.0;
                    let signature = Tpm2bBuffer::deserialize(&bytes[end..])?;
                    Some(Self::RsaSsa {
                        hash_alg,
                        signature,
                    })
                }
                AlgIdEnum::HMAC => {
                    let end = start + size_of::<AlgId>();
                    if bytes.len() < end {
                        return None;
                    }
                    let hash_alg = AlgId::read_from_prefix(&bytes[start..]).ok()?.0;
                    let size = AlgIdEnum::from_u16(hash_alg.0.get())?.digest_size()? as usize;
                    if bytes.len() < end + size {
                        return None;
                    }
                    let digest = Tpm2bBuffer::new(&bytes[end..end + size]).ok()?;
                    Some(Self::Hmac { hash_alg, digest })
                }
                _ => None,
            }
        }

        pub fn payload_size(&self) -> usize {
            match self {
                Self::Null => size_of::<AlgId>(),
                Self::RsaSsa { signature, .. } => {
                    size_of::<AlgId>() * 2 + signature.payload_size()
                }
                // Raw digest bytes, no length prefix.
                Self::Hmac { digest, .. } => {
                    size_of::<AlgId>() * 2 + digest.size.get() as usize
                }
            }
        }
    }

    /// `TPMS_TAGGED_PROPERTY`
    #[repr(C)]
    #[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
    pub struct TpmsTaggedProperty {
        pub property: u32_be,
        pub value: u32_be,
    }

    /// `TPMS_CAPABILITY_DATA` for `TPM_CAP_TPM_PROPERTIES`.
    ///
    /// The codec only ever asks for one property at a time, so a small fixed
    /// bound on the property list suffices.
    #[repr(C)]
    #[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
    pub struct TpmsCapabilityData {
        pub capability: u32_be,
        pub count: u32_be,
        pub tpm_properties: [TpmsTaggedProperty; 8],
    }

    impl TpmsCapabilityData {
        pub fn deserialize(bytes: &[u8]) -> Option<Self> {
            let mut start = 0;
            let mut end = size_of::<u32_be>();
            if bytes.len() < end {
                return None;
            }
            let capability = u32_be::read_from_bytes(&bytes[start..end]).ok()?;

            start = end;
            end += size_of::<u32_be>();
            if bytes.len() < end {
                return None;
            }
            let count: u32 = u32_be::read_from_bytes(&bytes[start..end]).ok()?.into();
            if count > 8 {
                return None;
            }

            let mut tpm_properties = [TpmsTaggedProperty::new_zeroed(); 8];
            for i in 0..count {
                start = end;
                end += size_of::<TpmsTaggedProperty>();
                if bytes.len() < end {
                    return None;
                }
                tpm_properties[i as usize] =
                    TpmsTaggedProperty::read_from_bytes(&bytes[start..end]).ok()?;
            }

            Some(Self {
                capability,
                count: count.into(),
                tpm_properties,
            })
        }

        pub fn payload_size(&self) -> usize {
            size_of::<u32_be>() * 2
                + self.count.get() as usize * size_of::<TpmsTaggedProperty>()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::protocol::*;
    use super::*;

    #[test]
    fn test_comm_medium_error_passthrough() {
        // TBS/simulator protocol faults keep their full code.
        let code = 0x8028_4002;
        assert!(is_comm_medium_error(code));
        assert_eq!(canonical_response_code(code), code);

        assert!(!is_comm_medium_error(0x0000_0101));
        assert!(!is_comm_medium_error(0x8029_0000));
    }

    #[test]
    fn test_fmt1_code_masking() {
        // TPM_RC_SIZE blamed on parameter 2: 0x2 << 8 | RC_P | RC_FMT1 | 0x15
        let raw = 0x0000_02d5;
        assert_eq!(canonical_response_code(raw), ResponseCode::Size as u32);

        // TPM_RC_AUTH_FAIL on session 1
        let raw = 0x0000_098e;
        assert_eq!(canonical_response_code(raw), ResponseCode::AuthFail as u32);
    }

    #[test]
    fn test_fmt0_code_masking() {
        // Warning and version markers survive, everything above bit 7 that
        // is not a marker is dropped.
        let raw = ResponseCode::Retry as u32;
        assert_eq!(canonical_response_code(raw), ResponseCode::Retry as u32);

        let raw = ResponseCode::Initialize as u32;
        assert_eq!(canonical_response_code(raw), ResponseCode::Initialize as u32);

        // A vendor bit outside the canonical mask is stripped.
        let raw = 0x0000_4101;
        assert_eq!(canonical_response_code(raw), ResponseCode::Failure as u32);
    }

    #[test]
    fn test_digest_sizes() {
        assert_eq!(AlgIdEnum::SHA.digest_size(), Some(20));
        assert_eq!(AlgIdEnum::SHA256.digest_size(), Some(32));
        assert_eq!(AlgIdEnum::SHA384.digest_size(), Some(48));
        assert_eq!(AlgIdEnum::NULL.digest_size(), None);
        assert_eq!(AlgIdEnum::RSA.digest_size(), None);
    }

    #[test]
    fn test_returns_handle_table() {
        assert!(CommandCodeEnum::CreatePrimary.returns_handle());
        assert!(CommandCodeEnum::Load.returns_handle());
        assert!(CommandCodeEnum::HMAC_Start.returns_handle());
        assert!(CommandCodeEnum::StartAuthSession.returns_handle());
        assert!(CommandCodeEnum::HashSequenceStart.returns_handle());
        assert!(!CommandCodeEnum::Sign.returns_handle());
        assert!(!CommandCodeEnum::GetCapability.returns_handle());
        assert!(!CommandCodeEnum::FlushContext.returns_handle());
    }

    #[test]
    fn test_tpm2b_buffer_wire_shape() {
        let buf = Tpm2bBuffer::new(&[0xaa, 0xbb, 0xcc]).unwrap();
        assert_eq!(buf.serialize(), vec![0x00, 0x03, 0xaa, 0xbb, 0xcc]);
        assert_eq!(buf.payload_size(), 5);

        let parsed = Tpm2bBuffer::deserialize(&[0x00, 0x02, 0x11, 0x22, 0x33]).unwrap();
        assert_eq!(parsed.contents(), &[0x11, 0x22]);

        // Declared size larger than the remaining bytes.
        assert!(Tpm2bBuffer::deserialize(&[0x00, 0x05, 0x11]).is_none());

        let too_big = vec![0u8; MAX_DIGEST_BUFFER_SIZE + 1];
        assert!(Tpm2bBuffer::new(&too_big).is_err());
    }

    #[test]
    fn test_null_scheme_marshals_bare_alg() {
        assert_eq!(TpmtScheme::null().serialize(), vec![0x00, 0x10]);
        assert_eq!(TpmtSymDefObject::null().serialize(), vec![0x00, 0x10]);

        let scheme = TpmtScheme::new(AlgIdEnum::HMAC, AlgIdEnum::SHA256);
        assert_eq!(scheme.serialize(), vec![0x00, 0x05, 0x00, 0x0b]);
        assert_eq!(scheme.payload_size(), 4);
    }

    #[test]
    fn test_capability_data_shape() {
        // capability + count + one property
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&TPM20_CAP_TPM_PROPERTIES.to_be_bytes());
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&TPM20_PT_INPUT_BUFFER.to_be_bytes());
        bytes.extend_from_slice(&1024u32.to_be_bytes());

        let cap = TpmsCapabilityData::deserialize(&bytes).unwrap();
        assert_eq!(cap.capability.get(), TPM20_CAP_TPM_PROPERTIES);
        assert_eq!(cap.count.get(), 1);
        assert_eq!(cap.tpm_properties[0].property.get(), TPM20_PT_INPUT_BUFFER);
        assert_eq!(cap.tpm_properties[0].value.get(), 1024);

        // Truncated property list
        assert!(TpmsCapabilityData::deserialize(&bytes[..bytes.len() - 1]).is_none());
    }
}
