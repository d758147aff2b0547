// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command assembly, response parsing, and the dispatcher that ties them to
//! a transport.
//!
//! Every command goes through the same cycle: marshal parameters, assemble
//! the command buffer, submit it, validate the response envelope, and leave
//! the cursor positioned at the response parameter area for the caller to
//! unmarshal typed results.

use crate::session::AuthSession;
use crate::tpm20proto::canonical_response_code;
use crate::tpm20proto::packed_nums::*;
use crate::tpm20proto::protocol::StartupType;
use crate::tpm20proto::CommandCode;
use crate::tpm20proto::CommandCodeEnum;
use crate::tpm20proto::ReservedHandle;
use crate::tpm20proto::ResponseCode;
use crate::tpm20proto::ResponseValidationError;
use crate::tpm20proto::SessionTag;
use crate::tpm20proto::SessionTagEnum;
use crate::tpm20proto::TpmProtoError;
use crate::tpm20proto::TPM20_CC_MAX;
use crate::tpm20proto::TPM20_CC_MIN;
use crate::tpm20proto::TPM20_RH_UNASSIGNED;
use std::io;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Fixed size of the command, response and parameter scratch buffers.
pub const MAX_COMMAND_BUFFER: usize = 4096;

/// Tag (2) + size (4) + command/response code (4).
pub const STD_HEADER_SIZE: usize = 10;

/// The channel a command buffer travels over: TBS, a simulator socket, a
/// kernel device, or a scripted fake in tests.
pub trait TpmTransport {
    /// Submit one complete command buffer and write the module's complete
    /// response into `response`, returning the number of bytes received.
    fn submit(&mut self, request: &[u8], response: &mut [u8]) -> io::Result<usize>;

    /// Whether the endpoint is a simulator that needs `TPM2_Startup` after
    /// connecting.
    fn is_simulator(&self) -> bool {
        false
    }
}

#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("command code {0:#010x} is outside the supported command window")]
    CommandCodeOutOfRange(u32),
    #[error("command buffer capacity {capacity} is below the header size {minimum}")]
    BufferBelowHeaderSize { capacity: usize, minimum: usize },
    #[error("assembled command needs {required} bytes but the buffer holds {capacity}")]
    CommandTooLarge { required: usize, capacity: usize },
}

#[derive(Debug, Error)]
pub enum TpmCommandError {
    #[error("failed to submit the command to the TPM device")]
    TpmExecuteCommand(#[source] io::Error),
    #[error("invalid input parameter for the TPM command")]
    InvalidInputParameter(#[source] TpmProtoError),
    #[error("failed to assemble the TPM command buffer")]
    CommandBuildFailed(#[source] CommandBuildError),
    #[error("invalid response from the TPM command")]
    InvalidResponse(#[source] ResponseValidationError),
    #[error("TPM command failed, canonical response code {response_code:#010x}")]
    TpmCommandFailed { response_code: u32 },
    #[error("failed to generate the session nonce")]
    NonceGeneration(#[source] getrandom::Error),
    #[error("capability {capability:#x} response does not match requested property {property:#x}")]
    BadCapabilityProperty { capability: u32, property: u32 },
    #[error("output buffer too small - required {required} bytes, capacity {capacity}")]
    OutputBufferTooSmall { required: usize, capacity: usize },
}

/// Assemble a complete command buffer into `cmd_buffer`.
///
/// The size field in the header and the authorization-area size are written
/// as placeholders and back-patched once the serialized lengths are known.
/// Returns the total number of bytes written, which always equals the
/// back-patched `commandSize`.
pub fn build_command(
    command_code: CommandCode,
    handles: &[ReservedHandle],
    sessions: &[&AuthSession],
    params: &[u8],
    cmd_buffer: &mut [u8],
) -> Result<usize, CommandBuildError> {
    let code = command_code.0.get();
    if !(TPM20_CC_MIN..=TPM20_CC_MAX).contains(&code) {
        return Err(CommandBuildError::CommandCodeOutOfRange(code));
    }
    if cmd_buffer.len() < STD_HEADER_SIZE {
        return Err(CommandBuildError::BufferBelowHeaderSize {
            capacity: cmd_buffer.len(),
            minimum: STD_HEADER_SIZE,
        });
    }

    let tag: SessionTag = if sessions.is_empty() {
        SessionTagEnum::NoSessions
    } else {
        SessionTagEnum::Sessions
    }
    .into();

    let auth_records: Vec<Vec<u8>> = sessions
        .iter()
        .map(|session| session.serialize_auth_command())
        .collect();

    let mut required = STD_HEADER_SIZE
        + handles.len() * size_of::<ReservedHandle>()
        + params.len();
    if !sessions.is_empty() {
        required += size_of::<u32_be>();
        required += auth_records.iter().map(|r| r.len()).sum::<usize>();
    }
    if required > cmd_buffer.len() {
        return Err(CommandBuildError::CommandTooLarge {
            required,
            capacity: cmd_buffer.len(),
        });
    }

    let mut cursor = 0;

    cmd_buffer[cursor..cursor + 2].copy_from_slice(tag.as_bytes());
    cursor += 2;

    // commandSize placeholder
    let size_slot = cursor;
    cmd_buffer[cursor..cursor + 4].copy_from_slice(&0u32.to_be_bytes());
    cursor += 4;

    cmd_buffer[cursor..cursor + 4].copy_from_slice(command_code.as_bytes());
    cursor += 4;

    for handle in handles {
        cmd_buffer[cursor..cursor + 4].copy_from_slice(handle.as_bytes());
        cursor += 4;
    }

    if !sessions.is_empty() {
        // authorizationSize placeholder
        let auth_size_slot = cursor;
        cmd_buffer[cursor..cursor + 4].copy_from_slice(&0u32.to_be_bytes());
        cursor += 4;

        let auth_start = cursor;
        for record in &auth_records {
            cmd_buffer[cursor..cursor + record.len()].copy_from_slice(record);
            cursor += record.len();
        }
        let auth_size = (cursor - auth_start) as u32;
        cmd_buffer[auth_size_slot..auth_size_slot + 4].copy_from_slice(&auth_size.to_be_bytes());
    }

    cmd_buffer[cursor..cursor + params.len()].copy_from_slice(params);
    cursor += params.len();

    cmd_buffer[size_slot..size_slot + 4].copy_from_slice(&(cursor as u32).to_be_bytes());

    Ok(cursor)
}

/// Per-command scratch state. Reset at the start of every dispatch; the
/// response cursor and returned handle stay valid until the next command.
pub struct CmdContext {
    pub(crate) param_buffer: [u8; MAX_COMMAND_BUFFER],
    pub(crate) param_size: usize,
    pub(crate) cmd_buffer: [u8; MAX_COMMAND_BUFFER],
    pub(crate) cmd_size: usize,
    pub(crate) resp_buffer: [u8; MAX_COMMAND_BUFFER],
    pub(crate) resp_size: usize,
    pub(crate) resp_tag: SessionTagEnum,
    pub(crate) resp_cursor: usize,
    pub(crate) resp_param_size: usize,
    pub(crate) ret_handle: ReservedHandle,
}

impl CmdContext {
    pub(crate) fn new() -> Self {
        Self {
            param_buffer: [0; MAX_COMMAND_BUFFER],
            param_size: 0,
            cmd_buffer: [0; MAX_COMMAND_BUFFER],
            cmd_size: 0,
            resp_buffer: [0; MAX_COMMAND_BUFFER],
            resp_size: 0,
            resp_tag: SessionTagEnum::NoSessions,
            resp_cursor: 0,
            resp_param_size: 0,
            ret_handle: TPM20_RH_UNASSIGNED,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.param_size = 0;
        self.cmd_size = 0;
        self.resp_size = 0;
        self.resp_tag = SessionTagEnum::NoSessions;
        self.resp_cursor = 0;
        self.resp_param_size = 0;
        self.ret_handle = TPM20_RH_UNASSIGNED;
    }

    /// Validate the response envelope and position the cursor at the
    /// response parameter area. Returns the raw response code.
    ///
    /// The returned handle and `parameterSize` fields only exist on success
    /// responses; an error response is just the 10-byte header.
    pub(crate) fn parse_response(
        &mut self,
        command_code: CommandCodeEnum,
    ) -> Result<u32, ResponseValidationError> {
        if self.resp_size < STD_HEADER_SIZE {
            return Err(ResponseValidationError::ResponseSizeTooSmall);
        }
        let bytes = &self.resp_buffer[..self.resp_size];

        let tag: u16 = u16_be::read_from_bytes(&bytes[0..2])
            .map_err(|_| ResponseValidationError::ResponseSizeTooSmall)?
            .into();
        let size: u32 = u32_be::read_from_bytes(&bytes[2..6])
            .map_err(|_| ResponseValidationError::ResponseSizeTooSmall)?
            .into();
        let raw_code: u32 = u32_be::read_from_bytes(&bytes[6..10])
            .map_err(|_| ResponseValidationError::ResponseSizeTooSmall)?
            .into();

        let resp_tag = match SessionTagEnum::from_u16(tag) {
            Some(t @ SessionTagEnum::NoSessions) | Some(t @ SessionTagEnum::Sessions) => t,
            _ => {
                return Err(ResponseValidationError::HeaderSessionTagInvalid {
                    response_session_tag: tag,
                })
            }
        };

        if size as usize != self.resp_size {
            return Err(ResponseValidationError::HeaderResponseSizeMismatch {
                size,
                actual: self.resp_size,
            });
        }

        self.resp_tag = resp_tag;
        self.resp_cursor = STD_HEADER_SIZE;

        if raw_code == ResponseCode::Success as u32 {
            if command_code.returns_handle() {
                let end = self.resp_cursor + size_of::<u32_be>();
                if bytes.len() < end {
                    return Err(ResponseValidationError::ResponseParametersMalformed);
                }
                let handle: u32 = u32_be::read_from_bytes(&bytes[self.resp_cursor..end])
                    .map_err(|_| ResponseValidationError::ResponseParametersMalformed)?
                    .into();
                if handle == 0 || handle == TPM20_RH_UNASSIGNED.0.get() {
                    return Err(ResponseValidationError::ReturnedHandleUnassigned { handle });
                }
                self.ret_handle = ReservedHandle(handle.into());
                self.resp_cursor = end;
            }

            if resp_tag == SessionTagEnum::Sessions {
                let end = self.resp_cursor + size_of::<u32_be>();
                if bytes.len() < end {
                    return Err(ResponseValidationError::ResponseParametersMalformed);
                }
                let param_size: u32 = u32_be::read_from_bytes(&bytes[self.resp_cursor..end])
                    .map_err(|_| ResponseValidationError::ResponseParametersMalformed)?
                    .into();
                self.resp_cursor = end;
                if self.resp_cursor + param_size as usize > self.resp_size {
                    return Err(ResponseValidationError::ResponseParametersMalformed);
                }
                self.resp_param_size = param_size as usize;
            } else {
                self.resp_param_size = self.resp_size - self.resp_cursor;
            }
        }

        Ok(raw_code)
    }

    /// The response parameter area of the last parsed response.
    pub fn response_params(&self) -> &[u8] {
        &self.resp_buffer[self.resp_cursor..self.resp_cursor + self.resp_param_size]
    }
}

/// Software TSS entry point: owns the transport, the command scratch
/// context, and the last raw response code.
pub struct Tss<T: TpmTransport> {
    pub(crate) transport: T,
    pub(crate) cmd_ctx: CmdContext,
    last_raw_response: u32,
}

impl<T: TpmTransport> Tss<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            cmd_ctx: CmdContext::new(),
            last_raw_response: ResponseCode::NotUsed as u32,
        }
    }

    /// Prepare the module for use. Simulators need an explicit
    /// `TPM2_Startup`; `TPM_RC_INITIALIZE` here means the simulator was
    /// already started and is not a failure.
    pub fn initialize(&mut self) -> Result<(), TpmCommandError> {
        if !self.transport.is_simulator() {
            return Ok(());
        }

        match self.startup(StartupType::Clear) {
            Ok(()) => Ok(()),
            Err(TpmCommandError::TpmCommandFailed { response_code })
                if response_code == ResponseCode::Initialize as u32 =>
            {
                tracing::trace!("tpm simulator already initialized");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// The unmodified response code of the most recent exchange, before
    /// canonicalization.
    pub fn last_raw_response(&self) -> u32 {
        self.last_raw_response
    }

    /// The handle assigned by the module in the most recent response, if
    /// the command produces one.
    pub fn returned_handle(&self) -> ReservedHandle {
        self.cmd_ctx.ret_handle
    }

    /// Run one full command cycle: assemble, submit, validate, normalize,
    /// and rotate session nonces.
    pub(crate) fn dispatch(
        &mut self,
        command_code: CommandCodeEnum,
        handles: &[ReservedHandle],
        sessions: &mut [&mut AuthSession],
        params: &[u8],
    ) -> Result<(), TpmCommandError> {
        self.cmd_ctx.reset();
        self.last_raw_response = ResponseCode::NotUsed as u32;

        if params.len() > MAX_COMMAND_BUFFER {
            return Err(TpmCommandError::CommandBuildFailed(
                CommandBuildError::CommandTooLarge {
                    required: params.len(),
                    capacity: MAX_COMMAND_BUFFER,
                },
            ));
        }
        self.cmd_ctx.param_buffer[..params.len()].copy_from_slice(params);
        self.cmd_ctx.param_size = params.len();

        let session_refs: Vec<&AuthSession> = sessions.iter().map(|s| &**s).collect();
        let cmd_size = build_command(
            command_code.into(),
            handles,
            &session_refs,
            &self.cmd_ctx.param_buffer[..self.cmd_ctx.param_size],
            &mut self.cmd_ctx.cmd_buffer,
        )
        .map_err(TpmCommandError::CommandBuildFailed)?;
        self.cmd_ctx.cmd_size = cmd_size;

        let resp_size = self
            .transport
            .submit(
                &self.cmd_ctx.cmd_buffer[..cmd_size],
                &mut self.cmd_ctx.resp_buffer,
            )
            .map_err(TpmCommandError::TpmExecuteCommand)?;
        if resp_size > MAX_COMMAND_BUFFER {
            return Err(TpmCommandError::TpmExecuteCommand(io::Error::new(
                io::ErrorKind::InvalidData,
                "transport reported more bytes than the response buffer holds",
            )));
        }
        self.cmd_ctx.resp_size = resp_size;

        let raw_code = self
            .cmd_ctx
            .parse_response(command_code)
            .map_err(TpmCommandError::InvalidResponse)?;
        self.last_raw_response = raw_code;

        let response_code = canonical_response_code(raw_code);
        if response_code != ResponseCode::Success as u32 {
            tracing::warn!(
                command = ?command_code,
                response_code,
                raw_code,
                "tpm command failed"
            );
            return Err(TpmCommandError::TpmCommandFailed { response_code });
        }

        // A sessions-tagged response carries one TPMS_AUTH_RESPONSE per
        // command session after the parameter area; each rotates that
        // session's module nonce.
        if self.cmd_ctx.resp_tag == SessionTagEnum::Sessions {
            let mut offset = self.cmd_ctx.resp_cursor + self.cmd_ctx.resp_param_size;
            for session in sessions.iter_mut() {
                let consumed = session
                    .apply_auth_response(&self.cmd_ctx.resp_buffer[offset..self.cmd_ctx.resp_size])
                    .ok_or(TpmCommandError::InvalidResponse(
                        ResponseValidationError::ResponseParametersMalformed,
                    ))?;
                offset += consumed;
            }
        }

        Ok(())
    }
}
