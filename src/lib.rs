// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Software TSS codec for TPM 2.0: command buffer assembly, response
//! parsing, authorization sessions, and typed wrappers for the command
//! subset used in device identity provisioning and signing.
//!
//! The crate never talks to hardware itself; callers supply a
//! [`TpmTransport`] that carries assembled command buffers to a TBS, a
//! simulator socket, or a kernel device, and [`Tss`] drives the full
//! marshal/submit/validate cycle over it.

mod commands;
mod dispatch;
mod sequence;
mod session;
pub mod tpm20proto;

pub use commands::id_key_pub_template;
pub use commands::srk_pub_template;
pub use commands::CreatePrimaryReply;
pub use commands::CreateReply;
pub use commands::GetCapabilityReply;
pub use commands::HashReply;
pub use commands::LoadReply;
pub use commands::PolicySecretReply;
pub use commands::ReadPublicReply;
pub use commands::SequenceCompleteReply;
pub use dispatch::build_command;
pub use dispatch::CommandBuildError;
pub use dispatch::TpmCommandError;
pub use dispatch::TpmTransport;
pub use dispatch::Tss;
pub use dispatch::MAX_COMMAND_BUFFER;
pub use session::AuthSession;
pub use session::SessionIn;
pub use session::SessionOut;
