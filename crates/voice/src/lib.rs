//! Realtime speech provider plumbing for the voice relay.
//!
//! The gateway owns the per-call state machine; this crate provides the
//! provider-facing pieces: ephemeral key minting, the upstream socket, the
//! client event builders and the server event parser.

pub mod error;
pub mod instructions;
pub mod realtime;

pub use {
    error::VoiceError,
    instructions::{INTRODUCTION_PROMPT, voice_instructions},
    realtime::{
        RealtimeConnector, RealtimeSocket, UpstreamEvent,
        events::{FunctionCall, ServerEvent},
        openai::{EphemeralKey, OpenAiRealtime},
    },
};
