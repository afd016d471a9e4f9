//! Hand-written protobuf types for delivery transcripts.
//!
//! Uses prost derive macros for encode/decode without prost-build.
//! Field numbers are part of the on-disk format; never renumber.

use prost::Message;

// ── Frame ──────────────────────────────────────────────────────

/// One transcript entry: a delivery and its position in the log.
#[derive(Clone, PartialEq, Message)]
pub struct ProtoDeliveryFrame {
    #[prost(uint64, tag = "1")]
    pub sequence: u64,
    #[prost(message, optional, tag = "2")]
    pub delivery: Option<ProtoDelivery>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoDelivery {
    #[prost(oneof = "DeliveryKind", tags = "1, 2")]
    pub kind: Option<DeliveryKind>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum DeliveryKind {
    #[prost(message, tag = "1")]
    Message(ProtoMessage),
    #[prost(message, tag = "2")]
    Notify(ProtoNotify),
}

// ── Payloads ───────────────────────────────────────────────────

#[derive(Clone, PartialEq, Message)]
pub struct ProtoCapData {
    #[prost(string, tag = "1")]
    pub body: String,
    /// Refs in compact string form (`o-3`, `p+5`, ...).
    #[prost(string, repeated, tag = "2")]
    pub slots: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoMessage {
    #[prost(string, tag = "1")]
    pub target: String,
    #[prost(string, tag = "2")]
    pub method: String,
    #[prost(message, optional, tag = "3")]
    pub args: Option<ProtoCapData>,
    #[prost(string, optional, tag = "4")]
    pub result: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoResolution {
    #[prost(string, tag = "1")]
    pub vpid: String,
    #[prost(bool, tag = "2")]
    pub rejected: bool,
    #[prost(message, optional, tag = "3")]
    pub data: Option<ProtoCapData>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoNotify {
    #[prost(message, repeated, tag = "1")]
    pub resolutions: Vec<ProtoResolution>,
}
