//! Wire messages for the build-event RPC.
//!
//! These are hand-written `prost::Message` implementations rather than
//! generated from a `.proto` file -- there is no `tonic-build`/`protoc`
//! step in this workspace. `prost`'s derive macro works directly on plain
//! structs with `#[prost(..)]` field attributes, which is the same code a
//! generated module would contain; we drive the RPC with `tonic`'s generic
//! `Grpc<T>` client (the primitive generated client stubs are themselves
//! built on) instead of a generated service trait.
//!
//! The envelope's structural fields (stream identity, sequence number,
//! event time, the terminal marker) are real protobuf fields so framing
//! and ordering are genuinely carried over the wire; the build-event
//! payload itself is carried as a JSON string in `event_json`; decoding it
//! is the backend's concern, not this runner's.

/// One envelope in the ordered, acknowledged build-event stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PublishBuildToolEventStreamRequest {
    #[prost(string, tag = "1")]
    pub invocation_id: String,
    #[prost(string, tag = "2")]
    pub build_id: String,
    #[prost(int64, tag = "3")]
    pub sequence_number: i64,
    #[prost(int64, tag = "4")]
    pub event_time_millis: i64,
    #[prost(bool, tag = "5")]
    pub component_stream_finished: bool,
    /// JSON-encoded `runner_types::BuildEvent`. Empty when
    /// `component_stream_finished` is set.
    #[prost(string, tag = "6")]
    pub event_json: String,
}

/// Acknowledgement for one envelope. The core does not read any payload
/// from these beyond their arrival -- receiving the stream to completion
/// is the correctness criterion.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PublishBuildToolEventStreamResponse {
    #[prost(string, tag = "1")]
    pub invocation_id: String,
    #[prost(int64, tag = "2")]
    pub sequence_number: i64,
}

/// Fully-qualified gRPC method path for the bidirectional streaming RPC.
pub const PUBLISH_METHOD_PATH: &str =
    "/build_event_publisher.PublishBuildEvent/PublishBuildToolEventStream";
