//! Build-event publisher for the CI action runner.
//!
//! Every action run owns one [`Publisher`]: it carries a [`StreamId`]
//! identity, streams every [`BuildEvent`] the action emits to the results
//! backend over a gRPC bidirectional RPC ([`client::dial`] /
//! [`client::open_stream`]), and surfaces exactly one terminal error (if
//! any) from [`Publisher::wait`].
//!
//! The wire format is hand-rolled `prost` messages (see [`proto`]) rather
//! than generated from a `.proto` file -- there is no `protoc`/`tonic-build`
//! step in this workspace.

mod client;
mod proto;
mod publisher;

pub use proto::{
    PublishBuildToolEventStreamRequest, PublishBuildToolEventStreamResponse, PUBLISH_METHOD_PATH,
};
pub use publisher::Publisher;
