//! Collaborator traits: the seams the engine depends on.

mod backend;
mod remote;

pub use backend::KeyValueBackend;
pub use remote::{PullBatch, PushOutcome, RemoteEndpoint};
