use thiserror::Error;

use crate::client::ClientError;
use crate::proto::ProtoError;
use crate::server::ServerError;
use crate::source::SourceError;
use crate::sup::SupError;

/// Crate-level convenience error.
///
/// A thin wrapper over the per-component errors; policy (what is fatal,
/// what drops a subscriber, what is skipped) lives with the components.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Sup(#[from] SupError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Client(#[from] ClientError),
}
