//! Directory-facing adapters: the field extractor and directory clients.

mod extract;
mod snapshot;
mod wild_apricot;

use async_trait::async_trait;
use tagsync_core::{MemberId, MemberRecord};
use tagsync_storage::FetchError;
use thiserror::Error;

pub use extract::{ExtractionError, ExtractionErrorKind, FieldExtractor, FieldMapping, ADMIN_SENTINEL};
pub use snapshot::SnapshotDirectory;
pub use wild_apricot::{
    parse_contact, parse_contacts_page, AccessToken, ContactsPage, DirectoryClientConfig,
    HttpDirectoryClient,
};

pub const CRATE_NAME: &str = "tagsync-adapters";

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("directory rejected credentials (status {status})")]
    Unauthorized { status: u16 },
    #[error("undecodable directory response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("async result at {url} not ready after {attempts} attempts")]
    AsyncResultNotReady { url: String, attempts: u32 },
    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },
    #[error("missing directory credential {0}")]
    MissingCredential(&'static str),
    #[error("invalid directory url: {0}")]
    InvalidUrl(String),
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Read-only view of the membership directory.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// All members matching `filter`, in directory order.
    async fn list_active_members(&self, filter: &str) -> Result<Vec<MemberRecord>, DirectoryError>;

    /// One member by id; `Ok(None)` when the directory no longer knows it.
    async fn get_member(&self, member_id: MemberId) -> Result<Option<MemberRecord>, DirectoryError>;
}
