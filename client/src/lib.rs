//! Reconstruct multi-party private keys from independent cloud custodians.
//!
//! A private key is never held whole by any single cloud or operator: each of
//! N custodian endpoints stores one encrypted "split" of the key, wrapped by
//! that custodian's KMS. This crate retrieves one split from every endpoint,
//! decrypts each split through the corresponding KMS, and XOR-combines the
//! plaintexts in endpoint order, only when all splits are present and
//! consistent.
//!
//! The protocol is a fan-out/fan-in built on [splitkey_executor]: every fetch
//! and every decrypt is a retried asynchronous hop, completions land in
//! per-endpoint [splitkey_utils::ConcurrentMap] tables, and balanced atomic
//! counters decide when reconstruction can run. The caller's context finishes
//! exactly once with either a complete key list or a single dominant error,
//! never a partial mix.
//!
//! Cloud specifics (HTTP transport, request signing tokens, KMS decrypt RPCs)
//! stay behind the [HttpClient], [TokenProvider], and [KmsDecrypt] traits and
//! are injected at construction time.

use splitkey_executor::{AsyncContext, Attempt, Outcome};
use std::sync::Arc;
use thiserror::Error;

mod types;
pub use types::{
    CloudIdentity, DecryptRequest, DecryptResponse, DecryptResult, EncryptionKey,
    EncryptionKeyType, FetchRequest, FetchSelector, HttpRequest, HttpResponse, KeyData,
    KeyEndpoint, KeyId, KeySelector, ListKeysRequest, ListKeysResponse, PrivateKey,
    SessionToken, TokenRequest,
};
mod fetcher;
pub use fetcher::HttpSplitFetcher;
mod reconstructor;
pub use reconstructor::{Config, KeyReconstructor};

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

/// A continuation carrying one hop of this crate's work.
pub type Context<Req, Resp> = Arc<AsyncContext<Req, Resp, Error>>;

/// Errors that can occur while listing and reconstructing private keys.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("execution: {0}")]
    Execution(#[from] splitkey_executor::Error),
    #[error("no key endpoints supplied")]
    NoEndpoints,
    #[error("transport: {0}")]
    Transport(String),
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("token issuance failed: {0}")]
    Token(String),
    #[error("kms decrypt failed: {0}")]
    Decrypt(String),
    #[error("missing resource name")]
    MissingResourceName,
    #[error("invalid resource name: {0}")]
    InvalidResourceName(String),
    #[error("missing or invalid {0} timestamp")]
    InvalidTimestamp(&'static str),
    #[error("unknown encryption key type: {0}")]
    UnknownKeyType(String),
    #[error("missing key data")]
    MissingKeyData,
    #[error("missing key encryption key uri")]
    MissingKeyEncryptionKeyUri,
    #[error("invalid key material encoding: {0}")]
    InvalidKeyMaterial(String),
    #[error("malformed public keyset: {0}")]
    MalformedPublicKeyset(String),
    #[error("malformed response body: {0}")]
    MalformedBody(String),
    #[error("splits do not cover all endpoints for key {0}")]
    UnmatchedEndpointsSplits(KeyId),
    #[error("split length mismatch for key {0}")]
    SplitLengthMismatch(KeyId),
    #[error("duplicate completion for {0}")]
    DuplicateCompletion(String),
}

impl Error {
    /// Whether the failure is transient and eligible for automatic retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::HttpStatus(status) => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Classify the failure for the retry dispatcher.
    pub fn into_outcome(self) -> Outcome<Error> {
        if self.is_retryable() {
            Outcome::Retry(self)
        } else {
            Outcome::Failure(self)
        }
    }
}

/// Asynchronous HTTP transport.
///
/// Implementations set the response on the context before finishing it; they
/// may retry transport-level errors internally, and surface the rest as
/// [Error::Transport] (retryable) or [Error::HttpStatus].
pub trait HttpClient: Send + Sync + 'static {
    fn perform(&self, context: Context<HttpRequest, HttpResponse>);
}

/// Supplies bearer/session tokens for request signing.
///
/// Token exchange is cloud-specific (AWS assumed-role session credentials vs
/// GCP workload-identity federation) and itself asynchronous.
pub trait TokenProvider: Send + Sync + 'static {
    fn issue(&self, context: Context<TokenRequest, SessionToken>);
}

/// Decrypts one wrapped split through a cloud KMS.
///
/// Implementations map provider-specific failures into [Error] values whose
/// [Error::is_retryable] classification reflects the uniform retry taxonomy.
pub trait KmsDecrypt: Send + Sync + 'static {
    fn decrypt(&self, context: Context<DecryptRequest, DecryptResponse>);
}

/// Retrieves one custodian's view of the requested keys.
///
/// Invoked once per attempt by the retry dispatcher: implementations report
/// through the single-use `attempt` token and set the fetched keys on the
/// context before completing with success. A fetch that succeeds with zero
/// keys is a valid response.
pub trait SplitFetcher: Send + Sync + 'static {
    fn fetch(
        &self,
        context: Context<FetchRequest, Vec<EncryptionKey>>,
        attempt: Attempt<FetchRequest, Vec<EncryptionKey>, Error>,
    );
}
