//! Data model for key custodians, encrypted splits, and list requests.

use crate::Error;
use bytes::Bytes;
use std::time::{Duration, SystemTime};

/// Logical identifier of an encryption key, shared by all custodians.
pub type KeyId = String;

/// Cloud-specific identity material used to sign requests to a custodian and
/// to reach its KMS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloudIdentity {
    Aws {
        region: String,
        /// Role assumed when calling the custodian's KMS.
        account_identity: String,
    },
    Gcp {
        workload_identity_pool: String,
        service_account: String,
    },
}

/// One independent key-custodian service instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyEndpoint {
    /// Base URI of the custodian's key-hosting service.
    pub uri: String,
    pub identity: CloudIdentity,
}

/// How keys are selected by a list request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeySelector {
    /// Fetch each named key id individually (one call per id per endpoint).
    ByKeyId(Vec<KeyId>),
    /// Fetch every key created within the trailing window (server-side
    /// filtered, one call per endpoint).
    ByMaxAge(Duration),
    /// Fetch every currently-active key (server-side filtered, one call per
    /// endpoint).
    ByActiveKeys,
}

impl KeySelector {
    pub(crate) fn calls_per_endpoint(&self) -> usize {
        match self {
            Self::ByKeyId(ids) => ids.len(),
            Self::ByMaxAge(_) | Self::ByActiveKeys => 1,
        }
    }

    /// Whether per-key shortfalls are dropped (age-based listing) rather than
    /// failing the whole request (key-id listing).
    pub(crate) fn tolerates_partial_keys(&self) -> bool {
        !matches!(self, Self::ByKeyId(_))
    }
}

/// Kind of an encryption key as stored by the custodians.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptionKeyType {
    /// The whole key lives behind a single custodian; no combination needed.
    SingleParty,
    /// The key is split evenly across all custodians and reconstructed by
    /// XOR-combining every split.
    MultiPartyEvenSplit,
}

/// One custodian's contribution to a key. Custodians return the full list in
/// endpoint order, with encrypted material present only in their own entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyData {
    /// URI of the key-encryption key wrapping this split.
    pub key_encryption_key_uri: String,
    /// Encrypted split bytes; empty for foreign custodians' entries.
    pub key_material: Bytes,
    pub public_key_signature: String,
}

/// A key record as returned by one custodian.
#[derive(Clone, Debug, PartialEq)]
pub struct EncryptionKey {
    pub id: KeyId,
    /// Full resource name, e.g. `keySets/main/encryptionKeys/<id>`.
    pub name: String,
    pub key_type: EncryptionKeyType,
    /// One entry per custodian, in endpoint order.
    pub key_data: Vec<KeyData>,
    /// Serialized public keyset, when the key carries one.
    pub public_keyset: Option<String>,
    pub creation: SystemTime,
    pub activation: SystemTime,
    pub expiration: SystemTime,
}

/// A fully reconstructed private key.
#[derive(Clone, Debug, PartialEq)]
pub struct PrivateKey {
    pub id: KeyId,
    pub public_keyset: Option<String>,
    /// Reconstructed plaintext key material.
    pub material: Bytes,
    pub creation: SystemTime,
    pub activation: SystemTime,
    pub expiration: SystemTime,
}

/// Top-level request to list and reconstruct private keys.
#[derive(Clone, Debug)]
pub struct ListKeysRequest {
    pub endpoints: Vec<KeyEndpoint>,
    pub selector: KeySelector,
    /// Name of the key set to list from, shared by all custodians.
    pub key_set_name: String,
}

/// Reconstructed keys for a completed list request.
#[derive(Clone, Debug, Default)]
pub struct ListKeysResponse {
    pub keys: Vec<PrivateKey>,
}

/// Selection made by a single fetch call against one endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchSelector {
    ById(KeyId),
    MaxAge(Duration),
    Active,
}

/// One fetch call: a custodian endpoint paired with a selection.
#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub endpoint: KeyEndpoint,
    pub selector: FetchSelector,
    pub key_set_name: String,
}

/// A request as handed to the [crate::HttpClient] collaborator.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// A response as returned by the [crate::HttpClient] collaborator.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

/// Request to issue a signing token for one custodian.
#[derive(Clone, Debug)]
pub struct TokenRequest {
    pub endpoint_uri: String,
    pub identity: CloudIdentity,
}

/// A bearer/session token used to sign custodian requests.
#[derive(Clone, Debug)]
pub struct SessionToken {
    pub bearer: String,
}

/// Request to unwrap one split through a cloud KMS.
#[derive(Clone, Debug)]
pub struct DecryptRequest {
    pub key_id: KeyId,
    pub key_encryption_key_uri: String,
    pub ciphertext: Bytes,
    pub identity: CloudIdentity,
}

/// Plaintext split returned by a KMS decrypt.
#[derive(Clone, Debug)]
pub struct DecryptResponse {
    pub plaintext: Bytes,
}

/// Outcome of decrypting one endpoint's split of one key. Aggregated into a
/// per-endpoint table during fan-in.
#[derive(Clone, Debug)]
pub struct DecryptResult {
    /// The key record as fetched from this endpoint.
    pub key: EncryptionKey,
    /// Plaintext split, when the decrypt succeeded.
    pub plaintext: Option<Bytes>,
    pub result: Result<(), Error>,
}
