//! Scripted collaborators for exercising the reconstruction protocol.

use crate::{
    Context, DecryptRequest, DecryptResponse, EncryptionKey, EncryptionKeyType, Error,
    FetchRequest, FetchSelector, HttpClient, HttpRequest, HttpResponse, KeyData, KeyId,
    KmsDecrypt, SessionToken, SplitFetcher, TokenProvider, TokenRequest,
};
use bytes::Bytes;
use splitkey_executor::{Attempt, Outcome};
use splitkey_utils::from_epoch_millis;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};
use tracing::warn;

/// Build a multi-party key record as custodian `custodian_index` of
/// `custodians` would return it: every entry carries its KEK uri, but only
/// the custodian's own entry holds encrypted material.
pub fn multi_party_key(
    id: &str,
    custodians: usize,
    custodian_index: usize,
    split: &[u8],
) -> EncryptionKey {
    let key_data = (0..custodians)
        .map(|index| KeyData {
            key_encryption_key_uri: format!("kms://kek/{id}/{index}"),
            key_material: if index == custodian_index {
                Bytes::copy_from_slice(split)
            } else {
                Bytes::new()
            },
            public_key_signature: format!("sig-{index}"),
        })
        .collect();
    EncryptionKey {
        id: id.to_string(),
        name: format!("keySets/main/encryptionKeys/{id}"),
        key_type: EncryptionKeyType::MultiPartyEvenSplit,
        key_data,
        public_keyset: None,
        creation: from_epoch_millis(1_700_000_000_000),
        activation: from_epoch_millis(1_700_000_000_000),
        expiration: from_epoch_millis(1_800_000_000_000),
    }
}

/// Build a single-party key record: one custodian holds the whole key.
pub fn single_party_key(id: &str, material: &[u8]) -> EncryptionKey {
    EncryptionKey {
        id: id.to_string(),
        name: format!("keySets/main/encryptionKeys/{id}"),
        key_type: EncryptionKeyType::SingleParty,
        key_data: vec![KeyData {
            key_encryption_key_uri: format!("kms://kek/{id}/0"),
            key_material: Bytes::copy_from_slice(material),
            public_key_signature: "sig-0".into(),
        }],
        public_keyset: None,
        creation: from_epoch_millis(1_700_000_000_000),
        activation: from_epoch_millis(1_700_000_000_000),
        expiration: from_epoch_millis(1_800_000_000_000),
    }
}

/// A split fetcher that can be scripted for testing.
///
/// Results are keyed by endpoint uri plus, for key-id fetches, the requested
/// id, and consumed in scripting order, so retries observe successive
/// entries. Unscripted fetches succeed with no keys.
pub struct MockSplitFetcher {
    scripts: Mutex<HashMap<(String, Option<KeyId>), VecDeque<Result<Vec<EncryptionKey>, Error>>>>,
}

impl MockSplitFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
        })
    }

    /// Queue the result of the next fetch against `endpoint_uri` (and, for
    /// key-id fetches, `key_id`).
    pub fn script(
        &self,
        endpoint_uri: &str,
        key_id: Option<&str>,
        result: Result<Vec<EncryptionKey>, Error>,
    ) {
        self.scripts
            .lock()
            .unwrap()
            .entry((endpoint_uri.to_string(), key_id.map(|id| id.to_string())))
            .or_default()
            .push_back(result);
    }
}

impl SplitFetcher for MockSplitFetcher {
    fn fetch(
        &self,
        context: Context<FetchRequest, Vec<EncryptionKey>>,
        attempt: Attempt<FetchRequest, Vec<EncryptionKey>, Error>,
    ) {
        let request = context.request();
        let key = (
            request.endpoint.uri.clone(),
            match &request.selector {
                FetchSelector::ById(id) => Some(id.clone()),
                _ => None,
            },
        );
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());
        match next {
            Some(Ok(keys)) => {
                context.set_response(keys);
                attempt.complete(Outcome::Success);
            }
            Some(Err(error)) => attempt.complete(error.into_outcome()),
            None => {
                context.set_response(Vec::new());
                attempt.complete(Outcome::Success);
            }
        }
    }
}

/// A KMS that decrypts by identity (plaintext == ciphertext), with scripted
/// failures keyed by KEK uri and consumed in order.
pub struct MockKms {
    failures: Mutex<HashMap<String, VecDeque<Error>>>,
}

impl MockKms {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(HashMap::new()),
        })
    }

    /// Fail the next decrypt of the given KEK uri with `error`.
    pub fn fail_for(&self, key_encryption_key_uri: &str, error: Error) {
        self.failures
            .lock()
            .unwrap()
            .entry(key_encryption_key_uri.to_string())
            .or_default()
            .push_back(error);
    }
}

impl KmsDecrypt for MockKms {
    fn decrypt(&self, context: Context<DecryptRequest, DecryptResponse>) {
        let request = context.request();
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&request.key_encryption_key_uri)
            .and_then(|queue| queue.pop_front());
        match failure {
            Some(error) => {
                context.finish(Err(error));
            }
            None => {
                context.set_response(DecryptResponse {
                    plaintext: request.ciphertext.clone(),
                });
                context.finish(Ok(()));
            }
        }
    }
}

/// An HTTP client that can be scripted for testing.
///
/// Responses are keyed by a uri fragment and consumed in scripting order;
/// performed requests are recorded for assertions. Unscripted requests
/// finish with a 404 status.
pub struct MockHttpClient {
    scripts: Mutex<Vec<(String, VecDeque<Result<HttpResponse, Error>>)>>,
    performed: Mutex<Vec<HttpRequest>>,
}

impl MockHttpClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(Vec::new()),
            performed: Mutex::new(Vec::new()),
        })
    }

    /// Queue the result of the next request whose uri contains `fragment`.
    pub fn script(&self, fragment: &str, result: Result<HttpResponse, Error>) {
        let mut scripts = self.scripts.lock().unwrap();
        if let Some((_, queue)) = scripts.iter_mut().find(|(existing, _)| existing == fragment) {
            queue.push_back(result);
            return;
        }
        scripts.push((fragment.to_string(), VecDeque::from([result])));
    }

    /// Every request performed so far.
    pub fn performed(&self) -> Vec<HttpRequest> {
        self.performed.lock().unwrap().clone()
    }
}

impl HttpClient for MockHttpClient {
    fn perform(&self, context: Context<HttpRequest, HttpResponse>) {
        let request = context.request();
        self.performed.lock().unwrap().push((*request).clone());
        let next = {
            let mut scripts = self.scripts.lock().unwrap();
            scripts
                .iter_mut()
                .find(|(fragment, queue)| request.uri.contains(fragment.as_str()) && !queue.is_empty())
                .and_then(|(_, queue)| queue.pop_front())
        };
        match next {
            Some(Ok(response)) => {
                context.set_response(response);
                context.finish(Ok(()));
            }
            Some(Err(error)) => {
                context.finish(Err(error));
            }
            None => {
                warn!(uri = %request.uri, "unscripted request");
                context.finish(Err(Error::HttpStatus(404)));
            }
        }
    }
}

/// A token provider issuing a fixed bearer token, with an optional scripted
/// failure.
pub struct MockTokenProvider {
    failure: Mutex<Option<Error>>,
}

impl MockTokenProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            failure: Mutex::new(None),
        })
    }

    /// Fail every subsequent token issuance with `error`.
    pub fn fail_with(&self, error: Error) {
        *self.failure.lock().unwrap() = Some(error);
    }
}

impl TokenProvider for MockTokenProvider {
    fn issue(&self, context: Context<TokenRequest, SessionToken>) {
        let failure = self.failure.lock().unwrap().clone();
        match failure {
            Some(error) => {
                context.finish(Err(error));
            }
            None => {
                context.set_response(SessionToken {
                    bearer: "test-token".into(),
                });
                context.finish(Ok(()));
            }
        }
    }
}
