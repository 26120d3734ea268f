//! Fan-out/fan-in reconstruction of multi-party private keys.

use crate::{
    Context, DecryptRequest, DecryptResponse, DecryptResult, EncryptionKey, EncryptionKeyType,
    Error, FetchRequest, FetchSelector, KeyEndpoint, KeyId, KeySelector, KmsDecrypt,
    ListKeysRequest, ListKeysResponse, PrivateKey, SplitFetcher,
};
use bytes::Bytes;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use splitkey_executor::{
    AsyncContext, Error as ExecError, Executor, Operation, Outcome, Priority, RetryDispatcher,
    RetryStrategy,
};
use splitkey_utils::{ConcurrentMap, SetOnce};
use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tracing::{debug, warn};

/// Prefix for client metrics.
const METRICS_PREFIX: &str = "client";

/// Configuration for [KeyReconstructor].
#[derive(Clone, Debug)]
pub struct Config {
    /// Retry schedule for per-endpoint fetch calls.
    pub fetch_retry: RetryStrategy,
    /// Retry schedule for per-split KMS decrypt calls.
    pub decrypt_retry: RetryStrategy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fetch_retry: RetryStrategy::Exponential {
                base: Duration::from_millis(200),
                max_retries: 5,
            },
            decrypt_retry: RetryStrategy::Exponential {
                base: Duration::from_millis(200),
                max_retries: 5,
            },
        }
    }
}

#[derive(Debug)]
struct Metrics {
    list_requests: Counter,
    fetch_calls: Counter,
    fetch_failures: Counter,
    decrypt_calls: Counter,
    decrypt_failures: Counter,
    keys_reconstructed: Counter,
    keys_dropped: Counter,
}

impl Metrics {
    fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            list_requests: Counter::default(),
            fetch_calls: Counter::default(),
            fetch_failures: Counter::default(),
            decrypt_calls: Counter::default(),
            decrypt_failures: Counter::default(),
            keys_reconstructed: Counter::default(),
            keys_dropped: Counter::default(),
        };
        registry.register(
            "list_requests",
            "Total number of list requests received",
            metrics.list_requests.clone(),
        );
        registry.register(
            "fetch_calls",
            "Total number of per-endpoint fetch calls issued",
            metrics.fetch_calls.clone(),
        );
        registry.register(
            "fetch_failures",
            "Total number of fetch calls that failed after retries",
            metrics.fetch_failures.clone(),
        );
        registry.register(
            "decrypt_calls",
            "Total number of per-split decrypt calls issued",
            metrics.decrypt_calls.clone(),
        );
        registry.register(
            "decrypt_failures",
            "Total number of decrypt calls that failed after retries",
            metrics.decrypt_failures.clone(),
        );
        registry.register(
            "keys_reconstructed",
            "Total number of keys successfully reconstructed",
            metrics.keys_reconstructed.clone(),
        );
        registry.register(
            "keys_dropped",
            "Total number of keys dropped for incomplete or inconsistent splits",
            metrics.keys_dropped.clone(),
        );
        metrics
    }
}

/// Shared state of one in-flight list request.
///
/// All completions of the fan-out land here: per-endpoint result tables,
/// the balanced completion counters, and the first-failure cell. The
/// `completed` guard is the completion token; whoever wins it (and only
/// that caller) finishes the top-level context.
struct ListStatus {
    endpoints: Vec<KeyEndpoint>,
    calls_per_endpoint: usize,
    /// Age-based listing drops inconsistent keys; key-id listing fails.
    tolerant: bool,
    /// Per-endpoint fetch outcomes, keyed by call index.
    fetch_results: Vec<ConcurrentMap<usize, Result<(), Error>>>,
    /// Per-endpoint decrypt outcomes, keyed by key id.
    decrypt_results: Vec<ConcurrentMap<KeyId, DecryptResult>>,
    fetch_returned: AtomicUsize,
    total_splits: AtomicUsize,
    finished_splits: AtomicUsize,
    discovered: Mutex<BTreeSet<KeyId>>,
    got_failure: AtomicBool,
    first_failure: SetOnce<Error>,
    completed: AtomicBool,
}

impl ListStatus {
    fn new(endpoints: Vec<KeyEndpoint>, calls_per_endpoint: usize, tolerant: bool) -> Arc<Self> {
        let fetch_results = endpoints.iter().map(|_| ConcurrentMap::new()).collect();
        let decrypt_results = endpoints.iter().map(|_| ConcurrentMap::new()).collect();
        Arc::new(Self {
            endpoints,
            calls_per_endpoint,
            tolerant,
            fetch_results,
            decrypt_results,
            fetch_returned: AtomicUsize::new(0),
            total_splits: AtomicUsize::new(0),
            finished_splits: AtomicUsize::new(0),
            discovered: Mutex::new(BTreeSet::new()),
            got_failure: AtomicBool::new(false),
            first_failure: SetOnce::new(),
            completed: AtomicBool::new(false),
        })
    }

    fn expected_calls(&self) -> usize {
        self.calls_per_endpoint * self.endpoints.len()
    }

    /// Whether the first-failure path has already fired; observers become
    /// no-ops.
    fn failed(&self) -> bool {
        self.got_failure.load(Ordering::Acquire)
    }

    /// Record the first failure. Returns whether this caller won.
    fn try_fail(&self, error: Error) -> bool {
        if !self.first_failure.set(error) {
            return false;
        }
        self.got_failure.store(true, Ordering::Release);
        true
    }

    /// Consume the completion token. Exactly one caller wins.
    fn try_complete(&self) -> bool {
        self.completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Orchestrates N split fetchers and a KMS-decrypt collaborator to produce
/// complete plaintext keys.
///
/// For every list request the reconstructor fans out
/// `calls_per_endpoint x N` retried fetch calls, one retried decrypt per
/// returned split, and completes the caller's context exactly once when both
/// completion counters balance: every fetch call has returned and every
/// counted split has a recorded decrypt outcome.
pub struct KeyReconstructor<F: SplitFetcher, K: KmsDecrypt> {
    executor: Arc<Executor>,
    fetcher: Arc<F>,
    kms: Arc<K>,
    fetch_retries: Arc<RetryDispatcher>,
    decrypt_retries: Arc<RetryDispatcher>,
    metrics: Metrics,
}

impl<F: SplitFetcher, K: KmsDecrypt> KeyReconstructor<F, K> {
    /// Create a reconstructor with a private metrics registry.
    pub fn new(executor: Arc<Executor>, fetcher: Arc<F>, kms: Arc<K>, cfg: Config) -> Arc<Self> {
        Self::init(executor, fetcher, kms, cfg, &mut Registry::default())
    }

    /// Create a reconstructor, registering its metrics under the given
    /// registry.
    pub fn init(
        executor: Arc<Executor>,
        fetcher: Arc<F>,
        kms: Arc<K>,
        cfg: Config,
        registry: &mut Registry,
    ) -> Arc<Self> {
        let metrics = Metrics::init(registry.sub_registry_with_prefix(METRICS_PREFIX));
        Arc::new(Self {
            fetch_retries: RetryDispatcher::new(executor.clone(), cfg.fetch_retry),
            decrypt_retries: RetryDispatcher::new(executor.clone(), cfg.decrypt_retry),
            executor,
            fetcher,
            kms,
            metrics,
        })
    }

    /// List private keys by explicit key ids or by maximum age, reconstruct
    /// them, and finish the supplied context exactly once.
    pub fn list_private_keys(self: &Arc<Self>, context: Context<ListKeysRequest, ListKeysResponse>) {
        self.list(context);
    }

    /// List every currently-active key. The request's selector must be
    /// [KeySelector::ByActiveKeys].
    pub fn list_active_encryption_keys(
        self: &Arc<Self>,
        context: Context<ListKeysRequest, ListKeysResponse>,
    ) {
        debug_assert!(matches!(
            context.request().selector,
            KeySelector::ByActiveKeys
        ));
        self.list(context);
    }

    fn list(self: &Arc<Self>, context: Context<ListKeysRequest, ListKeysResponse>) {
        self.metrics.list_requests.inc();
        let request = context.request();
        if request.endpoints.is_empty() {
            context.finish(Err(Error::NoEndpoints));
            return;
        }
        let calls_per_endpoint = request.selector.calls_per_endpoint();
        let status = ListStatus::new(
            request.endpoints.clone(),
            calls_per_endpoint,
            request.selector.tolerates_partial_keys(),
        );
        debug!(
            activity = %context.activity_id(),
            endpoints = request.endpoints.len(),
            calls_per_endpoint,
            "listing private keys"
        );
        for endpoint_index in 0..request.endpoints.len() {
            for call_index in 0..calls_per_endpoint {
                let selector = match &request.selector {
                    KeySelector::ByKeyId(ids) => FetchSelector::ById(ids[call_index].clone()),
                    KeySelector::ByMaxAge(age) => FetchSelector::MaxAge(*age),
                    KeySelector::ByActiveKeys => FetchSelector::Active,
                };
                let fetch_request = FetchRequest {
                    endpoint: request.endpoints[endpoint_index].clone(),
                    selector,
                    key_set_name: request.key_set_name.clone(),
                };
                self.spawn_fetch(&context, &status, endpoint_index, call_index, fetch_request);
            }
        }
        if status.expected_calls() == 0 {
            // Nothing to fan out (an empty key-id list); complete immediately.
            self.maybe_complete(&context, &status);
        }
    }

    fn spawn_fetch(
        self: &Arc<Self>,
        parent: &Context<ListKeysRequest, ListKeysResponse>,
        status: &Arc<ListStatus>,
        endpoint_index: usize,
        call_index: usize,
        fetch_request: FetchRequest,
    ) {
        if parent.is_cancelled() {
            self.finish_cancelled(parent, status);
            return;
        }
        self.metrics.fetch_calls.inc();
        let this = self.clone();
        let parent_context = parent.clone();
        let fanin_status = status.clone();
        let fetch_context: Context<FetchRequest, Vec<EncryptionKey>> = AsyncContext::with_options(
            Arc::new(fetch_request),
            parent.expiration(),
            Some(parent.activity_id()),
            Box::new(move |fetch_cx| {
                this.handle_fetch_result(
                    &parent_context,
                    &fanin_status,
                    endpoint_index,
                    call_index,
                    fetch_cx,
                );
            }),
        );
        let fetcher = self.fetcher.clone();
        let op: Operation<FetchRequest, Vec<EncryptionKey>, Error> =
            Arc::new(move |cx, attempt| fetcher.fetch(cx, attempt));
        let dispatcher = self.fetch_retries.clone();
        let dispatch_context = fetch_context.clone();
        let scheduled = self.executor.schedule(
            move || dispatcher.dispatch(dispatch_context, op),
            Priority::Normal,
        );
        if let Err(error) = scheduled {
            // Route the failure through the regular fetch-result path so the
            // completion counters stay balanced.
            fetch_context.finish(Err(error.into()));
        }
    }

    fn handle_fetch_result(
        self: &Arc<Self>,
        parent: &Context<ListKeysRequest, ListKeysResponse>,
        status: &Arc<ListStatus>,
        endpoint_index: usize,
        call_index: usize,
        fetch_cx: &AsyncContext<FetchRequest, Vec<EncryptionKey>, Error>,
    ) {
        if parent.is_cancelled() {
            self.finish_cancelled(parent, status);
            return;
        }
        if status.failed() {
            return;
        }
        let result = fetch_cx
            .result()
            .unwrap_or(Err(Error::Transport("fetch finished without a result".into())));
        match result {
            Err(error) => {
                self.metrics.fetch_failures.inc();
                warn!(endpoint = endpoint_index, call = call_index, %error, "fetch call failed");
                if status.fetch_results[endpoint_index]
                    .insert(call_index, Err(error))
                    .is_err()
                {
                    self.fail(
                        parent,
                        status,
                        Error::DuplicateCompletion(format!(
                            "fetch call {endpoint_index}/{call_index}"
                        )),
                    );
                    return;
                }
                // A failed fetch contributes one vacuous finished split so
                // the completion counters stay balanced.
                status.total_splits.fetch_add(1, Ordering::AcqRel);
                status.finished_splits.fetch_add(1, Ordering::AcqRel);
            }
            Ok(()) => {
                let keys = fetch_cx.take_response().unwrap_or_default();
                let keys = match &fetch_cx.request().selector {
                    // A record whose id does not match the requested key is a
                    // corrupted response; exclude it without failing the batch.
                    FetchSelector::ById(id) => keys
                        .into_iter()
                        .filter(|key| {
                            if key.id == *id {
                                true
                            } else {
                                warn!(
                                    endpoint = endpoint_index,
                                    requested = %id,
                                    returned = %key.id,
                                    "dropping key outside request scope"
                                );
                                false
                            }
                        })
                        .collect(),
                    _ => keys,
                };
                if status.fetch_results[endpoint_index]
                    .insert(call_index, Ok(()))
                    .is_err()
                {
                    self.fail(
                        parent,
                        status,
                        Error::DuplicateCompletion(format!(
                            "fetch call {endpoint_index}/{call_index}"
                        )),
                    );
                    return;
                }
                if keys.is_empty() {
                    // An empty fetch is modeled as one vacuous successful
                    // decrypt; the completion test depends on this balance.
                    status.total_splits.fetch_add(1, Ordering::AcqRel);
                    status.finished_splits.fetch_add(1, Ordering::AcqRel);
                } else {
                    status.total_splits.fetch_add(keys.len(), Ordering::AcqRel);
                    {
                        let mut discovered = status.discovered.lock().unwrap();
                        for key in &keys {
                            discovered.insert(key.id.clone());
                        }
                    }
                    for key in keys {
                        self.spawn_decrypt(parent, status, endpoint_index, key);
                    }
                }
            }
        }
        // Publish the returned call only after its splits are counted; the
        // completion test could otherwise pass before this call's splits
        // exist.
        status.fetch_returned.fetch_add(1, Ordering::AcqRel);
        self.maybe_complete(parent, status);
    }

    fn spawn_decrypt(
        self: &Arc<Self>,
        parent: &Context<ListKeysRequest, ListKeysResponse>,
        status: &Arc<ListStatus>,
        endpoint_index: usize,
        key: EncryptionKey,
    ) {
        if parent.is_cancelled() {
            self.finish_cancelled(parent, status);
            return;
        }
        self.metrics.decrypt_calls.inc();
        let data = key.key_data.iter().find(|data| !data.key_material.is_empty());
        let Some(data) = data else {
            // The custodian returned no split of its own for this key.
            self.record_decrypt(
                parent,
                status,
                endpoint_index,
                key,
                None,
                Err(Error::MissingKeyData),
            );
            return;
        };
        let decrypt_request = DecryptRequest {
            key_id: key.id.clone(),
            key_encryption_key_uri: data.key_encryption_key_uri.clone(),
            ciphertext: data.key_material.clone(),
            identity: status.endpoints[endpoint_index].identity.clone(),
        };
        let this = self.clone();
        let parent_context = parent.clone();
        let fanin_status = status.clone();
        let decrypt_context: Context<DecryptRequest, DecryptResponse> = AsyncContext::with_options(
            Arc::new(decrypt_request),
            parent.expiration(),
            Some(parent.activity_id()),
            Box::new(move |decrypt_cx| {
                if parent_context.is_cancelled() {
                    this.finish_cancelled(&parent_context, &fanin_status);
                    return;
                }
                if fanin_status.failed() {
                    return;
                }
                let result = decrypt_cx
                    .result()
                    .unwrap_or(Err(Error::Decrypt("decrypt finished without a result".into())));
                let (plaintext, result) = match result {
                    Ok(()) => match decrypt_cx.take_response() {
                        Some(response) => (Some(response.plaintext), Ok(())),
                        None => (
                            None,
                            Err(Error::Decrypt("provider returned no plaintext".into())),
                        ),
                    },
                    Err(error) => (None, Err(error)),
                };
                this.record_decrypt(
                    &parent_context,
                    &fanin_status,
                    endpoint_index,
                    key,
                    plaintext,
                    result,
                );
            }),
        );
        let kms = self.kms.clone();
        let op: Operation<DecryptRequest, DecryptResponse, Error> =
            Arc::new(move |cx, attempt| {
                let outer = cx.clone();
                let inner: Context<DecryptRequest, DecryptResponse> = AsyncContext::with_options(
                    cx.request(),
                    cx.expiration(),
                    Some(cx.activity_id()),
                    Box::new(move |inner_cx| match inner_cx.result() {
                        Some(Ok(())) => match inner_cx.take_response() {
                            Some(response) => {
                                outer.set_response(response);
                                attempt.complete(Outcome::Success);
                            }
                            None => attempt.complete(Outcome::Failure(Error::Decrypt(
                                "provider returned no plaintext".into(),
                            ))),
                        },
                        Some(Err(error)) => attempt.complete(error.into_outcome()),
                        None => attempt.complete(Outcome::Failure(Error::Decrypt(
                            "decrypt context finished without a result".into(),
                        ))),
                    }),
                );
                kms.decrypt(inner);
            });
        self.decrypt_retries.dispatch(decrypt_context, op);
    }

    fn record_decrypt(
        self: &Arc<Self>,
        parent: &Context<ListKeysRequest, ListKeysResponse>,
        status: &Arc<ListStatus>,
        endpoint_index: usize,
        key: EncryptionKey,
        plaintext: Option<Bytes>,
        result: Result<(), Error>,
    ) {
        let id = key.id.clone();
        let entry = DecryptResult {
            key,
            plaintext,
            result: result.clone(),
        };
        if status.decrypt_results[endpoint_index]
            .insert(id.clone(), entry)
            .is_err()
        {
            self.fail(parent, status, Error::DuplicateCompletion(format!("key {id}")));
            return;
        }
        if let Err(error) = result {
            self.metrics.decrypt_failures.inc();
            warn!(endpoint = endpoint_index, key = %id, %error, "split decrypt failed");
            if !status.tolerant {
                // In key-id listing every per-split error fails the whole
                // request.
                self.fail(parent, status, error);
            }
        }
        status.finished_splits.fetch_add(1, Ordering::AcqRel);
        self.maybe_complete(parent, status);
    }

    /// First-failure short-circuit: only the winner of the CAS finishes the
    /// top-level context; everyone else becomes a no-op.
    fn fail(
        self: &Arc<Self>,
        parent: &Context<ListKeysRequest, ListKeysResponse>,
        status: &Arc<ListStatus>,
        error: Error,
    ) {
        if !status.try_fail(error.clone()) {
            return;
        }
        if status.try_complete() {
            parent.finish(Err(error));
        }
    }

    fn finish_cancelled(
        &self,
        parent: &Context<ListKeysRequest, ListKeysResponse>,
        status: &Arc<ListStatus>,
    ) {
        if status.try_complete() {
            parent.finish(Err(Error::Execution(ExecError::Cancelled)));
        }
    }

    fn maybe_complete(
        self: &Arc<Self>,
        parent: &Context<ListKeysRequest, ListKeysResponse>,
        status: &Arc<ListStatus>,
    ) {
        if status.fetch_returned.load(Ordering::Acquire) != status.expected_calls() {
            return;
        }
        let total = status.total_splits.load(Ordering::Acquire);
        if status.finished_splits.load(Ordering::Acquire) != total {
            return;
        }
        if !status.try_complete() {
            return;
        }
        if let Some(error) = status.first_failure.get() {
            parent.finish(Err(error));
            return;
        }
        if parent.is_cancelled() {
            parent.finish(Err(Error::Execution(ExecError::Cancelled)));
            return;
        }
        // Transport-level fetch failures surface at completion time, the
        // first endpoint in iteration order winning.
        for (endpoint_index, results) in status.fetch_results.iter().enumerate() {
            for call_index in 0..status.calls_per_endpoint {
                if let Ok(Err(error)) = results.get(&call_index) {
                    debug!(endpoint = endpoint_index, %error, "propagating fetch failure");
                    parent.finish(Err(error));
                    return;
                }
            }
        }
        match self.reconstruct(status) {
            Ok(keys) => {
                debug!(activity = %parent.activity_id(), keys = keys.len(), "list request complete");
                parent.set_response(ListKeysResponse { keys });
                parent.finish(Ok(()));
            }
            Err(error) => {
                parent.finish(Err(error));
            }
        }
    }

    fn reconstruct(&self, status: &ListStatus) -> Result<Vec<PrivateKey>, Error> {
        let endpoint_count = status.endpoints.len();
        let discovered = status.discovered.lock().unwrap().clone();
        let mut keys = Vec::new();
        for id in discovered {
            let mut results = Vec::with_capacity(endpoint_count);
            for table in &status.decrypt_results {
                if let Ok(result) = table.get(&id) {
                    results.push(result);
                }
            }
            // Single-party keys need no cross-endpoint combination.
            if let Some(single) = results
                .iter()
                .find(|result| result.key.key_type == EncryptionKeyType::SingleParty)
            {
                match (&single.result, &single.plaintext) {
                    (Ok(()), Some(plaintext)) => {
                        self.metrics.keys_reconstructed.inc();
                        keys.push(private_key(&single.key, plaintext.clone()));
                    }
                    _ => {
                        self.metrics.keys_dropped.inc();
                        warn!(key = %id, "dropping single-party key with failed decrypt");
                    }
                }
                continue;
            }
            let complete = results.len() == endpoint_count
                && results.iter().all(|result| {
                    result.result.is_ok()
                        && result.plaintext.is_some()
                        && result.key.key_data.len() == endpoint_count
                });
            if !complete {
                if status.tolerant {
                    self.metrics.keys_dropped.inc();
                    warn!(
                        key = %id,
                        have = results.len(),
                        want = endpoint_count,
                        "dropping key with unmatched splits"
                    );
                    continue;
                }
                return Err(Error::UnmatchedEndpointsSplits(id));
            }
            let combined = match xor_splits(&results) {
                Some(combined) => combined,
                None => {
                    if status.tolerant {
                        self.metrics.keys_dropped.inc();
                        warn!(key = %id, "dropping key with mismatched split lengths");
                        continue;
                    }
                    return Err(Error::SplitLengthMismatch(id));
                }
            };
            self.metrics.keys_reconstructed.inc();
            keys.push(private_key(&results[0].key, combined));
        }
        Ok(keys)
    }
}

/// Combine the decrypted splits bytewise, in endpoint order. Returns `None`
/// when the buffers disagree on length.
fn xor_splits(results: &[DecryptResult]) -> Option<Bytes> {
    let first = results.first()?.plaintext.as_ref()?;
    let mut combined = vec![0u8; first.len()];
    for result in results {
        let split = result.plaintext.as_ref()?;
        if split.len() != combined.len() {
            return None;
        }
        for (byte, split_byte) in combined.iter_mut().zip(split.iter()) {
            *byte ^= split_byte;
        }
    }
    Some(Bytes::from(combined))
}

fn private_key(key: &EncryptionKey, material: Bytes) -> PrivateKey {
    PrivateKey {
        id: key.id.clone(),
        public_keyset: key.public_keyset.clone(),
        material,
        creation: key.creation,
        activation: key.activation,
        expiration: key.expiration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{multi_party_key, single_party_key, MockKms, MockSplitFetcher};
    use crate::CloudIdentity;
    use std::sync::mpsc;

    fn endpoints(count: usize) -> Vec<KeyEndpoint> {
        (0..count)
            .map(|index| KeyEndpoint {
                uri: format!("https://custodian-{index}.example.com"),
                identity: if index % 2 == 0 {
                    CloudIdentity::Gcp {
                        workload_identity_pool: format!("pool-{index}"),
                        service_account: format!("sa-{index}@example.com"),
                    }
                } else {
                    CloudIdentity::Aws {
                        region: "us-east-1".into(),
                        account_identity: format!("arn:aws:iam::{index}:role/decrypter"),
                    }
                },
            })
            .collect()
    }

    struct Harness {
        executor: Arc<Executor>,
        fetcher: Arc<MockSplitFetcher>,
        kms: Arc<MockKms>,
        reconstructor: Arc<KeyReconstructor<MockSplitFetcher, MockKms>>,
    }

    fn harness() -> Harness {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let executor = Executor::new(splitkey_executor::Config {
            workers: 4,
            queue_capacity: 256,
            drain_on_stop: true,
        });
        executor.start().unwrap();
        let fetcher = MockSplitFetcher::new();
        let kms = MockKms::new();
        let reconstructor = KeyReconstructor::new(
            executor.clone(),
            fetcher.clone(),
            kms.clone(),
            Config {
                fetch_retry: RetryStrategy::Fixed {
                    delay: Duration::from_millis(5),
                    max_retries: 2,
                },
                decrypt_retry: RetryStrategy::Fixed {
                    delay: Duration::from_millis(5),
                    max_retries: 2,
                },
            },
        );
        Harness {
            executor,
            fetcher,
            kms,
            reconstructor,
        }
    }

    fn run_list(
        harness: &Harness,
        request: ListKeysRequest,
    ) -> (Result<(), Error>, Option<ListKeysResponse>) {
        let (tx, rx) = mpsc::channel();
        let context: Context<ListKeysRequest, ListKeysResponse> = AsyncContext::new(
            request,
            Box::new(move |cx| {
                tx.send((cx.result().unwrap(), cx.take_response())).unwrap();
            }),
        );
        harness.reconstructor.list_private_keys(context);
        rx.recv_timeout(Duration::from_secs(10)).unwrap()
    }

    fn by_id_request(endpoints: Vec<KeyEndpoint>, ids: &[&str]) -> ListKeysRequest {
        ListKeysRequest {
            endpoints,
            selector: KeySelector::ByKeyId(ids.iter().map(|id| id.to_string()).collect()),
            key_set_name: "main".into(),
        }
    }

    fn by_age_request(endpoints: Vec<KeyEndpoint>) -> ListKeysRequest {
        ListKeysRequest {
            endpoints,
            selector: KeySelector::ByMaxAge(Duration::from_secs(3600)),
            key_set_name: "main".into(),
        }
    }

    #[test]
    fn test_three_endpoint_xor_by_key_id() {
        let harness = harness();
        let endpoints = endpoints(3);
        let splits: [&[u8]; 3] = [&[1, 2, 3], &[4, 5, 6], &[7, 8, 9]];
        for (index, endpoint) in endpoints.iter().enumerate() {
            harness.fetcher.script(
                &endpoint.uri,
                Some("k1"),
                Ok(vec![multi_party_key("k1", 3, index, splits[index])]),
            );
        }

        let (result, response) = run_list(&harness, by_id_request(endpoints, &["k1"]));
        assert_eq!(result, Ok(()));
        let keys = response.unwrap().keys;
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].id, "k1");
        // s0 ^ s1 ^ s2, bytewise in endpoint order.
        assert_eq!(keys[0].material, Bytes::from(vec![2u8, 15, 12]));

        harness.executor.stop().unwrap();
    }

    #[test]
    fn test_three_endpoint_xor_by_max_age() {
        let harness = harness();
        let endpoints = endpoints(3);
        let splits: [&[u8]; 3] = [&[0xaa, 0x00], &[0x0f, 0xf0], &[0x55, 0x1e]];
        for (index, endpoint) in endpoints.iter().enumerate() {
            harness.fetcher.script(
                &endpoint.uri,
                None,
                Ok(vec![multi_party_key("k1", 3, index, splits[index])]),
            );
        }

        let (result, response) = run_list(&harness, by_age_request(endpoints));
        assert_eq!(result, Ok(()));
        let keys = response.unwrap().keys;
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].material, Bytes::from(vec![0xaa ^ 0x0f ^ 0x55, 0xf0 ^ 0x1e]));

        harness.executor.stop().unwrap();
    }

    #[test]
    fn test_unmatched_splits_fail_by_key_id() {
        let harness = harness();
        let endpoints = endpoints(3);
        for (index, endpoint) in endpoints.iter().enumerate() {
            // Endpoint 1 has no record of "k1".
            let keys = if index == 1 {
                Ok(vec![])
            } else {
                Ok(vec![multi_party_key("k1", 3, index, &[9, 9, 9])])
            };
            harness.fetcher.script(&endpoint.uri, Some("k1"), keys);
        }

        let (result, _) = run_list(&harness, by_id_request(endpoints, &["k1"]));
        assert_eq!(result, Err(Error::UnmatchedEndpointsSplits("k1".into())));

        harness.executor.stop().unwrap();
    }

    #[test]
    fn test_partial_keys_dropped_by_max_age() {
        let harness = harness();
        let endpoints = endpoints(3);
        for (index, endpoint) in endpoints.iter().enumerate() {
            // Every endpoint serves "k1"; "k2" is missing from endpoint 2.
            let mut keys = vec![multi_party_key("k1", 3, index, &[index as u8 + 1])];
            if index != 2 {
                keys.push(multi_party_key("k2", 3, index, &[0x40 + index as u8]));
            }
            harness.fetcher.script(&endpoint.uri, None, Ok(keys));
        }

        let (result, response) = run_list(&harness, by_age_request(endpoints));
        assert_eq!(result, Ok(()));
        let keys = response.unwrap().keys;
        // "k2" is silently omitted; the response holds only the whole key.
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].id, "k1");
        assert_eq!(keys[0].material, Bytes::from(vec![1u8 ^ 2 ^ 3]));

        harness.executor.stop().unwrap();
    }

    #[test]
    fn test_list_active_keys() {
        let harness = harness();
        let endpoints = endpoints(2);
        for (index, endpoint) in endpoints.iter().enumerate() {
            harness.fetcher.script(
                &endpoint.uri,
                None,
                Ok(vec![multi_party_key("active-1", 2, index, &[index as u8 + 5])]),
            );
        }

        let request = ListKeysRequest {
            endpoints,
            selector: KeySelector::ByActiveKeys,
            key_set_name: "main".into(),
        };
        let (tx, rx) = mpsc::channel();
        let context: Context<ListKeysRequest, ListKeysResponse> = AsyncContext::new(
            request,
            Box::new(move |cx| {
                tx.send((cx.result().unwrap(), cx.take_response())).unwrap();
            }),
        );
        harness.reconstructor.list_active_encryption_keys(context);

        let (result, response) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(result, Ok(()));
        let keys = response.unwrap().keys;
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].id, "active-1");
        assert_eq!(keys[0].material, Bytes::from(vec![5u8 ^ 6]));

        harness.executor.stop().unwrap();
    }

    #[test]
    fn test_zero_keys_is_success() {
        let harness = harness();
        let endpoints = endpoints(3);
        for endpoint in &endpoints {
            harness.fetcher.script(&endpoint.uri, None, Ok(vec![]));
        }

        let (result, response) = run_list(&harness, by_age_request(endpoints));
        assert_eq!(result, Ok(()));
        assert!(response.unwrap().keys.is_empty());

        harness.executor.stop().unwrap();
    }

    #[test]
    fn test_fetch_failure_beats_empty_success() {
        let harness = harness();
        let endpoints = endpoints(3);
        for (index, endpoint) in endpoints.iter().enumerate() {
            let keys = if index == 1 {
                Err(Error::HttpStatus(403))
            } else {
                Ok(vec![])
            };
            harness.fetcher.script(&endpoint.uri, None, keys);
        }

        let (result, _) = run_list(&harness, by_age_request(endpoints));
        assert_eq!(result, Err(Error::HttpStatus(403)));

        harness.executor.stop().unwrap();
    }

    #[test]
    fn test_retryable_fetch_eventually_succeeds() {
        let harness = harness();
        let endpoints = endpoints(2);
        harness.fetcher.script(
            &endpoints[0].uri,
            Some("k1"),
            Err(Error::Transport("connection reset".into())),
        );
        harness.fetcher.script(
            &endpoints[0].uri,
            Some("k1"),
            Ok(vec![multi_party_key("k1", 2, 0, &[1])]),
        );
        harness.fetcher.script(
            &endpoints[1].uri,
            Some("k1"),
            Ok(vec![multi_party_key("k1", 2, 1, &[2])]),
        );

        let (result, response) = run_list(&harness, by_id_request(endpoints, &["k1"]));
        assert_eq!(result, Ok(()));
        assert_eq!(response.unwrap().keys[0].material, Bytes::from(vec![3u8]));

        harness.executor.stop().unwrap();
    }

    #[test]
    fn test_exhausted_fetch_retries_propagate() {
        let harness = harness();
        let endpoints = endpoints(2);
        // Three straight transport errors exhaust max_retries = 2.
        for _ in 0..3 {
            harness.fetcher.script(
                &endpoints[0].uri,
                Some("k1"),
                Err(Error::Transport("connection reset".into())),
            );
        }
        harness.fetcher.script(
            &endpoints[1].uri,
            Some("k1"),
            Ok(vec![multi_party_key("k1", 2, 1, &[2])]),
        );

        let (result, _) = run_list(&harness, by_id_request(endpoints, &["k1"]));
        assert_eq!(
            result,
            Err(Error::Execution(ExecError::ExhaustedRetries(2)))
        );

        harness.executor.stop().unwrap();
    }

    #[test]
    fn test_decrypt_failure_fails_by_key_id() {
        let harness = harness();
        let endpoints = endpoints(3);
        for (index, endpoint) in endpoints.iter().enumerate() {
            harness.fetcher.script(
                &endpoint.uri,
                Some("k1"),
                Ok(vec![multi_party_key("k1", 3, index, &[7])]),
            );
        }
        harness
            .kms
            .fail_for("kms://kek/k1/1", Error::Decrypt("access denied".into()));

        let (result, _) = run_list(&harness, by_id_request(endpoints, &["k1"]));
        assert_eq!(result, Err(Error::Decrypt("access denied".into())));

        harness.executor.stop().unwrap();
    }

    #[test]
    fn test_decrypt_failure_drops_key_by_max_age() {
        let harness = harness();
        let endpoints = endpoints(3);
        for (index, endpoint) in endpoints.iter().enumerate() {
            harness.fetcher.script(
                &endpoint.uri,
                None,
                Ok(vec![
                    multi_party_key("k1", 3, index, &[index as u8]),
                    multi_party_key("k2", 3, index, &[0x10 + index as u8]),
                ]),
            );
        }
        harness
            .kms
            .fail_for("kms://kek/k1/1", Error::Decrypt("access denied".into()));

        let (result, response) = run_list(&harness, by_age_request(endpoints));
        assert_eq!(result, Ok(()));
        let keys = response.unwrap().keys;
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].id, "k2");

        harness.executor.stop().unwrap();
    }

    #[test]
    fn test_retryable_decrypt_eventually_succeeds() {
        let harness = harness();
        let endpoints = endpoints(2);
        for (index, endpoint) in endpoints.iter().enumerate() {
            harness.fetcher.script(
                &endpoint.uri,
                Some("k1"),
                Ok(vec![multi_party_key("k1", 2, index, &[index as u8 + 1])]),
            );
        }
        // One throttle, then the identity decrypt goes through.
        harness
            .kms
            .fail_for("kms://kek/k1/0", Error::HttpStatus(429));

        let (result, response) = run_list(&harness, by_id_request(endpoints, &["k1"]));
        assert_eq!(result, Ok(()));
        assert_eq!(response.unwrap().keys[0].material, Bytes::from(vec![1u8 ^ 2]));

        harness.executor.stop().unwrap();
    }

    #[test]
    fn test_single_party_key_short_circuits() {
        let harness = harness();
        let endpoints = endpoints(3);
        harness.fetcher.script(
            &endpoints[0].uri,
            None,
            Ok(vec![single_party_key("sp", &[0xde, 0xad])]),
        );
        for endpoint in &endpoints[1..] {
            harness.fetcher.script(&endpoint.uri, None, Ok(vec![]));
        }

        let (result, response) = run_list(&harness, by_age_request(endpoints));
        assert_eq!(result, Ok(()));
        let keys = response.unwrap().keys;
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].id, "sp");
        assert_eq!(keys[0].material, Bytes::from(vec![0xde, 0xad]));

        harness.executor.stop().unwrap();
    }

    #[test]
    fn test_out_of_scope_keys_excluded() {
        let harness = harness();
        let endpoints = endpoints(3);
        for (index, endpoint) in endpoints.iter().enumerate() {
            harness.fetcher.script(
                &endpoint.uri,
                Some("k1"),
                Ok(vec![
                    multi_party_key("k1", 3, index, &[index as u8 + 1]),
                    // A corrupted record for a key nobody asked about.
                    multi_party_key("intruder", 3, index, &[0xff]),
                ]),
            );
        }

        let (result, response) = run_list(&harness, by_id_request(endpoints, &["k1"]));
        assert_eq!(result, Ok(()));
        let keys = response.unwrap().keys;
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].id, "k1");
        assert_eq!(keys[0].material, Bytes::from(vec![1u8 ^ 2 ^ 3]));

        harness.executor.stop().unwrap();
    }

    #[test]
    fn test_split_length_mismatch_fails_by_key_id() {
        let harness = harness();
        let endpoints = endpoints(2);
        harness.fetcher.script(
            &endpoints[0].uri,
            Some("k1"),
            Ok(vec![multi_party_key("k1", 2, 0, &[1, 2, 3])]),
        );
        harness.fetcher.script(
            &endpoints[1].uri,
            Some("k1"),
            Ok(vec![multi_party_key("k1", 2, 1, &[1, 2])]),
        );

        let (result, _) = run_list(&harness, by_id_request(endpoints, &["k1"]));
        assert_eq!(result, Err(Error::SplitLengthMismatch("k1".into())));

        harness.executor.stop().unwrap();
    }

    #[test]
    fn test_no_endpoints_rejected() {
        let harness = harness();
        let (result, _) = run_list(&harness, by_id_request(Vec::new(), &["k1"]));
        assert_eq!(result, Err(Error::NoEndpoints));
        harness.executor.stop().unwrap();
    }

    #[test]
    fn test_empty_key_id_list_is_empty_success() {
        let harness = harness();
        let (result, response) = run_list(&harness, by_id_request(endpoints(3), &[]));
        assert_eq!(result, Ok(()));
        assert!(response.unwrap().keys.is_empty());
        harness.executor.stop().unwrap();
    }

    #[test]
    fn test_cancelled_request_finishes_once() {
        let harness = harness();
        let endpoints = endpoints(2);
        for endpoint in &endpoints {
            harness.fetcher.script(&endpoint.uri, Some("k1"), Ok(vec![]));
        }

        let (tx, rx) = mpsc::channel();
        let context: Context<ListKeysRequest, ListKeysResponse> = AsyncContext::new(
            by_id_request(endpoints, &["k1"]),
            Box::new(move |cx| {
                tx.send(cx.result().unwrap()).unwrap();
            }),
        );
        context.try_cancel();
        context.try_cancel();
        harness.reconstructor.list_private_keys(context);

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Err(Error::Execution(ExecError::Cancelled))
        );
        // Exactly one terminal callback: a second receive finds nothing.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        harness.executor.stop().unwrap();
    }
}
