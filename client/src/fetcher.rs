//! Per-endpoint retrieval of encrypted key splits.

use crate::{
    Context, EncryptionKey, EncryptionKeyType, Error, FetchRequest, FetchSelector, HttpClient,
    HttpRequest, HttpResponse, KeyData, SessionToken, SplitFetcher, TokenProvider, TokenRequest,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use serde::Deserialize;
use splitkey_executor::{AsyncContext, Attempt, Outcome};
use splitkey_utils::from_epoch_millis;
use std::{sync::Arc, time::SystemTime};
use tracing::debug;

/// Fetches encrypted key splits over HTTP, one custodian at a time.
///
/// Every attempt is two asynchronous hops: a signing token is issued for the
/// endpoint's cloud identity, then the signed GET is performed and its body
/// parsed into zero-or-more [EncryptionKey]s. The retry dispatcher re-runs
/// the whole sequence, so a stale token never survives into a retry.
pub struct HttpSplitFetcher<H: HttpClient, T: TokenProvider> {
    http: Arc<H>,
    tokens: Arc<T>,
}

impl<H: HttpClient, T: TokenProvider> HttpSplitFetcher<H, T> {
    pub fn new(http: Arc<H>, tokens: Arc<T>) -> Self {
        Self { http, tokens }
    }
}

impl<H: HttpClient, T: TokenProvider> SplitFetcher for HttpSplitFetcher<H, T> {
    fn fetch(
        &self,
        context: Context<FetchRequest, Vec<EncryptionKey>>,
        attempt: Attempt<FetchRequest, Vec<EncryptionKey>, Error>,
    ) {
        let request = context.request();
        let token_request = TokenRequest {
            endpoint_uri: request.endpoint.uri.clone(),
            identity: request.endpoint.identity.clone(),
        };
        let http = self.http.clone();
        let fetch_context = context.clone();
        let token_context: Context<TokenRequest, SessionToken> = AsyncContext::with_options(
            Arc::new(token_request),
            context.expiration(),
            Some(context.activity_id()),
            Box::new(move |token_cx| match token_cx.result() {
                Some(Ok(())) => match token_cx.take_response() {
                    Some(token) => perform_signed(http, fetch_context, token, attempt),
                    None => attempt.complete(Outcome::Failure(Error::Token(
                        "provider returned no token".into(),
                    ))),
                },
                Some(Err(error)) => attempt.complete(error.into_outcome()),
                None => attempt.complete(Outcome::Failure(Error::Token(
                    "token context finished without a result".into(),
                ))),
            }),
        );
        self.tokens.issue(token_context);
    }
}

fn perform_signed<H: HttpClient>(
    http: Arc<H>,
    context: Context<FetchRequest, Vec<EncryptionKey>>,
    token: SessionToken,
    attempt: Attempt<FetchRequest, Vec<EncryptionKey>, Error>,
) {
    let request = context.request();
    let http_request = build_request(&request, &token);
    let single = matches!(request.selector, FetchSelector::ById(_));
    let fetch_context = context.clone();
    let http_context: Context<HttpRequest, HttpResponse> = AsyncContext::with_options(
        Arc::new(http_request),
        context.expiration(),
        Some(context.activity_id()),
        Box::new(move |http_cx| match http_cx.result() {
            Some(Ok(())) => {
                let Some(response) = http_cx.take_response() else {
                    attempt.complete(Outcome::Failure(Error::Transport(
                        "client returned no response".into(),
                    )));
                    return;
                };
                if !(200..300).contains(&response.status) {
                    attempt.complete(Error::HttpStatus(response.status).into_outcome());
                    return;
                }
                match parse_keys(&response.body, single) {
                    Ok(keys) => {
                        let request = fetch_context.request();
                        debug!(
                            endpoint = %request.endpoint.uri,
                            keys = keys.len(),
                            "fetched encryption keys"
                        );
                        fetch_context.set_response(keys);
                        attempt.complete(Outcome::Success);
                    }
                    // Malformed responses are never retried.
                    Err(error) => attempt.complete(Outcome::Failure(error)),
                }
            }
            Some(Err(error)) => attempt.complete(error.into_outcome()),
            None => attempt.complete(Outcome::Failure(Error::Transport(
                "http context finished without a result".into(),
            ))),
        }),
    );
    http.perform(http_context);
}

fn build_request(request: &FetchRequest, token: &SessionToken) -> HttpRequest {
    let base = request.endpoint.uri.trim_end_matches('/');
    let set = &request.key_set_name;
    let uri = match &request.selector {
        FetchSelector::ById(id) => {
            format!("{base}/v1/keySets/{set}/encryptionKeys/{id}")
        }
        FetchSelector::MaxAge(age) => format!(
            "{base}/v1/keySets/{set}/encryptionKeys:recent?maxAgeSeconds={}",
            age.as_secs()
        ),
        FetchSelector::Active => format!("{base}/v1/keySets/{set}/activeKeys"),
    };
    HttpRequest {
        method: "GET".into(),
        uri,
        headers: vec![("Authorization".into(), format!("Bearer {}", token.bearer))],
        body: Bytes::new(),
    }
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WireKeyList {
    keys: Vec<WireKey>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WireKey {
    name: Option<String>,
    encryption_key_type: Option<String>,
    public_keyset_handle: Option<String>,
    creation_time: Option<String>,
    activation_time: Option<String>,
    expiration_time: Option<String>,
    key_data: Vec<WireKeyData>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WireKeyData {
    public_key_signature: Option<String>,
    key_encryption_key_uri: Option<String>,
    key_material: Option<String>,
}

/// Parse a custodian response body. The list endpoints wrap records in a
/// `keys` array; the single-key endpoint returns the bare record.
pub(crate) fn parse_keys(body: &[u8], single: bool) -> Result<Vec<EncryptionKey>, Error> {
    if single {
        let wire: WireKey =
            serde_json::from_slice(body).map_err(|err| Error::MalformedBody(err.to_string()))?;
        Ok(vec![convert_key(wire)?])
    } else {
        let wire: WireKeyList =
            serde_json::from_slice(body).map_err(|err| Error::MalformedBody(err.to_string()))?;
        wire.keys.into_iter().map(convert_key).collect()
    }
}

fn convert_key(wire: WireKey) -> Result<EncryptionKey, Error> {
    let name = wire
        .name
        .filter(|name| !name.is_empty())
        .ok_or(Error::MissingResourceName)?;
    let id = name
        .rsplit_once("encryptionKeys/")
        .map(|(_, id)| id.to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::InvalidResourceName(name.clone()))?;
    let key_type = match wire.encryption_key_type.as_deref() {
        Some("SINGLE_PARTY_HYBRID_KEY") => EncryptionKeyType::SingleParty,
        Some("MULTI_PARTY_HYBRID_EVEN_KEYSPLIT") => EncryptionKeyType::MultiPartyEvenSplit,
        other => return Err(Error::UnknownKeyType(other.unwrap_or("<missing>").into())),
    };
    let creation = parse_timestamp(wire.creation_time.as_deref(), "creation")?;
    let activation = parse_timestamp(wire.activation_time.as_deref(), "activation")?;
    let expiration = parse_timestamp(wire.expiration_time.as_deref(), "expiration")?;
    let public_keyset = match wire.public_keyset_handle {
        Some(handle) if !handle.is_empty() => {
            serde_json::from_str::<serde_json::Value>(&handle)
                .map_err(|err| Error::MalformedPublicKeyset(err.to_string()))?;
            Some(handle)
        }
        _ => None,
    };
    if wire.key_data.is_empty() {
        return Err(Error::MissingKeyData);
    }
    let mut key_data = Vec::with_capacity(wire.key_data.len());
    let mut own_splits = 0;
    for data in wire.key_data {
        let material = match data.key_material.as_deref() {
            Some(material) if !material.is_empty() => {
                if data
                    .key_encryption_key_uri
                    .as_deref()
                    .unwrap_or_default()
                    .is_empty()
                {
                    return Err(Error::MissingKeyEncryptionKeyUri);
                }
                own_splits += 1;
                Bytes::from(
                    BASE64
                        .decode(material.as_bytes())
                        .map_err(|err| Error::InvalidKeyMaterial(err.to_string()))?,
                )
            }
            _ => Bytes::new(),
        };
        key_data.push(KeyData {
            key_encryption_key_uri: data.key_encryption_key_uri.unwrap_or_default(),
            key_material: material,
            public_key_signature: data.public_key_signature.unwrap_or_default(),
        });
    }
    // The custodian must hold at least its own split.
    if own_splits == 0 {
        return Err(Error::MissingKeyData);
    }
    Ok(EncryptionKey {
        id,
        name,
        key_type,
        key_data,
        public_keyset,
        creation,
        activation,
        expiration,
    })
}

fn parse_timestamp(value: Option<&str>, field: &'static str) -> Result<SystemTime, Error> {
    value
        .and_then(|value| value.parse::<u64>().ok())
        .map(from_epoch_millis)
        .ok_or(Error::InvalidTimestamp(field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mocks::{MockHttpClient, MockTokenProvider},
        CloudIdentity, KeyEndpoint,
    };
    use serde_json::json;
    use splitkey_executor::{Config, Executor, Operation, RetryDispatcher, RetryStrategy};
    use std::{sync::mpsc, time::Duration};

    fn wire_key(id: &str, materials: &[Option<&str>]) -> serde_json::Value {
        json!({
            "name": format!("keySets/main/encryptionKeys/{id}"),
            "encryptionKeyType": "MULTI_PARTY_HYBRID_EVEN_KEYSPLIT",
            "creationTime": "1700000000000",
            "activationTime": "1700000000000",
            "expirationTime": "1800000000000",
            "keyData": materials
                .iter()
                .enumerate()
                .map(|(index, material)| match material {
                    Some(material) => json!({
                        "keyEncryptionKeyUri": format!("gcp-kms://kek/{index}"),
                        "keyMaterial": BASE64.encode(material.as_bytes()),
                        "publicKeySignature": "sig",
                    }),
                    None => json!({ "publicKeySignature": "sig" }),
                })
                .collect::<Vec<_>>(),
        })
    }

    #[test]
    fn test_parse_list_body() {
        let body = json!({ "keys": [wire_key("k1", &[Some("abc"), None, None])] }).to_string();
        let keys = parse_keys(body.as_bytes(), false).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].id, "k1");
        assert_eq!(keys[0].key_type, EncryptionKeyType::MultiPartyEvenSplit);
        assert_eq!(keys[0].key_data.len(), 3);
        assert_eq!(keys[0].key_data[0].key_material, Bytes::from("abc"));
        assert!(keys[0].key_data[1].key_material.is_empty());
    }

    #[test]
    fn test_parse_single_body() {
        let body = wire_key("k9", &[Some("xyz")]).to_string();
        let keys = parse_keys(body.as_bytes(), true).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].id, "k9");
    }

    #[test]
    fn test_parse_empty_list() {
        assert!(parse_keys(b"{}", false).unwrap().is_empty());
        assert!(parse_keys(br#"{"keys": []}"#, false).unwrap().is_empty());
    }

    #[test]
    fn test_parse_error_kinds() {
        // Not JSON at all.
        assert!(matches!(
            parse_keys(b"not-json", false),
            Err(Error::MalformedBody(_))
        ));

        // Missing resource name.
        let mut wire = wire_key("k1", &[Some("abc")]);
        wire.as_object_mut().unwrap().remove("name");
        assert_eq!(
            parse_keys(wire.to_string().as_bytes(), true),
            Err(Error::MissingResourceName)
        );

        // Resource name without a key id.
        let mut wire = wire_key("k1", &[Some("abc")]);
        wire["name"] = json!("keySets/main");
        assert!(matches!(
            parse_keys(wire.to_string().as_bytes(), true),
            Err(Error::InvalidResourceName(_))
        ));

        // Unknown key type.
        let mut wire = wire_key("k1", &[Some("abc")]);
        wire["encryptionKeyType"] = json!("TRIPLE_PARTY");
        assert_eq!(
            parse_keys(wire.to_string().as_bytes(), true),
            Err(Error::UnknownKeyType("TRIPLE_PARTY".into()))
        );

        // Invalid timestamp.
        let mut wire = wire_key("k1", &[Some("abc")]);
        wire["activationTime"] = json!("yesterday");
        assert_eq!(
            parse_keys(wire.to_string().as_bytes(), true),
            Err(Error::InvalidTimestamp("activation"))
        );

        // No key data at all.
        let mut wire = wire_key("k1", &[]);
        wire["keyData"] = json!([]);
        assert_eq!(
            parse_keys(wire.to_string().as_bytes(), true),
            Err(Error::MissingKeyData)
        );

        // Material present but no wrapping KEK.
        let mut wire = wire_key("k1", &[Some("abc")]);
        wire["keyData"][0].as_object_mut().unwrap().remove("keyEncryptionKeyUri");
        assert_eq!(
            parse_keys(wire.to_string().as_bytes(), true),
            Err(Error::MissingKeyEncryptionKeyUri)
        );

        // Material that is not base64.
        let mut wire = wire_key("k1", &[Some("abc")]);
        wire["keyData"][0]["keyMaterial"] = json!("!!!");
        assert!(matches!(
            parse_keys(wire.to_string().as_bytes(), true),
            Err(Error::InvalidKeyMaterial(_))
        ));

        // Public keyset that is not JSON.
        let mut wire = wire_key("k1", &[Some("abc")]);
        wire["publicKeysetHandle"] = json!("{broken");
        assert!(matches!(
            parse_keys(wire.to_string().as_bytes(), true),
            Err(Error::MalformedPublicKeyset(_))
        ));
    }

    fn endpoint() -> KeyEndpoint {
        KeyEndpoint {
            uri: "https://custodian-a.example.com".into(),
            identity: CloudIdentity::Gcp {
                workload_identity_pool: "pool".into(),
                service_account: "sa@example.com".into(),
            },
        }
    }

    fn fetch_request(selector: FetchSelector) -> FetchRequest {
        FetchRequest {
            endpoint: endpoint(),
            selector,
            key_set_name: "main".into(),
        }
    }

    fn run_fetch(
        http: Arc<MockHttpClient>,
        tokens: Arc<MockTokenProvider>,
        request: FetchRequest,
    ) -> (Result<(), Error>, Option<Vec<EncryptionKey>>) {
        let executor = Executor::new(Config {
            workers: 2,
            queue_capacity: 64,
            drain_on_stop: true,
        });
        executor.start().unwrap();
        let dispatcher = RetryDispatcher::new(
            executor.clone(),
            RetryStrategy::Fixed {
                delay: Duration::from_millis(5),
                max_retries: 2,
            },
        );
        let fetcher = Arc::new(HttpSplitFetcher::new(http, tokens));

        let (tx, rx) = mpsc::channel();
        let context: Context<FetchRequest, Vec<EncryptionKey>> = AsyncContext::new(
            request,
            Box::new(move |cx| {
                tx.send((cx.result().unwrap(), cx.take_response())).unwrap();
            }),
        );
        let op: Operation<FetchRequest, Vec<EncryptionKey>, Error> =
            Arc::new(move |cx, attempt| fetcher.fetch(cx, attempt));
        dispatcher.dispatch(context, op);

        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        executor.stop().unwrap();
        outcome
    }

    #[test]
    fn test_fetch_signs_and_parses() {
        let http = MockHttpClient::new();
        let tokens = MockTokenProvider::new();
        let body = json!({ "keys": [wire_key("k1", &[Some("s0"), None])] }).to_string();
        http.script(
            "encryptionKeys:recent",
            Ok(HttpResponse {
                status: 200,
                body: Bytes::from(body),
            }),
        );

        let (result, keys) = run_fetch(
            http.clone(),
            tokens,
            fetch_request(FetchSelector::MaxAge(Duration::from_secs(3600))),
        );
        assert_eq!(result, Ok(()));
        assert_eq!(keys.unwrap()[0].id, "k1");

        // The request carried the issued bearer token.
        let performed = http.performed();
        assert_eq!(performed.len(), 1);
        assert!(performed[0]
            .headers
            .iter()
            .any(|(name, value)| name == "Authorization" && value.starts_with("Bearer ")));
        assert!(performed[0].uri.contains("maxAgeSeconds=3600"));
    }

    #[test]
    fn test_fetch_retries_server_errors() {
        let http = MockHttpClient::new();
        let tokens = MockTokenProvider::new();
        let body = wire_key("k1", &[Some("s0")]).to_string();
        http.script(
            "encryptionKeys/k1",
            Ok(HttpResponse {
                status: 503,
                body: Bytes::new(),
            }),
        );
        http.script(
            "encryptionKeys/k1",
            Ok(HttpResponse {
                status: 200,
                body: Bytes::from(body),
            }),
        );

        let (result, keys) = run_fetch(
            http.clone(),
            tokens,
            fetch_request(FetchSelector::ById("k1".into())),
        );
        assert_eq!(result, Ok(()));
        assert_eq!(keys.unwrap().len(), 1);
        assert_eq!(http.performed().len(), 2);
    }

    #[test]
    fn test_fetch_does_not_retry_client_errors() {
        let http = MockHttpClient::new();
        let tokens = MockTokenProvider::new();
        http.script(
            "activeKeys",
            Ok(HttpResponse {
                status: 403,
                body: Bytes::new(),
            }),
        );

        let (result, _) = run_fetch(http.clone(), tokens, fetch_request(FetchSelector::Active));
        assert_eq!(result, Err(Error::HttpStatus(403)));
        assert_eq!(http.performed().len(), 1);
    }

    #[test]
    fn test_token_failure_propagates() {
        let http = MockHttpClient::new();
        let tokens = MockTokenProvider::new();
        tokens.fail_with(Error::Token("identity pool rejected caller".into()));

        let (result, _) = run_fetch(http.clone(), tokens, fetch_request(FetchSelector::Active));
        assert_eq!(
            result,
            Err(Error::Token("identity pool rejected caller".into()))
        );
        assert!(http.performed().is_empty());
    }
}
