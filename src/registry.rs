//! Clients for the biobank registry. The reconciliation layer is written
//! against [`RegistryClient`]; the REST and GraphQL transports share that
//! contract, and [`MockRegistryClient`] stands in for dry runs.

use std::sync::Mutex;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use tracing::debug;

use crate::collection::{Biobank, Collection};
use crate::error::SyncError;
use crate::star::FactRecord;

/// Result of a registry write. `NotFound` means the targeted resource path
/// does not exist (country-scoped endpoint absent), which callers treat as
/// a fallback signal rather than a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    NotFound,
    Rejected(String),
}

/// Capability surface of the registry.
///
/// Scoped operations take `country: Option<&str>`; `None` targets the
/// country-agnostic path. `next_fact_id_page` always serves the first page
/// of the collection's remaining facts: callers delete that page and
/// re-request until it comes back empty. It returns `Ok(None)` when the
/// endpoint is absent and `Ok(Some(vec![]))` when no facts remain.
pub trait RegistryClient: Send + Sync {
    fn login(&self) -> Result<bool, SyncError>;
    fn fetch_biobank(&self, id: &str) -> Result<Option<Biobank>, SyncError>;
    fn fetch_collections(&self, ids: &[String]) -> Result<Vec<Collection>, SyncError>;
    fn submit_collections(&self, collections: &[Collection]) -> Result<PushOutcome, SyncError>;
    fn submit_fact_block(
        &self,
        country: Option<&str>,
        records: &[FactRecord],
    ) -> Result<PushOutcome, SyncError>;
    fn next_fact_id_page(
        &self,
        country: Option<&str>,
        collection_id: &str,
    ) -> Result<Option<Vec<String>>, SyncError>;
    fn delete_facts(&self, country: Option<&str>, fact_ids: &[String])
    -> Result<PushOutcome, SyncError>;
    fn is_valid_diagnosis_code(&self, code: &str) -> Result<bool, SyncError>;
}

/// Page size requested from the fact-id listing endpoint.
const FACT_PAGE_SIZE: usize = 1000;

fn default_headers() -> Result<HeaderMap, SyncError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("registry-sync/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| SyncError::RegistryHttp(err.to_string()))?,
    );
    Ok(headers)
}

fn build_client() -> Result<Client, SyncError> {
    Client::builder()
        .default_headers(default_headers()?)
        .timeout(Duration::from_secs(60))
        .build()
        .map_err(|err| SyncError::RegistryHttp(err.to_string()))
}

fn status_error(response: reqwest::blocking::Response) -> SyncError {
    let status = response.status().as_u16();
    let message = response
        .text()
        .unwrap_or_else(|_| "registry request failed".to_string());
    SyncError::RegistryStatus { status, message }
}

/// REST transport against the registry's v1 API.
pub struct RestRegistryClient {
    client: Client,
    base_url: String,
    username: String,
    password: String,
    token: Mutex<Option<String>>,
}

impl RestRegistryClient {
    pub fn new(base_url: &str, username: &str, password: &str) -> Result<Self, SyncError> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            token: Mutex::new(None),
        })
    }

    fn facts_url(&self, country: Option<&str>) -> String {
        match country {
            Some(code) => format!("{}/api/v1/eric/{}/facts", self.base_url, code),
            None => format!("{}/api/v1/eric/facts", self.base_url),
        }
    }

    fn authed(&self, request: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        let token = self.token.lock().expect("token lock").clone();
        match token {
            Some(token) => request.header("x-molgenis-token", token),
            None => request,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct FactIdPage {
    #[serde(default)]
    items: Vec<FactIdItem>,
}

#[derive(Debug, Deserialize)]
struct FactIdItem {
    id: String,
}

impl RegistryClient for RestRegistryClient {
    fn login(&self) -> Result<bool, SyncError> {
        let url = format!("{}/api/v1/login", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "username": self.username,
                "password": self.password,
            }))
            .send()
            .map_err(|err| SyncError::RegistryHttp(err.to_string()))?;
        if response.status() == StatusCode::UNAUTHORIZED || response.status() == StatusCode::FORBIDDEN
        {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(status_error(response));
        }
        let body: LoginResponse = response
            .json()
            .map_err(|err| SyncError::RegistryHttp(err.to_string()))?;
        *self.token.lock().expect("token lock") = Some(body.token);
        Ok(true)
    }

    fn fetch_biobank(&self, id: &str) -> Result<Option<Biobank>, SyncError> {
        let url = format!("{}/api/v1/eric/biobanks/{}", self.base_url, id);
        let response = self
            .authed(self.client.get(&url))
            .send()
            .map_err(|err| SyncError::RegistryHttp(err.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(response));
        }
        let biobank: Biobank = response
            .json()
            .map_err(|err| SyncError::RegistryHttp(err.to_string()))?;
        Ok(Some(biobank))
    }

    fn fetch_collections(&self, ids: &[String]) -> Result<Vec<Collection>, SyncError> {
        let mut collections = Vec::new();
        for id in ids {
            let url = format!("{}/api/v1/eric/collections/{}", self.base_url, id);
            let response = self
                .authed(self.client.get(&url))
                .send()
                .map_err(|err| SyncError::RegistryHttp(err.to_string()))?;
            if response.status() == StatusCode::NOT_FOUND {
                continue;
            }
            if !response.status().is_success() {
                return Err(status_error(response));
            }
            let collection: Collection = response
                .json()
                .map_err(|err| SyncError::RegistryHttp(err.to_string()))?;
            collections.push(collection);
        }
        Ok(collections)
    }

    fn submit_collections(&self, collections: &[Collection]) -> Result<PushOutcome, SyncError> {
        let url = format!("{}/api/v1/eric/collections", self.base_url);
        let response = self
            .authed(self.client.put(&url))
            .json(&serde_json::json!({ "entities": collections }))
            .send()
            .map_err(|err| SyncError::RegistryHttp(err.to_string()))?;
        if response.status().is_success() {
            return Ok(PushOutcome::Accepted);
        }
        let status = response.status().as_u16();
        let message = response.text().unwrap_or_default();
        Ok(PushOutcome::Rejected(format!("status {status}: {message}")))
    }

    fn submit_fact_block(
        &self,
        country: Option<&str>,
        records: &[FactRecord],
    ) -> Result<PushOutcome, SyncError> {
        let url = self.facts_url(country);
        let response = self
            .authed(self.client.put(&url))
            .json(&serde_json::json!({ "facts": records }))
            .send()
            .map_err(|err| SyncError::RegistryHttp(err.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(PushOutcome::NotFound);
        }
        if response.status().is_success() {
            return Ok(PushOutcome::Accepted);
        }
        let status = response.status().as_u16();
        let message = response.text().unwrap_or_default();
        Ok(PushOutcome::Rejected(format!("status {status}: {message}")))
    }

    fn next_fact_id_page(
        &self,
        country: Option<&str>,
        collection_id: &str,
    ) -> Result<Option<Vec<String>>, SyncError> {
        let url = self.facts_url(country);
        let response = self
            .authed(self.client.get(&url))
            .query(&[
                ("collectionId", collection_id),
                ("pageSize", &FACT_PAGE_SIZE.to_string()),
            ])
            .send()
            .map_err(|err| SyncError::RegistryHttp(err.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(response));
        }
        let page: FactIdPage = response
            .json()
            .map_err(|err| SyncError::RegistryHttp(err.to_string()))?;
        Ok(Some(page.items.into_iter().map(|item| item.id).collect()))
    }

    fn delete_facts(
        &self,
        country: Option<&str>,
        fact_ids: &[String],
    ) -> Result<PushOutcome, SyncError> {
        let url = self.facts_url(country);
        let response = self
            .authed(self.client.delete(&url))
            .json(&serde_json::json!({ "ids": fact_ids }))
            .send()
            .map_err(|err| SyncError::RegistryHttp(err.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(PushOutcome::NotFound);
        }
        if response.status().is_success() {
            return Ok(PushOutcome::Accepted);
        }
        let status = response.status().as_u16();
        let message = response.text().unwrap_or_default();
        Ok(PushOutcome::Rejected(format!("status {status}: {message}")))
    }

    fn is_valid_diagnosis_code(&self, code: &str) -> Result<bool, SyncError> {
        let url = format!("{}/api/v1/eric/diseaseTypes/{}", self.base_url, code);
        let response = self
            .authed(self.client.get(&url))
            .send()
            .map_err(|err| SyncError::RegistryHttp(err.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(status_error(response));
        }
        Ok(true)
    }
}

/// GraphQL transport. Same contract as the REST client; only the payload
/// construction differs.
pub struct GraphqlRegistryClient {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

impl GraphqlRegistryClient {
    pub fn new(base_url: &str, username: &str, password: &str) -> Result<Self, SyncError> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    fn graphql_url(&self, country: Option<&str>) -> String {
        match country {
            Some(code) => format!("{}/{}/directory/graphql", self.base_url, code),
            None => format!("{}/directory/graphql", self.base_url),
        }
    }

    /// Executes one GraphQL request. `Ok(None)` signals an absent schema
    /// path (the country-scoped database does not exist), which maps onto
    /// the same fallback semantics as a REST 404.
    fn execute(
        &self,
        country: Option<&str>,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<Option<serde_json::Value>, SyncError> {
        let response = self
            .client
            .post(self.graphql_url(country))
            .json(&serde_json::json!({ "query": query, "variables": variables }))
            .send()
            .map_err(|err| SyncError::RegistryHttp(err.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(response));
        }
        let body: serde_json::Value = response
            .json()
            .map_err(|err| SyncError::RegistryHttp(err.to_string()))?;
        if let Some(errors) = body.get("errors").and_then(|errors| errors.as_array()) {
            if !errors.is_empty() {
                let message = errors[0]
                    .get("message")
                    .and_then(|message| message.as_str())
                    .unwrap_or("GraphQL error");
                if message.contains("Unknown schema") || message.contains("not found") {
                    return Ok(None);
                }
                return Err(SyncError::RegistryHttp(message.to_string()));
            }
        }
        Ok(body.get("data").cloned())
    }

    fn mutate(
        &self,
        country: Option<&str>,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<PushOutcome, SyncError> {
        match self.execute(country, query, variables) {
            Ok(Some(_)) => Ok(PushOutcome::Accepted),
            Ok(None) => Ok(PushOutcome::NotFound),
            Err(SyncError::RegistryStatus { status, message }) if status < 500 => {
                Ok(PushOutcome::Rejected(format!("status {status}: {message}")))
            }
            Err(err) => Err(err),
        }
    }
}

const SIGNIN_MUTATION: &str =
    "mutation($email: String!, $password: String!) { signin(email: $email, password: $password) { status } }";
const BIOBANK_QUERY: &str =
    "query($id: String!) { Biobanks(filter: { id: { equals: [$id] } }) { id name country { name } } }";
const COLLECTION_QUERY: &str =
    "query($id: String!) { Collections(filter: { id: { equals: [$id] } }) { id name size number_of_donors } }";
const COLLECTION_MUTATION: &str = "mutation($entities: [CollectionsInput]) { save(Collections: $entities) { message } }";
const FACT_MUTATION: &str = "mutation($facts: [CollectionFactsInput]) { save(CollectionFacts: $facts) { message } }";
const FACT_ID_QUERY: &str = "query($collectionId: String!, $limit: Int!) { CollectionFacts(filter: { collection: { id: { equals: [$collectionId] } } }, limit: $limit) { id } }";
const FACT_DELETE_MUTATION: &str =
    "mutation($ids: [String]) { delete(CollectionFacts: $ids) { message } }";
const DISEASE_QUERY: &str =
    "query($code: String!) { DiseaseTypes(filter: { name: { equals: [$code] } }) { name } }";

impl RegistryClient for GraphqlRegistryClient {
    fn login(&self) -> Result<bool, SyncError> {
        let data = self.execute(
            None,
            SIGNIN_MUTATION,
            serde_json::json!({ "email": self.username, "password": self.password }),
        )?;
        let status = data
            .as_ref()
            .and_then(|data| data.pointer("/signin/status"))
            .and_then(|status| status.as_str())
            .unwrap_or("FAILED");
        Ok(status == "SUCCESS")
    }

    fn fetch_biobank(&self, id: &str) -> Result<Option<Biobank>, SyncError> {
        let data = self.execute(None, BIOBANK_QUERY, serde_json::json!({ "id": id }))?;
        let Some(entry) = data
            .as_ref()
            .and_then(|data| data.pointer("/Biobanks/0"))
            .cloned()
        else {
            return Ok(None);
        };
        let biobank = Biobank {
            id: entry
                .get("id")
                .and_then(|id| id.as_str())
                .unwrap_or(id)
                .to_string(),
            name: entry
                .get("name")
                .and_then(|name| name.as_str())
                .map(str::to_string),
            country: entry
                .pointer("/country/name")
                .and_then(|name| name.as_str())
                .map(str::to_string),
        };
        Ok(Some(biobank))
    }

    fn fetch_collections(&self, ids: &[String]) -> Result<Vec<Collection>, SyncError> {
        let mut collections = Vec::new();
        for id in ids {
            let data = self.execute(None, COLLECTION_QUERY, serde_json::json!({ "id": id }))?;
            let Some(entry) = data.as_ref().and_then(|data| data.pointer("/Collections/0"))
            else {
                continue;
            };
            let mut collection = Collection::new(id);
            collection.name = entry
                .get("name")
                .and_then(|name| name.as_str())
                .map(str::to_string);
            collection.set_size(entry.get("size").and_then(|size| size.as_u64()).unwrap_or(0));
            collection.set_number_of_donors(
                entry
                    .get("number_of_donors")
                    .and_then(|donors| donors.as_u64())
                    .unwrap_or(0),
            );
            collections.push(collection);
        }
        Ok(collections)
    }

    fn submit_collections(&self, collections: &[Collection]) -> Result<PushOutcome, SyncError> {
        self.mutate(
            None,
            COLLECTION_MUTATION,
            serde_json::json!({ "entities": collections }),
        )
    }

    fn submit_fact_block(
        &self,
        country: Option<&str>,
        records: &[FactRecord],
    ) -> Result<PushOutcome, SyncError> {
        self.mutate(country, FACT_MUTATION, serde_json::json!({ "facts": records }))
    }

    fn next_fact_id_page(
        &self,
        country: Option<&str>,
        collection_id: &str,
    ) -> Result<Option<Vec<String>>, SyncError> {
        let data = self.execute(
            country,
            FACT_ID_QUERY,
            serde_json::json!({
                "collectionId": collection_id,
                "limit": FACT_PAGE_SIZE,
            }),
        )?;
        let Some(data) = data else {
            return Ok(None);
        };
        let ids: Vec<String> = data
            .pointer("/CollectionFacts")
            .and_then(|facts| facts.as_array())
            .map(|facts| {
                facts
                    .iter()
                    .filter_map(|fact| fact.get("id"))
                    .filter_map(|id| id.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Some(ids))
    }

    fn delete_facts(
        &self,
        country: Option<&str>,
        fact_ids: &[String],
    ) -> Result<PushOutcome, SyncError> {
        self.mutate(
            country,
            FACT_DELETE_MUTATION,
            serde_json::json!({ "ids": fact_ids }),
        )
    }

    fn is_valid_diagnosis_code(&self, code: &str) -> Result<bool, SyncError> {
        let data = self.execute(None, DISEASE_QUERY, serde_json::json!({ "code": code }))?;
        Ok(data
            .as_ref()
            .and_then(|data| data.pointer("/DiseaseTypes/0"))
            .is_some())
    }
}

/// Dry-run stand-in: accepts every write without touching the network and
/// treats every diagnosis code as valid, so aggregation still runs end to
/// end.
#[derive(Debug, Default)]
pub struct MockRegistryClient;

impl RegistryClient for MockRegistryClient {
    fn login(&self) -> Result<bool, SyncError> {
        Ok(true)
    }

    fn fetch_biobank(&self, id: &str) -> Result<Option<Biobank>, SyncError> {
        debug!(id, "mock registry: fetch_biobank");
        Ok(Some(Biobank {
            id: id.to_string(),
            name: Some("mock biobank".to_string()),
            country: None,
        }))
    }

    fn fetch_collections(&self, ids: &[String]) -> Result<Vec<Collection>, SyncError> {
        Ok(ids.iter().map(|id| Collection::new(id)).collect())
    }

    fn submit_collections(&self, collections: &[Collection]) -> Result<PushOutcome, SyncError> {
        debug!(count = collections.len(), "mock registry: submit_collections");
        Ok(PushOutcome::Accepted)
    }

    fn submit_fact_block(
        &self,
        country: Option<&str>,
        records: &[FactRecord],
    ) -> Result<PushOutcome, SyncError> {
        debug!(?country, count = records.len(), "mock registry: submit_fact_block");
        Ok(PushOutcome::Accepted)
    }

    fn next_fact_id_page(
        &self,
        _country: Option<&str>,
        _collection_id: &str,
    ) -> Result<Option<Vec<String>>, SyncError> {
        Ok(Some(Vec::new()))
    }

    fn delete_facts(
        &self,
        _country: Option<&str>,
        fact_ids: &[String],
    ) -> Result<PushOutcome, SyncError> {
        debug!(count = fact_ids.len(), "mock registry: delete_facts");
        Ok(PushOutcome::Accepted)
    }

    fn is_valid_diagnosis_code(&self, _code: &str) -> Result<bool, SyncError> {
        Ok(true)
    }
}
