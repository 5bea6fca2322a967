//! Remote catalog client for the Omie API.
//!
//! Every resource kind is reached through a list call (paginated) and, for
//! some kinds, a single-record lookup call. Pagination termination differs per
//! kind and is described by [`PagePolicy`]; callers drive scans through
//! [`CatalogClient::scan`] and decide when to stop early.

use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use omsync_core::{ApiEnvelope, Credentials, RefCode, SalesOrder, ServiceOrder};
use omsync_storage::{ApiTransport, RawResponse, RetryDisposition, TransportError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};

mod fixtures;

pub use fixtures::{fault_response, json_response, list_page, FixtureRequest, FixtureTransport};

pub const CRATE_NAME: &str = "omsync-catalog";

pub const DEFAULT_API_BASE: &str = "https://app.omie.com.br/api/v1";

pub type Filters = JsonMap<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    ServiceOrders,
    SalesOrders,
    Clients,
    Projects,
    Salespeople,
}

/// List call, the key of the record array in its response, and page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListCall {
    pub call: &'static str,
    pub key: &'static str,
    pub page_size: u32,
}

/// Single-record lookup call and the parameter carrying the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupCall {
    pub call: &'static str,
    pub param: &'static str,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServiceOrders => "service_orders",
            Self::SalesOrders => "sales_orders",
            Self::Clients => "clients",
            Self::Projects => "projects",
            Self::Salespeople => "salespeople",
        }
    }

    pub fn endpoint(self) -> &'static str {
        match self {
            Self::ServiceOrders => "servicos/os/",
            Self::SalesOrders => "produtos/pedido/",
            Self::Clients => "geral/clientes/",
            Self::Projects => "geral/projetos/",
            Self::Salespeople => "geral/vendedores/",
        }
    }

    /// Paginated list call. Projects are only ever looked up one by one.
    pub fn list(self) -> Option<ListCall> {
        let (call, key, page_size) = match self {
            Self::ServiceOrders => ("ListarOS", "osCadastro", 500),
            Self::SalesOrders => ("ListarPedidos", "pedido_venda_produto", 500),
            Self::Clients => ("ListarClientes", "clientes_cadastro", 500),
            Self::Salespeople => ("ListarVendedores", "cadastro", 50),
            Self::Projects => return None,
        };
        Some(ListCall { call, key, page_size })
    }

    pub fn lookup(self) -> Option<LookupCall> {
        match self {
            Self::Projects => Some(LookupCall {
                call: "ConsultarProjeto",
                param: "codigo",
            }),
            _ => None,
        }
    }

    /// Field holding the record's own code in list responses.
    pub fn code_field(self) -> &'static str {
        match self {
            Self::Clients => "codigo_cliente_omie",
            _ => "codigo",
        }
    }

    /// Name fields tried in order when turning a record into a display name.
    pub fn name_fields(self) -> &'static [&'static str] {
        match self {
            Self::Clients => &["nome_fantasia"],
            _ => &["nome", "nome_fantasia"],
        }
    }

    pub fn default_filters(self) -> Filters {
        let mut filters = Filters::new();
        if matches!(self, Self::ServiceOrders | Self::SalesOrders) {
            filters.insert("apenas_importado_api".to_string(), JsonValue::from("N"));
        }
        filters
    }

    /// Termination rule for list scans.
    ///
    /// The service-order cap of 10 pages is a safety bound against runaway
    /// scans, not a property of the API: with 500 records per page, anything
    /// past 5000 orders is silently left out.
    pub fn page_policy(self) -> PagePolicy {
        match self {
            Self::ServiceOrders => PagePolicy {
                max_pages: Some(10),
                stop_on_short_page: false,
            },
            Self::SalesOrders | Self::Projects => PagePolicy::default(),
            Self::Clients => PagePolicy {
                max_pages: None,
                stop_on_short_page: true,
            },
            Self::Salespeople => PagePolicy {
                max_pages: Some(20),
                stop_on_short_page: false,
            },
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every scan stops on an empty page; these add further stop conditions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagePolicy {
    pub max_pages: Option<u32>,
    pub stop_on_short_page: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EmptyPage,
    PageCap,
    ShortPage,
    Satisfied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub pages: u32,
    pub records: usize,
    pub stop: StopReason,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{kind} page {page}: transport failure: {source}")]
    Transport {
        kind: ResourceKind,
        page: u32,
        #[source]
        source: TransportError,
    },
    #[error("{kind} page {page}: undecodable response (HTTP {status}): {detail}")]
    Decode {
        kind: ResourceKind,
        page: u32,
        status: u16,
        detail: String,
    },
    #[error("{kind} page {page} record {index}: {source}")]
    Record {
        kind: ResourceKind,
        page: u32,
        index: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} lookup of {code}: transport failure: {source}")]
    LookupTransport {
        kind: ResourceKind,
        code: RefCode,
        #[source]
        source: TransportError,
    },
    #[error("{kind} lookup of {code}: undecodable response (HTTP {status}): {detail}")]
    LookupDecode {
        kind: ResourceKind,
        code: RefCode,
        status: u16,
        detail: String,
    },
    #[error("{kind} has no single-record lookup call")]
    LookupUnsupported { kind: ResourceKind },
    #[error("{kind} has no list call")]
    ListUnsupported { kind: ResourceKind },
}

impl CatalogError {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Transport { kind, .. }
            | Self::Decode { kind, .. }
            | Self::Record { kind, .. }
            | Self::LookupTransport { kind, .. }
            | Self::LookupDecode { kind, .. }
            | Self::LookupUnsupported { kind }
            | Self::ListUnsupported { kind } => *kind,
        }
    }

    pub fn page(&self) -> Option<u32> {
        match self {
            Self::Transport { page, .. } | Self::Decode { page, .. } | Self::Record { page, .. } => {
                Some(*page)
            }
            _ => None,
        }
    }

    /// Whether retrying the same request could succeed. The client never
    /// retries by itself.
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Transport { source, .. } | Self::LookupTransport { source, .. } => {
                source.disposition()
            }
            Self::Decode { status, .. } | Self::LookupDecode { status, .. } => {
                RawResponse {
                    status: *status,
                    body: Vec::new(),
                }
                .disposition()
            }
            Self::Record { .. }
            | Self::LookupUnsupported { .. }
            | Self::ListUnsupported { .. } => RetryDisposition::NonRetryable,
        }
    }
}

/// Delay inserted between successive requests against rate-sensitive kinds.
#[async_trait]
pub trait RequestPacer: Send + Sync {
    async fn pause(&self, kind: ResourceKind);
}

#[derive(Debug, Clone, Default)]
pub struct FixedPacer {
    delays: HashMap<ResourceKind, Duration>,
}

impl FixedPacer {
    /// Defaults observed to keep clear of the API's rate limits.
    pub fn standard() -> Self {
        Self::default()
            .with_delay(ResourceKind::SalesOrders, Duration::from_millis(300))
            .with_delay(ResourceKind::Clients, Duration::from_millis(1000))
            .with_delay(ResourceKind::Projects, Duration::from_millis(400))
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, kind: ResourceKind, delay: Duration) -> Self {
        self.delays.insert(kind, delay);
        self
    }

    pub fn delay_for(&self, kind: ResourceKind) -> Duration {
        self.delays.get(&kind).copied().unwrap_or_default()
    }
}

#[async_trait]
impl RequestPacer for FixedPacer {
    async fn pause(&self, kind: ResourceKind) {
        let delay = self.delay_for(kind);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Picks the first non-empty name field of a record or lookup response.
pub fn display_name(kind: ResourceKind, record: &JsonValue) -> Option<String> {
    kind.name_fields().iter().find_map(|field| {
        record
            .get(*field)
            .and_then(JsonValue::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

/// Code and (possibly missing) name of a record from a list scan.
pub fn reference_of(kind: ResourceKind, record: &JsonValue) -> Option<(RefCode, Option<String>)> {
    let code = record.get(kind.code_field()).and_then(RefCode::from_json)?;
    Some((code, display_name(kind, record)))
}

pub struct CatalogClient {
    transport: Arc<dyn ApiTransport>,
    pacer: Arc<dyn RequestPacer>,
    credentials: Credentials,
    base_url: String,
    policies: HashMap<ResourceKind, PagePolicy>,
}

impl fmt::Debug for CatalogClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogClient")
            .field("credentials", &self.credentials)
            .field("base_url", &self.base_url)
            .field("policies", &self.policies)
            .finish_non_exhaustive()
    }
}

impl CatalogClient {
    pub fn new(transport: Arc<dyn ApiTransport>, credentials: Credentials) -> Self {
        Self {
            transport,
            pacer: Arc::new(FixedPacer::standard()),
            credentials,
            base_url: DEFAULT_API_BASE.to_string(),
            policies: HashMap::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_pacer(mut self, pacer: Arc<dyn RequestPacer>) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn with_page_policy(mut self, kind: ResourceKind, policy: PagePolicy) -> Self {
        self.policies.insert(kind, policy);
        self
    }

    pub fn page_policy(&self, kind: ResourceKind) -> PagePolicy {
        self.policies
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.page_policy())
    }

    pub fn url_for(&self, kind: ResourceKind) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), kind.endpoint())
    }

    pub async fn pause(&self, kind: ResourceKind) {
        self.pacer.pause(kind).await;
    }

    /// Fetches one page. A response without the list key (the API answers
    /// past-the-end pages with a fault body and an error status) is an empty
    /// page; a body that is not JSON is an error.
    pub async fn fetch_page(
        &self,
        kind: ResourceKind,
        page: u32,
        page_size: u32,
        filters: &Filters,
    ) -> Result<Vec<JsonValue>, CatalogError> {
        let list = kind.list().ok_or(CatalogError::ListUnsupported { kind })?;
        let mut param = filters.clone();
        param.insert("pagina".to_string(), JsonValue::from(page));
        param.insert("registros_por_pagina".to_string(), JsonValue::from(page_size));
        let envelope = ApiEnvelope::new(&self.credentials, list.call, JsonValue::Object(param));

        let resp = self
            .transport
            .post_json(&self.url_for(kind), &envelope.to_json())
            .await
            .map_err(|source| CatalogError::Transport { kind, page, source })?;

        let body: JsonValue =
            serde_json::from_slice(&resp.body).map_err(|e| CatalogError::Decode {
                kind,
                page,
                status: resp.status,
                detail: e.to_string(),
            })?;

        match body.get(list.key) {
            Some(JsonValue::Array(items)) => Ok(items.clone()),
            None | Some(JsonValue::Null) => {
                if !resp.is_success() {
                    let fault = body
                        .get("faultstring")
                        .and_then(JsonValue::as_str)
                        .unwrap_or("<no faultstring>");
                    debug!(%kind, page, status = resp.status, fault, "page answered with fault");
                }
                Ok(Vec::new())
            }
            Some(other) => Err(CatalogError::Decode {
                kind,
                page,
                status: resp.status,
                detail: format!("`{}` is not an array: {other}", list.key),
            }),
        }
    }

    /// Walks pages from 1 under the kind's [`PagePolicy`], handing each
    /// non-empty page to `on_page`, which may end the scan early.
    pub async fn scan<F>(
        &self,
        kind: ResourceKind,
        filters: &Filters,
        mut on_page: F,
    ) -> Result<ScanSummary, CatalogError>
    where
        F: FnMut(u32, Vec<JsonValue>) -> ControlFlow<()> + Send,
    {
        let list = kind.list().ok_or(CatalogError::ListUnsupported { kind })?;
        let policy = self.page_policy(kind);
        let page_size = list.page_size;
        let mut page = 1u32;
        let mut pages = 0u32;
        let mut records = 0usize;

        let stop = loop {
            if policy.max_pages.is_some_and(|max| page > max) {
                break StopReason::PageCap;
            }
            if page > 1 {
                self.pacer.pause(kind).await;
            }

            let items = self.fetch_page(kind, page, page_size, filters).await?;
            if items.is_empty() {
                break StopReason::EmptyPage;
            }

            let count = items.len();
            pages += 1;
            records += count;
            debug!(%kind, page, count, total = records, "page fetched");

            if on_page(page, items).is_break() {
                break StopReason::Satisfied;
            }
            if policy.stop_on_short_page && count < page_size as usize {
                break StopReason::ShortPage;
            }
            page += 1;
        };

        Ok(ScanSummary { pages, records, stop })
    }

    /// Fetches every page and decodes records in arrival order.
    pub async fn fetch_records<T: DeserializeOwned>(
        &self,
        kind: ResourceKind,
        filters: &Filters,
    ) -> Result<Vec<T>, CatalogError> {
        let mut pages: Vec<(u32, Vec<JsonValue>)> = Vec::new();
        let summary = self
            .scan(kind, filters, |page, items| {
                pages.push((page, items));
                ControlFlow::Continue(())
            })
            .await?;

        let mut out = Vec::with_capacity(summary.records);
        for (page, items) in pages {
            for (index, item) in items.into_iter().enumerate() {
                let record = serde_json::from_value(item).map_err(|source| CatalogError::Record {
                    kind,
                    page,
                    index,
                    source,
                })?;
                out.push(record);
            }
        }
        info!(%kind, pages = summary.pages, records = out.len(), stop = ?summary.stop, "fetch complete");
        Ok(out)
    }

    pub async fn service_orders(&self) -> Result<Vec<ServiceOrder>, CatalogError> {
        let kind = ResourceKind::ServiceOrders;
        self.fetch_records(kind, &kind.default_filters()).await
    }

    pub async fn sales_orders(&self) -> Result<Vec<SalesOrder>, CatalogError> {
        let kind = ResourceKind::SalesOrders;
        self.fetch_records(kind, &kind.default_filters()).await
    }

    /// Single-record lookup. The response body is returned whatever the
    /// status; a fault body simply carries no name.
    pub async fn lookup(&self, kind: ResourceKind, code: &RefCode) -> Result<JsonValue, CatalogError> {
        let call = kind
            .lookup()
            .ok_or(CatalogError::LookupUnsupported { kind })?;
        let mut param = JsonMap::new();
        param.insert(call.param.to_string(), code.to_json());
        let envelope = ApiEnvelope::new(&self.credentials, call.call, JsonValue::Object(param));

        let resp = self
            .transport
            .post_json(&self.url_for(kind), &envelope.to_json())
            .await
            .map_err(|source| CatalogError::LookupTransport {
                kind,
                code: code.clone(),
                source,
            })?;

        if !resp.is_success() {
            warn!(%kind, %code, status = resp.status, "lookup answered with error status");
        }
        serde_json::from_slice(&resp.body).map_err(|e| CatalogError::LookupDecode {
            kind,
            code: code.clone(),
            status: resp.status,
            detail: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records(n: usize, offset: usize) -> Vec<JsonValue> {
        (0..n)
            .map(|i| json!({ "Cabecalho": { "cNumOS": format!("{}", offset + i) } }))
            .collect()
    }

    fn client(transport: FixtureTransport) -> (Arc<FixtureTransport>, CatalogClient) {
        let transport = Arc::new(transport);
        let client = CatalogClient::new(transport.clone(), Credentials::new("k", "s"))
            .with_pacer(Arc::new(FixedPacer::none()));
        (transport, client)
    }

    #[derive(Default)]
    struct CountingPacer {
        pauses: std::sync::Mutex<Vec<ResourceKind>>,
    }

    #[async_trait]
    impl RequestPacer for CountingPacer {
        async fn pause(&self, kind: ResourceKind) {
            self.pauses.lock().unwrap().push(kind);
        }
    }

    #[tokio::test]
    async fn service_orders_stop_at_page_cap() {
        let (transport, client) = client(FixtureTransport::new(|req| {
            let page = req.page().unwrap_or(0) as usize;
            Ok(list_page("osCadastro", records(500, (page - 1) * 500)))
        }));

        let orders = client.service_orders().await.unwrap();
        assert_eq!(orders.len(), 5000);
        assert_eq!(transport.call_count("ListarOS"), 10);
        assert_eq!(orders[0].header.order_number.as_deref(), Some("0"));
        assert_eq!(orders[4999].header.order_number.as_deref(), Some("4999"));
    }

    #[tokio::test]
    async fn sales_orders_scan_until_fault_page() {
        let (transport, client) = client(FixtureTransport::new(|req| match req.page() {
            Some(p) if p <= 3 => Ok(list_page(
                "pedido_venda_produto",
                vec![json!({ "cabecalho": { "numero_pedido": format!("P{p}") } })],
            )),
            _ => Ok(fault_response(500, "ERROR: Não existem registros para a página [4]!")),
        }));

        let orders = client.sales_orders().await.unwrap();
        let numbers: Vec<_> = orders
            .iter()
            .map(|o| o.header.numero_pedido.clone().unwrap())
            .collect();
        assert_eq!(numbers, vec!["P1", "P2", "P3"]);
        assert_eq!(transport.call_count("ListarPedidos"), 4);
    }

    #[tokio::test]
    async fn clients_stop_on_short_page() {
        let (transport, client) = client(FixtureTransport::new(|req| {
            let n = if req.page() == Some(1) { 500 } else { 20 };
            let items = (0..n)
                .map(|i| json!({ "codigo_cliente_omie": i + 1, "nome_fantasia": "x" }))
                .collect();
            Ok(list_page("clientes_cadastro", items))
        }));

        let summary = client
            .scan(ResourceKind::Clients, &Filters::new(), |_, _| ControlFlow::Continue(()))
            .await
            .unwrap();
        assert_eq!(summary.stop, StopReason::ShortPage);
        assert_eq!(summary.pages, 2);
        assert_eq!(summary.records, 520);
        assert_eq!(transport.call_count("ListarClientes"), 2);
    }

    #[tokio::test]
    async fn scan_can_end_early_from_callback() {
        let (transport, client) = client(FixtureTransport::new(|_| {
            Ok(list_page("cadastro", vec![json!({ "codigo": 1, "nome": "Ana" })]))
        }));

        let summary = client
            .scan(ResourceKind::Salespeople, &Filters::new(), |page, _| {
                if page == 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .await
            .unwrap();
        assert_eq!(summary.stop, StopReason::Satisfied);
        assert_eq!(transport.call_count("ListarVendedores"), 3);
    }

    #[tokio::test]
    async fn salespeople_scan_is_capped_at_twenty_pages() {
        let (transport, client) = client(FixtureTransport::new(|_| {
            Ok(list_page("cadastro", vec![json!({ "codigo": 1, "nome": "Ana" })]))
        }));

        let summary = client
            .scan(ResourceKind::Salespeople, &Filters::new(), |_, _| ControlFlow::Continue(()))
            .await
            .unwrap();
        assert_eq!(summary.stop, StopReason::PageCap);
        assert_eq!(transport.call_count("ListarVendedores"), 20);
    }

    #[tokio::test]
    async fn page_policy_override_applies() {
        let (transport, client) = client(FixtureTransport::new(|_| {
            Ok(list_page("osCadastro", records(1, 0)))
        }));
        let client = client.with_page_policy(
            ResourceKind::ServiceOrders,
            PagePolicy {
                max_pages: Some(2),
                stop_on_short_page: false,
            },
        );
        assert_eq!(client.service_orders().await.unwrap().len(), 2);
        assert_eq!(transport.call_count("ListarOS"), 2);
    }

    #[tokio::test]
    async fn request_envelope_carries_credentials_and_filters() {
        let (transport, client) = client(FixtureTransport::new(|_| Ok(list_page("osCadastro", vec![]))));
        client.service_orders().await.unwrap();

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].url, "https://app.omie.com.br/api/v1/servicos/os/");
        assert_eq!(calls[0].body["app_key"], "k");
        assert_eq!(calls[0].body["app_secret"], "s");
        assert_eq!(calls[0].param["apenas_importado_api"], "N");
        assert_eq!(calls[0].param["registros_por_pagina"], 500);
    }

    #[tokio::test]
    async fn transport_failure_is_tagged_with_kind_and_page() {
        let (_transport, client) = client(FixtureTransport::new(|req| {
            if req.page() == Some(2) {
                Err(TransportError::Unavailable("connection reset".to_string()))
            } else {
                Ok(list_page("osCadastro", records(500, 0)))
            }
        }));

        let err = client.service_orders().await.unwrap_err();
        assert_eq!(err.kind(), ResourceKind::ServiceOrders);
        assert_eq!(err.page(), Some(2));
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
    }

    #[tokio::test]
    async fn malformed_body_is_a_decode_error() {
        let (_transport, client) = client(FixtureTransport::new(|_| {
            Ok(RawResponse {
                status: 502,
                body: b"<html>bad gateway</html>".to_vec(),
            })
        }));

        let err = client.sales_orders().await.unwrap_err();
        assert!(matches!(err, CatalogError::Decode { status: 502, page: 1, .. }));
    }

    #[tokio::test]
    async fn pacer_runs_between_pages_only() {
        let pacer = Arc::new(CountingPacer::default());
        let transport = Arc::new(FixtureTransport::new(|req| match req.page() {
            Some(p) if p <= 3 => Ok(list_page("pedido_venda_produto", vec![json!({})])),
            _ => Ok(list_page("pedido_venda_produto", vec![])),
        }));
        let client = CatalogClient::new(transport, Credentials::new("k", "s")).with_pacer(pacer.clone());

        client.sales_orders().await.unwrap();
        assert_eq!(pacer.pauses.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn lookup_returns_body_and_rejects_unsupported_kinds() {
        let (transport, client) = client(FixtureTransport::new(|req| {
            Ok(json_response(json!({ "codigo": req.param["codigo"], "nome": "Obra Norte" })))
        }));

        let code = RefCode::parse("321").unwrap();
        let body = client.lookup(ResourceKind::Projects, &code).await.unwrap();
        assert_eq!(display_name(ResourceKind::Projects, &body).as_deref(), Some("Obra Norte"));
        assert_eq!(transport.calls()[0].param["codigo"], 321);

        for kind in [ResourceKind::Salespeople, ResourceKind::Clients] {
            let err = client.lookup(kind, &code).await.unwrap_err();
            assert!(matches!(err, CatalogError::LookupUnsupported { .. }));
        }
    }

    #[tokio::test]
    async fn projects_cannot_be_listed() {
        let (transport, client) = client(FixtureTransport::new(|_| Ok(list_page("cadastro", vec![]))));

        let err = client
            .scan(ResourceKind::Projects, &Filters::new(), |_, _| ControlFlow::Continue(()))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::ListUnsupported { kind: ResourceKind::Projects }));
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn reference_of_reads_code_and_name_fields() {
        let record = json!({ "codigo_cliente_omie": 99, "nome_fantasia": "ACME" });
        let (code, name) = reference_of(ResourceKind::Clients, &record).unwrap();
        assert_eq!(code.as_str(), "99");
        assert_eq!(name.as_deref(), Some("ACME"));

        let nameless = json!({ "codigo": 5, "nome": "" });
        assert_eq!(reference_of(ResourceKind::Salespeople, &nameless).unwrap().1, None);
        assert!(reference_of(ResourceKind::Salespeople, &json!({ "codigo": 0 })).is_none());
    }
}
