//! Durable code → name caches backed by two-column tables.
//!
//! A cache is loaded whole at job start, grows in memory while codes are
//! resolved, and is appended to its table in one batch by [`ReferenceCache::flush`].
//! Persisted rows are never rewritten; a name, once known, never changes.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;

use omsync_catalog::{display_name, reference_of, CatalogClient, Filters, ResourceKind};
use omsync_core::{
    Cell, OutputRow, RefCode, ReferenceEntry, ReferenceKind, CACHE_HEADER, LOOKUP_FAILED,
    NAME_NOT_FOUND,
};
use omsync_storage::{CellRange, StoreError, TabularStore};
use tracing::{debug, info, warn};

/// How missing codes of a kind are looked up remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStrategy {
    /// One detail call per missing code.
    SingleLookup,
    /// List scan that ends once no needed code is missing.
    ScanUntilResolved,
    /// Full list scan whatever is needed; the API has no usable single lookup.
    FullScan,
}

impl ResolveStrategy {
    pub fn for_kind(kind: ReferenceKind) -> Self {
        match kind {
            ReferenceKind::Client => Self::FullScan,
            ReferenceKind::Project => Self::SingleLookup,
            ReferenceKind::Salesperson => Self::ScanUntilResolved,
        }
    }
}

pub fn resource_for(kind: ReferenceKind) -> ResourceKind {
    match kind {
        ReferenceKind::Client => ResourceKind::Clients,
        ReferenceKind::Project => ResourceKind::Projects,
        ReferenceKind::Salesperson => ResourceKind::Salespeople,
    }
}

/// Name recorded for list records that carry no name at all.
fn unnamed_label(kind: ReferenceKind) -> &'static str {
    match kind {
        ReferenceKind::Client => "Sem nome",
        ReferenceKind::Salesperson => "Sem Nome",
        ReferenceKind::Project => NAME_NOT_FOUND,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOutcome {
    /// Codes that were neither cached nor attempted earlier in this run.
    pub missing: usize,
    pub newly_cached: usize,
    pub failed: usize,
    /// Missing codes still without a name after resolution.
    pub unresolved: usize,
}

#[derive(Debug, Clone)]
pub struct ReferenceCache {
    kind: ReferenceKind,
    names: HashMap<RefCode, String>,
    pending: Vec<ReferenceEntry>,
    attempted: HashSet<RefCode>,
    loaded: usize,
}

impl ReferenceCache {
    pub fn empty(kind: ReferenceKind) -> Self {
        Self {
            kind,
            names: HashMap::new(),
            pending: Vec::new(),
            attempted: HashSet::new(),
            loaded: 0,
        }
    }

    /// Cache pre-filled with already persisted entries.
    pub fn with_entries(kind: ReferenceKind, entries: impl IntoIterator<Item = (RefCode, String)>) -> Self {
        let mut cache = Self::empty(kind);
        for (code, name) in entries {
            if cache.names.contains_key(&code) {
                continue;
            }
            cache.names.insert(code, name);
            cache.loaded += 1;
        }
        cache
    }

    /// Reads the backing table. A missing table is created with its header;
    /// empty and header-only tables give an empty cache. When the table holds
    /// a code twice, the first row wins.
    pub async fn load(store: &dyn TabularStore, kind: ReferenceKind) -> Result<Self, StoreError> {
        let table = kind.cache_table();
        if !store.has_sheet(table).await? {
            store.create_sheet(table).await?;
        }
        let rows = store.read_all(table).await?;
        if rows.is_empty() {
            store.append_rows(table, &[cache_header()]).await?;
            info!(%kind, table, "cache table initialised");
            return Ok(Self::empty(kind));
        }

        let mut duplicates = 0usize;
        let entries = rows.iter().skip(1).filter_map(|row| {
            let code = row.first().and_then(RefCode::from_cell)?;
            let name = row.get(1).map(Cell::to_string).unwrap_or_default();
            Some((code, name))
        });
        let mut cache = Self::empty(kind);
        for (code, name) in entries {
            if cache.names.contains_key(&code) {
                duplicates += 1;
                continue;
            }
            cache.names.insert(code, name);
            cache.loaded += 1;
        }
        info!(%kind, table, entries = cache.loaded, duplicates, "cache loaded");
        Ok(cache)
    }

    pub fn kind(&self) -> ReferenceKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Cached name; blank names count as unknown.
    pub fn name_of(&self, code: &RefCode) -> Option<&str> {
        self.names
            .get(code)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    fn remember(&mut self, code: RefCode, name: String) -> bool {
        if self.names.contains_key(&code) {
            return false;
        }
        self.names.insert(code.clone(), name.clone());
        self.pending.push(ReferenceEntry { code, name });
        true
    }

    fn missing_from(&self, codes: &[RefCode]) -> Vec<RefCode> {
        let mut seen = HashSet::new();
        codes
            .iter()
            .filter(|code| !self.names.contains_key(*code) && !self.attempted.contains(*code))
            .filter(|code| seen.insert((*code).clone()))
            .cloned()
            .collect()
    }

    /// Brings every code in `codes` into the cache when the remote side knows
    /// it. Codes already cached or already attempted in this run are not
    /// fetched again. Failures never abort resolution: a failed single lookup
    /// is cached as `"Erro"` and a failed scan simply ends early.
    pub async fn resolve(&mut self, client: &CatalogClient, codes: &[RefCode]) -> ResolveOutcome {
        let strategy = ResolveStrategy::for_kind(self.kind);
        let resource = resource_for(self.kind);
        let missing = self.missing_from(codes);
        let before = self.pending.len();
        let mut outcome = ResolveOutcome {
            missing: missing.len(),
            ..Default::default()
        };

        match strategy {
            ResolveStrategy::SingleLookup => {
                for (i, code) in missing.iter().enumerate() {
                    if i > 0 {
                        client.pause(resource).await;
                    }
                    self.attempted.insert(code.clone());
                    let name = match client.lookup(resource, code).await {
                        Ok(body) => display_name(resource, &body).unwrap_or_else(|| NAME_NOT_FOUND.to_string()),
                        Err(err) => {
                            warn!(kind = %self.kind, %code, error = %err, "lookup failed; caching error marker");
                            outcome.failed += 1;
                            LOOKUP_FAILED.to_string()
                        }
                    };
                    self.remember(code.clone(), name);
                }
            }
            ResolveStrategy::ScanUntilResolved | ResolveStrategy::FullScan => {
                if strategy == ResolveStrategy::ScanUntilResolved && missing.is_empty() {
                    debug!(kind = %self.kind, "nothing to resolve");
                    return outcome;
                }
                self.attempted.extend(missing.iter().cloned());
                let kind = self.kind;
                let stop_when_resolved = strategy == ResolveStrategy::ScanUntilResolved;
                let scan = client
                    .scan(resource, &Filters::new(), |_, items| {
                        for item in &items {
                            if let Some((code, name)) = reference_of(resource, item) {
                                let name = name.unwrap_or_else(|| unnamed_label(kind).to_string());
                                self.remember(code, name);
                            }
                        }
                        if stop_when_resolved && missing.iter().all(|c| self.names.contains_key(c)) {
                            ControlFlow::Break(())
                        } else {
                            ControlFlow::Continue(())
                        }
                    })
                    .await;
                match scan {
                    Ok(summary) => {
                        debug!(kind = %self.kind, pages = summary.pages, stop = ?summary.stop, "reference scan finished");
                    }
                    Err(err) => {
                        warn!(kind = %self.kind, error = %err, "reference scan interrupted; continuing with partial cache");
                        outcome.failed += 1;
                    }
                }
            }
        }

        outcome.newly_cached = self.pending.len() - before;
        outcome.unresolved = missing.iter().filter(|c| !self.names.contains_key(*c)).count();
        info!(
            kind = %self.kind,
            missing = outcome.missing,
            newly_cached = outcome.newly_cached,
            failed = outcome.failed,
            unresolved = outcome.unresolved,
            "references resolved"
        );
        outcome
    }

    /// Appends pending entries to the backing table in one write. Rows are
    /// only ever appended, never deduplicated against what is stored.
    pub async fn flush(&mut self, store: &dyn TabularStore) -> Result<usize, StoreError> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let rows: Vec<OutputRow> = self
            .pending
            .iter()
            .map(|entry| vec![entry.code.to_cell(), Cell::text(entry.name.clone())])
            .collect();
        store.append_rows(self.kind.cache_table(), &rows).await?;
        let written = self.pending.len();
        self.pending.clear();
        debug!(kind = %self.kind, written, "cache entries appended");
        Ok(written)
    }
}

fn cache_header() -> OutputRow {
    CACHE_HEADER.iter().map(|h| Cell::text(*h)).collect()
}

/// Empties a cache table down to its header.
pub async fn reset_cache(store: &dyn TabularStore, kind: ReferenceKind) -> Result<usize, StoreError> {
    let table = kind.cache_table();
    if !store.has_sheet(table).await? {
        store.create_sheet(table).await?;
        store.append_rows(table, &[cache_header()]).await?;
        return Ok(0);
    }
    let last_row = store.last_row(table).await?;
    let width = store.last_column(table).await?.max(CACHE_HEADER.len());
    if last_row > 0 {
        store
            .clear_range(table, CellRange::new(1, 1, last_row, width))
            .await?;
    }
    store.write_range(table, 1, 1, &[cache_header()]).await?;
    let removed = last_row.saturating_sub(1);
    info!(%kind, table, removed, "cache reset");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use omsync_catalog::{fault_response, json_response, list_page, FixedPacer, FixtureTransport};
    use omsync_core::Credentials;
    use omsync_storage::{TransportError, Workbook};
    use serde_json::json;

    fn code(s: &str) -> RefCode {
        RefCode::parse(s).unwrap()
    }

    fn client(transport: FixtureTransport) -> (Arc<FixtureTransport>, CatalogClient) {
        let transport = Arc::new(transport);
        let client = CatalogClient::new(transport.clone(), Credentials::new("k", "s"))
            .with_pacer(Arc::new(FixedPacer::none()));
        (transport, client)
    }

    #[tokio::test]
    async fn load_creates_missing_table_with_header() {
        let store = Workbook::in_memory();
        let cache = ReferenceCache::load(&store, ReferenceKind::Project).await.unwrap();
        assert!(cache.is_empty());

        let values = store.read_all("Cache_Projetos").await.unwrap();
        assert_eq!(values, vec![vec![Cell::text("codigo"), Cell::text("nome")]]);
    }

    #[tokio::test]
    async fn load_tolerates_header_only_and_keeps_first_duplicate() {
        let store = Workbook::in_memory();
        store.create_sheet("Cache_Clientes").await.unwrap();
        store.append_rows("Cache_Clientes", &[cache_header()]).await.unwrap();
        assert!(ReferenceCache::load(&store, ReferenceKind::Client).await.unwrap().is_empty());

        store
            .append_rows(
                "Cache_Clientes",
                &[
                    vec![Cell::Number(10.0), Cell::text("Primeiro")],
                    vec![Cell::text("10"), Cell::text("Segundo")],
                    vec![Cell::Empty, Cell::text("sem código")],
                ],
            )
            .await
            .unwrap();
        let cache = ReferenceCache::load(&store, ReferenceKind::Client).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.name_of(&code("10")), Some("Primeiro"));
    }

    #[tokio::test]
    async fn single_lookup_caches_names_and_error_markers() {
        let (transport, client) = client(FixtureTransport::new(|req| {
            match req.param["codigo"].as_i64() {
                Some(1) => Ok(json_response(json!({ "nome": "Obra Um" }))),
                Some(2) => Ok(json_response(json!({ "nome_fantasia": "Obra Dois" }))),
                Some(3) => Ok(fault_response(500, "Projeto não cadastrado")),
                _ => Err(TransportError::Unavailable("timeout".to_string())),
            }
        }));
        let mut cache = ReferenceCache::with_entries(ReferenceKind::Project, [(code("9"), "Já Conhecido".to_string())]);

        let outcome = cache
            .resolve(&client, &[code("1"), code("2"), code("3"), code("4"), code("9"), code("1")])
            .await;

        assert_eq!(outcome.missing, 4);
        assert_eq!(outcome.newly_cached, 4);
        assert_eq!(outcome.failed, 1);
        assert_eq!(transport.call_count("ConsultarProjeto"), 4);
        assert_eq!(cache.name_of(&code("1")), Some("Obra Um"));
        assert_eq!(cache.name_of(&code("2")), Some("Obra Dois"));
        assert_eq!(cache.name_of(&code("3")), Some(NAME_NOT_FOUND));
        assert_eq!(cache.name_of(&code("4")), Some(LOOKUP_FAILED));
    }

    #[tokio::test]
    async fn codes_are_never_fetched_twice_in_one_run() {
        let (transport, client) = client(FixtureTransport::new(|_| {
            Err(TransportError::Unavailable("down".to_string()))
        }));
        let mut cache = ReferenceCache::empty(ReferenceKind::Salesperson);

        let first = cache.resolve(&client, &[code("7")]).await;
        assert_eq!(first.unresolved, 1);
        let second = cache.resolve(&client, &[code("7")]).await;
        assert_eq!(second.missing, 0);
        assert_eq!(transport.call_count("ListarVendedores"), 1);
    }

    #[tokio::test]
    async fn salesperson_scan_stops_once_needed_codes_are_found() {
        let (transport, client) = client(FixtureTransport::new(|req| {
            let page = req.page().unwrap_or(1) as i64;
            let items = (0..50)
                .map(|i| json!({ "codigo": page * 100 + i, "nome": format!("Vendedor {}", page * 100 + i) }))
                .collect();
            Ok(list_page("cadastro", items))
        }));
        let mut cache = ReferenceCache::empty(ReferenceKind::Salesperson);

        let outcome = cache.resolve(&client, &[code("305")]).await;
        assert_eq!(transport.call_count("ListarVendedores"), 3);
        assert_eq!(outcome.unresolved, 0);
        assert_eq!(cache.name_of(&code("305")), Some("Vendedor 305"));
        // every record seen on the way is cached too
        assert_eq!(cache.len(), 150);
    }

    #[tokio::test]
    async fn salesperson_scan_skips_network_when_all_cached() {
        let (transport, client) = client(FixtureTransport::new(|_| Ok(list_page("cadastro", vec![]))));
        let mut cache = ReferenceCache::with_entries(ReferenceKind::Salesperson, [(code("5"), "Ana".to_string())]);
        cache.resolve(&client, &[code("5")]).await;
        assert_eq!(transport.call_count("ListarVendedores"), 0);
    }

    #[tokio::test]
    async fn client_scan_runs_unconditionally_and_keeps_existing_names() {
        let (transport, client) = client(FixtureTransport::new(|_| {
            Ok(list_page(
                "clientes_cadastro",
                vec![
                    json!({ "codigo_cliente_omie": 1, "nome_fantasia": "Nome Novo" }),
                    json!({ "codigo_cliente_omie": 2, "nome_fantasia": "" }),
                ],
            ))
        }));
        let mut cache = ReferenceCache::with_entries(ReferenceKind::Client, [(code("1"), "Nome Antigo".to_string())]);

        let outcome = cache.resolve(&client, &[]).await;
        assert_eq!(transport.call_count("ListarClientes"), 1);
        assert_eq!(outcome.newly_cached, 1);
        assert_eq!(cache.name_of(&code("1")), Some("Nome Antigo"));
        assert_eq!(cache.name_of(&code("2")), Some("Sem nome"));
    }

    #[tokio::test]
    async fn client_scan_failure_is_best_effort() {
        let (_transport, client) = client(FixtureTransport::new(|req| {
            if req.page() == Some(1) {
                let items = (1..=500)
                    .map(|i| json!({ "codigo_cliente_omie": i, "nome_fantasia": format!("C{i}") }))
                    .collect();
                Ok(list_page("clientes_cadastro", items))
            } else {
                Err(TransportError::Unavailable("reset".to_string()))
            }
        }));
        let mut cache = ReferenceCache::empty(ReferenceKind::Client);
        let outcome = cache.resolve(&client, &[code("9999")]).await;
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.unresolved, 1);
        assert_eq!(cache.len(), 500);
    }

    #[tokio::test]
    async fn flush_appends_only_new_entries_once() {
        let store = Workbook::in_memory();
        let mut cache = ReferenceCache::load(&store, ReferenceKind::Project).await.unwrap();
        let (_transport, client) = client(FixtureTransport::new(|_| Ok(json_response(json!({ "nome": "P" })))));

        cache.resolve(&client, &[code("11"), code("12")]).await;
        assert_eq!(cache.flush(&store).await.unwrap(), 2);
        assert_eq!(cache.flush(&store).await.unwrap(), 0);

        let values = store.read_all("Cache_Projetos").await.unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[1], vec![Cell::Number(11.0), Cell::text("P")]);

        let reloaded = ReferenceCache::load(&store, ReferenceKind::Project).await.unwrap();
        assert_eq!(reloaded.len(), 2);
    }

    #[tokio::test]
    async fn reset_leaves_only_the_header() {
        let store = Workbook::in_memory();
        let mut cache = ReferenceCache::load(&store, ReferenceKind::Salesperson).await.unwrap();
        cache.remember(code("1"), "Ana".to_string());
        cache.remember(code("2"), "Bia".to_string());
        cache.flush(&store).await.unwrap();

        assert_eq!(reset_cache(&store, ReferenceKind::Salesperson).await.unwrap(), 2);
        let values = store.read_all("Cache_Vendedores").await.unwrap();
        assert_eq!(values, vec![cache_header()]);
    }
}
