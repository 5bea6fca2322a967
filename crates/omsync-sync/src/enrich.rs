//! Turns raw orders plus cached names into display rows.
//!
//! Everything here is pure: no I/O, no clock. Decoding never fails; unknown
//! codes and missing fields fall back to fixed sentinel labels.

use omsync_core::{
    js_number_string, Cell, OutputRow, RefCode, SalesOrder, ServiceLineItem, ServiceOrder,
    DECODE_ERROR, NOT_FILLED, NOT_INFORMED,
};

use crate::cache::ReferenceCache;
use crate::SyncError;

/// Bank account that marks a stage-60 service order as closed internally.
pub const INTERNAL_CLOSING_ACCOUNT: &str = "2041409931";
/// Bank account used when a stage-60 service order was invoiced.
pub const INVOICING_ACCOUNT: &str = "1969919786";

pub const SERVICE_TYPE_HOUR: &str = "1979758762";
pub const SERVICE_TYPE_KM: &str = "1975974257";
pub const SERVICE_TYPE_SERVICE: &str = "2209673817";

pub const NOT_FINISHED: &str = "AINDA NÃO FINALIZADA";
pub const NOT_INVOICED: &str = "NÃO FATURADO";
pub const CLIENT_NOT_FOUND: &str = "Cliente não encontrado";
pub const PROJECT_NOT_FOUND: &str = "Projeto não encontrado";
pub const ZERO_AMOUNT: &str = "0.00";

pub fn service_stage_label(stage: Option<&str>, bank_account: Option<&RefCode>) -> &'static str {
    match stage {
        Some("00") => "1. ORÇAMENTO",
        Some("20") => "2. EM EXECUÇÃO",
        Some("30") => "3. EXECUTADA",
        Some("50") => "4. PROCESSO DE GARANTIA",
        Some("60") => match bank_account.map(RefCode::as_str) {
            Some(INTERNAL_CLOSING_ACCOUNT) => "5. FINALIZADO (INTERNO)",
            // The invoicing account and unknown accounts share a label.
            Some(INVOICING_ACCOUNT) | Some(_) | None => "5.1 FATURADO (NFS)",
        },
        _ => DECODE_ERROR,
    }
}

/// Sales stage label; an absent stage reads as `"00"`.
pub fn sales_stage_label(stage: Option<&str>) -> &'static str {
    match stage.unwrap_or("00") {
        "00" => "ORÇAMENTO",
        "10" => "APROVADO",
        "20" => "SEPARAR ESTOQUE",
        "50" => "FATURAR...",
        "60" => "FATURADO",
        _ => "ETAPA DESCONHECIDA",
    }
}

pub fn item_type_label(service_code: Option<&RefCode>) -> &'static str {
    match service_code.map(RefCode::as_str) {
        Some(SERVICE_TYPE_HOUR) => "HORA",
        Some(SERVICE_TYPE_KM) => "KM",
        Some(SERVICE_TYPE_SERVICE) => "SERVIÇO",
        _ => DECODE_ERROR,
    }
}

/// Rounds halves toward positive infinity (`2.5 → 3`, `-2.5 → -2`).
pub fn round_half_up(value: f64) -> f64 {
    (value + 0.5).floor()
}

/// Amount cell for service rows: the number when present and non-zero,
/// otherwise the literal text `"0.00"`.
fn amount_or_zero_text(value: Option<f64>) -> Cell {
    match value {
        Some(v) if v != 0.0 => Cell::Number(v),
        _ => Cell::text(ZERO_AMOUNT),
    }
}

fn text_or(value: Option<&str>, fallback: &str) -> Cell {
    Cell::text(value.filter(|s| !s.is_empty()).unwrap_or(fallback))
}

fn cached_name<'a>(cache: &'a ReferenceCache, code: Option<&RefCode>) -> Option<&'a str> {
    code.and_then(|c| cache.name_of(c))
}

/// Name caches consulted while building service rows.
#[derive(Debug, Clone, Copy)]
pub struct ServiceLookups<'a> {
    pub projects: &'a ReferenceCache,
    pub clients: &'a ReferenceCache,
    pub salespeople: &'a ReferenceCache,
}

/// One row per line item, in order-then-item order. Orders without line
/// items contribute nothing.
pub fn service_rows(orders: &[ServiceOrder], lookups: ServiceLookups<'_>) -> Vec<OutputRow> {
    orders
        .iter()
        .flat_map(|order| {
            order
                .line_items()
                .iter()
                .map(move |item| service_row(order, item, lookups))
        })
        .collect()
}

fn service_row(order: &ServiceOrder, item: &ServiceLineItem, lookups: ServiceLookups<'_>) -> OutputRow {
    let header = &order.header;
    let additional = &order.additional;
    let registration = &order.registration;

    let quantity = item.quantity.unwrap_or(0.0);
    let unit_price = item.unit_price.unwrap_or(0.0);
    let cancelled = if registration.cancelled.as_deref() == Some("N") {
        "NÃO"
    } else {
        "SIM"
    };

    vec![
        text_or(header.order_number.as_deref(), DECODE_ERROR),
        text_or(registration.created_on.as_deref(), ""),
        Cell::text(service_stage_label(
            header.stage.as_deref(),
            additional.bank_account_code.as_ref(),
        )),
        text_or(additional.external_order_number.as_deref(), NOT_FILLED),
        amount_or_zero_text(item.discount),
        amount_or_zero_text(header.total_value),
        Cell::text(cancelled),
        Cell::text(item_type_label(item.service_code.as_ref())),
        Cell::Number(round_half_up(quantity)),
        Cell::Number(unit_price),
        Cell::text(cached_name(lookups.projects, additional.project_code.as_ref()).unwrap_or(NOT_FILLED)),
        Cell::text(cached_name(lookups.clients, header.client_code.as_ref()).unwrap_or("")),
        Cell::Number(quantity * unit_price),
        Cell::text(cached_name(lookups.salespeople, header.salesperson_code.as_ref()).unwrap_or(NOT_INFORMED)),
        text_or(registration.invoiced_on.as_deref(), NOT_FINISHED),
        text_or(header.forecast_date.as_deref(), ""),
        text_or(additional.contract_number.as_deref(), NOT_FILLED),
        text_or(order.notes.text.as_deref(), ""),
    ]
}

/// One row per order. Every cell is trimmed text.
pub fn sales_rows(
    orders: &[SalesOrder],
    clients: &ReferenceCache,
    projects: &ReferenceCache,
) -> Vec<OutputRow> {
    orders
        .iter()
        .map(|order| sales_row(order, clients, projects))
        .collect()
}

fn sales_row(order: &SalesOrder, clients: &ReferenceCache, projects: &ReferenceCache) -> OutputRow {
    let header = &order.header;
    let registration = &order.registration;

    let created = registration
        .created_on
        .as_deref()
        .or(header.forecast_date.as_deref())
        .unwrap_or("");
    let cancelled = if registration.cancelled.as_deref() == Some("S") {
        "SIM"
    } else {
        "NÃO"
    };
    let project = match order.project_code() {
        Some(code) => projects.name_of(code).unwrap_or(PROJECT_NOT_FOUND),
        None => NOT_INFORMED,
    };

    let values: [String; 10] = [
        header.numero_pedido.clone().unwrap_or_else(|| DECODE_ERROR.to_string()),
        created.to_string(),
        sales_stage_label(header.stage.as_deref()).to_string(),
        order
            .additional
            .customer_order_number
            .clone()
            .unwrap_or_else(|| NOT_FILLED.to_string()),
        js_number_string(order.totals.discounts.unwrap_or(0.0)),
        js_number_string(order.totals.total.unwrap_or(0.0)),
        cancelled.to_string(),
        cached_name(clients, header.client_code.as_ref())
            .unwrap_or(CLIENT_NOT_FOUND)
            .to_string(),
        project.to_string(),
        registration
            .invoiced_on
            .clone()
            .unwrap_or_else(|| NOT_INVOICED.to_string()),
    ];
    values.iter().map(|v| Cell::text(v.trim())).collect()
}

/// Fails when any row's width differs from the header's. Checked before
/// anything is written so a bad batch never reaches the destination.
pub fn check_arity(rows: &[OutputRow], expected: usize) -> Result<(), SyncError> {
    let mut offending = rows
        .iter()
        .enumerate()
        .filter(|(_, row)| row.len() != expected);
    let Some((first_index, first_row)) = offending.next() else {
        return Ok(());
    };
    Err(SyncError::Inconsistency {
        expected,
        offending: 1 + offending.count(),
        total: rows.len(),
        first_index,
        first_len: first_row.len(),
    })
}
