//! Core domain model for omsync: Omie order records, reference codes, and
//! the display rows written to the destination tables.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "omsync-core";

/// Placeholder for a header field the source left empty.
pub const NOT_FILLED: &str = "NÃO PREENCHIDO";
/// Placeholder for a reference that was never set on the source record.
pub const NOT_INFORMED: &str = "NÃO INFORMADO";
/// Placeholder for a categorical code outside the known tables.
pub const DECODE_ERROR: &str = "ERRO";
/// Cached name recorded when a single-code lookup fails.
pub const LOOKUP_FAILED: &str = "Erro";
/// Cached name recorded when a lookup answers without any name field.
pub const NAME_NOT_FOUND: &str = "Não encontrado";

pub const SERVICE_HEADER: [&str; 18] = [
    "NUMERO DA ORDEM",
    "DATA ABERTURA",
    "ETAPA",
    "NUMERO DO PEDIDO",
    "VALOR DESCONTO",
    "TOTAL",
    "CANCELADAS",
    "TIPO",
    "QTD",
    "VALOR UNITÁRIO",
    "NOME PROJETO",
    "NOME CLIENTE",
    "VALOR TOTAL",
    "VENDEDOR",
    "DATA DE EMISSÃO",
    "PREVISÃO DE FATURAMENTO",
    "Nº CONTRATO VENDA",
    "OBSERVAÇÕES",
];

pub const SALES_HEADER: [&str; 10] = [
    "NUMERO DA VENDA",
    "DATA ABERTURA",
    "ETAPA",
    "NUMERO DO PEDIDO",
    "VALOR DESCONTO",
    "TOTAL",
    "CANCELADAS",
    "CLIENTE",
    "NOME PROJETO",
    "DATA DE EMISSÃO",
];

pub const CACHE_HEADER: [&str; 2] = ["codigo", "nome"];

/// API credentials. Opaque to this system; the secret never reaches logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub app_key: String,
    pub app_secret: String,
}

impl Credentials {
    pub fn new(app_key: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("app_key", &self.app_key)
            .field("app_secret", &"<redacted>")
            .finish()
    }
}

/// Request envelope shared by every Omie call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiEnvelope {
    pub app_key: String,
    pub app_secret: String,
    pub call: String,
    pub param: Vec<JsonValue>,
}

impl ApiEnvelope {
    pub fn new(credentials: &Credentials, call: &str, param: JsonValue) -> Self {
        Self {
            app_key: credentials.app_key.clone(),
            app_secret: credentials.app_secret.clone(),
            call: call.to_string(),
            param: vec![param],
        }
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::json!({
            "app_key": self.app_key,
            "app_secret": self.app_secret,
            "call": self.call,
            "param": self.param,
        })
    }
}

/// Renders a number the way a JSON producer prints it: integral values drop
/// the fraction, everything else uses the shortest round-trip form.
pub fn js_number_string(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Normalized reference key (client, project, salesperson, service code).
///
/// Numbers lose their fraction, strings are trimmed, and zero or empty values
/// never produce a code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RefCode(String);

impl RefCode {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Ok(n) = trimmed.parse::<f64>() {
            return Self::from_number(n);
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn from_number(value: f64) -> Option<Self> {
        if !value.is_finite() || value == 0.0 {
            return None;
        }
        Some(Self(js_number_string(value)))
    }

    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Number(n) => n.as_f64().and_then(Self::from_number),
            JsonValue::String(s) => Self::parse(s),
            _ => None,
        }
    }

    pub fn from_cell(cell: &Cell) -> Option<Self> {
        match cell {
            Cell::Number(n) => Self::from_number(*n),
            Cell::Text(s) => Self::parse(s),
            Cell::Empty => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric form used when the remote API expects an integer parameter.
    pub fn to_json(&self) -> JsonValue {
        match self.0.parse::<i64>() {
            Ok(n) => JsonValue::from(n),
            Err(_) => JsonValue::from(self.0.clone()),
        }
    }

    /// Cell form used when persisting the code into a cache table.
    pub fn to_cell(&self) -> Cell {
        match self.0.parse::<i64>() {
            Ok(n) => Cell::Number(n as f64),
            Err(_) => Cell::Text(self.0.clone()),
        }
    }
}

impl fmt::Display for RefCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RefCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = JsonValue::deserialize(deserializer)?;
        RefCode::from_json(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("not a reference code: {value}")))
    }
}

/// Kinds of reference data resolved into display names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Client,
    Project,
    Salesperson,
}

impl ReferenceKind {
    pub const ALL: [ReferenceKind; 3] = [Self::Client, Self::Project, Self::Salesperson];

    /// Name of the two-column table backing this kind's cache.
    pub fn cache_table(self) -> &'static str {
        match self {
            Self::Client => "Cache_Clientes",
            Self::Project => "Cache_Projetos",
            Self::Salesperson => "Cache_Vendedores",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Project => "project",
            Self::Salesperson => "salesperson",
        }
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReferenceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" | "clients" => Ok(Self::Client),
            "project" | "projects" => Ok(Self::Project),
            "salesperson" | "salespeople" | "sellers" => Ok(Self::Salesperson),
            other => Err(format!("unknown reference kind `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub code: RefCode,
    pub name: String,
}

/// One cell of a destination table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Number(f64),
    Text(String),
    #[default]
    Empty,
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    /// Empty cells and empty strings both count as blank.
    pub fn is_blank(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.is_empty(),
            Cell::Number(_) => false,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Number(n) => f.write_str(&js_number_string(*n)),
            Cell::Text(s) => f.write_str(s),
            Cell::Empty => Ok(()),
        }
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(value)
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::Number(value)
    }
}

/// Display-ready row; its arity must match the header it is written under.
pub type OutputRow = Vec<Cell>;

/// Lenient field decoders. The remote API mixes numbers and numeric strings
/// and sends `null` sections; none of that should fail a whole page.
pub mod lenient {
    use super::*;

    pub fn code<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<RefCode>, D::Error> {
        let value = Option::<JsonValue>::deserialize(deserializer)?;
        Ok(value.as_ref().and_then(RefCode::from_json))
    }

    pub fn number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        let value = Option::<JsonValue>::deserialize(deserializer)?;
        Ok(match value {
            Some(JsonValue::Number(n)) => n.as_f64(),
            Some(JsonValue::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
    }

    /// Strings stay as sent (empty becomes `None`); numbers are printed.
    pub fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        let value = Option::<JsonValue>::deserialize(deserializer)?;
        Ok(match value {
            Some(JsonValue::String(s)) if !s.is_empty() => Some(s),
            Some(JsonValue::Number(n)) => n.as_f64().map(js_number_string),
            Some(JsonValue::Bool(b)) => Some(b.to_string()),
            _ => None,
        })
    }

    pub fn section<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de> + Default,
    {
        Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
    }
}

/// Service order as returned by `ListarOS` (`osCadastro[]`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServiceOrder {
    #[serde(rename = "Cabecalho", default, deserialize_with = "lenient::section")]
    pub header: ServiceOrderHeader,
    #[serde(rename = "InformacoesAdicionais", default, deserialize_with = "lenient::section")]
    pub additional: ServiceOrderAdditional,
    #[serde(rename = "InfoCadastro", default, deserialize_with = "lenient::section")]
    pub registration: ServiceOrderRegistration,
    #[serde(rename = "ServicosPrestados", default, deserialize_with = "lenient::section")]
    pub services_rendered: Vec<ServiceLineItem>,
    #[serde(rename = "servicos", default)]
    pub services: Option<ServiceItemGroup>,
    #[serde(rename = "Observacoes", default, deserialize_with = "lenient::section")]
    pub notes: ServiceOrderNotes,
}

impl ServiceOrder {
    /// Line items; a nested `servicos.servico` list wins over
    /// `ServicosPrestados` whenever it is present, even when empty.
    pub fn line_items(&self) -> &[ServiceLineItem] {
        match self.services.as_ref().and_then(|g| g.items.as_ref()) {
            Some(items) => items,
            None => &self.services_rendered,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServiceOrderHeader {
    #[serde(rename = "cNumOS", default, deserialize_with = "lenient::text")]
    pub order_number: Option<String>,
    #[serde(rename = "nCodCli", default, deserialize_with = "lenient::code")]
    pub client_code: Option<RefCode>,
    #[serde(rename = "nCodVend", default, deserialize_with = "lenient::code")]
    pub salesperson_code: Option<RefCode>,
    #[serde(rename = "cEtapa", default, deserialize_with = "lenient::text")]
    pub stage: Option<String>,
    #[serde(rename = "nValorTotal", default, deserialize_with = "lenient::number")]
    pub total_value: Option<f64>,
    #[serde(rename = "dDtPrevisao", default, deserialize_with = "lenient::text")]
    pub forecast_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServiceOrderAdditional {
    #[serde(rename = "nCodProj", default, deserialize_with = "lenient::code")]
    pub project_code: Option<RefCode>,
    #[serde(rename = "cNumPedido", default, deserialize_with = "lenient::text")]
    pub external_order_number: Option<String>,
    #[serde(rename = "cNumContrato", default, deserialize_with = "lenient::text")]
    pub contract_number: Option<String>,
    #[serde(rename = "nCodCC", default, deserialize_with = "lenient::code")]
    pub bank_account_code: Option<RefCode>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServiceOrderRegistration {
    #[serde(rename = "dDtInc", default, deserialize_with = "lenient::text")]
    pub created_on: Option<String>,
    #[serde(rename = "cCancelada", default, deserialize_with = "lenient::text")]
    pub cancelled: Option<String>,
    #[serde(rename = "dDtFat", default, deserialize_with = "lenient::text")]
    pub invoiced_on: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServiceItemGroup {
    #[serde(rename = "servico", default)]
    pub items: Option<Vec<ServiceLineItem>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServiceLineItem {
    #[serde(rename = "nCodServico", default, deserialize_with = "lenient::code")]
    pub service_code: Option<RefCode>,
    #[serde(rename = "nQtde", default, deserialize_with = "lenient::number")]
    pub quantity: Option<f64>,
    #[serde(rename = "nValUnit", default, deserialize_with = "lenient::number")]
    pub unit_price: Option<f64>,
    #[serde(rename = "nValorDesconto", default, deserialize_with = "lenient::number")]
    pub discount: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServiceOrderNotes {
    #[serde(rename = "cObsOS", default, deserialize_with = "lenient::text")]
    pub text: Option<String>,
}

/// Sales order as returned by `ListarPedidos` (`pedido_venda_produto[]`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SalesOrder {
    #[serde(rename = "cabecalho", default, deserialize_with = "lenient::section")]
    pub header: SalesOrderHeader,
    #[serde(rename = "infoCadastro", default, deserialize_with = "lenient::section")]
    pub registration: SalesOrderRegistration,
    #[serde(rename = "informacoes_adicionais", default, deserialize_with = "lenient::section")]
    pub additional: SalesOrderAdditional,
    #[serde(rename = "total_pedido", default, deserialize_with = "lenient::section")]
    pub totals: SalesOrderTotals,
}

impl SalesOrder {
    pub fn project_code(&self) -> Option<&RefCode> {
        self.additional
            .project_code
            .as_ref()
            .or(self.additional.project_code_alt.as_ref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SalesOrderHeader {
    #[serde(default, deserialize_with = "lenient::text")]
    pub numero_pedido: Option<String>,
    #[serde(rename = "codigo_cliente", default, deserialize_with = "lenient::code")]
    pub client_code: Option<RefCode>,
    #[serde(rename = "etapa", default, deserialize_with = "lenient::text")]
    pub stage: Option<String>,
    #[serde(rename = "data_previsao", default, deserialize_with = "lenient::text")]
    pub forecast_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SalesOrderRegistration {
    #[serde(rename = "dInc", default, deserialize_with = "lenient::text")]
    pub created_on: Option<String>,
    #[serde(rename = "cancelado", default, deserialize_with = "lenient::text")]
    pub cancelled: Option<String>,
    #[serde(rename = "dFat", default, deserialize_with = "lenient::text")]
    pub invoiced_on: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SalesOrderAdditional {
    #[serde(rename = "codProj", default, deserialize_with = "lenient::code")]
    pub project_code: Option<RefCode>,
    #[serde(rename = "cProjeto", default, deserialize_with = "lenient::code")]
    pub project_code_alt: Option<RefCode>,
    #[serde(rename = "numero_pedido_cliente", default, deserialize_with = "lenient::text")]
    pub customer_order_number: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SalesOrderTotals {
    #[serde(rename = "valor_descontos", default, deserialize_with = "lenient::number")]
    pub discounts: Option<f64>,
    #[serde(rename = "valor_total_pedido", default, deserialize_with = "lenient::number")]
    pub total: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ref_codes_normalize_numbers_and_strings() {
        assert_eq!(RefCode::from_json(&json!(2041409931)).unwrap().as_str(), "2041409931");
        assert_eq!(RefCode::from_json(&json!(" 42 ")).unwrap().as_str(), "42");
        assert_eq!(RefCode::from_json(&json!("42.0")).unwrap().as_str(), "42");
        assert_eq!(RefCode::from_json(&json!("ABC")).unwrap().as_str(), "ABC");
        assert!(RefCode::from_json(&json!(0)).is_none());
        assert!(RefCode::from_json(&json!("")).is_none());
        assert!(RefCode::from_json(&json!("0")).is_none());
        assert!(RefCode::from_json(&JsonValue::Null).is_none());
    }

    #[test]
    fn ref_codes_round_trip_through_cache_cells() {
        let code = RefCode::parse("1969919786").unwrap();
        assert_eq!(code.to_cell(), Cell::Number(1969919786.0));
        assert_eq!(RefCode::from_cell(&code.to_cell()), Some(code));
        assert_eq!(RefCode::from_cell(&Cell::Empty), None);
    }

    #[test]
    fn numbers_print_like_json() {
        assert_eq!(js_number_string(100.0), "100");
        assert_eq!(js_number_string(12.5), "12.5");
        assert_eq!(js_number_string(0.1), "0.1");
        assert_eq!(js_number_string(-3.0), "-3");
    }

    #[test]
    fn service_order_tolerates_missing_and_null_sections() {
        let order: ServiceOrder = serde_json::from_value(json!({
            "Cabecalho": { "cNumOS": "000123", "nCodCli": "77", "nValorTotal": "150.5" },
            "InformacoesAdicionais": null,
            "ServicosPrestados": [{ "nCodServico": 1979758762, "nQtde": 2, "nValUnit": 10.0 }]
        }))
        .unwrap();
        assert_eq!(order.header.order_number.as_deref(), Some("000123"));
        assert_eq!(order.header.client_code.as_ref().map(RefCode::as_str), Some("77"));
        assert_eq!(order.header.total_value, Some(150.5));
        assert_eq!(order.additional, ServiceOrderAdditional::default());
        assert_eq!(order.line_items().len(), 1);
    }

    #[test]
    fn nested_service_list_wins_even_when_empty() {
        let order: ServiceOrder = serde_json::from_value(json!({
            "servicos": { "servico": [] },
            "ServicosPrestados": [{ "nQtde": 1 }]
        }))
        .unwrap();
        assert!(order.line_items().is_empty());
    }

    #[test]
    fn sales_order_project_code_falls_back_to_alternate_field() {
        let order: SalesOrder = serde_json::from_value(json!({
            "informacoes_adicionais": { "cProjeto": "555" }
        }))
        .unwrap();
        assert_eq!(order.project_code().map(RefCode::as_str), Some("555"));
    }

    #[test]
    fn credentials_debug_hides_secret() {
        let creds = Credentials::new("key", "very-secret");
        let shown = format!("{creds:?}");
        assert!(shown.contains("key"));
        assert!(!shown.contains("very-secret"));
    }

    #[test]
    fn cells_deserialize_untagged() {
        let cells: Vec<Cell> = serde_json::from_value(json!([1.5, "x", null])).unwrap();
        assert_eq!(cells, vec![Cell::Number(1.5), Cell::text("x"), Cell::Empty]);
        assert!(Cell::text("").is_blank());
    }
}
