//! Fixture-first transport: canned API answers for tests and offline runs.
//!
//! A fixture directory holds one folder per API call:
//!
//! ```text
//! fixtures/ListarOS/page_1.json
//! fixtures/ListarVendedores/page_1.json
//! fixtures/ConsultarProjeto/321.json
//! ```
//!
//! List calls are answered from `page_<n>.json`, lookups from `<code>.json`.
//! A missing file is answered the way the API answers a past-the-end page: an
//! HTTP 500 with a fault body.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use omsync_storage::{ApiTransport, RawResponse, TransportError};
use serde_json::Value as JsonValue;

type Handler = dyn Fn(&FixtureRequest) -> Result<RawResponse, TransportError> + Send + Sync;

/// One request as seen by the fixture transport.
#[derive(Debug, Clone, PartialEq)]
pub struct FixtureRequest {
    pub url: String,
    pub call: String,
    pub param: JsonValue,
    pub body: JsonValue,
}

impl FixtureRequest {
    fn from_body(url: &str, body: &JsonValue) -> Self {
        Self {
            url: url.to_string(),
            call: body
                .get("call")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string(),
            param: body
                .get("param")
                .and_then(|p| p.get(0))
                .cloned()
                .unwrap_or(JsonValue::Null),
            body: body.clone(),
        }
    }

    pub fn page(&self) -> Option<u32> {
        self.param
            .get("pagina")
            .and_then(JsonValue::as_u64)
            .and_then(|p| u32::try_from(p).ok())
    }

    /// First parameter value rendered as text, used to key lookup fixtures.
    pub fn lookup_key(&self) -> Option<String> {
        let map = self.param.as_object()?;
        map.values().next().map(|v| match v {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

pub struct FixtureTransport {
    handler: Box<Handler>,
    calls: Mutex<Vec<FixtureRequest>>,
}

impl fmt::Debug for FixtureTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureTransport")
            .field("calls", &self.calls.lock().map(|c| c.len()).unwrap_or_default())
            .finish_non_exhaustive()
    }
}

impl FixtureTransport {
    pub fn new(
        handler: impl Fn(&FixtureRequest) -> Result<RawResponse, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self::new(move |req| Ok(answer_from_dir(&dir, req)))
    }

    pub fn calls(&self) -> Vec<FixtureRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self, call: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|r| r.call == call).count())
            .unwrap_or_default()
    }
}

fn answer_from_dir(dir: &Path, req: &FixtureRequest) -> RawResponse {
    let call_dir = dir.join(&req.call);
    let file = match (req.page(), req.lookup_key()) {
        (Some(page), _) => call_dir.join(format!("page_{page}.json")),
        (None, Some(key)) => call_dir.join(format!("{key}.json")),
        (None, None) => return fault_response(500, "fixture request without parameters"),
    };
    match std::fs::read(&file) {
        Ok(body) => RawResponse { status: 200, body },
        Err(_) => fault_response(
            500,
            &format!("ERROR: Não existem registros ({})", file.display()),
        ),
    }
}

#[async_trait]
impl ApiTransport for FixtureTransport {
    async fn post_json(&self, url: &str, body: &JsonValue) -> Result<RawResponse, TransportError> {
        let request = FixtureRequest::from_body(url, body);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        (self.handler)(&request)
    }
}

pub fn json_response(value: JsonValue) -> RawResponse {
    RawResponse::ok(value.to_string().into_bytes())
}

/// Fault body in the shape the API uses for business errors.
pub fn fault_response(status: u16, message: &str) -> RawResponse {
    let body = serde_json::json!({
        "faultstring": message,
        "faultcode": "SOAP-ENV:Client-5113",
    });
    RawResponse {
        status,
        body: body.to_string().into_bytes(),
    }
}

pub fn list_page(key: &str, items: Vec<JsonValue>) -> RawResponse {
    let mut body = serde_json::Map::new();
    body.insert("registros".to_string(), JsonValue::from(items.len()));
    body.insert(key.to_string(), JsonValue::Array(items));
    json_response(JsonValue::Object(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn directory_fixtures_answer_pages_and_lookups() {
        let dir = tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("ListarOS")).unwrap();
        std::fs::write(
            dir.path().join("ListarOS/page_1.json"),
            json!({ "osCadastro": [{ "Cabecalho": { "cNumOS": "1" } }] }).to_string(),
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("ConsultarProjeto")).unwrap();
        std::fs::write(
            dir.path().join("ConsultarProjeto/321.json"),
            json!({ "nome": "Obra Norte" }).to_string(),
        )
        .unwrap();

        let transport = FixtureTransport::from_dir(dir.path());
        let page1 = transport
            .post_json("u", &json!({ "call": "ListarOS", "param": [{ "pagina": 1 }] }))
            .await
            .unwrap();
        assert!(page1.is_success());

        let page2 = transport
            .post_json("u", &json!({ "call": "ListarOS", "param": [{ "pagina": 2 }] }))
            .await
            .unwrap();
        assert_eq!(page2.status, 500);

        let lookup = transport
            .post_json("u", &json!({ "call": "ConsultarProjeto", "param": [{ "codigo": 321 }] }))
            .await
            .unwrap();
        let body: JsonValue = serde_json::from_slice(&lookup.body).unwrap();
        assert_eq!(body["nome"], "Obra Norte");

        assert_eq!(transport.call_count("ListarOS"), 2);
        assert_eq!(transport.calls().len(), 3);
    }
}
