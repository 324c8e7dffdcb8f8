//! Catalog payload definitions
//!
//! JSON bodies exchanged with the product catalog service. The transport never
//! looks inside these; they are parsed only by the catalog client and service.

use serde::{Deserialize, Deserializer, Serialize};

use super::{CatalogError, CatalogResult};

/// A product variation (size/colour/price combination)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub talla: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub precio: f64,
    #[serde(default)]
    pub stock: i64,
}

/// A catalog product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub nombre: String,
    #[serde(default)]
    pub marca: String,
    #[serde(default)]
    pub categoria: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descripcion: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub variaciones: Vec<Variation>,
}

/// Filter criteria; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marca: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categoria: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub talla: Option<String>,
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub precio_min: Option<String>,
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub precio_max: Option<String>,
}

impl Filters {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Prices arrive as text from prompts but as numbers from other clients
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// A request to the catalog service
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum CatalogRequest {
    /// List every product
    VerCatalogo,
    /// Free-text search
    Buscar { termino: String },
    /// Structured filter
    Filtrar { filtros: Filters },
}

/// Loose shape used to read requests from any client
#[derive(Debug, Deserialize)]
struct Envelope {
    command: Option<String>,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct BuscarArgs {
    #[serde(default)]
    termino: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FiltrarArgs {
    #[serde(default)]
    filtros: Filters,
}

impl CatalogRequest {
    pub fn to_body(&self) -> CatalogResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a request body
    ///
    /// Missing `args` are tolerated; an unknown command is an error the service
    /// reports back in an error payload.
    pub fn from_body(body: &[u8]) -> CatalogResult<Self> {
        let envelope: Envelope = serde_json::from_slice(body)?;
        let args = if envelope.args.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            envelope.args
        };

        match envelope.command.as_deref() {
            Some("ver_catalogo") => Ok(CatalogRequest::VerCatalogo),
            Some("buscar") => {
                let args: BuscarArgs = serde_json::from_value(args)?;
                Ok(CatalogRequest::Buscar {
                    termino: args.termino.unwrap_or_default(),
                })
            }
            Some("filtrar") => {
                let args: FiltrarArgs = serde_json::from_value(args)?;
                Ok(CatalogRequest::Filtrar {
                    filtros: args.filtros,
                })
            }
            Some(other) => Err(CatalogError::UnknownCommand(other.to_string())),
            None => Err(CatalogError::UnknownCommand(String::new())),
        }
    }
}

/// A reply from the catalog service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CatalogResponse {
    Success { data: Vec<Product> },
    Error { message: String },
}

impl CatalogResponse {
    pub fn error(message: impl Into<String>) -> Self {
        CatalogResponse::Error {
            message: message.into(),
        }
    }

    pub fn to_body(&self) -> CatalogResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a reply body
    ///
    /// Some bus services put a two-byte `OK`/`NK` status in front of the
    /// payload. It is stripped here; an `NK` reply that is not JSON becomes an
    /// error response carrying the raw text.
    pub fn from_body(body: &[u8]) -> CatalogResult<Self> {
        let (status, payload) = split_legacy_status(body);

        match serde_json::from_slice(payload) {
            Ok(response) => Ok(response),
            Err(_) if status == Some(LegacyStatus::NotOk) => Ok(CatalogResponse::error(
                String::from_utf8_lossy(payload).trim().to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

/// Two-byte status some bus services prefix to their replies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyStatus {
    Ok,
    NotOk,
}

/// Split an optional `OK`/`NK` prefix from a reply body
pub fn split_legacy_status(body: &[u8]) -> (Option<LegacyStatus>, &[u8]) {
    let status = match body.get(..2) {
        Some(b"OK") => LegacyStatus::Ok,
        Some(b"NK") => LegacyStatus::NotOk,
        _ => return (None, body),
    };
    (Some(status), &body[2..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shapes() {
        assert_eq!(
            CatalogRequest::VerCatalogo.to_body().unwrap(),
            br#"{"command":"ver_catalogo"}"#
        );
        assert_eq!(
            CatalogRequest::Buscar {
                termino: "nike".into()
            }
            .to_body()
            .unwrap(),
            br#"{"command":"buscar","args":{"termino":"nike"}}"#
        );

        let filtros = Filters {
            color: Some("rojo".into()),
            precio_max: Some("50".into()),
            ..Default::default()
        };
        let body = CatalogRequest::Filtrar { filtros }.to_body().unwrap();
        assert_eq!(
            body,
            br#"{"command":"filtrar","args":{"filtros":{"color":"rojo","precio_max":"50"}}}"#
        );
    }

    #[test]
    fn test_parse_requests_from_other_clients() {
        assert_eq!(
            CatalogRequest::from_body(br#"{"command":"ver_catalogo"}"#).unwrap(),
            CatalogRequest::VerCatalogo
        );
        assert_eq!(
            CatalogRequest::from_body(br#"{"command":"ver_catalogo","args":{}}"#).unwrap(),
            CatalogRequest::VerCatalogo
        );

        let parsed = CatalogRequest::from_body(
            br#"{"command":"filtrar","args":{"filtros":{"marca":"adidas","precio_min":10}}}"#,
        )
        .unwrap();
        match parsed {
            CatalogRequest::Filtrar { filtros } => {
                assert_eq!(filtros.marca.as_deref(), Some("adidas"));
                assert_eq!(filtros.precio_min.as_deref(), Some("10"));
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            CatalogRequest::from_body(br#"{"command":"getCatalog"}"#),
            Err(CatalogError::UnknownCommand(c)) if c == "getCatalog"
        ));
        assert!(matches!(
            CatalogRequest::from_body(b"not json"),
            Err(CatalogError::Json(_))
        ));
    }

    #[test]
    fn test_response_shapes() {
        let ok = CatalogResponse::Success { data: vec![] };
        assert_eq!(ok.to_body().unwrap(), br#"{"status":"success","data":[]}"#);

        let err = CatalogResponse::error("boom");
        assert_eq!(
            err.to_body().unwrap(),
            br#"{"status":"error","message":"boom"}"#
        );
    }

    #[test]
    fn test_legacy_status_prefix() {
        let plain = CatalogResponse::from_body(br#"{"status":"success","data":[]}"#).unwrap();
        let prefixed =
            CatalogResponse::from_body(br#"OK{"status":"success","data":[]}"#).unwrap();
        assert_eq!(plain, prefixed);

        assert_eq!(
            CatalogResponse::from_body(b"NKservicio no disponible").unwrap(),
            CatalogResponse::error("servicio no disponible")
        );
        assert!(CatalogResponse::from_body(b"garbage").is_err());
        assert_eq!(split_legacy_status(b"O"), (None, &b"O"[..]));
    }

    #[test]
    fn test_product_defaults() {
        let product: Product = serde_json::from_str(
            r#"{"nombre":"Polera","variaciones":[{"precio":9.5,"stock":3}]}"#,
        )
        .unwrap();
        assert_eq!(product.marca, "");
        assert_eq!(product.variaciones[0].talla, None);
        assert_eq!(product.variaciones[0].stock, 3);
    }
}
