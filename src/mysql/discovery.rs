//! Schema discovery for the admin surface
//!
//! Interface behind `GET /v2/database/schemas`: the HTTP layer itself is
//! external, this module owns the request decoding, the listing query and
//! the response models. VIEWs are filtered out and passwords are never
//! echoed back.

use crate::common::config::ConnectionConfig;
use crate::common::error::Result;
use crate::mysql::sqlutil::escape_name;
use mysql_async::prelude::*;
use mysql_async::Conn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Schemas that belong to the server, not to replication jobs.
const SYSTEM_SCHEMAS: [&str; 4] = [
    "information_schema",
    "performance_schema",
    "mysql",
    "sys",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableItem {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaItem {
    pub name: String,
    pub tables: Vec<TableItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseResp {
    pub code: u32,
    pub message: String,
}

impl BaseResp {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: 1,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSchemasResponse {
    pub schemas: Vec<SchemaItem>,
    pub base_resp: BaseResp,
}

/// Decode the endpoint's query parameters into a connection descriptor.
/// Same enumerated mapping as [`ConnectionConfig::from_map`]; the password
/// is write-only from here on.
pub fn decode_request(params: &HashMap<String, String>) -> Result<ConnectionConfig> {
    ConnectionConfig::from_map(params)
}

/// List user schemas and their base tables; VIEWs are filtered.
pub async fn list_schemas(config: &ConnectionConfig) -> Result<Vec<SchemaItem>> {
    let mut conn = Conn::new(config.opts()).await?;
    let result = list_schemas_on(&mut conn).await;
    let _ = conn.disconnect().await;
    result
}

async fn list_schemas_on(conn: &mut Conn) -> Result<Vec<SchemaItem>> {
    let databases: Vec<String> = conn.query("SHOW DATABASES").await?;

    let mut schemas = Vec::new();
    for db in databases {
        if SYSTEM_SCHEMAS.contains(&db.to_lowercase().as_str()) {
            continue;
        }
        let rows: Vec<(String, String)> = conn
            .query(format!("SHOW FULL TABLES FROM {}", escape_name(&db)))
            .await?;
        let tables = rows
            .into_iter()
            .filter(|(_, table_type)| !table_type.eq_ignore_ascii_case("view"))
            .map(|(name, _)| TableItem { name })
            .collect::<Vec<_>>();
        debug!(schema = %db, n_tables = tables.len(), "schema discovered");
        schemas.push(SchemaItem { name: db, tables });
    }
    Ok(schemas)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_request_applies_defaults() {
        let mut params = HashMap::new();
        params.insert("host".to_string(), "db1".to_string());
        params.insert("port".to_string(), "3306".to_string());
        params.insert("user".to_string(), "reader".to_string());
        params.insert("password".to_string(), "hunter2".to_string());

        let cfg = decode_request(&params).unwrap();
        assert_eq!(cfg.charset, "utf8");
        // the secret never surfaces in anything printable
        assert!(!format!("{cfg:?}").contains("hunter2"));
    }

    #[test]
    fn test_response_serialization_has_no_password_field() {
        let resp = ListSchemasResponse {
            schemas: vec![SchemaItem {
                name: "shop".into(),
                tables: vec![TableItem { name: "orders".into() }],
            }],
            base_resp: BaseResp::ok(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"orders\""));
        assert!(!json.contains("password"));
    }

    #[test]
    fn test_base_resp_error() {
        let resp = BaseResp::error("connect failed");
        assert_eq!(resp.code, 1);
        assert_eq!(resp.message, "connect failed");
    }
}
