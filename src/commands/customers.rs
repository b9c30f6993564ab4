use serde::Deserialize;
use serde_json::{json, Value};

use super::{id_from_payload, parse_payload, to_json};
use crate::customers::{self, CustomerInput};
use crate::AppContext;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomerSearchPayload {
    #[serde(default, alias = "q", alias = "term", alias = "search")]
    query: String,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomerUpdatePayload {
    #[serde(alias = "customer_id", alias = "id")]
    customer_id: String,
    #[serde(flatten)]
    fields: CustomerInput,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomerDeletePayload {
    #[serde(alias = "customer_id", alias = "id")]
    customer_id: String,
    #[serde(default)]
    reason: Option<String>,
}

fn parse_search_payload(payload: Value) -> CustomerSearchPayload {
    let payload = match payload {
        Value::String(query) => json!({ "query": query }),
        Value::Object(obj) => Value::Object(obj),
        _ => json!({ "query": "" }),
    };
    serde_json::from_value(payload).unwrap_or(CustomerSearchPayload {
        query: String::new(),
        limit: None,
    })
}

pub(super) fn customer_create(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let input: CustomerInput = parse_payload(payload, "customer")?;
    to_json(customers::create(&ctx.db, &input)?)
}

pub(super) fn customer_update(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let parsed: CustomerUpdatePayload = parse_payload(payload, "customer update")?;
    to_json(customers::update(&ctx.db, parsed.customer_id.trim(), &parsed.fields)?)
}

pub(super) fn customer_get(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let id = id_from_payload(&payload, &["customerId", "customer_id", "id"], "Missing customer id")?;
    to_json(customers::get(&ctx.db, &id)?)
}

pub(super) fn customer_search(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let parsed = parse_search_payload(payload);
    to_json(customers::search(&ctx.db, &parsed.query, parsed.limit)?)
}

pub(super) fn customer_delete(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let parsed: CustomerDeletePayload = match payload {
        Value::String(id) => CustomerDeletePayload {
            customer_id: id,
            reason: None,
        },
        other => parse_payload(other, "customer delete")?,
    };
    let session = ctx.session_snapshot()?;
    let audit_id = customers::delete(
        &ctx.db,
        &session,
        parsed.customer_id.trim(),
        parsed.reason.as_deref(),
    )?;
    Ok(json!({ "success": true, "auditId": audit_id }))
}

#[cfg(test)]
mod dto_tests {
    use super::*;
    use crate::commands::tests::test_ctx;

    #[test]
    fn search_payload_accepts_string_or_alias() {
        assert_eq!(parse_search_payload(json!(" ana ")).query, " ana ");
        let parsed = parse_search_payload(json!({"q": "555", "limit": 5}));
        assert_eq!(parsed.query, "555");
        assert_eq!(parsed.limit, Some(5));
        assert_eq!(parse_search_payload(json!(42)).query, "");
    }

    #[test]
    fn create_update_search_delete() {
        let ctx = test_ctx();
        let created = customer_create(&ctx, json!({"name": "Beto", "phone": "55-9999-0000"})).unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        let updated = customer_update(
            &ctx,
            json!({"customer_id": id, "name": "Roberto", "email": "beto@example.com"}),
        )
        .unwrap();
        assert_eq!(updated["name"], "Roberto");

        let found = customer_search(&ctx, json!("99990000")).unwrap();
        assert_eq!(found.as_array().unwrap().len(), 1);
        assert_eq!(customer_get(&ctx, json!(id.clone())).unwrap()["email"], "beto@example.com");

        let deleted = customer_delete(&ctx, json!({"customerId": id, "reason": "duplicado"})).unwrap();
        assert!(deleted["auditId"].is_string());
        assert!(customer_get(&ctx, json!(id)).is_err());
    }

    #[test]
    fn create_requires_name() {
        let ctx = test_ctx();
        assert!(customer_create(&ctx, json!({"name": "  "})).is_err());
        assert!(customer_create(&ctx, json!({})).is_err());
    }
}
