//! Embedded JSON Schemas for persisted records.

use std::sync::LazyLock;

use jsonschema::{Validator, validator_for};
use serde_json::Value;

pub const ITEM_SCHEMA: &str = include_str!("../../schemas/item.v1.schema.json");
pub const PRD_SCHEMA: &str = include_str!("../../schemas/prd.v1.schema.json");

static ITEM_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| compile(ITEM_SCHEMA));
static PRD_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| compile(PRD_SCHEMA));

fn compile(raw: &str) -> Validator {
    let schema: Value = serde_json::from_str(raw).expect("embedded schema should be valid JSON");
    validator_for(&schema).expect("embedded schema should compile")
}

fn collect_errors(validator: &Validator, instance: &Value) -> Vec<String> {
    validator
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect()
}

/// Schema violations for an (already upgraded) item record.
pub fn item_schema_errors(instance: &Value) -> Vec<String> {
    collect_errors(&ITEM_VALIDATOR, instance)
}

/// Schema violations for a structured backlog document.
pub fn prd_schema_errors(instance: &Value) -> Vec<String> {
    collect_errors(&PRD_VALIDATOR, instance)
}
