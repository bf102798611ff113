// Export OpenAPI specification as JSON
//
// Usage: cargo run --bin export-openapi > docs/openapi.json

use anyhow::{Context, Result};
use blockflow_api::openapi::ApiDoc;

fn main() -> Result<()> {
    let spec = ApiDoc::to_json().context("Failed to serialize OpenAPI spec")?;
    println!("{spec}");
    Ok(())
}
