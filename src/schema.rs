use std::fs;
use std::path::Path;

use anyhow::Result;
use schemars::schema_for;
use tracing::info;

use crate::flow::FlowConfig;
use crate::node::NodeStatus;

/// Emit JSON Schemas for the persisted documents into `out_dir`, for use
/// by editors and validation tooling.
pub fn write_schema(out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir)?;

    let flows_schema = schema_for!(FlowConfig);
    fs::write(
        out_dir.join("flows.schema.json"),
        serde_json::to_string_pretty(&flows_schema)?,
    )?;

    let status_schema = schema_for!(NodeStatus);
    fs::write(
        out_dir.join("node-status.schema.json"),
        serde_json::to_string_pretty(&status_schema)?,
    )?;

    info!(dir = %out_dir.display(), "schemas written");
    Ok(())
}
