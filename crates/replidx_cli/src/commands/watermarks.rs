//! Watermarks command implementation.

use replidx_engine::{FileWatermarkStore, InstanceId, WatermarkStore, WatermarkTable};
use std::path::Path;
use tracing::info;

/// Runs the watermarks command.
pub fn run(
    path: &Path,
    forget: Option<&str>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No watermark file found at {:?}", path).into());
    }

    let store = FileWatermarkStore::open(path)?;

    if let Some(instance) = forget {
        let instance = InstanceId::new(instance);
        if store.forget(&instance)? {
            info!(instance = %instance, "watermark dropped, next pass is a full scan");
        } else {
            info!(instance = %instance, "no watermark stored for instance");
        }
    }

    let table = store.snapshot();
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&table)?);
        }
        _ => {
            print_text_output(path, &table);
        }
    }

    Ok(())
}

fn print_text_output(path: &Path, table: &WatermarkTable) {
    println!("replidx Watermarks");
    println!("==================");
    println!();
    println!("Path: {}", path.display());
    println!();

    if table.is_empty() {
        println!("No watermarks stored.");
        return;
    }

    println!("Instances:");
    for (instance, watermark) in table.iter() {
        let marker = if table.last_instance_synced() == Some(instance) {
            "*"
        } else {
            " "
        };
        println!(
            " {marker}{instance}: from {}, {}",
            watermark.last_end_timestamp, watermark.selection_formula
        );
    }
    println!();
    println!("* last instance synced");
}
