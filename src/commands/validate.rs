//! Validate command implementation

use crate::error::Result;
use crate::registry::validate::{validate_dir, ValidationReport};
use crate::registry::{Entity, FileKind};
use crate::storage::Storage;
use tracing::info;

/// Check every stored part file of `entity`/`kind` against the registry
pub async fn cmd_validate(storage: &Storage, entity: Entity, kind: FileKind) -> Result<ValidationReport> {
    info!(entity = %entity, kind = %kind, "Validating part files");
    validate_dir(storage, entity, kind).await
}

pub fn print_validation(entity: Entity, kind: FileKind, report: &ValidationReport) {
    println!("\n🔎 Validation: {} / {}\n", entity, kind);

    if report.files.is_empty() {
        println!("No part files found.");
        return;
    }

    for file in &report.files {
        let version = file
            .schema_version
            .map(|v| format!("v{}", v))
            .unwrap_or_else(|| "v?".to_string());
        match &file.problem {
            None => println!("✓ {} [{}] {} rows", file.uri, version, file.rows),
            Some(problem) => println!("✗ {} [{}] {}", file.uri, version, problem),
        }
    }

    let bad = report.incompatible().count();
    println!("\n{} files checked, {} incompatible", report.files.len(), bad);
}
