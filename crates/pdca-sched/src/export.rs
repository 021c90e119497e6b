use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use pdca_core::{identifier_of, JobKind};
use pdca_storage::ArtifactStore;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio::fs;
use tracing::{info, warn};

type Row = JsonMap<String, JsonValue>;

/// Distinct identifiers in the reconciled match files and in the augment files.
pub async fn unique_identifiers(
    store: &ArtifactStore,
) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
    let layout = store.layout();
    let mut matched = BTreeSet::new();
    for row in read_rows(store, &layout.match_dir(), JobKind::Match).await? {
        matched.extend(identifier_of(&row));
    }
    let mut augmented = BTreeSet::new();
    for row in read_rows(store, &layout.augment_dir(), JobKind::Augment).await? {
        augmented.extend(identifier_of(&row));
    }
    Ok((matched, augmented))
}

/// Joins match and augment rows on the identifier and writes them as CSV.
///
/// Rows keep the order in which their identifier first appears, match files
/// before augment files, each in batch order. A later match row for the same
/// identifier replaces the earlier one; augment fields are then layered on top
/// and win on conflicting keys. Identifiers only present in augment results
/// still get a row. Returns the number of data rows written.
pub async fn merge(
    store: &ArtifactStore,
    output_csv: &Path,
    columns: Option<Vec<String>>,
) -> Result<usize> {
    let layout = store.layout();

    let mut merged: Vec<Row> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut unkeyed = 0usize;
    for row in read_rows(store, &layout.match_dir(), JobKind::Match).await? {
        let Some(id) = identifier_of(&row) else {
            unkeyed += 1;
            continue;
        };
        match index.get(&id) {
            Some(&position) => merged[position] = row,
            None => {
                index.insert(id, merged.len());
                merged.push(row);
            }
        }
    }

    for row in read_rows(store, &layout.augment_dir(), JobKind::Augment).await? {
        let Some(id) = identifier_of(&row) else {
            unkeyed += 1;
            continue;
        };
        match index.get(&id) {
            Some(&position) => merged[position].extend(row),
            None => {
                index.insert(id, merged.len());
                merged.push(row);
            }
        }
    }
    if unkeyed > 0 {
        warn!(rows = unkeyed, "rows without an identifier left out of the merge");
    }

    let columns = columns.unwrap_or_else(|| {
        merged
            .iter()
            .flat_map(|row| row.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    });

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(&columns)
        .context("writing merged csv header")?;
    for row in &merged {
        writer
            .write_record(columns.iter().map(|column| cell(row.get(column))))
            .context("writing merged csv row")?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| anyhow!("flushing merged csv: {}", err.error()))?;

    if let Some(parent) = output_csv.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(output_csv, bytes)
        .await
        .with_context(|| format!("writing {}", output_csv.display()))?;

    info!(rows = merged.len(), columns = columns.len(), path = %output_csv.display(), "merged output written");
    Ok(merged.len())
}

fn cell(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Every masterData row of the `kind` batch files in `dir`, ascending by batch number.
async fn read_rows(store: &ArtifactStore, dir: &Path, kind: JobKind) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    for file in store.list_batch_files(dir, kind).await? {
        let document = store.read_document(&file.path).await?;
        rows.extend(document.master_data);
    }
    Ok(rows)
}
