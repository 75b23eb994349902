//! Follower network export

use crate::storage::Storage;
use crate::HarvestError;
use serde::Serialize;
use std::io::Write;

/// How the edge list is printed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFormat {
    /// One `follower -> followed` line per edge
    Arrows,
    /// A single indented JSON array of `{source_id, target_id, following}`
    Json,
}

#[derive(Debug, Serialize)]
struct JsonEdge {
    source_id: i64,
    target_id: i64,
    following: bool,
}

/// Writes every stored edge and returns how many were written
pub fn write_network<W: Write>(
    storage: &dyn Storage,
    format: NetworkFormat,
    out: &mut W,
) -> Result<usize, HarvestError> {
    let edges = storage.list_edges()?;

    match format {
        NetworkFormat::Arrows => {
            for edge in &edges {
                writeln!(out, "{} -> {}", edge.follower, edge.isfollowed)?;
            }
        }
        NetworkFormat::Json => {
            let json: Vec<JsonEdge> = edges
                .iter()
                .map(|edge| JsonEdge {
                    source_id: edge.follower,
                    target_id: edge.isfollowed,
                    following: true,
                })
                .collect();
            serde_json::to_writer_pretty(&mut *out, &json)?;
            writeln!(out)?;
        }
    }

    Ok(edges.len())
}
