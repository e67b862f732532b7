//! Stream command implementation.

use super::{forward_signals, group_from_args, mean, Outcome};
use anyhow::{Context, Result};
use clap::Args;
use futures::StreamExt;
use genestream_core::store::DirectoryStore;
use genestream_core::{Config, Error, ItemStore, StreamOptions, StreamingLoader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Args, Debug)]
pub struct StreamArgs {
    /// Directory of `<gene>.f32` vector files
    #[arg(long)]
    pub dir: PathBuf,

    /// Genes to stream: `a,b,c` or `@file` with one gene per line (default: all)
    #[arg(long)]
    pub genes: Option<String>,

    /// Cell indices to extract
    #[arg(long, value_delimiter = ',', conflicts_with = "exclude")]
    pub cells: Option<Vec<u32>>,

    /// Cell indices to leave out; every other cell is extracted
    #[arg(long, value_delimiter = ',')]
    pub exclude: Option<Vec<u32>>,

    /// Print vector length and mean without group extraction
    #[arg(long, conflicts_with_all = ["cells", "exclude"])]
    pub raw: bool,
}

/// Stream genes from a directory store and print one line per gene.
pub async fn run(config: Config, args: StreamArgs) -> Result<Outcome> {
    let store = Arc::new(DirectoryStore::open(&args.dir, config.store.population_size).await?);
    let population = store.population_size();

    let keys = match &args.genes {
        Some(spec) => parse_gene_list(spec).await?,
        None => store.keys().await?,
    };

    info!(
        dir = %args.dir.display(),
        genes = keys.len(),
        population,
        "Streaming genes"
    );

    let loader = StreamingLoader::builder(store)
        .config_source(Arc::new(config.loader.clone()))
        .build()?;
    let interrupted = forward_signals(loader.shutdown_signal());

    if args.raw {
        let mut genes = Box::pin(loader.stream_raw(keys, StreamOptions::new())?);
        while let Some(gene) = genes.next().await {
            println!(
                "{}\t{}\t{}\t{}",
                gene.index,
                gene.key,
                gene.vector.len(),
                format_mean(mean(&gene.vector))
            );
        }
    } else {
        let group = group_from_args(args.cells, args.exclude);
        let members = group.member_count(population);
        let mut genes = Box::pin(loader.stream(keys, group, StreamOptions::new())?);
        while let Some(gene) = genes.next().await {
            println!(
                "{}\t{}\t{}\t{}",
                gene.index,
                gene.key,
                members,
                format_mean(mean(&gene.values))
            );
        }
    }

    let stats = loader.stats();
    eprintln!("{}", serde_json::to_string_pretty(&stats).map_err(Error::from)?);

    Ok(interrupted.outcome())
}

/// Parse `a,b,c` or `@path` into a gene list.
async fn parse_gene_list(spec: &str) -> Result<Vec<String>> {
    match spec.strip_prefix('@') {
        Some(path) => {
            let content = tokio::fs::read_to_string(Path::new(path))
                .await
                .with_context(|| format!("Failed to read gene list {}", path))?;
            Ok(split_genes(&content))
        }
        None => Ok(split_genes(spec)),
    }
}

/// Split on commas and newlines, skipping blanks and `#` comments.
fn split_genes(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .flat_map(|line| line.split(','))
        .map(str::trim)
        .filter(|gene| !gene.is_empty())
        .map(String::from)
        .collect()
}

fn format_mean(mean: Option<f64>) -> String {
    mean.map_or_else(|| "NA".to_string(), |m| format!("{:.4}", m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_genes() {
        assert_eq!(split_genes("CD3E, MS4A1,,GAPDH"), vec!["CD3E", "MS4A1", "GAPDH"]);
        assert_eq!(
            split_genes("# markers\nCD3E\n\nMS4A1,CD19\n"),
            vec!["CD3E", "MS4A1", "CD19"]
        );
    }

    #[test]
    fn test_format_mean() {
        assert_eq!(format_mean(Some(1.5)), "1.5000");
        assert_eq!(format_mean(None), "NA");
    }

    #[tokio::test]
    async fn test_parse_gene_list_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genes.txt");
        std::fs::write(&path, "CD3E\nMS4A1\n").unwrap();

        let genes = parse_gene_list(&format!("@{}", path.display()))
            .await
            .unwrap();
        assert_eq!(genes, vec!["CD3E", "MS4A1"]);

        assert!(parse_gene_list("@/nonexistent/genes.txt").await.is_err());
    }
}
