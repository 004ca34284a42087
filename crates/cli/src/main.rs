//! CLI for tilestream - group rendered features into tiles
//!
//! Reads newline-delimited JSON features, sorts them through the external
//! sorter and writes one JSON line per tile. This is a thin wrapper around
//! the tilestream-core library.

use anyhow::{Context, Result};
use clap::Parser;
use rayon::prelude::*;
use serde::Deserialize;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tilestream_core::feature::Attrs;
use tilestream_core::{
    write_tiles, AttrValue, Compression, FeatureGroup, GroupConfig, RenderedFeature, SortConfig,
    TileCoord, TileFeatures, TileWriter,
};

/// Lines parsed in parallel per batch
const BATCH_LINES: usize = 8192;

#[derive(Parser, Debug)]
#[command(
    name = "tilestream",
    about = "Group rendered map features into tiles with an external sort",
    version
)]
struct Args {
    /// Input file of newline-delimited JSON features ("-" for stdin)
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output file, one JSON tile per line
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Threads sorting chunks (default: available cores)
    #[arg(long)]
    workers: Option<usize>,

    /// Maximum features per sort chunk
    #[arg(long, default_value = "2000000")]
    chunk_entries: usize,

    /// Maximum bytes per sort chunk
    #[arg(long, default_value = "268435456")]
    chunk_bytes: usize,

    /// Spilled chunk compression (none, gzip, zstd, brotli)
    #[arg(long, default_value = "none")]
    compression: String,

    /// Directory for spilled chunks (default: system temp dir)
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Keep all chunks in memory
    #[arg(long)]
    in_memory: bool,

    /// Threads writing finished tiles
    #[arg(long, default_value = "2")]
    writer_threads: usize,

    /// Attribute holding a feature's rank within its group
    #[arg(long, default_value = "rank")]
    rank_attribute: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn parse_compression(&self) -> Result<Compression> {
        Compression::from_str(&self.compression)
            .ok_or_else(|| anyhow::anyhow!("Invalid compression: {}", self.compression))
    }

    fn group_config(&self) -> Result<GroupConfig> {
        let mut sort = SortConfig::default()
            .with_chunk_max_entries(self.chunk_entries)
            .with_chunk_max_bytes(self.chunk_bytes)
            .with_compression(self.parse_compression()?)
            .with_in_memory(self.in_memory);
        if let Some(workers) = self.workers {
            sort = sort.with_workers(workers);
        }
        if let Some(dir) = &self.temp_dir {
            sort = sort.with_temp_dir(dir);
        }
        Ok(GroupConfig::default()
            .with_sort(sort)
            .with_rank_attribute(&self.rank_attribute))
    }
}

/// One input line.
#[derive(Deserialize, Debug)]
struct InputFeature {
    z: u8,
    x: u32,
    y: u32,
    layer: String,
    id: u64,
    #[serde(default)]
    sort_key: i32,
    #[serde(default)]
    group: Option<InputGroup>,
    geometry: geojson::Geometry,
    #[serde(default)]
    attrs: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct InputGroup {
    id: i64,
    limit: i32,
}

fn parse_feature(line: &str) -> Result<RenderedFeature> {
    let input: InputFeature = serde_json::from_str(line).context("Invalid feature JSON")?;
    let geometry: geo::Geometry<f64> = input
        .geometry
        .try_into()
        .map_err(|e| anyhow::anyhow!("Geometry conversion error: {:?}", e))?;

    let mut feature = RenderedFeature::new(
        TileCoord::new(input.x, input.y, input.z),
        input.layer,
        input.id,
        geometry,
    )
    .with_sort_key(input.sort_key);
    feature.attrs = json_attrs(input.attrs);
    if let Some(group) = input.group {
        feature = feature.with_group(group.id, group.limit);
    }
    Ok(feature)
}

/// Convert JSON attributes, skipping nulls, arrays and objects.
fn json_attrs(map: serde_json::Map<String, serde_json::Value>) -> Attrs {
    map.into_iter()
        .filter_map(|(name, value)| {
            let value = match value {
                serde_json::Value::String(s) => AttrValue::String(s),
                serde_json::Value::Bool(b) => AttrValue::Bool(b),
                serde_json::Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        AttrValue::Int(i)
                    } else if let Some(u) = n.as_u64() {
                        AttrValue::UInt(u)
                    } else {
                        AttrValue::Float(n.as_f64()?)
                    }
                }
                _ => return None,
            };
            Some((name, value))
        })
        .collect()
}

fn attr_to_json(value: &AttrValue) -> serde_json::Value {
    match value {
        AttrValue::String(s) => serde_json::Value::from(s.as_str()),
        AttrValue::Int(i) => serde_json::Value::from(*i),
        AttrValue::UInt(u) => serde_json::Value::from(*u),
        AttrValue::Float(f) => serde_json::Value::from(*f),
        AttrValue::Bool(b) => serde_json::Value::from(*b),
    }
}

/// Render one tile as a JSON object.
fn tile_to_json(tile: &TileFeatures) -> serde_json::Value {
    let layers: Vec<_> = tile
        .layers
        .iter()
        .map(|layer| {
            let features: Vec<_> = layer
                .geometries()
                .into_iter()
                .map(|(feature, geometry)| {
                    let attrs: serde_json::Map<_, _> = feature
                        .attrs
                        .iter()
                        .map(|(k, v)| (k.clone(), attr_to_json(v)))
                        .collect();
                    serde_json::json!({
                        "id": feature.id,
                        "sort_key": feature.sort_key,
                        "geometry": geojson::Geometry::new(geojson::Value::from(&geometry)),
                        "attrs": attrs,
                    })
                })
                .collect();
            serde_json::json!({ "name": layer.name, "features": features })
        })
        .collect();

    serde_json::json!({
        "z": tile.coord.z,
        "x": tile.coord.x,
        "y": tile.coord.y,
        "layers": layers,
    })
}

/// Writes tiles as JSON lines, in whatever order the writer threads finish.
struct JsonLinesWriter {
    out: Mutex<BufWriter<File>>,
}

impl TileWriter for JsonLinesWriter {
    fn write_tile(&self, tile: &TileFeatures) -> tilestream_core::Result<()> {
        let line = serde_json::to_string(&tile_to_json(tile))
            .map_err(|e| tilestream_core::Error::Writer(e.to_string()))?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| tilestream_core::Error::Writer("output lock poisoned".into()))?;
        writeln!(out, "{}", line)?;
        Ok(())
    }
}

fn open_input(path: &Path) -> Result<Box<dyn BufRead>> {
    if path == Path::new("-") {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(Box::new(BufReader::new(file)))
}

/// Parse a batch of lines in parallel and hand them to the feature group.
fn accept_batch(group: &FeatureGroup, batch: &[(usize, String)]) -> Result<()> {
    batch.par_iter().try_for_each(|(line_no, line)| {
        let feature = parse_feature(line).with_context(|| format!("Line {}", line_no))?;
        group
            .accept(&feature)
            .with_context(|| format!("Line {}", line_no))
    })
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .init();

    let config = args.group_config().context("Invalid arguments")?;
    let group = FeatureGroup::new(config).context("Failed to create feature group")?;

    // Step 1: collect features
    let mut batch = Vec::with_capacity(BATCH_LINES);
    for (index, line) in open_input(&args.input)?.lines().enumerate() {
        let line = line.context("Failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }
        batch.push((index + 1, line));
        if batch.len() >= BATCH_LINES {
            accept_batch(&group, &batch)?;
            batch.clear();
        }
    }
    accept_batch(&group, &batch)?;
    log::info!(
        "Collected {} features in {} layers",
        group.len(),
        group.layers().len()
    );

    // Step 2: sort
    let prepared = group.prepare().context("Failed to sort features")?;

    // Step 3: group into tiles and write
    let output = File::create(&args.output)
        .with_context(|| format!("Failed to create {}", args.output.display()))?;
    let writer = JsonLinesWriter {
        out: Mutex::new(BufWriter::new(output)),
    };
    let tiles = prepared.tiles()?;
    let stats = write_tiles(tiles, &writer, args.writer_threads)
        .context("Failed to write tiles")?;
    writer
        .out
        .into_inner()
        .map_err(|_| anyhow::anyhow!("output lock poisoned"))?
        .flush()
        .context("Failed to flush output")?;

    println!(
        "✓ Wrote {} tiles ({} features) to {}",
        stats.tiles,
        stats.features,
        args.output.display()
    );

    Ok(())
}
