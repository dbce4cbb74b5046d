use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, ValueEnum};
use pdfword_merge::{
    emit_files, enumerate_inputs, load_fragments, merge_layout, render_text, slugify, unique_slug,
    validate_config, with_fingerprint, EnumerateError, MergeStats, MergedWord,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Switch {
    On,
    Off,
}

#[derive(Parser, Debug)]
#[command(name = "pdfword-merge")]
#[command(about = "Rebuild words and reading order from positioned PDF text fragments")]
#[command(version)]
struct Cli {
    /// YAML run configuration
    #[arg(long, default_value = "merge.yaml")]
    config: PathBuf,

    /// Override merge.distance_limit
    #[arg(long)]
    distance_limit: Option<f64>,

    /// Override merge.line_overlap
    #[arg(long)]
    line_overlap: Option<f64>,

    /// Process pages one at a time
    #[arg(long)]
    sequential: bool,

    /// Also write a plain-text rendering next to the words
    #[arg(long, value_enum, default_value_t = Switch::On)]
    text: Switch,

    /// Write each document into its own output subdirectory
    #[arg(long, value_enum, default_value_t = Switch::On)]
    per_doc_dir: Switch,
}

fn event(value: serde_json::Value) {
    eprintln!("{}", value);
}

fn fail(value: serde_json::Value, code: i32) -> ! {
    event(value);
    std::process::exit(code);
}

fn now_ms() -> i128 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i128).unwrap_or(0)
}

fn doc_id_for(file: &Path, used: &mut HashSet<String>) -> String {
    let stem = file.file_stem().and_then(|s| s.to_str()).unwrap_or("doc");
    unique_slug(slugify(stem), used)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    // 1) Read and validate the run configuration
    let run = match validate_config(&cli.config) {
        Ok(r) => r,
        Err(e) => fail(
            serde_json::json!({"tool": "validate_config", "file": cli.config, "error": e.to_string(), "error_code": 3}),
            3,
        ),
    };

    let mut merge_cfg = run.merge;
    if let Some(limit) = cli.distance_limit {
        merge_cfg.distance_limit = limit;
    }
    if let Some(overlap) = cli.line_overlap {
        merge_cfg.line_overlap = overlap;
    }
    if cli.sequential {
        merge_cfg.parallel = false;
    }
    if let Err(e) = merge_cfg.validate() {
        fail(
            serde_json::json!({"tool": "validate_config", "file": cli.config, "error": e.to_string(), "error_code": 3}),
            3,
        );
    }

    event(serde_json::json!({
        "tool": "validate_config",
        "file": cli.config,
        "status": "ok",
        "input_glob": run.input_glob(),
        "output_dir": run.output_dir(),
        "merge": merge_cfg,
    }));

    // 2) Enumerate fragment files
    let input_glob = run.input_glob();
    let files = match enumerate_inputs(&input_glob) {
        Ok(files) => files,
        Err(EnumerateError::NoFilesFound { guidance }) => {
            event(serde_json::json!({"tool": "enumerate_inputs", "error": "NoFilesFound", "error_code": 1}));
            eprintln!("{}", guidance);
            std::process::exit(1);
        }
    };
    event(serde_json::json!({"tool": "enumerate_inputs", "count": files.len()}));

    let mut used_doc_ids: HashSet<String> = HashSet::new();
    let base_output = run.output_dir();

    // 3) Per file: load -> merge -> render -> emit
    for file in files {
        let started_ms = now_ms();
        let doc_id = doc_id_for(&file, &mut used_doc_ids);
        let doc_outdir = if cli.per_doc_dir == Switch::On {
            format!("{}/{}", base_output, doc_id)
        } else {
            base_output.clone()
        };

        let loaded = match load_fragments(&file) {
            Ok(l) => l,
            Err(e) => fail(
                serde_json::json!({"tool": "load_fragments", "file": file, "error": e.to_string(), "error_code": 4}),
                4,
            ),
        };
        let fragments = loaded.fragments;
        event(serde_json::json!({"tool": "load_fragments", "file": file, "fragments": fragments.len()}));

        let pages = match merge_layout(&fragments, &merge_cfg) {
            Ok(p) => p,
            Err(e) => fail(
                serde_json::json!({"tool": "merge_words", "file": file, "error": e.to_string(), "error_code": 5}),
                5,
            ),
        };
        let stats = MergeStats::from_layout(fragments.len(), &pages);
        event(serde_json::json!({"tool": "merge_words", "file": file, "stats": stats}));

        let text = (cli.text == Switch::On).then(|| render_text(&pages));
        let words: Vec<MergedWord> = pages.into_iter().flat_map(|p| p.lines).flatten().collect();

        let finished_ms = now_ms();
        let meta = with_fingerprint(serde_json::json!({
            "doc_id": doc_id,
            "source": file,
            "source_sha256": loaded.source_sha256,
            "merge": merge_cfg,
            "stats": stats,
            "timestamps": {"started_ms": started_ms, "finished_ms": finished_ms},
        }));

        match emit_files(&words, text.as_deref(), &meta, &doc_outdir, &doc_id) {
            Ok(paths) => event(serde_json::json!({
                "tool": "emit_files",
                "file": file,
                "words_path": paths.words_path,
                "text_path": paths.text_path,
                "meta_path": paths.meta_path,
            })),
            Err(e) => fail(
                serde_json::json!({"tool": "emit_files", "file": file, "error": e.to_string(), "error_code": 6}),
                6,
            ),
        }
    }
}
