use exprlab::{
    config::{DEFAULT_CONFIG_PATH, PipelineConfig},
    error::PipelineError,
    genomic_tools::ToolCatalog,
    logging,
    workspace::DataWorkspace,
};
use exprlab_protocol::{PROTOCOL_SCHEMA, ToolInfo};
use anyhow::{Context, Result as AnyResult, bail};
use serde::Serialize;
use std::{
    env, fs,
    panic::{self, UnwindSafe},
    path::Path,
};
use tracing::error;

#[derive(Serialize)]
struct ToolEntry<'a> {
    id: &'a str,
    #[serde(flatten)]
    info: &'a ToolInfo,
}

#[derive(Serialize)]
struct ToolUrl {
    tool: String,
    url: String,
}

fn usage() {
    eprintln!(
        "Usage:\n  \
  exprlab_cli --version\n  \
  exprlab_cli [--data-dir PATH] [--config PATH] upload-counts COUNTS.csv\n  \
  exprlab_cli [--data-dir PATH] [--config PATH] upload-design DESIGN.csv\n  \
  exprlab_cli [--data-dir PATH] [--config PATH] design-info\n  \
  exprlab_cli [--data-dir PATH] [--config PATH] overview\n  \
  exprlab_cli [--data-dir PATH] [--config PATH] top-variable [N]\n  \
  exprlab_cli [--data-dir PATH] [--config PATH] cluster [N]\n  \
  exprlab_cli [--data-dir PATH] [--config PATH] deseq2\n  \
  exprlab_cli [--data-dir PATH] [--config PATH] top-expressed [N]\n  \
  exprlab_cli [--data-dir PATH] [--config PATH] volcano\n  \
  exprlab_cli [--data-dir PATH] [--config PATH] significant\n  \
  exprlab_cli [--data-dir PATH] [--config PATH] enrich LIBRARY\n  \
  exprlab_cli [--data-dir PATH] [--config PATH] validate-genes GENE...\n  \
  exprlab_cli tools\n  \
  exprlab_cli tool-url TOOL\n  \
  exprlab_cli tool-status TOOL\n  \
  exprlab_cli [--config PATH] engine-status\n\n  \
  Tip: pass @genes.txt (one symbol per line) instead of GENE...\n  \
  Set EXPRLAB_LOG to adjust log output (default: exprlab=info)"
    );
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| format!("Could not serialize JSON output: {e}"))?;
    println!("{text}");
    Ok(())
}

/// `CODE: message`, except internal faults which stay in the log.
fn render_error(e: PipelineError) -> String {
    if e.is_internal() {
        error!(error = %e, "Internal error");
        format!("{}: an internal error occurred; see the log for details", e.error_code())
    } else {
        format!("{}: {e}", e.error_code())
    }
}

struct GlobalArgs {
    data_dir: Option<String>,
    config_path: String,
    cmd_idx: usize,
}

fn parse_global_args(args: &[String]) -> Result<GlobalArgs, String> {
    let mut out = GlobalArgs {
        data_dir: None,
        config_path: DEFAULT_CONFIG_PATH.to_string(),
        cmd_idx: 1,
    };
    while out.cmd_idx < args.len() {
        let flag = args[out.cmd_idx].as_str();
        if flag != "--data-dir" && flag != "--config" {
            break;
        }
        let value = args
            .get(out.cmd_idx + 1)
            .ok_or_else(|| format!("Missing value for {flag}"))?
            .clone();
        if flag == "--data-dir" {
            out.data_dir = Some(value);
        } else {
            out.config_path = value;
        }
        out.cmd_idx += 2;
    }
    Ok(out)
}

/// Gene symbols from the command line; `@path` arguments expand to the
/// non-empty lines of that file.
fn load_gene_args(args: &[String]) -> AnyResult<Vec<String>> {
    let mut genes = Vec::new();
    for arg in args {
        if let Some(path) = arg.strip_prefix('@') {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Could not read gene list '{path}'"))?;
            genes.extend(
                text.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string),
            );
        } else {
            genes.push(arg.trim().to_string());
        }
    }
    if genes.is_empty() {
        bail!("Missing gene symbols");
    }
    Ok(genes)
}

fn parse_count_arg(args: &[String], idx: usize) -> Result<Option<usize>, String> {
    match args.get(idx) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<usize>()
            .map(Some)
            .map_err(|_| format!("Expected a positive count, got '{raw}'")),
    }
}

fn required_arg<'a>(args: &'a [String], idx: usize, what: &str) -> Result<&'a str, String> {
    match args.get(idx) {
        Some(value) => Ok(value),
        None => {
            usage();
            Err(format!("Missing {what}"))
        }
    }
}

/// Runs one command; a panic inside it is reported like any other internal
/// fault instead of unwinding out of `main`.
fn guarded(command: impl FnOnce() -> Result<(), String> + UnwindSafe) -> Result<(), String> {
    panic::catch_unwind(command).unwrap_or_else(|payload| {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(render_error(PipelineError::Internal(detail)))
    })
}

fn main() {
    logging::init_tracing();
    panic::set_hook(Box::new(|info| error!(panic = %info, "Unexpected panic")));
    if let Err(e) = guarded(run) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = env::args().collect();
    if args.len() <= 1 {
        usage();
        return Err("Missing command".to_string());
    }
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!(
            "exprlab {} ({PROTOCOL_SCHEMA})",
            env!("CARGO_PKG_VERSION")
        );
        return Ok(());
    }

    let globals = parse_global_args(&args)?;
    let cmd_idx = globals.cmd_idx;
    if args.len() <= cmd_idx {
        usage();
        return Err("Missing command".to_string());
    }
    let mut config = PipelineConfig::load_or_default(&globals.config_path)
        .map_err(|e| render_error(e.into()))?;
    if let Some(data_dir) = globals.data_dir {
        config = config.with_data_dir(data_dir);
    }
    let workspace = DataWorkspace::new(config);
    let catalog = ToolCatalog::default();

    let command = args[cmd_idx].as_str();
    match command {
        "upload-counts" => {
            let path = required_arg(&args, cmd_idx + 1, "counts CSV path")?;
            print_json(&workspace.ingest_counts(Path::new(path)).map_err(render_error)?)
        }
        "upload-design" => {
            let path = required_arg(&args, cmd_idx + 1, "design CSV path")?;
            print_json(&workspace.ingest_design(Path::new(path)).map_err(render_error)?)
        }
        "design-info" => print_json(&workspace.design_info().map_err(render_error)?),
        "overview" => print_json(&workspace.expression_overview().map_err(render_error)?),
        "top-variable" => {
            let n = parse_count_arg(&args, cmd_idx + 1)?;
            print_json(&workspace.top_variable(n).map_err(render_error)?)
        }
        "cluster" => {
            let n = parse_count_arg(&args, cmd_idx + 1)?;
            print_json(&workspace.clustering(n).map_err(render_error)?)
        }
        "deseq2" => print_json(&workspace.run_differential_expression().map_err(render_error)?),
        "top-expressed" => {
            let n = parse_count_arg(&args, cmd_idx + 1)?;
            print_json(&workspace.top_expressed(n).map_err(render_error)?)
        }
        "volcano" => print_json(&workspace.volcano().map_err(render_error)?),
        "significant" => print_json(&workspace.significant_genes().map_err(render_error)?),
        "enrich" => {
            let library = required_arg(&args, cmd_idx + 1, "enrichment library name")?;
            print_json(&workspace.enrichment(library).map_err(render_error)?)
        }
        "validate-genes" => {
            let genes = load_gene_args(&args[cmd_idx + 1..]).map_err(|e| {
                usage();
                format!("{e:#}")
            })?;
            print_json(&workspace.validate_genes(&genes).map_err(render_error)?)
        }
        "tools" => {
            let entries: Vec<ToolEntry<'_>> = catalog
                .tools()
                .iter()
                .map(|(id, info)| ToolEntry { id, info })
                .collect();
            print_json(&entries)
        }
        "tool-url" => {
            let tool = required_arg(&args, cmd_idx + 1, "tool name")?;
            let url = catalog
                .redirect(tool)
                .map_err(|e| render_error(e.into()))?;
            print_json(&ToolUrl {
                tool: tool.to_string(),
                url,
            })
        }
        "tool-status" => {
            let tool = required_arg(&args, cmd_idx + 1, "tool name")?;
            print_json(&catalog.probe(tool).map_err(|e| render_error(e.into()))?)
        }
        "engine-status" => print_json(&workspace.engine_availability()),
        other => {
            usage();
            Err(format!("Unknown command '{other}'"))
        }
    }
}
