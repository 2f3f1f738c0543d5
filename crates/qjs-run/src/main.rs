//! qjs-run - Main Entry Point
//!
//! Usage: `qjs-run [--module] [--options FILE] [--compile OUT] [--bytecode] FILE`

use anyhow::Context as _;
use clap::Parser;
use qjs_bridge::{ContextOptions, FileModuleLoader, JsContext, JsValue};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "qjs-run", about = "Run JavaScript files and bytecode")]
struct Args {
    /// Evaluate the file as an ES module
    #[arg(short, long)]
    module: bool,

    /// The file (and its imports) are compiled bytecode
    #[arg(short, long)]
    bytecode: bool,

    /// Context options as JSON
    #[arg(long, value_name = "FILE")]
    options: Option<PathBuf>,

    /// Compile the file to bytecode at OUT instead of running it
    #[arg(short, long, value_name = "OUT")]
    compile: Option<PathBuf>,

    /// Script, module or bytecode to run
    file: PathBuf,
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let options = match &args.options {
        Some(path) => {
            let json = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            ContextOptions::from_json(&json).with_context(|| format!("parsing {}", path.display()))?
        }
        None => ContextOptions::default(),
    };

    let context = JsContext::with_options(options)?;
    let root = args.file.parent().map(Path::to_path_buf).unwrap_or_default();
    context.set_module_loader(FileModuleLoader::new(root).with_bytecode(args.bytecode));

    let file_name = args
        .file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| qjs_bridge::UNKNOWN_FILE.to_string());

    if let Some(out) = &args.compile {
        let source = read_source(&args.file)?;
        let bytes = context.compile(&source, &file_name, args.module)?;
        fs::write(out, &bytes).with_context(|| format!("writing {}", out.display()))?;
        tracing::info!("compiled {} to {} ({} bytes)", args.file.display(), out.display(), bytes.len());
        return Ok(());
    }

    let result = if args.bytecode {
        let bytes = fs::read(&args.file).with_context(|| format!("reading {}", args.file.display()))?;
        context.execute(&bytes)?
    } else if args.module {
        context.evaluate_module(&read_source(&args.file)?, &file_name)?
    } else {
        context.evaluate(&read_source(&args.file)?, &file_name)?
    };

    if let Some(text) = display(&context, &result)? {
        println!("{text}");
    }
    Ok(())
}

fn read_source(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

/// Printable form of a script result; `None` for undefined
fn display(context: &JsContext, value: &JsValue) -> anyhow::Result<Option<String>> {
    let text = match value {
        JsValue::Undefined => return Ok(None),
        JsValue::Null => "null".to_string(),
        JsValue::Bool(b) => b.to_string(),
        JsValue::Int(i) => i.to_string(),
        JsValue::Long(l) => l.to_string(),
        JsValue::Double(d) => d.to_string(),
        JsValue::String(s) => s.clone(),
        JsValue::Function(_) | JsValue::Callback(_) => "[Function]".to_string(),
        JsValue::Object(_) | JsValue::Array(_) => {
            let obj = value.as_object().context("object without handle")?;
            let text = context.stringify(&obj)?.unwrap_or_else(|| "[Object]".to_string());
            context.release(&obj)?;
            text
        }
    };
    Ok(Some(text))
}
