use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, info};

use mathvm::ast::Program;
use mathvm::diagnostic::ansi::AnsiRenderer;
use mathvm::diagnostic::{Diagnostic, json, registry};
use mathvm::interpreter;
use mathvm::translator::translate;
use mathvm::vm::{self, Var, VarValue};

/// mathvm - translate a program to stack bytecode and run it
#[derive(Parser, Debug)]
#[command(name = "mathvm", version)]
#[command(about = "Run a JSON-serialized mathvm program", long_about = None)]
struct Args {
    /// Program AST as JSON; reads stdin when omitted or `-`
    file: Option<PathBuf>,

    /// Walk the AST with the reference interpreter instead of the VM
    #[arg(long)]
    interpret: bool,

    /// Bind a top-level variable before the run (repeatable)
    #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var)]
    vars: Vec<Var>,

    /// Print the final values of the --var variables after the run
    #[arg(long)]
    print_vars: bool,

    /// Report diagnostics as JSON lines
    #[arg(long)]
    json: bool,

    /// Explain an error code, e.g. MVM-T004
    #[arg(long, value_name = "CODE")]
    explain: Option<String>,
}

fn parse_var(arg: &str) -> Result<Var, String> {
    let (name, value) = arg.split_once('=').ok_or_else(|| format!("expected NAME=VALUE, got '{arg}'"))?;
    if name.is_empty() {
        return Err(format!("missing variable name in '{arg}'"));
    }
    Ok(Var::new(name, VarValue::parse(value)))
}

struct Reporter {
    json: bool,
    use_color: bool,
}

impl Reporter {
    fn emit(&self, d: &Diagnostic) {
        if self.json {
            eprintln!("{}", json::render(d));
        } else {
            eprint!("{}", AnsiRenderer { use_color: self.use_color }.render(d));
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    // RUST_LOG controls the level; warnings only by default
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_writer(io::stderr).with_target(false).init();
}

fn load(path: Option<&Path>) -> Result<Program, Diagnostic> {
    let (text, origin) = match path {
        Some(p) if p != Path::new("-") => {
            let text = std::fs::read_to_string(p)
                .map_err(|e| Diagnostic::error(format!("cannot read {}: {e}", p.display())))?;
            (text, p.display().to_string())
        }
        _ => {
            let mut text = String::new();
            io::stdin()
                .read_to_string(&mut text)
                .map_err(|e| Diagnostic::error(format!("cannot read stdin: {e}")))?;
            (text, "<stdin>".to_string())
        }
    };
    serde_json::from_str(&text).map_err(|e| {
        Diagnostic::error(format!("{origin} is not a valid program: {e}"))
            .with_note(format!("at line {}, column {}", e.line(), e.column()))
            .with_suggestion("the input must be a JSON-serialized AST with a top-level \"top\" function")
    })
}

fn run(args: &Args, program: &Program, vars: &mut [Var]) -> Result<(), Diagnostic> {
    let with_source = |d: Diagnostic| match &program.source {
        Some(source) => d.with_source(source.clone()),
        None => d,
    };

    // Translation also validates the program for the interpreter.
    let compiled = translate(program).map_err(|e| with_source(Diagnostic::from(&e)))?;
    debug!(
        functions = compiled.functions.len(),
        strings = compiled.strings.len(),
        natives = compiled.natives.len(),
        "translated"
    );

    if args.interpret {
        info!("running reference interpreter");
        // the walk runs on its own thread, so it gets the handle rather than a lock
        interpreter::run(program, vars, &mut io::stdout()).map_err(|e| Diagnostic::from(&e))?;
    } else {
        info!("running bytecode");
        vm::execute(&compiled, vars, io::stdout().lock()).map_err(|e| Diagnostic::from(&e))?;
    }

    let mut out = io::stdout().lock();
    if args.print_vars {
        for var in vars.iter() {
            writeln!(out, "{} = {}", var.name, var.value)
                .map_err(|e| Diagnostic::error(format!("cannot write output: {e}")))?;
        }
    }
    out.flush().map_err(|e| Diagnostic::error(format!("cannot write output: {e}")))
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging();

    if let Some(code) = &args.explain {
        return match registry::lookup(code) {
            Some(entry) => {
                print!("{}", entry.long);
                ExitCode::SUCCESS
            }
            None => {
                eprintln!("unknown error code '{code}'");
                ExitCode::FAILURE
            }
        };
    }

    let reporter = Reporter { json: args.json, use_color: !args.json && io::stderr().is_terminal() };
    let mut vars = args.vars.clone();
    let result = load(args.file.as_deref()).and_then(|program| run(&args, &program, &mut vars));
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(d) => {
            reporter.emit(&d);
            ExitCode::FAILURE
        }
    }
}
