use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use drift::bytecode::disasm::{disassemble, dump_frame};
use drift::bytecode::{CodeObject, Compiler};
use drift::frontend::Lexer;
use drift::frontend::token_dumper::TokenDumper;
use drift::runtime::module_loader::ModuleLoaderConfig;
use drift::runtime::{Mode, Session, Vm, VmConfig};

#[derive(Parser, Debug)]
#[command(name = "drift")]
#[command(about = "Compile and run drift programs", long_about = None)]
#[command(version)]
struct Cli {
    /// A `.ft` source file or a compiled `.ftc` file
    file: Option<PathBuf>,

    /// Start the interactive prompt
    #[arg(short = 'i', long)]
    repl: bool,

    /// Print the token stream and stop
    #[arg(long)]
    tokens: bool,

    /// Print tokens without color
    #[arg(long)]
    no_color: bool,

    /// Print tokens as source text instead of their debug form
    #[arg(long)]
    spelled: bool,

    /// Print the disassembled bytecode before running
    #[arg(long = "bc")]
    bytecode: bool,

    /// Write compiled bytecode to this file instead of running
    #[arg(long, value_name = "OUT")]
    emit: Option<PathBuf>,

    /// Print the program's bindings after it finishes
    #[arg(long)]
    dump: bool,

    /// Extra module search directory (repeatable)
    #[arg(short = 'I', long = "include", value_name = "DIR")]
    include: Vec<PathBuf>,

    /// Maximum nesting of calls and instantiations
    #[arg(long, default_value_t = 1000)]
    max_call_depth: usize,

    /// Abort after this many instructions
    #[arg(long)]
    max_steps: Option<usize>,
}

impl Cli {
    fn vm(&self, mode: Mode) -> Vm {
        let mut config = VmConfig::default()
            .with_max_call_depth(self.max_call_depth)
            .with_mode(mode);
        if let Some(steps) = self.max_steps {
            config = config.with_max_steps(steps);
        }

        let loader = self
            .include
            .iter()
            .fold(ModuleLoaderConfig::default(), |c, dir| c.with_search_path(dir));
        Vm::with_config(config).with_loader(loader)
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let Some(file) = cli.file.clone() else {
        return repl(&cli);
    };
    if cli.repl {
        bail!("--repl takes no file");
    }

    match file.extension().and_then(|e| e.to_str()) {
        Some("ftc") => {
            let bytes = fs::read(&file).with_context(|| format!("failed to read '{}'", file.display()))?;
            let code = CodeObject::from_bytes(&bytes).map_err(drift::Error::from)?;
            execute(&cli, &file, code)
        }
        Some("ft") => {
            let source = fs::read_to_string(&file)
                .with_context(|| format!("failed to read '{}'", file.display()))?;
            let tokens = Lexer::new(&source).tokenize().map_err(drift::Error::from)?;

            if cli.tokens {
                let mut dumper = TokenDumper::new();
                if cli.no_color {
                    dumper = dumper.no_color();
                }
                if cli.spelled {
                    dumper = dumper.pretty();
                }
                dumper.dump(&tokens);
                return Ok(());
            }

            let code = Compiler::new(tokens).compile().map_err(drift::Error::from)?;
            if let Some(out) = &cli.emit {
                let bytes = code.to_bytes().map_err(drift::Error::from)?;
                fs::write(out, &bytes).with_context(|| format!("failed to write '{}'", out.display()))?;
                info!(file = %out.display(), bytes = bytes.len(), "wrote bytecode");
                return Ok(());
            }
            execute(&cli, &file, code)
        }
        _ => bail!("expected a .ft or .ftc file, got {}", file.display()),
    }
}

fn execute(cli: &Cli, file: &Path, code: CodeObject) -> Result<()> {
    if cli.bytecode {
        print!("{}", disassemble(&code));
    }

    let mut vm = cli.vm(Mode::Batch);
    vm.set_origin(file);
    let frame = vm.run(code).map_err(drift::Error::from)?;

    if cli.dump {
        print!("{}", dump_frame(&frame.borrow()));
    }
    Ok(())
}

/// Whether a line needs an indented body, so the prompt keeps reading.
fn opens_block(line: &str) -> bool {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        ["if" | "aop" | "for", ..] => true,
        ["def", next, ..] if next.starts_with('(') || next.starts_with('<') => true,
        ["def", _, "def"] => true,
        ["def", _] => true,
        _ => false,
    }
}

fn repl(cli: &Cli) -> Result<()> {
    let mut session = Session::new(cli.vm(Mode::Interactive));
    let stdin = io::stdin();
    let mut input = String::new();

    println!("drift {} (empty line ends a block, Ctrl-D quits)", env!("CARGO_PKG_VERSION"));
    loop {
        print!("{}", if input.is_empty() { "drift> " } else { "....   " });
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            println!();
            return Ok(());
        }
        let line = line.trim_end();

        if input.is_empty() {
            if line.trim().is_empty() {
                continue;
            }
            input.push_str(line);
            input.push('\n');
            if opens_block(line) {
                continue;
            }
        } else if !line.trim().is_empty() {
            input.push_str(line);
            input.push('\n');
            continue;
        }

        if let Err(e) = session.eval(&input) {
            eprintln!("{}", e);
        }
        input.clear();
    }
}
