// Brio CLI - Command Line Interface
// Usage: brio [FILE] [OPTIONS]
// The hosting shell: reads source text, drives the pipeline, and resolves
// `import` names to sibling .bri files.

use clap::Parser as ClapParser;
use std::fs;
use std::path::PathBuf;

use brio::compiler;
use brio::error::BrioResult;
use brio::parser::Parser;
use brio::vm::{ModuleLoader, Vm};

/// Brio - an embeddable, class-based interpreted language
#[derive(ClapParser)]
#[command(name = "brio")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "An embeddable, class-based interpreted language", long_about = None)]
struct Cli {
    /// Source file to run (.bri)
    file: Option<PathBuf>,

    /// Execute inline code
    #[arg(short = 'e', long = "exec")]
    exec: Option<String>,

    /// Print the compiled bytecode instead of running
    #[arg(long = "disasm")]
    disasm: bool,

    /// Check for errors without running
    #[arg(long = "check")]
    check: bool,
}

/// Resolves `import name` to name.bri next to the running script
struct FileLoader {
    root: PathBuf,
}

impl ModuleLoader for FileLoader {
    fn load(&mut self, name: &str) -> Result<(String, String), String> {
        let path = self.root.join(format!("{}.bri", name));
        let source = fs::read_to_string(&path)
            .map_err(|err| format!("Cannot import '{}': {} ({})", name, err, path.display()))?;
        Ok((source, path.display().to_string()))
    }
}

fn main() {
    let cli = Cli::parse();

    let result = if let Some(code) = cli.exec.clone() {
        run_source(&cli, &code, "<exec>", PathBuf::from("."))
    } else if let Some(path) = cli.file.clone() {
        match fs::read_to_string(&path) {
            Ok(source) => {
                let root = path
                    .parent()
                    .map(|dir| dir.to_path_buf())
                    .unwrap_or_else(|| PathBuf::from("."));
                run_source(&cli, &source, &path.display().to_string(), root)
            }
            Err(err) => {
                eprintln!("brio: cannot read {}: {}", path.display(), err);
                std::process::exit(1);
            }
        }
    } else {
        eprintln!("brio: no input (pass a file or use -e)");
        std::process::exit(2);
    };

    if let Err(err) = result {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

fn run_source(cli: &Cli, source: &str, file: &str, root: PathBuf) -> BrioResult<()> {
    let mut vm = Vm::new();
    vm.set_loader(Box::new(FileLoader { root }));

    if cli.disasm || cli.check {
        let program = Parser::new(source, file)
            .parse()
            .map_err(|err| err.with_source(source))?;
        let method = compiler::compile(program, &vm.globals(), &vm.method_ids(), file)
            .map_err(|err| err.with_source(source))?;
        if cli.disasm {
            print!("{}", method.disassemble());
        }
        if cli.check {
            return Ok(());
        }
        vm.run_method(method).map_err(|err| err.with_source(source))?;
        return Ok(());
    }

    vm.run_source(source, file)?;
    Ok(())
}
